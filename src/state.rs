use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use reqwest::Client;
use teloxide::types::ChatId;
use tracing::debug;

use crate::config::Config;
use crate::db::Database;
use crate::handlers::access::AccessList;
use crate::handlers::wizard::{advance, Input, Session, Transition};
use crate::pipeline::Pipeline;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub pipeline: Arc<Pipeline>,
    pub db: Option<Database>,
    pub access: Arc<AccessList>,
    /// Used for Telegram file downloads.
    pub http: Client,
    sessions: Arc<Mutex<HashMap<ChatId, SessionEntry>>>,
    generation_tokens: Arc<AtomicU64>,
}

/// A chat's wizard state and when it last received input.
struct SessionEntry {
    session: Session,
    touched: Instant,
}

impl AppState {
    pub fn new(
        config: Arc<Config>,
        pipeline: Arc<Pipeline>,
        db: Option<Database>,
        access: AccessList,
        http: Client,
    ) -> Self {
        AppState {
            config,
            pipeline,
            db,
            access: Arc::new(access),
            http,
            sessions: Arc::new(Mutex::new(HashMap::new())),
            generation_tokens: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Feeds `input` to the chat's session and stores the resulting state.
    pub fn apply(&self, chat_id: ChatId, input: Input) -> Transition {
        let token = self.generation_tokens.fetch_add(1, Ordering::Relaxed);
        let now = Instant::now();
        let mut sessions = self.sessions.lock();
        evict_idle(&mut sessions, now, self.config.session_idle_timeout);
        let session = sessions.remove(&chat_id).map(|entry| entry.session).unwrap_or_default();
        let transition = advance(session, input, token);
        if !matches!(transition.session, Session::AwaitingStart) {
            sessions.insert(
                chat_id,
                SessionEntry {
                    session: transition.session.clone(),
                    touched: now,
                },
            );
        }
        transition
    }

    /// Drops sessions idle for longer than `SESSION_IDLE_TIMEOUT_SECONDS`, with their photos.
    pub fn evict_idle_sessions(&self) -> usize {
        let evicted = evict_idle(&mut self.sessions.lock(), Instant::now(), self.config.session_idle_timeout);
        if evicted > 0 {
            debug!("Evicted {evicted} idle sessions");
        }
        evicted
    }

    #[cfg(test)]
    pub fn session_step(&self, chat_id: ChatId) -> &'static str {
        self.sessions
            .lock()
            .get(&chat_id)
            .map(|entry| entry.session.step_name())
            .unwrap_or_else(|| Session::AwaitingStart.step_name())
    }

    pub fn is_generating(&self, chat_id: ChatId) -> bool {
        self.sessions
            .lock()
            .get(&chat_id)
            .is_some_and(|entry| entry.session.is_generating())
    }

    /// (sessions past the start screen, sessions generating right now)
    pub fn session_counts(&self) -> (usize, usize) {
        let sessions = self.sessions.lock();
        let generating = sessions.values().filter(|entry| entry.session.is_generating()).count();
        (sessions.len(), generating)
    }
}

/// Generating sessions are kept; their task still reports back through `apply`.
fn evict_idle(sessions: &mut HashMap<ChatId, SessionEntry>, now: Instant, max_idle: Duration) -> usize {
    let before = sessions.len();
    sessions.retain(|_, entry| {
        entry.session.is_generating() || now.saturating_duration_since(entry.touched) < max_idle
    });
    before - sessions.len()
}
