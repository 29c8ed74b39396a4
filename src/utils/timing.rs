use std::fmt::Display;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use teloxide::types::Message;
use tracing::info;

const LOGGED_TEXT_LIMIT: usize = 300;

/// Tracks one user-visible request (a command or a generation run) on the
/// `bot.timing` channel.
#[derive(Debug)]
pub struct RequestTimer {
    kind: String,
    chat_id: i64,
    user_id: Option<i64>,
    username: Option<String>,
    text: Option<String>,
    started_at: DateTime<Utc>,
    started_perf: Instant,
    status: String,
    detail: Option<String>,
    completed: bool,
}

impl RequestTimer {
    pub fn from_message(kind: &str, message: &Message) -> Self {
        let text = message
            .text()
            .or_else(|| message.caption())
            .map(|value| value.replace('\n', " ").chars().take(LOGGED_TEXT_LIMIT).collect());
        let user = message.from();
        RequestTimer {
            kind: kind.to_string(),
            chat_id: message.chat.id.0,
            user_id: user.and_then(|u| i64::try_from(u.id.0).ok()),
            username: user.and_then(|u| u.username.clone()),
            text,
            started_at: Utc::now(),
            started_perf: Instant::now(),
            status: "success".to_string(),
            detail: None,
            completed: false,
        }
    }

    pub fn log_received(&self) {
        info!(
            target: "bot.timing",
            "event=request_received kind={} chat_id={} user_id={:?} username={:?} received_at={} text={:?}",
            self.kind,
            self.chat_id,
            self.user_id,
            self.username,
            self.started_at.to_rfc3339(),
            self.text
        );
    }

    pub fn complete(&mut self, status: &str, detail: Option<String>) {
        if self.completed {
            return;
        }
        self.completed = true;
        self.status = status.to_string();
        self.detail = detail;
        info!(
            target: "bot.timing",
            "event=request_completed kind={} chat_id={} user_id={:?} started_at={} completed_at={} duration_s={:.3} status={} detail={}",
            self.kind,
            self.chat_id,
            self.user_id,
            self.started_at.to_rfc3339(),
            Utc::now().to_rfc3339(),
            self.started_perf.elapsed().as_secs_f64(),
            self.status,
            self.detail.clone().unwrap_or_default()
        );
    }
}

pub fn start_request_timer(kind: &str, message: &Message) -> RequestTimer {
    let timer = RequestTimer::from_message(kind, message);
    timer.log_received();
    timer
}

/// Wraps a call to an external image service with request/response timing events.
pub async fn log_service_timing<T, E, F, Fut>(
    service: &str,
    operation: &str,
    metadata: Option<JsonValue>,
    call: F,
) -> Result<T, E>
where
    E: Display,
    F: FnOnce() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
{
    let started_perf = Instant::now();
    let metadata_text = metadata
        .as_ref()
        .map(|value| value.to_string())
        .unwrap_or_else(|| "{}".to_string());
    info!(
        target: "bot.timing",
        "event=service_request service={} operation={} started_at={} metadata={}",
        service,
        operation,
        Utc::now().to_rfc3339(),
        metadata_text
    );

    let result = call().await;
    let (status, detail) = match &result {
        Ok(_) => ("success", String::new()),
        Err(err) => ("error", err.to_string()),
    };

    info!(
        target: "bot.timing",
        "event=service_response service={} operation={} completed_at={} duration_s={:.3} status={} metadata={} detail={:?}",
        service,
        operation,
        Utc::now().to_rfc3339(),
        started_perf.elapsed().as_secs_f64(),
        status,
        metadata_text,
        detail
    );

    result
}
