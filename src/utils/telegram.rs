use std::future::Future;
use std::time::Duration;

use teloxide::prelude::*;
use teloxide::types::ChatAction;
use tokio::task::JoinHandle;
use tracing::warn;

/// Telegram shows a chat action for about five seconds.
const UPLOAD_ACTION_INTERVAL: Duration = Duration::from_secs(4);

/// Runs `tick` immediately and then every `interval` until dropped.
pub struct Heartbeat {
    task: JoinHandle<()>,
}

impl Heartbeat {
    pub fn start<F, Fut>(interval: Duration, mut tick: F) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let task = tokio::spawn(async move {
            loop {
                tick().await;
                tokio::time::sleep(interval).await;
            }
        });
        Heartbeat { task }
    }
}

impl Drop for Heartbeat {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Keeps "sending a file..." visible in the chat while variants are generated.
pub fn start_upload_heartbeat(bot: Bot, chat_id: ChatId) -> Heartbeat {
    Heartbeat::start(UPLOAD_ACTION_INTERVAL, move || {
        let bot = bot.clone();
        async move {
            if let Err(err) = bot.send_chat_action(chat_id, ChatAction::UploadDocument).await {
                warn!("send_chat_action failed for chat {}: {err}", chat_id.0);
            }
        }
    })
}
