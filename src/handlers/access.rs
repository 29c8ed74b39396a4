use std::collections::HashSet;

use teloxide::prelude::*;
use tracing::{info, warn};

use crate::config::Config;

/// Who may use the bot: the admin always, everyone else only when listed.
/// Without a whitelist file everybody is allowed.
#[derive(Debug, Clone)]
pub struct AccessList {
    admin_id: i64,
    allowed: Option<HashSet<i64>>,
}

impl AccessList {
    pub fn load(config: &Config) -> Self {
        let path = &config.whitelist_file_path;
        match std::fs::read_to_string(path) {
            Ok(content) => {
                let list = Self::from_contents(config.admin_id, Some(&content));
                info!(
                    "Loaded whitelist file {} ({} ids)",
                    path,
                    list.whitelist_size().unwrap_or_default()
                );
                list
            }
            Err(err) => {
                warn!("Whitelist file {} not found or failed to read: {}", path, err);
                Self::from_contents(config.admin_id, None)
            }
        }
    }

    pub fn from_contents(admin_id: i64, contents: Option<&str>) -> Self {
        let allowed = contents.map(|content| {
            content
                .lines()
                .map(|line| line.trim())
                .filter(|line| !line.is_empty() && !line.starts_with('#'))
                .filter_map(|line| match line.parse::<i64>() {
                    Ok(id) => Some(id),
                    Err(_) => {
                        warn!("Skipping whitelist entry that is not a user id: {line}");
                        None
                    }
                })
                .collect()
        });
        AccessList { admin_id, allowed }
    }

    pub fn is_allowed(&self, user_id: i64) -> bool {
        if self.admin_id != 0 && user_id == self.admin_id {
            return true;
        }
        match &self.allowed {
            None => true,
            Some(ids) => ids.contains(&user_id),
        }
    }

    pub fn whitelist_size(&self) -> Option<usize> {
        self.allowed.as_ref().map(HashSet::len)
    }
}

pub fn denied_text(main_bot_username: &str) -> String {
    if main_bot_username.is_empty() {
        "⛔ You don't have access to this bot. Please contact the administrator.".to_string()
    } else {
        format!("⛔ You don't have access to this bot. Get access via @{main_bot_username}.")
    }
}

pub fn message_user_id(message: &Message) -> Option<i64> {
    message.from().and_then(|user| i64::try_from(user.id.0).ok())
}

/// Sends the denial message and returns false when the sender is not allowed.
pub async fn check_access(bot: &Bot, message: &Message, access: &AccessList, config: &Config) -> bool {
    let user_id = message_user_id(message).unwrap_or_default();
    if access.is_allowed(user_id) {
        return true;
    }

    info!("Access denied for user {user_id} in chat {}", message.chat.id);
    let _ = bot
        .send_message(message.chat.id, denied_text(&config.main_bot_username))
        .await;
    false
}

pub async fn check_admin_access(bot: &Bot, message: &Message, config: &Config) -> bool {
    let user_id = message_user_id(message).unwrap_or_default();
    if config.is_admin(user_id) {
        return true;
    }

    let _ = bot
        .send_message(message.chat.id, "This command is only available to the bot administrator.")
        .await;
    false
}
