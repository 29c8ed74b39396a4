use std::time::Duration;

use anyhow::{anyhow, Result};
use reqwest::{Client, StatusCode};
use teloxide::prelude::*;
use teloxide::types::FileId;
use tracing::{error, warn};

use crate::services::truncate_for_log;

const DOWNLOAD_MAX_ATTEMPTS: usize = 3;
const DOWNLOAD_BASE_DELAY_MS: u64 = 400;
const DOWNLOAD_ERROR_BODY_LIMIT: usize = 800;

pub fn detect_mime_type(data: &[u8]) -> Option<String> {
    if data.len() > 12 {
        let ftyp = &data[4..12];
        if ftyp.starts_with(b"ftyp") {
            let brand = &ftyp[4..8];
            if brand == b"heic" || brand == b"heif" || brand == b"hevc" {
                return Some("image/heic".to_string());
            }
        }
    }

    infer::get(data).map(|kind| kind.mime_type().to_string())
}

fn should_retry_status(status: StatusCode) -> bool {
    status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS || status == StatusCode::REQUEST_TIMEOUT
}

fn should_retry_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect()
}

fn file_url(bot_token: &str, path: &str) -> String {
    format!("https://api.telegram.org/file/bot{bot_token}/{path}")
}

/// Downloads a Telegram file by id, retrying transient failures with backoff.
pub async fn download_telegram_file(bot: &Bot, client: &Client, bot_token: &str, file_id: &FileId) -> Result<Vec<u8>> {
    let file = bot.get_file(file_id.clone()).await?;
    let url = file_url(bot_token, &file.path);

    for attempt in 0..DOWNLOAD_MAX_ATTEMPTS {
        let last_attempt = attempt + 1 == DOWNLOAD_MAX_ATTEMPTS;
        let delay = Duration::from_millis(DOWNLOAD_BASE_DELAY_MS << attempt);

        let response = match client.get(&url).send().await {
            Ok(response) => response,
            Err(err) => {
                let err = err.without_url();
                warn!(
                    "Failed to fetch file {}: {err} (timeout={}, connect={}, attempt={}/{})",
                    file.path,
                    err.is_timeout(),
                    err.is_connect(),
                    attempt + 1,
                    DOWNLOAD_MAX_ATTEMPTS
                );
                if !should_retry_error(&err) || last_attempt {
                    return Err(err.into());
                }
                tokio::time::sleep(delay).await;
                continue;
            }
        };

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!(
                "File download failed for {} with status {}: {}",
                file.path,
                status,
                truncate_for_log(&body, DOWNLOAD_ERROR_BODY_LIMIT)
            );
            if !should_retry_status(status) || last_attempt {
                return Err(anyhow!("file download failed with status {status}"));
            }
            tokio::time::sleep(delay).await;
            continue;
        }

        match response.bytes().await {
            Ok(bytes) => return Ok(bytes.to_vec()),
            Err(err) => {
                let err = err.without_url();
                error!(
                    "Failed to read file bytes {}: {err} (attempt={}/{})",
                    file.path,
                    attempt + 1,
                    DOWNLOAD_MAX_ATTEMPTS
                );
                if last_attempt {
                    return Err(err.into());
                }
                tokio::time::sleep(delay).await;
            }
        }
    }

    Err(anyhow!("file download retries exhausted"))
}
