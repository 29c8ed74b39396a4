use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use teloxide::prelude::*;
use teloxide::types::{FileId, InputFile, ReplyMarkup, ReplyParameters};
use teloxide::RequestError;
use tracing::{error, info, warn};

use crate::db::models::{LastRequest, LastRequestUpsert};
use crate::handlers::access::{check_access, check_admin_access, message_user_id};
use crate::handlers::keyboards::{reply_markup, CHEATSHEET_TEXT, HELP_TEXT};
use crate::handlers::wizard::{Input, Launch, Order, Outcome, Reply, Transition, UploadedPhoto};
use crate::imaging::source::SourceImage;
use crate::pipeline::error::PipelineError;
use crate::pipeline::types::{AspectRatio, CompositeResult, PlacementMode};
use crate::pipeline::ResultSink;
use crate::services::pixelcut::request_shapes;
use crate::services::telegram_files::{detect_mime_type, download_telegram_file};
use crate::services::truncate_for_log;
use crate::state::AppState;
use crate::utils::logging::{read_recent_log_lines, GENERAL_LOG_FILE};
use crate::utils::telegram::start_upload_heartbeat;
use crate::utils::timing::{start_request_timer, RequestTimer};

const TELEGRAM_RETRY_ATTEMPTS: usize = 3;
/// Bot API download limit.
const MAX_DOWNLOAD_BYTES: u32 = 20 * 1024 * 1024;
const STATUS_LOG_LINES: usize = 10;
const STATUS_REPORT_LIMIT: usize = 3800;

fn bool_label(value: bool) -> &'static str {
    if value {
        "yes"
    } else {
        "no"
    }
}

fn telegram_retryable_error(err: &RequestError) -> bool {
    matches!(
        err,
        RequestError::Network(_) | RequestError::RetryAfter(_) | RequestError::Io(_)
    )
}

async fn wait_before_retry(err: &RequestError, delay: &mut Duration) {
    if let RequestError::RetryAfter(wait) = err {
        tokio::time::sleep(wait.duration()).await;
    } else {
        tokio::time::sleep(*delay).await;
        *delay *= 2;
    }
}

async fn send_message_with_retry(
    bot: &Bot,
    chat_id: ChatId,
    text: &str,
    markup: Option<ReplyMarkup>,
) -> Result<Message> {
    let mut delay = Duration::from_secs_f32(1.5);
    let mut attempt = 0;
    loop {
        attempt += 1;
        let mut request = bot.send_message(chat_id, text.to_string());
        if let Some(markup) = markup.clone() {
            request = request.reply_markup(markup);
        }
        match request.await {
            Ok(message) => return Ok(message),
            Err(err) => {
                if !telegram_retryable_error(&err) || attempt == TELEGRAM_RETRY_ATTEMPTS {
                    return Err(err.into());
                }
                warn!("send_message attempt {attempt} failed: {err}");
                wait_before_retry(&err, &mut delay).await;
            }
        }
    }
}

async fn send_document_with_retry(
    bot: &Bot,
    chat_id: ChatId,
    bytes: &[u8],
    file_name: &str,
    caption: &str,
) -> Result<Message> {
    let mut delay = Duration::from_secs_f32(1.5);
    let mut attempt = 0;
    loop {
        attempt += 1;
        let input = InputFile::memory(bytes.to_vec()).file_name(file_name.to_string());
        match bot.send_document(chat_id, input).caption(caption.to_string()).await {
            Ok(message) => return Ok(message),
            Err(err) => {
                if !telegram_retryable_error(&err) || attempt == TELEGRAM_RETRY_ATTEMPTS {
                    return Err(err.into());
                }
                warn!("send_document attempt {attempt} failed: {err}");
                wait_before_retry(&err, &mut delay).await;
            }
        }
    }
}

async fn send_reply(bot: &Bot, chat_id: ChatId, reply: &Reply) -> Result<()> {
    send_message_with_retry(bot, chat_id, &reply.text, Some(reply_markup(reply.keyboard))).await?;
    Ok(())
}

fn variant_caption(result: &CompositeResult, placement: PlacementMode, aspect: AspectRatio) -> String {
    format!("Variant {}/{} · {} · {}", result.index, result.total, placement, aspect)
}

/// Delivers each finished variant to the chat as a PNG document.
struct TelegramSink {
    bot: Bot,
    chat_id: ChatId,
    placement: PlacementMode,
    aspect: AspectRatio,
    file_ids: Mutex<Vec<String>>,
}

impl TelegramSink {
    fn new(bot: Bot, chat_id: ChatId, order: &Order) -> Self {
        TelegramSink {
            bot,
            chat_id,
            placement: order.placement,
            aspect: order.aspect,
            file_ids: Mutex::new(Vec::new()),
        }
    }

    fn delivered_file_ids(&self) -> Vec<String> {
        self.file_ids.lock().clone()
    }
}

#[async_trait]
impl ResultSink for TelegramSink {
    async fn deliver(&self, result: CompositeResult) -> Result<(), PipelineError> {
        let caption = variant_caption(&result, self.placement, self.aspect);
        let message = send_document_with_retry(&self.bot, self.chat_id, &result.png, &result.file_name(), &caption)
            .await
            .map_err(|err| PipelineError::Delivery(err.to_string()))?;
        info!(
            "Delivered variant {}/{} ({}x{}) to chat {}",
            result.index, result.total, result.width, result.height, self.chat_id
        );
        if let Some(document) = message.document() {
            self.file_ids.lock().push(document.file.id.0.clone());
        }
        Ok(())
    }
}

enum Upload {
    Image(FileId),
    TooLarge,
    NotAnImage,
}

fn incoming_upload(message: &Message) -> Option<Upload> {
    if let Some(photo) = message.photo().and_then(|sizes| sizes.last()) {
        return Some(Upload::Image(photo.file.id.clone()));
    }

    let document = message.document()?;
    let is_image = document
        .mime_type
        .as_ref()
        .map(|mime| mime.essence_str().starts_with("image/"))
        .unwrap_or(true);
    if !is_image {
        return Some(Upload::NotAnImage);
    }
    if document.file.size > MAX_DOWNLOAD_BYTES {
        return Some(Upload::TooLarge);
    }
    Some(Upload::Image(document.file.id.clone()))
}

/// Downloads and validates a photo; `Err` carries the text to send back.
async fn receive_photo(bot: &Bot, state: &AppState, file_id: FileId) -> std::result::Result<UploadedPhoto, String> {
    let bytes = download_telegram_file(bot, &state.http, &state.config.bot_token, &file_id)
        .await
        .map_err(|err| {
            warn!("Failed to download photo {}: {err}", file_id.0);
            "I couldn't download that photo from Telegram. Please send it again.".to_string()
        })?;

    match detect_mime_type(&bytes).as_deref() {
        Some("image/heic") => {
            return Err("HEIC photos aren't supported. Please send a JPEG, PNG or WebP file.".to_string());
        }
        Some(mime) if !mime.starts_with("image/") => {
            return Err(format!("That file looks like {mime}, not a photo. Please send an image."));
        }
        _ => {}
    }

    let bytes = Arc::new(bytes);
    let candidate = bytes.clone();
    match tokio::task::spawn_blocking(move || SourceImage::from_bytes(candidate).map(|source| source.dimensions())).await {
        Ok(Ok((width, height))) => {
            info!("Accepted photo {} ({}x{}, {} bytes)", file_id.0, width, height, bytes.len());
            Ok(UploadedPhoto {
                file_id: file_id.0,
                bytes,
            })
        }
        Ok(Err(err)) => Err(err.user_message()),
        Err(err) => {
            error!("Photo validation task failed: {err}");
            Err("Something went wrong while reading the photo. Please send it again.".to_string())
        }
    }
}

/// Sends the transition's reply and starts the generation it asks for.
async fn apply_transition(bot: &Bot, state: &AppState, message: &Message, transition: Transition) -> Result<()> {
    if let Some(reply) = &transition.reply {
        send_reply(bot, message.chat.id, reply).await?;
    }

    if let Some(launch) = transition.launch {
        let timer = start_request_timer("generate", message);
        let bot = bot.clone();
        let state = state.clone();
        let chat_id = message.chat.id;
        let user_id = message_user_id(message);
        tokio::spawn(async move {
            run_generation(bot, state, chat_id, user_id, launch, timer).await;
        });
    }
    Ok(())
}

async fn run_generation(
    bot: Bot,
    state: AppState,
    chat_id: ChatId,
    user_id: Option<i64>,
    launch: Launch,
    mut timer: RequestTimer,
) {
    let Launch { token, order } = launch;
    let request = order.request();
    let sink = TelegramSink::new(bot.clone(), chat_id, &order);

    let heartbeat = start_upload_heartbeat(bot.clone(), chat_id);
    let result = state.pipeline.run(&request, &sink).await;
    drop(heartbeat);

    let outcome = match result {
        Ok(count) => {
            timer.complete("success", Some(format!("variants={count}")));
            record_last_request(&state, user_id, &order, sink.delivered_file_ids()).await;
            Outcome::Delivered { count }
        }
        Err(err) => {
            let detail = state.config.redact_secrets(&err.to_string());
            error!(
                "Generation failed: chat={} user={:?} placement={} aspect={} variants={} delivered={} kind={} error={}",
                chat_id,
                user_id,
                order.placement,
                order.aspect,
                order.variants.get(),
                sink.delivered_file_ids().len(),
                err.kind(),
                detail
            );
            timer.complete("error", Some(detail));
            Outcome::Failed {
                message: state.config.redact_secrets(&err.user_message()),
                keep_order: !matches!(err, PipelineError::InvalidImage(_)),
            }
        }
    };

    let transition = state.apply(chat_id, Input::Finished { token, outcome });
    if let Some(reply) = &transition.reply {
        if let Err(err) = send_reply(&bot, chat_id, reply).await {
            error!("Failed to send generation summary to chat {chat_id}: {err}");
        }
    }
}

async fn record_last_request(state: &AppState, user_id: Option<i64>, order: &Order, result_file_ids: Vec<String>) {
    let (Some(db), Some(user_id)) = (&state.db, user_id) else {
        return;
    };

    let upsert = LastRequestUpsert {
        user_id,
        request: LastRequest {
            source_file_id: order.photo.file_id.clone(),
            placement: order.placement,
            aspect: order.aspect,
            style: order.style.clone(),
            variants: order.variants,
            result_file_ids,
            recorded_at: Utc::now(),
        },
    };
    if let Err(err) = db.queue_last_request(upsert).await {
        warn!("Failed to record last request for user {user_id}: {err}");
    }
}

pub async fn start_handler(bot: Bot, state: AppState, message: Message) -> Result<()> {
    if !check_access(&bot, &message, &state.access, &state.config).await {
        return Ok(());
    }

    let transition = state.apply(message.chat.id, Input::Start);
    apply_transition(&bot, &state, &message, transition).await
}

pub async fn help_handler(bot: Bot, message: Message) -> Result<()> {
    bot.send_message(message.chat.id, HELP_TEXT)
        .reply_parameters(ReplyParameters::new(message.id))
        .await?;
    Ok(())
}

pub async fn cheatsheet_handler(bot: Bot, message: Message) -> Result<()> {
    bot.send_message(message.chat.id, CHEATSHEET_TEXT)
        .reply_parameters(ReplyParameters::new(message.id))
        .await?;
    Ok(())
}

pub async fn repeat_handler(bot: Bot, state: AppState, message: Message) -> Result<()> {
    if !check_access(&bot, &message, &state.access, &state.config).await {
        return Ok(());
    }
    let chat_id = message.chat.id;
    if state.is_generating(chat_id) {
        let transition = state.apply(chat_id, Input::Text(String::new()));
        return apply_transition(&bot, &state, &message, transition).await;
    }

    let Some(db) = &state.db else {
        send_message_with_retry(&bot, chat_id, "Request history is not available on this bot.", None).await?;
        return Ok(());
    };
    let Some(user_id) = message_user_id(&message) else {
        return Ok(());
    };

    let last = match db.fetch_last_request(user_id).await {
        Ok(Some(last)) => last,
        Ok(None) => {
            send_message_with_retry(
                &bot,
                chat_id,
                "There is no previous request to repeat yet. Send /start to make one.",
                None,
            )
            .await?;
            return Ok(());
        }
        Err(err) => {
            warn!("Failed to read last request for user {user_id}: {err}");
            send_message_with_retry(&bot, chat_id, "I couldn't read your request history. Please try again later.", None)
                .await?;
            return Ok(());
        }
    };

    let photo = match receive_photo(&bot, &state, FileId(last.source_file_id.clone())).await {
        Ok(photo) => photo,
        Err(text) => {
            send_message_with_retry(&bot, chat_id, &text, None).await?;
            return Ok(());
        }
    };

    let order = Order {
        photo,
        placement: last.placement,
        aspect: last.aspect,
        variants: last.variants,
        style: last.style,
    };
    let transition = state.apply(chat_id, Input::Repeat(order));
    apply_transition(&bot, &state, &message, transition).await
}

/// Photos, image documents and keyboard answers all land here.
pub async fn message_handler(bot: Bot, state: AppState, message: Message) -> Result<()> {
    if !check_access(&bot, &message, &state.access, &state.config).await {
        return Ok(());
    }
    let chat_id = message.chat.id;

    let input = match incoming_upload(&message) {
        // Anything sent while generating only earns the still-working reply.
        Some(_) if state.is_generating(chat_id) => Input::Text(String::new()),
        Some(Upload::Image(file_id)) => match receive_photo(&bot, &state, file_id).await {
            Ok(photo) => Input::Photo(photo),
            Err(text) => {
                send_message_with_retry(&bot, chat_id, &text, None).await?;
                return Ok(());
            }
        },
        Some(Upload::TooLarge) => {
            send_message_with_retry(&bot, chat_id, "That file is too large for me to download (20 MB max).", None)
                .await?;
            return Ok(());
        }
        Some(Upload::NotAnImage) => {
            send_message_with_retry(&bot, chat_id, "Please send an image (JPEG, PNG or WebP).", None).await?;
            return Ok(());
        }
        None => match message.text() {
            Some(text) => Input::Text(text.to_string()),
            None => return Ok(()),
        },
    };

    let transition = state.apply(chat_id, input);
    apply_transition(&bot, &state, &message, transition).await
}

async fn build_status_report(state: &AppState) -> String {
    let config = &state.config;
    let (sessions_active, sessions_generating) = state.session_counts();

    let mut report = String::new();
    report.push_str("Status snapshot\n");
    report.push_str(&format!("time_utc: {}\n", Utc::now().to_rfc3339()));
    report.push_str(&format!(
        "pixelcut_configured: {}\n",
        bool_label(!config.pixelcut_api_key.is_empty())
    ));
    report.push_str(&format!(
        "pixelcut_request_shapes: {}\n",
        request_shapes(&config.pixelcut_endpoints, &config.pixelcut_image_fields).len()
    ));
    report.push_str(&format!(
        "openai_configured: {}\n",
        bool_label(!config.openai_api_key.is_empty())
    ));
    report.push_str(&format!("openai_model: {}\n", config.openai_image_model));

    match &state.db {
        None => report.push_str("session_store: disabled\n"),
        Some(db) => {
            match db.health_check().await {
                Ok(()) => report.push_str("session_store: ok\n"),
                Err(err) => {
                    report.push_str("session_store: error\n");
                    report.push_str(&format!("session_store_error: {err}\n"));
                }
            }
            report.push_str(&format!("session_store_queue: {}\n", db.queue_len()));
        }
    }

    report.push_str(&format!("sessions_active: {sessions_active}\n"));
    report.push_str(&format!("sessions_generating: {sessions_generating}\n"));
    match state.access.whitelist_size() {
        Some(count) => report.push_str(&format!("whitelist_ids: {count}\n")),
        None => report.push_str("whitelist_ids: disabled\n"),
    }
    report.push_str(&format!(
        "transport: {}\n",
        if config.webhook_url.is_some() { "webhook" } else { "polling" }
    ));

    match read_recent_log_lines(&config.log_dir, GENERAL_LOG_FILE, STATUS_LOG_LINES) {
        Ok(Some(tail)) => {
            report.push_str(&format!("recent_logs ({}):\n", tail.path.display()));
            for line in tail.lines {
                report.push_str(&line);
                report.push('\n');
            }
        }
        Ok(None) => report.push_str("recent_logs: none\n"),
        Err(err) => report.push_str(&format!("recent_logs_error: {err}\n")),
    }

    truncate_for_log(&config.redact_secrets(&report), STATUS_REPORT_LIMIT)
}

pub async fn status_handler(bot: Bot, state: AppState, message: Message) -> Result<()> {
    if !check_admin_access(&bot, &message, &state.config).await {
        return Ok(());
    }

    let report = build_status_report(&state).await;
    bot.send_message(message.chat.id, report)
        .reply_parameters(ReplyParameters::new(message.id))
        .await?;
    Ok(())
}
