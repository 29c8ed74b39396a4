use std::error::Error;
use std::sync::Arc;
use std::time::Duration;

use dotenvy::dotenv;
use teloxide::dispatching::UpdateFilterExt;
use teloxide::error_handlers::LoggingErrorHandler;
use teloxide::prelude::*;
use teloxide::update_listeners::webhooks;
use teloxide::utils::command::BotCommands;
use tracing::{error, info, warn};

mod config;
mod db;
mod handlers;
mod imaging;
mod pipeline;
mod services;
mod state;
mod utils;

use config::Config;
use db::Database;
use handlers::access::AccessList;
use handlers::commands;
use pipeline::Pipeline;
use services::{OpenAiSceneSynthesizer, PixelcutExtractor};
use state::AppState;
use utils::http::build_http_client;
use utils::logging::init_logging;
use utils::telegram::Heartbeat;

const TELEGRAM_DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(60);
const SESSION_SWEEP_INTERVAL: Duration = Duration::from_secs(300);

#[derive(BotCommands, Clone)]
#[command(rename_rule = "lowercase", description = "Product photo commands:")]
enum Command {
    #[command(description = "start over")]
    Start,
    #[command(description = "how it works")]
    Help,
    #[command(description = "tips for describing a scene")]
    Cheatsheet,
    #[command(description = "run your last request again")]
    Repeat,
    #[command(description = "bot status (admin only)")]
    Status,
}

type HandlerResult = Result<(), Box<dyn Error + Send + Sync>>;

#[tokio::main]
async fn main() -> HandlerResult {
    dotenv().ok();
    let config = match Config::load() {
        Ok(config) => Arc::new(config),
        Err(err) => {
            eprintln!("Configuration error: {err:#}");
            return Err(err.into());
        }
    };
    let _guards = init_logging(&config);

    let bot = Bot::new(config.bot_token.clone());
    info!("Starting product photo bot");

    let db = if config.session_store_enabled() {
        match Database::init(&config.database_url).await {
            Ok(db) => Some(db),
            Err(err) => {
                warn!("Session store unavailable, continuing without it: {err}");
                None
            }
        }
    } else {
        info!("DATABASE_URL is empty; session store disabled");
        None
    };

    let extractor = PixelcutExtractor::new(config.clone())?;
    let synthesizer = OpenAiSceneSynthesizer::new(config.clone())?;
    let pipeline = Pipeline::new(
        Arc::new(extractor),
        Arc::new(synthesizer),
        config.seamless_max_iterations,
    );
    let access = AccessList::load(&config);
    let http = build_http_client(TELEGRAM_DOWNLOAD_TIMEOUT)?;
    let state = AppState::new(config.clone(), Arc::new(pipeline), db, access, http);

    let sweep_state = state.clone();
    let _session_sweeper = Heartbeat::start(SESSION_SWEEP_INTERVAL, move || {
        let state = sweep_state.clone();
        async move {
            state.evict_idle_sessions();
        }
    });

    if let Err(err) = bot.set_my_commands(Command::bot_commands()).await {
        warn!("Failed to register bot commands: {err}");
    }

    let command_handler = dptree::entry()
        .filter_command::<Command>()
        .endpoint(handle_command);

    let message_handler = Update::filter_message()
        .branch(command_handler)
        .endpoint(handle_message);

    let mut dispatcher = Dispatcher::builder(bot.clone(), message_handler)
        .dependencies(dptree::deps![state])
        .enable_ctrlc_handler()
        .build();

    match config.webhook_url.clone() {
        Some(url) => {
            info!("Receiving updates via webhook on {}", config.webhook_listen_addr);
            let listener =
                webhooks::axum(bot, webhooks::Options::new(config.webhook_listen_addr, url)).await?;
            dispatcher
                .dispatch_with_listener(
                    listener,
                    LoggingErrorHandler::with_custom_text("An error from the webhook listener"),
                )
                .await;
        }
        None => {
            info!("Receiving updates via long polling");
            dispatcher.dispatch().await;
        }
    }

    Ok(())
}

async fn handle_command(bot: Bot, state: AppState, message: Message, command: Command) -> HandlerResult {
    match command {
        Command::Help => commands::help_handler(bot, message).await?,
        Command::Cheatsheet => commands::cheatsheet_handler(bot, message).await?,
        Command::Start => {
            tokio::spawn(async move {
                if let Err(err) = commands::start_handler(bot, state, message).await {
                    error!("start handler failed: {err}");
                }
            });
        }
        Command::Repeat => {
            tokio::spawn(async move {
                if let Err(err) = commands::repeat_handler(bot, state, message).await {
                    error!("repeat handler failed: {err}");
                }
            });
        }
        Command::Status => {
            tokio::spawn(async move {
                if let Err(err) = commands::status_handler(bot, state, message).await {
                    error!("status handler failed: {err}");
                }
            });
        }
    }
    Ok(())
}

async fn handle_message(bot: Bot, state: AppState, message: Message) -> HandlerResult {
    tokio::spawn(async move {
        if let Err(err) = commands::message_handler(bot, state, message).await {
            error!("message handler failed: {err}");
        }
    });
    Ok(())
}
