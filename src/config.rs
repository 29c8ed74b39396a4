use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use url::Url;

const DEFAULT_PIXELCUT_ENDPOINTS: &str = "https://api.pixelcut.ai/v1/remove-background";
const DEFAULT_PIXELCUT_IMAGE_FIELDS: &str = "image,image_file,file";
const MIN_REDACTED_SECRET_LEN: usize = 8;
const DEFAULT_OPENAI_IMAGES_ENDPOINT: &str = "https://api.openai.com/v1/images/generations";

#[derive(Debug, Clone)]
pub struct Config {
    pub bot_token: String,
    pub log_level: String,
    pub log_dir: PathBuf,
    pub database_url: String,
    pub admin_id: i64,
    pub main_bot_username: String,
    pub whitelist_file_path: String,
    pub pixelcut_api_key: String,
    pub pixelcut_endpoints: Vec<String>,
    pub pixelcut_image_fields: Vec<String>,
    pub extraction_attempt_timeout: Duration,
    pub extraction_timeout: Duration,
    pub openai_api_key: String,
    pub openai_images_endpoint: String,
    pub openai_image_model: String,
    pub openai_image_quality: String,
    pub synthesis_timeout: Duration,
    pub webhook_url: Option<Url>,
    pub webhook_listen_addr: SocketAddr,
    pub seamless_max_iterations: usize,
    pub session_idle_timeout: Duration,
}

/// Typed reads over a variable lookup; unparsable values fall back to the default.
struct EnvReader<F: Fn(&str) -> Option<String>> {
    lookup: F,
}

impl<F: Fn(&str) -> Option<String>> EnvReader<F> {
    fn string(&self, name: &str, default: &str) -> String {
        (self.lookup)(name).unwrap_or_else(|| default.to_string())
    }

    fn trimmed(&self, name: &str, default: &str) -> String {
        self.string(name, default).trim().to_string()
    }

    fn u64(&self, name: &str, default: u64) -> u64 {
        (self.lookup)(name)
            .and_then(|value| value.trim().parse::<u64>().ok())
            .unwrap_or(default)
    }

    fn usize(&self, name: &str, default: usize) -> usize {
        (self.lookup)(name)
            .and_then(|value| value.trim().parse::<usize>().ok())
            .unwrap_or(default)
    }

    fn i64(&self, name: &str, default: i64) -> i64 {
        (self.lookup)(name)
            .and_then(|value| value.trim().parse::<i64>().ok())
            .unwrap_or(default)
    }

    fn csv(&self, name: &str, default: &str) -> Vec<String> {
        let parsed = parse_csv(&self.string(name, default));
        if parsed.is_empty() {
            parse_csv(default)
        } else {
            parsed
        }
    }

    fn seconds(&self, name: &str, default: u64) -> Duration {
        Duration::from_secs(self.u64(name, default).max(1))
    }
}

fn parse_csv(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|entry| entry.trim().to_string())
        .filter(|entry| !entry.is_empty())
        .collect()
}

fn normalize_database_url(value: String) -> String {
    if value.starts_with("sqlite+aiosqlite://") {
        return value.replacen("sqlite+aiosqlite://", "sqlite://", 1);
    }
    value
}

impl Config {
    pub fn load() -> Result<Self> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let env = EnvReader { lookup };

        let bot_token = env.trimmed("BOT_TOKEN", "");
        if bot_token.is_empty() {
            return Err(anyhow::anyhow!("BOT_TOKEN is required"));
        }

        let webhook_url = match env.trimmed("WEBHOOK_URL", "").as_str() {
            "" => None,
            raw => Some(Url::parse(raw).with_context(|| format!("WEBHOOK_URL is not a valid URL: {raw}"))?),
        };
        let listen_raw = env.trimmed("WEBHOOK_LISTEN_ADDR", "0.0.0.0:8080");
        let webhook_listen_addr = listen_raw
            .parse::<SocketAddr>()
            .with_context(|| format!("WEBHOOK_LISTEN_ADDR is not a socket address: {listen_raw}"))?;

        let extraction_timeout = env.seconds("EXTRACTION_TIMEOUT_SECONDS", 120);
        let extraction_attempt_timeout =
            env.seconds("EXTRACTION_ATTEMPT_TIMEOUT_SECONDS", 40).min(extraction_timeout);

        Ok(Config {
            bot_token,
            log_level: env.trimmed("LOG_LEVEL", "info").to_lowercase(),
            log_dir: PathBuf::from(env.trimmed("LOG_DIR", "logs")),
            database_url: normalize_database_url(env.trimmed("DATABASE_URL", "")),
            admin_id: env.i64("ADMIN_ID", 0),
            main_bot_username: env.trimmed("MAIN_BOT_USERNAME", "").trim_start_matches('@').to_string(),
            whitelist_file_path: env.trimmed("WHITELIST_FILE_PATH", "allowed_users.txt"),
            pixelcut_api_key: env.trimmed("PIXELCUT_API_KEY", ""),
            pixelcut_endpoints: env.csv("PIXELCUT_ENDPOINTS", DEFAULT_PIXELCUT_ENDPOINTS),
            pixelcut_image_fields: env.csv("PIXELCUT_IMAGE_FIELDS", DEFAULT_PIXELCUT_IMAGE_FIELDS),
            extraction_attempt_timeout,
            extraction_timeout,
            openai_api_key: env.trimmed("OPENAI_API_KEY", ""),
            openai_images_endpoint: env.trimmed("OPENAI_IMAGES_ENDPOINT", DEFAULT_OPENAI_IMAGES_ENDPOINT),
            openai_image_model: env.trimmed("OPENAI_IMAGE_MODEL", "dall-e-3"),
            openai_image_quality: env.trimmed("OPENAI_IMAGE_QUALITY", "hd"),
            synthesis_timeout: env.seconds("SYNTHESIS_TIMEOUT_SECONDS", 120),
            webhook_url,
            webhook_listen_addr,
            seamless_max_iterations: env.usize("SEAMLESS_MAX_ITERATIONS", 1500).max(1),
            session_idle_timeout: env.seconds("SESSION_IDLE_TIMEOUT_SECONDS", 3600),
        })
    }

    pub fn is_admin(&self, user_id: i64) -> bool {
        self.admin_id != 0 && self.admin_id == user_id
    }

    pub fn session_store_enabled(&self) -> bool {
        !self.database_url.is_empty()
    }

    /// Removes both API keys from text headed for logs or chat.
    ///
    /// Keys shorter than `MIN_REDACTED_SECRET_LEN` are left alone; replacing them
    /// would rewrite ordinary words.
    pub fn redact_secrets(&self, text: &str) -> String {
        let mut redacted = text.to_string();
        for key in [&self.pixelcut_api_key, &self.openai_api_key] {
            if key.chars().count() >= MIN_REDACTED_SECRET_LEN {
                redacted = redacted.replace(key.as_str(), "[redacted]");
            }
        }
        redacted
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::HashMap;

    pub(crate) fn config_from(pairs: &[(&str, &str)]) -> Result<Config> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect();
        Config::from_lookup(move |name| vars.get(name).cloned())
    }

    pub(crate) fn test_config() -> Config {
        config_from(&[("BOT_TOKEN", "123:abc")]).expect("config")
    }

    #[test]
    fn bot_token_is_required() {
        assert!(config_from(&[]).is_err());
        assert!(config_from(&[("BOT_TOKEN", "   ")]).is_err());
    }

    #[test]
    fn defaults_apply_when_unset() {
        let config = test_config();
        assert_eq!(config.log_level, "info");
        assert_eq!(config.log_dir, PathBuf::from("logs"));
        assert!(!config.session_store_enabled());
        assert_eq!(config.pixelcut_image_fields, vec!["image", "image_file", "file"]);
        assert_eq!(config.pixelcut_endpoints, vec![DEFAULT_PIXELCUT_ENDPOINTS]);
        assert_eq!(config.extraction_attempt_timeout, Duration::from_secs(40));
        assert_eq!(config.extraction_timeout, Duration::from_secs(120));
        assert_eq!(config.openai_image_model, "dall-e-3");
        assert_eq!(config.seamless_max_iterations, 1500);
        assert_eq!(config.session_idle_timeout, Duration::from_secs(3600));
        assert!(config.webhook_url.is_none());
        assert_eq!(config.webhook_listen_addr.port(), 8080);
    }

    #[test]
    fn unparsable_numbers_fall_back_to_defaults() {
        let config = config_from(&[
            ("BOT_TOKEN", "t"),
            ("SEAMLESS_MAX_ITERATIONS", "lots"),
            ("ADMIN_ID", "nobody"),
            ("SYNTHESIS_TIMEOUT_SECONDS", "-5"),
        ])
        .expect("config");
        assert_eq!(config.seamless_max_iterations, 1500);
        assert_eq!(config.admin_id, 0);
        assert_eq!(config.synthesis_timeout, Duration::from_secs(120));
        assert!(!config.is_admin(0));
    }

    #[test]
    fn attempt_timeout_never_exceeds_the_overall_budget() {
        let config = config_from(&[
            ("BOT_TOKEN", "t"),
            ("EXTRACTION_TIMEOUT_SECONDS", "30"),
            ("EXTRACTION_ATTEMPT_TIMEOUT_SECONDS", "90"),
        ])
        .expect("config");
        assert_eq!(config.extraction_attempt_timeout, Duration::from_secs(30));
    }

    #[test]
    fn csv_lists_are_trimmed_and_never_empty() {
        assert_eq!(parse_csv(" a , ,b,"), vec!["a", "b"]);
        let config = config_from(&[("BOT_TOKEN", "t"), ("PIXELCUT_IMAGE_FIELDS", " , ")]).expect("config");
        assert_eq!(config.pixelcut_image_fields.len(), 3);
    }

    #[test]
    fn legacy_sqlite_urls_are_normalized() {
        assert_eq!(
            normalize_database_url("sqlite+aiosqlite:///data/bot.db".to_string()),
            "sqlite:///data/bot.db"
        );
        assert_eq!(normalize_database_url("sqlite://x.db".to_string()), "sqlite://x.db");
    }

    #[test]
    fn invalid_webhook_settings_are_rejected() {
        assert!(config_from(&[("BOT_TOKEN", "t"), ("WEBHOOK_URL", "not a url")]).is_err());
        assert!(config_from(&[("BOT_TOKEN", "t"), ("WEBHOOK_LISTEN_ADDR", "localhost")]).is_err());
        let config = config_from(&[("BOT_TOKEN", "t"), ("WEBHOOK_URL", "https://bot.example.com/hook")])
            .expect("config");
        assert_eq!(config.webhook_url.map(|url| url.path().to_string()), Some("/hook".to_string()));
    }

    #[test]
    fn secrets_are_redacted() {
        let config = config_from(&[
            ("BOT_TOKEN", "t"),
            ("PIXELCUT_API_KEY", "pc-secret"),
            ("OPENAI_API_KEY", "sk-secret"),
        ])
        .expect("config");
        assert_eq!(
            config.redact_secrets("keys pc-secret and sk-secret"),
            "keys [redacted] and [redacted]"
        );
    }

    #[test]
    fn short_keys_do_not_mangle_text() {
        let config = config_from(&[
            ("BOT_TOKEN", "t"),
            ("PIXELCUT_API_KEY", "k"),
            ("OPENAI_API_KEY", "sk-live-secret"),
        ])
        .expect("config");
        assert_eq!(
            config.redact_secrets("POST /v1/remove-background with sk-live-secret"),
            "POST /v1/remove-background with [redacted]"
        );
    }
}
