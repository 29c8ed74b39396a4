pub mod openai_images;
pub mod pixelcut;
pub mod telegram_files;

pub use openai_images::OpenAiSceneSynthesizer;
pub use pixelcut::PixelcutExtractor;

const ERROR_BODY_LOG_LIMIT: usize = 800;

pub(crate) fn truncate_for_log(value: &str, limit: usize) -> String {
    if value.chars().count() <= limit {
        return value.to_string();
    }
    let truncated: String = value.chars().take(limit).collect();
    format!("{truncated}... (truncated)")
}

/// Compact error detail from a failed response body: JSON is re-serialized on
/// one line, anything else is passed through trimmed.
pub(crate) fn response_detail(body: &str) -> String {
    let trimmed = body.trim();
    if trimmed.is_empty() {
        return "empty response body".to_string();
    }
    let detail = match serde_json::from_str::<serde_json::Value>(trimmed) {
        Ok(value) => value
            .pointer("/error/message")
            .and_then(|message| message.as_str())
            .map(str::to_string)
            .unwrap_or_else(|| value.to_string()),
        Err(_) => trimmed.to_string(),
    };
    truncate_for_log(&detail, ERROR_BODY_LOG_LIMIT)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_error_messages_are_unwrapped() {
        let body = r#"{"error": {"message": "Billing hard limit reached", "type": "invalid_request_error"}}"#;
        assert_eq!(response_detail(body), "Billing hard limit reached");
    }

    #[test]
    fn other_json_is_flattened_to_one_line() {
        let body = "{\n  \"detail\": \"Invalid image\"\n}";
        assert_eq!(response_detail(body), r#"{"detail":"Invalid image"}"#);
    }

    #[test]
    fn plain_text_and_empty_bodies() {
        assert_eq!(response_detail("  Bad Gateway \n"), "Bad Gateway");
        assert_eq!(response_detail(""), "empty response body");
    }

    #[test]
    fn long_bodies_are_truncated() {
        let body = "x".repeat(ERROR_BODY_LOG_LIMIT + 50);
        assert!(response_detail(&body).ends_with("... (truncated)"));
    }
}
