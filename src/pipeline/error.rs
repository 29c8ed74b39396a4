fn status_suffix(status: &Option<u16>) -> String {
    status
        .map(|code| format!(" (status {code})"))
        .unwrap_or_default()
}

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("Invalid source image: {0}")]
    InvalidImage(String),
    #[error("Background removal rejected the credentials: {0}")]
    Auth(String),
    #[error("Background removal failed{}: {detail}", status_suffix(.status))]
    ExtractionService { status: Option<u16>, detail: String },
    #[error("Background generation failed{}: {detail}", status_suffix(.status))]
    SynthesisService { status: Option<u16>, detail: String },
    #[error("Composition failed: {0}")]
    Composition(String),
    #[error("Result delivery failed: {0}")]
    Delivery(String),
}

impl PipelineError {
    pub fn extraction(status: Option<u16>, detail: impl Into<String>) -> Self {
        PipelineError::ExtractionService {
            status,
            detail: detail.into(),
        }
    }

    pub fn synthesis(status: Option<u16>, detail: impl Into<String>) -> Self {
        PipelineError::SynthesisService {
            status,
            detail: detail.into(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            PipelineError::InvalidImage(_) => "invalid_image",
            PipelineError::Auth(_) => "auth",
            PipelineError::ExtractionService { .. } => "extraction",
            PipelineError::SynthesisService { .. } => "synthesis",
            PipelineError::Composition(_) => "composition",
            PipelineError::Delivery(_) => "delivery",
        }
    }

    /// The one chat message shown for a failed request.
    pub fn user_message(&self) -> String {
        match self {
            PipelineError::InvalidImage(detail) => format!(
                "I couldn't use that file as a photo: {detail}\n\nPlease send the photo again, ideally as a document so Telegram doesn't compress it."
            ),
            PipelineError::Auth(_) => "The background removal service rejected the bot's API key. Please ask the administrator to check the PIXELCUT_API_KEY setting.".to_string(),
            PipelineError::ExtractionService { .. } => format!(
                "Sorry, I couldn't cut the product out of the photo.\n\nError: {self}\n\nSend a style again to retry."
            ),
            PipelineError::SynthesisService { .. } => format!(
                "Sorry, I couldn't generate the background scene.\n\nError: {self}\n\nSend a style again to retry."
            ),
            PipelineError::Composition(_) | PipelineError::Delivery(_) => format!(
                "Sorry, something went wrong while preparing your images.\n\nError: {self}\n\nSend a style again to retry."
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn service_errors_include_status_when_known() {
        let err = PipelineError::extraction(Some(500), "boom");
        assert_eq!(err.to_string(), "Background removal failed (status 500): boom");
        let err = PipelineError::synthesis(None, "timed out");
        assert_eq!(err.to_string(), "Background generation failed: timed out");
    }

    #[test]
    fn auth_message_is_actionable() {
        let message = PipelineError::Auth("401".to_string()).user_message();
        assert!(message.contains("PIXELCUT_API_KEY"));
    }
}
