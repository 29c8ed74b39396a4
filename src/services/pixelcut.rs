use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use reqwest::{Client, StatusCode};
use serde_json::json;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::config::Config;
use crate::imaging::source::SourceImage;
use crate::pipeline::error::PipelineError;
use crate::pipeline::SubjectExtractor;
use crate::services::response_detail;
use crate::utils::http::build_http_client;
use crate::utils::timing::log_service_timing;

const UPLOAD_FILE_NAME: &str = "input.jpg";

/// One way of phrasing the upload: which endpoint, which multipart field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestShape {
    pub endpoint: String,
    pub field: String,
}

pub fn request_shapes(endpoints: &[String], fields: &[String]) -> Vec<RequestShape> {
    endpoints
        .iter()
        .flat_map(|endpoint| {
            fields.iter().map(move |field| RequestShape {
                endpoint: endpoint.clone(),
                field: field.clone(),
            })
        })
        .collect()
}

#[derive(Debug)]
pub enum FailureAction {
    /// The service objected to the request's shape; another shape may work.
    TryNextShape(PipelineError),
    /// The endpoint timed out or refused the connection; its other shapes are skipped.
    TryNextEndpoint(PipelineError),
    Abort(PipelineError),
}

pub fn classify_failure(status: StatusCode, detail: String) -> FailureAction {
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => FailureAction::Abort(PipelineError::Auth(format!(
            "status {}: {detail}",
            status.as_u16()
        ))),
        StatusCode::BAD_REQUEST | StatusCode::UNSUPPORTED_MEDIA_TYPE | StatusCode::UNPROCESSABLE_ENTITY => {
            FailureAction::TryNextShape(PipelineError::extraction(Some(status.as_u16()), detail))
        }
        _ => FailureAction::Abort(PipelineError::extraction(Some(status.as_u16()), detail)),
    }
}

pub struct PixelcutExtractor {
    client: Client,
    config: Arc<Config>,
    shapes: Vec<RequestShape>,
}

impl PixelcutExtractor {
    pub fn new(config: Arc<Config>) -> anyhow::Result<Self> {
        let client = build_http_client(config.extraction_timeout)?;
        Ok(Self::with_client(config, client))
    }

    fn with_client(config: Arc<Config>, client: Client) -> Self {
        let shapes = request_shapes(&config.pixelcut_endpoints, &config.pixelcut_image_fields);
        Self { client, config, shapes }
    }

    async fn attempt(&self, shape: &RequestShape, jpeg: &[u8], timeout: Duration) -> Result<Vec<u8>, FailureAction> {
        let part = Part::bytes(jpeg.to_vec())
            .file_name(UPLOAD_FILE_NAME)
            .mime_str("image/jpeg")
            .map_err(|err| FailureAction::Abort(PipelineError::extraction(None, err.to_string())))?;
        let form = Form::new().part(shape.field.clone(), part);

        let response = self
            .client
            .post(&shape.endpoint)
            .header("X-API-Key", &self.config.pixelcut_api_key)
            .header(reqwest::header::ACCEPT, "image/*")
            .timeout(timeout)
            .multipart(form)
            .send()
            .await;

        let response = match response {
            Ok(response) => response,
            Err(err) => {
                let detail = self.config.redact_secrets(&err.to_string());
                warn!(
                    "Pixelcut request to {} (field {}) failed to send: {} (timeout={}, connect={})",
                    shape.endpoint,
                    shape.field,
                    detail,
                    err.is_timeout(),
                    err.is_connect()
                );
                let error = PipelineError::extraction(None, detail);
                return Err(if err.is_timeout() || err.is_connect() {
                    FailureAction::TryNextEndpoint(error)
                } else {
                    FailureAction::Abort(error)
                });
            }
        };

        let status = response.status();
        if status.is_success() {
            return match response.bytes().await {
                Ok(bytes) if !bytes.is_empty() => Ok(bytes.to_vec()),
                Ok(_) => Err(FailureAction::Abort(PipelineError::extraction(
                    Some(status.as_u16()),
                    "the service returned an empty image",
                ))),
                Err(err) => Err(FailureAction::Abort(PipelineError::extraction(
                    Some(status.as_u16()),
                    format!("failed to read the cutout: {}", self.config.redact_secrets(&err.to_string())),
                ))),
            };
        }

        let body = response.text().await.unwrap_or_default();
        let detail = self.config.redact_secrets(&response_detail(&body));
        warn!(
            "Pixelcut rejected request to {} (field {}) with status {}: {}",
            shape.endpoint, shape.field, status, detail
        );
        Err(classify_failure(status, detail))
    }

    async fn remove_background(&self, source: &SourceImage) -> Result<Vec<u8>, PipelineError> {
        if self.config.pixelcut_api_key.is_empty() {
            return Err(PipelineError::Auth("PIXELCUT_API_KEY is not set".to_string()));
        }

        let owned = source.clone();
        let jpeg = tokio::task::spawn_blocking(move || owned.baseline_jpeg())
            .await
            .map_err(|err| PipelineError::Composition(format!("JPEG normalization task failed: {err}")))??;

        let deadline = Instant::now() + self.config.extraction_timeout;
        let mut last_error = None;
        let mut unreachable: Vec<&str> = Vec::new();
        for shape in &self.shapes {
            if unreachable.contains(&shape.endpoint.as_str()) {
                continue;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            let timeout = self.config.extraction_attempt_timeout.min(remaining);
            match self.attempt(shape, &jpeg, timeout).await {
                Ok(cutout) => {
                    info!(
                        "Pixelcut removed the background via {} (field {}), {} bytes",
                        shape.endpoint,
                        shape.field,
                        cutout.len()
                    );
                    return Ok(cutout);
                }
                Err(FailureAction::Abort(err)) => return Err(err),
                Err(FailureAction::TryNextShape(err)) => last_error = Some(err),
                Err(FailureAction::TryNextEndpoint(err)) => {
                    unreachable.push(shape.endpoint.as_str());
                    last_error = Some(err);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| {
            PipelineError::extraction(
                None,
                format!(
                    "no request succeeded within {}s",
                    self.config.extraction_timeout.as_secs()
                ),
            )
        }))
    }
}

#[async_trait]
impl SubjectExtractor for PixelcutExtractor {
    async fn extract(&self, source: &SourceImage) -> Result<Vec<u8>, PipelineError> {
        let (width, height) = source.dimensions();
        let metadata = json!({
            "width": width,
            "height": height,
            "bytes": source.bytes().len(),
            "shapes": self.shapes.len(),
        });
        log_service_timing("pixelcut", "remove_background", Some(metadata), || self.remove_background(source)).await
    }
}
