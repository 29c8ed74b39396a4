use std::sync::Arc;

use async_trait::async_trait;
use base64::{engine::general_purpose, Engine as _};
use image::RgbaImage;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, warn};

use crate::config::Config;
use crate::imaging::decode_rgba;
use crate::pipeline::error::PipelineError;
use crate::pipeline::types::GenerationSize;
use crate::pipeline::SceneSynthesizer;
use crate::services::response_detail;
use crate::utils::http::build_http_client;
use crate::utils::timing::log_service_timing;

const BACKGROUND_ONLY_PREFIX: &str = "High-quality product photography background only (no product). \
Cinematic lighting, realistic textures. ";

#[derive(Debug, Serialize)]
struct ImageGenerationBody<'a> {
    model: &'a str,
    prompt: String,
    size: &'static str,
    #[serde(rename = "n")]
    count: u8,
    quality: &'a str,
    response_format: &'static str,
}

#[derive(Debug, Deserialize)]
struct ImageGenerationResponse {
    #[serde(default)]
    data: Vec<GeneratedImage>,
}

#[derive(Debug, Deserialize)]
struct GeneratedImage {
    b64_json: Option<String>,
}

pub fn scene_prompt(description: &str) -> String {
    format!("{BACKGROUND_ONLY_PREFIX}{}", description.trim())
}

/// Pulls the first base64 image out of a successful response body.
fn decode_generation_response(body: &str) -> Result<Vec<u8>, PipelineError> {
    let parsed: ImageGenerationResponse = serde_json::from_str(body)
        .map_err(|err| PipelineError::synthesis(Some(200), format!("unexpected response format: {err}")))?;
    let encoded = parsed
        .data
        .into_iter()
        .find_map(|image| image.b64_json)
        .ok_or_else(|| PipelineError::synthesis(Some(200), "the response contained no image"))?;
    let bytes = general_purpose::STANDARD
        .decode(encoded.trim())
        .map_err(|err| PipelineError::synthesis(Some(200), format!("invalid base64 image payload: {err}")))?;
    if bytes.is_empty() {
        return Err(PipelineError::synthesis(Some(200), "the generated image is empty"));
    }
    Ok(bytes)
}

pub struct OpenAiSceneSynthesizer {
    client: Client,
    config: Arc<Config>,
}

impl OpenAiSceneSynthesizer {
    pub fn new(config: Arc<Config>) -> anyhow::Result<Self> {
        let client = build_http_client(config.synthesis_timeout)?;
        Ok(Self { client, config })
    }

    async fn generate(&self, description: &str, size: GenerationSize) -> Result<RgbaImage, PipelineError> {
        if self.config.openai_api_key.is_empty() {
            return Err(PipelineError::synthesis(None, "OPENAI_API_KEY is not set"));
        }

        let body = ImageGenerationBody {
            model: &self.config.openai_image_model,
            prompt: scene_prompt(description),
            size: size.as_str(),
            count: 1,
            quality: &self.config.openai_image_quality,
            response_format: "b64_json",
        };
        debug!("Requesting {} background: {}", size.as_str(), body.prompt);

        let response = self
            .client
            .post(&self.config.openai_images_endpoint)
            .bearer_auth(&self.config.openai_api_key)
            .json(&body)
            .send()
            .await
            .map_err(|err| {
                let detail = self.config.redact_secrets(&err.to_string());
                warn!(
                    "Image generation request failed to send: {} (timeout={}, connect={})",
                    detail,
                    err.is_timeout(),
                    err.is_connect()
                );
                PipelineError::synthesis(None, detail)
            })?;

        let status = response.status();
        let text = response.text().await.map_err(|err| {
            PipelineError::synthesis(Some(status.as_u16()), self.config.redact_secrets(&err.to_string()))
        })?;
        if !status.is_success() {
            let detail = self.config.redact_secrets(&response_detail(&text));
            warn!("Image generation failed with status {}: {}", status, detail);
            return Err(PipelineError::synthesis(Some(status.as_u16()), detail));
        }

        let bytes = decode_generation_response(&text)?;
        tokio::task::spawn_blocking(move || decode_rgba(&bytes))
            .await
            .map_err(|err| PipelineError::Composition(format!("background decoding task failed: {err}")))?
            .map_err(|err| PipelineError::synthesis(Some(status.as_u16()), format!("undecodable image: {err}")))
    }
}

#[async_trait]
impl SceneSynthesizer for OpenAiSceneSynthesizer {
    async fn synthesize(&self, description: &str, size: GenerationSize) -> Result<RgbaImage, PipelineError> {
        let metadata = json!({
            "model": self.config.openai_image_model,
            "size": size.as_str(),
        });
        log_service_timing("openai", "generate_background", Some(metadata), || {
            self.generate(description, size)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::test_config;
    use crate::imaging::encode_png;
    use image::{DynamicImage, Rgba};

    #[test]
    fn prompt_is_prefixed_with_background_only_instruction() {
        let prompt = scene_prompt("  marble countertop, morning light ");
        assert!(prompt.starts_with("High-quality product photography background only (no product)."));
        assert!(prompt.ends_with("Cinematic lighting, realistic textures. marble countertop, morning light"));
    }

    #[test]
    fn request_body_uses_wire_field_names() {
        let body = ImageGenerationBody {
            model: "dall-e-3",
            prompt: scene_prompt("beach"),
            size: GenerationSize::Portrait.as_str(),
            count: 1,
            quality: "hd",
            response_format: "b64_json",
        };
        let value = serde_json::to_value(&body).expect("serialize");
        assert_eq!(value["n"], 1);
        assert_eq!(value["size"], "1024x1792");
        assert_eq!(value["response_format"], "b64_json");
        assert!(value.get("count").is_none());
    }

    #[test]
    fn base64_payload_is_decoded() {
        let png = encode_png(DynamicImage::ImageRgba8(RgbaImage::from_pixel(4, 4, Rgba([1, 2, 3, 255]))))
            .expect("png");
        let body = json!({ "data": [{ "b64_json": general_purpose::STANDARD.encode(&png) }] }).to_string();
        let bytes = decode_generation_response(&body).expect("decoded");
        assert_eq!(bytes, png);
        assert_eq!(decode_rgba(&bytes).expect("image").dimensions(), (4, 4));
    }

    #[test]
    fn malformed_responses_are_synthesis_errors() {
        for body in [r#"{"data": []}"#, r#"{"data": [{"url": "https://x"}]}"#, "not json", r#"{"data": [{"b64_json": "%%%"}]}"#] {
            assert!(matches!(
                decode_generation_response(body),
                Err(PipelineError::SynthesisService { .. })
            ));
        }
    }

    #[tokio::test]
    async fn missing_key_fails_without_a_request() {
        let synthesizer = OpenAiSceneSynthesizer::new(Arc::new(test_config())).expect("client");
        let err = synthesizer
            .synthesize("studio", GenerationSize::Square)
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::SynthesisService { status: None, .. }));
    }
}
