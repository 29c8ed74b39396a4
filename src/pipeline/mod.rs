pub mod error;
pub mod types;

use std::sync::Arc;

use async_trait::async_trait;
use image::{DynamicImage, RgbaImage};
use tracing::{debug, info};

use crate::imaging::flat::compose_flat;
use crate::imaging::framing::frame_to_aspect;
use crate::imaging::seamless::{anchor_point, compose_seamless, SolverSettings};
use crate::imaging::source::SourceImage;
use crate::imaging::{decode_rgba, encode_png};
use crate::pipeline::error::PipelineError;
use crate::pipeline::types::{
    AspectRatio, CompositeResult, CompositionStrategy, CutoutImage, GenerationRequest, GenerationSize,
};

/// Removes the background from a validated photo, returning the encoded cutout.
#[async_trait]
pub trait SubjectExtractor: Send + Sync {
    async fn extract(&self, source: &SourceImage) -> Result<Vec<u8>, PipelineError>;
}

/// Generates a background scene at one of the fixed generator sizes.
#[async_trait]
pub trait SceneSynthesizer: Send + Sync {
    async fn synthesize(&self, description: &str, size: GenerationSize) -> Result<RgbaImage, PipelineError>;
}

/// Receives each finished variant as soon as it is ready.
#[async_trait]
pub trait ResultSink: Send + Sync {
    async fn deliver(&self, result: CompositeResult) -> Result<(), PipelineError>;
}

pub struct Pipeline {
    extractor: Arc<dyn SubjectExtractor>,
    synthesizer: Arc<dyn SceneSynthesizer>,
    solver: SolverSettings,
}

impl Pipeline {
    pub fn new(
        extractor: Arc<dyn SubjectExtractor>,
        synthesizer: Arc<dyn SceneSynthesizer>,
        seamless_max_iterations: usize,
    ) -> Self {
        Self {
            extractor,
            synthesizer,
            solver: SolverSettings {
                max_iterations: seamless_max_iterations,
                ..SolverSettings::default()
            },
        }
    }

    /// Runs one request end to end and returns how many variants were delivered.
    ///
    /// The cutout is extracted once and shared by every variant. Variants run in
    /// order and the first failure aborts the rest.
    pub async fn run(&self, request: &GenerationRequest, sink: &dyn ResultSink) -> Result<u8, PipelineError> {
        let source = SourceImage::from_bytes(request.source.clone())?;
        let cutout = self.extract_cutout(&source).await?;
        let total = request.variants.get();
        let size = request.aspect.generation_size();

        for index in 1..=total {
            debug!(
                "Generating variant {}/{} ({}, {}, {})",
                index,
                total,
                request.placement,
                request.aspect,
                size.as_str()
            );
            let background = self.synthesizer.synthesize(&request.style, size).await?;
            let strategy = request.placement.strategy();
            let result =
                compose_variant(cutout.clone(), background, request.aspect, strategy, self.solver, index, total)
                    .await?;
            info!(
                "Variant {}/{} composed at {}x{} ({} bytes)",
                index,
                total,
                result.width,
                result.height,
                result.png.len()
            );
            sink.deliver(result).await?;
        }
        Ok(total)
    }

    async fn extract_cutout(&self, source: &SourceImage) -> Result<CutoutImage, PipelineError> {
        let payload = self.extractor.extract(source).await?;
        if payload.is_empty() {
            return Err(PipelineError::extraction(None, "the service returned an empty image"));
        }
        let cutout = tokio::task::spawn_blocking(move || decode_rgba(&payload))
            .await
            .map_err(|err| PipelineError::Composition(format!("cutout decoding task failed: {err}")))?
            .map_err(|err| PipelineError::extraction(None, format!("the returned cutout is not an image ({err})")))?;
        Ok(Arc::new(cutout))
    }
}

async fn compose_variant(
    cutout: CutoutImage,
    background: RgbaImage,
    aspect: AspectRatio,
    strategy: CompositionStrategy,
    solver: SolverSettings,
    index: u8,
    total: u8,
) -> Result<CompositeResult, PipelineError> {
    tokio::task::spawn_blocking(move || -> Result<CompositeResult, PipelineError> {
        let framed = frame_to_aspect(background, aspect);
        let composed = match strategy {
            CompositionStrategy::Flat(placement) => {
                DynamicImage::ImageRgba8(compose_flat(&cutout, &framed, &placement))
            }
            CompositionStrategy::Seamless(placement) => {
                let center = anchor_point(framed.dimensions(), &placement);
                DynamicImage::ImageRgb8(compose_seamless(&cutout, &framed, &placement, center, &solver)?)
            }
        };
        let (width, height) = (composed.width(), composed.height());
        Ok(CompositeResult {
            index,
            total,
            width,
            height,
            png: encode_png(composed)?,
        })
    })
    .await
    .map_err(|err| PipelineError::Composition(format!("composition task failed: {err}")))?
}
