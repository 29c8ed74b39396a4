pub mod flat;
pub mod framing;
pub mod seamless;
pub mod source;

use std::io::Cursor;

use image::imageops::{self, FilterType};
use image::{DynamicImage, ImageFormat, RgbaImage};

use crate::pipeline::error::PipelineError;

/// Target `(width, height)` for a subject scaled to `fraction` of the canvas height.
///
/// The result never exceeds the canvas and never collapses below one pixel.
pub fn fitted_subject_size(
    subject: (u32, u32),
    canvas: (u32, u32),
    fraction: f64,
) -> (u32, u32) {
    let (subject_w, subject_h) = (subject.0.max(1), subject.1.max(1));
    let (canvas_w, canvas_h) = (canvas.0.max(1), canvas.1.max(1));
    let fraction = if fraction.is_finite() {
        fraction.clamp(0.0, 1.0)
    } else {
        1.0
    };

    let mut target_h = ((f64::from(canvas_h) * fraction) as u32).clamp(1, canvas_h);
    let scale = f64::from(target_h) / f64::from(subject_h);
    let mut target_w = ((f64::from(subject_w) * scale) as u32).max(1);

    if target_w > canvas_w {
        let shrink = f64::from(canvas_w) / f64::from(target_w);
        target_w = canvas_w;
        target_h = ((f64::from(target_h) * shrink) as u32).clamp(1, canvas_h);
    }
    (target_w, target_h)
}

pub fn fit_subject(subject: &RgbaImage, canvas: (u32, u32), fraction: f64) -> RgbaImage {
    let (width, height) = fitted_subject_size(subject.dimensions(), canvas, fraction);
    if (width, height) == subject.dimensions() {
        return subject.clone();
    }
    imageops::resize(subject, width, height, FilterType::Lanczos3)
}

pub fn decode_rgba(bytes: &[u8]) -> Result<RgbaImage, image::ImageError> {
    Ok(image::load_from_memory(bytes)?.to_rgba8())
}

pub fn encode_png(image: DynamicImage) -> Result<Vec<u8>, PipelineError> {
    let mut buffer = Cursor::new(Vec::new());
    image
        .write_to(&mut buffer, ImageFormat::Png)
        .map_err(|err| PipelineError::Composition(format!("PNG encoding failed: {err}")))?;
    Ok(buffer.into_inner())
}
