use std::io::Cursor;
use std::sync::Arc;

use image::codecs::jpeg::JpegEncoder;
use image::{DynamicImage, Rgb, RgbImage};

use crate::pipeline::error::PipelineError;

pub const MIN_SOURCE_BYTES: usize = 1024;
const BASELINE_JPEG_QUALITY: u8 = 95;

/// A user photo that passed the size and decode checks.
#[derive(Debug, Clone)]
pub struct SourceImage {
    bytes: Arc<Vec<u8>>,
    width: u32,
    height: u32,
}

impl SourceImage {
    pub fn from_bytes(bytes: Arc<Vec<u8>>) -> Result<Self, PipelineError> {
        let decoded = validate_source_bytes(&bytes)?;
        Ok(SourceImage {
            width: decoded.width(),
            height: decoded.height(),
            bytes,
        })
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    /// Opaque RGB JPEG, the only encoding the cutout service takes reliably.
    pub fn baseline_jpeg(&self) -> Result<Vec<u8>, PipelineError> {
        let decoded = image::load_from_memory(&self.bytes)
            .map_err(|err| PipelineError::InvalidImage(err.to_string()))?;
        encode_baseline_jpeg(&decoded)
    }
}

/// Fully decodes the payload; header sniffing alone lets truncated files through.
pub fn validate_source_bytes(bytes: &[u8]) -> Result<DynamicImage, PipelineError> {
    if bytes.len() < MIN_SOURCE_BYTES {
        return Err(PipelineError::InvalidImage(format!(
            "the file is empty or too small ({} bytes, need at least {MIN_SOURCE_BYTES})",
            bytes.len()
        )));
    }
    let decoded = image::load_from_memory(bytes)
        .map_err(|err| PipelineError::InvalidImage(format!("not a recognizable image ({err})")))?;
    if decoded.width() == 0 || decoded.height() == 0 {
        return Err(PipelineError::InvalidImage(
            "the image has no pixels".to_string(),
        ));
    }
    Ok(decoded)
}

pub fn flatten_onto_white(image: &DynamicImage) -> RgbImage {
    if !image.color().has_alpha() {
        return image.to_rgb8();
    }
    let rgba = image.to_rgba8();
    let mut flat = RgbImage::from_pixel(rgba.width(), rgba.height(), Rgb([255, 255, 255]));
    for (x, y, pixel) in rgba.enumerate_pixels() {
        let alpha = u32::from(pixel[3]);
        let blended = |channel: u8| -> u8 {
            ((u32::from(channel) * alpha + 255 * (255 - alpha) + 127) / 255) as u8
        };
        flat.put_pixel(x, y, Rgb([blended(pixel[0]), blended(pixel[1]), blended(pixel[2])]));
    }
    flat
}

pub fn encode_baseline_jpeg(image: &DynamicImage) -> Result<Vec<u8>, PipelineError> {
    let flat = flatten_onto_white(image);
    let mut buffer = Cursor::new(Vec::new());
    let mut encoder = JpegEncoder::new_with_quality(&mut buffer, BASELINE_JPEG_QUALITY);
    encoder
        .encode_image(&flat)
        .map_err(|err| PipelineError::InvalidImage(format!("could not re-encode as JPEG ({err})")))?;
    Ok(buffer.into_inner())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use image::{ImageFormat, Rgba, RgbaImage};

    pub(crate) fn noisy_png(width: u32, height: u32) -> Vec<u8> {
        let image = RgbaImage::from_fn(width, height, |x, y| {
            let mut seed = x.wrapping_mul(73_856_093) ^ y.wrapping_mul(19_349_663);
            seed ^= seed >> 13;
            seed = seed.wrapping_mul(0x5bd1_e995);
            seed ^= seed >> 15;
            let [r, g, b, _] = seed.to_le_bytes();
            Rgba([r, g, b, 255])
        });
        let mut buffer = Cursor::new(Vec::new());
        DynamicImage::ImageRgba8(image)
            .write_to(&mut buffer, ImageFormat::Png)
            .expect("encode png");
        buffer.into_inner()
    }

    #[test]
    fn rejects_payloads_under_the_size_threshold() {
        let err = validate_source_bytes(&[0u8; 500]).unwrap_err();
        assert!(matches!(err, PipelineError::InvalidImage(_)));
    }

    #[test]
    fn rejects_large_payloads_that_are_not_images() {
        let err = validate_source_bytes(&vec![7u8; 4096]).unwrap_err();
        assert!(matches!(err, PipelineError::InvalidImage(_)));
    }

    #[test]
    fn rejects_truncated_images() {
        let mut bytes = noisy_png(64, 64);
        bytes.truncate(bytes.len() / 2);
        assert!(bytes.len() >= MIN_SOURCE_BYTES);
        assert!(validate_source_bytes(&bytes).is_err());
    }

    #[test]
    fn accepts_real_images() {
        let source = SourceImage::from_bytes(Arc::new(noisy_png(64, 48))).expect("valid");
        assert_eq!(source.dimensions(), (64, 48));
    }

    #[test]
    fn baseline_jpeg_flattens_transparency_onto_white() {
        let mut image = RgbaImage::from_pixel(40, 40, Rgba([0, 0, 0, 0]));
        image.put_pixel(0, 0, Rgba([0, 0, 0, 255]));
        let jpeg = encode_baseline_jpeg(&DynamicImage::ImageRgba8(image)).expect("encode");
        let decoded = image::load_from_memory(&jpeg).expect("decode");
        assert!(!decoded.color().has_alpha());
        let corner = decoded.to_rgb8().get_pixel(39, 39).0;
        assert!(corner.iter().all(|channel| *channel > 240), "{corner:?}");
    }
}
