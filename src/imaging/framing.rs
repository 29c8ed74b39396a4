use image::{imageops, RgbaImage};

use crate::pipeline::types::AspectRatio;

const RATIO_TOLERANCE: f64 = 1e-3;
const FLOOR_EPSILON: f64 = 1e-9;

/// True when no whole-pixel crop would bring the image closer to `target`.
fn is_framed(width: u32, height: u32, target: f64) -> bool {
    let (w, h) = (f64::from(width), f64::from(height));
    if (w / h - target).abs() < RATIO_TOLERANCE {
        return true;
    }
    (w - h * target).abs() < 1.0 || (h - w / target).abs() < 1.0
}

/// Centered crop window `(x, y, width, height)` for `target`.
pub fn crop_window(width: u32, height: u32, aspect: AspectRatio) -> (u32, u32, u32, u32) {
    let width = width.max(1);
    let height = height.max(1);
    let target = aspect.ratio();
    if is_framed(width, height, target) {
        return (0, 0, width, height);
    }

    let current = f64::from(width) / f64::from(height);
    if current > target {
        let new_width = ((f64::from(height) * target + FLOOR_EPSILON) as u32).clamp(1, width);
        ((width - new_width) / 2, 0, new_width, height)
    } else {
        let new_height = ((f64::from(width) / target + FLOOR_EPSILON) as u32).clamp(1, height);
        (0, (height - new_height) / 2, width, new_height)
    }
}

pub fn frame_to_aspect(image: RgbaImage, aspect: AspectRatio) -> RgbaImage {
    let (x, y, width, height) = crop_window(image.width(), image.height(), aspect);
    if (width, height) == image.dimensions() {
        return image;
    }
    imageops::crop_imm(&image, x, y, width, height).to_image()
}
