use image::{imageops, Rgba, RgbaImage};

use crate::imaging::fit_subject;
use crate::pipeline::types::FlatPlacement;

const SHADOW_OPACITY: u8 = 160;
const SHADOW_BLUR_SIGMA: f32 = 12.0;
const SHADOW_OFFSET: (i64, i64) = (8, 18);

/// Soft black silhouette of `subject`, padded so the blur is not clipped.
///
/// Returns the layer and the padding added on every side.
pub fn drop_shadow(subject: &RgbaImage) -> (RgbaImage, u32) {
    let margin = (SHADOW_BLUR_SIGMA * 3.0).ceil() as u32;
    let mut layer = RgbaImage::new(subject.width() + margin * 2, subject.height() + margin * 2);
    for (x, y, pixel) in subject.enumerate_pixels() {
        let alpha = (u32::from(pixel[3]) * u32::from(SHADOW_OPACITY) + 127) / 255;
        layer.put_pixel(x + margin, y + margin, Rgba([0, 0, 0, alpha as u8]));
    }
    (imageops::blur(&layer, SHADOW_BLUR_SIGMA), margin)
}

/// Top-left corner for a subject of `subject` size on a `canvas` of the given size.
///
/// Horizontally centered plus `x_shift` of the width; bottom-aligned and raised
/// by `-y_shift` of the height.
pub fn flat_anchor(canvas: (u32, u32), subject: (u32, u32), placement: &FlatPlacement) -> (i64, i64) {
    let (canvas_w, canvas_h) = (f64::from(canvas.0), f64::from(canvas.1));
    let (subject_w, subject_h) = (f64::from(subject.0), f64::from(subject.1));
    let x = (canvas_w - subject_w) / 2.0 + placement.x_shift * canvas_w;
    let y = canvas_h - subject_h + placement.y_shift * canvas_h;
    (x.floor() as i64, y.floor() as i64)
}

fn blend_pixel(destination: &mut Rgba<u8>, source: &Rgba<u8>) {
    let source_alpha = f32::from(source[3]) / 255.0;
    if source_alpha <= 0.0 {
        return;
    }
    let destination_alpha = f32::from(destination[3]) / 255.0;
    let out_alpha = source_alpha + destination_alpha * (1.0 - source_alpha);
    let destination_weight = destination_alpha * (1.0 - source_alpha);
    for channel in 0..3 {
        let mixed = (f32::from(source[channel]) * source_alpha + f32::from(destination[channel]) * destination_weight)
            / out_alpha;
        destination[channel] = mixed.round().clamp(0.0, 255.0) as u8;
    }
    destination[3] = (out_alpha * 255.0).round().clamp(0.0, 255.0) as u8;
}

/// Straight-alpha "over" of `layer` onto `canvas` with its top-left at `(x, y)`.
///
/// Alpha is rounded, so an opaque canvas stays fully opaque.
pub fn alpha_over(canvas: &mut RgbaImage, layer: &RgbaImage, x: i64, y: i64) {
    let (canvas_w, canvas_h) = (i64::from(canvas.width()), i64::from(canvas.height()));
    for (lx, ly, pixel) in layer.enumerate_pixels() {
        let cx = x + i64::from(lx);
        let cy = y + i64::from(ly);
        if cx < 0 || cy < 0 || cx >= canvas_w || cy >= canvas_h {
            continue;
        }
        blend_pixel(canvas.get_pixel_mut(cx as u32, cy as u32), pixel);
    }
}

/// Background, then the offset shadow, then the subject, all alpha-over.
pub fn compose_flat(
    cutout: &RgbaImage,
    background: &RgbaImage,
    placement: &FlatPlacement,
) -> RgbaImage {
    let canvas_size = background.dimensions();
    let subject = fit_subject(cutout, canvas_size, placement.scale_by_height);
    let (shadow, margin) = drop_shadow(&subject);
    let (x, y) = flat_anchor(canvas_size, subject.dimensions(), placement);

    let mut canvas = background.clone();
    let margin = i64::from(margin);
    alpha_over(
        &mut canvas,
        &shadow,
        x + SHADOW_OFFSET.0 - margin,
        y + SHADOW_OFFSET.1 - margin,
    );
    alpha_over(&mut canvas, &subject, x, y);
    canvas
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::imaging::{decode_rgba, encode_png};
    use image::{ColorType, DynamicImage};

    const RED: Rgba<u8> = Rgba([220, 20, 20, 255]);
    const BLUE: Rgba<u8> = Rgba([20, 40, 200, 255]);

    fn red_block(width: u32, height: u32) -> RgbaImage {
        RgbaImage::from_pixel(width, height, RED)
    }

    fn is_reddish(pixel: &Rgba<u8>) -> bool {
        pixel[0] > 150 && pixel[2] < 100
    }

    #[test]
    fn canvas_size_is_preserved_for_any_subject() {
        let background = RgbaImage::from_pixel(120, 90, BLUE);
        for (w, h) in [(10, 10), (1000, 40), (40, 1000), (1, 1)] {
            for scale in [0.1, 0.74, 1.0, 4.0] {
                let placement = FlatPlacement {
                    scale_by_height: scale,
                    ..FlatPlacement::default()
                };
                let out = compose_flat(&red_block(w, h), &background, &placement);
                assert_eq!(out.dimensions(), background.dimensions());
            }
        }
    }

    #[test]
    fn subject_is_centered_and_scaled_to_the_height_fraction() {
        let background = RgbaImage::from_pixel(400, 400, BLUE);
        let out = compose_flat(&red_block(100, 200), &background, &FlatPlacement::default());

        let red_rows: Vec<u32> = (0..400)
            .filter(|y| (0..400).any(|x| is_reddish(out.get_pixel(x, *y))))
            .collect();
        let red_cols: Vec<u32> = (0..400)
            .filter(|x| (0..400).any(|y| is_reddish(out.get_pixel(*x, y))))
            .collect();
        let height = red_rows.len() as f64;
        assert!((height / 400.0 - 0.74).abs() < 0.02, "height fraction {}", height / 400.0);

        let left = *red_cols.first().unwrap() as i64;
        let right = *red_cols.last().unwrap() as i64;
        assert!((left + right - 399).abs() <= 2, "left {left} right {right}");

        let bottom = *red_rows.last().unwrap();
        assert!(bottom < 400 - 20, "subject should sit above the bottom edge");
    }

    #[test]
    fn shadow_darkens_below_and_right_of_the_subject() {
        let background = RgbaImage::from_pixel(400, 400, Rgba([240, 240, 240, 255]));
        let out = compose_flat(&red_block(100, 200), &background, &FlatPlacement::default());
        let (x, y) = flat_anchor((400, 400), (148, 296), &FlatPlacement::default());
        let probe = out.get_pixel((x + 148 + 4) as u32, (y + 296 + 6) as u32);
        assert!(probe[0] < 230, "expected shadow, got {probe:?}");
        assert_eq!(probe[3], 255);
    }

    #[test]
    fn translucent_edges_blend_instead_of_overwriting() {
        let background = RgbaImage::from_pixel(50, 50, BLUE);
        let subject = RgbaImage::from_pixel(20, 20, Rgba([255, 0, 0, 128]));
        let placement = FlatPlacement {
            scale_by_height: 0.4,
            x_shift: 0.0,
            y_shift: -0.5,
        };
        let out = compose_flat(&subject, &background, &placement);
        let center = out.get_pixel(25, 15);
        assert!(center[0] > 60 && center[2] > 30, "expected a mix, got {center:?}");
        assert_eq!(center[3], 255);
    }

    #[test]
    fn opaque_background_stays_opaque_everywhere() {
        let background = RgbaImage::from_pixel(1024, 1024, Rgba([128, 128, 128, 255]));
        let out = compose_flat(&red_block(200, 400), &background, &FlatPlacement::default());
        let translucent = out.pixels().filter(|pixel| pixel[3] != 255).count();
        assert_eq!(translucent, 0);
    }

    #[test]
    fn alpha_over_mixes_and_clips_to_the_canvas() {
        let mut canvas = RgbaImage::from_pixel(4, 4, Rgba([0, 0, 255, 255]));
        let layer = RgbaImage::from_pixel(3, 3, Rgba([255, 0, 0, 128]));
        alpha_over(&mut canvas, &layer, 2, -1);

        assert_eq!(*canvas.get_pixel(0, 0), Rgba([0, 0, 255, 255]));
        assert_eq!(*canvas.get_pixel(3, 1), Rgba([128, 0, 127, 255]));
        assert_eq!(*canvas.get_pixel(2, 2), Rgba([0, 0, 255, 255]));

        let mut clear = RgbaImage::new(2, 2);
        alpha_over(&mut clear, &layer, 0, 0);
        assert_eq!(*clear.get_pixel(1, 1), Rgba([255, 0, 0, 128]));
    }

    #[test]
    fn encoded_flat_result_keeps_its_alpha_channel() {
        let background = RgbaImage::from_pixel(64, 80, Rgba([10, 10, 10, 200]));
        let out = compose_flat(&red_block(8, 8), &background, &FlatPlacement::default());
        let png = encode_png(DynamicImage::ImageRgba8(out)).expect("encode");
        let decoded = image::load_from_memory(&png).expect("decode");
        assert_eq!(decoded.color(), ColorType::Rgba8);
        assert_eq!(decode_rgba(&png).expect("rgba").dimensions(), (64, 80));
    }
}
