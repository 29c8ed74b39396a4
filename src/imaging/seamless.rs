//! Gradient-domain ("normal clone") placement of a cutout into a scene.
//!
//! Inside the subject's mask the result keeps the subject's own pixel
//! gradients, while the boundary is pinned to the destination. Solving the
//! resulting Poisson system pulls the subject's overall tone and lighting
//! toward the surrounding scene.

use image::{DynamicImage, GrayImage, Luma, Rgb, RgbImage, RgbaImage};
use rayon::prelude::*;

use crate::imaging::fit_subject;
use crate::pipeline::error::PipelineError;
use crate::pipeline::types::SeamlessPlacement;

/// Subject pixels at or above this alpha are solved for; the rest keep the background.
pub const MASK_THRESHOLD: u8 = 128;

const NO_NEIGHBOR: u32 = u32::MAX;

#[derive(Debug, Clone, Copy)]
pub struct SolverSettings {
    pub max_iterations: usize,
    /// Relative residual at which conjugate gradient stops.
    pub tolerance: f64,
}

impl Default for SolverSettings {
    fn default() -> Self {
        Self {
            max_iterations: 1500,
            tolerance: 1e-4,
        }
    }
}

/// Full-canvas subject mask and color layer, zero outside the subject.
#[derive(Debug, Clone)]
pub struct PlacementLayers {
    pub mask: GrayImage,
    pub color: RgbImage,
}

/// Pixel position of the subject center requested by `placement`.
pub fn anchor_point(canvas: (u32, u32), placement: &SeamlessPlacement) -> (i64, i64) {
    (
        (f64::from(canvas.0) * placement.anchor_x).round() as i64,
        (f64::from(canvas.1) * placement.anchor_y).round() as i64,
    )
}

/// Top-left corner that centers the subject on `center` while keeping it inside the canvas.
pub fn clamp_anchor(canvas: (u32, u32), subject: (u32, u32), center: (i64, i64)) -> (u32, u32) {
    let max_x = i64::from(canvas.0.saturating_sub(subject.0));
    let max_y = i64::from(canvas.1.saturating_sub(subject.1));
    let left = center.0.saturating_sub(i64::from(subject.0 / 2)).clamp(0, max_x);
    let top = center.1.saturating_sub(i64::from(subject.1 / 2)).clamp(0, max_y);
    (left as u32, top as u32)
}

pub fn placement_layers(subject: &RgbaImage, canvas: (u32, u32), top_left: (u32, u32)) -> PlacementLayers {
    let mut mask = GrayImage::new(canvas.0, canvas.1);
    let mut color = RgbImage::new(canvas.0, canvas.1);
    for (x, y, pixel) in subject.enumerate_pixels() {
        let (cx, cy) = (top_left.0 + x, top_left.1 + y);
        if cx >= canvas.0 || cy >= canvas.1 {
            continue;
        }
        mask.put_pixel(cx, cy, Luma([pixel[3]]));
        color.put_pixel(cx, cy, Rgb([pixel[0], pixel[1], pixel[2]]));
    }
    PlacementLayers { mask, color }
}

/// Solve domain: masked pixels off the canvas border, so every unknown has four neighbors.
struct Domain {
    pixels: Vec<usize>,
    neighbors: Vec<[u32; 4]>,
}

impl Domain {
    fn build(mask: &GrayImage) -> Self {
        let (width, height) = mask.dimensions();
        let (w, h) = (width as usize, height as usize);
        let mut unknown_of = vec![NO_NEIGHBOR; w * h];
        let mut pixels = Vec::new();
        if width >= 3 && height >= 3 {
            for y in 1..height - 1 {
                for x in 1..width - 1 {
                    if mask.get_pixel(x, y)[0] >= MASK_THRESHOLD {
                        let linear = y as usize * w + x as usize;
                        unknown_of[linear] = pixels.len() as u32;
                        pixels.push(linear);
                    }
                }
            }
        }
        let neighbors = pixels
            .iter()
            .map(|&p| [p - 1, p + 1, p - w, p + w].map(|q| unknown_of[q]))
            .collect();
        Domain { pixels, neighbors }
    }

    fn neighbor_pixels(&self, index: usize, width: usize) -> [usize; 4] {
        let p = self.pixels[index];
        [p - 1, p + 1, p - width, p + width]
    }

    /// `4 v_i - sum of unknown neighbors`.
    fn apply(&self, v: &[f64], out: &mut [f64]) {
        for (i, neighbors) in self.neighbors.iter().enumerate() {
            let mut acc = 4.0 * v[i];
            for &n in neighbors {
                if n != NO_NEIGHBOR {
                    acc -= v[n as usize];
                }
            }
            out[i] = acc;
        }
    }
}

fn dot(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

fn solve_channel(
    domain: &Domain,
    source: &[f64],
    destination: &[f64],
    width: usize,
    settings: &SolverSettings,
) -> Result<Vec<f64>, String> {
    let count = domain.pixels.len();
    let mut rhs = vec![0.0; count];
    let mut offset_sum = 0.0;
    let mut offset_count = 0usize;

    for i in 0..count {
        let p = domain.pixels[i];
        let mut acc = 0.0;
        for (q, n) in domain
            .neighbor_pixels(i, width)
            .into_iter()
            .zip(domain.neighbors[i])
        {
            if n == NO_NEIGHBOR {
                acc += destination[q];
                offset_sum += destination[q] - source[p];
                offset_count += 1;
            } else {
                acc += source[p] - source[q];
            }
        }
        rhs[i] = acc;
    }

    let offset = if offset_count == 0 {
        0.0
    } else {
        offset_sum / offset_count as f64
    };
    let mut x: Vec<f64> = domain.pixels.iter().map(|&p| source[p] + offset).collect();

    let mut scratch = vec![0.0; count];
    domain.apply(&x, &mut scratch);
    let mut residual: Vec<f64> = rhs.iter().zip(&scratch).map(|(b, ax)| b - ax).collect();
    let mut direction = residual.clone();
    let mut residual_norm = dot(&residual, &residual);
    let threshold = (settings.tolerance * dot(&rhs, &rhs).sqrt()).powi(2);

    for _ in 0..settings.max_iterations {
        if residual_norm <= threshold {
            break;
        }
        domain.apply(&direction, &mut scratch);
        let curvature = dot(&direction, &scratch);
        if curvature <= f64::EPSILON {
            break;
        }
        let step = residual_norm / curvature;
        for i in 0..count {
            x[i] += step * direction[i];
            residual[i] -= step * scratch[i];
        }
        let next_norm = dot(&residual, &residual);
        let beta = next_norm / residual_norm;
        residual_norm = next_norm;
        for i in 0..count {
            direction[i] = residual[i] + beta * direction[i];
        }
    }
    if x.len() != count || x.iter().any(|value| !value.is_finite()) {
        return Err("solver diverged".to_string());
    }
    Ok(x)
}

fn channel_plane(image: &RgbImage, channel: usize) -> Vec<f64> {
    image.pixels().map(|pixel| f64::from(pixel[channel])).collect()
}

/// Poisson blend of `layers.color` into `destination` over `layers.mask`.
///
/// The three channels are solved in parallel on the rayon pool.
pub fn poisson_blend(
    destination: &RgbImage,
    layers: &PlacementLayers,
    settings: &SolverSettings,
) -> Result<RgbImage, PipelineError> {
    let canvas = destination.dimensions();
    if layers.mask.dimensions() != canvas || layers.color.dimensions() != canvas {
        return Err(PipelineError::Composition(format!(
            "placement layers are {:?}/{:?}, scene is {canvas:?}",
            layers.mask.dimensions(),
            layers.color.dimensions()
        )));
    }
    let width = canvas.0 as usize;
    let domain = Domain::build(&layers.mask);
    let mut output = destination.clone();
    if domain.pixels.is_empty() {
        return Ok(output);
    }

    let solved: Vec<Vec<f64>> = (0..3usize)
        .into_par_iter()
        .map(|channel| {
            let source = channel_plane(&layers.color, channel);
            let target = channel_plane(destination, channel);
            solve_channel(&domain, &source, &target, width, settings)
                .map_err(|err| PipelineError::Composition(format!("channel {channel}: {err}")))
        })
        .collect::<Result<_, _>>()?;

    for (i, &p) in domain.pixels.iter().enumerate() {
        let (x, y) = ((p % width) as u32, (p / width) as u32);
        let mut pixel = *output.get_pixel(x, y);
        for (channel, values) in solved.iter().enumerate() {
            pixel[channel] = values[i].round().clamp(0.0, 255.0) as u8;
        }
        output.put_pixel(x, y, pixel);
    }
    Ok(output)
}

/// Scales the cutout, clamps it inside the scene around `center`, and clones it in.
pub fn compose_seamless(
    cutout: &RgbaImage,
    background: &RgbaImage,
    placement: &SeamlessPlacement,
    center: (i64, i64),
    settings: &SolverSettings,
) -> Result<RgbImage, PipelineError> {
    let destination = DynamicImage::ImageRgba8(background.clone()).into_rgb8();
    let canvas = destination.dimensions();
    let subject = fit_subject(cutout, canvas, placement.scale_by_height);
    let top_left = clamp_anchor(canvas, subject.dimensions(), center);
    let layers = placement_layers(&subject, canvas, top_left);
    poisson_blend(&destination, &layers, settings)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::imaging::encode_png;
    use image::{ColorType, Rgba};

    const ON_BODY: SeamlessPlacement = SeamlessPlacement {
        scale_by_height: 0.26,
        anchor_x: 0.5,
        anchor_y: 0.38,
    };

    fn striped_subject(width: u32, height: u32) -> RgbaImage {
        RgbaImage::from_fn(width, height, |x, _| {
            let value = if (x / 2) % 2 == 0 { 60 } else { 160 };
            Rgba([value, value, value, 255])
        })
    }

    #[test]
    fn anchor_clamping_keeps_the_subject_inside() {
        assert_eq!(clamp_anchor((100, 80), (20, 10), (50, 40)), (40, 35));
        assert_eq!(clamp_anchor((100, 80), (20, 10), (10_000, -500)), (80, 0));
        assert_eq!(clamp_anchor((100, 80), (20, 10), (i64::MIN, i64::MAX)), (0, 70));
        assert_eq!(clamp_anchor((10, 10), (30, 30), (5, 5)), (0, 0));
    }

    #[test]
    fn anchor_follows_placement_fractions() {
        assert_eq!(anchor_point((1000, 2000), &ON_BODY), (500, 760));
    }

    #[test]
    fn layers_place_subject_pixels_at_the_offset() {
        let mut subject = RgbaImage::from_pixel(4, 3, Rgba([10, 20, 30, 200]));
        subject.put_pixel(0, 0, Rgba([1, 2, 3, 0]));
        let layers = placement_layers(&subject, (10, 10), (5, 6));
        assert_eq!(layers.mask.get_pixel(6, 7)[0], 200);
        assert_eq!(layers.mask.get_pixel(5, 6)[0], 0);
        assert_eq!(layers.color.get_pixel(8, 8).0, [10, 20, 30]);
        assert_eq!(layers.color.get_pixel(0, 0).0, [0, 0, 0]);
        assert_eq!(layers.mask.get_pixel(9, 9)[0], 0);
    }

    #[test]
    fn flat_subject_takes_on_the_background_tone() {
        let destination = RgbImage::from_pixel(40, 40, Rgb([90, 120, 150]));
        let subject = RgbaImage::from_pixel(16, 16, Rgba([250, 10, 10, 255]));
        let layers = placement_layers(&subject, (40, 40), (12, 12));
        let out = poisson_blend(&destination, &layers, &SolverSettings::default()).expect("blend");
        let center = out.get_pixel(20, 20).0;
        for (got, want) in center.iter().zip([90u8, 120, 150]) {
            assert!((i32::from(*got) - i32::from(want)).abs() <= 2, "{center:?}");
        }
    }

    #[test]
    fn fine_detail_survives_the_blend() {
        let destination = RgbImage::from_pixel(80, 80, Rgb([100, 100, 100]));
        let layers = placement_layers(&striped_subject(40, 40), (80, 80), (20, 20));
        let out = poisson_blend(&destination, &layers, &SolverSettings::default()).expect("blend");
        let dark = i32::from(out.get_pixel(40, 40)[0]);
        let light = i32::from(out.get_pixel(42, 40)[0]);
        let contrast = light - dark;
        assert!((70..=130).contains(&contrast), "dark {dark} light {light}");
    }

    #[test]
    fn out_of_bounds_anchor_is_deterministic_and_opaque() {
        let background = RgbaImage::from_pixel(60, 90, Rgba([30, 160, 90, 255]));
        let cutout = striped_subject(30, 50);
        let first = compose_seamless(&cutout, &background, &ON_BODY, (9_999, 9_999), &SolverSettings::default()).expect("first");
        let second = compose_seamless(&cutout, &background, &ON_BODY, (9_999, 9_999), &SolverSettings::default()).expect("second");
        assert_eq!(first, second);
        assert_eq!(first.dimensions(), (60, 90));

        let png = encode_png(DynamicImage::ImageRgb8(first)).expect("encode");
        let decoded = image::load_from_memory(&png).expect("decode");
        assert_eq!(decoded.color(), ColorType::Rgb8);
        assert!(decoded.to_rgba8().pixels().all(|pixel| pixel[3] == 255));
    }

    #[test]
    fn subject_touching_the_border_does_not_panic() {
        let background = RgbaImage::from_pixel(20, 20, Rgba([200, 200, 200, 255]));
        let cutout = RgbaImage::from_pixel(50, 50, Rgba([0, 0, 0, 255]));
        let placement = SeamlessPlacement {
            scale_by_height: 1.0,
            ..ON_BODY
        };
        let out = compose_seamless(&cutout, &background, &placement, (0, 0), &SolverSettings::default()).expect("compose");
        assert_eq!(out.dimensions(), (20, 20));
    }

    #[test]
    fn mismatched_layers_are_a_composition_error() {
        let destination = RgbImage::from_pixel(40, 40, Rgb([90, 120, 150]));
        let subject = RgbaImage::from_pixel(8, 8, Rgba([250, 10, 10, 255]));
        let layers = placement_layers(&subject, (30, 40), (4, 4));
        let err = poisson_blend(&destination, &layers, &SolverSettings::default()).unwrap_err();
        assert!(matches!(err, PipelineError::Composition(_)), "{err:?}");
    }

    #[test]
    fn every_channel_is_solved() {
        let destination = RgbImage::from_pixel(30, 30, Rgb([20, 140, 240]));
        let subject = RgbaImage::from_pixel(10, 10, Rgba([200, 200, 200, 255]));
        let layers = placement_layers(&subject, (30, 30), (10, 10));
        let out = poisson_blend(&destination, &layers, &SolverSettings::default()).expect("blend");
        let center = out.get_pixel(15, 15).0;
        for (got, want) in center.iter().zip([20u8, 140, 240]) {
            assert!((i32::from(*got) - i32::from(want)).abs() <= 2, "{center:?}");
        }
    }
}
