// THEORY:
// The renderer is the last step of an engine's output: it turns an ephemeral
// `AttributionGrid` into the only thing that gets persisted, a PNG overlay of the
// grid on the uploaded image.
//
// Key architectural principles:
// 1.  **Resolution follows the source**: the canonical-resolution grid is
//     bilinearly upsampled to the source image (capped at `max_side`), not the
//     other way round, so the overlay lines up with what a clinician uploaded.
// 2.  **Colour map follows the sign**: signed sampling grids use a diverging
//     blue-white-red map over a grayscale background; magnitude-only occlusion
//     grids use the blue-yellow-red heat ramp over the colour image.
// 3.  **Never fail the job**: malformed inputs are logged and yield `None`. A
//     missing overlay only leaves one artifact field unset.

use crate::config::RenderSection;
use crate::core_modules::attribution_grid::AttributionGrid;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use image::codecs::png::PngEncoder;
use image::imageops::{self, FilterType};
use image::{DynamicImage, ExtendedColorType, ImageEncoder, Rgb, RgbImage};
use tracing::warn;

const DIVERGING_NEGATIVE: [f32; 3] = [30.0, 136.0, 229.0];
const DIVERGING_NEUTRAL: [f32; 3] = [255.0, 255.0, 255.0];
const DIVERGING_POSITIVE: [f32; 3] = [255.0, 13.0, 87.0];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColormapKind {
    /// Signed grids in [-1, 1].
    Diverging,
    /// Magnitude grids in [0, 1].
    Sequential,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RenderConfig {
    pub alpha: f32,
    pub max_side: u32,
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            alpha: 0.5,
            max_side: 512,
        }
    }
}

impl From<&RenderSection> for RenderConfig {
    fn from(section: &RenderSection) -> Self {
        Self {
            alpha: section.alpha,
            max_side: section.max_side,
        }
    }
}

/// An encoded PNG overlay.
#[derive(Debug, Clone, PartialEq)]
pub struct RenderedArtifact {
    pub width: u32,
    pub height: u32,
    pub png: Vec<u8>,
}

impl RenderedArtifact {
    pub fn to_base64(&self) -> String {
        STANDARD.encode(&self.png)
    }
}

pub fn colour_for(kind: ColormapKind, value: f32) -> [f32; 3] {
    match kind {
        ColormapKind::Sequential => {
            let score = value.clamp(0.0, 1.0);
            if score <= 0.5 {
                // Blue to yellow
                let ratio = score / 0.5;
                [255.0 * ratio, 255.0 * ratio, 255.0 * (1.0 - ratio)]
            } else {
                // Yellow to red
                let ratio = (score - 0.5) / 0.5;
                [255.0, 255.0 * (1.0 - ratio), 0.0]
            }
        }
        ColormapKind::Diverging => {
            let score = value.clamp(-1.0, 1.0);
            let (end, t) = if score < 0.0 {
                (DIVERGING_NEGATIVE, -score)
            } else {
                (DIVERGING_POSITIVE, score)
            };
            [0, 1, 2].map(|c| DIVERGING_NEUTRAL[c] * (1.0 - t) + end[c] * t)
        }
    }
}

fn fit_source(source: &DynamicImage, max_side: u32) -> RgbImage {
    let rgb = source.to_rgb8();
    let longest = rgb.width().max(rgb.height());
    if max_side == 0 || longest <= max_side {
        return rgb;
    }
    let scale = max_side as f32 / longest as f32;
    let width = ((rgb.width() as f32 * scale).round() as u32).max(1);
    let height = ((rgb.height() as f32 * scale).round() as u32).max(1);
    imageops::resize(&rgb, width, height, FilterType::Triangle)
}

fn grayscale(image: &RgbImage) -> RgbImage {
    let luma = DynamicImage::ImageRgb8(image.clone()).to_luma8();
    DynamicImage::ImageLuma8(luma).to_rgb8()
}

fn overlay(grid: &AttributionGrid, background: &RgbImage, kind: ColormapKind, alpha: f32) -> RgbImage {
    let (width, height) = background.dimensions();
    let mut out = RgbImage::new(width, height);
    for (x, y, pixel) in out.enumerate_pixels_mut() {
        let u = (x as f32 + 0.5) / width as f32;
        let v = (y as f32 + 0.5) / height as f32;
        let colour = colour_for(kind, grid.sample_bilinear(u, v));
        let base = background.get_pixel(x, y).0;
        *pixel = Rgb([0, 1, 2].map(|c| {
            (base[c] as f32 * (1.0 - alpha) + colour[c] * alpha).round().clamp(0.0, 255.0) as u8
        }));
    }
    out
}

fn encode_png(image: &RgbImage) -> Option<Vec<u8>> {
    let mut png = Vec::new();
    let encoder = PngEncoder::new(&mut png);
    match encoder.write_image(image.as_raw(), image.width(), image.height(), ExtendedColorType::Rgb8) {
        Ok(()) => Some(png),
        Err(err) => {
            warn!(error = %err, "overlay encoding failed");
            None
        }
    }
}

fn usable(grid: &AttributionGrid) -> bool {
    grid.width() > 0 && grid.height() > 0 && grid.is_finite()
}

/// Overlays one grid on the source image and encodes the result as PNG.
pub fn render(grid: &AttributionGrid, source: &DynamicImage, kind: ColormapKind, config: &RenderConfig) -> Option<RenderedArtifact> {
    render_strip(std::slice::from_ref(grid), source, kind, config)
}

/// Renders one panel per grid, side by side, into a single PNG.
pub fn render_strip(grids: &[AttributionGrid], source: &DynamicImage, kind: ColormapKind, config: &RenderConfig) -> Option<RenderedArtifact> {
    if grids.is_empty() || source.width() == 0 || source.height() == 0 {
        warn!(panels = grids.len(), "nothing to render");
        return None;
    }
    if let Some(bad) = grids.iter().find(|g| !usable(g)) {
        warn!(target_class = bad.target_class, "attribution grid is malformed, skipping render");
        return None;
    }

    let mut background = fit_source(source, config.max_side);
    if kind == ColormapKind::Diverging {
        background = grayscale(&background);
    }
    let (panel_w, panel_h) = background.dimensions();
    let alpha = config.alpha.clamp(0.0, 1.0);

    let mut strip = RgbImage::new(panel_w * grids.len() as u32, panel_h);
    for (i, grid) in grids.iter().enumerate() {
        let panel = overlay(grid, &background, kind, alpha);
        imageops::replace(&mut strip, &panel, (i as u32 * panel_w) as i64, 0);
    }

    let png = encode_png(&strip)?;
    Some(RenderedArtifact {
        width: strip.width(),
        height: strip.height(),
        png,
    })
}
