// THEORY:
// Occlusion attribution scores a region by how much the predicted class's
// confidence drops when that region is blanked out. It needs nothing from the
// oracle beyond forward passes, so it works for any black-box classifier.
//
// Key architectural principles:
// 1.  **Deterministic in-filling**: the blanked patch is painted with the mean
//     colour of the whole canonical image. A uniform image therefore never
//     changes under occlusion, which is exactly the degenerate case the
//     normalization has to survive.
// 2.  **Overlap-aware accumulation**: patches overlap whenever stride < patch
//     size. Each cell keeps a running sum and count of the drops of every patch
//     covering it and reports their mean, so the result does not depend on the
//     order patches are visited in.
// 3.  **Bounded cost**: one baseline call plus one call per patch origin, i.e.
//     O((R / S)^2) oracle calls. The stride is the knob that bounds it.

use crate::config::OcclusionSection;
use crate::core_modules::attribution_grid::AttributionGrid;
use crate::core_modules::canonical::CanonicalImage;
use crate::core_modules::oracle::{Oracle, arg_max, validate_probabilities};
use crate::error::{EngineError, OracleError};
use tracing::{debug, trace};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OcclusionConfig {
    /// Side of the square patch that is blanked out.
    pub patch_size: u32,
    /// Distance between consecutive patch origins.
    pub stride: u32,
}

impl Default for OcclusionConfig {
    fn default() -> Self {
        Self {
            patch_size: 16,
            stride: 8,
        }
    }
}

impl From<&OcclusionSection> for OcclusionConfig {
    fn from(section: &OcclusionSection) -> Self {
        Self {
            patch_size: section.patch_size,
            stride: section.stride,
        }
    }
}

impl OcclusionConfig {
    fn validate(&self, size: u32) -> Result<(), EngineError> {
        if self.stride == 0 || self.stride >= self.patch_size {
            return Err(EngineError::Config(format!(
                "stride {} must be in 1..{}",
                self.stride, self.patch_size
            )));
        }
        if self.patch_size > size {
            return Err(EngineError::Config(format!(
                "patch size {} exceeds image size {}",
                self.patch_size, size
            )));
        }
        Ok(())
    }

    /// Patch origins along one axis; the last patch may hang over the border and is clipped.
    pub fn origins(&self, size: u32) -> Vec<u32> {
        (0..size).step_by(self.stride.max(1) as usize).collect()
    }
}

/// Per-cell running mean of the drops of every patch that covered the cell.
struct DropAccumulator {
    size: u32,
    sums: Vec<f64>,
    counts: Vec<u32>,
}

impl DropAccumulator {
    fn new(size: u32) -> Self {
        let cells = (size * size) as usize;
        Self {
            size,
            sums: vec![0.0; cells],
            counts: vec![0; cells],
        }
    }

    fn add_patch(&mut self, x: u32, y: u32, side: u32, drop: f64) {
        for py in y..(y + side).min(self.size) {
            for px in x..(x + side).min(self.size) {
                let idx = (py * self.size + px) as usize;
                self.sums[idx] += drop;
                self.counts[idx] += 1;
            }
        }
    }

    fn into_grid(self, target_class: usize) -> Option<AttributionGrid> {
        let values = self
            .sums
            .iter()
            .zip(self.counts.iter())
            .map(|(&sum, &count)| if count == 0 { 0.0 } else { (sum / count as f64) as f32 })
            .collect();
        AttributionGrid::from_values(self.size, self.size, values, target_class)
    }
}

/// Confidence of `class` after one oracle call, with the vector validated.
fn confidence_of(oracle: &dyn Oracle, image: &CanonicalImage, class: usize) -> Result<f32, EngineError> {
    let probs = oracle.classify(image)?;
    validate_probabilities(&probs, probs.len())?;
    probs.get(class).copied().ok_or_else(|| {
        EngineError::Oracle(OracleError::WrongArity {
            expected: class + 1,
            actual: probs.len(),
        })
    })
}

/// Occlusion map for the oracle's top predicted class, normalized to [0, 1].
pub fn occlude(image: &CanonicalImage, oracle: &dyn Oracle, config: &OcclusionConfig) -> Result<AttributionGrid, EngineError> {
    let size = image.size();
    config.validate(size)?;

    let baseline = oracle.classify(image)?;
    validate_probabilities(&baseline, baseline.len())?;
    let target = arg_max(&baseline)
        .ok_or_else(|| EngineError::Numerical("oracle returned an empty probability vector".into()))?;
    let c0 = baseline[target];

    let fill = image.mean_pixel();
    let origins = config.origins(size);
    let mut accumulator = DropAccumulator::new(size);

    for &y in &origins {
        for &x in &origins {
            let mut occluded = image.clone();
            occluded.fill_rect(x, y, config.patch_size, config.patch_size, fill);
            let c = confidence_of(oracle, &occluded, target)?;
            let drop = (c0 - c) as f64;
            trace!(x, y, drop, "occlusion patch scored");
            accumulator.add_patch(x, y, config.patch_size, drop);
        }
    }

    debug!(
        target_class = target,
        oracle_calls = origins.len() * origins.len() + 1,
        "occlusion attribution complete"
    );

    let raw = accumulator
        .into_grid(target)
        .ok_or_else(|| EngineError::Numerical("accumulator size mismatch".into()))?;
    if !raw.is_finite() {
        return Err(EngineError::Numerical("non-finite confidence drop".into()));
    }
    Ok(raw.normalize_unit())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_modules::oracle::FnOracle;
    use image::Rgb;

    /// Class 0 confidence tracks the brightness of the top-left quadrant.
    fn quadrant_oracle(size: u32) -> impl Oracle {
        FnOracle::new(size, move |image: &CanonicalImage| {
            let half = image.size() / 2;
            let mut sum = 0f32;
            for y in 0..half {
                for x in 0..half {
                    sum += image.pixels().get_pixel(x, y).0[0] as f32;
                }
            }
            let p = sum / (half * half) as f32 / 255.0;
            Ok(vec![p, 1.0 - p])
        })
    }

    #[test]
    fn uniform_image_gives_all_zero_grid() {
        let image = CanonicalImage::uniform(64, [128, 128, 128]);
        let oracle = FnOracle::new(64, |img: &CanonicalImage| {
            let v = img.pixels().get_pixel(10, 10).0[0] as f32 / 255.0;
            Ok(vec![v, 1.0 - v])
        });
        let config = OcclusionConfig {
            patch_size: 16,
            stride: 8,
        };

        let grid = occlude(&image, &oracle, &config).unwrap();
        assert_eq!(grid.dims(), (64, 64));
        assert!(grid.values().iter().all(|v| *v == 0.0 && !v.is_nan()));
    }

    #[test]
    fn important_quadrant_scores_highest() {
        let mut image = CanonicalImage::uniform(32, [20, 20, 20]);
        image.fill_rect(0, 0, 16, 16, Rgb([250, 20, 20]));
        let oracle = quadrant_oracle(32);
        let config = OcclusionConfig {
            patch_size: 8,
            stride: 4,
        };

        let grid = occlude(&image, &oracle, &config).unwrap();
        assert_eq!(grid.target_class, 0);
        assert!(grid.values().iter().all(|v| (0.0..=1.0).contains(v)));
        assert!(grid.get(4, 4) > 0.9);
        assert!(grid.get(28, 28) < 0.1);
    }

    #[test]
    fn overlapping_patches_average_instead_of_overwrite() {
        let mut acc = DropAccumulator::new(4);
        acc.add_patch(0, 0, 2, 1.0);
        acc.add_patch(1, 0, 2, 3.0);
        let grid = acc.into_grid(0).unwrap();
        assert_eq!(grid.get(0, 0), 1.0);
        assert_eq!(grid.get(1, 0), 2.0);
        assert_eq!(grid.get(2, 0), 3.0);
        assert_eq!(grid.get(3, 3), 0.0);
    }

    #[test]
    fn origins_cover_the_border() {
        let config = OcclusionConfig {
            patch_size: 16,
            stride: 8,
        };
        let origins = config.origins(64);
        assert_eq!(origins.first(), Some(&0));
        assert_eq!(origins.last(), Some(&56));
        assert_eq!(origins.len(), 8);
    }

    #[test]
    fn rejects_stride_not_smaller_than_patch() {
        let image = CanonicalImage::uniform(16, [0, 0, 0]);
        let oracle = quadrant_oracle(16);
        let config = OcclusionConfig {
            patch_size: 4,
            stride: 4,
        };
        assert!(matches!(occlude(&image, &oracle, &config), Err(EngineError::Config(_))));
    }

    #[test]
    fn oracle_failure_surfaces_as_engine_error() {
        let image = CanonicalImage::uniform(16, [0, 0, 0]);
        let oracle = FnOracle::new(16, |_: &CanonicalImage| Err(OracleError::Inference("boom".into())));
        let result = occlude(&image, &oracle, &OcclusionConfig { patch_size: 8, stride: 4 });
        assert!(matches!(result, Err(EngineError::Oracle(_))));
    }
}
