// THEORY:
// The sampling engine approximates Shapley-style marginal contributions of image
// regions with a kernel-weighted linear regression, in the spirit of Kernel SHAP.
// It is an approximation: coalitions are sampled, the regression is ridge
// regularized, and nothing here certifies the result as a Shapley value.
//
// Key architectural principles:
// 1.  **Fixed coarse segmentation**: the canonical image is split into a
//     `regions_per_side x regions_per_side` grid of regions. This stands in for
//     superpixels and keeps the region count, and thus the regression size, fixed.
// 2.  **Soft removal**: a hidden region shows the blurred image instead of black,
//     so perturbed inputs stay close to what the classifier was trained on.
// 3.  **Budgeted queries**: the oracle is called once per sampled coalition plus
//     the two anchors (nothing revealed, everything revealed), independent of
//     the number of regions. That is the reason this engine exists next to
//     occlusion, whose cost grows with spatial resolution.
// 4.  **Kernel weights**: coalitions of size s out of M regions are weighted by
//     (M - 1) / (C(M, s) * s * (M - s)), favouring nearly empty and nearly full
//     coalitions. The anchors get a large fixed weight, which softly pins the
//     intercept to f(empty) and the coefficient sum to f(full) - f(empty).
// 5.  **Signed output**: each requested class gets its own grid, scaled into
//     [-1, 1] by its largest magnitude. Positive cells support the class, negative
//     cells oppose it.

use crate::config::SamplingSection;
use crate::core_modules::attribution_grid::AttributionGrid;
use crate::core_modules::canonical::CanonicalImage;
use crate::core_modules::oracle::{Oracle, top_k, validate_probabilities};
use crate::error::EngineError;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tracing::debug;

const ANCHOR_WEIGHT: f64 = 1.0e4;
const PIVOT_EPSILON: f64 = 1.0e-12;
/// Coefficients below the f32 resolution of a probability are solver noise.
const COEFFICIENT_FLOOR: f64 = 1.0e-7;

#[derive(Debug, Clone, PartialEq)]
pub struct SamplingConfig {
    pub regions_per_side: u32,
    /// Number of random coalitions sent to the oracle.
    pub budget: usize,
    /// Number of most confident classes to explain.
    pub top_k: usize,
    /// Gaussian sigma of the "region hidden" baseline.
    pub blur_sigma: f32,
    /// Ridge penalty on region coefficients.
    pub ridge: f64,
    /// Fixed seed for reproducible coalitions; `None` draws from OS entropy.
    pub seed: Option<u64>,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            regions_per_side: 8,
            budget: 50,
            top_k: 3,
            blur_sigma: 4.0,
            ridge: 1e-3,
            seed: None,
        }
    }
}

impl From<&SamplingSection> for SamplingConfig {
    fn from(section: &SamplingSection) -> Self {
        Self {
            regions_per_side: section.regions_per_side,
            budget: section.budget,
            top_k: section.top_k,
            blur_sigma: section.blur_sigma,
            ridge: section.ridge,
            seed: section.seed,
        }
    }
}

/// Per-class attribution grids, ordered by descending baseline confidence.
#[derive(Debug, Clone, PartialEq)]
pub struct ClassAttributions {
    pub grids: Vec<AttributionGrid>,
}

impl ClassAttributions {
    pub fn for_class(&self, class: usize) -> Option<&AttributionGrid> {
        self.grids.iter().find(|g| g.target_class == class)
    }

    pub fn classes(&self) -> Vec<usize> {
        self.grids.iter().map(|g| g.target_class).collect()
    }
}

/// Fixed square segmentation of the canonical image.
#[derive(Debug, Clone)]
pub struct RegionGrid {
    size: u32,
    per_side: u32,
    labels: Vec<usize>,
}

impl RegionGrid {
    pub fn new(size: u32, per_side: u32) -> Self {
        let per_side = per_side.clamp(1, size.max(1));
        let mut labels = Vec::with_capacity((size * size) as usize);
        for y in 0..size {
            for x in 0..size {
                let ry = (y * per_side / size) as usize;
                let rx = (x * per_side / size) as usize;
                labels.push(ry * per_side as usize + rx);
            }
        }
        Self {
            size,
            per_side,
            labels,
        }
    }

    pub fn region_count(&self) -> usize {
        (self.per_side * self.per_side) as usize
    }

    pub fn region_of(&self, x: u32, y: u32) -> usize {
        self.labels[(y * self.size + x) as usize]
    }

    /// Reveals the original pixels of every region whose mask entry is set.
    fn compose(&self, original: &CanonicalImage, hidden: &CanonicalImage, mask: &[bool]) -> CanonicalImage {
        let mut composed = hidden.clone();
        let target = composed.pixels_mut();
        for (i, (dst, src)) in target.pixels_mut().zip(original.pixels().pixels()).enumerate() {
            if mask[self.labels[i]] {
                *dst = *src;
            }
        }
        composed
    }

    /// Broadcasts one coefficient per region onto every pixel of that region.
    fn broadcast(&self, coefficients: &[f64], target_class: usize) -> Option<AttributionGrid> {
        let values = self.labels.iter().map(|&r| coefficients[r] as f32).collect();
        AttributionGrid::from_values(self.size, self.size, values, target_class)
    }
}

/// A sampled coalition together with the oracle's answer for it.
struct Sample {
    mask: Vec<bool>,
    weight: f64,
    probs: Vec<f32>,
}

fn ln_choose(n: usize, k: usize) -> f64 {
    let k = k.min(n - k);
    (1..=k).map(|i| ((n - k + i) as f64 / i as f64).ln()).sum()
}

/// Log of the Shapley kernel weight; `None` for the empty and full coalitions.
pub fn shapley_kernel_ln(regions: usize, revealed: usize) -> Option<f64> {
    if revealed == 0 || revealed >= regions {
        return None;
    }
    let m = regions as f64;
    let s = revealed as f64;
    Some((m - 1.0).ln() - ln_choose(regions, revealed) - s.ln() - (m - s).ln())
}

/// Shapley-style attribution grids for the `top_k` most confident classes.
pub fn sample_attribute(image: &CanonicalImage, oracle: &dyn Oracle, config: &SamplingConfig) -> Result<ClassAttributions, EngineError> {
    if config.budget == 0 || config.top_k == 0 {
        return Err(EngineError::Config("budget and top_k must be positive".into()));
    }
    let regions = RegionGrid::new(image.size(), config.regions_per_side);
    let m = regions.region_count();

    let full = oracle.classify(image)?;
    validate_probabilities(&full, full.len())?;
    let n_classes = full.len();
    let classes = top_k(&full, config.top_k);
    if classes.is_empty() {
        return Err(EngineError::Numerical("oracle returned an empty probability vector".into()));
    }

    let hidden = image.blurred(config.blur_sigma);
    let empty = oracle.classify(&hidden)?;
    validate_probabilities(&empty, n_classes)?;

    let mut rng = match config.seed {
        Some(seed) => ChaCha8Rng::seed_from_u64(seed),
        None => ChaCha8Rng::from_entropy(),
    };

    let mut drawn = Vec::with_capacity(config.budget);
    for _ in 0..config.budget {
        let mask: Vec<bool> = (0..m).map(|_| rng.gen_bool(0.5)).collect();
        let probs = oracle.classify(&regions.compose(image, &hidden, &mask))?;
        validate_probabilities(&probs, n_classes)?;
        drawn.push((mask, probs));
    }

    let samples = weigh_samples(m, drawn, empty, full);
    debug!(
        regions = m,
        oracle_calls = config.budget + 2,
        classes = ?classes,
        "sampling attribution complete"
    );

    let (gram, ridge) = (normal_matrix(m, &samples), config.ridge.max(0.0));
    let mut grids = Vec::with_capacity(classes.len());
    for &class in &classes {
        let rhs = normal_rhs(m, &samples, class);
        let mut system = gram.clone();
        for (i, row) in system.iter_mut().enumerate().skip(1) {
            row[i] += ridge;
        }
        let coefficients: Vec<f64> = solve(system, rhs)?[1..]
            .iter()
            .map(|&c| if c.abs() < COEFFICIENT_FLOOR { 0.0 } else { c })
            .collect();
        let raw = regions
            .broadcast(&coefficients, class)
            .ok_or_else(|| EngineError::Numerical("region broadcast size mismatch".into()))?;
        if !raw.is_finite() {
            return Err(EngineError::Numerical(format!("non-finite coefficients for class {class}")));
        }
        grids.push(raw.normalize_signed());
    }

    Ok(ClassAttributions { grids })
}

fn weigh_samples(m: usize, drawn: Vec<(Vec<bool>, Vec<f32>)>, empty: Vec<f32>, full: Vec<f32>) -> Vec<Sample> {
    let ln_weights: Vec<Option<f64>> = drawn
        .iter()
        .map(|(mask, _)| shapley_kernel_ln(m, mask.iter().filter(|b| **b).count()))
        .collect();
    let ln_max = ln_weights
        .iter()
        .flatten()
        .copied()
        .fold(f64::NEG_INFINITY, f64::max);

    let mut samples: Vec<Sample> = drawn
        .into_iter()
        .zip(ln_weights)
        .map(|((mask, probs), ln_w)| Sample {
            mask,
            // Random draws that hit the empty or full coalition act as extra anchors.
            weight: ln_w.map_or(ANCHOR_WEIGHT, |w| (w - ln_max).exp()),
            probs,
        })
        .collect();

    samples.push(Sample {
        mask: vec![false; m],
        weight: ANCHOR_WEIGHT,
        probs: empty,
    });
    samples.push(Sample {
        mask: vec![true; m],
        weight: ANCHOR_WEIGHT,
        probs: full,
    });
    samples
}

/// X^T W X for design rows [1, z_1, ..., z_m].
fn normal_matrix(m: usize, samples: &[Sample]) -> Vec<Vec<f64>> {
    let mut gram = vec![vec![0.0; m + 1]; m + 1];
    for sample in samples {
        let active: Vec<usize> = std::iter::once(0)
            .chain(sample.mask.iter().enumerate().filter(|(_, b)| **b).map(|(i, _)| i + 1))
            .collect();
        for &i in &active {
            for &j in &active {
                gram[i][j] += sample.weight;
            }
        }
    }
    gram
}

/// X^T W y for the probabilities of `class`.
fn normal_rhs(m: usize, samples: &[Sample], class: usize) -> Vec<f64> {
    let mut rhs = vec![0.0; m + 1];
    for sample in samples {
        let wy = sample.weight * sample.probs[class] as f64;
        rhs[0] += wy;
        for (i, &revealed) in sample.mask.iter().enumerate() {
            if revealed {
                rhs[i + 1] += wy;
            }
        }
    }
    rhs
}

/// Gaussian elimination with partial pivoting.
fn solve(mut a: Vec<Vec<f64>>, mut b: Vec<f64>) -> Result<Vec<f64>, EngineError> {
    let n = b.len();
    for col in 0..n {
        let pivot = (col..n)
            .max_by(|&r1, &r2| a[r1][col].abs().total_cmp(&a[r2][col].abs()))
            .unwrap_or(col);
        if a[pivot][col].abs() < PIVOT_EPSILON {
            return Err(EngineError::Numerical(format!("singular regression system at column {col}")));
        }
        a.swap(col, pivot);
        b.swap(col, pivot);

        for row in (col + 1)..n {
            let factor = a[row][col] / a[col][col];
            if factor == 0.0 {
                continue;
            }
            for k in col..n {
                a[row][k] -= factor * a[col][k];
            }
            b[row] -= factor * b[col];
        }
    }

    let mut x = vec![0.0; n];
    for row in (0..n).rev() {
        let tail: f64 = ((row + 1)..n).map(|k| a[row][k] * x[k]).sum();
        x[row] = (b[row] - tail) / a[row][row];
    }
    Ok(x)
}
