// THEORY:
// The oracle is the pre-trained classifier seen as a black box: canonical image
// in, probability vector over an ordered class set out. It is loaded once at
// process start and shared as an immutable `Arc<dyn Oracle>`, injected into the
// submission pipeline and the local explainer instead of living in global state.
//
// `classify_image` is the single call site that turns a raw oracle answer into a
// tagged `Classification`. Infrastructure failures and malformed vectors become
// `ClassificationFailed` with a reason; they are never folded into a fake
// low-confidence label.

use crate::config::{ClassSpec, ModelSection};
use crate::core_modules::canonical::CanonicalImage;
use crate::error::OracleError;
use serde::{Deserialize, Serialize};

/// A black-box image classifier.
pub trait Oracle: Send + Sync {
    /// Side of the square RGB input the classifier expects.
    fn input_size(&self) -> u32;

    /// Scores `image` against every class of the configured class set.
    fn classify(&self, image: &CanonicalImage) -> Result<Vec<f32>, OracleError>;
}

/// The ordered class set. Index `i` of a probability vector refers to `classes[i]`.
#[derive(Debug, Clone, PartialEq)]
pub struct ClassSet {
    classes: Vec<ClassSpec>,
}

impl ClassSet {
    pub fn new(classes: Vec<ClassSpec>) -> Self {
        Self { classes }
    }

    pub fn from_config(model: &ModelSection) -> Self {
        Self::new(model.classes.clone())
    }

    pub fn len(&self) -> usize {
        self.classes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&ClassSpec> {
        self.classes.get(index)
    }
}

/// Outcome of one classification, distinguishing model failure from a real prediction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Classification {
    Classified {
        class_index: usize,
        #[serde(rename = "class")]
        code: String,
        readable_name: String,
        confidence: f32,
    },
    ClassificationFailed {
        reason: String,
    },
}

impl Classification {
    pub fn is_classified(&self) -> bool {
        matches!(self, Classification::Classified { .. })
    }
}

/// Slack above 1.0 tolerated for float rounding in a softmax output.
const PROBABILITY_SLACK: f32 = 1e-4;

/// Checks arity and that every entry is a finite probability in `[0, 1]`.
pub fn validate_probabilities(probs: &[f32], expected: usize) -> Result<(), OracleError> {
    if probs.len() != expected {
        return Err(OracleError::WrongArity {
            expected,
            actual: probs.len(),
        });
    }
    if let Some(bad) = probs.iter().position(|p| !p.is_finite() || *p < 0.0 || *p > 1.0 + PROBABILITY_SLACK) {
        return Err(OracleError::NotAProbability(bad));
    }
    Ok(())
}

/// Index of the largest score. Ties resolve to the lowest index.
pub fn arg_max(probs: &[f32]) -> Option<usize> {
    probs
        .iter()
        .enumerate()
        .fold(None, |best: Option<(usize, f32)>, (i, &p)| match best {
            Some((_, best_p)) if best_p >= p => best,
            _ => Some((i, p)),
        })
        .map(|(i, _)| i)
}

/// Classes sorted by descending score, truncated to `k`.
pub fn top_k(probs: &[f32], k: usize) -> Vec<usize> {
    let mut order: Vec<usize> = (0..probs.len()).collect();
    order.sort_by(|&a, &b| probs[b].total_cmp(&probs[a]).then(a.cmp(&b)));
    order.truncate(k);
    order
}

/// Runs the oracle once and wraps the answer in a tagged result.
pub fn classify_image(oracle: &dyn Oracle, classes: &ClassSet, image: &CanonicalImage) -> Classification {
    let probs = match oracle.classify(image) {
        Ok(probs) => probs,
        Err(err) => {
            return Classification::ClassificationFailed {
                reason: err.to_string(),
            };
        }
    };
    if let Err(err) = validate_probabilities(&probs, classes.len()) {
        return Classification::ClassificationFailed {
            reason: err.to_string(),
        };
    }

    match arg_max(&probs).and_then(|i| classes.get(i).map(|spec| (i, spec))) {
        Some((class_index, spec)) => Classification::Classified {
            class_index,
            code: spec.code.clone(),
            readable_name: spec.name.clone(),
            confidence: ((probs[class_index] * 10_000.0).round() / 10_000.0).min(1.0),
        },
        None => Classification::ClassificationFailed {
            reason: "empty probability vector".to_string(),
        },
    }
}

/// Adapts a closure into an oracle, for embedding callers and synthetic ground truth.
pub struct FnOracle<F> {
    input_size: u32,
    f: F,
}

impl<F> FnOracle<F>
where
    F: Fn(&CanonicalImage) -> Result<Vec<f32>, OracleError> + Send + Sync,
{
    pub fn new(input_size: u32, f: F) -> Self {
        Self { input_size, f }
    }
}

impl<F> Oracle for FnOracle<F>
where
    F: Fn(&CanonicalImage) -> Result<Vec<f32>, OracleError> + Send + Sync,
{
    fn input_size(&self) -> u32 {
        self.input_size
    }

    fn classify(&self, image: &CanonicalImage) -> Result<Vec<f32>, OracleError> {
        (self.f)(image)
    }
}

/// Nearest-colour-prototype classifier.
///
/// Pools the image into one centre-weighted mean colour (lesions sit in the
/// middle of dermoscopic frames) and applies a softmax over negative squared
/// distances to each class prototype. It stands in for a trained network when
/// none is wired in, and is deterministic, so explanations are reproducible.
pub struct PrototypeOracle {
    input_size: u32,
    prototypes: Vec<[f32; 3]>,
    temperature: f32,
    weights: Vec<f32>,
}

impl PrototypeOracle {
    pub fn new(input_size: u32, prototypes: Vec<[u8; 3]>, temperature: f32) -> Self {
        let weights = centre_weights(input_size);
        Self {
            input_size,
            prototypes: prototypes
                .into_iter()
                .map(|p| [p[0] as f32, p[1] as f32, p[2] as f32])
                .collect(),
            temperature: temperature.max(f32::EPSILON),
            weights,
        }
    }

    /// Builds the oracle from the class set; classes without a prototype get mid grey.
    pub fn from_config(model: &ModelSection) -> Self {
        let prototypes = model
            .classes
            .iter()
            .map(|spec| spec.prototype.unwrap_or([128, 128, 128]))
            .collect();
        Self::new(model.canonical_size, prototypes, model.temperature)
    }

    fn pooled_colour(&self, image: &CanonicalImage) -> [f32; 3] {
        let mut acc = [0f32; 3];
        let mut total = 0f32;
        for (pixel, &w) in image.pixels().pixels().zip(self.weights.iter()) {
            for c in 0..3 {
                acc[c] += w * pixel.0[c] as f32;
            }
            total += w;
        }
        if total <= 0.0 {
            return acc;
        }
        [acc[0] / total, acc[1] / total, acc[2] / total]
    }
}

impl Oracle for PrototypeOracle {
    fn input_size(&self) -> u32 {
        self.input_size
    }

    fn classify(&self, image: &CanonicalImage) -> Result<Vec<f32>, OracleError> {
        if image.size() != self.input_size {
            return Err(OracleError::Inference(format!(
                "expected {}x{} input, got {}x{}",
                self.input_size,
                self.input_size,
                image.size(),
                image.size()
            )));
        }
        let colour = self.pooled_colour(image);
        let logits: Vec<f32> = self
            .prototypes
            .iter()
            .map(|p| {
                let d2: f32 = (0..3).map(|c| (colour[c] - p[c]).powi(2)).sum();
                -d2 / self.temperature
            })
            .collect();
        Ok(softmax(&logits))
    }
}

fn centre_weights(size: u32) -> Vec<f32> {
    let centre = (size as f32 - 1.0) / 2.0;
    let sigma = (size as f32 / 3.0).max(1.0);
    let mut weights = Vec::with_capacity((size * size) as usize);
    for y in 0..size {
        for x in 0..size {
            let d2 = (x as f32 - centre).powi(2) + (y as f32 - centre).powi(2);
            weights.push((-d2 / (2.0 * sigma * sigma)).exp());
        }
    }
    weights
}

pub fn softmax(logits: &[f32]) -> Vec<f32> {
    let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let exps: Vec<f32> = logits.iter().map(|l| (l - max).exp()).collect();
    let sum: f32 = exps.iter().sum();
    exps.into_iter().map(|e| e / sum).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;

    struct FixedOracle(Result<Vec<f32>, OracleError>);

    impl Oracle for FixedOracle {
        fn input_size(&self) -> u32 {
            8
        }
        fn classify(&self, _image: &CanonicalImage) -> Result<Vec<f32>, OracleError> {
            self.0.clone()
        }
    }

    fn classes() -> ClassSet {
        ClassSet::from_config(&AppConfig::default().model)
    }

    #[test]
    fn classified_picks_arg_max_and_rounds() {
        let oracle = FixedOracle(Ok(vec![0.1, 0.612345, 0.1, 0.1, 0.05, 0.02, 0.017655]));
        let image = CanonicalImage::uniform(8, [0, 0, 0]);
        match classify_image(&oracle, &classes(), &image) {
            Classification::Classified {
                class_index,
                code,
                confidence,
                ..
            } => {
                assert_eq!(class_index, 1);
                assert_eq!(code, "mel");
                assert!((confidence - 0.6123).abs() < 1e-6);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn oracle_error_is_tagged_not_sentinel() {
        let oracle = FixedOracle(Err(OracleError::Inference("gpu fell over".into())));
        let image = CanonicalImage::uniform(8, [0, 0, 0]);
        let result = classify_image(&oracle, &classes(), &image);
        assert!(matches!(result, Classification::ClassificationFailed { ref reason } if reason.contains("gpu")));
    }

    #[test]
    fn malformed_vectors_are_rejected() {
        let image = CanonicalImage::uniform(8, [0, 0, 0]);
        let short = FixedOracle(Ok(vec![1.0, 0.0]));
        assert!(!classify_image(&short, &classes(), &image).is_classified());

        let nan = FixedOracle(Ok(vec![f32::NAN, 0.0, 0.0, 0.0, 0.0, 0.0, 1.0]));
        assert!(!classify_image(&nan, &classes(), &image).is_classified());

        // Logits or unnormalized scores are not probabilities.
        let logits = FixedOracle(Ok(vec![3.5, 0.2, 0.0, 0.0, 0.0, 0.0, 0.0]));
        match classify_image(&logits, &classes(), &image) {
            Classification::ClassificationFailed { reason } => assert!(reason.contains("index 0")),
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(
            validate_probabilities(&[0.5, 1.5], 2),
            Err(OracleError::NotAProbability(1))
        ));
        assert!(validate_probabilities(&[0.0, 1.00001], 2).is_ok());
    }

    #[test]
    fn top_k_orders_by_score() {
        assert_eq!(top_k(&[0.1, 0.5, 0.3, 0.1], 2), vec![1, 2]);
        assert_eq!(top_k(&[0.2, 0.2], 5), vec![0, 1]);
        assert_eq!(arg_max(&[0.3, 0.3, 0.1]), Some(0));
        assert_eq!(arg_max(&[]), None);
    }

    #[test]
    fn prototype_oracle_prefers_matching_colour() {
        let oracle = PrototypeOracle::new(16, vec![[200, 40, 40], [40, 40, 200]], 500.0);
        let reddish = CanonicalImage::uniform(16, [190, 50, 50]);
        let probs = oracle.classify(&reddish).unwrap();
        assert_eq!(probs.len(), 2);
        assert!(probs[0] > probs[1]);
        assert!((probs.iter().sum::<f32>() - 1.0).abs() < 1e-5);
    }

    #[test]
    fn prototype_oracle_rejects_wrong_size() {
        let oracle = PrototypeOracle::new(16, vec![[0, 0, 0]], 1.0);
        let image = CanonicalImage::uniform(8, [0, 0, 0]);
        assert!(matches!(oracle.classify(&image), Err(OracleError::Inference(_))));
    }
}
