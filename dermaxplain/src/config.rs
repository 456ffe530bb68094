// THEORY:
// One `AppConfig` tree drives every deployment choice: canonical resolution and
// class set, the tunables of both attribution engines, the worker pool bound,
// whether explanations are computed in-process or delegated, and which record
// store backs the service. Values are layered with the `config` crate: built-in
// defaults, then an optional `DermaXplain.toml`, then `DERMAXPLAIN__*` variables.

use crate::error::ConfigError;
use config::{Config, Environment, File as ConfigFile};
use serde::Deserialize;
use std::path::{Path, PathBuf};

const DEFAULT_CONFIG_NAME: &str = "DermaXplain";
const CONFIG_PATH_ENV: &str = "DERMAXPLAIN_CONFIG";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerSection,
    pub model: ModelSection,
    pub occlusion: OcclusionSection,
    pub sampling: SamplingSection,
    pub render: RenderSection,
    pub jobs: JobsSection,
    pub explainer: ExplainerSection,
    pub store: StoreSection,
    pub classification: ClassificationSection,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    pub bind_addr: String,
    pub max_upload_bytes: usize,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8000".to_string(),
            max_upload_bytes: 10 * 1024 * 1024,
        }
    }
}

/// One entry of the ordered class set the classifier scores.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ClassSpec {
    /// Short code stored in scan records (`nv`, `mel`, ...).
    pub code: String,
    /// Human readable diagnosis name.
    pub name: String,
    /// Reference colour used by the built-in prototype oracle.
    #[serde(default)]
    pub prototype: Option<[u8; 3]>,
}

impl ClassSpec {
    fn new(code: &str, name: &str, prototype: [u8; 3]) -> Self {
        Self {
            code: code.to_string(),
            name: name.to_string(),
            prototype: Some(prototype),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ModelSection {
    /// Side of the square every image is resampled to before inference.
    pub canonical_size: u32,
    pub classes: Vec<ClassSpec>,
    /// Softmax temperature of the prototype oracle.
    pub temperature: f32,
}

impl Default for ModelSection {
    fn default() -> Self {
        Self {
            canonical_size: 64,
            classes: vec![
                ClassSpec::new("nv", "Melanocytic nevi", [150, 105, 80]),
                ClassSpec::new("mel", "Melanoma", [70, 45, 40]),
                ClassSpec::new("bkl", "Benign keratosis-like lesions", [175, 140, 110]),
                ClassSpec::new("bcc", "Basal cell carcinoma", [205, 155, 150]),
                ClassSpec::new("akiec", "Actinic keratoses", [190, 115, 100]),
                ClassSpec::new("vasc", "Vascular lesions", [170, 55, 65]),
                ClassSpec::new("df", "Dermatofibroma", [135, 100, 90]),
            ],
            temperature: 600.0,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OcclusionSection {
    pub patch_size: u32,
    pub stride: u32,
}

impl Default for OcclusionSection {
    fn default() -> Self {
        Self {
            patch_size: 16,
            stride: 8,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SamplingSection {
    pub regions_per_side: u32,
    pub budget: usize,
    pub top_k: usize,
    pub blur_sigma: f32,
    pub ridge: f64,
    pub seed: Option<u64>,
}

impl Default for SamplingSection {
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

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RenderSection {
    pub alpha: f32,
    /// Longest side of a rendered panel; larger sources are downscaled first.
    pub max_side: u32,
}

impl Default for RenderSection {
    fn default() -> Self {
        Self {
            alpha: 0.5,
            max_side: 512,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct JobsSection {
    pub workers: usize,
    pub queue_capacity: usize,
    /// Parent directory of per-job workspaces. Defaults to the OS temp dir.
    pub temp_root: Option<PathBuf>,
}

impl Default for JobsSection {
    fn default() -> Self {
        Self {
            workers: 3,
            queue_capacity: 64,
            temp_root: None,
        }
    }
}

impl JobsSection {
    pub fn temp_root(&self) -> PathBuf {
        self.temp_root.clone().unwrap_or_else(std::env::temp_dir)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExplainerMode {
    Local,
    Remote,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ExplainerSection {
    pub mode: ExplainerMode,
    pub remote_url: Option<String>,
    pub timeout_ms: u64,
}

impl Default for ExplainerSection {
    fn default() -> Self {
        Self {
            mode: ExplainerMode::Local,
            remote_url: None,
            timeout_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreKind {
    Memory,
    File,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StoreSection {
    pub kind: StoreKind,
    pub path: PathBuf,
}

impl Default for StoreSection {
    fn default() -> Self {
        Self {
            kind: StoreKind::Memory,
            path: PathBuf::from("./data/scans"),
        }
    }
}

/// What the submission path does when the classifier fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailurePolicy {
    /// Return an error to the caller; nothing is stored.
    #[default]
    Reject,
    /// Store the record with a failed prediction and schedule no job.
    Degrade,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ClassificationSection {
    pub on_failure: FailurePolicy,
}

impl AppConfig {
    /// Loads `DermaXplain.toml` (or the file named by `DERMAXPLAIN_CONFIG`) and
    /// `DERMAXPLAIN__*` environment overrides on top of the defaults.
    pub fn load() -> Result<AppConfig, ConfigError> {
        match std::env::var(CONFIG_PATH_ENV) {
            Ok(path) if !path.is_empty() => Self::load_from(Some(Path::new(&path))),
            _ => Self::load_from(None),
        }
    }

    pub fn load_from(path: Option<&Path>) -> Result<AppConfig, ConfigError> {
        let file_source = match path {
            Some(path) => ConfigFile::from(path).required(true),
            None => ConfigFile::with_name(DEFAULT_CONFIG_NAME).required(false),
        };

        let builder = Config::builder()
            .add_source(file_source)
            .add_source(
                Environment::with_prefix("DERMAXPLAIN")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config = builder.try_deserialize::<AppConfig>()?;
        config.validate()?;
        Ok(config)
    }

    /// Rejects combinations the engines or the job pool cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Invalid(msg));

        if self.model.classes.is_empty() {
            return invalid("model.classes must not be empty".into());
        }
        if self.model.canonical_size == 0 {
            return invalid("model.canonical_size must be positive".into());
        }
        if self.occlusion.stride == 0 || self.occlusion.stride >= self.occlusion.patch_size {
            return invalid(format!(
                "occlusion.stride ({}) must be in 1..patch_size ({})",
                self.occlusion.stride, self.occlusion.patch_size
            ));
        }
        if self.occlusion.patch_size > self.model.canonical_size {
            return invalid("occlusion.patch_size exceeds model.canonical_size".into());
        }
        if self.sampling.regions_per_side == 0
            || self.sampling.regions_per_side > self.model.canonical_size
        {
            return invalid("sampling.regions_per_side must be in 1..=canonical_size".into());
        }
        if self.sampling.budget == 0 || self.sampling.top_k == 0 {
            return invalid("sampling.budget and sampling.top_k must be positive".into());
        }
        if !(0.0..=1.0).contains(&self.render.alpha) {
            return invalid("render.alpha must be within [0, 1]".into());
        }
        if self.jobs.workers == 0 || self.jobs.queue_capacity == 0 {
            return invalid("jobs.workers and jobs.queue_capacity must be positive".into());
        }
        if self.explainer.mode == ExplainerMode::Remote && self.explainer.remote_url.is_none() {
            return invalid("explainer.remote_url is required in remote mode".into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_are_valid() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.model.canonical_size, 64);
        assert_eq!(config.model.classes.len(), 7);
        assert_eq!(config.model.classes[1].code, "mel");
        assert_eq!(config.jobs.workers, 3);
    }

    #[test]
    fn stride_must_be_smaller_than_patch() {
        let mut config = AppConfig::default();
        config.occlusion.stride = 16;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn remote_mode_requires_url() {
        let mut config = AppConfig::default();
        config.explainer.mode = ExplainerMode::Remote;
        assert!(config.validate().is_err());
        config.explainer.remote_url = Some("http://127.0.0.1:9000/explain".into());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn file_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("DermaXplain.toml");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(
            file,
            "[occlusion]\npatch_size = 8\nstride = 4\n\n[explainer]\nmode = \"remote\"\nremote_url = \"http://delegate/explain\"\n\n[classification]\non_failure = \"degrade\""
        )
        .unwrap();

        let config = AppConfig::load_from(Some(path.as_path())).unwrap();
        assert_eq!(config.occlusion.patch_size, 8);
        assert_eq!(config.occlusion.stride, 4);
        assert_eq!(config.explainer.mode, ExplainerMode::Remote);
        assert_eq!(config.classification.on_failure, FailurePolicy::Degrade);
        assert_eq!(config.sampling.budget, 50);
    }
}
