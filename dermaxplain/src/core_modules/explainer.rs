// THEORY:
// An explainer turns one uploaded image into the two rendered artifacts. The job
// orchestrator does not care where the work happens: in this process
// (`LocalExplainer`) or on another host (`RemoteDelegate`, see `delegate.rs`).
// Both implement the same trait with the same output contract, and a deployment
// picks exactly one of them through `ExplainerBackend::from_config`.
//
// Key architectural principles:
// 1.  **Infallible at the seam**: `explain` always yields an
//     `ExplanationArtifacts`. A failed engine leaves its field unset and records
//     the reason in `errors`; the orchestrator never sees an `Err`.
// 2.  **Engines off the async runtime**: both engines are CPU-bound loops of
//     synchronous oracle calls, so each runs on the blocking pool via
//     `spawn_blocking`. The two engines of one job run side by side, and each
//     artifact is handed out as soon as its engine finishes, so a fast engine
//     never waits for a slow one before it can be stored.
// 3.  **Panic isolation**: a panicking engine surfaces as a `JoinError` on its own
//     blocking task and is reported like any other engine failure.

use crate::config::AppConfig;
use crate::config::ExplainerMode;
use crate::core_modules::canonical::CanonicalImage;
use crate::core_modules::delegate::RemoteDelegate;
use crate::core_modules::occlusion::{OcclusionConfig, occlude};
use crate::core_modules::oracle::Oracle;
use crate::core_modules::renderer::{ColormapKind, RenderConfig, RenderedArtifact, render, render_strip};
use crate::core_modules::sampling::{SamplingConfig, sample_attribute};
use crate::core_modules::scan_store::EngineKind;
use crate::error::{ConfigError, EngineError, ImageError};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// The rendered output of one explanation, as exchanged with the remote delegate.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExplanationArtifacts {
    #[serde(default)]
    pub shap_base64: Option<String>,
    #[serde(default)]
    pub occlusion_base64: Option<String>,
    /// Why an engine produced nothing. Local bookkeeping only, never sent over the wire.
    #[serde(skip)]
    pub errors: BTreeMap<EngineKind, String>,
}

impl ExplanationArtifacts {
    /// No artifacts, with the same failure recorded against both engines.
    pub fn failed(reason: impl Into<String>) -> Self {
        let reason = reason.into();
        Self {
            errors: EngineKind::ALL.iter().map(|e| (*e, reason.clone())).collect(),
            ..Self::default()
        }
    }

    pub fn get(&self, engine: EngineKind) -> Option<&String> {
        match engine {
            EngineKind::Shap => self.shap_base64.as_ref(),
            EngineKind::Occlusion => self.occlusion_base64.as_ref(),
        }
    }

    fn set(&mut self, engine: EngineKind, outcome: Result<String, String>) {
        match outcome {
            Ok(encoded) => match engine {
                EngineKind::Shap => self.shap_base64 = Some(encoded),
                EngineKind::Occlusion => self.occlusion_base64 = Some(encoded),
            },
            Err(reason) => {
                self.errors.insert(engine, reason);
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.shap_base64.is_none() && self.occlusion_base64.is_none()
    }
}

/// Receives `(engine, base64 PNG)` pairs while an explanation is still running.
pub type ArtifactSender = mpsc::UnboundedSender<(EngineKind, String)>;

/// Produces explanation artifacts for an image stored in a job workspace.
pub trait Explainer: Send + Sync {
    fn explain<'a>(&'a self, image_path: &'a Path, workspace: &'a Path) -> BoxFuture<'a, ExplanationArtifacts>;

    /// Like `explain`, but may send each artifact to `ready` as soon as its engine finishes.
    /// The returned value still carries every artifact, sent early or not.
    fn explain_streaming<'a>(
        &'a self,
        image_path: &'a Path,
        workspace: &'a Path,
        ready: ArtifactSender,
    ) -> BoxFuture<'a, ExplanationArtifacts> {
        drop(ready);
        self.explain(image_path, workspace)
    }
}

/// Engine parameters shared by every job of a `LocalExplainer`.
#[derive(Debug, Clone, Default)]
pub struct EngineSettings {
    pub occlusion: OcclusionConfig,
    pub sampling: SamplingConfig,
    pub render: RenderConfig,
}

impl From<&AppConfig> for EngineSettings {
    fn from(config: &AppConfig) -> Self {
        Self {
            occlusion: OcclusionConfig::from(&config.occlusion),
            sampling: SamplingConfig::from(&config.sampling),
            render: RenderConfig::from(&config.render),
        }
    }
}

/// Runs both attribution engines in-process against a shared oracle.
#[derive(Clone)]
pub struct LocalExplainer {
    oracle: Arc<dyn Oracle>,
    settings: Arc<EngineSettings>,
}

impl LocalExplainer {
    pub fn new(oracle: Arc<dyn Oracle>, settings: EngineSettings) -> Self {
        Self {
            oracle,
            settings: Arc::new(settings),
        }
    }

    pub fn from_config(oracle: Arc<dyn Oracle>, config: &AppConfig) -> Self {
        Self::new(oracle, EngineSettings::from(config))
    }

    /// Explains raw image bytes. Rendered PNGs are also written into `workspace` when given.
    pub async fn explain_bytes(&self, bytes: Vec<u8>, workspace: Option<&Path>) -> ExplanationArtifacts {
        self.explain_bytes_streaming(bytes, workspace, None).await
    }

    async fn explain_bytes_streaming(
        &self,
        bytes: Vec<u8>,
        workspace: Option<&Path>,
        ready: Option<ArtifactSender>,
    ) -> ExplanationArtifacts {
        let bytes = Arc::new(bytes);
        let (shap, occlusion) = tokio::join!(
            self.run_and_publish(EngineKind::Shap, bytes.clone(), workspace, ready.as_ref()),
            self.run_and_publish(EngineKind::Occlusion, bytes.clone(), workspace, ready.as_ref()),
        );

        let mut artifacts = ExplanationArtifacts::default();
        artifacts.set(EngineKind::Shap, shap);
        artifacts.set(EngineKind::Occlusion, occlusion);
        artifacts
    }

    /// Runs one engine, then stores its PNG in the workspace and announces it on `ready`.
    async fn run_and_publish(
        &self,
        engine: EngineKind,
        bytes: Arc<Vec<u8>>,
        workspace: Option<&Path>,
        ready: Option<&ArtifactSender>,
    ) -> Result<String, String> {
        let rendered = match self.run_engine(engine, bytes).await {
            Ok(rendered) => rendered,
            Err(err) => {
                warn!(engine = %engine, error = %err, "attribution engine failed");
                return Err(err.to_string());
            }
        };
        if let Some(dir) = workspace {
            let path = dir.join(format!("{engine}.png"));
            if let Err(err) = tokio::fs::write(&path, &rendered.png).await {
                warn!(engine = %engine, error = %err, "could not write rendered overlay to workspace");
            }
        }
        debug!(engine = %engine, width = rendered.width, height = rendered.height, "overlay rendered");
        let encoded = rendered.to_base64();
        if let Some(ready) = ready {
            if ready.send((engine, encoded.clone())).is_err() {
                debug!(engine = %engine, "artifact listener gone");
            }
        }
        Ok(encoded)
    }

    async fn run_engine(&self, engine: EngineKind, bytes: Arc<Vec<u8>>) -> Result<RenderedArtifact, EngineError> {
        let oracle = self.oracle.clone();
        let settings = self.settings.clone();
        tokio::task::spawn_blocking(move || compute(engine, &bytes, oracle.as_ref(), &settings))
            .await
            .map_err(|join_err| EngineError::Aborted(join_err.to_string()))?
    }
}

/// Decodes, attributes and renders one engine's artifact. Runs on a blocking thread.
fn compute(engine: EngineKind, bytes: &[u8], oracle: &dyn Oracle, settings: &EngineSettings) -> Result<RenderedArtifact, EngineError> {
    if bytes.is_empty() {
        return Err(ImageError::Empty.into());
    }
    let source = image::load_from_memory(bytes).map_err(ImageError::from)?;
    let canonical = CanonicalImage::from_dynamic(&source, oracle.input_size())?;

    let rendered = match engine {
        EngineKind::Shap => {
            let attributions = sample_attribute(&canonical, oracle, &settings.sampling)?;
            render_strip(&attributions.grids, &source, ColormapKind::Diverging, &settings.render)
        }
        EngineKind::Occlusion => {
            let grid = occlude(&canonical, oracle, &settings.occlusion)?;
            render(&grid, &source, ColormapKind::Sequential, &settings.render)
        }
    };
    rendered.ok_or(EngineError::Render)
}

impl LocalExplainer {
    async fn explain_file(&self, image_path: &Path, workspace: &Path, ready: Option<ArtifactSender>) -> ExplanationArtifacts {
        match tokio::fs::read(image_path).await {
            Ok(bytes) => self.explain_bytes_streaming(bytes, Some(workspace), ready).await,
            Err(err) => {
                warn!(path = %image_path.display(), error = %err, "job image could not be read");
                ExplanationArtifacts::failed(format!("image unreadable: {err}"))
            }
        }
    }
}

impl Explainer for LocalExplainer {
    fn explain<'a>(&'a self, image_path: &'a Path, workspace: &'a Path) -> BoxFuture<'a, ExplanationArtifacts> {
        Box::pin(self.explain_file(image_path, workspace, None))
    }

    fn explain_streaming<'a>(
        &'a self,
        image_path: &'a Path,
        workspace: &'a Path,
        ready: ArtifactSender,
    ) -> BoxFuture<'a, ExplanationArtifacts> {
        Box::pin(self.explain_file(image_path, workspace, Some(ready)))
    }
}

/// The explainer selected for this deployment.
pub enum ExplainerBackend {
    Local(LocalExplainer),
    Remote(RemoteDelegate),
}

impl ExplainerBackend {
    pub fn from_config(config: &AppConfig, oracle: Arc<dyn Oracle>) -> Result<Self, ConfigError> {
        match config.explainer.mode {
            ExplainerMode::Local => Ok(Self::Local(LocalExplainer::from_config(oracle, config))),
            ExplainerMode::Remote => {
                let url = config
                    .explainer
                    .remote_url
                    .clone()
                    .ok_or_else(|| ConfigError::Invalid("explainer.remote_url is required in remote mode".into()))?;
                let delegate = RemoteDelegate::new(url, Duration::from_millis(config.explainer.timeout_ms))
                    .map_err(|err| ConfigError::Invalid(err.to_string()))?;
                Ok(Self::Remote(delegate))
            }
        }
    }
}

impl Explainer for ExplainerBackend {
    fn explain<'a>(&'a self, image_path: &'a Path, workspace: &'a Path) -> BoxFuture<'a, ExplanationArtifacts> {
        match self {
            ExplainerBackend::Local(local) => local.explain(image_path, workspace),
            ExplainerBackend::Remote(remote) => remote.explain(image_path, workspace),
        }
    }

    fn explain_streaming<'a>(
        &'a self,
        image_path: &'a Path,
        workspace: &'a Path,
        ready: ArtifactSender,
    ) -> BoxFuture<'a, ExplanationArtifacts> {
        match self {
            ExplainerBackend::Local(local) => local.explain_streaming(image_path, workspace, ready),
            ExplainerBackend::Remote(remote) => remote.explain_streaming(image_path, workspace, ready),
        }
    }
}
