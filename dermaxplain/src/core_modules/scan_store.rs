// THEORY:
// The scan record store is an external collaborator; the core only needs
// create, read and a handful of partial updates keyed by scan id. This module
// defines that contract (`ScanStore`) and two adapters: an in-memory map for
// tests and single-process deployments, and a directory of JSON documents for
// durable local runs.
//
// Key architectural principles:
// 1.  **Records are created whole**: the classification fields exist before any
//     explanation job is scheduled for the record.
// 2.  **Latest job wins**: `begin_job` stamps a new, strictly increasing
//     `job_version`. Every later write carries its version and is dropped when
//     a newer job has started. Earlier artifacts stay readable until the new
//     generation writes its first one, which replaces them all at once, so a
//     finished record never falls back to pending and two jobs for one scan can
//     never leave a merge of their artifacts behind.
// 3.  **One field per write**: each engine's artifact is set in its own update;
//     the two engines finish independently.
// 4.  **Explicit terminal failure**: a job that produced nothing, or could not
//     be queued, leaves a `failure_reason`, so readers can tell "still running"
//     from "gave up".
//
// The update rules live on `Explanations` so that both adapters share them and
// only differ in how they load and save a document.

use crate::config::{StoreKind, StoreSection};
use crate::core_modules::oracle::Classification;
use crate::error::StoreError;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

/// Opaque, globally unique scan identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ScanId(String);

impl ScanId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Accepts only canonical UUID strings, which also keeps ids safe as file names.
    pub fn parse(raw: &str) -> Option<Self> {
        Uuid::parse_str(raw).ok().map(|uuid| Self(uuid.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for ScanId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ScanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The two attribution engines, named after the record fields they fill.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineKind {
    /// Sampling (Shapley-style) attribution, stored at `explanations.shap_base64`.
    Shap,
    /// Occlusion attribution, stored at `explanations.occlusion_base64`.
    Occlusion,
}

impl EngineKind {
    pub const ALL: [EngineKind; 2] = [EngineKind::Shap, EngineKind::Occlusion];
}

impl fmt::Display for EngineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineKind::Shap => f.write_str("shap"),
            EngineKind::Occlusion => f.write_str("occlusion"),
        }
    }
}

/// Lifecycle of a record's explanations, derived from its fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ExplanationState {
    Pending,
    Partial,
    Complete,
    Failed { reason: String },
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Explanations {
    pub shap_base64: Option<String>,
    pub occlusion_base64: Option<String>,
    #[serde(default)]
    pub job_version: u64,
    /// Generation that wrote the stored artifacts; trails `job_version` while a rerun is running.
    #[serde(default)]
    pub artifact_version: u64,
    #[serde(default)]
    pub failure_reason: Option<String>,
    #[serde(default)]
    pub engine_errors: BTreeMap<EngineKind, String>,
}

impl Explanations {
    pub fn artifact(&self, engine: EngineKind) -> Option<&String> {
        match engine {
            EngineKind::Shap => self.shap_base64.as_ref(),
            EngineKind::Occlusion => self.occlusion_base64.as_ref(),
        }
    }

    fn artifact_mut(&mut self, engine: EngineKind) -> &mut Option<String> {
        match engine {
            EngineKind::Shap => &mut self.shap_base64,
            EngineKind::Occlusion => &mut self.occlusion_base64,
        }
    }

    pub fn state(&self) -> ExplanationState {
        let produced = EngineKind::ALL.iter().filter(|e| self.artifact(**e).is_some()).count();
        match (produced, &self.failure_reason) {
            (2, _) => ExplanationState::Complete,
            (1, _) => ExplanationState::Partial,
            (_, Some(reason)) => ExplanationState::Failed {
                reason: reason.clone(),
            },
            _ => ExplanationState::Pending,
        }
    }

    /// Opens a new job generation. Stored artifacts stay until the generation writes.
    pub fn begin(&mut self) -> u64 {
        self.job_version += 1;
        self.failure_reason = None;
        self.job_version
    }

    /// Drops artifacts of an earlier generation the first time `version` writes.
    fn claim(&mut self, version: u64) {
        if self.artifact_version != version {
            self.shap_base64 = None;
            self.occlusion_base64 = None;
            self.engine_errors.clear();
            self.artifact_version = version;
        }
    }

    /// Returns `false` when `version` is stale and nothing was written.
    pub fn apply_artifact(&mut self, version: u64, engine: EngineKind, artifact: String) -> bool {
        if version != self.job_version {
            return false;
        }
        self.claim(version);
        *self.artifact_mut(engine) = Some(artifact);
        true
    }

    /// A generation that produced nothing keeps the previous generation's artifacts.
    pub fn apply_finish(&mut self, version: u64, engine_errors: BTreeMap<EngineKind, String>) -> bool {
        if version != self.job_version {
            return false;
        }
        let produced_any = EngineKind::ALL.iter().any(|e| self.artifact(*e).is_some());
        if !produced_any {
            let reason = if engine_errors.is_empty() {
                "no explanation artifacts were produced".to_string()
            } else {
                engine_errors
                    .iter()
                    .map(|(engine, err)| format!("{engine}: {err}"))
                    .collect::<Vec<_>>()
                    .join("; ")
            };
            self.failure_reason = Some(reason);
        }
        self.engine_errors = engine_errors;
        true
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanRecord {
    pub id: ScanId,
    /// Seconds since the Unix epoch.
    pub created_at: u64,
    pub prediction: Classification,
    pub explanations: Explanations,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl ScanRecord {
    pub fn new(prediction: Classification, metadata: BTreeMap<String, String>) -> Self {
        let created_at = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default();
        Self {
            id: ScanId::new(),
            created_at,
            prediction,
            explanations: Explanations::default(),
            metadata,
        }
    }

    pub fn state(&self) -> ExplanationState {
        self.explanations.state()
    }
}

/// Partial-update document store for scan records.
pub trait ScanStore: Send + Sync {
    fn create<'a>(&'a self, record: ScanRecord) -> BoxFuture<'a, Result<(), StoreError>>;

    fn get<'a>(&'a self, id: &'a ScanId) -> BoxFuture<'a, Result<ScanRecord, StoreError>>;

    /// Starts a new explanation generation and returns its version.
    fn begin_job<'a>(&'a self, id: &'a ScanId) -> BoxFuture<'a, Result<u64, StoreError>>;

    /// Sets one engine's artifact field. `Ok(false)` means a newer job owns the record.
    fn set_artifact<'a>(
        &'a self,
        id: &'a ScanId,
        version: u64,
        engine: EngineKind,
        artifact: String,
    ) -> BoxFuture<'a, Result<bool, StoreError>>;

    /// Records per-engine errors and, if nothing was produced, the terminal failure.
    fn finish_job<'a>(
        &'a self,
        id: &'a ScanId,
        version: u64,
        engine_errors: BTreeMap<EngineKind, String>,
    ) -> BoxFuture<'a, Result<bool, StoreError>>;

    /// Marks a record whose job never ran.
    fn mark_failed<'a>(&'a self, id: &'a ScanId, reason: String) -> BoxFuture<'a, Result<(), StoreError>>;
}

#[derive(Default)]
pub struct InMemoryScanStore {
    records: RwLock<HashMap<ScanId, ScanRecord>>,
}

impl InMemoryScanStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    async fn update<T>(&self, id: &ScanId, f: impl FnOnce(&mut ScanRecord) -> T) -> Result<T, StoreError> {
        let mut records = self.records.write().await;
        let record = records
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        Ok(f(record))
    }
}

impl ScanStore for InMemoryScanStore {
    fn create<'a>(&'a self, record: ScanRecord) -> BoxFuture<'a, Result<(), StoreError>> {
        Box::pin(async move {
            self.records.write().await.insert(record.id.clone(), record);
            Ok(())
        })
    }

    fn get<'a>(&'a self, id: &'a ScanId) -> BoxFuture<'a, Result<ScanRecord, StoreError>> {
        Box::pin(async move {
            self.records
                .read()
                .await
                .get(id)
                .cloned()
                .ok_or_else(|| StoreError::NotFound(id.to_string()))
        })
    }

    fn begin_job<'a>(&'a self, id: &'a ScanId) -> BoxFuture<'a, Result<u64, StoreError>> {
        Box::pin(self.update(id, |record| record.explanations.begin()))
    }

    fn set_artifact<'a>(
        &'a self,
        id: &'a ScanId,
        version: u64,
        engine: EngineKind,
        artifact: String,
    ) -> BoxFuture<'a, Result<bool, StoreError>> {
        Box::pin(self.update(id, move |record| {
            record.explanations.apply_artifact(version, engine, artifact)
        }))
    }

    fn finish_job<'a>(
        &'a self,
        id: &'a ScanId,
        version: u64,
        engine_errors: BTreeMap<EngineKind, String>,
    ) -> BoxFuture<'a, Result<bool, StoreError>> {
        Box::pin(self.update(id, move |record| {
            record.explanations.apply_finish(version, engine_errors)
        }))
    }

    fn mark_failed<'a>(&'a self, id: &'a ScanId, reason: String) -> BoxFuture<'a, Result<(), StoreError>> {
        Box::pin(self.update(id, move |record| {
            record.explanations.failure_reason = Some(reason);
        }))
    }
}

/// One pretty-printed JSON document per scan, `<dir>/<id>.json`.
pub struct FileScanStore {
    dir: PathBuf,
    // Serializes read-modify-write cycles; records are small and writes are rare.
    write_lock: Mutex<()>,
}

impl FileScanStore {
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, StoreError> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            write_lock: Mutex::new(()),
        })
    }

    fn path_for(&self, id: &ScanId) -> PathBuf {
        self.dir.join(format!("{}.json", id.as_str()))
    }

    async fn load(&self, id: &ScanId) -> Result<ScanRecord, StoreError> {
        match tokio::fs::read(self.path_for(id)).await {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Err(StoreError::NotFound(id.to_string())),
            Err(err) => Err(err.into()),
        }
    }

    /// Writes to a sibling temp file and renames it over the target.
    async fn save(&self, record: &ScanRecord) -> Result<(), StoreError> {
        let path = self.path_for(&record.id);
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, serde_json::to_vec_pretty(record)?).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    async fn update<T>(&self, id: &ScanId, f: impl FnOnce(&mut ScanRecord) -> T) -> Result<T, StoreError> {
        let _guard = self.write_lock.lock().await;
        let mut record = self.load(id).await?;
        let out = f(&mut record);
        self.save(&record).await?;
        Ok(out)
    }
}

impl ScanStore for FileScanStore {
    fn create<'a>(&'a self, record: ScanRecord) -> BoxFuture<'a, Result<(), StoreError>> {
        Box::pin(async move {
            let _guard = self.write_lock.lock().await;
            self.save(&record).await
        })
    }

    fn get<'a>(&'a self, id: &'a ScanId) -> BoxFuture<'a, Result<ScanRecord, StoreError>> {
        Box::pin(self.load(id))
    }

    fn begin_job<'a>(&'a self, id: &'a ScanId) -> BoxFuture<'a, Result<u64, StoreError>> {
        Box::pin(self.update(id, |record| record.explanations.begin()))
    }

    fn set_artifact<'a>(
        &'a self,
        id: &'a ScanId,
        version: u64,
        engine: EngineKind,
        artifact: String,
    ) -> BoxFuture<'a, Result<bool, StoreError>> {
        Box::pin(self.update(id, move |record| {
            record.explanations.apply_artifact(version, engine, artifact)
        }))
    }

    fn finish_job<'a>(
        &'a self,
        id: &'a ScanId,
        version: u64,
        engine_errors: BTreeMap<EngineKind, String>,
    ) -> BoxFuture<'a, Result<bool, StoreError>> {
        Box::pin(self.update(id, move |record| {
            record.explanations.apply_finish(version, engine_errors)
        }))
    }

    fn mark_failed<'a>(&'a self, id: &'a ScanId, reason: String) -> BoxFuture<'a, Result<(), StoreError>> {
        Box::pin(self.update(id, move |record| {
            record.explanations.failure_reason = Some(reason);
        }))
    }
}

/// Opens the store adapter named by the configuration.
pub fn open_store(config: &StoreSection) -> Result<Arc<dyn ScanStore>, StoreError> {
    match config.kind {
        StoreKind::Memory => Ok(Arc::new(InMemoryScanStore::new())),
        StoreKind::File => Ok(Arc::new(FileScanStore::open(&config.path)?)),
    }
}
