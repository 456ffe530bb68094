// THEORY:
// The `pipeline` module is the top-level API of the explanation core. A caller
// hands over the uploaded bytes and gets back a stored, classified record
// immediately; the explanation artifacts are filled in later by the job pool.
//
// Key architectural principles:
// 1.  **Fail before storing**: decoding happens first, so a malformed upload is
//     an input error and leaves no record and no job behind.
// 2.  **Create, then dispatch**: the record with its classification is in the
//     store before the job is queued, so a worker never races the record into
//     existence.
// 3.  **Explicit failure policy**: a classifier failure is either rejected or
//     stored as a degraded record, as configured. It is never disguised as a
//     low-confidence prediction.

use crate::config::{AppConfig, FailurePolicy};
use crate::core_modules::canonical::CanonicalImage;
use crate::core_modules::explainer::{Explainer, ExplainerBackend};
use crate::core_modules::oracle::{ClassSet, Classification, Oracle, classify_image};
use crate::core_modules::scan_store::{ScanId, ScanRecord, ScanStore, open_store};
use crate::error::{ConfigError, ScanError, StoreError};
use crate::job_pool::{ExplanationJob, JobPool};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{info, warn};

/// Classification entry point plus the asynchronous explanation machinery behind it.
pub struct ScanPipeline {
    oracle: Arc<dyn Oracle>,
    classes: ClassSet,
    store: Arc<dyn ScanStore>,
    pool: Arc<JobPool>,
    on_failure: FailurePolicy,
}

impl ScanPipeline {
    pub fn new(
        oracle: Arc<dyn Oracle>,
        classes: ClassSet,
        store: Arc<dyn ScanStore>,
        pool: Arc<JobPool>,
        on_failure: FailurePolicy,
    ) -> Self {
        Self {
            oracle,
            classes,
            store,
            pool,
            on_failure,
        }
    }

    /// Wires store, explainer backend and job pool from configuration.
    ///
    /// Must be called from within a tokio runtime, since it spawns the pool's workers.
    pub fn from_config(config: &AppConfig, oracle: Arc<dyn Oracle>) -> Result<Self, ConfigError> {
        let store = open_store(&config.store).map_err(|err| ConfigError::Invalid(format!("store: {err}")))?;
        let explainer: Arc<dyn Explainer> = Arc::new(ExplainerBackend::from_config(config, oracle.clone())?);
        let pool = Arc::new(JobPool::start(explainer, store.clone(), &config.jobs));
        Ok(Self::new(
            oracle,
            ClassSet::from_config(&config.model),
            store,
            pool,
            config.classification.on_failure,
        ))
    }

    /// Classifies an upload, stores the record and schedules its explanation job.
    pub async fn submit(&self, image_bytes: Vec<u8>, metadata: BTreeMap<String, String>) -> Result<ScanRecord, ScanError> {
        let canonical = CanonicalImage::decode(&image_bytes, self.oracle.input_size())?;
        let prediction = classify_image(self.oracle.as_ref(), &self.classes, &canonical);

        if let Classification::ClassificationFailed { reason } = &prediction {
            warn!(reason = %reason, policy = ?self.on_failure, "classification failed");
            if self.on_failure == FailurePolicy::Reject {
                return Err(ScanError::ClassificationRejected(reason.clone()));
            }
            let mut record = ScanRecord::new(prediction.clone(), metadata);
            record.explanations.failure_reason = Some("classification failed, no explanation scheduled".into());
            self.store.create(record.clone()).await?;
            return Ok(record);
        }

        let mut record = ScanRecord::new(prediction.clone(), metadata);
        self.store.create(record.clone()).await?;

        let job = ExplanationJob {
            scan_id: record.id.clone(),
            image_bytes,
            baseline: prediction,
        };
        if let Err(err) = self.pool.dispatch(job) {
            let reason = format!("explanation not scheduled: {err}");
            warn!(scan_id = %record.id, error = %err, "explanation job could not be dispatched");
            if let Err(store_err) = self.store.mark_failed(&record.id, reason.clone()).await {
                warn!(scan_id = %record.id, error = %store_err, "dispatch failure could not be recorded");
            }
            record.explanations.failure_reason = Some(reason);
        }

        info!(scan_id = %record.id, "scan classified");
        Ok(record)
    }

    pub async fn record(&self, id: &ScanId) -> Result<ScanRecord, StoreError> {
        self.store.get(id).await
    }

    /// Stops the job pool after the queued jobs have run.
    pub async fn shutdown(&self) {
        self.pool.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::JobsSection;
    use crate::core_modules::explainer::ExplanationArtifacts;
    use crate::core_modules::oracle::FnOracle;
    use crate::core_modules::scan_store::{EngineKind, ExplanationState, InMemoryScanStore};
    use crate::error::OracleError;
    use futures::future::BoxFuture;
    use image::{ImageFormat, Rgb, RgbImage};
    use std::io::Cursor;
    use std::path::Path;
    use std::time::Duration;
    use tokio::sync::Semaphore;

    struct InstantExplainer;

    impl Explainer for InstantExplainer {
        fn explain<'a>(&'a self, _image_path: &'a Path, _workspace: &'a Path) -> BoxFuture<'a, ExplanationArtifacts> {
            Box::pin(async {
                ExplanationArtifacts {
                    shap_base64: Some("c2hhcA==".into()),
                    occlusion_base64: Some("b2Nj".into()),
                    ..ExplanationArtifacts::default()
                }
            })
        }
    }

    /// Holds every job until the test opens the gate.
    struct GatedExplainer(Arc<Semaphore>);

    impl Explainer for GatedExplainer {
        fn explain<'a>(&'a self, _image_path: &'a Path, _workspace: &'a Path) -> BoxFuture<'a, ExplanationArtifacts> {
            Box::pin(async move {
                let _permit = self.0.acquire().await;
                ExplanationArtifacts {
                    shap_base64: Some("c2hhcA==".into()),
                    occlusion_base64: Some("b2Nj".into()),
                    ..ExplanationArtifacts::default()
                }
            })
        }
    }

    /// Keeps records in memory but refuses to record a terminal failure.
    struct NoFailureMarks(InMemoryScanStore);

    impl ScanStore for NoFailureMarks {
        fn create<'a>(&'a self, record: ScanRecord) -> BoxFuture<'a, Result<(), StoreError>> {
            self.0.create(record)
        }

        fn get<'a>(&'a self, id: &'a ScanId) -> BoxFuture<'a, Result<ScanRecord, StoreError>> {
            self.0.get(id)
        }

        fn begin_job<'a>(&'a self, id: &'a ScanId) -> BoxFuture<'a, Result<u64, StoreError>> {
            self.0.begin_job(id)
        }

        fn set_artifact<'a>(
            &'a self,
            id: &'a ScanId,
            version: u64,
            engine: EngineKind,
            artifact: String,
        ) -> BoxFuture<'a, Result<bool, StoreError>> {
            self.0.set_artifact(id, version, engine, artifact)
        }

        fn finish_job<'a>(
            &'a self,
            id: &'a ScanId,
            version: u64,
            engine_errors: BTreeMap<EngineKind, String>,
        ) -> BoxFuture<'a, Result<bool, StoreError>> {
            self.0.finish_job(id, version, engine_errors)
        }

        fn mark_failed<'a>(&'a self, _id: &'a ScanId, _reason: String) -> BoxFuture<'a, Result<(), StoreError>> {
            Box::pin(async { Err(StoreError::Io(std::io::Error::other("disk full"))) })
        }
    }

    fn png() -> Vec<u8> {
        let mut out = Cursor::new(Vec::new());
        RgbImage::from_pixel(20, 20, Rgb([70, 45, 40]))
            .write_to(&mut out, ImageFormat::Png)
            .unwrap();
        out.into_inner()
    }

    fn jobs(temp_root: &Path) -> JobsSection {
        JobsSection {
            workers: 1,
            queue_capacity: 4,
            temp_root: Some(temp_root.to_path_buf()),
        }
    }

    fn pipeline(oracle: Arc<dyn Oracle>, policy: FailurePolicy, temp_root: &Path) -> (ScanPipeline, Arc<InMemoryScanStore>) {
        let store = Arc::new(InMemoryScanStore::new());
        let pool = Arc::new(JobPool::start(Arc::new(InstantExplainer), store.clone(), &jobs(temp_root)));
        let classes = ClassSet::from_config(&AppConfig::default().model);
        (ScanPipeline::new(oracle, classes, store.clone(), pool, policy), store)
    }

    fn melanoma_oracle() -> Arc<dyn Oracle> {
        Arc::new(FnOracle::new(16, |_: &CanonicalImage| Ok(vec![0.1, 0.7, 0.05, 0.05, 0.04, 0.03, 0.03])))
    }

    fn broken_oracle() -> Arc<dyn Oracle> {
        Arc::new(FnOracle::new(16, |_: &CanonicalImage| Err(OracleError::Inference("weights missing".into()))))
    }

    #[tokio::test]
    async fn submit_returns_classified_record_then_job_completes() {
        let temp_root = tempfile::tempdir().unwrap();
        let (pipeline, _) = pipeline(melanoma_oracle(), FailurePolicy::Reject, temp_root.path());
        let mut metadata = BTreeMap::new();
        metadata.insert("patient".to_string(), "anon-7".to_string());

        let record = pipeline.submit(png(), metadata).await.unwrap();
        match &record.prediction {
            Classification::Classified { code, .. } => assert_eq!(code, "mel"),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(record.metadata["patient"], "anon-7");

        pipeline.shutdown().await;
        let stored = pipeline.record(&record.id).await.unwrap();
        assert_eq!(stored.state(), ExplanationState::Complete);
    }

    #[tokio::test]
    async fn undecodable_upload_stores_nothing() {
        let temp_root = tempfile::tempdir().unwrap();
        let (pipeline, store) = pipeline(melanoma_oracle(), FailurePolicy::Reject, temp_root.path());
        let result = pipeline.submit(b"definitely not a png".to_vec(), BTreeMap::new()).await;
        assert!(matches!(result, Err(ScanError::InvalidImage(_))));
        assert_eq!(store.len().await, 0);
        pipeline.shutdown().await;
    }

    #[tokio::test]
    async fn reject_policy_surfaces_classifier_failure() {
        let temp_root = tempfile::tempdir().unwrap();
        let (pipeline, store) = pipeline(broken_oracle(), FailurePolicy::Reject, temp_root.path());
        let result = pipeline.submit(png(), BTreeMap::new()).await;
        assert!(matches!(result, Err(ScanError::ClassificationRejected(ref r)) if r.contains("weights")));
        assert_eq!(store.len().await, 0);
        pipeline.shutdown().await;
    }

    #[tokio::test]
    async fn degrade_policy_stores_failed_prediction_without_job() {
        let temp_root = tempfile::tempdir().unwrap();
        let (pipeline, _) = pipeline(broken_oracle(), FailurePolicy::Degrade, temp_root.path());
        let record = pipeline.submit(png(), BTreeMap::new()).await.unwrap();
        assert!(!record.prediction.is_classified());

        pipeline.shutdown().await;
        let stored = pipeline.record(&record.id).await.unwrap();
        assert_eq!(stored.explanations.job_version, 0);
        assert!(matches!(stored.state(), ExplanationState::Failed { .. }));
    }

    #[tokio::test]
    async fn submit_returns_before_the_job_finishes() {
        let temp_root = tempfile::tempdir().unwrap();
        let store = Arc::new(InMemoryScanStore::new());
        let gate = Arc::new(Semaphore::new(0));
        let pool = Arc::new(JobPool::start(Arc::new(GatedExplainer(gate.clone())), store.clone(), &jobs(temp_root.path())));
        let classes = ClassSet::from_config(&AppConfig::default().model);
        let pipeline = ScanPipeline::new(melanoma_oracle(), classes, store, pool, FailurePolicy::Reject);

        let record = pipeline.submit(png(), BTreeMap::new()).await.unwrap();
        assert_eq!(record.state(), ExplanationState::Pending);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(pipeline.record(&record.id).await.unwrap().state(), ExplanationState::Pending);

        gate.add_permits(1);
        pipeline.shutdown().await;
        assert_eq!(pipeline.record(&record.id).await.unwrap().state(), ExplanationState::Complete);
    }

    #[tokio::test]
    async fn unrecordable_dispatch_failure_still_returns_the_record() {
        let temp_root = tempfile::tempdir().unwrap();
        let store = Arc::new(NoFailureMarks(InMemoryScanStore::new()));
        let pool = Arc::new(JobPool::start(Arc::new(InstantExplainer), store.clone(), &jobs(temp_root.path())));
        let classes = ClassSet::from_config(&AppConfig::default().model);
        let pipeline = ScanPipeline::new(melanoma_oracle(), classes, store.clone(), pool, FailurePolicy::Reject);
        pipeline.shutdown().await;

        let record = pipeline.submit(png(), BTreeMap::new()).await.unwrap();
        assert!(record.prediction.is_classified());
        assert!(matches!(record.state(), ExplanationState::Failed { ref reason } if reason.contains("shut down")));
        assert!(store.get(&record.id).await.is_ok());
    }
}
