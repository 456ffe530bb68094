// THEORY:
// The job pool runs explanation jobs out-of-band of the classification request.
// A single bounded channel feeds a small, fixed set of tokio worker tasks; the
// request path only ever does a non-blocking `try_send`, so a burst of uploads
// can fill the queue but never stall a response.
//
// Key architectural principles:
// 1.  **Bounded on both ends**: `workers` caps how many jobs run at once (each
//     job already fans out into two CPU-heavy engines), and `queue_capacity` caps
//     how many wait. A full queue is reported to the caller, who records it as a
//     terminal failure instead of dropping the job silently.
// 2.  **One job, one workspace**: every job gets its own uniquely named
//     `TempDir`. It is an RAII value, so it is removed on every exit path,
//     including a panic unwinding through the job.
// 3.  **Workers outlive jobs**: each job runs under `catch_unwind`. A panicking
//     explainer costs that job its artifacts, not the worker.
// 4.  **Versioned writes**: `run_job` opens a new job generation in the store and
//     tags every write with it, so a superseded job can finish late without
//     corrupting the record.
// 5.  **Store as they arrive**: artifacts announced by the explainer while it is
//     still running are written right away; whatever was not announced is
//     written from the final result.

use crate::config::JobsSection;
use crate::core_modules::explainer::{ArtifactSender, ExplanationArtifacts, Explainer};
use crate::core_modules::oracle::Classification;
use crate::core_modules::scan_store::{EngineKind, ScanId, ScanStore};
use crate::error::DispatchError;
use futures::FutureExt;
use std::collections::BTreeSet;
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

const WORKSPACE_PREFIX: &str = "dermaxplain-job-";
const SOURCE_FILE_NAME: &str = "source.img";

/// One unit of asynchronous explanation work.
#[derive(Debug, Clone)]
pub struct ExplanationJob {
    pub scan_id: ScanId,
    pub image_bytes: Vec<u8>,
    pub baseline: Classification,
}

/// How a job ended, as seen by the orchestrator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    /// At least one artifact was stored.
    Completed { job_version: u64, artifacts: usize },
    /// A newer job started for the same scan before this one could write.
    Superseded { job_version: u64 },
    /// Nothing was stored; the record carries the reason.
    Failed { reason: String },
}

/// Executes one explanation job against the store. Never returns an error.
pub async fn run_job(explainer: &dyn Explainer, store: &dyn ScanStore, temp_root: &Path, job: ExplanationJob) -> JobOutcome {
    let ExplanationJob {
        scan_id,
        image_bytes,
        baseline,
    } = job;

    let version = match store.begin_job(&scan_id).await {
        Ok(version) => version,
        Err(err) => {
            warn!(scan_id = %scan_id, error = %err, "could not open a job generation, dropping job");
            return JobOutcome::Failed {
                reason: err.to_string(),
            };
        }
    };
    if let Classification::Classified { code, confidence, .. } = &baseline {
        info!(scan_id = %scan_id, job_version = version, class = %code, confidence, "explanation job started");
    } else {
        info!(scan_id = %scan_id, job_version = version, "explanation job started");
    }

    let (ready, mut arrivals) = mpsc::unbounded_channel();
    let produce = explain_in_workspace(explainer, &scan_id, version, temp_root, &image_bytes, ready);
    let consume = async {
        let mut written = BTreeSet::new();
        let mut superseded = false;
        while let Some((engine, encoded)) = arrivals.recv().await {
            if superseded {
                continue;
            }
            match store_artifact(store, &scan_id, version, engine, encoded).await {
                Some(true) => {
                    written.insert(engine);
                }
                Some(false) => superseded = true,
                None => {}
            }
        }
        (written, superseded)
    };
    let (artifacts, (mut written, superseded)) = tokio::join!(produce, consume);
    if superseded {
        return JobOutcome::Superseded { job_version: version };
    }

    for engine in EngineKind::ALL {
        if written.contains(&engine) {
            continue;
        }
        let Some(encoded) = artifacts.get(engine) else {
            continue;
        };
        match store_artifact(store, &scan_id, version, engine, encoded.clone()).await {
            Some(true) => {
                written.insert(engine);
            }
            Some(false) => return JobOutcome::Superseded { job_version: version },
            None => {}
        }
    }
    let written = written.len();

    let reason = artifacts
        .errors
        .iter()
        .map(|(engine, err)| format!("{engine}: {err}"))
        .collect::<Vec<_>>()
        .join("; ");
    match store.finish_job(&scan_id, version, artifacts.errors).await {
        Ok(false) => return JobOutcome::Superseded { job_version: version },
        Ok(true) => {}
        Err(err) => warn!(scan_id = %scan_id, error = %err, "job completion could not be recorded"),
    }

    info!(scan_id = %scan_id, job_version = version, artifacts = written, "explanation job finished");
    if written == 0 {
        JobOutcome::Failed {
            reason: if reason.is_empty() {
                "no explanation artifacts were produced".to_string()
            } else {
                reason
            },
        }
    } else {
        JobOutcome::Completed {
            job_version: version,
            artifacts: written,
        }
    }
}

/// Runs the explainer in a fresh workspace, which is removed before returning.
async fn explain_in_workspace(
    explainer: &dyn Explainer,
    scan_id: &ScanId,
    version: u64,
    temp_root: &Path,
    image_bytes: &[u8],
    ready: ArtifactSender,
) -> ExplanationArtifacts {
    let (workspace, image_path) = match prepare_workspace(temp_root, image_bytes).await {
        Ok(prepared) => prepared,
        Err(err) => {
            warn!(scan_id = %scan_id, error = %err, "job workspace could not be prepared");
            return ExplanationArtifacts::failed(format!("workspace: {err}"));
        }
    };
    let artifacts = match AssertUnwindSafe(explainer.explain_streaming(&image_path, workspace.path(), ready))
        .catch_unwind()
        .await
    {
        Ok(artifacts) => artifacts,
        Err(_) => {
            error!(scan_id = %scan_id, job_version = version, "explainer panicked");
            ExplanationArtifacts::failed("explainer panicked")
        }
    };
    if let Err(err) = workspace.close() {
        warn!(scan_id = %scan_id, error = %err, "job workspace could not be removed");
    }
    artifacts
}

/// `Some(false)` when a newer job owns the record, `None` when the write failed.
async fn store_artifact(store: &dyn ScanStore, scan_id: &ScanId, version: u64, engine: EngineKind, encoded: String) -> Option<bool> {
    match store.set_artifact(scan_id, version, engine, encoded).await {
        Ok(true) => {
            debug!(scan_id = %scan_id, engine = %engine, job_version = version, "artifact stored");
            Some(true)
        }
        Ok(false) => {
            warn!(scan_id = %scan_id, engine = %engine, job_version = version, "stale artifact dropped, a newer job owns this scan");
            Some(false)
        }
        Err(err) => {
            warn!(scan_id = %scan_id, engine = %engine, error = %err, "artifact write failed");
            None
        }
    }
}

async fn prepare_workspace(temp_root: &Path, image_bytes: &[u8]) -> std::io::Result<(tempfile::TempDir, PathBuf)> {
    tokio::fs::create_dir_all(temp_root).await?;
    let workspace = tempfile::Builder::new().prefix(WORKSPACE_PREFIX).tempdir_in(temp_root)?;
    let image_path = workspace.path().join(SOURCE_FILE_NAME);
    tokio::fs::write(&image_path, image_bytes).await?;
    Ok((workspace, image_path))
}

/// Bounded pool of explanation workers fed by one queue.
pub struct JobPool {
    sender: Mutex<Option<mpsc::Sender<ExplanationJob>>>,
    workers: tokio::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl JobPool {
    /// Spawns the workers on the current tokio runtime.
    pub fn start(explainer: Arc<dyn Explainer>, store: Arc<dyn ScanStore>, config: &JobsSection) -> Self {
        let worker_count = config.workers.clamp(1, num_cpus::get().max(1));
        let (sender, receiver) = mpsc::channel::<ExplanationJob>(config.queue_capacity.max(1));
        let receiver = Arc::new(tokio::sync::Mutex::new(receiver));
        let temp_root = config.temp_root();

        let workers = (0..worker_count)
            .map(|worker_id| {
                let receiver = receiver.clone();
                let explainer = explainer.clone();
                let store = store.clone();
                let temp_root = temp_root.clone();
                tokio::spawn(async move {
                    loop {
                        let job = { receiver.lock().await.recv().await };
                        let Some(job) = job else { break };
                        let scan_id = job.scan_id.clone();
                        let run = run_job(explainer.as_ref(), store.as_ref(), &temp_root, job);
                        match AssertUnwindSafe(run).catch_unwind().await {
                            Ok(outcome) => debug!(worker_id, scan_id = %scan_id, ?outcome, "job done"),
                            Err(_) => error!(worker_id, scan_id = %scan_id, "explanation job panicked"),
                        }
                    }
                    debug!(worker_id, "explanation worker stopped");
                })
            })
            .collect();

        info!(workers = worker_count, queue_capacity = config.queue_capacity, "explanation job pool started");
        Self {
            sender: Mutex::new(Some(sender)),
            workers: tokio::sync::Mutex::new(workers),
        }
    }

    /// Queues a job without waiting.
    pub fn dispatch(&self, job: ExplanationJob) -> Result<(), DispatchError> {
        let sender = self
            .sender
            .lock()
            .map_err(|_| DispatchError::Closed)?
            .clone()
            .ok_or(DispatchError::Closed)?;
        sender.try_send(job).map_err(|err| match err {
            TrySendError::Full(_) => DispatchError::QueueFull,
            TrySendError::Closed(_) => DispatchError::Closed,
        })
    }

    /// Stops accepting jobs, drains the queue and waits for every worker.
    pub async fn shutdown(&self) {
        if let Ok(mut sender) = self.sender.lock() {
            sender.take();
        }
        let handles: Vec<_> = self.workers.lock().await.drain(..).collect();
        for handle in handles {
            if let Err(err) = handle.await {
                error!(error = %err, "explanation worker exited abnormally");
            }
        }
        info!("explanation job pool stopped");
    }
}
