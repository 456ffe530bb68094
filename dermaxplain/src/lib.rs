// THEORY:
// This file is the main entry point for the `dermaxplain` library crate, the
// explanation core of a dermoscopy classification backend. It defines the public
// API consumed by the HTTP server and the command-line tester.
//
// The primary goal is to export `ScanPipeline` (classify now, explain later) and
// the building blocks behind it: the two perturbation-based attribution engines,
// the renderer, the explainer backends, the bounded job pool and the scan record
// store contract. The classifier itself is an injected `Oracle`; the crate never
// owns model weights.
//
// Key architectural principles:
// 1.  **Request path never waits for attribution**: `ScanPipeline::submit`
//     returns once the record is stored and the job is queued.
// 2.  **Explanation failures stay local**: engines, the delegate and the renderer
//     report failures as unset artifact fields, never as errors to the caller.
// 3.  **Latest job wins**: every job owns a store-assigned version, and writes of
//     superseded jobs are dropped.

pub mod config;
pub mod core_modules;
pub mod error;
pub mod job_pool;
pub mod logging;
pub mod pipeline;

pub use config::AppConfig;
pub use core_modules::attribution_grid::AttributionGrid;
pub use core_modules::canonical::CanonicalImage;
pub use core_modules::explainer::{Explainer, ExplainerBackend, ExplanationArtifacts, LocalExplainer};
pub use core_modules::oracle::{ClassSet, Classification, Oracle, PrototypeOracle};
pub use core_modules::scan_store::{EngineKind, ExplanationState, ScanId, ScanRecord, ScanStore};
pub use job_pool::{ExplanationJob, JobOutcome, JobPool, run_job};
pub use pipeline::ScanPipeline;
