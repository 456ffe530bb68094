// THEORY:
// Every fallible boundary in the explanation core has its own error enum. The
// split mirrors the propagation policy: `ImageError` and `ScanError` travel back
// to the caller of the classification path, while `OracleError`, `EngineError`
// and `DelegateError` never leave the explanation job. They are logged and turn
// into an unset artifact field instead.

use thiserror::Error;

/// The uploaded bytes could not be turned into a canonical image.
#[derive(Error, Debug)]
pub enum ImageError {
    #[error("image payload is empty")]
    Empty,

    #[error("image could not be decoded: {0}")]
    Decode(#[from] image::ImageError),

    #[error("image has zero width or height")]
    ZeroSized,
}

/// The classifier failed or produced output that cannot be a probability vector.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum OracleError {
    #[error("inference failed: {0}")]
    Inference(String),

    #[error("expected {expected} class probabilities, got {actual}")]
    WrongArity { expected: usize, actual: usize },

    #[error("probability vector entry at index {0} is not a probability in [0, 1]")]
    NotAProbability(usize),
}

/// An attribution engine could not produce a grid.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("oracle call failed: {0}")]
    Oracle(#[from] OracleError),

    #[error("invalid engine configuration: {0}")]
    Config(String),

    #[error("numerical failure: {0}")]
    Numerical(String),

    #[error("rendering produced no artifact")]
    Render,

    #[error("engine worker aborted: {0}")]
    Aborted(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Image(#[from] ImageError),
}

/// The scan record store rejected or failed an operation.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("scan {0} not found")]
    NotFound(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("record serialization failed: {0}")]
    Serde(#[from] serde_json::Error),
}

/// An explanation job could not be queued.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DispatchError {
    #[error("explanation queue is full")]
    QueueFull,

    #[error("job pool has been shut down")]
    Closed,
}

/// The remote explanation delegate did not return usable artifacts.
#[derive(Error, Debug)]
pub enum DelegateError {
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("delegate answered with status {0}")]
    Status(u16),

    #[error("delegate response could not be decoded: {0}")]
    Decode(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Failures of the synchronous scan submission path.
#[derive(Error, Debug)]
pub enum ScanError {
    #[error("invalid image: {0}")]
    InvalidImage(#[from] ImageError),

    #[error("classification failed: {0}")]
    ClassificationRejected(String),

    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

/// Configuration could not be loaded or is inconsistent.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Configuration error: {0}")]
    Load(#[from] config::ConfigError),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}
