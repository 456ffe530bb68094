use std::collections::BTreeMap;
use std::sync::Arc;

use axum::extract::{DefaultBodyLimit, Multipart, Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use bytes::Bytes;
use dermaxplain::config::ServerSection;
use dermaxplain::error::{ScanError, StoreError};
use dermaxplain::{ExplanationArtifacts, ExplanationState, LocalExplainer, ScanId, ScanPipeline, ScanRecord};
use serde::Serialize;
use tracing::{error, info, warn};

/// Name of the multipart field carrying the image, on both `/scan/classify` and `/explain`.
pub const UPLOAD_FIELD: &str = "file";

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_addr: String,
    pub max_upload_bytes: usize,
}

impl From<&ServerSection> for ServerConfig {
    fn from(section: &ServerSection) -> Self {
        Self {
            bind_addr: section.bind_addr.clone(),
            max_upload_bytes: section.max_upload_bytes,
        }
    }
}

/// Shared handles for every request.
#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<ScanPipeline>,
    /// Answers `/explain`; delegate requests are always computed in-process.
    pub explainer: Arc<LocalExplainer>,
}

impl AppState {
    pub fn new(pipeline: Arc<ScanPipeline>, explainer: Arc<LocalExplainer>) -> Self {
        Self { pipeline, explainer }
    }
}

/// A record together with its derived explanation state.
#[derive(Debug, Serialize)]
pub struct ScanView {
    #[serde(flatten)]
    pub record: ScanRecord,
    pub explanation_state: ExplanationState,
}

impl From<ScanRecord> for ScanView {
    fn from(record: ScanRecord) -> Self {
        let explanation_state = record.state();
        Self {
            record,
            explanation_state,
        }
    }
}

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    Scan(ScanError),
    Store(StoreError),
}

impl From<ScanError> for ApiError {
    fn from(err: ScanError) -> Self {
        ApiError::Scan(err)
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        ApiError::Store(err)
    }
}

fn store_status(err: &StoreError) -> StatusCode {
    match err {
        StoreError::NotFound(_) => StatusCode::NOT_FOUND,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            ApiError::Scan(err @ ScanError::InvalidImage(_)) => (StatusCode::UNPROCESSABLE_ENTITY, err.to_string()),
            ApiError::Scan(err @ ScanError::ClassificationRejected(_)) => (StatusCode::BAD_GATEWAY, err.to_string()),
            ApiError::Scan(ScanError::Store(err)) | ApiError::Store(err) => (store_status(err), err.to_string()),
        };
        if status.is_server_error() {
            error!(status = status.as_u16(), error = %message, "request failed");
        } else {
            warn!(status = status.as_u16(), error = %message, "request rejected");
        }
        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}

/// Splits a multipart body into the image bytes and the remaining text fields.
async fn read_upload(mut multipart: Multipart) -> Result<(Bytes, BTreeMap<String, String>), ApiError> {
    let mut image = None;
    let mut metadata = BTreeMap::new();
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|err| ApiError::BadRequest(err.to_string()))?
    {
        let name = field.name().unwrap_or_default().to_string();
        if name == UPLOAD_FIELD {
            image = Some(field.bytes().await.map_err(|err| ApiError::BadRequest(err.to_string()))?);
        } else if !name.is_empty() {
            let value = field.text().await.map_err(|err| ApiError::BadRequest(err.to_string()))?;
            metadata.insert(name, value);
        }
    }
    let image = image.ok_or_else(|| ApiError::BadRequest(format!("missing multipart field `{UPLOAD_FIELD}`")))?;
    Ok((image, metadata))
}

async fn classify(State(state): State<AppState>, multipart: Multipart) -> Result<Json<ScanView>, ApiError> {
    let (image, metadata) = read_upload(multipart).await?;
    let record = state.pipeline.submit(image.to_vec(), metadata).await?;
    Ok(Json(record.into()))
}

async fn get_scan(State(state): State<AppState>, Path(raw_id): Path<String>) -> Result<Json<ScanView>, ApiError> {
    let id = ScanId::parse(&raw_id).ok_or_else(|| ApiError::Store(StoreError::NotFound(raw_id.clone())))?;
    let record = state.pipeline.record(&id).await?;
    Ok(Json(record.into()))
}

async fn explain(State(state): State<AppState>, multipart: Multipart) -> Result<Json<ExplanationArtifacts>, ApiError> {
    let (image, _) = read_upload(multipart).await?;
    let artifacts = state.explainer.explain_bytes(image.to_vec(), None).await;
    info!(
        shap = artifacts.shap_base64.is_some(),
        occlusion = artifacts.occlusion_base64.is_some(),
        "delegate request answered"
    );
    Ok(Json(artifacts))
}

pub fn build_router(state: AppState, max_upload_bytes: usize) -> Router {
    Router::new()
        .route("/healthz", get(|| async { "ok" }))
        .route("/scan/classify", post(classify))
        .route("/scan/:id", get(get_scan))
        .route("/explain", post(explain))
        .layer(DefaultBodyLimit::max(max_upload_bytes))
        .with_state(state)
}

/// Binds the listener and serves the API on a background task.
pub async fn start_server(state: AppState, cfg: ServerConfig) -> anyhow::Result<tokio::task::JoinHandle<()>> {
    let listener = tokio::net::TcpListener::bind(&cfg.bind_addr).await?;
    let local_addr = listener.local_addr()?;
    let app = build_router(state, cfg.max_upload_bytes);

    let server = tokio::spawn(async move {
        info!("DermaXplain server listening on http://{}", local_addr);
        if let Err(err) = axum::serve(listener, app).await {
            error!(error = %err, "server stopped");
        }
    });

    Ok(server)
}
