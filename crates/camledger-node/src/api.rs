//! HTTP surface of the node. Producers post transactions, operators read
//! status, verify, export/import and trigger the recovery actions.

use std::path::{Path as FsPath, PathBuf};
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use camledger_core::{
    Block, BlockchainManager, BlockchainStatus, Hash, HealthState, Ingested, IntegrityReport,
    LedgerError, Payload, TransactionProof,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::constants::MAX_BLOCKS_PER_REQUEST;

pub(crate) type SharedLedger = Arc<Mutex<BlockchainManager>>;

#[derive(Clone)]
pub(crate) struct AppState {
    pub(crate) ledger: SharedLedger,
    /// Canonical directory that `path` payloads must resolve into. `None`
    /// refuses path payloads.
    pub(crate) capture_dir: Option<Arc<PathBuf>>,
}

pub(crate) fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/status", get(status))
        .route("/verify", get(verify))
        .route("/blocks/current", get(current_block))
        .route("/blocks/{number}", get(block_by_number))
        .route("/blocks/hash/{hash}", get(block_by_hash))
        .route("/proof/{data_hash}", get(proof))
        .route("/export", get(export))
        .route("/import", post(import))
        .route("/tx/image", post(tx_image))
        .route("/tx/detection", post(tx_detection))
        .route("/tx/sensor", post(tx_sensor))
        .route("/tx/event", post(tx_event))
        .route("/block", post(create_block))
        .route("/admin/clear", post(admin_clear))
        .route("/admin/reinit", post(admin_reinit))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// -- errors -----------------------------------------------------------------

#[derive(Debug)]
pub(crate) enum ApiError {
    Ledger(LedgerError),
    NotFound(String),
    BadRequest(String),
    Forbidden(String),
}

impl From<LedgerError> for ApiError {
    fn from(err: LedgerError) -> Self {
        ApiError::Ledger(err)
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
    kind: &'static str,
}

fn status_for(err: &LedgerError) -> StatusCode {
    match err {
        LedgerError::Config(_) | LedgerError::Parse(_) | LedgerError::Validation(_) => {
            StatusCode::BAD_REQUEST
        }
        LedgerError::Capacity(_) | LedgerError::State(_) => StatusCode::CONFLICT,
        LedgerError::NotInitialized => StatusCode::SERVICE_UNAVAILABLE,
        LedgerError::Integrity(_) | LedgerError::Io { .. } => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body) = match self {
            ApiError::Ledger(err) => (
                status_for(&err),
                ErrorBody {
                    error: err.to_string(),
                    kind: err.kind(),
                },
            ),
            ApiError::NotFound(what) => (
                StatusCode::NOT_FOUND,
                ErrorBody {
                    error: format!("{what} not found"),
                    kind: "not_found",
                },
            ),
            ApiError::BadRequest(error) => (
                StatusCode::BAD_REQUEST,
                ErrorBody {
                    error,
                    kind: "bad_request",
                },
            ),
            ApiError::Forbidden(error) => (
                StatusCode::FORBIDDEN,
                ErrorBody {
                    error,
                    kind: "forbidden",
                },
            ),
        };
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

// -- request / response bodies ----------------------------------------------

/// Where the hashed data comes from: exactly one of a precomputed digest, a
/// file under the node's capture directory, or inline text.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct PayloadIn {
    data_hash: Option<String>,
    /// Size in bytes of the data behind `dataHash`.
    #[serde(default)]
    size: u64,
    path: Option<PathBuf>,
    text: Option<String>,
    #[serde(default)]
    metadata: Value,
}

impl PayloadIn {
    /// Resolve `path` inside the capture directory. Anything that does not
    /// canonicalize to a location under it gets the same refusal, so callers
    /// learn nothing about files elsewhere.
    fn capture_file(&self, capture_dir: Option<&FsPath>) -> Result<Option<PathBuf>, ApiError> {
        let Some(path) = &self.path else {
            return Ok(None);
        };
        let Some(root) = capture_dir else {
            return Err(ApiError::Forbidden(
                "path payloads are disabled on this node".into(),
            ));
        };
        let refused = || {
            ApiError::Forbidden(format!(
                "{} is not a readable file in the capture directory",
                path.display()
            ))
        };
        let full = root.join(path).canonicalize().map_err(|_| refused())?;
        if !full.starts_with(root) || !full.is_file() {
            warn!(path = %path.display(), "refused path payload outside capture directory");
            return Err(refused());
        }
        Ok(Some(full))
    }

    fn payload<'a>(&'a self, file: Option<&'a FsPath>) -> Result<Payload<'a>, ApiError> {
        match (&self.data_hash, file, &self.text) {
            (Some(hex), None, None) => Ok(Payload::Digest {
                hex,
                size: self.size,
            }),
            (None, Some(path), None) => Ok(Payload::File(path)),
            (None, None, Some(text)) => Ok(Payload::Bytes(text.as_bytes())),
            _ => Err(ApiError::BadRequest(
                "exactly one of dataHash, path or text is required".into(),
            )),
        }
    }
}

/// Metadata may be posted as a JSON object or as ready-made text.
fn metadata_text(value: &Value) -> String {
    match value {
        Value::Null => "{}".into(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct DetectionIn {
    #[serde(flatten)]
    payload: PayloadIn,
    confidence: f32,
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "lowercase")]
pub(crate) enum EventKind {
    System,
    Power,
    Network,
}

#[derive(Debug, Deserialize)]
pub(crate) struct EventIn {
    kind: EventKind,
    event: String,
    #[serde(default)]
    metadata: Value,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct ExportQuery {
    start: Option<u32>,
    end: Option<u32>,
}

#[derive(Debug, Serialize)]
pub(crate) struct HealthOut {
    status: &'static str,
    state: HealthState,
    healthy: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct SealedOut {
    block_number: u32,
    block_hash: Hash,
}

// -- handlers -----------------------------------------------------------------

async fn health(State(state): State<AppState>) -> Json<HealthOut> {
    let health = state.ledger.lock().await.health();
    let status = match health {
        HealthState::Healthy => "ok",
        HealthState::Degraded => "degraded",
        HealthState::Uninitialized => "uninitialized",
    };
    Json(HealthOut {
        status,
        state: health,
        healthy: health == HealthState::Healthy,
    })
}

async fn status(State(state): State<AppState>) -> Json<BlockchainStatus> {
    Json(state.ledger.lock().await.status())
}

async fn verify(State(state): State<AppState>) -> ApiResult<IntegrityReport> {
    Ok(Json(state.ledger.lock().await.verify_integrity()?))
}

async fn current_block(State(state): State<AppState>) -> ApiResult<Block> {
    let ledger = state.ledger.lock().await;
    let block = ledger.current_block().ok_or(LedgerError::NotInitialized)?;
    Ok(Json(block.clone()))
}

async fn block_by_number(
    State(state): State<AppState>,
    Path(number): Path<u32>,
) -> ApiResult<Block> {
    let block = state.ledger.lock().await.get_block(number)?;
    block
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("block {number}")))
}

async fn block_by_hash(State(state): State<AppState>, Path(hash): Path<String>) -> ApiResult<Block> {
    let hash = Hash::from_hex(&hash)?;
    let block = state.ledger.lock().await.get_block_by_hash(&hash)?;
    block
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("block {}", hash.short())))
}

async fn proof(
    State(state): State<AppState>,
    Path(data_hash): Path<String>,
) -> ApiResult<TransactionProof> {
    let data_hash = Hash::from_hex(&data_hash)?;
    let proof = state.ledger.lock().await.prove_transaction(&data_hash)?;
    proof
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("transaction {}", data_hash.short())))
}

async fn export(
    State(state): State<AppState>,
    Query(query): Query<ExportQuery>,
) -> Result<Response, ApiError> {
    let ledger = state.ledger.lock().await;
    let tip = ledger
        .latest_block()
        .map(Block::number)
        .ok_or(LedgerError::NotInitialized)?;
    let start = query.start.unwrap_or(0);
    let end = query.end.unwrap_or(tip);
    if end >= start && end - start >= MAX_BLOCKS_PER_REQUEST {
        return Err(ApiError::BadRequest(format!(
            "at most {MAX_BLOCKS_PER_REQUEST} blocks per export, narrow start/end"
        )));
    }
    let doc = ledger.export_chain(Some(start..=end))?;
    Ok(([(header::CONTENT_TYPE, "application/json")], doc).into_response())
}

async fn import(State(state): State<AppState>, body: String) -> ApiResult<IntegrityReport> {
    let report = state.ledger.lock().await.import_chain(&body)?;
    info!(
        blocks = report.blocks_checked,
        mismatches = report.mismatches(),
        "chain imported over http"
    );
    Ok(Json(report))
}

async fn tx_image(State(state): State<AppState>, Json(body): Json<PayloadIn>) -> ApiResult<Ingested> {
    let file = body.capture_file(state.capture_dir.as_deref().map(PathBuf::as_path))?;
    let payload = body.payload(file.as_deref())?;
    let metadata = metadata_text(&body.metadata);
    let outcome = state
        .ledger
        .lock()
        .await
        .add_image_transaction(payload, &metadata)?;
    Ok(Json(outcome))
}

async fn tx_detection(
    State(state): State<AppState>,
    Json(body): Json<DetectionIn>,
) -> ApiResult<Ingested> {
    let file = body
        .payload
        .capture_file(state.capture_dir.as_deref().map(PathBuf::as_path))?;
    let payload = body.payload.payload(file.as_deref())?;
    let metadata = metadata_text(&body.payload.metadata);
    let outcome = state.ledger.lock().await.add_ai_detection_transaction(
        payload,
        body.confidence,
        &metadata,
    )?;
    Ok(Json(outcome))
}

async fn tx_sensor(State(state): State<AppState>, Json(body): Json<PayloadIn>) -> ApiResult<Ingested> {
    let file = body.capture_file(state.capture_dir.as_deref().map(PathBuf::as_path))?;
    let payload = body.payload(file.as_deref())?;
    let metadata = metadata_text(&body.metadata);
    let outcome = state
        .ledger
        .lock()
        .await
        .add_sensor_transaction(payload, &metadata)?;
    Ok(Json(outcome))
}

async fn tx_event(State(state): State<AppState>, Json(body): Json<EventIn>) -> ApiResult<Ingested> {
    let metadata = metadata_text(&body.metadata);
    let mut ledger = state.ledger.lock().await;
    let outcome = match body.kind {
        EventKind::System => ledger.add_system_event(&body.event, &metadata)?,
        EventKind::Power => ledger.add_power_event(&body.event, &metadata)?,
        EventKind::Network => ledger.add_network_event(&body.event, &metadata)?,
    };
    Ok(Json(outcome))
}

async fn create_block(State(state): State<AppState>) -> ApiResult<SealedOut> {
    let mut ledger = state.ledger.lock().await;
    let block_hash = ledger.create_block()?;
    let block_number = ledger
        .latest_block()
        .map(Block::number)
        .ok_or(LedgerError::NotInitialized)?;
    Ok(Json(SealedOut {
        block_number,
        block_hash,
    }))
}

async fn admin_clear(State(state): State<AppState>) -> ApiResult<BlockchainStatus> {
    let mut ledger = state.ledger.lock().await;
    warn!("operator requested chain clear");
    ledger.clear_chain()?;
    Ok(Json(ledger.status()))
}

async fn admin_reinit(State(state): State<AppState>) -> ApiResult<BlockchainStatus> {
    let mut ledger = state.ledger.lock().await;
    info!("operator requested reinitialize");
    ledger.reinitialize()?;
    Ok(Json(ledger.status()))
}
