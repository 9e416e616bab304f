use std::net::SocketAddr;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tracing::info;
use uuid::Uuid;

use crate::errors::{ChainError, ChainResult};
use crate::node::{ConsensusStatus, MempoolStatus, NodeHandle, NodeStatus};
use crate::types::{Address, PendingBlock, Transaction, Vote};

#[derive(Clone)]
struct AppState {
    node: NodeHandle,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

#[derive(Serialize)]
struct SubmitResponse {
    hash: String,
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    address: Address,
}

/// Wire envelope for pushed entities: the entity hash plus its hex-encoded
/// RLP body.
#[derive(Deserialize)]
struct EntityEnvelope {
    hash: String,
    body: String,
}

#[derive(Deserialize)]
struct ConnectionRequest {
    session_id: Uuid,
}

#[derive(Serialize)]
struct ConnectionResponse {
    session_id: Uuid,
    address: Address,
}

#[derive(Serialize)]
struct BlockResponse {
    hash: String,
    number: u64,
    prev_hash: String,
    state_root: String,
    receipt_root: String,
    tx_root: String,
}

impl From<&PendingBlock> for BlockResponse {
    fn from(block: &PendingBlock) -> Self {
        Self {
            hash: hex::encode_upper(block.hash),
            number: block.number,
            prev_hash: hex::encode_upper(block.prev_hash),
            state_root: hex::encode_upper(block.state_root),
            receipt_root: hex::encode_upper(block.receipt_root),
            tx_root: hex::encode_upper(block.tx_root),
        }
    }
}

pub async fn serve(node: NodeHandle, addr: SocketAddr) -> ChainResult<()> {
    let state = AppState { node };
    let router = Router::new()
        .route("/health", get(health))
        .route("/status/node", get(node_status))
        .route("/status/mempool", get(mempool_status))
        .route("/status/consensus", get(consensus_status))
        .route("/blocks/latest", get(latest_block))
        .route(
            "/node_api/v1/temp/pending_transactions",
            post(submit_transaction),
        )
        .route("/node_api/v1/temp/votes", post(submit_vote))
        .route("/node_api/v1/connections", post(connect))
        .with_state(state);

    let listener = TcpListener::bind(addr).await?;
    info!(?addr, "node API listening");
    axum::serve(listener, router)
        .await
        .map_err(|err| ChainError::Io(std::io::Error::new(std::io::ErrorKind::Other, err)))
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        address: state.node.address(),
    })
}

async fn node_status(
    State(state): State<AppState>,
) -> Result<Json<NodeStatus>, (StatusCode, Json<ErrorResponse>)> {
    state.node.node_status().map(Json).map_err(to_http_error)
}

async fn mempool_status(
    State(state): State<AppState>,
) -> Result<Json<MempoolStatus>, (StatusCode, Json<ErrorResponse>)> {
    state.node.mempool_status().map(Json).map_err(to_http_error)
}

async fn consensus_status(
    State(state): State<AppState>,
) -> Result<Json<ConsensusStatus>, (StatusCode, Json<ErrorResponse>)> {
    state
        .node
        .consensus_status()
        .map(Json)
        .map_err(to_http_error)
}

async fn latest_block(
    State(state): State<AppState>,
) -> Result<Json<BlockResponse>, (StatusCode, Json<ErrorResponse>)> {
    match state.node.head_block() {
        Ok(Some(block)) => Ok(Json(BlockResponse::from(&block))),
        Ok(None) => Err(to_http_error(ChainError::NotFound("head block".into()))),
        Err(err) => Err(to_http_error(err)),
    }
}

async fn submit_transaction(
    State(state): State<AppState>,
    Json(envelope): Json<EntityEnvelope>,
) -> Result<Json<SubmitResponse>, (StatusCode, Json<ErrorResponse>)> {
    let tx = decode_envelope(&envelope, Transaction::decode, |tx: &Transaction| tx.hash)
        .map_err(to_http_error)?;
    state
        .node
        .submit_transaction(tx)
        .map(|hash| {
            Json(SubmitResponse {
                hash: hex::encode_upper(hash),
            })
        })
        .map_err(to_http_error)
}

async fn submit_vote(
    State(state): State<AppState>,
    Json(envelope): Json<EntityEnvelope>,
) -> Result<Json<SubmitResponse>, (StatusCode, Json<ErrorResponse>)> {
    let vote =
        decode_envelope(&envelope, Vote::decode, |vote: &Vote| vote.hash).map_err(to_http_error)?;
    state
        .node
        .submit_vote(vote)
        .map(|hash| {
            Json(SubmitResponse {
                hash: hex::encode_upper(hash),
            })
        })
        .map_err(to_http_error)
}

async fn connect(
    State(state): State<AppState>,
    Json(request): Json<ConnectionRequest>,
) -> Result<Json<ConnectionResponse>, (StatusCode, Json<ErrorResponse>)> {
    if request.session_id == state.node.session_id() {
        return Err((
            StatusCode::FORBIDDEN,
            Json(ErrorResponse {
                error: "refusing connection to self".into(),
            }),
        ));
    }
    Ok(Json(ConnectionResponse {
        session_id: state.node.session_id(),
        address: state.node.address(),
    }))
}

fn decode_envelope<T>(
    envelope: &EntityEnvelope,
    decode: impl Fn(&[u8]) -> ChainResult<T>,
    hash_of: impl Fn(&T) -> [u8; 32],
) -> ChainResult<T> {
    let bytes = hex::decode(&envelope.body)
        .map_err(|err| ChainError::MalformedPayload(format!("invalid body hex: {err}")))?;
    let entity = decode(&bytes)?;
    if !envelope.hash.eq_ignore_ascii_case(&hex::encode(hash_of(&entity))) {
        return Err(ChainError::MalformedPayload(
            "envelope hash does not match the decoded entity".into(),
        ));
    }
    Ok(entity)
}

fn to_http_error(err: ChainError) -> (StatusCode, Json<ErrorResponse>) {
    let status = match &err {
        ChainError::DuplicateHash(_) => StatusCode::CONFLICT,
        ChainError::SenderMismatch { .. } | ChainError::UnknownMiner(_) => StatusCode::FORBIDDEN,
        ChainError::InvalidSignature(_)
        | ChainError::MalformedPayload(_)
        | ChainError::NonceGap { .. }
        | ChainError::InsufficientBalance { .. }
        | ChainError::EmptyTransactionBatch => StatusCode::BAD_REQUEST,
        ChainError::NotFound(_) | ChainError::TrieMissing(_) => StatusCode::NOT_FOUND,
        ChainError::MempoolFull => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (
        status,
        Json(ErrorResponse {
            error: err.to_string(),
        }),
    )
}
