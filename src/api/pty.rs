//! Polling transport for the interactive terminal.
//!
//! Input is posted base64-encoded and forwarded in arrival order. Output is
//! fetched by chunk offset; a client that re-requests an offset receives the
//! same chunks again.

use axum::Json;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{ApiError, AppState};

/// Keystrokes for a session's terminal.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PtyInput {
    /// Target session.
    pub session_id: Uuid,
    /// Base64 of the raw bytes.
    pub data_b64: String,
}

/// Query of the output endpoint.
#[derive(Clone, Copy, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PtyOutputQuery {
    /// Target session.
    pub session_id: Uuid,
    /// First chunk the caller has not seen yet.
    #[serde(default)]
    pub offset: usize,
}

/// A page of terminal output.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct PtyOutputPage {
    /// Base64 chunks at or after the requested offset.
    pub chunks: Vec<String>,
    /// Offset to request next.
    pub next: usize,
}

pub(super) async fn input(
    State(state): State<AppState>,
    Json(body): Json<PtyInput>,
) -> Result<StatusCode, ApiError> {
    let bytes = STANDARD
        .decode(body.data_b64.as_bytes())
        .map_err(|err| ApiError::BadRequest(format!("dataB64 is not valid base64: {err}")))?;
    let session = state.session(&body.session_id)?;
    if !bytes.is_empty() {
        session.send_terminal_input(bytes).await?;
    }
    Ok(StatusCode::NO_CONTENT)
}

pub(super) async fn output(
    State(state): State<AppState>,
    Query(query): Query<PtyOutputQuery>,
) -> Result<Json<PtyOutputPage>, ApiError> {
    let (chunks, next) = state.session(&query.session_id)?.pty_chunks_since(query.offset);
    Ok(Json(PtyOutputPage {
        chunks: chunks.iter().map(|chunk| STANDARD.encode(chunk)).collect(),
        next,
    }))
}
