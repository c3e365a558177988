//! Session management handlers

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};

use super::parse_session_id;
use crate::AppState;
use invoiceqa_common::{engine::ConversationTurn, errors::Result};

/// Session history response
#[derive(Debug, Serialize, Deserialize)]
pub struct HistoryResponse {
    pub session_id: String,
    pub turns: Vec<ConversationTurn>,
}

/// Turns of a session, oldest first
pub async fn get_history(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<Json<HistoryResponse>> {
    let session_id = parse_session_id(&session_id)?;
    let turns = state.engine.sessions().history(&session_id).await?;

    Ok(Json(HistoryResponse {
        session_id: session_id.to_string(),
        turns,
    }))
}

/// End a session and discard its memory
pub async fn end_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<StatusCode> {
    let session_id = parse_session_id(&session_id)?;
    state.engine.sessions().end_session(&session_id).await?;

    tracing::info!(session_id = %session_id, "Session ended");

    Ok(StatusCode::NO_CONTENT)
}
