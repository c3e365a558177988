//! Question answering handler

use axum::{extract::State, Json};
use serde::{Deserialize, Serialize};
use std::time::Instant;
use validator::Validate;

use super::parse_session_id;
use crate::AppState;
use invoiceqa_common::{
    engine::SessionId,
    errors::{AppError, Result},
};

/// Ask request
#[derive(Debug, Deserialize, Validate)]
pub struct AskRequest {
    #[validate(length(min = 1, max = 2000))]
    pub question: String,

    /// Continue an existing conversation; a new one is started when absent
    #[serde(default)]
    pub session_id: Option<String>,

    /// Restrict answers to one user's invoices
    #[serde(default)]
    pub user_id: Option<i32>,
}

/// Ask response
#[derive(Debug, Serialize, Deserialize)]
pub struct AskResponse {
    pub session_id: String,
    pub answer: String,
    pub citations: Vec<String>,
    pub processing_time_ms: u64,
}

/// Answer one question within a conversation
pub async fn ask(
    State(state): State<AppState>,
    Json(request): Json<AskRequest>,
) -> Result<Json<AskResponse>> {
    let start = Instant::now();

    request.validate().map_err(|e| AppError::Validation {
        message: e.to_string(),
        field: Some("question".to_string()),
    })?;

    let session_id = match request.session_id.as_deref() {
        Some(raw) => parse_session_id(raw)?,
        None => SessionId::generate(),
    };

    let answer = state
        .engine
        .answer_question_scoped(&request.question, &session_id, request.user_id)
        .await?;

    let processing_time_ms = start.elapsed().as_millis() as u64;

    tracing::info!(
        session_id = %session_id,
        citations = answer.citations.len(),
        latency_ms = processing_time_ms,
        "Question answered"
    );

    Ok(Json(AskResponse {
        session_id: session_id.to_string(),
        answer: answer.text,
        citations: answer.citations,
        processing_time_ms,
    }))
}
