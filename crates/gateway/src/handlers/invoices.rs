//! Invoice indexing handler

use axum::{
    extract::{Path, State},
    Json,
};
use serde::{Deserialize, Serialize};

use crate::AppState;
use invoiceqa_common::{
    errors::{AppError, Result},
    index::documents_for_invoice,
};

#[derive(Debug, Serialize, Deserialize)]
pub struct ReindexResponse {
    pub order_id: String,
    pub documents: usize,
}

/// Rebuild the semantic index documents of one invoice
pub async fn reindex_invoice(
    State(state): State<AppState>,
    Path(order_id): Path<String>,
) -> Result<Json<ReindexResponse>> {
    if order_id.is_empty() || !order_id.bytes().all(|b| b.is_ascii_digit()) {
        return Err(AppError::Validation {
            message: format!("order id '{}' is not numeric", order_id),
            field: Some("order_id".to_string()),
        });
    }

    let (invoice, line_items) = state
        .repository
        .find_invoice_by_order_id(&order_id)
        .await?
        .ok_or_else(|| AppError::NotFound {
            resource_type: "invoice".to_string(),
            id: order_id.clone(),
        })?;

    let documents = state
        .indexer
        .index_documents(documents_for_invoice(&invoice, &line_items))
        .await?;

    tracing::info!(order_id = %order_id, documents, "Invoice reindexed");

    Ok(Json(ReindexResponse { order_id, documents }))
}
