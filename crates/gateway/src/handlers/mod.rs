//! API handlers module

pub mod ask;
pub mod health;
pub mod invoices;
pub mod sessions;

use invoiceqa_common::{engine::SessionId, errors::AppError};
use std::str::FromStr;

/// Parse a session id taken from a path or body
pub(crate) fn parse_session_id(raw: &str) -> Result<SessionId, AppError> {
    SessionId::from_str(raw).map_err(|e| match e {
        AppError::Validation { message, .. } => AppError::Validation {
            message,
            field: Some("session_id".to_string()),
        },
        other => other,
    })
}
