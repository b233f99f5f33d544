//! Error taxonomy (spec §7).
//! Kinds, not type names: each variant maps to one recovery policy and one
//! client-visible shape. Handlers at the dispatcher boundary convert into
//! this; nothing upstream should invent its own ad-hoc HTTP status.

use axum::{http::StatusCode, response::IntoResponse, response::Response, Json};
use serde_json::json;

#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("transient failure: {0}")]
    Transient(String),

    #[error("validation failed: {field}: {reason}")]
    Validation { field: String, reason: String },

    #[error("broker disconnected")]
    Disconnected,

    #[error("model non-compliant: {0}")]
    Compliance(String),

    #[error("rate limited: bucket {bucket}")]
    RateLimited { bucket: String, retry_after_secs: u64 },

    #[error("risk veto: {0}")]
    RiskVeto(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("fatal: {0}")]
    Fatal(String),
}

impl BridgeError {
    pub fn validation(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Validation {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

impl From<rusqlite::Error> for BridgeError {
    fn from(e: rusqlite::Error) -> Self {
        BridgeError::Storage(e.to_string())
    }
}

impl From<crate::broker::BrokerGatewayError> for BridgeError {
    fn from(e: crate::broker::BrokerGatewayError) -> Self {
        use crate::broker::BrokerGatewayError as E;
        match e {
            E::Disconnected | E::ConnectionRefused => BridgeError::Disconnected,
            E::Timeout => BridgeError::Transient(e.to_string()),
            E::VersionMismatch { .. } | E::Fatal { .. } => BridgeError::Fatal(e.to_string()),
        }
    }
}

impl IntoResponse for BridgeError {
    fn into_response(self) -> Response {
        let (status, body) = match &self {
            BridgeError::Transient(msg) => (
                StatusCode::SERVICE_UNAVAILABLE,
                json!({"error": "transient", "message": msg}),
            ),
            BridgeError::Validation { field, reason } => (
                StatusCode::BAD_REQUEST,
                json!({"error": "validation", "field": field, "reason": reason}),
            ),
            BridgeError::Disconnected => (
                StatusCode::SERVICE_UNAVAILABLE,
                json!({"error": "broker_down", "message": "broker session disconnected"}),
            ),
            BridgeError::Compliance(msg) => (
                StatusCode::OK,
                json!({"error": "compliance", "message": msg}),
            ),
            BridgeError::RateLimited {
                bucket,
                retry_after_secs,
            } => (
                StatusCode::TOO_MANY_REQUESTS,
                json!({"error": "rate_limited", "bucket": bucket, "retry_after_seconds": retry_after_secs}),
            ),
            BridgeError::RiskVeto(reason) => (
                StatusCode::OK,
                json!({"allowed": false, "reason": reason}),
            ),
            BridgeError::Storage(msg) => {
                tracing::error!(error = %msg, "storage error, operator paged");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    json!({"error": "storage", "message": "internal storage failure"}),
                )
            }
            BridgeError::Fatal(msg) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                json!({"error": "fatal", "message": msg}),
            ),
        };
        (status, Json(body)).into_response()
    }
}

pub type BridgeResult<T> = Result<T, BridgeError>;
