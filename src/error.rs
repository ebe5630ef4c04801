use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

use crate::models::UnknownStatus;

#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("stored amount `{value}` is not a decimal: {source}")]
    CorruptAmount {
        value: String,
        #[source]
        source: rust_decimal::Error,
    },

    #[error(transparent)]
    CorruptStatus(#[from] UnknownStatus),

    #[error("stored timestamp `{0}` is not RFC3339")]
    CorruptTimestamp(String),

    #[error("running total for {address} overflowed")]
    Overflow { address: String },

    #[error("ledger connection lock poisoned")]
    Poisoned,

    #[error("ledger task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("ledger unavailable: {0}")]
    Ledger(#[from] LedgerError),

    #[error("disbursement is not configured (PRIVATE_KEY missing)")]
    DisbursementDisabled,
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
    code: &'static str,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = match &self {
            ApiError::Ledger(_) => (StatusCode::INTERNAL_SERVER_ERROR, "LEDGER_ERROR"),
            ApiError::DisbursementDisabled => {
                (StatusCode::SERVICE_UNAVAILABLE, "DISBURSEMENT_DISABLED")
            }
        };

        tracing::error!(error = ?self, code, "Request failed");

        let body = ErrorBody {
            error: self.to_string(),
            code,
        };
        (status, Json(body)).into_response()
    }
}
