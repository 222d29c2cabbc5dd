/// Unified error types for the BPN directory server
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Main error type for the directory server
#[derive(Error, Debug)]
pub enum BdrsError {
    /// Malformed input, rejected before any side effect
    #[error("Invalid input: {0}")]
    Validation(String),

    /// No current record for the key
    #[error("Not found: {0}")]
    NotFound(String),

    /// Create on an existing key
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// Optimistic-concurrency loss
    #[error("Version conflict for {bpn}: expected version {expected}, current version {current}")]
    VersionConflict {
        bpn: String,
        expected: i64,
        current: i64,
    },

    /// Credential missing or failed verification
    #[error("Authentication failed: {0}")]
    Unauthorized(String),

    /// Verified caller lacks the required scope
    #[error("Not authorized: {0}")]
    Forbidden(String),

    /// Transient infrastructure failure
    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    /// Cache could not be brought in line with the store (non-fatal)
    #[error("Cache inconsistency: {0}")]
    CacheInconsistency(String),

    /// Non-transient database errors
    #[error("Database error: {0}")]
    Database(sqlx::Error),

    /// Internal server errors
    #[error("Internal error: {0}")]
    Internal(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl BdrsError {
    /// Machine-readable error code carried in every non-2xx response
    pub fn code(&self) -> &'static str {
        match self {
            BdrsError::Validation(_) => "INVALID_INPUT",
            BdrsError::NotFound(_) => "NOT_FOUND",
            BdrsError::AlreadyExists(_) => "ALREADY_EXISTS",
            BdrsError::VersionConflict { .. } => "VERSION_CONFLICT",
            BdrsError::Unauthorized(_) => "UNAUTHORIZED",
            BdrsError::Forbidden(_) => "FORBIDDEN",
            BdrsError::StoreUnavailable(_) => "STORE_UNAVAILABLE",
            BdrsError::CacheInconsistency(_)
            | BdrsError::Database(_)
            | BdrsError::Internal(_)
            | BdrsError::Io(_) => "INTERNAL_ERROR",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            BdrsError::Validation(_) => StatusCode::BAD_REQUEST,
            BdrsError::NotFound(_) => StatusCode::NOT_FOUND,
            BdrsError::AlreadyExists(_) | BdrsError::VersionConflict { .. } => {
                StatusCode::CONFLICT
            }
            BdrsError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            BdrsError::Forbidden(_) => StatusCode::FORBIDDEN,
            BdrsError::StoreUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            BdrsError::CacheInconsistency(_)
            | BdrsError::Database(_)
            | BdrsError::Internal(_)
            | BdrsError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Whether the engine may retry the failed store call
    pub fn is_transient(&self) -> bool {
        matches!(self, BdrsError::StoreUnavailable(_))
    }
}

/// Classify sqlx failures: pool exhaustion, I/O and SQLite busy/locked
/// conditions are transient, everything else is a hard database error.
impl From<sqlx::Error> for BdrsError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::Io(_)
            | sqlx::Error::WorkerCrashed => BdrsError::StoreUnavailable(err.to_string()),
            sqlx::Error::Database(db_err) => {
                // SQLITE_BUSY (5) and SQLITE_LOCKED (6), including extended codes
                let transient = db_err
                    .code()
                    .and_then(|code| code.parse::<i32>().ok())
                    .map(|code| matches!(code & 0xff, 5 | 6))
                    .unwrap_or(false);
                if transient {
                    BdrsError::StoreUnavailable(err.to_string())
                } else {
                    BdrsError::Database(err)
                }
            }
            _ => BdrsError::Database(err),
        }
    }
}

/// Error response body
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}

/// Convert BdrsError to HTTP response
impl IntoResponse for BdrsError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = if status.is_server_error() && status != StatusCode::SERVICE_UNAVAILABLE {
            tracing::error!(error = %self, "request failed");
            "Internal server error".to_string() // Don't leak details
        } else {
            self.to_string()
        };

        let body = Json(ErrorResponse {
            error: self.code().to_string(),
            message,
        });

        (status, body).into_response()
    }
}

/// Result type alias for directory operations
pub type BdrsResult<T> = Result<T, BdrsError>;
