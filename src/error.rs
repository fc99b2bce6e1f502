use std::fmt;

use actix_web::http::StatusCode;
use actix_web::{HttpResponse, ResponseError};
use diesel::result::DatabaseErrorKind;
use serde_json::json;
use thiserror::Error;

/// Which of the two backing stores an error came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreKind {
    Relational,
    Document,
}

impl fmt::Display for StoreKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreKind::Relational => f.write_str("relational store"),
            StoreKind::Document => f.write_str("document store"),
        }
    }
}

/// Errors raised by a store implementation.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("connection pool error: {0}")]
    Pool(#[from] diesel::r2d2::PoolError),

    #[error("database error: {0}")]
    Database(#[source] diesel::result::Error),

    #[error("unique constraint violated: {0}")]
    Conflict(String),

    #[error("document store request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("statement rejected: {0}")]
    Rejected(String),

    #[error("diagnosis {diagnosis_id} header committed but child rows failed: {reason}")]
    Partial { diagnosis_id: i32, reason: String },
}

impl From<diesel::result::Error> for StoreError {
    fn from(err: diesel::result::Error) -> Self {
        match err {
            // Raised when `statement_timeout` cancels a statement.
            diesel::result::Error::DatabaseError(_, ref info)
                if info.message().contains("statement timeout") =>
            {
                StoreError::Unavailable(info.message().to_string())
            }
            diesel::result::Error::DatabaseError(DatabaseErrorKind::UniqueViolation, info) => {
                StoreError::Conflict(info.message().to_string())
            }
            diesel::result::Error::DatabaseError(DatabaseErrorKind::ClosedConnection, info) => {
                StoreError::Unavailable(info.message().to_string())
            }
            other => StoreError::Database(other),
        }
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Failure taxonomy surfaced by the core components.
#[derive(Error, Debug)]
pub enum CoreError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("conflicting write: {0}")]
    Conflict(String),

    #[error("diagnosis {diagnosis_id} was only partially written")]
    PartialFailure {
        diagnosis_id: i32,
        #[source]
        source: StoreError,
    },

    #[error("{store} unavailable")]
    UpstreamUnavailable {
        store: StoreKind,
        #[source]
        source: StoreError,
    },

    #[error("{store} failed")]
    Store {
        store: StoreKind,
        #[source]
        source: StoreError,
    },
}

impl CoreError {
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        CoreError::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    /// Classify a store failure into the taxonomy, keeping the cause attached.
    pub fn from_store(store: StoreKind, source: StoreError) -> Self {
        match source {
            StoreError::Conflict(detail) => CoreError::Conflict(detail),
            StoreError::Partial { diagnosis_id, .. } => CoreError::PartialFailure {
                diagnosis_id,
                source,
            },
            StoreError::Pool(_) | StoreError::Http(_) | StoreError::Unavailable(_) => {
                CoreError::UpstreamUnavailable { store, source }
            }
            StoreError::Database(_) | StoreError::Rejected(_) => CoreError::Store { store, source },
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            CoreError::Validation(_) => "ValidationError",
            CoreError::NotFound { .. } => "NotFound",
            CoreError::Conflict(_) => "ConflictError",
            CoreError::PartialFailure { .. } => "PartialFailure",
            CoreError::UpstreamUnavailable { .. } => "UpstreamUnavailable",
            CoreError::Store { .. } => "StoreError",
        }
    }
}

impl ResponseError for CoreError {
    fn status_code(&self) -> StatusCode {
        match self {
            CoreError::Validation(_) => StatusCode::BAD_REQUEST,
            CoreError::NotFound { .. } => StatusCode::NOT_FOUND,
            CoreError::Conflict(_) => StatusCode::CONFLICT,
            CoreError::UpstreamUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            CoreError::PartialFailure { .. } | CoreError::Store { .. } => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    fn error_response(&self) -> HttpResponse {
        let message = match self {
            CoreError::PartialFailure { source, .. }
            | CoreError::UpstreamUnavailable { source, .. }
            | CoreError::Store { source, .. } => {
                tracing::error!(error = %source, kind = self.kind(), "request failed in store layer");
                self.to_string()
            }
            _ => self.to_string(),
        };
        HttpResponse::build(self.status_code()).json(json!({
            "success": false,
            "kind": self.kind(),
            "message": message,
        }))
    }
}
