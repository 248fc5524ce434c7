//! Typed error taxonomy.
//!
//! Anticipated failures (ingestion, validation gates, cancellation, config
//! mistakes) are modeled as data, never raised as panics. Invariant
//! violations (bugs) are the only case that should ever panic, and they
//! surface through [`EngineError::Internal`] with a correlation id instead.

use thiserror::Error;

/// The complete set of anticipated failure modes, prefix-coded per the
/// error taxonomy.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("dataset missing: {0}")]
    DatasetMissing(String),

    #[error("dataset unreadable: {0}")]
    DatasetUnreadable(String),

    #[error("dataset schema mismatch: {0}")]
    SchemaMismatch(String),

    #[error("causal future access detected at bar {bar_ts}: column {column}")]
    CausalFutureAccess { bar_ts: i64, column: String },

    #[error("execution precondition violated: {0}")]
    ExecutionPrecondition(String),

    #[error("validation width exceeded: metric={metric} width={width} threshold={threshold}")]
    StatsWidthExceeded {
        metric: String,
        width: f64,
        threshold: f64,
    },

    #[error("validation skipped: {0}")]
    StatsInsufficientTrades(String),

    #[error("persistence failure: {0}")]
    Persist(String),

    #[error("invalid parameter: {0}")]
    InvalidParam(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("cancelled")]
    Cancelled,

    #[error("rehydrate unavailable: {0}")]
    RehydrateUnavailable(String),

    #[error("internal error [{correlation_id}]: {message}")]
    Internal {
        correlation_id: String,
        message: String,
    },
}

impl EngineError {
    /// Correlation-id-bearing internal error, for invariant violations that
    /// should never happen in correct code.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            correlation_id: uuid::Uuid::new_v4().to_string(),
            message: message.into(),
        }
    }

    /// Stable error code for the wire error envelope (`§6` / `§7`).
    pub fn code(&self) -> &'static str {
        match self {
            Self::DatasetMissing(_) => "DATASET_MISSING",
            Self::DatasetUnreadable(_) => "DATASET_UNREADABLE",
            Self::SchemaMismatch(_) => "DATASET_SCHEMA_MISMATCH",
            Self::CausalFutureAccess { .. } => "CAUSAL_FUTURE_ACCESS",
            Self::ExecutionPrecondition(_) => "EXEC_PRECONDITION_VIOLATION",
            Self::StatsWidthExceeded { .. } => "STATS_WIDTH_EXCEEDED",
            Self::StatsInsufficientTrades(_) => "STATS_INSUFFICIENT_TRADES",
            Self::Persist(_) => "PERSIST_FAILURE",
            Self::InvalidParam(_) => "INVALID_PARAM",
            Self::NotFound(_) => "NOT_FOUND",
            Self::Conflict(_) => "CONFLICT",
            Self::Cancelled => "CANCELLED",
            Self::RehydrateUnavailable(_) => "PERSIST_REHYDRATE_UNAVAILABLE",
            Self::Internal { .. } => "INTERNAL_ERROR",
        }
    }

    /// Whether a client could reasonably retry this request unchanged.
    pub fn retryable(&self) -> bool {
        matches!(self, Self::Internal { .. } | Self::Persist(_))
    }

    /// The pipeline phase this error aborts, if it is phase-scoped.
    pub fn phase(&self) -> Option<&'static str> {
        match self {
            Self::DatasetMissing(_) | Self::DatasetUnreadable(_) | Self::SchemaMismatch(_) => {
                Some("data_loading")
            }
            Self::CausalFutureAccess { .. } => Some("feature_compute"),
            Self::ExecutionPrecondition(_) => Some("execution"),
            Self::StatsWidthExceeded { .. } | Self::StatsInsufficientTrades(_) => {
                Some("validation")
            }
            Self::Persist(_) => Some("artifacts"),
            _ => None,
        }
    }
}

/// Convenience alias used throughout the engine.
pub type EngineResult<T> = Result<T, EngineError>;
