use std::time::Duration;

/// Failure of a single store call.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    #[error("{op} timed out after {}ms", .after.as_millis())]
    Timeout { op: &'static str, after: Duration },
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("query failed: {0}")]
    Query(String),
}

impl StoreError {
    /// Timeouts and transport failures are worth another attempt; everything
    /// else would fail the same way again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Timeout { .. } | StoreError::Unavailable(_))
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => StoreError::NotFound("row not found".into()),
            sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed
            | sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::Protocol(_) => StoreError::Unavailable(err.to_string()),
            sqlx::Error::Database(ref db_err) if db_err.code().as_deref() == Some("23505") => {
                StoreError::Conflict(db_err.message().to_string())
            }
            other => StoreError::Query(other.to_string()),
        }
    }
}

/// Errors surfaced by a reconciliation pass.
///
/// Only `Enumeration` and `UnknownRetailer` abort a run; `Persistence` is
/// recorded against a single row and the pass moves on.
#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    #[error("failed to enumerate {what}: {source}")]
    Enumeration {
        what: String,
        #[source]
        source: StoreError,
    },
    #[error("no canonicalization rules for retailer {0:?}")]
    UnknownRetailer(String),
    #[error("{stage} failed for {id}: {source}")]
    Persistence {
        id: String,
        stage: &'static str,
        #[source]
        source: StoreError,
    },
}

impl ReconcileError {
    pub fn is_fatal(&self) -> bool {
        !matches!(self, ReconcileError::Persistence { .. })
    }
}
