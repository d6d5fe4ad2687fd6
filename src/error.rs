//! Top-level service errors.
//!
//! Validation and transport problems are answered in-band inside each
//! [`crate::types::RateLimitResp`]; the variants here abort the whole call.

use thiserror::Error;

use crate::store::StoreError;

/// Result alias for service operations.
pub type ServiceResult<T> = Result<T, ServiceError>;

/// Errors that fail an entire RPC rather than a single item.
#[derive(Debug, Error)]
pub enum ServiceError {
    /// The caller's deadline expired before evaluation finished.
    #[error("deadline exceeded")]
    Deadline,

    /// The counter cache is full of live entries. Memory pressure must
    /// surface as an error; live counters are never evicted.
    #[error("counter store: {0}")]
    Store(#[from] StoreError),
}
