//! Core error types.

use thiserror::Error;

/// Errors from the reconciliation store.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("record has no value for identity field '{field}'")]
    MissingIdentity { field: String },
}
