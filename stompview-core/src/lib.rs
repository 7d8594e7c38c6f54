//! # stompview-core
//!
//! Reconciliation engine for stompview.
//!
//! This crate provides:
//! - Generic records over a pluggable value representation
//! - Column schema with identity-first, case-insensitive ordering
//! - `ReconciliationStore`: snapshot-replace and upsert-merge with a change feed

pub mod error;
pub mod record;
pub mod schema;
pub mod store;

pub use error::StoreError;
pub use record::{IdentityKey, Record, RecordValue};
pub use schema::Schema;
pub use store::{
    ChangeEvent, ChangeKind, DatasetSnapshot, ReconciliationStore, Row, SnapshotOutcome,
    StoreConfig, StoreStats, UpsertOutcome, DEFAULT_IDENTITY_FIELD,
};
