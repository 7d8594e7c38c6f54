//! Reconciliation store.
//!
//! Holds the current dataset (rows, identity index and schema), applies
//! snapshot-replace and upsert-merge operations, and publishes exactly one
//! [`ChangeEvent`] per successful mutation.
//!
//! Mutations are serialized by a write lock; readers take a short read lock
//! and receive an owned, materialized [`DatasetSnapshot`], so no reader ever
//! observes a partially applied operation.

use crate::error::StoreError;
use crate::record::{IdentityKey, Record, RecordValue};
use crate::schema::Schema;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::broadcast;

/// Identity field used when none is configured.
pub const DEFAULT_IDENTITY_FIELD: &str = "id";

/// Default capacity of the change notification channel.
const CHANGE_CHANNEL_CAPACITY: usize = 1024;

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Field used as the unique row key.
    pub identity_field: String,
    /// Capacity of the change feed. Slow listeners past this many events
    /// receive `Lagged` and should re-render from a fresh snapshot.
    pub change_capacity: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            identity_field: DEFAULT_IDENTITY_FIELD.to_string(),
            change_capacity: CHANGE_CHANNEL_CAPACITY,
        }
    }
}

impl StoreConfig {
    pub fn new(identity_field: impl Into<String>) -> Self {
        Self {
            identity_field: identity_field.into(),
            ..Self::default()
        }
    }

    pub fn with_change_capacity(mut self, capacity: usize) -> Self {
        self.change_capacity = capacity.max(1);
        self
    }
}

/// What a mutation changed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeKind {
    /// Whole dataset replaced (snapshot or clear). Re-render everything.
    StructureReset,
    /// New columns appeared. Re-render everything.
    StructureGrown { added: Vec<String> },
    /// Only cell values changed, or rows were appended.
    RowsChanged { positions: Vec<usize>, inserted: bool },
}

/// Change notification published after each successful mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    /// Dataset version after the mutation.
    pub version: u64,
    pub kind: ChangeKind,
}

/// Result of [`ReconciliationStore::reset_with_snapshot`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnapshotOutcome {
    /// Rows in the new dataset.
    pub rows: usize,
    /// Records excluded for lacking an identity.
    pub rejected: usize,
    /// Records merged into an earlier record with the same identity.
    pub duplicates: usize,
}

/// Result of a successful [`ReconciliationStore::upsert`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpsertOutcome {
    pub position: usize,
    pub inserted: bool,
    pub schema_grew: bool,
}

/// A row materialized against the schema it was read with.
#[derive(Debug, Clone, PartialEq)]
pub struct Row<V> {
    cells: Vec<Option<V>>,
}

impl<V: RecordValue> Row<V> {
    pub fn cells(&self) -> &[Option<V>] {
        &self.cells
    }

    /// Value at a column position; `None` when the field is absent.
    pub fn get(&self, column: usize) -> Option<&V> {
        self.cells.get(column).and_then(Option::as_ref)
    }

    /// Cell text; absent fields render as an empty string.
    pub fn render(&self, column: usize) -> String {
        self.get(column).map(RecordValue::render).unwrap_or_default()
    }
}

/// Point-in-time view of the dataset.
#[derive(Debug, Clone, PartialEq)]
pub struct DatasetSnapshot<V> {
    pub version: u64,
    pub schema: Schema,
    pub rows: Vec<Row<V>>,
}

impl<V: RecordValue> DatasetSnapshot<V> {
    /// Looks up a cell by row position and column name.
    pub fn get(&self, row: usize, column: &str) -> Option<&V> {
        let col = self.schema.position(column)?;
        self.rows.get(row)?.get(col)
    }
}

/// Store counters. Every rejected record is counted here.
#[derive(Debug, Default)]
pub struct StoreStats {
    pub snapshots_applied: AtomicU64,
    pub rows_inserted: AtomicU64,
    pub rows_updated: AtomicU64,
    pub missing_identity: AtomicU64,
}

impl StoreStats {
    pub fn missing_identity(&self) -> u64 {
        self.missing_identity.load(Ordering::Relaxed)
    }

    pub fn snapshots_applied(&self) -> u64 {
        self.snapshots_applied.load(Ordering::Relaxed)
    }

    pub fn rows_inserted(&self) -> u64 {
        self.rows_inserted.load(Ordering::Relaxed)
    }

    pub fn rows_updated(&self) -> u64 {
        self.rows_updated.load(Ordering::Relaxed)
    }
}

struct Dataset<V> {
    schema: Schema,
    rows: Vec<HashMap<String, V>>,
    index: HashMap<IdentityKey, usize>,
    version: u64,
}

impl<V: RecordValue> Dataset<V> {
    fn empty(identity_field: &str) -> Self {
        Self {
            schema: Schema::empty(identity_field),
            rows: Vec::new(),
            index: HashMap::new(),
            version: 0,
        }
    }

    fn materialize(&self) -> DatasetSnapshot<V> {
        let columns = self.schema.columns();
        let rows = self
            .rows
            .iter()
            .map(|row| Row {
                cells: columns.iter().map(|c| row.get(c).cloned()).collect(),
            })
            .collect();
        DatasetSnapshot {
            version: self.version,
            schema: self.schema.clone(),
            rows,
        }
    }
}

/// Identity-keyed reconciliation of snapshot and upsert payloads.
pub struct ReconciliationStore<V: RecordValue> {
    config: StoreConfig,
    dataset: RwLock<Dataset<V>>,
    changes: broadcast::Sender<ChangeEvent>,
    stats: StoreStats,
}

impl<V: RecordValue> ReconciliationStore<V> {
    pub fn new(config: StoreConfig) -> Self {
        let (changes, _) = broadcast::channel(config.change_capacity.max(1));
        Self {
            dataset: RwLock::new(Dataset::empty(&config.identity_field)),
            config,
            changes,
            stats: StoreStats::default(),
        }
    }

    pub fn identity_field(&self) -> &str {
        &self.config.identity_field
    }

    /// Subscribes to change notifications.
    pub fn subscribe_changes(&self) -> broadcast::Receiver<ChangeEvent> {
        self.changes.subscribe()
    }

    pub fn stats(&self) -> &StoreStats {
        &self.stats
    }

    /// Replaces the dataset with the given records, in order.
    ///
    /// Records without an identity are excluded and counted. Duplicate
    /// identities merge into their first occurrence. An empty snapshot yields
    /// an empty dataset with an empty schema.
    pub fn reset_with_snapshot(&self, records: Vec<Record<V>>) -> SnapshotOutcome {
        let field = self.config.identity_field.as_str();
        let mut schema = Schema::empty(field);
        let mut rows: Vec<HashMap<String, V>> = Vec::with_capacity(records.len());
        let mut index = HashMap::with_capacity(records.len());
        let mut rejected = 0;
        let mut duplicates = 0;

        for record in records {
            let Some(key) = record.identity(field).map(RecordValue::identity_key) else {
                rejected += 1;
                continue;
            };
            schema.extend(record.names());
            match index.get(&key) {
                Some(&pos) => {
                    duplicates += 1;
                    let row: &mut HashMap<String, V> = &mut rows[pos];
                    row.extend(record);
                }
                None => {
                    index.insert(key, rows.len());
                    rows.push(record.into_iter().collect());
                }
            }
        }

        if rejected > 0 {
            tracing::warn!(
                rejected,
                field,
                "snapshot records without identity were excluded"
            );
            self.stats
                .missing_identity
                .fetch_add(rejected as u64, Ordering::Relaxed);
        }
        if duplicates > 0 {
            tracing::debug!(duplicates, "snapshot contained repeated identities");
        }

        let outcome = SnapshotOutcome {
            rows: rows.len(),
            rejected,
            duplicates,
        };

        let mut dataset = self.dataset.write();
        dataset.schema = schema;
        dataset.rows = rows;
        dataset.index = index;
        dataset.version += 1;
        self.stats.snapshots_applied.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(
            rows = outcome.rows,
            columns = dataset.schema.len(),
            version = dataset.version,
            "snapshot applied"
        );
        self.publish(dataset.version, ChangeKind::StructureReset);

        outcome
    }

    /// Merges a record into the row with the same identity, or appends it.
    ///
    /// Fields present in `record` overwrite; fields absent are left as they
    /// were. Concurrent upserts for one identity apply in arrival order.
    pub fn upsert(&self, record: Record<V>) -> Result<UpsertOutcome, StoreError> {
        let field = self.config.identity_field.as_str();
        let Some(key) = record.identity(field).map(RecordValue::identity_key) else {
            self.stats.missing_identity.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(field, "upsert rejected: record has no identity");
            return Err(StoreError::MissingIdentity {
                field: field.to_string(),
            });
        };

        let mut dataset = self.dataset.write();

        let added: Vec<String> = record
            .names()
            .filter(|n| !dataset.schema.contains(n))
            .map(str::to_string)
            .collect();
        let schema_grew = !added.is_empty();
        if schema_grew {
            dataset.schema.extend(added.iter().map(String::as_str));
        }

        let (position, inserted) = match dataset.index.get(&key).copied() {
            Some(pos) => {
                dataset.rows[pos].extend(record);
                self.stats.rows_updated.fetch_add(1, Ordering::Relaxed);
                (pos, false)
            }
            None => {
                let pos = dataset.rows.len();
                dataset.rows.push(record.into_iter().collect());
                dataset.index.insert(key, pos);
                self.stats.rows_inserted.fetch_add(1, Ordering::Relaxed);
                (pos, true)
            }
        };

        dataset.version += 1;
        let kind = if schema_grew {
            ChangeKind::StructureGrown { added }
        } else {
            ChangeKind::RowsChanged {
                positions: vec![position],
                inserted,
            }
        };
        tracing::trace!(
            position,
            inserted,
            schema_grew,
            version = dataset.version,
            "upsert applied"
        );
        self.publish(dataset.version, kind);

        Ok(UpsertOutcome {
            position,
            inserted,
            schema_grew,
        })
    }

    /// Discards all rows and columns.
    pub fn clear(&self) {
        let mut dataset = self.dataset.write();
        let version = dataset.version + 1;
        *dataset = Dataset::empty(&self.config.identity_field);
        dataset.version = version;
        self.publish(version, ChangeKind::StructureReset);
    }

    /// Point-in-time read of schema and rows.
    pub fn snapshot(&self) -> DatasetSnapshot<V> {
        self.dataset.read().materialize()
    }

    pub fn current_schema(&self) -> Schema {
        self.dataset.read().schema.clone()
    }

    pub fn current_rows(&self) -> Vec<Row<V>> {
        self.snapshot().rows
    }

    /// Row position for an identity value.
    pub fn position_of(&self, identity: &V) -> Option<usize> {
        if identity.is_null() {
            return None;
        }
        self.dataset
            .read()
            .index
            .get(&identity.identity_key())
            .copied()
    }

    pub fn version(&self) -> u64 {
        self.dataset.read().version
    }

    pub fn len(&self) -> usize {
        self.dataset.read().rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dataset.read().rows.is_empty()
    }

    /// Called with the write lock held so events leave in mutation order.
    fn publish(&self, version: u64, kind: ChangeKind) {
        // No receivers is fine; the adapter may not be attached yet.
        let _ = self.changes.send(ChangeEvent { version, kind });
    }
}

impl<V: RecordValue> Default for ReconciliationStore<V> {
    fn default() -> Self {
        Self::new(StoreConfig::default())
    }
}
