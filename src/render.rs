//! Text table view of the reconciled dataset.
//!
//! Structural changes redraw the whole table; value changes print only the
//! touched rows.

use colored::Colorize;
use serde_json::Value;
use std::sync::Arc;
use stompview_core::{ChangeEvent, ChangeKind, DatasetSnapshot, ReconciliationStore};
use tokio::sync::broadcast::{self, error::RecvError};

/// Cells wider than this are cut.
const MAX_CELL_WIDTH: usize = 32;

fn fit(text: &str) -> String {
    if text.chars().count() <= MAX_CELL_WIDTH {
        return text.to_string();
    }
    let mut cut: String = text.chars().take(MAX_CELL_WIDTH - 3).collect();
    cut.push_str("...");
    cut
}

fn pad(text: &str, width: usize) -> String {
    format!("{:<width$}", text, width = width)
}

fn column_widths(snapshot: &DatasetSnapshot<Value>) -> Vec<usize> {
    snapshot
        .schema
        .columns()
        .iter()
        .enumerate()
        .map(|(col, name)| {
            snapshot
                .rows
                .iter()
                .map(|row| fit(&row.render(col)).chars().count())
                .chain(std::iter::once(fit(name).chars().count()))
                .max()
                .unwrap_or(0)
        })
        .collect()
}

fn format_cells(snapshot: &DatasetSnapshot<Value>, row: usize, widths: &[usize]) -> String {
    let Some(row) = snapshot.rows.get(row) else {
        return String::new();
    };
    widths
        .iter()
        .enumerate()
        .map(|(col, width)| pad(&fit(&row.render(col)), *width))
        .collect::<Vec<_>>()
        .join(" | ")
        .trim_end()
        .to_string()
}

/// Renders the whole table with a header and a footer line.
pub fn format_table(snapshot: &DatasetSnapshot<Value>) -> String {
    if snapshot.schema.is_empty() {
        return format!("{}\n", "(no rows)".dimmed());
    }

    let widths = column_widths(snapshot);
    let header = snapshot
        .schema
        .columns()
        .iter()
        .zip(&widths)
        .map(|(name, width)| pad(&fit(name), *width))
        .collect::<Vec<_>>()
        .join(" | ");
    let separator = widths
        .iter()
        .map(|w| "-".repeat(*w))
        .collect::<Vec<_>>()
        .join("-+-");

    let mut output = String::new();
    output.push_str(&format!("{}\n", header.trim_end().bold().cyan()));
    output.push_str(&separator);
    output.push('\n');
    for row in 0..snapshot.rows.len() {
        output.push_str(&format_cells(snapshot, row, &widths));
        output.push('\n');
    }
    output.push_str(&format!(
        "{}\n",
        format!("{} row(s), version {}", snapshot.rows.len(), snapshot.version).dimmed()
    ));
    output
}

/// Renders only the given rows, marked as inserted (`+`) or updated (`~`).
pub fn format_rows(
    snapshot: &DatasetSnapshot<Value>,
    positions: &[usize],
    inserted: bool,
) -> String {
    let widths = column_widths(snapshot);
    let marker = if inserted { "+".green() } else { "~".yellow() };

    let mut output = String::new();
    for &pos in positions {
        if pos >= snapshot.rows.len() {
            continue;
        }
        output.push_str(&format!(
            "{} [{}] {}\n",
            marker,
            pos,
            format_cells(snapshot, pos, &widths)
        ));
    }
    output
}

/// Output for one change event, read against the current dataset.
pub fn format_change(snapshot: &DatasetSnapshot<Value>, event: &ChangeEvent) -> String {
    match &event.kind {
        ChangeKind::StructureReset | ChangeKind::StructureGrown { .. } => format_table(snapshot),
        ChangeKind::RowsChanged {
            positions,
            inserted,
        } => format_rows(snapshot, positions, *inserted),
    }
}

/// Prints the table as the store changes, until the change feed closes.
pub async fn run(
    store: Arc<ReconciliationStore<Value>>,
    mut changes: broadcast::Receiver<ChangeEvent>,
) {
    loop {
        match changes.recv().await {
            Ok(event) => {
                print!("{}", format_change(&store.snapshot(), &event));
            }
            Err(RecvError::Lagged(n)) => {
                eprintln!("{}: skipped {} change(s), redrawing", "Warning".yellow(), n);
                print!("{}", format_table(&store.snapshot()));
            }
            Err(RecvError::Closed) => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use stompview_core::{Record, StoreConfig};

    fn store() -> ReconciliationStore<Value> {
        colored::control::set_override(false);
        ReconciliationStore::new(StoreConfig::default())
    }

    fn record(value: Value) -> Record<Value> {
        Record::from(value.as_object().unwrap().clone())
    }

    #[test]
    fn test_format_table() {
        let store = store();
        store.reset_with_snapshot(vec![
            record(json!({"name": "alpha", "id": 1})),
            record(json!({"id": 22})),
        ]);

        let table = format_table(&store.snapshot());
        assert_eq!(
            table,
            "id | name\n---+------\n1  | alpha\n22 |\n2 row(s), version 1\n"
        );
    }

    #[test]
    fn test_format_empty() {
        let store = store();
        assert_eq!(format_table(&store.snapshot()), "(no rows)\n");
    }

    #[test]
    fn test_format_rows_marks_changes() {
        let store = store();
        store.reset_with_snapshot(vec![record(json!({"id": 1, "px": 10}))]);
        store.upsert(record(json!({"id": 2, "px": 11}))).unwrap();

        let snapshot = store.snapshot();
        assert_eq!(format_rows(&snapshot, &[1], true), "+ [1] 2  | 11\n");
        assert_eq!(format_rows(&snapshot, &[0], false), "~ [0] 1  | 10\n");
        assert_eq!(format_rows(&snapshot, &[5], false), "");
    }

    #[test]
    fn test_structural_change_redraws() {
        let store = store();
        let mut changes = store.subscribe_changes();
        store.reset_with_snapshot(vec![record(json!({"id": 1}))]);
        store.upsert(record(json!({"id": 1, "extra": true}))).unwrap();

        let _reset = changes.try_recv().unwrap();
        let grown = changes.try_recv().unwrap();
        let output = format_change(&store.snapshot(), &grown);
        assert!(output.starts_with("id | extra\n"));
        assert!(output.contains("1  | true"));
    }

    #[test]
    fn test_long_cells_are_cut() {
        let long = "x".repeat(40);
        let cut = fit(&long);
        assert_eq!(cut.chars().count(), MAX_CELL_WIDTH);
        assert!(cut.ends_with("..."));
        assert_eq!(fit("short"), "short");
    }
}
