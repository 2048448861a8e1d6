//! Idempotent publication of datasets as table snapshots.

use std::fmt;

use anyhow::{Context, Result};
use log::info;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::{
    dataset::Dataset,
    store::{self, SnapshotInfo, TableStore},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PublishOutcome {
    Published,
    /// The current snapshot already holds identical content; nothing was written.
    Unchanged,
}

impl fmt::Display for PublishOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PublishOutcome::Published => f.write_str("published"),
            PublishOutcome::Unchanged => f.write_str("unchanged"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishReceipt {
    pub table: String,
    pub outcome: PublishOutcome,
    pub snapshot: SnapshotInfo,
}

/// SHA-256 over the column declarations and the canonical CSV rendering.
pub fn content_hash(dataset: &Dataset) -> Result<String> {
    let mut hasher = Sha256::new();
    for column in &dataset.columns {
        hasher.update(
            format!(
                "{}\u{1f}{}\u{1f}{}\u{1f}{}\n",
                column.name,
                column.datatype,
                column.nullable,
                column.format.as_deref().unwrap_or_default()
            )
            .as_bytes(),
        );
    }
    hasher.update(b"\n");
    hasher.update(store::encode_csv(dataset)?);
    Ok(format!("{:x}", hasher.finalize()))
}

pub struct TablePublisher<'a> {
    store: &'a dyn TableStore,
}

impl<'a> TablePublisher<'a> {
    pub fn new(store: &'a dyn TableStore) -> Self {
        Self { store }
    }

    /// Makes `dataset` the current snapshot of `table`.
    pub fn publish(&self, table: &str, dataset: &Dataset) -> Result<PublishReceipt> {
        store::validate_table_name(table)?;
        let hash =
            content_hash(dataset).with_context(|| format!("Hashing dataset for '{table}'"))?;
        if let Some(current) = self.store.current_snapshot(table)?
            && current.content_hash == hash
        {
            info!(
                "Table '{table}' unchanged at version {} (snapshot {})",
                current.version, current.snapshot_id
            );
            return Ok(PublishReceipt {
                table: table.to_string(),
                outcome: PublishOutcome::Unchanged,
                snapshot: current,
            });
        }
        let snapshot = self
            .store
            .write_snapshot(table, dataset, &hash)
            .with_context(|| format!("Publishing table '{table}'"))?;
        Ok(PublishReceipt {
            table: table.to_string(),
            outcome: PublishOutcome::Published,
            snapshot,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        data::Value,
        schema::{ColumnMeta, ColumnType},
        store::MemoryTableStore,
    };

    fn dataset(total: i64) -> Dataset {
        Dataset::from_rows(
            "kpi",
            vec![ColumnMeta::new("total", ColumnType::Integer)],
            vec![vec![Some(Value::Integer(total))]],
        )
    }

    #[test]
    fn content_hash_depends_on_schema_and_values() {
        let base = content_hash(&dataset(1)).expect("hash");
        assert_eq!(base, content_hash(&dataset(1)).expect("hash"));
        assert_ne!(base, content_hash(&dataset(2)).expect("hash"));
        let mut retyped = dataset(1);
        retyped.columns[0].nullable = false;
        assert_ne!(base, content_hash(&retyped).expect("hash"));
    }

    #[test]
    fn republishing_identical_content_is_a_no_op() {
        let store = MemoryTableStore::new();
        let publisher = TablePublisher::new(&store);
        let first = publisher.publish("kpi", &dataset(1)).expect("first");
        let second = publisher.publish("kpi", &dataset(1)).expect("second");
        assert_eq!(first.outcome, PublishOutcome::Published);
        assert_eq!(second.outcome, PublishOutcome::Unchanged);
        assert_eq!(second.snapshot, first.snapshot);
        assert_eq!(store.history("kpi").expect("history").len(), 1);
    }
}
