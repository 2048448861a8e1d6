//! Schema enforcement: raw string rows to typed, declared-shape records.
//!
//! Enforcement never drops a row and never aborts the batch. Every declared
//! column is present in the output (null-filled when absent from the raw
//! data), undeclared raw columns are dropped, and every failed coercion or
//! missing required value is tagged on the record and counted in a
//! [`ViolationReport`].

use std::collections::{BTreeMap, HashSet};

use heck::ToSnakeCase;
use itertools::Itertools;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::{
    data::{Value, is_placeholder_token, parse_typed_value},
    dataset::{Dataset, RawDataset, Record, ViolationTag},
    schema::{ColumnType, SourceDescriptor},
};

const KEY_SEPARATOR: &str = "\u{1f}";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnViolations {
    pub null_in_required_field: usize,
    pub coercion_failures: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViolationReport {
    pub source: String,
    pub total_rows: usize,
    pub rows_with_violations: usize,
    pub columns: BTreeMap<String, ColumnViolations>,
    pub dropped_columns: Vec<String>,
    pub missing_columns: Vec<String>,
    pub duplicate_primary_keys: usize,
}

impl ViolationReport {
    pub fn total_coercion_failures(&self) -> usize {
        self.columns.values().map(|c| c.coercion_failures).sum()
    }

    pub fn total_null_in_required(&self) -> usize {
        self.columns.values().map(|c| c.null_in_required_field).sum()
    }

    pub fn is_clean(&self) -> bool {
        self.rows_with_violations == 0 && self.duplicate_primary_keys == 0
    }

    pub fn column(&self, name: &str) -> ColumnViolations {
        self.columns.get(name).cloned().unwrap_or_default()
    }

    /// Rows suitable for [`crate::table::render_table`]: column, nulls, coercion failures.
    pub fn render_rows(&self) -> Vec<Vec<String>> {
        self.columns
            .iter()
            .map(|(name, counts)| {
                vec![
                    name.clone(),
                    counts.null_in_required_field.to_string(),
                    counts.coercion_failures.to_string(),
                ]
            })
            .collect()
    }

    fn record_null(&mut self, column: &str) {
        self.columns
            .entry(column.to_string())
            .or_default()
            .null_in_required_field += 1;
    }

    fn record_coercion_failure(&mut self, column: &str) {
        self.columns
            .entry(column.to_string())
            .or_default()
            .coercion_failures += 1;
    }
}

/// Coerces `raw` to the shape declared by `descriptor`.
pub fn enforce(raw: RawDataset, descriptor: &SourceDescriptor) -> (Dataset, ViolationReport) {
    let mut report = ViolationReport {
        source: descriptor.name.clone(),
        total_rows: raw.rows.len(),
        ..ViolationReport::default()
    };
    for column in &descriptor.columns {
        report.columns.insert(column.name.clone(), ColumnViolations::default());
    }

    let mapping = map_raw_columns(&raw.headers, descriptor);
    for (column, source_idx) in descriptor.columns.iter().zip(mapping.iter()) {
        if source_idx.is_none() {
            report.missing_columns.push(column.name.clone());
        }
    }
    let used: HashSet<usize> = mapping.iter().flatten().copied().collect();
    report.dropped_columns = raw
        .headers
        .iter()
        .enumerate()
        .filter(|(idx, _)| !used.contains(idx))
        .map(|(_, header)| header.clone())
        .collect();
    if !report.dropped_columns.is_empty() {
        debug!(
            "Source '{}': dropping undeclared column(s) {:?}",
            descriptor.name, report.dropped_columns
        );
    }

    let key_indices: Vec<usize> = descriptor
        .primary_key
        .iter()
        .filter_map(|key| descriptor.column_index(key))
        .collect();
    let mut seen_keys: HashSet<String> = HashSet::new();

    let mut records = Vec::with_capacity(raw.rows.len());
    for (row_idx, row) in raw.rows.into_iter().enumerate() {
        let mut record = Record::new(Vec::with_capacity(descriptor.columns.len()));
        for (column, source_idx) in descriptor.columns.iter().zip(mapping.iter()) {
            let cell = source_idx
                .and_then(|idx| row.get(idx))
                .map(String::as_str)
                .unwrap_or("");
            let cell = if column.datatype != ColumnType::String && is_placeholder_token(cell) {
                ""
            } else {
                cell
            };
            let value = match parse_typed_value(cell, &column.datatype, column.format.as_deref()) {
                Ok(value) => value,
                Err(err) => {
                    debug!(
                        "Source '{}' row {} column '{}': {err:#}",
                        descriptor.name,
                        row_idx + 1,
                        column.name
                    );
                    report.record_coercion_failure(&column.name);
                    record
                        .violations
                        .insert(ViolationTag::TypeCoercionFailed(column.name.clone()));
                    None
                }
            };
            if value.is_none() && !column.nullable {
                report.record_null(&column.name);
                record
                    .violations
                    .insert(ViolationTag::NullInRequiredField(column.name.clone()));
            }
            record.values.push(value);
        }
        if !record.is_clean() {
            report.rows_with_violations += 1;
        }
        if !key_indices.is_empty() {
            let key = primary_key_text(&record, &key_indices);
            if !seen_keys.insert(key) {
                report.duplicate_primary_keys += 1;
            }
        }
        records.push(record);
    }

    let dataset =
        Dataset::new(descriptor.name.clone(), descriptor.columns.clone()).with_records(records);
    info!(
        "Enforced '{}': {} row(s), {} with violations, {} dropped column(s)",
        descriptor.name,
        report.total_rows,
        report.rows_with_violations,
        report.dropped_columns.len()
    );
    if !report.is_clean() {
        warn!(
            "Source '{}': {} coercion failure(s), {} null(s) in required fields, {} duplicate primary key(s)",
            descriptor.name,
            report.total_coercion_failures(),
            report.total_null_in_required(),
            report.duplicate_primary_keys
        );
    }
    (dataset, report)
}

/// For each declared column, the raw header index it reads from. Exact names
/// win; otherwise headers are matched on their snake_case form.
fn map_raw_columns(headers: &[String], descriptor: &SourceDescriptor) -> Vec<Option<usize>> {
    let normalized: Vec<String> = headers.iter().map(|h| h.trim().to_snake_case()).collect();
    let mut claimed: HashSet<usize> = HashSet::new();
    let mut mapping: Vec<Option<usize>> = descriptor
        .columns
        .iter()
        .map(|column| {
            let idx = headers.iter().position(|h| h == &column.name);
            if let Some(idx) = idx {
                claimed.insert(idx);
            }
            idx
        })
        .collect();
    for (slot, column) in mapping.iter_mut().zip(descriptor.columns.iter()) {
        if slot.is_some() {
            continue;
        }
        let target = column.name.to_snake_case();
        if let Some((idx, _)) = normalized
            .iter()
            .enumerate()
            .find(|(idx, name)| !claimed.contains(idx) && **name == target)
        {
            claimed.insert(idx);
            *slot = Some(idx);
        }
    }
    mapping
}

fn primary_key_text(record: &Record, key_indices: &[usize]) -> String {
    key_indices
        .iter()
        .map(|idx| record.get(*idx).map(Value::key_text).unwrap_or_default())
        .join(KEY_SEPARATOR)
}
