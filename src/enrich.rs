//! Multi-relation left-join enrichment.
//!
//! Each relation is looked up by key from the primary dataset. The primary
//! record is always retained; when a relation has no match its columns are
//! null and `<relation>_missing` is true. Relations must have unique keys:
//! fan-out would duplicate primary rows and corrupt downstream sums, so any
//! duplicate key fails the whole enrichment with
//! [`PipelineError::AmbiguousJoinKey`] before a single row is joined.

use std::collections::{HashMap, HashSet};

use log::{debug, info, warn};

use crate::{
    data::Value,
    dataset::{Dataset, Record},
    error::PipelineError,
    schema::{ColumnMeta, ColumnType},
};

const KEY_SEPARATOR: &str = "\u{1f}";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinKey {
    pub primary: Vec<String>,
    pub relation: Vec<String>,
}

impl JoinKey {
    /// Key column with the same name on both sides.
    pub fn same(column: impl Into<String>) -> Self {
        let column = column.into();
        Self {
            primary: vec![column.clone()],
            relation: vec![column],
        }
    }

    pub fn new(primary: impl Into<String>, relation: impl Into<String>) -> Self {
        Self {
            primary: vec![primary.into()],
            relation: vec![relation.into()],
        }
    }

    pub fn composite(primary: Vec<String>, relation: Vec<String>) -> Self {
        Self { primary, relation }
    }
}

#[derive(Debug, Clone)]
pub struct Relation {
    pub name: String,
    pub dataset: Dataset,
    pub key: JoinKey,
}

impl Relation {
    pub fn new(name: impl Into<String>, dataset: Dataset, key: JoinKey) -> Self {
        Self {
            name: name.into(),
            dataset,
            key,
        }
    }

    pub fn missing_column(&self) -> String {
        format!("{}_missing", self.name)
    }
}

struct PreparedRelation {
    primary_indices: Vec<usize>,
    carried: Vec<usize>,
    lookup: HashMap<String, usize>,
}

/// Left-joins `primary` against every relation in order.
pub fn enrich(primary: Dataset, relations: &[Relation]) -> Result<Dataset, PipelineError> {
    let mut columns = primary.columns.clone();
    let mut seen: HashSet<String> = columns.iter().map(|c| c.name.clone()).collect();
    let mut prepared = Vec::with_capacity(relations.len());

    for relation in relations {
        let prepared_relation = prepare_relation(&primary, relation)?;
        for idx in &prepared_relation.carried {
            let source = &relation.dataset.columns[*idx];
            let name = unique_column_name(&source.name, &relation.name, &seen);
            seen.insert(name.clone());
            columns.push(ColumnMeta {
                name,
                nullable: true,
                ..source.clone()
            });
        }
        let missing = relation.missing_column();
        if !seen.insert(missing.clone()) {
            return Err(PipelineError::InvalidConfig(format!(
                "column '{missing}' already exists in '{}'",
                primary.name
            )));
        }
        columns.push(ColumnMeta::required(missing, ColumnType::Boolean));
        prepared.push(prepared_relation);
    }

    let mut missing_counts = vec![0usize; relations.len()];
    let name = primary.name.clone();
    let records = primary
        .records
        .into_iter()
        .map(|record| {
            let Record {
                mut values,
                violations,
            } = record;
            for (rel_idx, (relation, prep)) in relations.iter().zip(prepared.iter()).enumerate() {
                let matched = build_key(&values, &prep.primary_indices)
                    .and_then(|key| prep.lookup.get(&key))
                    .map(|row| &relation.dataset.records[*row]);
                match matched {
                    Some(found) => {
                        values.extend(prep.carried.iter().map(|idx| found.values[*idx].clone()));
                        values.push(Some(Value::Boolean(false)));
                    }
                    None => {
                        missing_counts[rel_idx] += 1;
                        values.extend(prep.carried.iter().map(|_| None));
                        values.push(Some(Value::Boolean(true)));
                    }
                }
            }
            Record { values, violations }
        })
        .collect::<Vec<_>>();

    for (relation, missing) in relations.iter().zip(missing_counts.iter()) {
        info!(
            "Enriched '{}' with '{}': {} matched, {} missing",
            name,
            relation.name,
            records.len() - missing,
            missing
        );
        if *missing > 0 {
            warn!(
                "{} record(s) of '{}' have no match in '{}'",
                missing, name, relation.name
            );
        }
    }

    Ok(Dataset::new(name, columns).with_records(records))
}

fn prepare_relation(
    primary: &Dataset,
    relation: &Relation,
) -> Result<PreparedRelation, PipelineError> {
    if relation.key.primary.is_empty() || relation.key.primary.len() != relation.key.relation.len() {
        return Err(PipelineError::InvalidConfig(format!(
            "relation '{}' must declare the same non-zero number of primary and relation key columns",
            relation.name
        )));
    }
    let primary_indices = relation
        .key
        .primary
        .iter()
        .map(|column| primary.require_column(column))
        .collect::<Result<Vec<_>, _>>()?;
    let relation_indices = relation
        .key
        .relation
        .iter()
        .map(|column| relation.dataset.require_column(column))
        .collect::<Result<Vec<_>, _>>()?;

    let mut occurrences: HashMap<String, Vec<usize>> = HashMap::new();
    for (row_idx, record) in relation.dataset.records.iter().enumerate() {
        if let Some(key) = build_key(&record.values, &relation_indices) {
            occurrences.entry(key).or_default().push(row_idx);
        }
    }
    let mut duplicates: Vec<(&String, usize)> = occurrences
        .iter()
        .filter(|(_, rows)| rows.len() > 1)
        .map(|(key, rows)| (key, rows.len()))
        .collect();
    duplicates.sort();
    if let Some((key, count)) = duplicates.first() {
        return Err(PipelineError::AmbiguousJoinKey {
            relation: relation.name.clone(),
            column: relation.key.relation.join(","),
            value: key.replace(KEY_SEPARATOR, ","),
            occurrences: *count,
        });
    }

    let lookup: HashMap<String, usize> = occurrences
        .into_iter()
        .map(|(key, rows)| (key, rows[0]))
        .collect();
    let carried = (0..relation.dataset.columns.len())
        .filter(|idx| !relation_indices.contains(idx))
        .collect();
    debug!(
        "Relation '{}' prepared with {} unique key(s)",
        relation.name,
        lookup.len()
    );
    Ok(PreparedRelation {
        primary_indices,
        carried,
        lookup,
    })
}

/// Canonical key text; `None` when any key cell is null.
fn build_key(values: &[Option<Value>], indices: &[usize]) -> Option<String> {
    let mut parts = Vec::with_capacity(indices.len());
    for idx in indices {
        let value = values.get(*idx)?.as_ref()?;
        parts.push(value.key_text());
    }
    Some(parts.join(KEY_SEPARATOR))
}

fn unique_column_name(name: &str, relation: &str, seen: &HashSet<String>) -> String {
    if !seen.contains(name) {
        return name.to_string();
    }
    let base = format!("{relation}_{name}");
    let mut candidate = base.clone();
    let mut counter = 1usize;
    while seen.contains(&candidate) {
        candidate = format!("{base}_{counter}");
        counter += 1;
    }
    candidate
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unique_column_name_prefixes_relation_on_clash() {
        let seen: HashSet<String> = ["status".to_string(), "customers_status".to_string()]
            .into_iter()
            .collect();
        assert_eq!(unique_column_name("city", "customers", &seen), "city");
        assert_eq!(
            unique_column_name("status", "customers", &seen),
            "customers_status_1"
        );
    }

    #[test]
    fn build_key_is_none_for_null_cells() {
        let values = vec![Some(Value::Integer(1)), None];
        assert_eq!(build_key(&values, &[0]), Some("1".to_string()));
        assert_eq!(build_key(&values, &[0, 1]), None);
    }
}
