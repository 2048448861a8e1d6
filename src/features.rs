//! Derived temporal and customer-lifecycle features.
//!
//! Temporal decomposition is a pure function of one timestamp cell. Customer
//! features are recomputed in full from the enriched order set on every run;
//! nothing is maintained incrementally.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{Datelike, NaiveDate};
use log::{info, warn};
use rust_decimal::{Decimal, prelude::FromPrimitive};
use serde::{Deserialize, Serialize};

use crate::{
    data::{Value, parse_naive_date, parse_naive_datetime},
    dataset::Dataset,
    error::PipelineError,
    schema::{ColumnMeta, ColumnType},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TemporalParts {
    pub year: i32,
    pub month: u32,
    pub quarter: u32,
    /// ISO weekday, 1 = Monday.
    pub weekday: u32,
}

impl TemporalParts {
    pub fn from_date(date: NaiveDate) -> Self {
        let month = date.month();
        Self {
            year: date.year(),
            month,
            quarter: (month - 1) / 3 + 1,
            weekday: date.weekday().number_from_monday(),
        }
    }
}

/// Date part of a timestamp cell. Strings are re-parsed as a last resort;
/// anything unparseable raises [`PipelineError::InvalidTimestamp`].
pub fn timestamp_date(
    value: &Value,
    column: &str,
    row: usize,
) -> Result<NaiveDate, PipelineError> {
    if let Some(date) = value.as_date() {
        return Ok(date);
    }
    if let Value::String(raw) = value {
        if let Ok(dt) = parse_naive_datetime(raw) {
            return Ok(dt.date());
        }
        if let Ok(date) = parse_naive_date(raw) {
            return Ok(date);
        }
    }
    Err(PipelineError::InvalidTimestamp {
        column: column.to_string(),
        row,
        value: value.as_display(),
    })
}

pub fn temporal_parts(
    value: Option<&Value>,
    column: &str,
    row: usize,
) -> Result<Option<TemporalParts>, PipelineError> {
    value
        .map(|value| timestamp_date(value, column, row).map(TemporalParts::from_date))
        .transpose()
}

/// Appends `{prefix}year`, `{prefix}month`, `{prefix}quarter`, `{prefix}weekday`.
pub fn derive_temporal(
    mut dataset: Dataset,
    column: &str,
    prefix: &str,
) -> Result<Dataset, PipelineError> {
    let idx = dataset.require_column(column)?;
    let parts = dataset
        .records
        .iter()
        .enumerate()
        .map(|(row, record)| temporal_parts(record.get(idx), column, row + 1))
        .collect::<Result<Vec<_>, _>>()?;

    let names = ["year", "month", "quarter", "weekday"].map(|part| format!("{prefix}{part}"));
    for name in &names {
        if dataset.column_index(name).is_some() {
            return Err(PipelineError::InvalidConfig(format!(
                "derived column '{name}' already exists in '{}'",
                dataset.name
            )));
        }
    }
    for (record, parts) in dataset.records.iter_mut().zip(parts) {
        match parts {
            Some(p) => record.values.extend([
                Some(Value::Integer(i64::from(p.year))),
                Some(Value::Integer(i64::from(p.month))),
                Some(Value::Integer(i64::from(p.quarter))),
                Some(Value::Integer(i64::from(p.weekday))),
            ]),
            None => record.values.extend([None, None, None, None]),
        }
    }
    dataset.columns.extend(
        names
            .into_iter()
            .map(|name| ColumnMeta::new(name, ColumnType::Integer)),
    );
    Ok(dataset)
}

/// Appends whole days from `start` to `end` as `name`; null when either side is null.
pub fn derive_day_interval(
    mut dataset: Dataset,
    start: &str,
    end: &str,
    name: &str,
) -> Result<Dataset, PipelineError> {
    let start_idx = dataset.require_column(start)?;
    let end_idx = dataset.require_column(end)?;
    if dataset.column_index(name).is_some() {
        return Err(PipelineError::InvalidConfig(format!(
            "derived column '{name}' already exists in '{}'",
            dataset.name
        )));
    }
    let mut intervals = Vec::with_capacity(dataset.len());
    for (row, record) in dataset.records.iter().enumerate() {
        let interval = match (record.get(start_idx), record.get(end_idx)) {
            (Some(from), Some(to)) => {
                let from = timestamp_date(from, start, row + 1)?;
                let to = timestamp_date(to, end, row + 1)?;
                Some(Value::Integer((to - from).num_days()))
            }
            _ => None,
        };
        intervals.push(interval);
    }
    for (record, interval) in dataset.records.iter_mut().zip(intervals) {
        record.values.push(interval);
    }
    dataset
        .columns
        .push(ColumnMeta::new(name, ColumnType::Integer));
    Ok(dataset)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TenureBand {
    pub label: String,
    /// Inclusive upper bound in days; `None` marks the final open band.
    #[serde(default)]
    pub max_days: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TenureBands(Vec<TenureBand>);

impl Default for TenureBands {
    fn default() -> Self {
        Self(vec![
            TenureBand {
                label: "new".into(),
                max_days: Some(90),
            },
            TenureBand {
                label: "growing".into(),
                max_days: Some(365),
            },
            TenureBand {
                label: "established".into(),
                max_days: Some(730),
            },
            TenureBand {
                label: "loyal".into(),
                max_days: None,
            },
        ])
    }
}

impl TenureBands {
    pub fn new(bands: Vec<TenureBand>) -> Result<Self, PipelineError> {
        let bands = Self(bands);
        bands.validate()?;
        Ok(bands)
    }

    pub fn validate(&self) -> Result<(), PipelineError> {
        let invalid = |msg: String| Err(PipelineError::InvalidConfig(msg));
        let Some(last) = self.0.last() else {
            return invalid("tenure bands cannot be empty".into());
        };
        if last.max_days.is_some() {
            return invalid(format!("final tenure band '{}' must be open-ended", last.label));
        }
        let mut previous: Option<i64> = None;
        for band in &self.0 {
            if band.label.trim().is_empty() {
                return invalid("tenure band labels cannot be empty".into());
            }
            if std::ptr::eq(band, last) {
                break;
            }
            let Some(max) = band.max_days else {
                return invalid(format!("only the final tenure band may be open-ended ('{}')", band.label));
            };
            if previous.is_some_and(|prev| max <= prev) {
                return invalid(format!(
                    "tenure band '{}' upper bound {max} must exceed the previous band",
                    band.label
                ));
            }
            previous = Some(max);
        }
        Ok(())
    }

    pub fn bucket(&self, tenure_days: i64) -> &str {
        self.0
            .iter()
            .find(|band| band.max_days.is_none_or(|max| tenure_days <= max))
            .map(|band| band.label.as_str())
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderColumns {
    pub customer: String,
    pub order_id: String,
    pub order_date: String,
    pub total: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CustomerFeatureVector {
    pub customer_id: String,
    pub first_order: NaiveDate,
    pub last_order: NaiveDate,
    pub recency_days: i64,
    pub frequency: usize,
    pub monetary: Decimal,
    pub tenure_days: i64,
    pub tenure_bucket: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CustomerFeatures {
    /// Sorted by customer id.
    pub vectors: Vec<CustomerFeatureVector>,
    /// Orders without a customer or order date.
    pub skipped_orders: usize,
}

#[derive(Default)]
struct CustomerAccumulator {
    first: Option<NaiveDate>,
    last: Option<NaiveDate>,
    orders: BTreeSet<String>,
    monetary: Decimal,
}

pub fn derive_customer_features(
    orders: &Dataset,
    columns: &OrderColumns,
    reference_date: NaiveDate,
    bands: &TenureBands,
) -> Result<CustomerFeatures, PipelineError> {
    bands.validate()?;
    let customer_idx = orders.require_column(&columns.customer)?;
    let order_idx = orders.require_column(&columns.order_id)?;
    let date_idx = orders.require_column(&columns.order_date)?;
    let total_idx = orders.require_column(&columns.total)?;

    let mut by_customer: BTreeMap<String, CustomerAccumulator> = BTreeMap::new();
    let mut skipped_orders = 0usize;
    for (row, record) in orders.records.iter().enumerate() {
        let (Some(customer), Some(date)) = (record.get(customer_idx), record.get(date_idx)) else {
            skipped_orders += 1;
            continue;
        };
        let date = timestamp_date(date, &columns.order_date, row + 1)?;
        let entry = by_customer.entry(customer.key_text()).or_default();
        entry.first = Some(entry.first.map_or(date, |d| d.min(date)));
        entry.last = Some(entry.last.map_or(date, |d| d.max(date)));
        if let Some(order_id) = record.get(order_idx) {
            entry.orders.insert(order_id.key_text());
        }
        let amount = match record.get(total_idx) {
            Some(Value::Float(f)) => Decimal::from_f64(*f).ok_or_else(|| overflow(&columns.total))?,
            Some(value) => value.as_decimal().ok_or_else(|| PipelineError::IncompatibleReducer {
                reducer: "monetary".into(),
                column: columns.total.clone(),
                datatype: value.column_type().to_string(),
            })?,
            None => continue,
        };
        entry.monetary = entry
            .monetary
            .checked_add(amount)
            .ok_or_else(|| overflow(&columns.total))?;
    }

    let vectors = by_customer
        .into_iter()
        .filter_map(|(customer_id, acc)| {
            let (first, last) = (acc.first?, acc.last?);
            let tenure_days = (reference_date - first).num_days();
            Some(CustomerFeatureVector {
                customer_id,
                first_order: first,
                last_order: last,
                recency_days: (reference_date - last).num_days(),
                frequency: acc.orders.len(),
                monetary: acc.monetary,
                tenure_days,
                tenure_bucket: bands.bucket(tenure_days).to_string(),
            })
        })
        .collect::<Vec<_>>();

    if skipped_orders > 0 {
        warn!(
            "Skipped {skipped_orders} order(s) without a customer or order date in '{}'",
            orders.name
        );
    }
    info!(
        "Derived feature vectors for {} customer(s) as of {reference_date}",
        vectors.len()
    );
    Ok(CustomerFeatures {
        vectors,
        skipped_orders,
    })
}

fn overflow(column: &str) -> PipelineError {
    PipelineError::NumericOverflow {
        column: column.to_string(),
    }
}

pub fn customer_features_dataset(vectors: &[CustomerFeatureVector]) -> Dataset {
    let columns = vec![
        ColumnMeta::required("customer_id", ColumnType::String),
        ColumnMeta::required("first_order_date", ColumnType::Date),
        ColumnMeta::required("last_order_date", ColumnType::Date),
        ColumnMeta::required("recency_days", ColumnType::Integer),
        ColumnMeta::required("frequency", ColumnType::Integer),
        ColumnMeta::required("monetary", ColumnType::Decimal),
        ColumnMeta::required("tenure_days", ColumnType::Integer),
        ColumnMeta::required("tenure_bucket", ColumnType::String),
    ];
    let rows = vectors
        .iter()
        .map(|v| {
            vec![
                Some(Value::String(v.customer_id.clone())),
                Some(Value::Date(v.first_order)),
                Some(Value::Date(v.last_order)),
                Some(Value::Integer(v.recency_days)),
                Some(Value::Integer(v.frequency as i64)),
                Some(Value::Decimal(v.monetary)),
                Some(Value::Integer(v.tenure_days)),
                Some(Value::String(v.tenure_bucket.clone())),
            ]
        })
        .collect();
    Dataset::from_rows("customer_features", columns, rows)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn temporal_parts_use_iso_weekday_and_quarter() {
        let parts = TemporalParts::from_date(NaiveDate::from_ymd_opt(2024, 1, 1).unwrap());
        assert_eq!(
            parts,
            TemporalParts {
                year: 2024,
                month: 1,
                quarter: 1,
                weekday: 1
            }
        );
        let sunday = TemporalParts::from_date(NaiveDate::from_ymd_opt(2024, 11, 10).unwrap());
        assert_eq!(sunday.weekday, 7);
        assert_eq!(sunday.quarter, 4);
    }

    #[test]
    fn tenure_bands_bucket_inclusive_upper_bounds() {
        let bands = TenureBands::default();
        assert_eq!(bands.bucket(0), "new");
        assert_eq!(bands.bucket(90), "new");
        assert_eq!(bands.bucket(91), "growing");
        assert_eq!(bands.bucket(730), "established");
        assert_eq!(bands.bucket(5000), "loyal");
    }

    #[test]
    fn tenure_bands_reject_unordered_or_closed_configs() {
        let unordered = TenureBands::new(vec![
            TenureBand {
                label: "a".into(),
                max_days: Some(100),
            },
            TenureBand {
                label: "b".into(),
                max_days: Some(50),
            },
            TenureBand {
                label: "c".into(),
                max_days: None,
            },
        ]);
        assert!(unordered.is_err());

        let closed = TenureBands::new(vec![TenureBand {
            label: "only".into(),
            max_days: Some(10),
        }]);
        assert!(closed.is_err());
    }

    #[test]
    fn timestamp_date_rejects_non_temporal_values() {
        let err = timestamp_date(&Value::String("soon".into()), "ordered_at", 3)
            .expect_err("unparseable");
        assert!(matches!(err, PipelineError::InvalidTimestamp { row: 3, .. }));
        assert!(timestamp_date(&Value::String("2024-03-01".into()), "ordered_at", 1).is_ok());
    }
}
