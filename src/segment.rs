//! RFM segmentation over customer feature vectors.
//!
//! Each dimension is scored into `bins` bands computed over the whole
//! population of the run. Bands follow ntile sizing over the ascending sort:
//! band sizes differ by at most one, earlier bands take the remainder, and the
//! boundary of a band is the largest value it holds. A value scores
//! `1 + (number of boundaries strictly below it)`, so equal values always share
//! a band and a value sitting on a boundary stays in the lower band. Recency
//! is ranked in reverse: the most recent customers score highest.

use std::{cmp::Reverse, collections::BTreeMap};

use itertools::iproduct;
use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::{
    data::Value,
    dataset::Dataset,
    error::PipelineError,
    features::CustomerFeatureVector,
    schema::{ColumnMeta, ColumnType},
};

pub const DEFAULT_BINS: u8 = 5;
pub const DEFAULT_FALLBACK_LABEL: &str = "Other";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SegmentationConfig {
    pub bins: u8,
    pub labels: BTreeMap<String, String>,
    pub fallback_label: String,
}

impl Default for SegmentationConfig {
    fn default() -> Self {
        Self {
            bins: DEFAULT_BINS,
            labels: default_labels(),
            fallback_label: DEFAULT_FALLBACK_LABEL.to_string(),
        }
    }
}

impl SegmentationConfig {
    pub fn validate(&self) -> Result<(), PipelineError> {
        // Single-digit scores keep concatenated codes unambiguous.
        if !(1..=9).contains(&self.bins) {
            return Err(PipelineError::InvalidConfig(format!(
                "segmentation bins must be between 1 and 9, got {}",
                self.bins
            )));
        }
        Ok(())
    }

    pub fn label_for(&self, code: &str) -> &str {
        self.labels
            .get(code)
            .map(String::as_str)
            .unwrap_or(&self.fallback_label)
    }
}

/// Standard RFM labels for every code of a five-band scoring.
pub fn default_labels() -> BTreeMap<String, String> {
    iproduct!(1..=5u8, 1..=5u8, 1..=5u8)
        .map(|(r, f, m)| (segment_code(r, f, m), standard_label(r, f, m).to_string()))
        .collect()
}

fn standard_label(r: u8, f: u8, m: u8) -> &'static str {
    let fm = f + m;
    if r >= 4 && fm >= 8 {
        "Champions"
    } else if r >= 3 && fm >= 6 {
        "Loyal Customers"
    } else if r >= 4 && fm >= 4 {
        "Potential Loyalists"
    } else if r == 5 {
        "New Customers"
    } else if r == 4 {
        "Promising"
    } else if r == 3 && fm >= 4 {
        "Need Attention"
    } else if r <= 2 && fm >= 8 {
        "Cannot Lose Them"
    } else if r <= 2 && fm >= 5 {
        "At Risk"
    } else if r >= 2 {
        "Hibernating"
    } else {
        "Lost"
    }
}

pub fn segment_code(recency: u8, frequency: u8, monetary: u8) -> String {
    format!("{recency}{frequency}{monetary}")
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Segment {
    pub recency_score: u8,
    pub frequency_score: u8,
    pub monetary_score: u8,
    pub code: String,
    pub label: String,
}

/// Scores every value into `1..=bins` relative to the whole slice.
pub fn quantile_scores<T>(values: &[T], bins: u8) -> Vec<u8>
where
    T: Ord + Clone,
{
    let boundaries = band_boundaries(values, bins);
    values
        .iter()
        .map(|value| {
            let below = boundaries.iter().filter(|b| *b < value).count();
            // `below` is bounded by bins - 1.
            1 + below as u8
        })
        .collect()
}

/// Largest value of each band but the last; empty bands contribute nothing.
fn band_boundaries<T>(values: &[T], bins: u8) -> Vec<T>
where
    T: Ord + Clone,
{
    let mut sorted = values.to_vec();
    sorted.sort();
    let n = sorted.len();
    let bins = usize::from(bins.max(1));
    let (base, remainder) = (n / bins, n % bins);
    let mut end = 0usize;
    let mut boundaries = Vec::with_capacity(bins.saturating_sub(1));
    for band in 0..bins - 1 {
        let size = base + usize::from(band < remainder);
        if size == 0 {
            continue;
        }
        end += size;
        boundaries.push(sorted[end - 1].clone());
    }
    boundaries
}

pub fn score(
    vectors: &[CustomerFeatureVector],
    config: &SegmentationConfig,
) -> Result<BTreeMap<String, Segment>, PipelineError> {
    config.validate()?;
    let recency: Vec<Reverse<i64>> = vectors.iter().map(|v| Reverse(v.recency_days)).collect();
    let frequency: Vec<usize> = vectors.iter().map(|v| v.frequency).collect();
    let monetary: Vec<_> = vectors.iter().map(|v| v.monetary).collect();

    let r_scores = quantile_scores(&recency, config.bins);
    let f_scores = quantile_scores(&frequency, config.bins);
    let m_scores = quantile_scores(&monetary, config.bins);

    let mut unmapped = 0usize;
    let mut segments = BTreeMap::new();
    for (idx, vector) in vectors.iter().enumerate() {
        let (r, f, m) = (r_scores[idx], f_scores[idx], m_scores[idx]);
        let code = segment_code(r, f, m);
        if !config.labels.contains_key(&code) {
            unmapped += 1;
        }
        let label = config.label_for(&code).to_string();
        segments.insert(
            vector.customer_id.clone(),
            Segment {
                recency_score: r,
                frequency_score: f,
                monetary_score: m,
                code,
                label,
            },
        );
    }

    if unmapped > 0 {
        warn!(
            "{unmapped} customer(s) received unmapped segment codes and were labelled '{}'",
            config.fallback_label
        );
    }
    info!(
        "Scored {} customer(s) into {} band(s) per dimension",
        segments.len(),
        config.bins
    );
    Ok(segments)
}

pub fn segments_dataset(segments: &BTreeMap<String, Segment>) -> Dataset {
    let columns = vec![
        ColumnMeta::required("customer_id", ColumnType::String),
        ColumnMeta::required("recency_score", ColumnType::Integer),
        ColumnMeta::required("frequency_score", ColumnType::Integer),
        ColumnMeta::required("monetary_score", ColumnType::Integer),
        ColumnMeta::required("rfm_code", ColumnType::String),
        ColumnMeta::required("segment", ColumnType::String),
    ];
    let rows = segments
        .iter()
        .map(|(customer, segment)| {
            vec![
                Some(Value::String(customer.clone())),
                Some(Value::Integer(i64::from(segment.recency_score))),
                Some(Value::Integer(i64::from(segment.frequency_score))),
                Some(Value::Integer(i64::from(segment.monetary_score))),
                Some(Value::String(segment.code.clone())),
                Some(Value::String(segment.label.clone())),
            ]
        })
        .collect();
    Dataset::from_rows("customer_segments", columns, rows)
}
