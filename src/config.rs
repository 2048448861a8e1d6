//! Pipeline configuration loaded from YAML.
//!
//! ```yaml
//! orders:
//!   source: orders
//!   customer_column: customer_id
//!   order_id_column: order_id
//!   date_column: ordered_at
//!   total_column: total
//! relations:
//!   - name: customers
//!     on: [customer_id]
//! temporal_prefix: order_
//! intervals:
//!   - name: delivery_days
//!     start: ordered_at
//!     end: delivered_at
//! tenure_bands:
//!   - { label: new, max_days: 90 }
//!   - { label: returning }
//! segmentation:
//!   bins: 5
//!   fallback_label: Other
//! reference_date: 2024-02-01
//! kpis:
//!   - name: revenue_by_state
//!     source: enriched_orders
//!     group_by: [state]
//!     reducers:
//!       - { function: sum, column: total, alias: revenue }
//! ```

use std::{collections::BTreeSet, fs::File, io::BufReader, path::Path};

use anyhow::{Context, Result};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::{
    aggregate::KpiDefinition,
    enrich::JoinKey,
    error::PipelineError,
    features::{OrderColumns, TenureBands},
    segment::SegmentationConfig,
    store,
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrdersConfig {
    pub source: String,
    pub customer_column: String,
    pub order_id_column: String,
    pub date_column: String,
    pub total_column: String,
}

impl OrdersConfig {
    pub fn columns(&self) -> OrderColumns {
        OrderColumns {
            customer: self.customer_column.clone(),
            order_id: self.order_id_column.clone(),
            order_date: self.date_column.clone(),
            total: self.total_column.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelationConfig {
    pub name: String,
    /// Catalog source backing the relation; defaults to `name`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    /// Key column(s) on the orders side.
    pub on: Vec<String>,
    /// Key column(s) on the relation side; defaults to `on`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub relation_on: Vec<String>,
}

impl RelationConfig {
    pub fn source_name(&self) -> &str {
        self.source.as_deref().unwrap_or(&self.name)
    }

    pub fn join_key(&self) -> JoinKey {
        let relation = if self.relation_on.is_empty() {
            self.on.clone()
        } else {
            self.relation_on.clone()
        };
        JoinKey::composite(self.on.clone(), relation)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntervalConfig {
    pub name: String,
    pub start: String,
    pub end: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub orders: OrdersConfig,
    #[serde(default)]
    pub relations: Vec<RelationConfig>,
    #[serde(default)]
    pub temporal_prefix: String,
    #[serde(default)]
    pub intervals: Vec<IntervalConfig>,
    #[serde(default)]
    pub tenure_bands: TenureBands,
    #[serde(default)]
    pub segmentation: SegmentationConfig,
    /// Defaults to the day after the latest order date.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference_date: Option<NaiveDate>,
    #[serde(default)]
    pub kpis: Vec<KpiDefinition>,
}

impl PipelineConfig {
    pub fn new(orders: OrdersConfig) -> Self {
        Self {
            orders,
            relations: Vec::new(),
            temporal_prefix: String::new(),
            intervals: Vec::new(),
            tenure_bands: TenureBands::default(),
            segmentation: SegmentationConfig::default(),
            reference_date: None,
            kpis: Vec::new(),
        }
    }

    pub fn load(path: &Path) -> Result<Self> {
        let file = File::open(path).with_context(|| format!("Opening pipeline config {path:?}"))?;
        let config: Self = serde_yaml::from_reader(BufReader::new(file))
            .with_context(|| format!("Parsing pipeline config YAML {path:?}"))?;
        config
            .validate()
            .with_context(|| format!("Validating pipeline config {path:?}"))?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), PipelineError> {
        self.tenure_bands.validate()?;
        self.segmentation.validate()?;

        let mut relations = BTreeSet::new();
        for relation in &self.relations {
            if !relations.insert(relation.name.as_str()) {
                return Err(PipelineError::InvalidConfig(format!(
                    "relation '{}' is declared more than once",
                    relation.name
                )));
            }
        }

        let mut kpis = BTreeSet::new();
        for kpi in &self.kpis {
            store::validate_table_name(&kpi.name)?;
            if !kpis.insert(kpi.name.as_str()) {
                return Err(PipelineError::InvalidConfig(format!(
                    "KPI '{}' is declared more than once",
                    kpi.name
                )));
            }
            kpi.validate()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
orders:
  source: orders
  customer_column: customer_id
  order_id_column: order_id
  date_column: ordered_at
  total_column: total
relations:
  - name: customers
    on: [customer_id]
kpis:
  - name: totals
    source: orders
    reducers:
      - { function: sum, column: total, alias: TotalRevenue }
      - { function: count_distinct, column: order_id, alias: TotalOrders }
"#;

    #[test]
    fn parses_with_defaults() {
        let config: PipelineConfig = serde_yaml::from_str(SAMPLE).expect("parse");
        config.validate().expect("valid");
        assert_eq!(config.segmentation.bins, 5);
        assert_eq!(config.tenure_bands.bucket(10), "new");
        assert_eq!(config.relations[0].source_name(), "customers");
        assert_eq!(
            config.relations[0].join_key(),
            JoinKey::same("customer_id")
        );
        assert_eq!(config.kpis[0].reducers.len(), 2);
        assert!(config.reference_date.is_none());
    }

    #[test]
    fn rejects_duplicate_kpi_names() {
        let mut config: PipelineConfig = serde_yaml::from_str(SAMPLE).expect("parse");
        config.kpis.push(config.kpis[0].clone());
        assert!(config.validate().is_err());
    }
}
