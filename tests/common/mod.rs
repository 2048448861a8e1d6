#![allow(dead_code)]

use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

use commerce_medallion::{
    catalog::SchemaCatalog,
    config::PipelineConfig,
    dataset::RawDataset,
    pipeline::RawSources,
};
use tempfile::{TempDir, tempdir};

pub const CATALOG_YAML: &str = r#"sources:
  - name: orders
    location: orders.csv
    primary_key: [order_id]
    columns:
      - { name: order_id, datatype: string, nullable: false }
      - { name: customer_id, datatype: string, nullable: false }
      - { name: ordered_at, datatype: datetime, nullable: false }
      - { name: delivered_at, datatype: date }
      - { name: total, datatype: currency, nullable: false }
      - { name: status, datatype: string }
  - name: customers
    location: customers.csv
    primary_key: [customer_id]
    columns:
      - { name: customer_id, datatype: string, nullable: false }
      - { name: city, datatype: string }
      - { name: state, datatype: string }
"#;

pub const ORDERS_CSV: &str = "Order ID,customer_id,ordered_at,delivered_at,total,status,channel
1,C1,2024-01-01 09:15:00,2024-01-05,100.00,delivered,web
2,C1,2024-01-10 18:00:00,2024-01-12,50.00,delivered,web
3,C2,2024-01-20 08:00:00,,\"$1,200.50\",shipped,app
4,C9,2024-01-25 12:30:00,2024-01-28,20,delivered,web
5,C3,not-a-date,,15,canceled,web
";

pub const CUSTOMERS_CSV: &str = "customer_id,city,state
C1,Sao Paulo,SP
C2,Rio de Janeiro,RJ
C3,Curitiba,PR
";

pub const PIPELINE_YAML: &str = r#"orders:
  source: orders
  customer_column: customer_id
  order_id_column: order_id
  date_column: ordered_at
  total_column: total
relations:
  - name: customers
    on: [customer_id]
temporal_prefix: order_
intervals:
  - name: delivery_days
    start: ordered_at
    end: delivered_at
reference_date: 2024-02-01
kpis:
  - name: totals
    source: orders
    reducers:
      - { function: sum, column: total, alias: TotalRevenue }
      - { function: count_distinct, column: order_id, alias: TotalOrders }
  - name: revenue_by_state
    source: enriched_orders
    filters: ["status != canceled"]
    group_by: [state]
    reducers:
      - { function: sum, column: total, alias: revenue }
      - { function: count, column: "*", alias: orders }
      - { function: average, column: total, alias: avg_order_value }
"#;

/// Scratch directory helper that cleans up files automatically on drop.
pub struct TestWorkspace {
    temp_dir: TempDir,
}

impl TestWorkspace {
    /// Creates a fresh scratch directory for the current test case.
    pub fn new() -> Self {
        Self {
            temp_dir: tempdir().expect("temp dir"),
        }
    }

    /// Workspace pre-populated with the sample catalog, sources, and pipeline config.
    pub fn with_sample_sources() -> Self {
        let workspace = Self::new();
        workspace.write("catalog.yml", CATALOG_YAML);
        workspace.write("pipeline.yml", PIPELINE_YAML);
        workspace.write("orders.csv", ORDERS_CSV);
        workspace.write("customers.csv", CUSTOMERS_CSV);
        workspace
    }

    /// Returns the root path for all files owned by this workspace.
    pub fn path(&self) -> &Path {
        self.temp_dir.path()
    }

    pub fn join(&self, name: &str) -> PathBuf {
        self.temp_dir.path().join(name)
    }

    /// Writes `contents` into a file under the workspace and returns the path.
    pub fn write(&self, name: &str, contents: &str) -> PathBuf {
        let path = self.temp_dir.path().join(name);
        let mut file = File::create(&path).expect("create temp file");
        file.write_all(contents.as_bytes())
            .expect("write temp file contents");
        path
    }
}

pub fn sample_catalog() -> SchemaCatalog {
    let workspace = TestWorkspace::new();
    let path = workspace.write("catalog.yml", CATALOG_YAML);
    SchemaCatalog::load(&path).expect("sample catalog")
}

pub fn sample_config() -> PipelineConfig {
    serde_yaml::from_str(PIPELINE_YAML).expect("sample pipeline config")
}

pub fn raw_from_csv(name: &str, text: &str) -> RawDataset {
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .from_reader(text.as_bytes());
    let headers = reader
        .headers()
        .expect("headers")
        .iter()
        .map(String::from)
        .collect();
    let rows = reader
        .records()
        .map(|record| record.expect("record").iter().map(String::from).collect())
        .collect();
    RawDataset::new(name, headers, rows)
}

pub fn sample_sources() -> RawSources {
    RawSources::new()
        .with(raw_from_csv("orders", ORDERS_CSV))
        .with(raw_from_csv("customers", CUSTOMERS_CSV))
}
