//! End-to-end run: enforce → enrich → features → {segments, KPIs} → publish.
//!
//! Every transformation finishes before the first table is published, so a
//! fatal error or a cancellation leaves the store exactly as it was.

use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread,
};

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Days, NaiveDate, Utc};
use log::{debug, info};
use serde::Serialize;
use uuid::Uuid;

use crate::{
    aggregate,
    catalog::SchemaCatalog,
    config::PipelineConfig,
    dataset::{Dataset, RawDataset},
    enforce::{self, ViolationReport},
    enrich::{self, Relation},
    error::PipelineError,
    features::{self, timestamp_date},
    publish::{PublishReceipt, TablePublisher},
    schema::SourceFormat,
    segment,
    store::TableStore,
};

pub const ENRICHED_ORDERS: &str = "enriched_orders";
pub const CUSTOMER_FEATURES: &str = "customer_features";
pub const CUSTOMER_SEGMENTS: &str = "customer_segments";

pub fn cleansed_table_name(source: &str) -> String {
    format!("cleansed_{source}")
}

/// Shared cancellation signal, checked between stages and before publication.
#[derive(Debug, Clone, Default)]
pub struct CancellationFlag(Arc<AtomicBool>);

impl CancellationFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn check(&self) -> Result<(), PipelineError> {
        if self.is_cancelled() {
            Err(PipelineError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Landed raw datasets keyed by source name.
#[derive(Debug, Clone, Default)]
pub struct RawSources {
    datasets: BTreeMap<String, RawDataset>,
}

impl RawSources {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, raw: RawDataset) -> Option<RawDataset> {
        self.datasets.insert(raw.name.clone(), raw)
    }

    pub fn with(mut self, raw: RawDataset) -> Self {
        self.insert(raw);
        self
    }

    pub fn names(&self) -> Vec<&str> {
        self.datasets.keys().map(String::as_str).collect()
    }

    /// Loads every catalog source from its declared location under `base_dir`.
    /// Sources without a location are read from `<base_dir>/<name>.csv`
    /// (`.json` for structured sources).
    pub fn load(catalog: &SchemaCatalog, base_dir: &Path) -> Result<Self> {
        let mut sources = Self::new();
        for descriptor in catalog.descriptors() {
            let location = match &descriptor.location {
                Some(location) => resolve_location(base_dir, location),
                None => {
                    let extension = match descriptor.format {
                        SourceFormat::Delimited => "csv",
                        SourceFormat::Structured => "json",
                    };
                    base_dir.join(format!("{}.{extension}", descriptor.name))
                }
            };
            let raw = RawDataset::load_for(descriptor, &location, None)
                .with_context(|| format!("Loading source '{}' from {location:?}", descriptor.name))?;
            debug!(
                "Loaded {} raw row(s) for '{}' from {location:?}",
                raw.len(),
                descriptor.name
            );
            sources.insert(raw);
        }
        Ok(sources)
    }
}

fn resolve_location(base_dir: &Path, location: &str) -> PathBuf {
    let path = Path::new(location);
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base_dir.join(path)
    }
}

/// Everything a run computes, in publication order.
#[derive(Debug, Clone)]
pub struct RunOutputs {
    pub reference_date: NaiveDate,
    pub violations: Vec<ViolationReport>,
    pub tables: Vec<(String, Dataset)>,
    pub customers: usize,
    pub skipped_orders: usize,
}

impl RunOutputs {
    pub fn table(&self, name: &str) -> Option<&Dataset> {
        self.tables
            .iter()
            .find(|(table, _)| table == name)
            .map(|(_, dataset)| dataset)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub reference_date: NaiveDate,
    pub violations: Vec<ViolationReport>,
    pub tables: Vec<PublishReceipt>,
    pub customers: usize,
    pub skipped_orders: usize,
}

impl RunReport {
    pub fn write(&self, path: &Path) -> Result<()> {
        let payload = serde_json::to_vec_pretty(self).context("Serializing run report")?;
        fs::write(path, payload).with_context(|| format!("Writing run report {path:?}"))
    }
}

pub struct Pipeline<'a> {
    catalog: &'a SchemaCatalog,
    config: &'a PipelineConfig,
    cancellation: CancellationFlag,
}

impl<'a> Pipeline<'a> {
    pub fn new(catalog: &'a SchemaCatalog, config: &'a PipelineConfig) -> Self {
        Self {
            catalog,
            config,
            cancellation: CancellationFlag::new(),
        }
    }

    pub fn with_cancellation(mut self, flag: CancellationFlag) -> Self {
        self.cancellation = flag;
        self
    }

    pub fn cancellation(&self) -> CancellationFlag {
        self.cancellation.clone()
    }

    /// Transforms `sources` and publishes every output table to `store`.
    pub fn run(&self, sources: RawSources, store: &dyn TableStore) -> Result<RunReport> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        info!("Starting run {run_id}");
        let outputs = self.transform(sources)?;

        self.cancellation.check()?;
        let publisher = TablePublisher::new(store);
        let mut receipts = Vec::with_capacity(outputs.tables.len());
        for (table, dataset) in &outputs.tables {
            receipts.push(publisher.publish(table, dataset)?);
        }
        info!(
            "Run {run_id} published {} table(s) as of {}",
            receipts.len(),
            outputs.reference_date
        );
        Ok(RunReport {
            run_id,
            started_at,
            reference_date: outputs.reference_date,
            violations: outputs.violations,
            tables: receipts,
            customers: outputs.customers,
            skipped_orders: outputs.skipped_orders,
        })
    }

    /// Runs every transformation without touching a store.
    pub fn transform(&self, sources: RawSources) -> Result<RunOutputs> {
        self.config.validate()?;
        self.cancellation.check()?;
        let (cleansed, violations) = self.enforce_all(sources)?;

        self.cancellation.check()?;
        let orders_source = &self.config.orders.source;
        let orders = cleansed
            .get(orders_source)
            .cloned()
            .ok_or_else(|| PipelineError::UnknownSource(orders_source.clone()))?;
        let relations = self
            .config
            .relations
            .iter()
            .map(|relation| {
                let dataset = cleansed
                    .get(relation.source_name())
                    .cloned()
                    .ok_or_else(|| PipelineError::UnknownSource(relation.source_name().to_string()))?;
                Ok::<_, PipelineError>(Relation::new(
                    &relation.name,
                    dataset,
                    relation.join_key(),
                ))
            })
            .collect::<Result<Vec<_>, _>>()?;
        let mut enriched = enrich::enrich(orders, &relations)?.renamed(ENRICHED_ORDERS);

        self.cancellation.check()?;
        let order_columns = self.config.orders.columns();
        enriched = features::derive_temporal(
            enriched,
            &order_columns.order_date,
            &self.config.temporal_prefix,
        )?;
        for interval in &self.config.intervals {
            enriched = features::derive_day_interval(
                enriched,
                &interval.start,
                &interval.end,
                &interval.name,
            )?;
        }

        let reference_date = match self.config.reference_date {
            Some(date) => date,
            None => default_reference_date(&enriched, &order_columns.order_date)?,
        };
        let customer_features = features::derive_customer_features(
            &enriched,
            &order_columns,
            reference_date,
            &self.config.tenure_bands,
        )?;

        self.cancellation.check()?;
        let segments = segment::score(&customer_features.vectors, &self.config.segmentation)?;

        let mut tables: Vec<(String, Dataset)> = cleansed
            .into_iter()
            .map(|(source, dataset)| {
                let table = cleansed_table_name(&source);
                (table.clone(), dataset.renamed(table))
            })
            .collect();
        tables.push((ENRICHED_ORDERS.to_string(), enriched));
        tables.push((
            CUSTOMER_FEATURES.to_string(),
            features::customer_features_dataset(&customer_features.vectors),
        ));
        tables.push((
            CUSTOMER_SEGMENTS.to_string(),
            segment::segments_dataset(&segments),
        ));

        self.cancellation.check()?;
        let mut kpi_tables = Vec::with_capacity(self.config.kpis.len());
        for definition in &self.config.kpis {
            let source = resolve_kpi_source(&tables, &definition.source)
                .ok_or_else(|| PipelineError::UnknownSource(definition.source.clone()))?;
            let result = aggregate::aggregate(source, definition)?;
            kpi_tables.push((definition.name.clone(), result.to_dataset()));
        }
        for (name, _) in &kpi_tables {
            if tables.iter().any(|(table, _)| table == name) {
                return Err(PipelineError::InvalidConfig(format!(
                    "KPI '{name}' collides with a pipeline table of the same name"
                ))
                .into());
            }
        }
        tables.extend(kpi_tables);

        Ok(RunOutputs {
            reference_date,
            violations,
            tables,
            customers: customer_features.vectors.len(),
            skipped_orders: customer_features.skipped_orders,
        })
    }

    /// Enforces every source against its descriptor, one worker per source.
    fn enforce_all(
        &self,
        sources: RawSources,
    ) -> Result<(BTreeMap<String, Dataset>, Vec<ViolationReport>)> {
        for name in sources.datasets.keys() {
            self.catalog.describe(name)?;
        }
        let mut jobs = Vec::new();
        let mut datasets = sources.datasets;
        for descriptor in self.catalog.descriptors() {
            let raw = datasets
                .remove(&descriptor.name)
                .ok_or_else(|| anyhow!("No raw data was landed for source '{}'", descriptor.name))?;
            jobs.push((raw, descriptor));
        }

        let results = thread::scope(|scope| {
            let handles: Vec<_> = jobs
                .into_iter()
                .map(|(raw, descriptor)| scope.spawn(move || enforce::enforce(raw, descriptor)))
                .collect();
            handles
                .into_iter()
                .map(|handle| {
                    handle
                        .join()
                        .map_err(|_| anyhow!("Enforcement worker panicked"))
                })
                .collect::<Result<Vec<_>>>()
        })?;

        let mut cleansed = BTreeMap::new();
        let mut reports = Vec::with_capacity(results.len());
        for (dataset, report) in results {
            cleansed.insert(dataset.name.clone(), dataset);
            reports.push(report);
        }
        Ok((cleansed, reports))
    }
}

/// Day after the latest order date; today when there are no dated orders.
fn default_reference_date(orders: &Dataset, date_column: &str) -> Result<NaiveDate, PipelineError> {
    let idx = orders.require_column(date_column)?;
    let mut latest: Option<NaiveDate> = None;
    for (row, record) in orders.records.iter().enumerate() {
        if let Some(value) = record.get(idx) {
            let date = timestamp_date(value, date_column, row + 1)?;
            latest = Some(latest.map_or(date, |current| current.max(date)));
        }
    }
    let date = match latest {
        Some(date) => date.checked_add_days(Days::new(1)).unwrap_or(date),
        None => Utc::now().date_naive(),
    };
    debug!("Using reference date {date}");
    Ok(date)
}

fn resolve_kpi_source<'t>(tables: &'t [(String, Dataset)], name: &str) -> Option<&'t Dataset> {
    let cleansed = cleansed_table_name(name);
    tables
        .iter()
        .find(|(table, _)| table == name)
        .or_else(|| tables.iter().find(|(table, _)| *table == cleansed))
        .map(|(_, dataset)| dataset)
}
