pub mod aggregate;
pub mod catalog;
pub mod cli;
pub mod config;
pub mod data;
pub mod dataset;
pub mod enforce;
pub mod enrich;
pub mod error;
pub mod features;
pub mod filter;
pub mod io_utils;
pub mod pipeline;
pub mod publish;
pub mod schema;
pub mod segment;
pub mod store;
pub mod table;

use std::{env, path::Path, sync::OnceLock};

use anyhow::{Context, Result, anyhow};
use clap::Parser;
use log::{LevelFilter, info};

use crate::{
    catalog::SchemaCatalog,
    cli::{Cli, Commands},
    config::PipelineConfig,
    dataset::RawDataset,
    pipeline::{Pipeline, RawSources},
    store::{FsTableStore, TableStore},
};

static LOGGER: OnceLock<()> = OnceLock::new();

fn init_logging() {
    LOGGER.get_or_init(|| {
        let mut builder = env_logger::Builder::from_env(env_logger::Env::default());
        if env::var("RUST_LOG").is_err() {
            builder.filter_module("commerce_medallion", LevelFilter::Info);
        }
        let _ = builder.format_timestamp_millis().try_init();
    });
}

pub fn run() -> Result<()> {
    init_logging();
    let cli = Cli::parse();
    match cli.command {
        Commands::Describe(args) => handle_describe(&args),
        Commands::Enforce(args) => handle_enforce(&args),
        Commands::Run(args) => handle_run(&args),
        Commands::Show(args) => handle_show(&args),
        Commands::History(args) => handle_history(&args),
    }
}

fn handle_describe(args: &cli::DescribeArgs) -> Result<()> {
    let catalog = SchemaCatalog::load(&args.catalog)?;
    match &args.source {
        Some(name) => {
            let descriptor = catalog.describe(name)?;
            let headers = ["column", "type", "nullable", "key", "format"].map(String::from);
            let rows: Vec<Vec<String>> = descriptor
                .columns
                .iter()
                .map(|column| {
                    vec![
                        column.name.clone(),
                        column.datatype.to_string(),
                        column.nullable.to_string(),
                        descriptor.primary_key.contains(&column.name).to_string(),
                        column.format.clone().unwrap_or_default(),
                    ]
                })
                .collect();
            table::print_table(&headers, &rows);
        }
        None => {
            let headers = ["source", "format", "columns", "location"].map(String::from);
            let rows: Vec<Vec<String>> = catalog
                .descriptors()
                .map(|descriptor| {
                    vec![
                        descriptor.name.clone(),
                        format!("{:?}", descriptor.format).to_lowercase(),
                        descriptor.columns.len().to_string(),
                        descriptor.location.clone().unwrap_or_default(),
                    ]
                })
                .collect();
            table::print_table(&headers, &rows);
        }
    }
    Ok(())
}

fn handle_enforce(args: &cli::EnforceArgs) -> Result<()> {
    let catalog = SchemaCatalog::load(&args.catalog)?;
    let descriptor = catalog.describe(&args.source)?;
    let input = match (&args.input, &descriptor.location) {
        (Some(path), _) => path.clone(),
        (None, Some(location)) => args.base_dir.join(location),
        (None, None) => {
            return Err(anyhow!(
                "Source '{}' declares no location; pass --input",
                descriptor.name
            ));
        }
    };
    info!("Enforcing '{}' from {input:?}", descriptor.name);
    let raw = RawDataset::load_for(descriptor, &input, args.delimiter)
        .with_context(|| format!("Loading raw data from {input:?}"))?;
    let (dataset, report) = enforce::enforce(raw, descriptor);

    let output_to_stdout = args
        .output
        .as_deref()
        .is_some_and(io_utils::is_dash);
    if let Some(output) = &args.output {
        let mut writer =
            io_utils::open_csv_writer(Some(output.as_path()), io_utils::DEFAULT_CSV_DELIMITER)?;
        writer
            .write_record(dataset.column_names())
            .with_context(|| format!("Writing header to {output:?}"))?;
        for row in dataset.display_rows(None) {
            writer
                .write_record(&row)
                .with_context(|| format!("Writing row to {output:?}"))?;
        }
        writer.flush().with_context(|| format!("Flushing {output:?}"))?;
    }
    if let Some(path) = &args.report {
        write_json(path, &report)?;
    }
    if !output_to_stdout {
        let headers = ["column", "null_in_required", "coercion_failures"].map(String::from);
        table::print_table(&headers, &report.render_rows());
        println!(
            "{} row(s), {} with violations, {} duplicate primary key(s)",
            report.total_rows, report.rows_with_violations, report.duplicate_primary_keys
        );
    }
    Ok(())
}

fn handle_run(args: &cli::RunArgs) -> Result<()> {
    let catalog = SchemaCatalog::load(&args.catalog)?;
    let mut config = PipelineConfig::load(&args.config)?;
    if let Some(date) = args.reference_date {
        config.reference_date = Some(date);
    }
    let store = FsTableStore::open(&args.store)?;
    let sources = RawSources::load(&catalog, &args.base_dir)?;
    let report = Pipeline::new(&catalog, &config).run(sources, &store)?;
    if let Some(path) = &args.report {
        report.write(path)?;
    }

    let headers = ["table", "outcome", "version", "snapshot", "rows"].map(String::from);
    let rows: Vec<Vec<String>> = report
        .tables
        .iter()
        .map(|receipt| {
            vec![
                receipt.table.clone(),
                receipt.outcome.to_string(),
                receipt.snapshot.version.to_string(),
                receipt.snapshot.snapshot_id.clone(),
                receipt.snapshot.row_count.to_string(),
            ]
        })
        .collect();
    table::print_table(&headers, &rows);
    Ok(())
}

fn open_existing_store(path: &Path) -> Result<FsTableStore> {
    if !path.is_dir() {
        return Err(anyhow!("Table store {path:?} does not exist"));
    }
    FsTableStore::open(path)
}

fn handle_show(args: &cli::ShowArgs) -> Result<()> {
    let store = open_existing_store(&args.store)?;
    let dataset = store
        .read_current(&args.table)?
        .ok_or_else(|| anyhow!("Table '{}' has not been published", args.table))?;
    print!("{}", table::render_dataset(&dataset, Some(args.limit)));
    info!(
        "Displayed {} of {} row(s) from '{}'",
        dataset.len().min(args.limit),
        dataset.len(),
        args.table
    );
    Ok(())
}

fn handle_history(args: &cli::HistoryArgs) -> Result<()> {
    let store = open_existing_store(&args.store)?;
    let current = store.current_snapshot(&args.table)?;
    let history = store.history(&args.table)?;
    if history.is_empty() {
        return Err(anyhow!("Table '{}' has not been published", args.table));
    }
    let headers = ["version", "snapshot", "rows", "published_at", "current"].map(String::from);
    let rows: Vec<Vec<String>> = history
        .iter()
        .map(|info| {
            let is_current = current.as_ref().is_some_and(|c| c.version == info.version);
            vec![
                info.version.to_string(),
                info.snapshot_id.clone(),
                info.row_count.to_string(),
                info.published_at.format("%Y-%m-%d %H:%M:%S").to_string(),
                if is_current { "*".to_string() } else { String::new() },
            ]
        })
        .collect();
    table::print_table(&headers, &rows);
    Ok(())
}

fn write_json<T: serde::Serialize>(path: &Path, value: &T) -> Result<()> {
    let payload = serde_json::to_vec_pretty(value).context("Serializing report")?;
    std::fs::write(path, payload).with_context(|| format!("Writing {path:?}"))
}
