use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Cleanse, enrich, and aggregate e-commerce datasets into published tables",
    long_about = None
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// List catalog sources or show one source's declared columns
    Describe(DescribeArgs),
    /// Enforce a source's declared schema and report violations
    Enforce(EnforceArgs),
    /// Run the full pipeline and publish every output table
    Run(RunArgs),
    /// Show the current snapshot of a published table
    Show(ShowArgs),
    /// List the published snapshot versions of a table
    History(HistoryArgs),
}

#[derive(Debug, Args)]
pub struct DescribeArgs {
    /// Source catalog YAML file
    #[arg(short, long)]
    pub catalog: PathBuf,
    /// Source to describe; lists every source when omitted
    #[arg(short, long)]
    pub source: Option<String>,
}

#[derive(Debug, Args)]
pub struct EnforceArgs {
    /// Source catalog YAML file
    #[arg(short, long)]
    pub catalog: PathBuf,
    /// Source name registered in the catalog
    #[arg(short, long)]
    pub source: String,
    /// Raw input file; defaults to the source's declared location ('-' reads stdin)
    #[arg(short, long)]
    pub input: Option<PathBuf>,
    /// Directory declared locations are relative to
    #[arg(long = "base-dir", default_value = ".")]
    pub base_dir: PathBuf,
    /// Input delimiter when the catalog does not declare one (supports ',', 'tab', ';', '|')
    #[arg(long, value_parser = parse_delimiter)]
    pub delimiter: Option<u8>,
    /// Write the cleansed rows as CSV ('-' for stdout)
    #[arg(short, long)]
    pub output: Option<PathBuf>,
    /// Write the violation report as JSON
    #[arg(long)]
    pub report: Option<PathBuf>,
}

#[derive(Debug, Args)]
pub struct RunArgs {
    /// Source catalog YAML file
    #[arg(short, long)]
    pub catalog: PathBuf,
    /// Pipeline configuration YAML file
    #[arg(long)]
    pub config: PathBuf,
    /// Table store root directory
    #[arg(long)]
    pub store: PathBuf,
    /// Directory declared source locations are relative to
    #[arg(long = "base-dir", default_value = ".")]
    pub base_dir: PathBuf,
    /// Override the reference date (YYYY-MM-DD)
    #[arg(long = "reference-date")]
    pub reference_date: Option<chrono::NaiveDate>,
    /// Write the run report as JSON
    #[arg(long)]
    pub report: Option<PathBuf>,
}

#[derive(Debug, Args)]
pub struct ShowArgs {
    /// Table store root directory
    #[arg(long)]
    pub store: PathBuf,
    /// Published table name
    #[arg(short, long)]
    pub table: String,
    /// Maximum rows to display
    #[arg(long, default_value_t = 20)]
    pub limit: usize,
}

#[derive(Debug, Args)]
pub struct HistoryArgs {
    /// Table store root directory
    #[arg(long)]
    pub store: PathBuf,
    /// Published table name
    #[arg(short, long)]
    pub table: String,
}

pub fn parse_delimiter(value: &str) -> Result<u8, String> {
    match value {
        "tab" | "\t" => Ok(b'\t'),
        "comma" | "," => Ok(b','),
        "|" | "pipe" => Ok(b'|'),
        ";" | "semicolon" => Ok(b';'),
        other => {
            let mut chars = other.chars();
            let first = chars
                .next()
                .ok_or_else(|| "Delimiter cannot be empty".to_string())?;
            if chars.next().is_some() {
                return Err("Delimiter must be a single character".to_string());
            }
            if !first.is_ascii() {
                return Err("Delimiter must be ASCII".to_string());
            }
            Ok(first as u8)
        }
    }
}
