//! Snapshot table stores.
//!
//! A store keeps every published snapshot of a table and one pointer to the
//! current snapshot. Swapping that pointer is the only mutation readers can
//! observe, so a reader sees either the previous snapshot or the new one,
//! never a partially written table.
//!
//! [`FsTableStore`] layout:
//!
//! ```text
//! <root>/<table>/CURRENT.json
//! <root>/<table>/history.jsonl
//! <root>/<table>/snapshots/<snapshot_id>/data.csv
//! <root>/<table>/snapshots/<snapshot_id>/schema.yml
//! ```

use std::{
    collections::HashMap,
    fs::{self, File, OpenOptions},
    io::{BufReader, BufWriter, Write},
    path::{Path, PathBuf},
    sync::{Arc, OnceLock, RwLock},
};

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Utc};
use log::{debug, info};
use regex::Regex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    data::{Value, parse_typed_value},
    dataset::{Dataset, Record},
    error::PipelineError,
    io_utils,
    schema::ColumnMeta,
};

const CURRENT_FILE: &str = "CURRENT.json";
const HISTORY_FILE: &str = "history.jsonl";
const SNAPSHOTS_DIR: &str = "snapshots";
const DATA_FILE: &str = "data.csv";
const SCHEMA_FILE: &str = "schema.yml";
const SNAPSHOT_ID_LEN: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotInfo {
    pub table: String,
    pub snapshot_id: String,
    pub version: u64,
    pub content_hash: String,
    pub row_count: usize,
    pub published_at: DateTime<Utc>,
}

impl SnapshotInfo {
    fn next(
        table: &str,
        previous: Option<&SnapshotInfo>,
        content_hash: &str,
        row_count: usize,
    ) -> Self {
        Self {
            table: table.to_string(),
            snapshot_id: content_hash.chars().take(SNAPSHOT_ID_LEN).collect(),
            version: previous.map_or(1, |p| p.version + 1),
            content_hash: content_hash.to_string(),
            row_count,
            published_at: Utc::now(),
        }
    }
}

/// Storage behind [`crate::publish::TablePublisher`].
///
/// `write_snapshot` must make the new snapshot current atomically: until it
/// returns, `read_current` keeps returning the previous snapshot in full.
pub trait TableStore: Send + Sync {
    fn read_current(&self, table: &str) -> Result<Option<Dataset>>;

    fn current_snapshot(&self, table: &str) -> Result<Option<SnapshotInfo>>;

    fn write_snapshot(
        &self,
        table: &str,
        dataset: &Dataset,
        content_hash: &str,
    ) -> Result<SnapshotInfo>;

    /// Every snapshot made current, oldest first.
    fn history(&self, table: &str) -> Result<Vec<SnapshotInfo>>;
}

pub fn validate_table_name(name: &str) -> Result<(), PipelineError> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    let valid = PATTERN
        .get_or_init(|| Regex::new(r"^[A-Za-z0-9_]+$").ok())
        .as_ref()
        .is_some_and(|re| re.is_match(name));
    if valid {
        Ok(())
    } else {
        Err(PipelineError::InvalidConfig(format!(
            "table name '{name}' must contain only letters, digits, and underscores"
        )))
    }
}

/// Canonical CSV rendering: header row then one row per record, nulls empty.
pub fn encode_csv(dataset: &Dataset) -> Result<Vec<u8>> {
    let mut writer = io_utils::csv_writer(Vec::new(), io_utils::DEFAULT_CSV_DELIMITER);
    writer
        .write_record(dataset.columns.iter().map(|c| c.name.as_str()))
        .with_context(|| format!("Encoding header for '{}'", dataset.name))?;
    for row in dataset.display_rows(None) {
        writer
            .write_record(&row)
            .with_context(|| format!("Encoding rows for '{}'", dataset.name))?;
    }
    writer
        .into_inner()
        .map_err(|err| anyhow!("Flushing CSV for '{}': {}", dataset.name, err.error()))
}

#[derive(Debug, Serialize, Deserialize)]
struct SnapshotSchema {
    table: String,
    columns: Vec<ColumnMeta>,
}

#[derive(Debug, Clone)]
pub struct FsTableStore {
    root: PathBuf,
}

impl FsTableStore {
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)
            .with_context(|| format!("Creating table store root {root:?}"))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn table_dir(&self, table: &str) -> Result<PathBuf> {
        validate_table_name(table)?;
        Ok(self.root.join(table))
    }

    fn snapshot_dir(&self, table: &str, snapshot_id: &str) -> Result<PathBuf> {
        Ok(self.table_dir(table)?.join(SNAPSHOTS_DIR).join(snapshot_id))
    }

    /// Reads a specific snapshot, current or not.
    pub fn read_snapshot(&self, table: &str, snapshot_id: &str) -> Result<Dataset> {
        let dir = self.snapshot_dir(table, snapshot_id)?;
        let schema_path = dir.join(SCHEMA_FILE);
        let schema_file = File::open(&schema_path)
            .with_context(|| format!("Opening snapshot schema {schema_path:?}"))?;
        let schema: SnapshotSchema = serde_yaml::from_reader(BufReader::new(schema_file))
            .with_context(|| format!("Parsing snapshot schema {schema_path:?}"))?;

        let data_path = dir.join(DATA_FILE);
        let mut reader = io_utils::open_csv_reader_from_path(
            &data_path,
            io_utils::DEFAULT_CSV_DELIMITER,
            true,
        )?;
        let headers = io_utils::reader_headers(&mut reader, encoding_rs::UTF_8)?;
        let expected: Vec<&str> = schema.columns.iter().map(|c| c.name.as_str()).collect();
        if headers != expected {
            return Err(anyhow!(
                "Snapshot {snapshot_id} of '{table}' has headers {headers:?}, expected {expected:?}"
            ));
        }

        let mut records = Vec::new();
        for (row_idx, row) in reader.records().enumerate() {
            let row = row.with_context(|| format!("Reading row {} in {data_path:?}", row_idx + 2))?;
            let values = schema
                .columns
                .iter()
                .enumerate()
                .map(|(idx, column)| {
                    // Snapshot text is canonical; declared formats apply to raw sources only.
                    parse_typed_value(row.get(idx).unwrap_or_default(), &column.datatype, None)
                    .with_context(|| {
                        format!(
                            "Decoding column '{}' at row {} in {data_path:?}",
                            column.name,
                            row_idx + 2
                        )
                    })
                })
                .collect::<Result<Vec<Option<Value>>>>()?;
            records.push(Record::new(values));
        }
        Ok(Dataset::new(schema.table, schema.columns).with_records(records))
    }

    fn stage_snapshot(&self, table: &str, dataset: &Dataset, target: &Path) -> Result<()> {
        if target.exists() {
            debug!("Snapshot directory {target:?} already present; reusing it");
            return Ok(());
        }
        let snapshots = self.table_dir(table)?.join(SNAPSHOTS_DIR);
        fs::create_dir_all(&snapshots)
            .with_context(|| format!("Creating snapshot directory {snapshots:?}"))?;
        let staging = snapshots.join(format!(".staging-{}", Uuid::new_v4()));
        fs::create_dir(&staging).with_context(|| format!("Creating staging directory {staging:?}"))?;

        let schema = SnapshotSchema {
            table: table.to_string(),
            columns: dataset.columns.clone(),
        };
        let schema_text = serde_yaml::to_string(&schema)
            .with_context(|| format!("Serializing schema for '{table}'"))?;
        write_synced(&staging.join(SCHEMA_FILE), schema_text.as_bytes())?;
        write_synced(&staging.join(DATA_FILE), &encode_csv(dataset)?)?;

        if let Err(err) = fs::rename(&staging, target) {
            let _ = fs::remove_dir_all(&staging);
            if !target.exists() {
                return Err(err).with_context(|| format!("Moving snapshot into place at {target:?}"));
            }
        }
        Ok(())
    }

    fn swap_current(&self, table: &str, info: &SnapshotInfo) -> Result<()> {
        let dir = self.table_dir(table)?;
        let pointer = dir.join(CURRENT_FILE);
        let temp = dir.join(format!(".{CURRENT_FILE}.{}.tmp", Uuid::new_v4()));
        let payload = serde_json::to_vec_pretty(info)
            .with_context(|| format!("Serializing snapshot pointer for '{table}'"))?;
        write_synced(&temp, &payload)?;
        fs::rename(&temp, &pointer)
            .with_context(|| format!("Swapping current snapshot pointer {pointer:?}"))?;
        Ok(())
    }

    fn append_history(&self, table: &str, info: &SnapshotInfo) -> Result<()> {
        let path = self.table_dir(table)?.join(HISTORY_FILE);
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("Opening snapshot history {path:?}"))?;
        let line = serde_json::to_string(info)
            .with_context(|| format!("Serializing history entry for '{table}'"))?;
        writeln!(file, "{line}").with_context(|| format!("Appending to {path:?}"))?;
        Ok(())
    }
}

fn write_synced(path: &Path, bytes: &[u8]) -> Result<()> {
    let file = File::create(path).with_context(|| format!("Creating {path:?}"))?;
    let mut writer = BufWriter::new(file);
    writer
        .write_all(bytes)
        .with_context(|| format!("Writing {path:?}"))?;
    let file = writer
        .into_inner()
        .map_err(|err| anyhow!("Flushing {path:?}: {}", err.error()))?;
    file.sync_all()
        .with_context(|| format!("Syncing {path:?}"))?;
    Ok(())
}

impl TableStore for FsTableStore {
    fn read_current(&self, table: &str) -> Result<Option<Dataset>> {
        match self.current_snapshot(table)? {
            Some(info) => self.read_snapshot(table, &info.snapshot_id).map(Some),
            None => Ok(None),
        }
    }

    fn current_snapshot(&self, table: &str) -> Result<Option<SnapshotInfo>> {
        let pointer = self.table_dir(table)?.join(CURRENT_FILE);
        if !pointer.exists() {
            return Ok(None);
        }
        let file =
            File::open(&pointer).with_context(|| format!("Opening snapshot pointer {pointer:?}"))?;
        let info = serde_json::from_reader(BufReader::new(file))
            .with_context(|| format!("Parsing snapshot pointer {pointer:?}"))?;
        Ok(Some(info))
    }

    fn write_snapshot(
        &self,
        table: &str,
        dataset: &Dataset,
        content_hash: &str,
    ) -> Result<SnapshotInfo> {
        let previous = self.current_snapshot(table)?;
        let info = SnapshotInfo::next(table, previous.as_ref(), content_hash, dataset.len());
        let target = self.snapshot_dir(table, &info.snapshot_id)?;
        self.stage_snapshot(table, dataset, &target)?;
        self.swap_current(table, &info)?;
        self.append_history(table, &info)?;
        info!(
            "Table '{table}' now at version {} (snapshot {}, {} row(s))",
            info.version, info.snapshot_id, info.row_count
        );
        Ok(info)
    }

    fn history(&self, table: &str) -> Result<Vec<SnapshotInfo>> {
        let path = self.table_dir(table)?.join(HISTORY_FILE);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let content =
            fs::read_to_string(&path).with_context(|| format!("Reading snapshot history {path:?}"))?;
        content
            .lines()
            .filter(|line| !line.trim().is_empty())
            .enumerate()
            .map(|(idx, line)| {
                serde_json::from_str(line)
                    .with_context(|| format!("Parsing history line {} in {path:?}", idx + 1))
            })
            .collect()
    }
}

type MemoryTable = Vec<(SnapshotInfo, Arc<Dataset>)>;

/// In-process store; the current snapshot is the last entry of each table.
#[derive(Debug, Default)]
pub struct MemoryTableStore {
    tables: RwLock<HashMap<String, MemoryTable>>,
}

impl MemoryTableStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Shared handle to the current snapshot; stays valid across later publishes.
    pub fn current_handle(&self, table: &str) -> Result<Option<Arc<Dataset>>> {
        let tables = self
            .tables
            .read()
            .map_err(|_| anyhow!("Table store lock poisoned"))?;
        Ok(tables
            .get(table)
            .and_then(|versions| versions.last())
            .map(|(_, dataset)| Arc::clone(dataset)))
    }

    pub fn table_names(&self) -> Result<Vec<String>> {
        let tables = self
            .tables
            .read()
            .map_err(|_| anyhow!("Table store lock poisoned"))?;
        let mut names: Vec<String> = tables.keys().cloned().collect();
        names.sort();
        Ok(names)
    }
}

impl TableStore for MemoryTableStore {
    fn read_current(&self, table: &str) -> Result<Option<Dataset>> {
        Ok(self.current_handle(table)?.map(|dataset| (*dataset).clone()))
    }

    fn current_snapshot(&self, table: &str) -> Result<Option<SnapshotInfo>> {
        let tables = self
            .tables
            .read()
            .map_err(|_| anyhow!("Table store lock poisoned"))?;
        Ok(tables
            .get(table)
            .and_then(|versions| versions.last())
            .map(|(info, _)| info.clone()))
    }

    fn write_snapshot(
        &self,
        table: &str,
        dataset: &Dataset,
        content_hash: &str,
    ) -> Result<SnapshotInfo> {
        validate_table_name(table)?;
        let snapshot = Arc::new(dataset.clone());
        let mut tables = self
            .tables
            .write()
            .map_err(|_| anyhow!("Table store lock poisoned"))?;
        let versions = tables.entry(table.to_string()).or_default();
        let info = SnapshotInfo::next(
            table,
            versions.last().map(|(info, _)| info),
            content_hash,
            dataset.len(),
        );
        versions.push((info.clone(), snapshot));
        Ok(info)
    }

    fn history(&self, table: &str) -> Result<Vec<SnapshotInfo>> {
        let tables = self
            .tables
            .read()
            .map_err(|_| anyhow!("Table store lock poisoned"))?;
        Ok(tables
            .get(table)
            .map(|versions| versions.iter().map(|(info, _)| info.clone()).collect())
            .unwrap_or_default())
    }
}
