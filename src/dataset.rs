//! In-memory dataset values that flow between stages.
//!
//! [`RawDataset`] holds untyped string rows exactly as ingestion landed them.
//! [`Dataset`] holds typed [`Record`]s aligned with an ordered list of
//! [`ColumnMeta`]. Stages take datasets by value or reference and return new
//! datasets; none of them keeps a handle on another stage's working set.

use std::{
    collections::{BTreeMap, BTreeSet},
    fmt,
    fs::File,
    io::BufReader,
    path::Path,
};

use anyhow::{Context, Result, anyhow};
use encoding_rs::Encoding;
use serde::{Deserialize, Serialize};

use crate::{
    data::Value,
    error::PipelineError,
    io_utils,
    schema::{ColumnMeta, SourceDescriptor, SourceFormat},
};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawDataset {
    pub name: String,
    pub headers: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

impl RawDataset {
    pub fn new(name: impl Into<String>, headers: Vec<String>, rows: Vec<Vec<String>>) -> Self {
        Self {
            name: name.into(),
            headers,
            rows,
        }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Reads a delimited file with a header row.
    pub fn from_delimited(
        name: &str,
        path: &Path,
        delimiter: u8,
        encoding: &'static Encoding,
    ) -> Result<Self> {
        let mut reader = io_utils::open_csv_reader_from_path(path, delimiter, true)?;
        let headers = io_utils::reader_headers(&mut reader, encoding)?;
        let mut rows = Vec::new();
        for (row_idx, record) in reader.byte_records().enumerate() {
            let record =
                record.with_context(|| format!("Reading row {} in {path:?}", row_idx + 2))?;
            rows.push(io_utils::decode_record(&record, encoding)?);
        }
        Ok(Self::new(name, headers, rows))
    }

    /// Reads a JSON array of objects, or one JSON object per line.
    pub fn from_structured(name: &str, path: &Path) -> Result<Self> {
        let file = File::open(path).with_context(|| format!("Opening input file {path:?}"))?;
        let content = std::io::read_to_string(BufReader::new(file))
            .with_context(|| format!("Reading input file {path:?}"))?;
        let objects: Vec<serde_json::Map<String, serde_json::Value>> =
            if content.trim_start().starts_with('[') {
                serde_json::from_str(&content)
                    .with_context(|| format!("Parsing JSON array in {path:?}"))?
            } else {
                content
                    .lines()
                    .enumerate()
                    .filter(|(_, line)| !line.trim().is_empty())
                    .map(|(idx, line)| {
                        serde_json::from_str(line)
                            .with_context(|| format!("Parsing JSON line {} in {path:?}", idx + 1))
                    })
                    .collect::<Result<_>>()?
            };

        let mut headers: Vec<String> = Vec::new();
        for object in &objects {
            for key in object.keys() {
                if !headers.contains(key) {
                    headers.push(key.clone());
                }
            }
        }
        let rows = objects
            .iter()
            .map(|object| {
                headers
                    .iter()
                    .map(|header| match object.get(header) {
                        None | Some(serde_json::Value::Null) => String::new(),
                        Some(serde_json::Value::String(s)) => s.clone(),
                        Some(other) => other.to_string(),
                    })
                    .collect()
            })
            .collect();
        Ok(Self::new(name, headers, rows))
    }

    /// Loads the landed file at `location` using the descriptor's format settings.
    pub fn load_for(
        descriptor: &SourceDescriptor,
        location: &Path,
        default_delimiter: Option<u8>,
    ) -> Result<Self> {
        match descriptor.format {
            SourceFormat::Delimited => {
                let delimiter = io_utils::resolve_input_delimiter(
                    location,
                    descriptor.delimiter_byte().or(default_delimiter),
                );
                let encoding = io_utils::resolve_encoding(descriptor.encoding.as_deref())?;
                Self::from_delimited(&descriptor.name, location, delimiter, encoding)
            }
            SourceFormat::Structured => Self::from_structured(&descriptor.name, location),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "tag", content = "column", rename_all = "snake_case")]
pub enum ViolationTag {
    TypeCoercionFailed(String),
    NullInRequiredField(String),
}

impl fmt::Display for ViolationTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ViolationTag::TypeCoercionFailed(column) => write!(f, "type_coerced=false({column})"),
            ViolationTag::NullInRequiredField(column) => {
                write!(f, "null_in_required_field({column})")
            }
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Record {
    pub values: Vec<Option<Value>>,
    pub violations: BTreeSet<ViolationTag>,
}

impl Record {
    pub fn new(values: Vec<Option<Value>>) -> Self {
        Self {
            values,
            violations: BTreeSet::new(),
        }
    }

    pub fn get(&self, index: usize) -> Option<&Value> {
        self.values.get(index).and_then(|v| v.as_ref())
    }

    pub fn is_clean(&self) -> bool {
        self.violations.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Dataset {
    pub name: String,
    pub columns: Vec<ColumnMeta>,
    pub records: Vec<Record>,
}

impl Dataset {
    pub fn new(name: impl Into<String>, columns: Vec<ColumnMeta>) -> Self {
        Self {
            name: name.into(),
            columns,
            records: Vec::new(),
        }
    }

    pub fn with_records(mut self, records: Vec<Record>) -> Self {
        self.records = records;
        self
    }

    /// Builds a dataset from value rows; convenient for reference data and tests.
    pub fn from_rows(
        name: impl Into<String>,
        columns: Vec<ColumnMeta>,
        rows: Vec<Vec<Option<Value>>>,
    ) -> Self {
        let records = rows.into_iter().map(Record::new).collect();
        Self::new(name, columns).with_records(records)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    pub fn require_column(&self, name: &str) -> Result<usize, PipelineError> {
        self.column_index(name)
            .ok_or_else(|| PipelineError::unknown_column(&self.name, name))
    }

    pub fn column_names(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.name.clone()).collect()
    }

    pub fn value(&self, row: usize, column: &str) -> Option<&Value> {
        let idx = self.column_index(column)?;
        self.records.get(row).and_then(|r| r.get(idx))
    }

    /// Row view keyed by column name.
    pub fn row_map(&self, row: usize) -> Option<BTreeMap<&str, Option<&Value>>> {
        let record = self.records.get(row)?;
        Some(
            self.columns
                .iter()
                .zip(record.values.iter())
                .map(|(column, value)| (column.name.as_str(), value.as_ref()))
                .collect(),
        )
    }

    /// Appends a column computed per record. Fails if the name already exists.
    pub fn push_column<F>(&mut self, column: ColumnMeta, mut compute: F) -> Result<()>
    where
        F: FnMut(&Record) -> Option<Value>,
    {
        if self.column_index(&column.name).is_some() {
            return Err(anyhow!(
                "Column '{}' already exists in dataset '{}'",
                column.name,
                self.name
            ));
        }
        for record in &mut self.records {
            let value = compute(record);
            record.values.push(value);
        }
        self.columns.push(column);
        Ok(())
    }

    pub fn renamed(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Renders every cell as display text; nulls render empty.
    pub fn display_rows(&self, limit: Option<usize>) -> Vec<Vec<String>> {
        self.records
            .iter()
            .take(limit.unwrap_or(usize::MAX))
            .map(|record| {
                record
                    .values
                    .iter()
                    .map(|value| value.as_ref().map(Value::as_display).unwrap_or_default())
                    .collect()
            })
            .collect()
    }
}
