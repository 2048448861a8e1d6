//! Named KPI aggregation over typed datasets.
//!
//! A [`KpiDefinition`] names its source dataset, optional row filters, the
//! group-by dimensions, and one or more reducers. Groups are keyed by the
//! ordered tuple of dimension values (null is a key value of its own) and kept
//! in a sorted map, so output order and values are a pure function of the input.

use std::{
    collections::{BTreeMap, BTreeSet},
    fmt,
    str::FromStr,
};

use log::{debug, info};
use rust_decimal::{Decimal, prelude::ToPrimitive};
use serde::{Deserialize, Serialize};

use crate::{
    data::{ComparableValue, Value},
    dataset::{Dataset, Record},
    error::PipelineError,
    filter,
    schema::{ColumnMeta, ColumnType},
};

const AVERAGE_SCALE: u32 = 6;
pub const ALL_ROWS: &str = "*";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReducerFunction {
    Sum,
    Count,
    #[serde(alias = "distinct_count")]
    CountDistinct,
    #[serde(alias = "avg", alias = "mean")]
    Average,
    Min,
    Max,
}

impl ReducerFunction {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReducerFunction::Sum => "sum",
            ReducerFunction::Count => "count",
            ReducerFunction::CountDistinct => "count_distinct",
            ReducerFunction::Average => "average",
            ReducerFunction::Min => "min",
            ReducerFunction::Max => "max",
        }
    }

    fn requires_numeric(&self) -> bool {
        matches!(self, ReducerFunction::Sum | ReducerFunction::Average)
    }
}

impl fmt::Display for ReducerFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ReducerFunction {
    type Err = PipelineError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "sum" => Ok(ReducerFunction::Sum),
            "count" => Ok(ReducerFunction::Count),
            "count_distinct" | "distinct_count" => Ok(ReducerFunction::CountDistinct),
            "average" | "avg" | "mean" => Ok(ReducerFunction::Average),
            "min" => Ok(ReducerFunction::Min),
            "max" => Ok(ReducerFunction::Max),
            other => Err(PipelineError::InvalidConfig(format!(
                "unknown reducer '{other}'"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reducer {
    pub function: ReducerFunction,
    pub column: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
}

impl Reducer {
    pub fn new(function: ReducerFunction, column: impl Into<String>) -> Self {
        Self {
            function,
            column: column.into(),
            alias: None,
        }
    }

    pub fn with_alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = Some(alias.into());
        self
    }

    /// Output column name; defaults to `<function>_<column>`.
    pub fn output_name(&self) -> String {
        match &self.alias {
            Some(alias) => alias.clone(),
            None if self.column == ALL_ROWS => self.function.as_str().to_string(),
            None => format!("{}_{}", self.function, self.column),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KpiDefinition {
    pub name: String,
    pub source: String,
    #[serde(default)]
    pub filters: Vec<String>,
    #[serde(default)]
    pub group_by: Vec<String>,
    pub reducers: Vec<Reducer>,
}

impl KpiDefinition {
    pub fn new(name: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            source: source.into(),
            filters: Vec::new(),
            group_by: Vec::new(),
            reducers: Vec::new(),
        }
    }

    pub fn group_by<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.group_by = columns.into_iter().map(Into::into).collect();
        self
    }

    pub fn filter(mut self, expression: impl Into<String>) -> Self {
        self.filters.push(expression.into());
        self
    }

    pub fn reducer(mut self, reducer: Reducer) -> Self {
        self.reducers.push(reducer);
        self
    }

    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.reducers.is_empty() {
            return Err(PipelineError::InvalidConfig(format!(
                "KPI '{}' declares no reducers",
                self.name
            )));
        }
        let mut outputs: BTreeSet<String> = self.group_by.iter().cloned().collect();
        if outputs.len() != self.group_by.len() {
            return Err(PipelineError::InvalidConfig(format!(
                "KPI '{}' repeats a group-by column",
                self.name
            )));
        }
        for reducer in &self.reducers {
            if reducer.column == ALL_ROWS && reducer.function != ReducerFunction::Count {
                return Err(PipelineError::InvalidConfig(format!(
                    "KPI '{}': only count accepts '{ALL_ROWS}'",
                    self.name
                )));
            }
            let output = reducer.output_name();
            if !outputs.insert(output.clone()) {
                return Err(PipelineError::InvalidConfig(format!(
                    "KPI '{}' produces column '{output}' more than once",
                    self.name
                )));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct KpiRow {
    pub keys: Vec<Option<Value>>,
    pub values: Vec<Option<Value>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct KpiResult {
    pub definition: String,
    pub dimensions: Vec<ColumnMeta>,
    pub measures: Vec<ColumnMeta>,
    pub rows: Vec<KpiRow>,
}

impl KpiResult {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    fn measure_index(&self, alias: &str) -> Option<usize> {
        self.measures.iter().position(|m| m.name == alias)
    }

    /// Value of `alias` for an ungrouped result.
    pub fn value(&self, alias: &str) -> Option<&Value> {
        if self.rows.len() != 1 {
            return None;
        }
        let idx = self.measure_index(alias)?;
        self.rows[0].values[idx].as_ref()
    }

    /// Value of `alias` in the group whose key equals `keys`.
    pub fn grouped_value(&self, keys: &[Option<Value>], alias: &str) -> Option<&Value> {
        let idx = self.measure_index(alias)?;
        self.rows
            .iter()
            .find(|row| row.keys.as_slice() == keys)
            .and_then(|row| row.values[idx].as_ref())
    }

    pub fn to_dataset(&self) -> Dataset {
        let columns = self
            .dimensions
            .iter()
            .chain(self.measures.iter())
            .cloned()
            .collect();
        let rows = self
            .rows
            .iter()
            .map(|row| row.keys.iter().chain(row.values.iter()).cloned().collect())
            .collect();
        Dataset::from_rows(self.definition.clone(), columns, rows)
    }
}

struct PlannedReducer {
    function: ReducerFunction,
    column: String,
    index: Option<usize>,
    datatype: ColumnType,
}

impl PlannedReducer {
    fn overflow(&self) -> PipelineError {
        PipelineError::NumericOverflow {
            column: self.column.clone(),
        }
    }

    fn output_column(&self, name: String) -> ColumnMeta {
        match self.function {
            ReducerFunction::Count | ReducerFunction::CountDistinct => {
                ColumnMeta::required(name, ColumnType::Integer)
            }
            ReducerFunction::Average if self.datatype == ColumnType::Float => {
                ColumnMeta::new(name, ColumnType::Float)
            }
            ReducerFunction::Average => ColumnMeta::new(name, ColumnType::Decimal),
            _ => ColumnMeta::new(name, self.datatype),
        }
    }
}

#[derive(Default, Clone)]
struct ReducerState {
    non_null: usize,
    rows: usize,
    exact_sum: Decimal,
    float_sum: f64,
    distinct: BTreeSet<String>,
    min: Option<Value>,
    max: Option<Value>,
}

impl ReducerState {
    fn ingest(&mut self, plan: &PlannedReducer, record: &Record) -> Result<(), PipelineError> {
        self.rows += 1;
        let Some(value) = plan.index.and_then(|idx| record.get(idx)) else {
            return Ok(());
        };
        self.non_null += 1;
        match plan.function {
            ReducerFunction::Sum | ReducerFunction::Average => match value {
                Value::Float(f) => self.float_sum += f,
                other => {
                    self.exact_sum = self
                        .exact_sum
                        .checked_add(other.as_decimal().unwrap_or_default())
                        .ok_or_else(|| plan.overflow())?;
                }
            },
            ReducerFunction::CountDistinct => {
                self.distinct.insert(value.key_text());
            }
            ReducerFunction::Min => {
                if self.min.as_ref().is_none_or(|current| value < current) {
                    self.min = Some(value.clone());
                }
            }
            ReducerFunction::Max => {
                if self.max.as_ref().is_none_or(|current| value > current) {
                    self.max = Some(value.clone());
                }
            }
            ReducerFunction::Count => {}
        }
        Ok(())
    }

    fn finish(self, plan: &PlannedReducer) -> Result<Option<Value>, PipelineError> {
        let value = match plan.function {
            ReducerFunction::Count if plan.index.is_none() => Some(count_value(self.rows)),
            ReducerFunction::Count => Some(count_value(self.non_null)),
            ReducerFunction::CountDistinct => Some(count_value(self.distinct.len())),
            _ if self.non_null == 0 => None,
            ReducerFunction::Sum => match plan.datatype {
                ColumnType::Float => Some(Value::Float(self.float_sum)),
                ColumnType::Integer => Some(Value::Integer(
                    self.exact_sum.to_i64().ok_or_else(|| plan.overflow())?,
                )),
                _ => Some(Value::Decimal(self.exact_sum)),
            },
            ReducerFunction::Average => match plan.datatype {
                ColumnType::Float => Some(Value::Float(self.float_sum / self.non_null as f64)),
                _ => self
                    .exact_sum
                    .checked_div(Decimal::from(self.non_null))
                    .map(|avg| Value::Decimal(avg.round_dp(AVERAGE_SCALE).normalize())),
            },
            ReducerFunction::Min => self.min,
            ReducerFunction::Max => self.max,
        };
        Ok(value)
    }
}

fn count_value(count: usize) -> Value {
    Value::Integer(i64::try_from(count).unwrap_or(i64::MAX))
}

/// Evaluates `definition` over `dataset`.
pub fn aggregate(dataset: &Dataset, definition: &KpiDefinition) -> Result<KpiResult, PipelineError> {
    definition.validate()?;
    let conditions = filter::parse_filters(&definition.filters)?;
    let filters = filter::compile(&conditions, dataset)?;

    let key_indices = definition
        .group_by
        .iter()
        .map(|column| dataset.require_column(column))
        .collect::<Result<Vec<_>, _>>()?;
    let plans = definition
        .reducers
        .iter()
        .map(|reducer| plan_reducer(dataset, reducer))
        .collect::<Result<Vec<_>, _>>()?;

    let mut groups: BTreeMap<Vec<ComparableValue>, Vec<ReducerState>> = BTreeMap::new();
    if key_indices.is_empty() {
        groups.insert(Vec::new(), vec![ReducerState::default(); plans.len()]);
    }
    let mut considered = 0usize;
    for record in &dataset.records {
        if !filter::matches_all(&filters, record) {
            continue;
        }
        considered += 1;
        let key: Vec<ComparableValue> = key_indices
            .iter()
            .map(|idx| ComparableValue(record.get(*idx).cloned()))
            .collect();
        let states = groups
            .entry(key)
            .or_insert_with(|| vec![ReducerState::default(); plans.len()]);
        for (state, plan) in states.iter_mut().zip(plans.iter()) {
            state.ingest(plan, record)?;
        }
    }

    let rows = groups
        .into_iter()
        .map(|(key, states)| {
            let values = states
                .into_iter()
                .zip(plans.iter())
                .map(|(state, plan)| state.finish(plan))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(KpiRow {
                keys: key.into_iter().map(|k| k.0).collect(),
                values,
            })
        })
        .collect::<Result<Vec<_>, PipelineError>>()?;

    let dimensions = key_indices
        .iter()
        .map(|idx| ColumnMeta {
            nullable: true,
            ..dataset.columns[*idx].clone()
        })
        .collect();
    let measures = definition
        .reducers
        .iter()
        .zip(plans.iter())
        .map(|(reducer, plan)| plan.output_column(reducer.output_name()))
        .collect();

    debug!(
        "KPI '{}' considered {considered} of {} record(s) from '{}'",
        definition.name,
        dataset.len(),
        dataset.name
    );
    info!(
        "Aggregated KPI '{}' into {} row(s)",
        definition.name,
        rows.len()
    );
    Ok(KpiResult {
        definition: definition.name.clone(),
        dimensions,
        measures,
        rows,
    })
}

fn plan_reducer(dataset: &Dataset, reducer: &Reducer) -> Result<PlannedReducer, PipelineError> {
    if reducer.column == ALL_ROWS {
        return Ok(PlannedReducer {
            function: reducer.function,
            column: reducer.column.clone(),
            index: None,
            datatype: ColumnType::Integer,
        });
    }
    let index = dataset.require_column(&reducer.column)?;
    let datatype = dataset.columns[index].datatype;
    if reducer.function.requires_numeric() && !datatype.is_numeric() {
        return Err(PipelineError::IncompatibleReducer {
            reducer: reducer.function.to_string(),
            column: reducer.column.clone(),
            datatype: datatype.to_string(),
        });
    }
    Ok(PlannedReducer {
        function: reducer.function,
        column: reducer.column.clone(),
        index: Some(index),
        datatype,
    })
}
