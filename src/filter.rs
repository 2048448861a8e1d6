//! Row predicates of the form `column op value`.
//!
//! Operands are parsed once against the filtered column's declared type, then
//! evaluated against typed records. Text operators (`contains`, `startswith`,
//! `endswith`) compare display text.

use crate::{
    data::{Value, parse_typed_value},
    dataset::{Dataset, Record},
    error::PipelineError,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComparisonOperator {
    Eq,
    NotEq,
    Gt,
    Ge,
    Lt,
    Le,
    Contains,
    StartsWith,
    EndsWith,
}

const OPERATORS: &[(&str, ComparisonOperator)] = &[
    (" contains ", ComparisonOperator::Contains),
    (" startswith ", ComparisonOperator::StartsWith),
    (" endswith ", ComparisonOperator::EndsWith),
    ("!=", ComparisonOperator::NotEq),
    (">=", ComparisonOperator::Ge),
    ("<=", ComparisonOperator::Le),
    ("=", ComparisonOperator::Eq),
    (">", ComparisonOperator::Gt),
    ("<", ComparisonOperator::Lt),
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterCondition {
    pub column: String,
    pub operator: ComparisonOperator,
    pub raw_value: String,
}

#[derive(Debug, Clone)]
pub struct CompiledFilter {
    index: usize,
    operator: ComparisonOperator,
    operand: Option<Value>,
    text: String,
}

pub fn parse_filters(filters: &[String]) -> Result<Vec<FilterCondition>, PipelineError> {
    filters.iter().map(|f| parse_filter(f)).collect()
}

fn parse_filter(filter: &str) -> Result<FilterCondition, PipelineError> {
    let trimmed = filter.trim();
    if trimmed.is_empty() {
        return Err(PipelineError::InvalidConfig("empty filter expression".into()));
    }

    // Leftmost operator wins; the longer token breaks ties (`>=` over `>`).
    let lowered = trimmed.to_ascii_lowercase();
    let found = OPERATORS
        .iter()
        .filter_map(|(needle, op)| lowered.find(needle).map(|idx| (idx, *needle, *op)))
        .min_by(|a, b| a.0.cmp(&b.0).then(b.1.len().cmp(&a.1.len())));
    if let Some((idx, needle, op)) = found {
        let left = trimmed[..idx].trim();
        let right = trimmed[idx + needle.len()..].trim();
        if !left.is_empty() {
            return Ok(FilterCondition {
                column: left.to_string(),
                operator: op,
                raw_value: unquote(right).to_string(),
            });
        }
    }

    Err(PipelineError::InvalidConfig(format!(
        "failed to parse filter expression '{trimmed}'"
    )))
}

fn unquote(value: &str) -> &str {
    if value.len() >= 2 {
        let bytes = value.as_bytes();
        if (bytes[0] == b'"' && bytes[value.len() - 1] == b'"')
            || (bytes[0] == b'\'' && bytes[value.len() - 1] == b'\'')
        {
            return &value[1..value.len() - 1];
        }
    }
    value
}

/// Resolves columns and parses operands against `dataset`'s column types.
pub fn compile(
    conditions: &[FilterCondition],
    dataset: &Dataset,
) -> Result<Vec<CompiledFilter>, PipelineError> {
    conditions
        .iter()
        .map(|condition| {
            let index = dataset.require_column(&condition.column)?;
            let column = &dataset.columns[index];
            let operand = match condition.operator {
                ComparisonOperator::Contains
                | ComparisonOperator::StartsWith
                | ComparisonOperator::EndsWith => None,
                _ => parse_typed_value(
                    &condition.raw_value,
                    &column.datatype,
                    column.format.as_deref(),
                )
                .map_err(|err| {
                    PipelineError::InvalidConfig(format!(
                        "filter operand for '{}': {err}",
                        condition.column
                    ))
                })?,
            };
            Ok(CompiledFilter {
                index,
                operator: condition.operator,
                operand,
                text: condition.raw_value.clone(),
            })
        })
        .collect()
}

/// True when `record` satisfies every filter.
pub fn matches_all(filters: &[CompiledFilter], record: &Record) -> bool {
    filters.iter().all(|filter| filter.matches(record))
}

impl CompiledFilter {
    pub fn matches(&self, record: &Record) -> bool {
        use ComparisonOperator::*;
        let value = record.get(self.index);
        match self.operator {
            Contains | StartsWith | EndsWith => {
                let display = value.map(Value::as_display).unwrap_or_default();
                let needle = self.text.as_str();
                match self.operator {
                    Contains => display.contains(needle),
                    StartsWith => display.starts_with(needle),
                    _ => display.ends_with(needle),
                }
            }
            Eq | NotEq | Gt | Ge | Lt | Le => match (value, self.operand.as_ref()) {
                (Some(left), Some(right)) => match self.operator {
                    Eq => left == right,
                    NotEq => left != right,
                    Gt => left > right,
                    Ge => left >= right,
                    Lt => left < right,
                    _ => left <= right,
                },
                (None, None) => matches!(self.operator, Eq | Ge | Le),
                _ => self.operator == NotEq,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{ColumnMeta, ColumnType};
    use rust_decimal::Decimal;

    fn orders() -> Dataset {
        Dataset::from_rows(
            "orders",
            vec![
                ColumnMeta::new("status", ColumnType::String),
                ColumnMeta::new("total", ColumnType::Decimal),
            ],
            vec![
                vec![
                    Some(Value::String("delivered".into())),
                    Some(Value::Decimal(Decimal::new(10050, 2))),
                ],
                vec![Some(Value::String("canceled".into())), None],
            ],
        )
    }

    #[test]
    fn parse_filters_handles_operators_and_quotes() {
        let parsed = parse_filters(&[
            "status = 'delivered'".to_string(),
            "total >= 10".to_string(),
            "status startswith can".to_string(),
        ])
        .expect("filters");
        assert_eq!(parsed[0].operator, ComparisonOperator::Eq);
        assert_eq!(parsed[0].raw_value, "delivered");
        assert_eq!(parsed[1].operator, ComparisonOperator::Ge);
        assert_eq!(parsed[2].operator, ComparisonOperator::StartsWith);
        assert!(parse_filters(&["no operator here".to_string()]).is_err());
    }

    #[test]
    fn operator_text_inside_operands_is_not_an_operator() {
        let parsed = parse_filters(&[
            "note = 'a contains b'".to_string(),
            "note contains 'x = y'".to_string(),
            "note != 'a >= b'".to_string(),
        ])
        .expect("filters");
        assert_eq!(parsed[0].column, "note");
        assert_eq!(parsed[0].operator, ComparisonOperator::Eq);
        assert_eq!(parsed[0].raw_value, "a contains b");
        assert_eq!(parsed[1].column, "note");
        assert_eq!(parsed[1].operator, ComparisonOperator::Contains);
        assert_eq!(parsed[1].raw_value, "x = y");
        assert_eq!(parsed[2].operator, ComparisonOperator::NotEq);
        assert_eq!(parsed[2].raw_value, "a >= b");
    }

    #[test]
    fn compiled_filters_compare_typed_values() {
        let dataset = orders();
        let conditions = parse_filters(&["total > 100".to_string()]).expect("parse");
        let filters = compile(&conditions, &dataset).expect("compile");
        assert!(matches_all(&filters, &dataset.records[0]));
        assert!(!matches_all(&filters, &dataset.records[1]));
    }

    #[test]
    fn compile_rejects_unknown_columns() {
        let dataset = orders();
        let conditions = parse_filters(&["region = north".to_string()]).expect("parse");
        let err = compile(&conditions, &dataset).expect_err("unknown column");
        assert!(matches!(err, PipelineError::UnknownColumn { .. }));
    }
}
