//! Declared column model and source descriptors.
//!
//! A [`SourceDescriptor`] is the declared shape of one raw dataset: an ordered
//! list of [`ColumnMeta`] entries (name, semantic [`ColumnType`], nullability,
//! optional parse format) plus the primary key columns. Descriptors are loaded
//! once per run by [`crate::catalog::SchemaCatalog`] and are read-only to every
//! other stage.
//!
//! [`ColumnMeta`] doubles as the column description of every in-memory
//! [`crate::dataset::Dataset`], so derived and aggregated tables carry the same
//! metadata when they are written to the table store.

use std::{fmt, str::FromStr};

use anyhow::{Result, anyhow};
use serde::{Deserialize, Deserializer, Serialize, Serializer, de};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ColumnType {
    String,
    Integer,
    Float,
    Decimal,
    Boolean,
    Date,
    DateTime,
}

impl ColumnType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ColumnType::String => "string",
            ColumnType::Integer => "integer",
            ColumnType::Float => "float",
            ColumnType::Decimal => "decimal",
            ColumnType::Boolean => "boolean",
            ColumnType::Date => "date",
            ColumnType::DateTime => "datetime",
        }
    }

    pub fn variants() -> &'static [&'static str] {
        &[
            "string", "integer", "float", "decimal", "boolean", "date", "datetime",
        ]
    }

    pub fn is_numeric(&self) -> bool {
        matches!(
            self,
            ColumnType::Integer | ColumnType::Float | ColumnType::Decimal
        )
    }

    pub fn is_temporal(&self) -> bool {
        matches!(self, ColumnType::Date | ColumnType::DateTime)
    }
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for ColumnType {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim().to_ascii_lowercase();
        match normalized.as_str() {
            "string" | "text" => Ok(ColumnType::String),
            "integer" | "int" | "long" => Ok(ColumnType::Integer),
            "float" | "double" => Ok(ColumnType::Float),
            "decimal" | "currency" | "money" => Ok(ColumnType::Decimal),
            "boolean" | "bool" => Ok(ColumnType::Boolean),
            "date" => Ok(ColumnType::Date),
            "datetime" | "date-time" | "timestamp" => Ok(ColumnType::DateTime),
            _ => Err(anyhow!(
                "Unknown column type '{value}'. Supported types: {}",
                ColumnType::variants().join(", ")
            )),
        }
    }
}

impl Serialize for ColumnType {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for ColumnType {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let token = String::deserialize(deserializer)?;
        ColumnType::from_str(&token).map_err(|err| de::Error::custom(err.to_string()))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ColumnMeta {
    pub name: String,
    pub datatype: ColumnType,
    #[serde(default = "ColumnMeta::default_nullable")]
    pub nullable: bool,
    /// chrono format string tried before the built-in fallbacks for temporal columns.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
}

impl ColumnMeta {
    pub fn new(name: impl Into<String>, datatype: ColumnType) -> Self {
        Self {
            name: name.into(),
            datatype,
            nullable: true,
            format: None,
        }
    }

    pub fn required(name: impl Into<String>, datatype: ColumnType) -> Self {
        Self {
            nullable: false,
            ..Self::new(name, datatype)
        }
    }

    pub fn with_format(mut self, format: impl Into<String>) -> Self {
        self.format = Some(format.into());
        self
    }

    pub const fn default_nullable() -> bool {
        true
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum SourceFormat {
    #[default]
    Delimited,
    Structured,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SourceDescriptor {
    pub name: String,
    /// Path or pattern of the landed file, resolved by the ingestion collaborator.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(default)]
    pub format: SourceFormat,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delimiter: Option<char>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encoding: Option<String>,
    pub columns: Vec<ColumnMeta>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub primary_key: Vec<String>,
}

impl SourceDescriptor {
    pub fn new(name: impl Into<String>, columns: Vec<ColumnMeta>) -> Self {
        Self {
            name: name.into(),
            location: None,
            format: SourceFormat::Delimited,
            delimiter: None,
            encoding: None,
            columns,
            primary_key: Vec::new(),
        }
    }

    pub fn with_primary_key<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.primary_key = columns.into_iter().map(Into::into).collect();
        self
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    pub fn column(&self, name: &str) -> Option<&ColumnMeta> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn headers(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.name.clone()).collect()
    }

    pub fn delimiter_byte(&self) -> Option<u8> {
        self.delimiter.and_then(|c| u8::try_from(c).ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn column_type_parses_aliases_case_insensitively() {
        assert_eq!(ColumnType::from_str("INT").unwrap(), ColumnType::Integer);
        assert_eq!(ColumnType::from_str("Currency").unwrap(), ColumnType::Decimal);
        assert_eq!(
            ColumnType::from_str(" timestamp ").unwrap(),
            ColumnType::DateTime
        );
        let err = ColumnType::from_str("geography").expect_err("unknown type");
        assert!(err.to_string().contains("Supported types"));
    }

    #[test]
    fn descriptor_yaml_defaults_nullable_and_format() {
        let yaml = r#"
name: orders
location: raw/orders.csv
columns:
  - name: order_id
    datatype: string
    nullable: false
  - name: purchased_at
    datatype: datetime
    format: "%d.%m.%Y %H:%M"
primary_key: [order_id]
"#;
        let descriptor: SourceDescriptor = serde_yaml::from_str(yaml).expect("parse descriptor");
        assert_eq!(descriptor.format, SourceFormat::Delimited);
        assert!(!descriptor.columns[0].nullable);
        assert!(descriptor.columns[1].nullable);
        assert_eq!(
            descriptor.columns[1].format.as_deref(),
            Some("%d.%m.%Y %H:%M")
        );
        assert_eq!(descriptor.column_index("purchased_at"), Some(1));
    }

    #[test]
    fn descriptor_rejects_unknown_datatype() {
        let yaml = r#"
name: broken
columns:
  - name: location
    datatype: geography
"#;
        let err = serde_yaml::from_str::<SourceDescriptor>(yaml).expect_err("bad datatype");
        assert!(err.to_string().contains("Unknown column type 'geography'"));
    }
}
