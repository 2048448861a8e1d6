//! Registry of declared source schemas.
//!
//! The catalog is built once per run from the externally supplied metadata
//! descriptor and is immutable afterwards. Every other stage resolves a source
//! through [`SchemaCatalog::describe`].

use std::{collections::BTreeMap, fs::File, io::BufReader, path::Path};

use anyhow::{Context, Result};
use log::debug;
use serde::{Deserialize, Serialize};

use crate::{error::PipelineError, schema::SourceDescriptor};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CatalogFile {
    sources: Vec<SourceDescriptor>,
}

#[derive(Debug, Clone, Default)]
pub struct SchemaCatalog {
    descriptors: BTreeMap<String, SourceDescriptor>,
}

impl SchemaCatalog {
    /// Registers every descriptor, rejecting duplicate names and primary keys
    /// that reference undeclared columns.
    pub fn load_all<I>(descriptors: I) -> Result<Self, PipelineError>
    where
        I: IntoIterator<Item = SourceDescriptor>,
    {
        let mut registered = BTreeMap::new();
        for descriptor in descriptors {
            if descriptor.columns.is_empty() {
                return Err(PipelineError::InvalidConfig(format!(
                    "source '{}' declares no columns",
                    descriptor.name
                )));
            }
            for key in &descriptor.primary_key {
                if descriptor.column_index(key).is_none() {
                    return Err(PipelineError::InvalidConfig(format!(
                        "primary key column '{key}' is not declared by source '{}'",
                        descriptor.name
                    )));
                }
            }
            for (idx, column) in descriptor.columns.iter().enumerate() {
                if descriptor.columns[..idx].iter().any(|c| c.name == column.name) {
                    return Err(PipelineError::InvalidConfig(format!(
                        "column '{}' is declared twice by source '{}'",
                        column.name, descriptor.name
                    )));
                }
            }
            if registered.contains_key(&descriptor.name) {
                return Err(PipelineError::InvalidConfig(format!(
                    "source '{}' is declared more than once",
                    descriptor.name
                )));
            }
            debug!(
                "Registered source '{}' with {} column(s)",
                descriptor.name,
                descriptor.columns.len()
            );
            registered.insert(descriptor.name.clone(), descriptor);
        }
        Ok(Self {
            descriptors: registered,
        })
    }

    pub fn load(path: &Path) -> Result<Self> {
        let file = File::open(path).with_context(|| format!("Opening catalog file {path:?}"))?;
        let parsed: CatalogFile = serde_yaml::from_reader(BufReader::new(file))
            .with_context(|| format!("Parsing catalog YAML {path:?}"))?;
        let catalog = Self::load_all(parsed.sources)
            .with_context(|| format!("Validating catalog {path:?}"))?;
        Ok(catalog)
    }

    pub fn describe(&self, name: &str) -> Result<&SourceDescriptor, PipelineError> {
        self.descriptors
            .get(name)
            .ok_or_else(|| PipelineError::UnknownSource(name.to_string()))
    }

    pub fn names(&self) -> Vec<&str> {
        self.descriptors.keys().map(String::as_str).collect()
    }

    pub fn descriptors(&self) -> impl Iterator<Item = &SourceDescriptor> {
        self.descriptors.values()
    }

    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{ColumnMeta, ColumnType};

    fn orders() -> SourceDescriptor {
        SourceDescriptor::new(
            "orders",
            vec![
                ColumnMeta::required("order_id", ColumnType::String),
                ColumnMeta::new("total", ColumnType::Decimal),
            ],
        )
        .with_primary_key(["order_id"])
    }

    #[test]
    fn describe_returns_registered_descriptor() {
        let catalog = SchemaCatalog::load_all([orders()]).expect("catalog");
        let descriptor = catalog.describe("orders").expect("orders registered");
        assert_eq!(descriptor.columns.len(), 2);
        assert_eq!(catalog.names(), vec!["orders"]);
    }

    #[test]
    fn describe_unknown_source_fails() {
        let catalog = SchemaCatalog::load_all([orders()]).expect("catalog");
        let err = catalog.describe("payments").expect_err("unknown");
        assert!(matches!(err, PipelineError::UnknownSource(name) if name == "payments"));
    }

    #[test]
    fn load_all_rejects_duplicates_and_bad_keys() {
        let err = SchemaCatalog::load_all([orders(), orders()]).expect_err("duplicate");
        assert!(err.to_string().contains("more than once"));

        let bad_key = orders().with_primary_key(["missing"]);
        let err = SchemaCatalog::load_all([bad_key]).expect_err("bad key");
        assert!(err.to_string().contains("primary key column 'missing'"));
    }
}
