//! Out-of-band model annotations, read from a TOML sidecar file and applied
//! to model, table and column nodes during the startup build. The model
//! layer is a generic key-value carrier, so unrecognized keys pass through
//! untouched; `populate` values are validated here because a typo would
//! otherwise silently disable auditing.
//!
//! ```toml
//! [model]
//! tenant-context-key = "tenant_id"
//! auto-filter-bypass-role = "admin"
//!
//! [tables."dbo.Orders"]
//! tenant-filter = "tenant_id"
//! soft-delete = "deleted_at"
//!
//! [tables."dbo.Orders".columns.created_at]
//! populate = "created-on"
//! ```

use std::collections::BTreeMap;

use serde::Deserialize;
use tracing::{debug, warn};

use crate::error::{BifrostError, BifrostResult};
use crate::model::{META_POPULATE, Metadata, Model};

const POPULATE_VALUES: [&str; 6] = [
    "created-on",
    "created-by",
    "updated-on",
    "updated-by",
    "deleted-on",
    "deleted-by",
];

#[derive(Debug, Clone, Default, Deserialize)]
pub struct MetadataFile {
    #[serde(default)]
    model: BTreeMap<String, toml::Value>,
    #[serde(default)]
    tables: BTreeMap<String, TableSection>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct TableSection {
    #[serde(default)]
    columns: BTreeMap<String, BTreeMap<String, toml::Value>>,
    #[serde(flatten)]
    keys: BTreeMap<String, toml::Value>,
}

impl MetadataFile {
    pub fn load(path: &str) -> BifrostResult<Self> {
        debug!("loading metadata from {path}");
        let content = std::fs::read_to_string(path)
            .map_err(|e| BifrostError::Config(format!("unable to read metadata file {path}: {e}")))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> BifrostResult<Self> {
        let file: MetadataFile = toml::from_str(content)
            .map_err(|e| BifrostError::Config(format!("invalid metadata file: {e}")))?;
        file.validate()?;
        Ok(file)
    }

    fn validate(&self) -> BifrostResult<()> {
        for (table, section) in &self.tables {
            for (column, keys) in &section.columns {
                if let Some(value) = keys.get(META_POPULATE) {
                    let value = value_to_string(value);
                    if !POPULATE_VALUES.contains(&value.as_str()) {
                        return Err(BifrostError::Config(format!(
                            "invalid populate value '{value}' on {table}.{column}; \
                             expected one of {POPULATE_VALUES:?}"
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    /// Model-level keys as plain strings.
    pub fn model_keys(&self) -> Metadata {
        self.model
            .iter()
            .map(|(k, v)| (k.clone(), value_to_string(v)))
            .collect()
    }

    /// Attaches table and column keys to their model nodes. Table sections
    /// match by `schema.table` or bare table name, case-insensitively.
    pub(crate) fn apply(&self, model: &mut Model) -> BifrostResult<()> {
        for (name, section) in &self.tables {
            let Some(key) = model
                .table(name)
                .map(|t| t.key())
            else {
                warn!("metadata names table '{name}' which is not in the model");
                continue;
            };
            let table = model
                .table_mut(&key)
                .expect("key came from a model lookup");

            for (meta_key, value) in &section.keys {
                table
                    .metadata
                    .insert(meta_key.clone(), value_to_string(value));
            }

            for (column_name, keys) in &section.columns {
                let Some(column) = table.column_mut(column_name) else {
                    return Err(BifrostError::ColumnNotFound {
                        column: column_name.clone(),
                        table: key.clone(),
                    });
                };
                for (meta_key, value) in keys {
                    column
                        .metadata
                        .insert(meta_key.clone(), value_to_string(value));
                }
            }
        }
        Ok(())
    }
}

fn value_to_string(value: &toml::Value) -> String {
    match value {
        toml::Value::String(s) => s.clone(),
        toml::Value::Boolean(b) => b.to_string(),
        toml::Value::Integer(i) => i.to_string(),
        toml::Value::Float(f) => f.to_string(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{META_SOFT_DELETE, META_TENANT_FILTER};
    use crate::schema::test_fixtures::library_schema;

    const SAMPLE: &str = r#"
[model]
tenant-context-key = "tenant_id"
auto-filter-bypass-role = "admin"
dynamic-joins = false

[tables."dbo.Books"]
tenant-filter = "AuthorId"
soft-delete = "Title"

[tables.Authors]
auto-filter = "Id:author_ids"

[tables."dbo.Books".columns.Title]
populate = "updated-on"
"#;

    #[test]
    fn parses_and_applies_all_scopes() {
        let meta = MetadataFile::parse(SAMPLE).unwrap();
        let model = Model::build(library_schema(), &meta).unwrap();

        assert_eq!(model.tenant_context_key(), "tenant_id");
        assert_eq!(model.auto_filter_bypass_role(), Some("admin"));
        assert!(!model.dynamic_joins());

        let books = model.table("dbo.Books").unwrap();
        assert_eq!(books.metadata(META_TENANT_FILTER), Some("AuthorId"));
        assert_eq!(books.metadata(META_SOFT_DELETE), Some("Title"));
        assert_eq!(
            books.column("title").unwrap().metadata(META_POPULATE),
            Some("updated-on")
        );

        // Bare table name resolves when unambiguous.
        let authors = model.table("dbo.Authors").unwrap();
        assert_eq!(authors.metadata("auto-filter"), Some("Id:author_ids"));
    }

    #[test]
    fn unknown_tables_are_skipped_not_fatal() {
        let meta = MetadataFile::parse("[tables.Nope]\nsoft-delete = \"x\"\n").unwrap();
        assert!(Model::build(library_schema(), &meta).is_ok());
    }

    #[test]
    fn unknown_columns_are_fatal() {
        let meta =
            MetadataFile::parse("[tables.\"dbo.Books\".columns.nope]\npopulate = \"created-on\"\n")
                .unwrap();
        let err = Model::build(library_schema(), &meta).unwrap_err();
        assert!(err.to_string().contains("nope"));
    }

    #[test]
    fn invalid_populate_value_is_a_config_error() {
        let err =
            MetadataFile::parse("[tables.Books.columns.x]\npopulate = \"create-on\"\n").unwrap_err();
        assert!(matches!(err, BifrostError::Config(_)));
        assert!(err.to_string().contains("create-on"));
    }

    #[test]
    fn unrecognized_keys_are_carried_verbatim() {
        let meta = MetadataFile::parse("[tables.\"dbo.Books\"]\ndisplay-name = \"Catalogue\"\n")
            .unwrap();
        let model = Model::build(library_schema(), &meta).unwrap();
        assert_eq!(
            model.table("dbo.Books").unwrap().metadata("display-name"),
            Some("Catalogue")
        );
    }
}
