use std::collections::{BTreeMap, HashMap};

use regex::RegexBuilder;
use tracing::{debug, warn};

use crate::dialect::Dialect;
use crate::error::{BifrostError, BifrostResult};
use crate::metadata::MetadataFile;
use crate::schema::{ConstraintKind, SchemaData};

// Metadata keys recognized by the policy modules.
pub const META_TENANT_FILTER: &str = "tenant-filter";
pub const META_TENANT_CONTEXT_KEY: &str = "tenant-context-key";
pub const META_SOFT_DELETE: &str = "soft-delete";
pub const META_SOFT_DELETE_BY: &str = "soft-delete-by";
pub const META_AUTO_FILTER: &str = "auto-filter";
pub const META_AUTO_FILTER_BYPASS_ROLE: &str = "auto-filter-bypass-role";
pub const META_USER_AUDIT_KEY: &str = "user-audit-key";
pub const META_POPULATE: &str = "populate";
pub const META_SP_INCLUDE: &str = "sp-include";
pub const META_SP_EXCLUDE: &str = "sp-exclude";
pub const META_SP_READ_ONLY: &str = "sp-read-only";
pub const META_DYNAMIC_JOINS: &str = "dynamic-joins";

pub type Metadata = BTreeMap<String, String>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableType {
    BaseTable,
    View,
}

impl TableType {
    pub fn parse(raw: &str) -> Self {
        if raw.eq_ignore_ascii_case("VIEW") {
            TableType::View
        } else {
            TableType::BaseTable
        }
    }
}

#[derive(Debug, Clone)]
pub struct Column {
    pub db_name: String,
    pub graphql_name: String,
    pub normalized_name: String,
    /// 1-based position within the table.
    pub ordinal: u32,
    /// Declared type exactly as the database reports it, e.g. `VARCHAR(100)`.
    pub data_type: String,
    pub is_nullable: bool,
    pub is_primary_key: bool,
    pub is_identity: bool,
    pub metadata: Metadata,
}

impl Column {
    pub fn metadata(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).map(String::as_str)
    }
}

/// A modeled foreign key: `(child_table, child_column)` points at
/// `(parent_table, parent_column)`. Links hold table names, not references;
/// resolution to concrete tables goes through the owning [`Model`].
#[derive(Debug, Clone, PartialEq)]
pub struct Link {
    pub name: String,
    pub child_schema: String,
    pub child_table: String,
    pub child_column: String,
    pub parent_schema: String,
    pub parent_table: String,
    pub parent_column: String,
}

#[derive(Debug, Clone)]
pub struct Table {
    pub db_name: String,
    pub graphql_name: String,
    pub normalized_name: String,
    pub schema_name: String,
    pub table_type: TableType,
    columns: Vec<Column>,
    by_db_name: HashMap<String, usize>,
    by_graphql_name: HashMap<String, usize>,
    /// Child-to-parent joins: this table holds the FK.
    pub single_links: BTreeMap<String, Link>,
    /// Parent-to-child joins: this table is referenced by another.
    pub multi_links: BTreeMap<String, Link>,
    pub metadata: Metadata,
}

impl Table {
    /// `schema.table`, the model-wide lookup key.
    pub fn key(&self) -> String {
        format!("{}.{}", self.schema_name, self.db_name)
    }

    pub fn columns(&self) -> impl Iterator<Item = &Column> {
        self.columns.iter()
    }

    /// Case-insensitive lookup by database column name.
    pub fn column(&self, db_name: &str) -> Option<&Column> {
        self.by_db_name
            .get(&db_name.to_lowercase())
            .map(|&i| &self.columns[i])
    }

    /// Case-sensitive lookup by GraphQL field name.
    pub fn column_by_graphql(&self, name: &str) -> Option<&Column> {
        self.by_graphql_name.get(name).map(|&i| &self.columns[i])
    }

    pub fn primary_keys(&self) -> Vec<&Column> {
        self.columns.iter().filter(|c| c.is_primary_key).collect()
    }

    pub fn identity(&self) -> Option<&Column> {
        self.columns.iter().find(|c| c.is_identity)
    }

    pub fn metadata(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).map(String::as_str)
    }

    pub fn is_view(&self) -> bool {
        self.table_type == TableType::View
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamDirection {
    Input,
    Output,
    InputOutput,
}

impl ParamDirection {
    pub fn parse(mode: &str) -> Self {
        match mode.to_ascii_uppercase().as_str() {
            "OUT" | "OUTPUT" => ParamDirection::Output,
            "INOUT" => ParamDirection::InputOutput,
            _ => ParamDirection::Input,
        }
    }

    pub fn accepts_input(&self) -> bool {
        matches!(self, ParamDirection::Input | ParamDirection::InputOutput)
    }

    pub fn produces_output(&self) -> bool {
        matches!(self, ParamDirection::Output | ParamDirection::InputOutput)
    }
}

#[derive(Debug, Clone)]
pub struct ProcParam {
    pub db_name: String,
    pub graphql_name: String,
    pub data_type: String,
    pub direction: ParamDirection,
    pub is_nullable: bool,
    pub ordinal: u32,
}

#[derive(Debug, Clone)]
pub struct StoredProc {
    pub schema_name: String,
    pub db_name: String,
    pub graphql_name: String,
    pub params: Vec<ProcParam>,
    /// Read-only procedures surface as queries, the rest as mutations.
    pub is_read_only: bool,
}

impl StoredProc {
    pub fn full_db_ref(&self, dialect: Dialect) -> String {
        dialect.table_reference(&self.schema_name, &self.db_name)
    }

    /// Bare name for the default schema, `schema_name` otherwise.
    pub fn full_graphql_name(&self) -> String {
        if self.schema_name == "dbo" {
            self.graphql_name.clone()
        } else {
            format!("{}_{}", self.schema_name, self.graphql_name)
        }
    }

    pub fn input_type_name(&self) -> String {
        format!("sp_{}_Input", self.full_graphql_name())
    }

    pub fn result_type_name(&self) -> String {
        format!("sp_{}_Result", self.full_graphql_name())
    }
}

/// Canonical in-memory schema. Built once at startup from a
/// [`SchemaData`] plus sidecar metadata, then shared immutably.
#[derive(Debug, Clone)]
pub struct Model {
    tables: Vec<Table>,
    by_db_name: HashMap<String, usize>,
    by_graphql_name: HashMap<String, usize>,
    procs: Vec<StoredProc>,
    pub metadata: Metadata,
}

impl Model {
    pub fn tables(&self) -> impl Iterator<Item = &Table> {
        self.tables.iter()
    }

    pub fn procs(&self) -> impl Iterator<Item = &StoredProc> {
        self.procs.iter()
    }

    /// Case-insensitive lookup by `schema.table` or, when unambiguous, by
    /// the bare table name.
    pub fn table(&self, name: &str) -> Option<&Table> {
        self.by_db_name
            .get(&name.to_lowercase())
            .map(|&i| &self.tables[i])
    }

    /// Case-sensitive lookup by GraphQL type name.
    pub fn table_by_graphql(&self, name: &str) -> Option<&Table> {
        self.by_graphql_name.get(name).map(|&i| &self.tables[i])
    }

    pub fn require_table(&self, name: &str) -> BifrostResult<&Table> {
        self.table(name).ok_or_else(|| BifrostError::TableNotFound {
            table: name.to_string(),
        })
    }

    pub fn metadata(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).map(String::as_str)
    }

    pub fn tenant_context_key(&self) -> &str {
        self.metadata(META_TENANT_CONTEXT_KEY)
            .unwrap_or(crate::context::DEFAULT_TENANT_KEY)
    }

    /// Configured audit key, if any. The audit module only populates user
    /// columns when this is present; soft-delete falls back to the default.
    pub fn user_audit_key(&self) -> Option<&str> {
        self.metadata(META_USER_AUDIT_KEY)
    }

    pub fn auto_filter_bypass_role(&self) -> Option<&str> {
        self.metadata(META_AUTO_FILTER_BYPASS_ROLE)
    }

    pub fn dynamic_joins(&self) -> bool {
        self.metadata(META_DYNAMIC_JOINS)
            .map(|v| !v.eq_ignore_ascii_case("false"))
            .unwrap_or(true)
    }

    /// Builds the model from raw schema data and sidecar metadata: infers
    /// GraphQL names, wires links from foreign-key constraints, filters
    /// stored procedures through the `sp-include`/`sp-exclude` regexes and
    /// attaches metadata to every node.
    pub fn build(data: SchemaData, meta: &MetadataFile) -> BifrostResult<Model> {
        let mut tables = Vec::new();

        let mut raw_tables = data.tables.clone();
        raw_tables.sort_by(|a, b| (&a.schema, &a.name).cmp(&(&b.schema, &b.name)));

        // Bare GraphQL names only when no other table claims the same one.
        let mut name_counts: HashMap<String, usize> = HashMap::new();
        for raw in &raw_tables {
            *name_counts
                .entry(stringcase::camel_case(&raw.name))
                .or_default() += 1;
        }

        for raw in &raw_tables {
            let bare = stringcase::camel_case(&raw.name);
            let graphql_name = if name_counts[&bare] > 1 {
                stringcase::camel_case(&format!("{}_{}", raw.schema, raw.name))
            } else {
                bare
            };

            let mut columns: Vec<Column> = data
                .columns
                .iter()
                .filter(|c| c.schema == raw.schema && c.table == raw.name)
                .map(|c| {
                    let constraint_key = (
                        c.catalog.clone(),
                        c.schema.clone(),
                        c.table.clone(),
                        c.name.clone(),
                    );
                    let is_pk = data
                        .constraints
                        .get(&constraint_key)
                        .map(|cs| cs.iter().any(|k| k.kind == ConstraintKind::PrimaryKey))
                        .unwrap_or(false);
                    Column {
                        db_name: c.name.clone(),
                        graphql_name: stringcase::camel_case(&c.name),
                        normalized_name: c.name.to_lowercase(),
                        ordinal: c.ordinal,
                        data_type: c.data_type.clone(),
                        is_nullable: c.is_nullable && !(is_pk || c.is_identity),
                        // Identity columns always participate in the key.
                        is_primary_key: is_pk || c.is_identity,
                        is_identity: c.is_identity,
                        metadata: Metadata::new(),
                    }
                })
                .collect();
            columns.sort_by_key(|c| c.ordinal);

            let mut by_db_name = HashMap::new();
            let mut by_graphql_name = HashMap::new();
            for (i, col) in columns.iter().enumerate() {
                by_db_name.insert(col.db_name.to_lowercase(), i);
                by_graphql_name.insert(col.graphql_name.clone(), i);
            }

            tables.push(Table {
                db_name: raw.name.clone(),
                graphql_name,
                normalized_name: pluralizer::pluralize(&raw.name, 1, false).to_lowercase(),
                schema_name: raw.schema.clone(),
                table_type: TableType::parse(&raw.table_type),
                columns,
                by_db_name,
                by_graphql_name,
                single_links: BTreeMap::new(),
                multi_links: BTreeMap::new(),
                metadata: Metadata::new(),
            });
        }

        let mut by_db_name = HashMap::new();
        let mut by_graphql_name = HashMap::new();
        let mut bare_counts: HashMap<String, usize> = HashMap::new();
        for (i, table) in tables.iter().enumerate() {
            by_db_name.insert(table.key().to_lowercase(), i);
            by_graphql_name.insert(table.graphql_name.clone(), i);
            *bare_counts.entry(table.db_name.to_lowercase()).or_default() += 1;
        }
        for (i, table) in tables.iter().enumerate() {
            if bare_counts[&table.db_name.to_lowercase()] == 1 {
                by_db_name.insert(table.db_name.to_lowercase(), i);
            }
        }

        // Wire links from FK constraints. Both sides are named after the
        // referenced table's GraphQL name; collisions (multiple FKs to the
        // same parent) append the child column.
        let mut links = Vec::new();
        for ((_, schema, table, column), constraints) in &data.constraints {
            for constraint in constraints {
                if constraint.kind != ConstraintKind::ForeignKey {
                    continue;
                }
                let Some(referenced) = &constraint.referenced else {
                    warn!("foreign key on {schema}.{table}.{column} has no referenced column");
                    continue;
                };
                links.push((
                    schema.clone(),
                    table.clone(),
                    column.clone(),
                    referenced.schema.clone(),
                    referenced.table.clone(),
                    referenced.column.clone(),
                ));
            }
        }
        links.sort();

        for (child_schema, child_table, child_column, parent_schema, parent_table, parent_column) in
            links
        {
            let Some(&child_idx) = by_db_name.get(&format!("{child_schema}.{child_table}").to_lowercase())
            else {
                continue;
            };
            let Some(&parent_idx) = by_db_name.get(&format!("{parent_schema}.{parent_table}").to_lowercase())
            else {
                debug!("foreign key target {parent_schema}.{parent_table} is not in the model");
                continue;
            };

            let parent_graphql = tables[parent_idx].graphql_name.clone();
            let child_graphql = tables[child_idx].graphql_name.clone();

            let single_name = if tables[child_idx].single_links.contains_key(&parent_graphql) {
                format!("{}_{}", parent_graphql, child_column.to_lowercase())
            } else {
                parent_graphql.clone()
            };
            let multi_name = if tables[parent_idx].multi_links.contains_key(&child_graphql) {
                format!("{}_{}", child_graphql, child_column.to_lowercase())
            } else {
                child_graphql.clone()
            };

            let single = Link {
                name: single_name.clone(),
                child_schema: child_schema.clone(),
                child_table: child_table.clone(),
                child_column: child_column.clone(),
                parent_schema: parent_schema.clone(),
                parent_table: parent_table.clone(),
                parent_column: parent_column.clone(),
            };
            let multi = Link {
                name: multi_name.clone(),
                ..single.clone()
            };

            tables[child_idx].single_links.insert(single_name, single);
            tables[parent_idx].multi_links.insert(multi_name, multi);
        }

        // Stored procedures, filtered through the model-level regexes.
        let model_meta = meta.model_keys();
        let include = regex_from(&model_meta, META_SP_INCLUDE)?;
        let exclude = regex_from(&model_meta, META_SP_EXCLUDE)?;
        let read_only = regex_from(&model_meta, META_SP_READ_ONLY)?;

        let mut procs = Vec::new();
        for raw in &data.procs {
            if let Some(include) = &include {
                if !include.is_match(&raw.name) {
                    continue;
                }
            }
            if let Some(exclude) = &exclude {
                // Exclude wins when both match.
                if exclude.is_match(&raw.name) {
                    continue;
                }
            }
            let mut params: Vec<ProcParam> = data
                .proc_params
                .iter()
                .filter(|p| p.proc_schema == raw.schema && p.proc_name == raw.name)
                .map(|p| ProcParam {
                    db_name: p.name.clone(),
                    graphql_name: stringcase::camel_case(p.name.trim_start_matches('@')),
                    data_type: p.data_type.clone(),
                    direction: ParamDirection::parse(&p.mode),
                    is_nullable: p.is_nullable,
                    ordinal: p.ordinal,
                })
                .collect();
            params.sort_by_key(|p| p.ordinal);

            procs.push(StoredProc {
                schema_name: raw.schema.clone(),
                db_name: raw.name.clone(),
                graphql_name: stringcase::camel_case(&raw.name),
                params,
                is_read_only: raw.is_read_only
                    || read_only.as_ref().is_some_and(|r| r.is_match(&raw.name)),
            });
        }
        procs.sort_by(|a, b| (&a.schema_name, &a.db_name).cmp(&(&b.schema_name, &b.db_name)));

        let mut model = Model {
            tables,
            by_db_name,
            by_graphql_name,
            procs,
            metadata: model_meta,
        };
        meta.apply(&mut model)?;
        Ok(model)
    }

    /// Used by the metadata loader during the build phase; the model is
    /// frozen once `build` returns.
    pub(crate) fn table_mut(&mut self, name: &str) -> Option<&mut Table> {
        let idx = *self.by_db_name.get(&name.to_lowercase())?;
        Some(&mut self.tables[idx])
    }

    pub(crate) fn table_keys(&self) -> Vec<String> {
        self.tables.iter().map(|t| t.key()).collect()
    }
}

impl Table {
    pub(crate) fn column_mut(&mut self, db_name: &str) -> Option<&mut Column> {
        let idx = *self.by_db_name.get(&db_name.to_lowercase())?;
        Some(&mut self.columns[idx])
    }
}

fn regex_from(meta: &Metadata, key: &str) -> BifrostResult<Option<regex::Regex>> {
    match meta.get(key) {
        Some(pattern) => RegexBuilder::new(pattern)
            .case_insensitive(true)
            .build()
            .map(Some)
            .map_err(|e| BifrostError::Config(format!("invalid {key} pattern '{pattern}': {e}"))),
        None => Ok(None),
    }
}
