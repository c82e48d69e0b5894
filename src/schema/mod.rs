//! Database introspection. One reader per dialect, all emitting the same
//! raw [`SchemaData`] shape, which the model layer turns into the canonical
//! in-memory schema.

use std::collections::HashMap;

use serde_json::Value;
use tracing::info;

use crate::db::{Row, SqlExecutor};
use crate::dialect::Dialect;
use crate::error::{BifrostError, BifrostResult};

mod mssql;
mod mysql;
mod postgres;
mod sqlite;

#[derive(Debug, Clone, PartialEq)]
pub struct RawTable {
    pub catalog: String,
    pub schema: String,
    pub name: String,
    /// `BASE TABLE` or `VIEW`, as the catalog reports it.
    pub table_type: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RawColumn {
    pub catalog: String,
    pub schema: String,
    pub table: String,
    pub name: String,
    pub ordinal: u32,
    /// Declared type, preserved verbatim.
    pub data_type: String,
    pub is_nullable: bool,
    pub is_identity: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConstraintKind {
    PrimaryKey,
    ForeignKey,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RawColumnRef {
    pub catalog: String,
    pub schema: String,
    pub table: String,
    pub column: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RawConstraint {
    pub kind: ConstraintKind,
    /// Present on foreign keys: the referenced column.
    pub referenced: Option<RawColumnRef>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RawProc {
    pub schema: String,
    pub name: String,
    pub is_read_only: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RawProcParam {
    pub proc_schema: String,
    pub proc_name: String,
    pub name: String,
    pub ordinal: u32,
    pub data_type: String,
    /// `IN`, `OUT` or `INOUT`.
    pub mode: String,
    pub is_nullable: bool,
}

pub type ConstraintMap = HashMap<(String, String, String, String), Vec<RawConstraint>>;

/// Raw introspection output, keyed the same way for every dialect.
#[derive(Debug, Clone, Default)]
pub struct SchemaData {
    pub tables: Vec<RawTable>,
    pub columns: Vec<RawColumn>,
    pub constraints: ConstraintMap,
    pub procs: Vec<RawProc>,
    pub proc_params: Vec<RawProcParam>,
}

impl SchemaData {
    pub fn add_constraint(
        &mut self,
        catalog: &str,
        schema: &str,
        table: &str,
        column: &str,
        constraint: RawConstraint,
    ) {
        self.constraints
            .entry((
                catalog.to_string(),
                schema.to_string(),
                table.to_string(),
                column.to_string(),
            ))
            .or_default()
            .push(constraint);
    }
}

/// Reads the full raw schema for the given dialect over the driver adapter.
pub async fn read_schema(
    dialect: Dialect,
    executor: &dyn SqlExecutor,
) -> BifrostResult<SchemaData> {
    info!(?dialect, "starting database introspection");
    let data = match dialect {
        Dialect::Sqlite => sqlite::read_schema(executor).await?,
        Dialect::Postgres => postgres::read_schema(executor).await?,
        Dialect::MySql => mysql::read_schema(executor).await?,
        Dialect::SqlServer => mssql::read_schema(executor).await?,
    };
    info!(
        tables = data.tables.len(),
        columns = data.columns.len(),
        procs = data.procs.len(),
        "introspection complete"
    );
    Ok(data)
}

// Row-field accessors shared by the readers. Catalog queries come back as
// JSON rows through the driver adapter; fields may arrive as strings even
// for numeric catalog columns depending on the driver.

pub(crate) fn str_field(row: &Row, name: &str) -> BifrostResult<String> {
    match row.get(name) {
        Some(Value::String(s)) => Ok(s.clone()),
        Some(Value::Number(n)) => Ok(n.to_string()),
        Some(Value::Null) | None => Err(BifrostError::SchemaLoad(format!(
            "catalog row is missing field '{name}'"
        ))),
        Some(other) => Ok(other.to_string()),
    }
}

pub(crate) fn opt_str_field(row: &Row, name: &str) -> Option<String> {
    match row.get(name) {
        Some(Value::String(s)) => Some(s.clone()),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    }
}

pub(crate) fn i64_field(row: &Row, name: &str) -> BifrostResult<i64> {
    match row.get(name) {
        Some(Value::Number(n)) => n.as_i64().ok_or_else(|| {
            BifrostError::SchemaLoad(format!("catalog field '{name}' is not an integer"))
        }),
        Some(Value::String(s)) => s.parse().map_err(|_| {
            BifrostError::SchemaLoad(format!("catalog field '{name}' is not an integer"))
        }),
        _ => Err(BifrostError::SchemaLoad(format!(
            "catalog row is missing field '{name}'"
        ))),
    }
}

/// Reads `YES`/`NO` (information schema) or 0/1 (pragmas) truthiness.
pub(crate) fn bool_field(row: &Row, name: &str) -> bool {
    match row.get(name) {
        Some(Value::Bool(b)) => *b,
        Some(Value::Number(n)) => n.as_i64().unwrap_or(0) != 0,
        Some(Value::String(s)) => s.eq_ignore_ascii_case("yes") || s == "1",
        _ => false,
    }
}

#[cfg(test)]
pub mod test_fixtures {
    //! A small library schema shared by model and translator tests.

    use super::*;

    fn table(schema: &str, name: &str, table_type: &str) -> RawTable {
        RawTable {
            catalog: "library".into(),
            schema: schema.into(),
            name: name.into(),
            table_type: table_type.into(),
        }
    }

    fn column(
        schema: &str,
        table: &str,
        name: &str,
        ordinal: u32,
        data_type: &str,
        nullable: bool,
        identity: bool,
    ) -> RawColumn {
        RawColumn {
            catalog: "library".into(),
            schema: schema.into(),
            table: table.into(),
            name: name.into(),
            ordinal,
            data_type: data_type.into(),
            is_nullable: nullable,
            is_identity: identity,
        }
    }

    /// Authors / Books (AuthorId + EditorId FKs) / OrderItems / Employees
    /// (self-referencing ManagerId) plus a BookTitles view.
    pub fn library_schema() -> SchemaData {
        let mut data = SchemaData {
            tables: vec![
                table("dbo", "Authors", "BASE TABLE"),
                table("dbo", "Books", "BASE TABLE"),
                table("dbo", "OrderItems", "BASE TABLE"),
                table("dbo", "Employees", "BASE TABLE"),
                table("dbo", "BookTitles", "VIEW"),
            ],
            columns: vec![
                column("dbo", "Authors", "Id", 1, "INT", false, true),
                column("dbo", "Authors", "Name", 2, "VARCHAR(100)", false, false),
                column("dbo", "Books", "Id", 1, "INT", false, true),
                column("dbo", "Books", "Title", 2, "VARCHAR(200)", false, false),
                column("dbo", "Books", "AuthorId", 3, "INT", false, false),
                column("dbo", "Books", "EditorId", 4, "INT", true, false),
                column("dbo", "OrderItems", "Id", 1, "INT", false, true),
                column("dbo", "OrderItems", "BookId", 2, "INT", false, false),
                column(
                    "dbo",
                    "OrderItems",
                    "Price",
                    3,
                    "DECIMAL(10,2)",
                    false,
                    false,
                ),
                column("dbo", "Employees", "Id", 1, "INT", false, true),
                column("dbo", "Employees", "ManagerId", 2, "INT", true, false),
                column("dbo", "BookTitles", "Title", 1, "VARCHAR(200)", false, false),
            ],
            ..Default::default()
        };

        for (table, column) in [
            ("Authors", "Id"),
            ("Books", "Id"),
            ("OrderItems", "Id"),
            ("Employees", "Id"),
        ] {
            data.add_constraint(
                "library",
                "dbo",
                table,
                column,
                RawConstraint {
                    kind: ConstraintKind::PrimaryKey,
                    referenced: None,
                },
            );
        }

        for (table, column, ref_table, ref_column) in [
            ("Books", "AuthorId", "Authors", "Id"),
            ("Books", "EditorId", "Authors", "Id"),
            ("OrderItems", "BookId", "Books", "Id"),
            ("Employees", "ManagerId", "Employees", "Id"),
        ] {
            data.add_constraint(
                "library",
                "dbo",
                table,
                column,
                RawConstraint {
                    kind: ConstraintKind::ForeignKey,
                    referenced: Some(RawColumnRef {
                        catalog: "library".into(),
                        schema: "dbo".into(),
                        table: ref_table.into(),
                        column: ref_column.into(),
                    }),
                },
            );
        }

        data
    }

    /// Users (audit + soft-delete columns) and Orders (tenant + org scoped,
    /// FK to Users), the shape the policy and tree-sync tests work against.
    pub fn shop_schema() -> SchemaData {
        let mut data = SchemaData {
            tables: vec![
                table("dbo", "Users", "BASE TABLE"),
                table("dbo", "Orders", "BASE TABLE"),
            ],
            columns: vec![
                column("dbo", "Users", "Id", 1, "INT", false, true),
                column("dbo", "Users", "Name", 2, "VARCHAR(100)", false, false),
                column("dbo", "Users", "created_at", 3, "DATETIME2", true, false),
                column("dbo", "Users", "updated_at", 4, "DATETIME2", true, false),
                column(
                    "dbo",
                    "Users",
                    "created_by_user_id",
                    5,
                    "VARCHAR(50)",
                    true,
                    false,
                ),
                column(
                    "dbo",
                    "Users",
                    "updated_by_user_id",
                    6,
                    "VARCHAR(50)",
                    true,
                    false,
                ),
                column("dbo", "Users", "deleted_at", 7, "DATETIME2", true, false),
                column(
                    "dbo",
                    "Users",
                    "deleted_by_user_id",
                    8,
                    "VARCHAR(50)",
                    true,
                    false,
                ),
                column("dbo", "Orders", "Id", 1, "INT", false, true),
                column("dbo", "Orders", "UserId", 2, "INT", false, false),
                column("dbo", "Orders", "tenant_id", 3, "INT", false, false),
                column("dbo", "Orders", "org_id", 4, "INT", true, false),
                column("dbo", "Orders", "Total", 5, "DECIMAL(10,2)", false, false),
                column("dbo", "Orders", "deleted_at", 6, "DATETIME2", true, false),
            ],
            ..Default::default()
        };

        for (table, column) in [("Users", "Id"), ("Orders", "Id")] {
            data.add_constraint(
                "library",
                "dbo",
                table,
                column,
                RawConstraint {
                    kind: ConstraintKind::PrimaryKey,
                    referenced: None,
                },
            );
        }
        data.add_constraint(
            "library",
            "dbo",
            "Orders",
            "UserId",
            RawConstraint {
                kind: ConstraintKind::ForeignKey,
                referenced: Some(RawColumnRef {
                    catalog: "library".into(),
                    schema: "dbo".into(),
                    table: "Users".into(),
                    column: "Id".into(),
                }),
            },
        );

        data
    }
}
