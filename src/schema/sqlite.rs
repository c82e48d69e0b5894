//! SQLite introspection through the PRAGMA table-valued functions.
//! Everything lives in the `main` schema; `sqlite_` internal tables are
//! excluded, and a lone `INTEGER PRIMARY KEY` column is reported as the
//! rowid-alias identity.

use serde_json::json;
use tracing::debug;

use crate::db::SqlExecutor;
use crate::error::BifrostResult;
use crate::schema::{
    ConstraintKind, RawColumn, RawColumnRef, RawConstraint, RawTable, SchemaData, bool_field,
    i64_field, opt_str_field, str_field,
};

const MAIN: &str = "main";

const TABLE_LIST: &str = "SELECT name, type FROM pragma_table_list \
     WHERE schema = 'main' AND name NOT LIKE 'sqlite_%' AND type IN ('table', 'view') \
     ORDER BY name";

const TABLE_INFO: &str =
    "SELECT cid, name, type, \"notnull\", dflt_value, pk FROM pragma_table_info(@p1)";

const FOREIGN_KEY_LIST: &str =
    "SELECT id, seq, \"table\", \"from\", \"to\" FROM pragma_foreign_key_list(@p1)";

pub(crate) async fn read_schema(executor: &dyn SqlExecutor) -> BifrostResult<SchemaData> {
    let mut data = SchemaData::default();

    // (child table, child column, parent table, parent column or None when
    // the FK references the parent's implicit primary key)
    let mut pending_fks: Vec<(String, String, String, Option<String>)> = Vec::new();
    // first primary-key column per table, for resolving implicit FK targets
    let mut pk_of: std::collections::HashMap<String, String> = std::collections::HashMap::new();

    for table_row in executor.fetch_all(TABLE_LIST, &[]).await? {
        let name = str_field(&table_row, "name")?;
        let kind = str_field(&table_row, "type")?;
        debug!(table = %name, kind = %kind, "introspecting");

        data.tables.push(RawTable {
            catalog: MAIN.into(),
            schema: MAIN.into(),
            name: name.clone(),
            table_type: if kind == "view" { "VIEW" } else { "BASE TABLE" }.into(),
        });

        let columns = executor.fetch_all(TABLE_INFO, &[json!(name)]).await?;
        let pk_count = columns.iter().filter(|c| i64_field(c, "pk").unwrap_or(0) > 0).count();

        for column in &columns {
            let column_name = str_field(column, "name")?;
            let declared_type = str_field(column, "type").unwrap_or_default();
            let pk_position = i64_field(column, "pk")?;
            let not_null = bool_field(column, "notnull");

            // A single INTEGER PRIMARY KEY column aliases the rowid and
            // autoincrements; composite keys never do.
            let is_identity = pk_position > 0
                && pk_count == 1
                && declared_type.trim().eq_ignore_ascii_case("INTEGER");

            if pk_position == 1 {
                pk_of.entry(name.clone()).or_insert_with(|| column_name.clone());
            }

            if pk_position > 0 {
                data.add_constraint(
                    MAIN,
                    MAIN,
                    &name,
                    &column_name,
                    RawConstraint {
                        kind: ConstraintKind::PrimaryKey,
                        referenced: None,
                    },
                );
            }

            data.columns.push(RawColumn {
                catalog: MAIN.into(),
                schema: MAIN.into(),
                table: name.clone(),
                name: column_name,
                ordinal: i64_field(column, "cid")? as u32 + 1,
                data_type: declared_type,
                is_nullable: !not_null && pk_position == 0,
                is_identity,
            });
        }

        if kind == "table" {
            for fk in executor.fetch_all(FOREIGN_KEY_LIST, &[json!(name)]).await? {
                pending_fks.push((
                    name.clone(),
                    str_field(&fk, "from")?,
                    str_field(&fk, "table")?,
                    opt_str_field(&fk, "to"),
                ));
            }
        }
    }

    for (child_table, child_column, parent_table, parent_column) in pending_fks {
        let parent_column = match parent_column {
            Some(column) => column,
            // `REFERENCES parent` without a column targets the parent PK.
            None => match pk_of.get(&parent_table) {
                Some(pk) => pk.clone(),
                None => continue,
            },
        };
        data.add_constraint(
            MAIN,
            MAIN,
            &child_table,
            &child_column,
            RawConstraint {
                kind: ConstraintKind::ForeignKey,
                referenced: Some(RawColumnRef {
                    catalog: MAIN.into(),
                    schema: MAIN.into(),
                    table: parent_table,
                    column: parent_column,
                }),
            },
        );
    }

    Ok(data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::DbExecutor;
    use crate::dialect::Dialect;
    use crate::schema::ConstraintKind;

    async fn executor_with(ddl: &[&str]) -> DbExecutor {
        let executor = DbExecutor::connect(Dialect::Sqlite, "sqlite::memory:", 1, None)
            .await
            .unwrap();
        for statement in ddl {
            executor.execute(statement, &[]).await.unwrap();
        }
        executor
    }

    #[tokio::test]
    async fn rowid_alias_is_reported_as_identity() {
        let executor = executor_with(&[
            "CREATE TABLE users (id INTEGER PRIMARY KEY AUTOINCREMENT, name TEXT NOT NULL)",
        ])
        .await;
        let data = read_schema(&executor).await.unwrap();

        // sqlite_sequence (created by AUTOINCREMENT) must not leak through.
        assert_eq!(data.tables.len(), 1);
        assert_eq!(data.tables[0].name, "users");
        assert_eq!(data.tables[0].schema, "main");

        let id = data.columns.iter().find(|c| c.name == "id").unwrap();
        assert!(id.is_identity);
        let name = data.columns.iter().find(|c| c.name == "name").unwrap();
        assert!(!name.is_nullable);
    }

    #[tokio::test]
    async fn plain_integer_primary_key_is_also_identity() {
        let executor =
            executor_with(&["CREATE TABLE t (id INTEGER PRIMARY KEY, label TEXT)"]).await;
        let data = read_schema(&executor).await.unwrap();
        let id = data.columns.iter().find(|c| c.name == "id").unwrap();
        assert!(id.is_identity);
    }

    #[tokio::test]
    async fn composite_primary_key_sets_flags_but_no_identity() {
        let executor = executor_with(&[
            "CREATE TABLE pairs (a INTEGER, b INTEGER, PRIMARY KEY (a, b))",
        ])
        .await;
        let data = read_schema(&executor).await.unwrap();

        for column in ["a", "b"] {
            let key = (
                "main".to_string(),
                "main".to_string(),
                "pairs".to_string(),
                column.to_string(),
            );
            let constraints = data.constraints.get(&key).unwrap();
            assert!(
                constraints
                    .iter()
                    .any(|c| c.kind == ConstraintKind::PrimaryKey)
            );
        }
        assert!(data.columns.iter().all(|c| !c.is_identity));
    }

    #[tokio::test]
    async fn views_are_included_with_view_type() {
        let executor = executor_with(&[
            "CREATE TABLE t (id INTEGER PRIMARY KEY, name TEXT)",
            "CREATE VIEW t_names AS SELECT name FROM t",
        ])
        .await;
        let data = read_schema(&executor).await.unwrap();
        let view = data.tables.iter().find(|t| t.name == "t_names").unwrap();
        assert_eq!(view.table_type, "VIEW");
    }

    #[tokio::test]
    async fn foreign_keys_cover_self_reference_and_multiples() {
        let executor = executor_with(&[
            "CREATE TABLE authors (id INTEGER PRIMARY KEY, name TEXT)",
            "CREATE TABLE employees (id INTEGER PRIMARY KEY, manager_id INTEGER REFERENCES employees(id))",
            "CREATE TABLE books (id INTEGER PRIMARY KEY, \
             author_id INTEGER NOT NULL REFERENCES authors(id), \
             editor_id INTEGER REFERENCES authors(id))",
        ])
        .await;
        let data = read_schema(&executor).await.unwrap();

        let fk = |table: &str, column: &str| {
            let key = (
                "main".to_string(),
                "main".to_string(),
                table.to_string(),
                column.to_string(),
            );
            data.constraints
                .get(&key)
                .and_then(|cs| cs.iter().find(|c| c.kind == ConstraintKind::ForeignKey))
                .and_then(|c| c.referenced.clone())
                .unwrap()
        };

        assert_eq!(fk("books", "author_id").table, "authors");
        assert_eq!(fk("books", "editor_id").table, "authors");
        let self_ref = fk("employees", "manager_id");
        assert_eq!(self_ref.table, "employees");
        assert_eq!(self_ref.column, "id");
    }

    #[tokio::test]
    async fn implicit_fk_target_resolves_to_parent_pk() {
        let executor = executor_with(&[
            "CREATE TABLE parents (pid INTEGER PRIMARY KEY)",
            "CREATE TABLE kids (id INTEGER PRIMARY KEY, parent INTEGER REFERENCES parents)",
        ])
        .await;
        let data = read_schema(&executor).await.unwrap();
        let key = (
            "main".to_string(),
            "main".to_string(),
            "kids".to_string(),
            "parent".to_string(),
        );
        let referenced = data.constraints.get(&key).unwrap()[0]
            .referenced
            .clone()
            .unwrap();
        assert_eq!(referenced.column, "pid");
    }

    #[tokio::test]
    async fn declared_types_are_preserved_verbatim() {
        let executor =
            executor_with(&["CREATE TABLE t (id INTEGER PRIMARY KEY, price DECIMAL(10,2))"]).await;
        let data = read_schema(&executor).await.unwrap();
        let price = data.columns.iter().find(|c| c.name == "price").unwrap();
        assert_eq!(price.data_type, "DECIMAL(10,2)");
    }
}
