//! PostgreSQL introspection over the information schema. Identity covers
//! both `GENERATED ... AS IDENTITY` columns and serial `nextval` defaults.

use crate::db::{Row, SqlExecutor};
use crate::error::BifrostResult;
use crate::schema::{
    ConstraintKind, RawColumn, RawColumnRef, RawConstraint, RawProc, RawProcParam, RawTable,
    SchemaData, bool_field, i64_field, opt_str_field, str_field,
};

const TABLES: &str = "SELECT table_catalog, table_schema, table_name, table_type \
     FROM information_schema.tables \
     WHERE table_schema NOT IN ('pg_catalog', 'information_schema') \
     ORDER BY table_schema, table_name";

const COLUMNS: &str = "SELECT table_catalog, table_schema, table_name, column_name, ordinal_position, \
            data_type, is_nullable, \
            (is_identity = 'YES' OR COALESCE(column_default, '') LIKE 'nextval(%') AS is_serial \
     FROM information_schema.columns \
     WHERE table_schema NOT IN ('pg_catalog', 'information_schema') \
     ORDER BY table_schema, table_name, ordinal_position";

const CONSTRAINTS: &str = "SELECT tc.constraint_type, kcu.table_catalog, kcu.table_schema, kcu.table_name, \
            kcu.column_name, ccu.table_catalog AS ref_catalog, ccu.table_schema AS ref_schema, \
            ccu.table_name AS ref_table, ccu.column_name AS ref_column \
     FROM information_schema.table_constraints tc \
     JOIN information_schema.key_column_usage kcu \
       ON kcu.constraint_name = tc.constraint_name \
      AND kcu.constraint_schema = tc.constraint_schema \
     LEFT JOIN information_schema.constraint_column_usage ccu \
       ON ccu.constraint_name = tc.constraint_name \
      AND ccu.constraint_schema = tc.constraint_schema \
     WHERE tc.constraint_type IN ('PRIMARY KEY', 'FOREIGN KEY')";

const ROUTINES: &str = "SELECT routine_schema, routine_name \
     FROM information_schema.routines \
     WHERE routine_schema NOT IN ('pg_catalog', 'information_schema') \
       AND routine_type IN ('FUNCTION', 'PROCEDURE') \
     ORDER BY routine_schema, routine_name";

const ROUTINE_PARAMS: &str = "SELECT r.routine_schema, r.routine_name, p.parameter_name, p.ordinal_position, \
            p.data_type, p.parameter_mode \
     FROM information_schema.parameters p \
     JOIN information_schema.routines r \
       ON r.specific_name = p.specific_name \
      AND r.specific_schema = p.specific_schema \
     WHERE r.routine_schema NOT IN ('pg_catalog', 'information_schema') \
       AND p.parameter_name IS NOT NULL \
     ORDER BY r.routine_schema, r.routine_name, p.ordinal_position";

pub(crate) async fn read_schema(executor: &dyn SqlExecutor) -> BifrostResult<SchemaData> {
    let mut data = SchemaData::default();

    for row in executor.fetch_all(TABLES, &[]).await? {
        data.tables.push(parse_table(&row)?);
    }
    for row in executor.fetch_all(COLUMNS, &[]).await? {
        data.columns.push(parse_column(&row)?);
    }
    for row in executor.fetch_all(CONSTRAINTS, &[]).await? {
        if let Some((key, constraint)) = parse_constraint(&row)? {
            data.constraints.entry(key).or_default().push(constraint);
        }
    }
    for row in executor.fetch_all(ROUTINES, &[]).await? {
        data.procs.push(RawProc {
            schema: str_field(&row, "routine_schema")?,
            name: str_field(&row, "routine_name")?,
            is_read_only: false,
        });
    }
    for row in executor.fetch_all(ROUTINE_PARAMS, &[]).await? {
        data.proc_params.push(parse_proc_param(&row)?);
    }

    Ok(data)
}

fn parse_table(row: &Row) -> BifrostResult<RawTable> {
    Ok(RawTable {
        catalog: str_field(row, "table_catalog")?,
        schema: str_field(row, "table_schema")?,
        name: str_field(row, "table_name")?,
        table_type: str_field(row, "table_type")?,
    })
}

fn parse_column(row: &Row) -> BifrostResult<RawColumn> {
    Ok(RawColumn {
        catalog: str_field(row, "table_catalog")?,
        schema: str_field(row, "table_schema")?,
        table: str_field(row, "table_name")?,
        name: str_field(row, "column_name")?,
        ordinal: i64_field(row, "ordinal_position")? as u32,
        data_type: str_field(row, "data_type")?,
        is_nullable: bool_field(row, "is_nullable"),
        is_identity: bool_field(row, "is_serial"),
    })
}

type ConstraintEntry = ((String, String, String, String), RawConstraint);

fn parse_constraint(row: &Row) -> BifrostResult<Option<ConstraintEntry>> {
    let key = (
        str_field(row, "table_catalog")?,
        str_field(row, "table_schema")?,
        str_field(row, "table_name")?,
        str_field(row, "column_name")?,
    );
    let constraint_type = str_field(row, "constraint_type")?;
    let constraint = match constraint_type.as_str() {
        "PRIMARY KEY" => RawConstraint {
            kind: ConstraintKind::PrimaryKey,
            referenced: None,
        },
        "FOREIGN KEY" => {
            let Some(ref_table) = opt_str_field(row, "ref_table") else {
                return Ok(None);
            };
            RawConstraint {
                kind: ConstraintKind::ForeignKey,
                referenced: Some(RawColumnRef {
                    catalog: opt_str_field(row, "ref_catalog").unwrap_or_default(),
                    schema: opt_str_field(row, "ref_schema").unwrap_or_default(),
                    table: ref_table,
                    column: opt_str_field(row, "ref_column").unwrap_or_default(),
                }),
            }
        }
        _ => return Ok(None),
    };
    Ok(Some((key, constraint)))
}

fn parse_proc_param(row: &Row) -> BifrostResult<RawProcParam> {
    Ok(RawProcParam {
        proc_schema: str_field(row, "routine_schema")?,
        proc_name: str_field(row, "routine_name")?,
        name: str_field(row, "parameter_name")?,
        ordinal: i64_field(row, "ordinal_position")? as u32,
        data_type: str_field(row, "data_type")?,
        mode: str_field(row, "parameter_mode")?,
        is_nullable: true,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(pairs: &[(&str, serde_json::Value)]) -> Row {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn parses_serial_columns_as_identity() {
        let parsed = parse_column(&row(&[
            ("table_catalog", json!("shop")),
            ("table_schema", json!("public")),
            ("table_name", json!("orders")),
            ("column_name", json!("id")),
            ("ordinal_position", json!(1)),
            ("data_type", json!("integer")),
            ("is_nullable", json!("NO")),
            ("is_serial", json!(true)),
        ]))
        .unwrap();
        assert!(parsed.is_identity);
        assert!(!parsed.is_nullable);
        assert_eq!(parsed.schema, "public");
    }

    #[test]
    fn parses_foreign_key_with_reference() {
        let (key, constraint) = parse_constraint(&row(&[
            ("constraint_type", json!("FOREIGN KEY")),
            ("table_catalog", json!("shop")),
            ("table_schema", json!("public")),
            ("table_name", json!("orders")),
            ("column_name", json!("user_id")),
            ("ref_catalog", json!("shop")),
            ("ref_schema", json!("public")),
            ("ref_table", json!("users")),
            ("ref_column", json!("id")),
        ]))
        .unwrap()
        .unwrap();
        assert_eq!(key.3, "user_id");
        assert_eq!(constraint.kind, ConstraintKind::ForeignKey);
        assert_eq!(constraint.referenced.unwrap().table, "users");
    }

    #[test]
    fn parses_primary_key() {
        let (_, constraint) = parse_constraint(&row(&[
            ("constraint_type", json!("PRIMARY KEY")),
            ("table_catalog", json!("shop")),
            ("table_schema", json!("public")),
            ("table_name", json!("orders")),
            ("column_name", json!("id")),
        ]))
        .unwrap()
        .unwrap();
        assert_eq!(constraint.kind, ConstraintKind::PrimaryKey);
        assert!(constraint.referenced.is_none());
    }

    #[test]
    fn parses_routine_parameter_modes() {
        let param = parse_proc_param(&row(&[
            ("routine_schema", json!("public")),
            ("routine_name", json!("top_books")),
            ("parameter_name", json!("how_many")),
            ("ordinal_position", json!(1)),
            ("data_type", json!("integer")),
            ("parameter_mode", json!("IN")),
        ]))
        .unwrap();
        assert_eq!(param.mode, "IN");
        assert_eq!(param.ordinal, 1);
    }
}
