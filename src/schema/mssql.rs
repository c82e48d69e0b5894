//! SQL Server introspection over the information schema. Execution goes
//! through a host-supplied [`SqlExecutor`]; the catalog queries and row
//! parsing here are the full reader implementation.

use crate::db::{Row, SqlExecutor};
use crate::error::BifrostResult;
use crate::schema::{
    ConstraintKind, RawColumn, RawColumnRef, RawConstraint, RawProc, RawProcParam, RawTable,
    SchemaData, bool_field, i64_field, opt_str_field, str_field,
};

const TABLES: &str = "SELECT TABLE_CATALOG, TABLE_SCHEMA, TABLE_NAME, TABLE_TYPE \
     FROM INFORMATION_SCHEMA.TABLES \
     ORDER BY TABLE_SCHEMA, TABLE_NAME";

// DATA_TYPE is recomposed with its declared length so the model sees
// VARCHAR(100) / NVARCHAR(MAX) the way the designer wrote it.
const COLUMNS: &str = "SELECT c.TABLE_CATALOG, c.TABLE_SCHEMA, c.TABLE_NAME, c.COLUMN_NAME, \
            c.ORDINAL_POSITION, c.IS_NULLABLE, \
            c.DATA_TYPE + CASE \
              WHEN c.CHARACTER_MAXIMUM_LENGTH = -1 THEN '(MAX)' \
              WHEN c.CHARACTER_MAXIMUM_LENGTH IS NOT NULL \
                THEN '(' + CAST(c.CHARACTER_MAXIMUM_LENGTH AS varchar(10)) + ')' \
              WHEN c.NUMERIC_PRECISION IS NOT NULL AND c.NUMERIC_SCALE > 0 \
                THEN '(' + CAST(c.NUMERIC_PRECISION AS varchar(10)) + ',' + CAST(c.NUMERIC_SCALE AS varchar(10)) + ')' \
              ELSE '' \
            END AS DATA_TYPE, \
            COLUMNPROPERTY(OBJECT_ID(QUOTENAME(c.TABLE_SCHEMA) + '.' + QUOTENAME(c.TABLE_NAME)), \
                           c.COLUMN_NAME, 'IsIdentity') AS IS_IDENTITY \
     FROM INFORMATION_SCHEMA.COLUMNS c \
     ORDER BY c.TABLE_SCHEMA, c.TABLE_NAME, c.ORDINAL_POSITION";

const CONSTRAINTS: &str = "SELECT tc.CONSTRAINT_TYPE, kcu.TABLE_CATALOG, kcu.TABLE_SCHEMA, kcu.TABLE_NAME, \
            kcu.COLUMN_NAME, kcu2.TABLE_CATALOG AS REF_CATALOG, kcu2.TABLE_SCHEMA AS REF_SCHEMA, \
            kcu2.TABLE_NAME AS REF_TABLE, kcu2.COLUMN_NAME AS REF_COLUMN \
     FROM INFORMATION_SCHEMA.TABLE_CONSTRAINTS tc \
     JOIN INFORMATION_SCHEMA.KEY_COLUMN_USAGE kcu \
       ON kcu.CONSTRAINT_NAME = tc.CONSTRAINT_NAME \
      AND kcu.CONSTRAINT_SCHEMA = tc.CONSTRAINT_SCHEMA \
     LEFT JOIN INFORMATION_SCHEMA.REFERENTIAL_CONSTRAINTS rc \
       ON rc.CONSTRAINT_NAME = tc.CONSTRAINT_NAME \
      AND rc.CONSTRAINT_SCHEMA = tc.CONSTRAINT_SCHEMA \
     LEFT JOIN INFORMATION_SCHEMA.KEY_COLUMN_USAGE kcu2 \
       ON kcu2.CONSTRAINT_NAME = rc.UNIQUE_CONSTRAINT_NAME \
      AND kcu2.CONSTRAINT_SCHEMA = rc.UNIQUE_CONSTRAINT_SCHEMA \
      AND kcu2.ORDINAL_POSITION = kcu.ORDINAL_POSITION \
     WHERE tc.CONSTRAINT_TYPE IN ('PRIMARY KEY', 'FOREIGN KEY')";

const ROUTINES: &str = "SELECT ROUTINE_SCHEMA, ROUTINE_NAME \
     FROM INFORMATION_SCHEMA.ROUTINES \
     WHERE ROUTINE_TYPE = 'PROCEDURE' \
     ORDER BY ROUTINE_SCHEMA, ROUTINE_NAME";

const ROUTINE_PARAMS: &str = "SELECT SPECIFIC_SCHEMA, SPECIFIC_NAME, PARAMETER_NAME, ORDINAL_POSITION, \
            DATA_TYPE, PARAMETER_MODE \
     FROM INFORMATION_SCHEMA.PARAMETERS \
     WHERE PARAMETER_NAME IS NOT NULL AND PARAMETER_NAME <> '' \
     ORDER BY SPECIFIC_SCHEMA, SPECIFIC_NAME, ORDINAL_POSITION";

pub(crate) async fn read_schema(executor: &dyn SqlExecutor) -> BifrostResult<SchemaData> {
    let mut data = SchemaData::default();

    for row in executor.fetch_all(TABLES, &[]).await? {
        data.tables.push(RawTable {
            catalog: str_field(&row, "TABLE_CATALOG")?,
            schema: str_field(&row, "TABLE_SCHEMA")?,
            name: str_field(&row, "TABLE_NAME")?,
            table_type: str_field(&row, "TABLE_TYPE")?,
        });
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
            schema: str_field(&row, "ROUTINE_SCHEMA")?,
            name: str_field(&row, "ROUTINE_NAME")?,
            is_read_only: false,
        });
    }
    for row in executor.fetch_all(ROUTINE_PARAMS, &[]).await? {
        data.proc_params.push(RawProcParam {
            proc_schema: str_field(&row, "SPECIFIC_SCHEMA")?,
            proc_name: str_field(&row, "SPECIFIC_NAME")?,
            name: str_field(&row, "PARAMETER_NAME")?,
            ordinal: i64_field(&row, "ORDINAL_POSITION")? as u32,
            data_type: str_field(&row, "DATA_TYPE")?,
            mode: str_field(&row, "PARAMETER_MODE")?,
            is_nullable: true,
        });
    }

    Ok(data)
}

fn parse_column(row: &Row) -> BifrostResult<RawColumn> {
    Ok(RawColumn {
        catalog: str_field(row, "TABLE_CATALOG")?,
        schema: str_field(row, "TABLE_SCHEMA")?,
        table: str_field(row, "TABLE_NAME")?,
        name: str_field(row, "COLUMN_NAME")?,
        ordinal: i64_field(row, "ORDINAL_POSITION")? as u32,
        data_type: str_field(row, "DATA_TYPE")?,
        is_nullable: bool_field(row, "IS_NULLABLE"),
        is_identity: bool_field(row, "IS_IDENTITY"),
    })
}

type ConstraintEntry = ((String, String, String, String), RawConstraint);

fn parse_constraint(row: &Row) -> BifrostResult<Option<ConstraintEntry>> {
    let key = (
        str_field(row, "TABLE_CATALOG")?,
        str_field(row, "TABLE_SCHEMA")?,
        str_field(row, "TABLE_NAME")?,
        str_field(row, "COLUMN_NAME")?,
    );
    let constraint = match str_field(row, "CONSTRAINT_TYPE")?.as_str() {
        "PRIMARY KEY" => RawConstraint {
            kind: ConstraintKind::PrimaryKey,
            referenced: None,
        },
        "FOREIGN KEY" => {
            let Some(ref_table) = opt_str_field(row, "REF_TABLE") else {
                return Ok(None);
            };
            RawConstraint {
                kind: ConstraintKind::ForeignKey,
                referenced: Some(RawColumnRef {
                    catalog: opt_str_field(row, "REF_CATALOG").unwrap_or_default(),
                    schema: opt_str_field(row, "REF_SCHEMA").unwrap_or_default(),
                    table: ref_table,
                    column: opt_str_field(row, "REF_COLUMN").unwrap_or_default(),
                }),
            }
        }
        _ => return Ok(None),
    };
    Ok(Some((key, constraint)))
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
    fn identity_flag_comes_from_columnproperty() {
        let parsed = parse_column(&row(&[
            ("TABLE_CATALOG", json!("Shop")),
            ("TABLE_SCHEMA", json!("dbo")),
            ("TABLE_NAME", json!("Orders")),
            ("COLUMN_NAME", json!("Id")),
            ("ORDINAL_POSITION", json!(1)),
            ("DATA_TYPE", json!("int")),
            ("IS_NULLABLE", json!("NO")),
            ("IS_IDENTITY", json!(1)),
        ]))
        .unwrap();
        assert!(parsed.is_identity);
        assert_eq!(parsed.schema, "dbo");
    }

    #[test]
    fn recomposed_declared_type_passes_through() {
        let parsed = parse_column(&row(&[
            ("TABLE_CATALOG", json!("Shop")),
            ("TABLE_SCHEMA", json!("dbo")),
            ("TABLE_NAME", json!("Orders")),
            ("COLUMN_NAME", json!("Total")),
            ("ORDINAL_POSITION", json!(3)),
            ("DATA_TYPE", json!("decimal(10,2)")),
            ("IS_NULLABLE", json!("YES")),
            ("IS_IDENTITY", json!(0)),
        ]))
        .unwrap();
        assert_eq!(parsed.data_type, "decimal(10,2)");
        assert!(parsed.is_nullable);
    }

    #[test]
    fn foreign_key_without_resolved_target_is_skipped() {
        let parsed = parse_constraint(&row(&[
            ("CONSTRAINT_TYPE", json!("FOREIGN KEY")),
            ("TABLE_CATALOG", json!("Shop")),
            ("TABLE_SCHEMA", json!("dbo")),
            ("TABLE_NAME", json!("Orders")),
            ("COLUMN_NAME", json!("UserId")),
            ("REF_TABLE", json!(null)),
        ]))
        .unwrap();
        assert!(parsed.is_none());
    }

    #[test]
    fn foreign_key_resolves_referenced_column() {
        let (_, constraint) = parse_constraint(&row(&[
            ("CONSTRAINT_TYPE", json!("FOREIGN KEY")),
            ("TABLE_CATALOG", json!("Shop")),
            ("TABLE_SCHEMA", json!("dbo")),
            ("TABLE_NAME", json!("Orders")),
            ("COLUMN_NAME", json!("UserId")),
            ("REF_CATALOG", json!("Shop")),
            ("REF_SCHEMA", json!("dbo")),
            ("REF_TABLE", json!("Users")),
            ("REF_COLUMN", json!("Id")),
        ]))
        .unwrap()
        .unwrap();
        let referenced = constraint.referenced.unwrap();
        assert_eq!(referenced.table, "Users");
        assert_eq!(referenced.column, "Id");
    }
}
