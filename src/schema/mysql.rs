//! MySQL introspection over the information schema, scoped to the current
//! database. `COLUMN_TYPE` keeps the declared precision (`varchar(100)`,
//! `decimal(10,2)`), and `auto_increment` in `EXTRA` marks identity.

use crate::db::{Row, SqlExecutor};
use crate::error::BifrostResult;
use crate::schema::{
    ConstraintKind, RawColumn, RawColumnRef, RawConstraint, RawProc, RawProcParam, RawTable,
    SchemaData, bool_field, i64_field, opt_str_field, str_field,
};

const TABLES: &str = "SELECT TABLE_SCHEMA, TABLE_NAME, TABLE_TYPE \
     FROM information_schema.TABLES \
     WHERE TABLE_SCHEMA = DATABASE() \
     ORDER BY TABLE_NAME";

const COLUMNS: &str = "SELECT TABLE_SCHEMA, TABLE_NAME, COLUMN_NAME, ORDINAL_POSITION, COLUMN_TYPE, \
            IS_NULLABLE, EXTRA LIKE '%auto_increment%' AS IS_AUTO \
     FROM information_schema.COLUMNS \
     WHERE TABLE_SCHEMA = DATABASE() \
     ORDER BY TABLE_NAME, ORDINAL_POSITION";

const CONSTRAINTS: &str = "SELECT kcu.CONSTRAINT_NAME, kcu.TABLE_SCHEMA, kcu.TABLE_NAME, kcu.COLUMN_NAME, \
            kcu.REFERENCED_TABLE_SCHEMA, kcu.REFERENCED_TABLE_NAME, kcu.REFERENCED_COLUMN_NAME \
     FROM information_schema.KEY_COLUMN_USAGE kcu \
     WHERE kcu.TABLE_SCHEMA = DATABASE() \
       AND (kcu.CONSTRAINT_NAME = 'PRIMARY' OR kcu.REFERENCED_TABLE_NAME IS NOT NULL)";

const ROUTINES: &str = "SELECT ROUTINE_SCHEMA, ROUTINE_NAME \
     FROM information_schema.ROUTINES \
     WHERE ROUTINE_SCHEMA = DATABASE() \
     ORDER BY ROUTINE_NAME";

const ROUTINE_PARAMS: &str = "SELECT SPECIFIC_SCHEMA, SPECIFIC_NAME, PARAMETER_NAME, ORDINAL_POSITION, \
            DTD_IDENTIFIER, PARAMETER_MODE \
     FROM information_schema.PARAMETERS \
     WHERE SPECIFIC_SCHEMA = DATABASE() AND ORDINAL_POSITION > 0 \
     ORDER BY SPECIFIC_NAME, ORDINAL_POSITION";

pub(crate) async fn read_schema(executor: &dyn SqlExecutor) -> BifrostResult<SchemaData> {
    let mut data = SchemaData::default();

    for row in executor.fetch_all(TABLES, &[]).await? {
        data.tables.push(parse_table(&row)?);
    }
    for row in executor.fetch_all(COLUMNS, &[]).await? {
        data.columns.push(parse_column(&row)?);
    }
    for row in executor.fetch_all(CONSTRAINTS, &[]).await? {
        let (key, constraint) = parse_constraint(&row)?;
        data.constraints.entry(key).or_default().push(constraint);
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
            data_type: str_field(&row, "DTD_IDENTIFIER")?,
            mode: str_field(&row, "PARAMETER_MODE")?,
            is_nullable: true,
        });
    }

    Ok(data)
}

fn parse_table(row: &Row) -> BifrostResult<RawTable> {
    let schema = str_field(row, "TABLE_SCHEMA")?;
    Ok(RawTable {
        catalog: schema.clone(),
        schema,
        name: str_field(row, "TABLE_NAME")?,
        table_type: str_field(row, "TABLE_TYPE")?,
    })
}

fn parse_column(row: &Row) -> BifrostResult<RawColumn> {
    let schema = str_field(row, "TABLE_SCHEMA")?;
    Ok(RawColumn {
        catalog: schema.clone(),
        schema,
        table: str_field(row, "TABLE_NAME")?,
        name: str_field(row, "COLUMN_NAME")?,
        ordinal: i64_field(row, "ORDINAL_POSITION")? as u32,
        data_type: str_field(row, "COLUMN_TYPE")?,
        is_nullable: bool_field(row, "IS_NULLABLE"),
        is_identity: bool_field(row, "IS_AUTO"),
    })
}

type ConstraintEntry = ((String, String, String, String), RawConstraint);

fn parse_constraint(row: &Row) -> BifrostResult<ConstraintEntry> {
    let schema = str_field(row, "TABLE_SCHEMA")?;
    let key = (
        schema.clone(),
        schema,
        str_field(row, "TABLE_NAME")?,
        str_field(row, "COLUMN_NAME")?,
    );
    let constraint = match opt_str_field(row, "REFERENCED_TABLE_NAME") {
        Some(ref_table) => {
            let ref_schema = opt_str_field(row, "REFERENCED_TABLE_SCHEMA").unwrap_or_default();
            RawConstraint {
                kind: ConstraintKind::ForeignKey,
                referenced: Some(RawColumnRef {
                    catalog: ref_schema.clone(),
                    schema: ref_schema,
                    table: ref_table,
                    column: opt_str_field(row, "REFERENCED_COLUMN_NAME").unwrap_or_default(),
                }),
            }
        }
        None => RawConstraint {
            kind: ConstraintKind::PrimaryKey,
            referenced: None,
        },
    };
    Ok((key, constraint))
}
