//! Maps declared database column types to GraphQL scalar names, one mapping
//! per dialect. Declared types arrive verbatim (`VARCHAR(100)`,
//! `decimal(10,2)`); precision is stripped before matching.

use tracing::debug;

use crate::dialect::Dialect;

pub const SCALAR_INT: &str = "Int";
pub const SCALAR_FLOAT: &str = "Float";
pub const SCALAR_STRING: &str = "String";
pub const SCALAR_BOOLEAN: &str = "Boolean";
/// Date/time columns surface as an ISO-8601 string-backed scalar.
pub const SCALAR_DATETIME: &str = "DateTime";
/// Opaque JSON scalar used by stored-procedure result sets.
pub const SCALAR_JSON: &str = "JSON";

/// GraphQL scalar name for a declared column type.
pub fn graphql_type(dialect: Dialect, declared: &str) -> &'static str {
    let base = base_type(declared);

    // MySQL's tinyint(1) is the conventional boolean.
    if dialect == Dialect::MySql && base == "tinyint" && declared.to_lowercase().contains("(1)") {
        return SCALAR_BOOLEAN;
    }

    match base.as_str() {
        "int" | "integer" | "smallint" | "tinyint" | "mediumint" | "bigint" | "serial"
        | "bigserial" | "smallserial" | "int2" | "int4" | "int8" | "year" => SCALAR_INT,
        "real" | "float" | "double" | "double precision" | "decimal" | "numeric" | "money"
        | "smallmoney" | "float4" | "float8" => SCALAR_FLOAT,
        "bit" if dialect == Dialect::SqlServer => SCALAR_BOOLEAN,
        "bool" | "boolean" => SCALAR_BOOLEAN,
        "date" | "time" | "datetime" | "datetime2" | "smalldatetime" | "datetimeoffset"
        | "timestamp" | "timestamptz" | "timestamp with time zone"
        | "timestamp without time zone" | "time with time zone" | "time without time zone" => {
            SCALAR_DATETIME
        }
        "text" | "varchar" | "nvarchar" | "char" | "nchar" | "character"
        | "character varying" | "uuid" | "uniqueidentifier" | "json" | "jsonb" | "xml"
        | "blob" | "tinyblob" | "mediumblob" | "longblob" | "binary" | "varbinary" | "bytea"
        | "image" | "enum" | "set" | "tinytext" | "mediumtext" | "longtext" | "ntext" => {
            SCALAR_STRING
        }
        other => {
            debug!(dialect = ?dialect, "unknown column type '{other}', defaulting to String");
            SCALAR_STRING
        }
    }
}

/// Lowercased declared type with any parenthesized precision removed.
fn base_type(declared: &str) -> String {
    let lowered = declared.trim().to_lowercase();
    match lowered.find('(') {
        Some(open) => {
            let close = lowered.rfind(')').unwrap_or(lowered.len() - 1);
            let tail = lowered[close + 1..].trim();
            let head = lowered[..open].trim_end();
            if tail.is_empty() {
                head.to_string()
            } else {
                format!("{head} {tail}")
            }
        }
        None => lowered,
    }
}
