use serde::Deserialize;

use crate::query::filter::FilterOp;

/// Limit applied when a query does not ask for one.
pub const DEFAULT_LIMIT: i64 = 100;
/// Sentinel limit meaning "no limit clause at all".
pub const UNLIMITED: i64 = -1;

/// SQL surface conventions for one database engine. Dialects are plain
/// values passed by parameter; every variant produces identical filter
/// trees and identical parameter counts/values for equivalent queries,
/// varying only in surface syntax.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dialect {
    #[serde(alias = "mssql")]
    SqlServer,
    Postgres,
    MySql,
    Sqlite,
}

/// Which side(s) of a LIKE pattern carry the wildcard.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LikeKind {
    Contains,
    StartsWith,
    EndsWith,
}

impl Dialect {
    /// Wraps a single identifier in the dialect's quoting, doubling any
    /// embedded closing quote character.
    pub fn escape_identifier(&self, name: &str) -> String {
        match self {
            Dialect::SqlServer => format!("[{}]", name.replace(']', "]]")),
            Dialect::Postgres => format!("\"{}\"", name.replace('"', "\"\"")),
            Dialect::MySql | Dialect::Sqlite => format!("`{}`", name.replace('`', "``")),
        }
    }

    /// `schema.table` with both parts individually escaped; an empty schema
    /// emits just the escaped table.
    pub fn table_reference(&self, schema: &str, table: &str) -> String {
        if schema.is_empty() {
            self.escape_identifier(table)
        } else {
            format!(
                "{}.{}",
                self.escape_identifier(schema),
                self.escape_identifier(table)
            )
        }
    }

    /// SQL operator symbol for a logical operator code. LIKE-family
    /// operators share the LIKE keyword; the pattern itself comes from
    /// [`Dialect::like_pattern`].
    pub fn operator(&self, op: FilterOp) -> &'static str {
        match op {
            FilterOp::Eq => "=",
            FilterOp::Neq => "<>",
            FilterOp::Gt => ">",
            FilterOp::Lt => "<",
            FilterOp::Gte => ">=",
            FilterOp::Lte => "<=",
            FilterOp::In => "IN",
            FilterOp::Contains | FilterOp::StartsWith | FilterOp::EndsWith => "LIKE",
            FilterOp::Between => "BETWEEN",
        }
    }

    /// Wildcard expression around an already-tracked parameter reference.
    pub fn like_pattern(&self, param_ref: &str, kind: LikeKind) -> String {
        match self {
            Dialect::SqlServer | Dialect::MySql => match kind {
                LikeKind::Contains => format!("CONCAT('%', {param_ref}, '%')"),
                LikeKind::StartsWith => format!("CONCAT({param_ref}, '%')"),
                LikeKind::EndsWith => format!("CONCAT('%', {param_ref})"),
            },
            Dialect::Postgres | Dialect::Sqlite => match kind {
                LikeKind::Contains => format!("'%' || {param_ref} || '%'"),
                LikeKind::StartsWith => format!("{param_ref} || '%'"),
                LikeKind::EndsWith => format!("'%' || {param_ref}"),
            },
        }
    }

    /// `ORDER BY` plus the dialect's paging clause. `sorts` are rendered
    /// sort expressions (`"[Total]" DESC`, ...); callers paginating an
    /// unsorted query pass the table's primary key so the order is
    /// deterministic. A `None` limit defaults to [`DEFAULT_LIMIT`];
    /// [`UNLIMITED`] omits the limit clause.
    pub fn pagination(&self, sorts: &[String], offset: Option<u64>, limit: Option<i64>) -> String {
        let limit = limit.unwrap_or(DEFAULT_LIMIT);
        let offset = offset.unwrap_or(0);

        match self {
            Dialect::SqlServer => {
                // OFFSET/FETCH requires an ORDER BY; (SELECT NULL) is the
                // fallback when no deterministic key is available.
                let order = if sorts.is_empty() {
                    "ORDER BY (SELECT NULL)".to_string()
                } else {
                    format!("ORDER BY {}", sorts.join(", "))
                };
                if limit == UNLIMITED {
                    if offset == 0 && sorts.is_empty() {
                        return String::new();
                    }
                    format!("{order} OFFSET {offset} ROWS")
                } else {
                    format!("{order} OFFSET {offset} ROWS FETCH NEXT {limit} ROWS ONLY")
                }
            }
            Dialect::Postgres | Dialect::MySql | Dialect::Sqlite => {
                let mut clause = String::new();
                if !sorts.is_empty() {
                    clause.push_str(&format!("ORDER BY {}", sorts.join(", ")));
                }
                if limit != UNLIMITED {
                    if !clause.is_empty() {
                        clause.push(' ');
                    }
                    clause.push_str(&format!("LIMIT {limit} OFFSET {offset}"));
                } else if offset > 0 {
                    // LIMIT is mandatory before OFFSET on MySQL/SQLite.
                    if !clause.is_empty() {
                        clause.push(' ');
                    }
                    match self {
                        Dialect::Postgres => clause.push_str(&format!("OFFSET {offset}")),
                        _ => clause.push_str(&format!("LIMIT -1 OFFSET {offset}")),
                    }
                }
                clause
            }
        }
    }

    /// Snippet yielding the last inserted identity value.
    pub fn last_inserted_identity(&self) -> &'static str {
        match self {
            Dialect::SqlServer => "SCOPE_IDENTITY()",
            Dialect::Postgres => "LASTVAL()",
            Dialect::MySql => "LAST_INSERT_ID()",
            Dialect::Sqlite => "last_insert_rowid()",
        }
    }

    pub fn parameter_prefix(&self) -> &'static str {
        match self {
            Dialect::SqlServer | Dialect::MySql | Dialect::Sqlite => "@",
            Dialect::Postgres => "$",
        }
    }

    pub const ALL: [Dialect; 4] = [
        Dialect::SqlServer,
        Dialect::Postgres,
        Dialect::MySql,
        Dialect::Sqlite,
    ];
}
