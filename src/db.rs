//! Database-driver adapter. The core never talks to a driver directly; it
//! emits parameterized SQL and hands it to a [`SqlExecutor`]. The built-in
//! executor wraps sqlx pools for SQLite, PostgreSQL and MySQL; SQL Server
//! hosts plug in their own implementation of the trait.

use std::time::Duration;

use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose};
use rust_decimal::prelude::ToPrimitive;
use serde_json::{Number, Value};
use sqlx::{Column as _, Row as _, TypeInfo, ValueRef as _};
use sqlx::{MySqlPool, PgPool, SqlitePool};
use tracing::debug;

use crate::dialect::Dialect;
use crate::error::{BifrostError, BifrostResult};
use crate::model::ParamDirection;

/// One result row, shaped as a JSON object keyed by column name.
pub type Row = serde_json::Map<String, Value>;

/// A stored-procedure argument, as dispatched to the driver adapter.
#[derive(Debug, Clone)]
pub struct ProcArg {
    pub name: String,
    pub value: Value,
    pub direction: ParamDirection,
}

/// What a stored-procedure call produced.
#[derive(Debug, Clone, Default)]
pub struct ProcCallResult {
    pub result_sets: Vec<Vec<Row>>,
    pub affected_rows: u64,
    /// Output and input/output parameter values, keyed by parameter name.
    pub output: Row,
}

/// An open transaction. Statements run in list order; dropping the handle
/// without committing rolls everything back.
#[async_trait]
pub trait SqlTransaction: Send {
    async fn fetch_all(&mut self, sql: &str, params: &[Value]) -> BifrostResult<Vec<Row>>;
    async fn fetch_scalar(&mut self, sql: &str, params: &[Value]) -> BifrostResult<Option<Value>>;
    async fn execute(&mut self, sql: &str, params: &[Value]) -> BifrostResult<u64>;
    async fn commit(self: Box<Self>) -> BifrostResult<()>;
    async fn rollback(self: Box<Self>) -> BifrostResult<()>;
}

/// The execution boundary between the core and a database driver.
#[async_trait]
pub trait SqlExecutor: Send + Sync {
    async fn fetch_all(&self, sql: &str, params: &[Value]) -> BifrostResult<Vec<Row>>;
    async fn fetch_scalar(&self, sql: &str, params: &[Value]) -> BifrostResult<Option<Value>>;
    async fn execute(&self, sql: &str, params: &[Value]) -> BifrostResult<u64>;
    async fn begin(&self) -> BifrostResult<Box<dyn SqlTransaction + '_>>;

    /// Stored-procedure execution is delegated to the driver adapter; the
    /// built-in pools do not implement it.
    async fn call_procedure(
        &self,
        proc_ref: &str,
        _args: &[ProcArg],
    ) -> BifrostResult<ProcCallResult> {
        Err(BifrostError::Execution(format!(
            "stored procedure execution is not supported by this driver ({proc_ref})"
        )))
    }
}

/// Connection pool over the sqlx-backed engines.
#[derive(Clone)]
pub enum DbPool {
    Sqlite(SqlitePool),
    Postgres(PgPool),
    MySql(MySqlPool),
}

/// The built-in [`SqlExecutor`]: a pooled connection per call, SQL timeout
/// enforced around every round-trip.
pub struct DbExecutor {
    pool: DbPool,
    dialect: Dialect,
    timeout: Option<Duration>,
}

impl DbExecutor {
    pub fn new(pool: DbPool, dialect: Dialect, timeout: Option<Duration>) -> Self {
        Self {
            pool,
            dialect,
            timeout,
        }
    }

    pub async fn connect(
        dialect: Dialect,
        url: &str,
        max_connections: u32,
        timeout: Option<Duration>,
    ) -> BifrostResult<Self> {
        let pool = match dialect {
            Dialect::Sqlite => DbPool::Sqlite(
                sqlx::sqlite::SqlitePoolOptions::new()
                    .max_connections(max_connections)
                    .connect(url)
                    .await?,
            ),
            Dialect::Postgres => DbPool::Postgres(
                sqlx::postgres::PgPoolOptions::new()
                    .max_connections(max_connections)
                    .connect(url)
                    .await?,
            ),
            Dialect::MySql => DbPool::MySql(
                sqlx::mysql::MySqlPoolOptions::new()
                    .max_connections(max_connections)
                    .connect(url)
                    .await?,
            ),
            Dialect::SqlServer => {
                return Err(BifrostError::Config(
                    "SQL Server requires a host-supplied SqlExecutor implementation".into(),
                ));
            }
        };
        Ok(Self::new(pool, dialect, timeout))
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }

    async fn run<T>(
        &self,
        fut: impl std::future::Future<Output = BifrostResult<T>> + Send,
    ) -> BifrostResult<T> {
        match self.timeout {
            Some(limit) => tokio::time::timeout(limit, fut)
                .await
                .map_err(|_| BifrostError::Execution("SQL statement timed out".into()))?,
            None => fut.await,
        }
    }
}

#[async_trait]
impl SqlExecutor for DbExecutor {
    async fn fetch_all(&self, sql: &str, params: &[Value]) -> BifrostResult<Vec<Row>> {
        let (sql, order) = rewrite_placeholders(self.dialect, sql);
        let values = reorder(params, &order);
        debug!(%sql, params = params.len(), "fetch_all");
        self.run(async {
            match &self.pool {
                DbPool::Sqlite(pool) => {
                    let rows = bind_sqlite(&sql, &values).fetch_all(pool).await?;
                    rows.iter().map(sqlite_row_to_json).collect()
                }
                DbPool::Postgres(pool) => {
                    let rows = bind_pg(&sql, &values).fetch_all(pool).await?;
                    rows.iter().map(pg_row_to_json).collect()
                }
                DbPool::MySql(pool) => {
                    let rows = bind_mysql(&sql, &values).fetch_all(pool).await?;
                    rows.iter().map(mysql_row_to_json).collect()
                }
            }
        })
        .await
    }

    async fn fetch_scalar(&self, sql: &str, params: &[Value]) -> BifrostResult<Option<Value>> {
        let rows = self.fetch_all(sql, params).await?;
        Ok(rows
            .into_iter()
            .next()
            .and_then(|row| row.into_iter().next().map(|(_, v)| v)))
    }

    async fn execute(&self, sql: &str, params: &[Value]) -> BifrostResult<u64> {
        let (sql, order) = rewrite_placeholders(self.dialect, sql);
        let values = reorder(params, &order);
        debug!(%sql, params = params.len(), "execute");
        self.run(async {
            let affected = match &self.pool {
                DbPool::Sqlite(pool) => {
                    bind_sqlite(&sql, &values)
                        .execute(pool)
                        .await?
                        .rows_affected()
                }
                DbPool::Postgres(pool) => {
                    bind_pg(&sql, &values).execute(pool).await?.rows_affected()
                }
                DbPool::MySql(pool) => {
                    bind_mysql(&sql, &values)
                        .execute(pool)
                        .await?
                        .rows_affected()
                }
            };
            Ok(affected)
        })
        .await
    }

    async fn begin(&self) -> BifrostResult<Box<dyn SqlTransaction + '_>> {
        let dialect = self.dialect;
        match &self.pool {
            DbPool::Sqlite(pool) => Ok(Box::new(SqliteTx {
                tx: pool.begin().await?,
                dialect,
            })),
            DbPool::Postgres(pool) => Ok(Box::new(PgTx {
                tx: pool.begin().await?,
                dialect,
            })),
            DbPool::MySql(pool) => Ok(Box::new(MySqlTx {
                tx: pool.begin().await?,
                dialect,
            })),
        }
    }
}

macro_rules! transaction_impl {
    ($name:ident, $db:path, $bind:ident, $to_json:ident) => {
        struct $name<'a> {
            tx: sqlx::Transaction<'a, $db>,
            dialect: Dialect,
        }

        #[async_trait]
        impl SqlTransaction for $name<'_> {
            async fn fetch_all(&mut self, sql: &str, params: &[Value]) -> BifrostResult<Vec<Row>> {
                let (sql, order) = rewrite_placeholders(self.dialect, sql);
                let values = reorder(params, &order);
                debug!(%sql, "tx fetch_all");
                let rows = $bind(&sql, &values).fetch_all(&mut *self.tx).await?;
                rows.iter().map($to_json).collect()
            }

            async fn fetch_scalar(
                &mut self,
                sql: &str,
                params: &[Value],
            ) -> BifrostResult<Option<Value>> {
                let rows = self.fetch_all(sql, params).await?;
                Ok(rows
                    .into_iter()
                    .next()
                    .and_then(|row| row.into_iter().next().map(|(_, v)| v)))
            }

            async fn execute(&mut self, sql: &str, params: &[Value]) -> BifrostResult<u64> {
                let (sql, order) = rewrite_placeholders(self.dialect, sql);
                let values = reorder(params, &order);
                debug!(%sql, "tx execute");
                Ok($bind(&sql, &values)
                    .execute(&mut *self.tx)
                    .await?
                    .rows_affected())
            }

            async fn commit(self: Box<Self>) -> BifrostResult<()> {
                self.tx.commit().await?;
                Ok(())
            }

            async fn rollback(self: Box<Self>) -> BifrostResult<()> {
                self.tx.rollback().await?;
                Ok(())
            }
        }
    };
}

transaction_impl!(SqliteTx, sqlx::Sqlite, bind_sqlite, sqlite_row_to_json);
transaction_impl!(PgTx, sqlx::Postgres, bind_pg, pg_row_to_json);
transaction_impl!(MySqlTx, sqlx::MySql, bind_mysql, mysql_row_to_json);

/// Rewrites the dialect's named placeholders (`@p1`, `$p2`, ...) into the
/// driver's positional syntax. Returns the rewritten SQL and, per
/// appearance, the zero-based index into the parameter collection.
pub fn rewrite_placeholders(dialect: Dialect, sql: &str) -> (String, Vec<usize>) {
    let prefix = match dialect {
        Dialect::Postgres => '$',
        _ => '@',
    };
    let mut out = String::with_capacity(sql.len());
    let mut order = Vec::new();
    let chars: Vec<char> = sql.chars().collect();
    let mut i = 0;

    while i < chars.len() {
        if chars[i] == prefix && i + 1 < chars.len() && chars[i + 1] == 'p' {
            let mut j = i + 2;
            while j < chars.len() && chars[j].is_ascii_digit() {
                j += 1;
            }
            if let Some(index) = (j > i + 2)
                .then(|| chars[i + 2..j].iter().collect::<String>().parse::<usize>().ok())
                .flatten()
                .filter(|&index| index > 0)
            {
                order.push(index - 1);
                match dialect {
                    Dialect::Postgres => out.push_str(&format!("${}", order.len())),
                    _ => out.push('?'),
                }
                i = j;
                continue;
            }
        }
        out.push(chars[i]);
        i += 1;
    }

    (out, order)
}

fn reorder(params: &[Value], order: &[usize]) -> Vec<Value> {
    order
        .iter()
        .map(|&i| params.get(i).cloned().unwrap_or(Value::Null))
        .collect()
}

macro_rules! bind_impl {
    ($name:ident, $db:path) => {
        fn $name<'q>(
            sql: &'q str,
            values: &'q [Value],
        ) -> sqlx::query::Query<'q, $db, <$db as sqlx::Database>::Arguments<'q>> {
            let mut query = sqlx::query(sql);
            for value in values {
                query = match value {
                    Value::Null => query.bind(None::<String>),
                    Value::Bool(b) => query.bind(*b),
                    Value::Number(n) => {
                        if let Some(i) = n.as_i64() {
                            query.bind(i)
                        } else {
                            query.bind(n.as_f64())
                        }
                    }
                    Value::String(s) => query.bind(s.as_str()),
                    other => query.bind(other.to_string()),
                };
            }
            query
        }
    };
}

bind_impl!(bind_sqlite, sqlx::Sqlite);
bind_impl!(bind_pg, sqlx::Postgres);
bind_impl!(bind_mysql, sqlx::MySql);

fn sqlite_row_to_json(row: &sqlx::sqlite::SqliteRow) -> BifrostResult<Row> {
    let mut map = Row::new();
    for (i, col) in row.columns().iter().enumerate() {
        let name = col.name().to_string();
        let raw = row.try_get_raw(i)?;
        if raw.is_null() {
            map.insert(name, Value::Null);
            continue;
        }
        let type_name = raw.type_info().name().to_uppercase();
        drop(raw);
        let value = match type_name.as_str() {
            "INTEGER" | "INT" | "BIGINT" => Value::from(row.try_get::<i64, _>(i)?),
            "REAL" | "NUMERIC" => float_value(row.try_get::<f64, _>(i)?),
            "BOOLEAN" => Value::from(row.try_get::<bool, _>(i)?),
            "BLOB" => {
                Value::from(general_purpose::STANDARD.encode(row.try_get::<Vec<u8>, _>(i)?))
            }
            _ => Value::from(row.try_get::<String, _>(i)?),
        };
        map.insert(name, value);
    }
    Ok(map)
}

fn pg_row_to_json(row: &sqlx::postgres::PgRow) -> BifrostResult<Row> {
    let mut map = Row::new();
    for (i, col) in row.columns().iter().enumerate() {
        let name = col.name().to_string();
        let raw = row.try_get_raw(i)?;
        if raw.is_null() {
            map.insert(name, Value::Null);
            continue;
        }
        let type_name = raw.type_info().name().to_uppercase();
        drop(raw);
        let value = match type_name.as_str() {
            "INT2" => Value::from(row.try_get::<i16, _>(i)? as i64),
            "INT4" => Value::from(row.try_get::<i32, _>(i)? as i64),
            "INT8" | "OID" => Value::from(row.try_get::<i64, _>(i)?),
            "FLOAT4" => float_value(row.try_get::<f32, _>(i)? as f64),
            "FLOAT8" => float_value(row.try_get::<f64, _>(i)?),
            "NUMERIC" => {
                let decimal = row.try_get::<rust_decimal::Decimal, _>(i)?;
                decimal
                    .to_f64()
                    .map(float_value)
                    .unwrap_or_else(|| Value::from(decimal.to_string()))
            }
            "BOOL" => Value::from(row.try_get::<bool, _>(i)?),
            "BYTEA" => {
                Value::from(general_purpose::STANDARD.encode(row.try_get::<Vec<u8>, _>(i)?))
            }
            "TIMESTAMPTZ" => {
                Value::from(row.try_get::<chrono::DateTime<chrono::Utc>, _>(i)?.to_rfc3339())
            }
            "TIMESTAMP" => Value::from(
                row.try_get::<chrono::NaiveDateTime, _>(i)?
                    .and_utc()
                    .to_rfc3339(),
            ),
            "DATE" => Value::from(row.try_get::<chrono::NaiveDate, _>(i)?.to_string()),
            "TIME" => Value::from(row.try_get::<chrono::NaiveTime, _>(i)?.to_string()),
            "UUID" => Value::from(row.try_get::<uuid::Uuid, _>(i)?.to_string()),
            "JSON" | "JSONB" => row.try_get::<Value, _>(i)?,
            _ => Value::from(row.try_get::<String, _>(i)?),
        };
        map.insert(name, value);
    }
    Ok(map)
}

fn mysql_row_to_json(row: &sqlx::mysql::MySqlRow) -> BifrostResult<Row> {
    let mut map = Row::new();
    for (i, col) in row.columns().iter().enumerate() {
        let name = col.name().to_string();
        let raw = row.try_get_raw(i)?;
        if raw.is_null() {
            map.insert(name, Value::Null);
            continue;
        }
        let type_name = raw.type_info().name().to_uppercase();
        drop(raw);
        let value = match type_name.as_str() {
            "BOOLEAN" => Value::from(row.try_get::<bool, _>(i)?),
            "TINYINT" | "SMALLINT" | "MEDIUMINT" | "INT" | "BIGINT" | "YEAR" => {
                Value::from(row.try_get::<i64, _>(i)?)
            }
            "TINYINT UNSIGNED" | "SMALLINT UNSIGNED" | "MEDIUMINT UNSIGNED" | "INT UNSIGNED"
            | "BIGINT UNSIGNED" | "BIT" => Value::from(row.try_get::<u64, _>(i)?),
            "FLOAT" => float_value(row.try_get::<f32, _>(i)? as f64),
            "DOUBLE" => float_value(row.try_get::<f64, _>(i)?),
            "DECIMAL" => {
                let decimal = row.try_get::<rust_decimal::Decimal, _>(i)?;
                decimal
                    .to_f64()
                    .map(float_value)
                    .unwrap_or_else(|| Value::from(decimal.to_string()))
            }
            "TIMESTAMP" => {
                Value::from(row.try_get::<chrono::DateTime<chrono::Utc>, _>(i)?.to_rfc3339())
            }
            "DATETIME" => Value::from(
                row.try_get::<chrono::NaiveDateTime, _>(i)?
                    .and_utc()
                    .to_rfc3339(),
            ),
            "DATE" => Value::from(row.try_get::<chrono::NaiveDate, _>(i)?.to_string()),
            "TIME" => Value::from(row.try_get::<chrono::NaiveTime, _>(i)?.to_string()),
            "TINYBLOB" | "BLOB" | "MEDIUMBLOB" | "LONGBLOB" | "BINARY" | "VARBINARY" => {
                Value::from(general_purpose::STANDARD.encode(row.try_get::<Vec<u8>, _>(i)?))
            }
            "JSON" => row.try_get::<Value, _>(i)?,
            _ => Value::from(row.try_get::<String, _>(i)?),
        };
        map.insert(name, value);
    }
    Ok(map)
}

fn float_value(f: f64) -> Value {
    Number::from_f64(f).map(Value::Number).unwrap_or(Value::Null)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn rewrite_sqlite_placeholders_to_question_marks() {
        let (sql, order) = rewrite_placeholders(
            Dialect::Sqlite,
            "SELECT * FROM `t` WHERE `a` = @p1 AND `b` IN (@p2, @p3)",
        );
        assert_eq!(sql, "SELECT * FROM `t` WHERE `a` = ? AND `b` IN (?, ?)");
        assert_eq!(order, vec![0, 1, 2]);
    }

    #[test]
    fn rewrite_postgres_placeholders_to_positional() {
        let (sql, order) =
            rewrite_placeholders(Dialect::Postgres, "SELECT 1 WHERE \"a\" = $p1 AND \"b\" = $p2");
        assert_eq!(sql, "SELECT 1 WHERE \"a\" = $1 AND \"b\" = $2");
        assert_eq!(order, vec![0, 1]);
    }

    #[test]
    fn rewrite_leaves_plain_sql_alone() {
        let (sql, order) = rewrite_placeholders(Dialect::Sqlite, "SELECT `p` FROM `t`");
        assert_eq!(sql, "SELECT `p` FROM `t`");
        assert!(order.is_empty());
    }

    #[test]
    fn reorder_follows_appearance_order() {
        let params = vec![json!(1), json!(2)];
        assert_eq!(reorder(&params, &[1, 0]), vec![json!(2), json!(1)]);
    }

    #[tokio::test]
    async fn sqlite_round_trip_with_parameters() {
        let executor = DbExecutor::connect(Dialect::Sqlite, "sqlite::memory:", 1, None)
            .await
            .unwrap();
        executor
            .execute(
                "CREATE TABLE t (id INTEGER PRIMARY KEY, name TEXT, score REAL)",
                &[],
            )
            .await
            .unwrap();
        executor
            .execute(
                "INSERT INTO t (name, score) VALUES (@p1, @p2)",
                &[json!("alice"), json!(9.5)],
            )
            .await
            .unwrap();

        let rows = executor
            .fetch_all("SELECT id, name, score FROM t WHERE name = @p1", &[json!("alice")])
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["id"], json!(1));
        assert_eq!(rows[0]["name"], json!("alice"));
        assert_eq!(rows[0]["score"], json!(9.5));
    }

    #[tokio::test]
    async fn transaction_rolls_back_on_drop() {
        let executor = DbExecutor::connect(Dialect::Sqlite, "sqlite::memory:", 1, None)
            .await
            .unwrap();
        executor
            .execute("CREATE TABLE t (id INTEGER PRIMARY KEY, name TEXT)", &[])
            .await
            .unwrap();

        {
            let mut tx = executor.begin().await.unwrap();
            tx.execute("INSERT INTO t (name) VALUES (@p1)", &[json!("ghost")])
                .await
                .unwrap();
            tx.rollback().await.unwrap();
        }

        let rows = executor.fetch_all("SELECT * FROM t", &[]).await.unwrap();
        assert!(rows.is_empty());
    }

    #[tokio::test]
    async fn identity_is_visible_inside_the_transaction() {
        let executor = DbExecutor::connect(Dialect::Sqlite, "sqlite::memory:", 1, None)
            .await
            .unwrap();
        executor
            .execute("CREATE TABLE t (id INTEGER PRIMARY KEY, name TEXT)", &[])
            .await
            .unwrap();

        let mut tx = executor.begin().await.unwrap();
        tx.execute("INSERT INTO t (name) VALUES (@p1)", &[json!("a")])
            .await
            .unwrap();
        let id = tx
            .fetch_scalar("SELECT last_insert_rowid()", &[])
            .await
            .unwrap();
        assert_eq!(id, Some(json!(1)));
        tx.commit().await.unwrap();
    }
}
