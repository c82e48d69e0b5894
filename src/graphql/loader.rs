//! Bulk-loader joins. Link fields never emit SQL JOINs; sibling resolutions
//! batch here into one `IN (keys)` query per (table, column, policy filter)
//! group and the rows are stitched back in memory. This keeps parent
//! pagination intact and avoids Cartesian products.

use std::collections::HashMap;
use std::sync::Arc;

use async_graphql::dataloader::Loader;
use serde_json::Value;
use tracing::{debug, instrument};

use crate::db::{Row, SqlExecutor};
use crate::dialect::UNLIMITED;
use crate::error::BifrostError;
use crate::model::Model;
use crate::query::filter::{Filter, FilterOp};
use crate::query::ir::{ObjectQuery, QueryType};
use crate::query::params::SqlParameters;
use crate::query::translator::Translator;

/// One linked-row lookup. Values and policy filters are carried as
/// canonical JSON so the key can be hashed and grouped.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LinkKey {
    pub schema: String,
    pub table: String,
    pub column: String,
    value_json: String,
    filter_json: String,
}

impl LinkKey {
    pub fn new(
        schema: &str,
        table: &str,
        column: &str,
        value: &Value,
        filter: Option<&Filter>,
    ) -> Self {
        Self {
            schema: schema.to_string(),
            table: table.to_string(),
            column: column.to_string(),
            value_json: value.to_string(),
            filter_json: filter
                .map(|f| serde_json::to_string(f).unwrap_or_default())
                .unwrap_or_default(),
        }
    }

    fn value(&self) -> Value {
        serde_json::from_str(&self.value_json).unwrap_or(Value::Null)
    }

    fn filter(&self) -> Option<Filter> {
        if self.filter_json.is_empty() {
            None
        } else {
            serde_json::from_str(&self.filter_json).ok()
        }
    }
}

pub struct LinkLoader {
    pub model: Arc<Model>,
    pub executor: Arc<dyn SqlExecutor>,
    pub translator: Translator,
}

impl Loader<LinkKey> for LinkLoader {
    type Value = Arc<Vec<Row>>;
    type Error = Arc<BifrostError>;

    #[instrument(skip(self, keys), fields(keys = keys.len()), level = "debug")]
    async fn load(
        &self,
        keys: &[LinkKey],
    ) -> Result<HashMap<LinkKey, Self::Value>, Self::Error> {
        let mut groups: HashMap<(String, String, String, String), Vec<&LinkKey>> = HashMap::new();
        for key in keys {
            groups
                .entry((
                    key.schema.clone(),
                    key.table.clone(),
                    key.column.clone(),
                    key.filter_json.clone(),
                ))
                .or_default()
                .push(key);
        }
        debug!("grouped into {} queries", groups.len());

        let mut results: HashMap<LinkKey, Self::Value> = HashMap::new();

        for ((schema, table_name, column, _), group_keys) in groups {
            let table = self
                .model
                .require_table(&format!("{schema}.{table_name}"))
                .map_err(Arc::new)?;

            let values: Vec<Value> = group_keys.iter().map(|k| k.value()).collect();
            let mut query = ObjectQuery::new(table, QueryType::Join);
            query.limit = Some(UNLIMITED);
            query.filter = Filter::combine(
                group_keys[0].filter(),
                vec![Filter::column(
                    &table.db_name,
                    &column,
                    FilterOp::In,
                    Value::Array(values),
                )],
            );

            let mut params = SqlParameters::new(self.translator.dialect());
            let sql = self
                .translator
                .select_sql(&query, &self.model, &mut params)
                .map_err(Arc::new)?;
            let rows = self
                .executor
                .fetch_all(&sql, &params.values())
                .await
                .map_err(Arc::new)?;
            debug!(rows = rows.len(), table = %table_name, "loaded linked rows");

            let mut by_value: HashMap<String, Vec<Row>> = HashMap::new();
            for row in rows {
                let bucket = row.get(&column).cloned().unwrap_or(Value::Null).to_string();
                by_value.entry(bucket).or_default().push(row);
            }
            for key in group_keys {
                let rows = by_value.remove(&key.value_json).unwrap_or_default();
                results.insert(key.clone(), Arc::new(rows));
            }
        }

        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn keys_group_by_table_column_and_filter() {
        let filter = Filter::column("Orders", "deleted_at", FilterOp::Eq, Value::Null);
        let a = LinkKey::new("dbo", "Orders", "UserId", &json!(1), Some(&filter));
        let b = LinkKey::new("dbo", "Orders", "UserId", &json!(1), Some(&filter));
        let c = LinkKey::new("dbo", "Orders", "UserId", &json!(1), None);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn key_round_trips_value_and_filter() {
        let filter = Filter::column("Orders", "tenant_id", FilterOp::Eq, json!(42));
        let key = LinkKey::new("dbo", "Orders", "UserId", &json!(7), Some(&filter));
        assert_eq!(key.value(), json!(7));
        assert_eq!(key.filter(), Some(filter));

        let bare = LinkKey::new("dbo", "Orders", "UserId", &json!(7), None);
        assert_eq!(bare.filter(), None);
    }
}
