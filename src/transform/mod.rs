//! The policy engine: priority-ordered transformers that inject WHERE
//! clauses from user context, and a mutation pipeline that rewrites
//! operations before execution. Security transformers occupy priorities
//! 0-99 (tenant 0, auto-filter 1), data-integrity ones 100-199
//! (soft-delete 100); lower priority lands earlier in the combined AND.

use chrono::{SecondsFormat, Utc};
use tracing::debug;

use crate::context::UserContext;
use crate::error::BifrostResult;
use crate::model::{Model, Table};
use crate::query::filter::Filter;
use crate::query::ir::ObjectQuery;

pub mod audit;
pub mod auto_filter;
pub mod mutation;
pub mod soft_delete;
pub mod tenant;

pub use mutation::{MutationPipeline, MutationTransformResult, MutationTransformer, MutationType};

/// A policy module that can contribute a filter for a table it applies to.
pub trait FilterTransformer: Send + Sync {
    /// Stable ordering key; lower runs earlier.
    fn priority(&self) -> i32;
    fn applies_to(&self, model: &Model, table: &Table, ctx: &UserContext) -> bool;
    /// The filter to AND in, or `None` when the transformer applies but has
    /// nothing to add for this request.
    fn additional_filter(
        &self,
        model: &Model,
        table: &Table,
        ctx: &UserContext,
    ) -> BifrostResult<Option<Filter>>;
}

/// Runs every matching transformer over a query tree and combines their
/// output with the query's own filter.
pub struct QueryTransformerService {
    transformers: Vec<Box<dyn FilterTransformer>>,
}

impl Default for QueryTransformerService {
    fn default() -> Self {
        Self::standard()
    }
}

impl QueryTransformerService {
    /// Tenant, auto-filter and soft-delete, in priority order.
    pub fn standard() -> Self {
        Self::with_transformers(vec![
            Box::new(tenant::TenantFilterTransformer),
            Box::new(auto_filter::AutoFilterTransformer),
            Box::new(soft_delete::SoftDeleteFilterTransformer),
        ])
    }

    pub fn with_transformers(mut transformers: Vec<Box<dyn FilterTransformer>>) -> Self {
        transformers.sort_by_key(|t| t.priority());
        Self { transformers }
    }

    /// The filters every applicable transformer contributes for one table,
    /// in ascending priority order. Built fresh on every call.
    pub fn transformer_filters(
        &self,
        model: &Model,
        table: &Table,
        ctx: &UserContext,
    ) -> BifrostResult<Vec<Filter>> {
        let mut filters = Vec::new();
        for transformer in &self.transformers {
            if !transformer.applies_to(model, table, ctx) {
                continue;
            }
            if let Some(filter) = transformer.additional_filter(model, table, ctx)? {
                filters.push(filter);
            }
        }
        Ok(filters)
    }

    /// Combined transformer-only filter for a table, used when loading
    /// linked rows outside a full query tree.
    pub fn combined_filter(
        &self,
        model: &Model,
        table: &Table,
        ctx: &UserContext,
    ) -> BifrostResult<Option<Filter>> {
        Ok(Filter::combine(
            None,
            self.transformer_filters(model, table, ctx)?,
        ))
    }

    /// Rewrites the filter of the query and of every nested join. The
    /// user's filter always comes first in the combined AND; re-running
    /// with the same context recombines from the preserved user filter
    /// instead of nesting.
    pub fn apply_transformers(
        &self,
        query: &mut ObjectQuery,
        model: &Model,
        ctx: &UserContext,
    ) -> BifrostResult<()> {
        let table = model.require_table(&format!("{}.{}", query.schema_name, query.table_name))?;
        let filters = self.transformer_filters(model, table, ctx)?;
        debug!(
            table = %table.db_name,
            injected = filters.len(),
            "applied filter transformers"
        );
        let base = query.base_filter();
        query.filter = Filter::combine(base, filters);

        for join in &mut query.joins {
            self.apply_transformers(&mut join.query, model, ctx)?;
        }
        Ok(())
    }
}

/// One UTC timestamp for the whole operation, RFC 3339 with microseconds.
pub(crate) fn now_utc_string() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

#[cfg(test)]
pub(crate) mod test_support {
    use crate::metadata::MetadataFile;
    use crate::model::Model;
    use crate::schema::test_fixtures::shop_schema;

    /// Shop model with the given metadata TOML applied.
    pub fn shop_model(metadata: &str) -> Model {
        let meta = MetadataFile::parse(metadata).unwrap();
        Model::build(shop_schema(), &meta).unwrap()
    }
}
