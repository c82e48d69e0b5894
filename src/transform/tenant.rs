//! Multi-tenant row filtering. A table opts in with `tenant-filter`
//! metadata naming its tenant column; the tenant id itself comes from the
//! user context under the model's `tenant-context-key`.

use crate::context::UserContext;
use crate::error::{BifrostError, BifrostResult};
use crate::model::{META_TENANT_FILTER, Model, Table};
use crate::query::filter::{Filter, FilterOp};
use crate::transform::FilterTransformer;

pub struct TenantFilterTransformer;

impl FilterTransformer for TenantFilterTransformer {
    fn priority(&self) -> i32 {
        0
    }

    fn applies_to(&self, _model: &Model, table: &Table, _ctx: &UserContext) -> bool {
        table.metadata(META_TENANT_FILTER).is_some()
    }

    fn additional_filter(
        &self,
        model: &Model,
        table: &Table,
        ctx: &UserContext,
    ) -> BifrostResult<Option<Filter>> {
        let column_name = table.metadata(META_TENANT_FILTER).unwrap_or_default();
        let key = model.tenant_context_key();

        let value = ctx.get(key).ok_or_else(|| BifrostError::TenantMissing {
            key: key.to_string(),
        })?;
        if value.is_null() {
            return Err(BifrostError::TenantNull {
                key: key.to_string(),
            });
        }

        let column = table
            .column(column_name)
            .ok_or_else(|| BifrostError::ColumnNotFound {
                column: column_name.to_string(),
                table: table.db_name.clone(),
            })?;

        Ok(Some(Filter::column(
            &table.db_name,
            &column.db_name,
            FilterOp::Eq,
            value.clone(),
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transform::test_support::shop_model;
    use serde_json::{Value, json};

    const METADATA: &str = "[tables.Orders]\ntenant-filter = \"tenant_id\"\n";

    #[test]
    fn produces_an_eq_leaf_on_the_configured_column() {
        let model = shop_model(METADATA);
        let table = model.table("Orders").unwrap();
        let mut ctx = UserContext::new();
        ctx.set("tenant_id", 42);

        let filter = TenantFilterTransformer
            .additional_filter(&model, table, &ctx)
            .unwrap();
        assert_eq!(
            filter,
            Some(Filter::column("Orders", "tenant_id", FilterOp::Eq, json!(42)))
        );
    }

    #[test]
    fn respects_the_configured_context_key() {
        let metadata = "[model]\ntenant-context-key = \"org\"\n\
                        [tables.Orders]\ntenant-filter = \"tenant_id\"\n";
        let model = shop_model(metadata);
        let table = model.table("Orders").unwrap();
        let mut ctx = UserContext::new();
        ctx.set("org", 9);

        let filter = TenantFilterTransformer
            .additional_filter(&model, table, &ctx)
            .unwrap()
            .unwrap();
        let Filter::Column(leaf) = filter else {
            panic!("expected a leaf");
        };
        assert_eq!(leaf.next.value, json!(9));
    }

    #[test]
    fn missing_tenant_key_fails() {
        let model = shop_model(METADATA);
        let table = model.table("Orders").unwrap();
        let err = TenantFilterTransformer
            .additional_filter(&model, table, &UserContext::new())
            .unwrap_err();
        assert!(matches!(err, BifrostError::TenantMissing { .. }));
    }

    #[test]
    fn null_tenant_fails() {
        let model = shop_model(METADATA);
        let table = model.table("Orders").unwrap();
        let mut ctx = UserContext::new();
        ctx.set("tenant_id", Value::Null);
        let err = TenantFilterTransformer
            .additional_filter(&model, table, &ctx)
            .unwrap_err();
        assert!(matches!(err, BifrostError::TenantNull { .. }));
    }

    #[test]
    fn unknown_column_fails() {
        let model = shop_model("[tables.Orders]\ntenant-filter = \"nope\"\n");
        let table = model.table("Orders").unwrap();
        let mut ctx = UserContext::new();
        ctx.set("tenant_id", 1);
        let err = TenantFilterTransformer
            .additional_filter(&model, table, &ctx)
            .unwrap_err();
        assert!(matches!(err, BifrostError::ColumnNotFound { .. }));
    }

    #[test]
    fn does_not_apply_without_metadata() {
        let model = shop_model("");
        let table = model.table("Orders").unwrap();
        assert!(!TenantFilterTransformer.applies_to(&model, table, &UserContext::new()));
    }
}
