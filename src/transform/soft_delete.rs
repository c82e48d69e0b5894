//! Soft deletion: reads filter out rows whose `deleted_at` column is set,
//! deletes rewrite to updates that set it, and updates refuse to touch
//! already-deleted rows. Requests can opt out with `include_deleted` (whole
//! request) or `include_deleted:<schema>.<table>`.

use serde_json::Value;

use crate::context::{DEFAULT_USER_AUDIT_KEY, INCLUDE_DELETED_KEY, UserContext};
use crate::error::{BifrostError, BifrostResult};
use crate::model::{META_SOFT_DELETE, META_SOFT_DELETE_BY, Model, Table};
use crate::query::filter::{Filter, FilterOp};
use crate::transform::mutation::{MutationTransformResult, MutationTransformer, MutationType};
use crate::transform::{FilterTransformer, now_utc_string};

fn include_deleted(table: &Table, ctx: &UserContext) -> bool {
    ctx.flag(INCLUDE_DELETED_KEY)
        || ctx.flag(&format!(
            "{INCLUDE_DELETED_KEY}:{}.{}",
            table.schema_name, table.db_name
        ))
}

pub struct SoftDeleteFilterTransformer;

impl FilterTransformer for SoftDeleteFilterTransformer {
    fn priority(&self) -> i32 {
        100
    }

    fn applies_to(&self, _model: &Model, table: &Table, ctx: &UserContext) -> bool {
        table.metadata(META_SOFT_DELETE).is_some() && !include_deleted(table, ctx)
    }

    fn additional_filter(
        &self,
        _model: &Model,
        table: &Table,
        _ctx: &UserContext,
    ) -> BifrostResult<Option<Filter>> {
        let column_name = table.metadata(META_SOFT_DELETE).unwrap_or_default();
        if column_name.is_empty() {
            return Ok(None);
        }
        let column = table
            .column(column_name)
            .ok_or_else(|| BifrostError::ColumnNotFound {
                column: column_name.to_string(),
                table: table.db_name.clone(),
            })?;
        // Null value on an Eq leaf compiles to IS NULL.
        Ok(Some(Filter::column(
            &table.db_name,
            &column.db_name,
            FilterOp::Eq,
            Value::Null,
        )))
    }
}

/// DELETE becomes UPDATE `deleted_at = now()` (plus `deleted_by` when
/// configured); UPDATE gains a `deleted_at IS NULL` guard so it never
/// touches already-deleted rows. INSERT is unaffected.
pub struct SoftDeleteMutationTransformer;

impl MutationTransformer for SoftDeleteMutationTransformer {
    fn applies_to(
        &self,
        _model: &Model,
        table: &Table,
        mutation_type: MutationType,
        _ctx: &UserContext,
    ) -> bool {
        table.metadata(META_SOFT_DELETE).is_some()
            && matches!(mutation_type, MutationType::Update | MutationType::Delete)
    }

    fn transform(
        &self,
        model: &Model,
        table: &Table,
        mutation_type: MutationType,
        data: &serde_json::Map<String, Value>,
        ctx: &UserContext,
    ) -> MutationTransformResult {
        let mut result = MutationTransformResult::passthrough(mutation_type, data.clone());

        let column_name = table.metadata(META_SOFT_DELETE).unwrap_or_default();
        if column_name.is_empty() {
            return result;
        }
        let Some(column) = table.column(column_name) else {
            result.errors.push(format!(
                "column {column_name} not found in table {}",
                table.db_name
            ));
            return result;
        };

        match mutation_type {
            MutationType::Delete => {
                result.mutation_type = MutationType::Update;
                // The audit module may already have stamped this column with
                // the operation's instant; keep that one.
                result
                    .data
                    .entry(column.db_name.clone())
                    .or_insert_with(|| Value::String(now_utc_string()));

                if let Some(by_name) = table.metadata(META_SOFT_DELETE_BY) {
                    let key = model.user_audit_key().unwrap_or(DEFAULT_USER_AUDIT_KEY);
                    if let Some(user) = ctx.get(key).filter(|v| !v.is_null()) {
                        match table.column(by_name) {
                            Some(by_column) => {
                                result.data.insert(by_column.db_name.clone(), user.clone());
                            }
                            None => result.errors.push(format!(
                                "column {by_name} not found in table {}",
                                table.db_name
                            )),
                        }
                    }
                }
            }
            MutationType::Update => {
                result.additional_filter = Some(Filter::column(
                    &table.db_name,
                    &column.db_name,
                    FilterOp::Eq,
                    Value::Null,
                ));
            }
            MutationType::Insert => {}
        }

        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transform::test_support::shop_model;
    use serde_json::json;

    const METADATA: &str = "[tables.Users]\nsoft-delete = \"deleted_at\"\n\
                            soft-delete-by = \"deleted_by_user_id\"\n";

    #[test]
    fn filter_is_an_is_null_leaf() {
        let model = shop_model(METADATA);
        let table = model.table("Users").unwrap();
        let filter = SoftDeleteFilterTransformer
            .additional_filter(&model, table, &UserContext::new())
            .unwrap();
        assert_eq!(
            filter,
            Some(Filter::column(
                "Users",
                "deleted_at",
                FilterOp::Eq,
                Value::Null
            ))
        );
    }

    #[test]
    fn empty_metadata_applies_but_emits_nothing() {
        let model = shop_model("[tables.Users]\nsoft-delete = \"\"\n");
        let table = model.table("Users").unwrap();
        let ctx = UserContext::new();
        assert!(SoftDeleteFilterTransformer.applies_to(&model, table, &ctx));
        assert_eq!(
            SoftDeleteFilterTransformer
                .additional_filter(&model, table, &ctx)
                .unwrap(),
            None
        );
    }

    #[test]
    fn delete_rewrites_to_update_with_timestamp_and_user() {
        let model = shop_model(METADATA);
        let table = model.table("Users").unwrap();
        let mut ctx = UserContext::new();
        ctx.set("user_id", "user-7");

        let result = SoftDeleteMutationTransformer.transform(
            &model,
            table,
            MutationType::Delete,
            &serde_json::Map::new(),
            &ctx,
        );
        assert_eq!(result.mutation_type, MutationType::Update);
        assert!(result.errors.is_empty());
        assert!(result.data["deleted_at"].is_string());
        assert_eq!(result.data["deleted_by_user_id"], json!("user-7"));
    }

    #[test]
    fn delete_without_user_in_context_skips_deleted_by() {
        let model = shop_model(METADATA);
        let table = model.table("Users").unwrap();
        let result = SoftDeleteMutationTransformer.transform(
            &model,
            table,
            MutationType::Delete,
            &serde_json::Map::new(),
            &UserContext::new(),
        );
        assert!(result.data["deleted_at"].is_string());
        assert!(!result.data.contains_key("deleted_by_user_id"));
    }

    #[test]
    fn update_gains_a_not_deleted_guard_and_keeps_data() {
        let model = shop_model(METADATA);
        let table = model.table("Users").unwrap();
        let mut data = serde_json::Map::new();
        data.insert("Name".into(), json!("Alice"));

        let result = SoftDeleteMutationTransformer.transform(
            &model,
            table,
            MutationType::Update,
            &data,
            &UserContext::new(),
        );
        assert_eq!(result.mutation_type, MutationType::Update);
        assert_eq!(result.data, data);
        assert_eq!(
            result.additional_filter,
            Some(Filter::column(
                "Users",
                "deleted_at",
                FilterOp::Eq,
                Value::Null
            ))
        );
    }

    #[test]
    fn missing_column_is_collected_not_thrown() {
        let model = shop_model("[tables.Users]\nsoft-delete = \"gone_at\"\n");
        let table = model.table("Users").unwrap();
        let mut data = serde_json::Map::new();
        data.insert("Name".into(), json!("Alice"));

        let result = SoftDeleteMutationTransformer.transform(
            &model,
            table,
            MutationType::Delete,
            &data,
            &UserContext::new(),
        );
        assert_eq!(
            result.errors,
            vec!["column gone_at not found in table Users".to_string()]
        );
        // data untouched
        assert_eq!(result.data, data);
        assert_eq!(result.mutation_type, MutationType::Delete);
    }

    #[test]
    fn insert_is_not_applicable() {
        let model = shop_model(METADATA);
        let table = model.table("Users").unwrap();
        assert!(!SoftDeleteMutationTransformer.applies_to(
            &model,
            table,
            MutationType::Insert,
            &UserContext::new()
        ));
    }
}
