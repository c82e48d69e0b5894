//! Auto-filtering from user claims. Table metadata maps columns to claim
//! names (`"col1:claim1, col2:claim2"`); each pair becomes an `_eq` leaf,
//! or an `_in` leaf when the claim value is a list. Users carrying the
//! model's bypass role skip the whole module.

use serde_json::Value;

use crate::context::UserContext;
use crate::error::{BifrostError, BifrostResult};
use crate::model::{META_AUTO_FILTER, Model, Table};
use crate::query::filter::{Filter, FilterOp};
use crate::transform::FilterTransformer;

pub struct AutoFilterTransformer;

impl FilterTransformer for AutoFilterTransformer {
    fn priority(&self) -> i32 {
        1
    }

    fn applies_to(&self, model: &Model, table: &Table, ctx: &UserContext) -> bool {
        let has_mapping = table
            .metadata(META_AUTO_FILTER)
            .is_some_and(|v| !v.trim().is_empty());
        let bypassed = model
            .auto_filter_bypass_role()
            .is_some_and(|role| ctx.has_role(role));
        has_mapping && !bypassed
    }

    fn additional_filter(
        &self,
        _model: &Model,
        table: &Table,
        ctx: &UserContext,
    ) -> BifrostResult<Option<Filter>> {
        let mapping = table.metadata(META_AUTO_FILTER).unwrap_or_default();

        let mut filters = Vec::new();
        for pair in mapping.split(',') {
            let (column_name, claim) =
                pair.split_once(':')
                    .ok_or_else(|| BifrostError::InvalidFormat {
                        mapping: mapping.to_string(),
                        table: table.db_name.clone(),
                    })?;
            let column_name = column_name.trim();
            let claim = claim.trim();
            if column_name.is_empty() || claim.is_empty() {
                return Err(BifrostError::InvalidFormat {
                    mapping: mapping.to_string(),
                    table: table.db_name.clone(),
                });
            }

            let column =
                table
                    .column(column_name)
                    .ok_or_else(|| BifrostError::ColumnNotFound {
                        column: column_name.to_string(),
                        table: table.db_name.clone(),
                    })?;

            let value = ctx.get(claim).ok_or_else(|| BifrostError::ClaimMissing {
                claim: claim.to_string(),
            })?;

            let filter = match value {
                Value::Null => {
                    return Err(BifrostError::ClaimNull {
                        claim: claim.to_string(),
                    });
                }
                Value::Array(items) if items.is_empty() => {
                    return Err(BifrostError::ClaimEmpty {
                        claim: claim.to_string(),
                    });
                }
                Value::Array(_) => Filter::column(
                    &table.db_name,
                    &column.db_name,
                    FilterOp::In,
                    value.clone(),
                ),
                _ => Filter::column(
                    &table.db_name,
                    &column.db_name,
                    FilterOp::Eq,
                    value.clone(),
                ),
            };
            filters.push(filter);
        }

        match filters.len() {
            0 => Ok(None),
            1 => Ok(filters.pop()),
            _ => Ok(Some(Filter::And(filters))),
        }
    }
}
