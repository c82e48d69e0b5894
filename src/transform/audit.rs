//! Audit-column population, driven by `populate` column metadata. All
//! timestamps written by a single operation share one UTC instant;
//! client-supplied values for audit columns are overwritten. User columns
//! are populated only when the model configures a `user-audit-key`.

use serde_json::Value;

use crate::context::UserContext;
use crate::model::{META_POPULATE, Model, Table};
use crate::transform::mutation::{DataMap, MutationTransformResult, MutationTransformer, MutationType};
use crate::transform::now_utc_string;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PopulateKind {
    CreatedOn,
    CreatedBy,
    UpdatedOn,
    UpdatedBy,
    DeletedOn,
    DeletedBy,
}

impl PopulateKind {
    fn parse(value: &str) -> Option<Self> {
        let kind = match value {
            "created-on" => Self::CreatedOn,
            "created-by" => Self::CreatedBy,
            "updated-on" => Self::UpdatedOn,
            "updated-by" => Self::UpdatedBy,
            "deleted-on" => Self::DeletedOn,
            "deleted-by" => Self::DeletedBy,
            _ => return None,
        };
        Some(kind)
    }

    fn written_on(&self, mutation_type: MutationType) -> bool {
        match mutation_type {
            MutationType::Insert => matches!(
                self,
                Self::CreatedOn | Self::CreatedBy | Self::UpdatedOn | Self::UpdatedBy
            ),
            MutationType::Update => matches!(self, Self::UpdatedOn | Self::UpdatedBy),
            MutationType::Delete => matches!(
                self,
                Self::UpdatedOn | Self::UpdatedBy | Self::DeletedOn | Self::DeletedBy
            ),
        }
    }

    fn is_timestamp(&self) -> bool {
        matches!(self, Self::CreatedOn | Self::UpdatedOn | Self::DeletedOn)
    }
}

pub struct BasicAuditModule;

impl MutationTransformer for BasicAuditModule {
    fn applies_to(
        &self,
        _model: &Model,
        table: &Table,
        _mutation_type: MutationType,
        _ctx: &UserContext,
    ) -> bool {
        table
            .columns()
            .any(|c| c.metadata(META_POPULATE).is_some())
    }

    fn transform(
        &self,
        model: &Model,
        table: &Table,
        mutation_type: MutationType,
        data: &DataMap,
        ctx: &UserContext,
    ) -> MutationTransformResult {
        let mut result = MutationTransformResult::passthrough(mutation_type, data.clone());

        let now = Value::String(now_utc_string());
        let audit_key = model.user_audit_key();
        let user = audit_key
            .and_then(|key| ctx.get(key))
            .cloned()
            .unwrap_or(Value::Null);

        for column in table.columns() {
            let Some(kind) = column.metadata(META_POPULATE).and_then(PopulateKind::parse)
            else {
                continue;
            };
            if !kind.written_on(mutation_type) {
                continue;
            }
            if kind.is_timestamp() {
                result.data.insert(column.db_name.clone(), now.clone());
            } else if audit_key.is_some() {
                result.data.insert(column.db_name.clone(), user.clone());
            }
        }

        result
    }
}
