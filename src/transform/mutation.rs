//! Mutation rewriting. Transformers run per row, before translation; each
//! sees the original mutation type and the data as transformed so far.
//! Column errors are collected in the result rather than thrown, so a
//! batched mutation can surface every failure at once.

use serde_json::Value;

use crate::context::UserContext;
use crate::model::{Model, Table};
use crate::query::filter::Filter;

pub type DataMap = serde_json::Map<String, Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationType {
    Insert,
    Update,
    Delete,
}

#[derive(Debug, Clone)]
pub struct MutationTransformResult {
    pub mutation_type: MutationType,
    pub data: DataMap,
    pub additional_filter: Option<Filter>,
    pub errors: Vec<String>,
}

impl MutationTransformResult {
    pub fn passthrough(mutation_type: MutationType, data: DataMap) -> Self {
        Self {
            mutation_type,
            data,
            additional_filter: None,
            errors: Vec::new(),
        }
    }
}

pub trait MutationTransformer: Send + Sync {
    fn applies_to(
        &self,
        model: &Model,
        table: &Table,
        mutation_type: MutationType,
        ctx: &UserContext,
    ) -> bool;

    fn transform(
        &self,
        model: &Model,
        table: &Table,
        mutation_type: MutationType,
        data: &DataMap,
        ctx: &UserContext,
    ) -> MutationTransformResult;
}

/// Chains mutation transformers. The audit module runs before soft-delete
/// so it observes the original Delete and can stamp `deleted-on` columns;
/// type rewrites are last-writer-wins, data merges in chain order, filters
/// AND together and errors accumulate.
pub struct MutationPipeline {
    transformers: Vec<Box<dyn MutationTransformer>>,
}

impl Default for MutationPipeline {
    fn default() -> Self {
        Self::standard()
    }
}

impl MutationPipeline {
    pub fn standard() -> Self {
        Self::with_transformers(vec![
            Box::new(super::audit::BasicAuditModule),
            Box::new(super::soft_delete::SoftDeleteMutationTransformer),
        ])
    }

    pub fn with_transformers(transformers: Vec<Box<dyn MutationTransformer>>) -> Self {
        Self { transformers }
    }

    pub fn transform(
        &self,
        model: &Model,
        table: &Table,
        mutation_type: MutationType,
        data: &DataMap,
        ctx: &UserContext,
    ) -> MutationTransformResult {
        let mut result = MutationTransformResult::passthrough(mutation_type, data.clone());

        for transformer in &self.transformers {
            if !transformer.applies_to(model, table, mutation_type, ctx) {
                continue;
            }
            let step = transformer.transform(model, table, mutation_type, &result.data, ctx);
            result.data = step.data;
            if step.mutation_type != mutation_type {
                result.mutation_type = step.mutation_type;
            }
            result.additional_filter =
                match (result.additional_filter.take(), step.additional_filter) {
                    (None, filter) => filter,
                    (filter, None) => filter,
                    (Some(a), Some(b)) => Some(Filter::And(vec![a, b])),
                };
            result.errors.extend(step.errors);
        }

        result
    }
}
