//! Mutation dispatch: nested payloads go through the tree sync engine, each
//! resulting operation through the mutation-transformer chain, and the whole
//! list runs inside one transaction. Freshly generated parent identities are
//! filled into child foreign keys as the list executes; any error (or a
//! dropped request) rolls the transaction back.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_graphql::Value as GqlValue;
use async_graphql::dynamic::{FieldFuture, ResolverContext};
use serde_json::Value;
use tracing::debug;

use crate::context::UserContext;
use crate::db::{SqlExecutor, SqlTransaction};
use crate::dialect::UNLIMITED;
use crate::error::{BifrostError, BifrostResult};
use crate::graphql::resolvers::gql_err;
use crate::model::{Model, Table};
use crate::query::filter::{Filter, FilterOp};
use crate::query::ir::{ObjectQuery, QueryType};
use crate::query::params::SqlParameters;
use crate::query::translator::Translator;
use crate::sync::{OperationType, TreeSync, TreeSyncOperation};
use crate::transform::mutation::{DataMap, MutationPipeline, MutationType};

pub(crate) fn insert_resolver(table_key: String, ctx: ResolverContext<'_>) -> FieldFuture<'_> {
    FieldFuture::new(async move {
        let model = ctx.data::<Arc<Model>>()?;
        let table = model.require_table(&table_key).map_err(gql_err)?;
        let submitted = input_map(&ctx)?;

        let tree_sync = ctx.data::<TreeSync>()?;
        let ops = tree_sync
            .compute_operations(model, table, &submitted, None)
            .map_err(gql_err)?;
        let (_, root_key) = execute_ops(&ctx, ops).await.map_err(gql_err)?;

        match root_key {
            Some(key) => reselect_node(&ctx, table, &key).await,
            None => Ok(None),
        }
    })
}

pub(crate) fn update_resolver(table_key: String, ctx: ResolverContext<'_>) -> FieldFuture<'_> {
    FieldFuture::new(async move {
        let model = ctx.data::<Arc<Model>>()?;
        let translator = ctx.data::<Translator>()?;
        let executor = ctx.data::<Arc<dyn SqlExecutor>>()?;
        let table = model.require_table(&table_key).map_err(gql_err)?;
        let submitted = input_map(&ctx)?;

        let root_filter = root_key_filter(table, &submitted).map_err(gql_err)?;
        let mut existing = {
            let mut query = ObjectQuery::new(table, QueryType::Single);
            query.limit = Some(1);
            query.filter = Some(root_filter.clone());
            let mut params = SqlParameters::new(translator.dialect());
            let sql = translator
                .select_sql(&query, model, &mut params)
                .map_err(gql_err)?;
            executor
                .fetch_all(&sql, &params.values())
                .await
                .map_err(gql_err)?
                .into_iter()
                .next()
        };

        let tree_sync = ctx.data::<TreeSync>()?;
        if let Some(existing) = existing.as_mut() {
            attach_children(
                model,
                translator,
                executor,
                table,
                existing,
                0,
                tree_sync.max_depth(),
            )
            .await
            .map_err(gql_err)?;
        }

        let ops = tree_sync
            .compute_operations(model, table, &submitted, existing.as_ref())
            .map_err(gql_err)?;
        debug!(ops = ops.len(), table = %table.db_name, "tree sync computed");
        let (_, root_key) = execute_ops(&ctx, ops).await.map_err(gql_err)?;

        match root_key {
            Some(key) => reselect_node(&ctx, table, &key).await,
            None => Ok(None),
        }
    })
}

pub(crate) fn delete_resolver(table_key: String, ctx: ResolverContext<'_>) -> FieldFuture<'_> {
    FieldFuture::new(async move {
        let model = ctx.data::<Arc<Model>>()?;
        let translator = ctx.data::<Translator>()?;
        let executor = ctx.data::<Arc<dyn SqlExecutor>>()?;
        let pipeline = ctx.data::<Arc<MutationPipeline>>()?;
        let user_ctx = ctx.data_opt::<UserContext>().cloned().unwrap_or_default();

        let table = model.require_table(&table_key).map_err(gql_err)?;
        let mut data = DataMap::new();
        for pk in table.primary_keys() {
            let value: Value = ctx.args.try_get(&pk.graphql_name)?.deserialize()?;
            data.insert(pk.db_name.clone(), value);
        }

        let result = pipeline.transform(model, table, MutationType::Delete, &data, &user_ctx);
        if !result.errors.is_empty() {
            return Err(gql_err(BifrostError::Execution(result.errors.join("; "))));
        }

        let filter = Filter::combine(
            Some(pk_filter(table, &result.data).map_err(gql_err)?),
            result.additional_filter.into_iter().collect(),
        )
        .expect("primary key filter is always present");

        let mut params = SqlParameters::new(translator.dialect());
        let sql = match result.mutation_type {
            MutationType::Update => translator
                .update_sql(table, &result.data, &filter, &mut params)
                .map_err(gql_err)?,
            _ => translator
                .delete_sql(table, &filter, &mut params)
                .map_err(gql_err)?,
        };

        let mut tx = executor.begin().await.map_err(gql_err)?;
        let affected = match tx.execute(&sql, &params.values()).await {
            Ok(affected) => affected,
            Err(err) => {
                let _ = tx.rollback().await;
                return Err(gql_err(err));
            }
        };
        tx.commit().await.map_err(gql_err)?;

        Ok(Some(GqlValue::from_json(Value::from(affected))?))
    })
}

fn input_map(ctx: &ResolverContext<'_>) -> async_graphql::Result<DataMap> {
    let value: Value = ctx.args.try_get("value")?.deserialize()?;
    value
        .as_object()
        .cloned()
        .ok_or_else(|| gql_err(BifrostError::Execution("mutation input must be an object".into())))
}

/// Equality filter over every primary-key value present in the data map.
fn pk_filter(table: &Table, data: &DataMap) -> BifrostResult<Filter> {
    let pks = table.primary_keys();
    if pks.is_empty() {
        return Err(BifrostError::Execution(format!(
            "table {} has no primary key",
            table.db_name
        )));
    }
    let mut parts = Vec::new();
    for pk in pks {
        let value = data
            .get(&pk.db_name)
            .filter(|v| !v.is_null())
            .ok_or_else(|| {
                BifrostError::Execution(format!(
                    "primary key {} is required on table {}",
                    pk.db_name, table.db_name
                ))
            })?;
        parts.push(Filter::column(
            &table.db_name,
            &pk.db_name,
            FilterOp::Eq,
            value.clone(),
        ));
    }
    Ok(Filter::combine(None, parts).expect("at least one key part"))
}

/// Root update lookup; accepts the key under its database or GraphQL name.
fn root_key_filter(table: &Table, submitted: &DataMap) -> BifrostResult<Filter> {
    let mut data = DataMap::new();
    for pk in table.primary_keys() {
        let value = submitted
            .get(&pk.db_name)
            .or_else(|| submitted.get(&pk.graphql_name))
            .cloned()
            .unwrap_or(Value::Null);
        data.insert(pk.db_name.clone(), value);
    }
    pk_filter(table, &data)
}

fn single_pk_value(table: &Table, data: &DataMap) -> Option<Value> {
    let pks = table.primary_keys();
    if pks.len() == 1 {
        data.get(&pks[0].db_name).filter(|v| !v.is_null()).cloned()
    } else {
        None
    }
}

/// Runs the operation list in order inside one transaction. Returns the
/// total affected rows and the root row's key value (generated identity for
/// inserts, submitted key otherwise).
pub(crate) async fn execute_ops(
    ctx: &ResolverContext<'_>,
    ops: Vec<TreeSyncOperation>,
) -> BifrostResult<(u64, Option<Value>)> {
    let model = ctx
        .data::<Arc<Model>>()
        .map_err(|e| BifrostError::Execution(e.message))?;
    let translator = ctx
        .data::<Translator>()
        .map_err(|e| BifrostError::Execution(e.message))?;
    let executor = ctx
        .data::<Arc<dyn SqlExecutor>>()
        .map_err(|e| BifrostError::Execution(e.message))?;
    let pipeline = ctx
        .data::<Arc<MutationPipeline>>()
        .map_err(|e| BifrostError::Execution(e.message))?;
    let user_ctx = ctx.data_opt::<UserContext>().cloned().unwrap_or_default();

    // Transform every operation first so a batch surfaces all of its
    // failures at once, before anything touches the database.
    let mut staged = Vec::with_capacity(ops.len());
    let mut errors = Vec::new();
    for op in ops {
        let table = model.require_table(&format!("{}.{}", op.schema, op.table))?;
        let mutation_type = match op.op {
            OperationType::Insert => MutationType::Insert,
            OperationType::Update => MutationType::Update,
            OperationType::Delete => MutationType::Delete,
        };
        let result = pipeline.transform(model, table, mutation_type, &op.data, &user_ctx);
        errors.extend(result.errors.iter().cloned());
        staged.push((op, result));
    }
    if !errors.is_empty() {
        return Err(BifrostError::Execution(errors.join("; ")));
    }

    let mut tx = executor.begin().await?;
    match run_staged(model, translator, tx.as_mut(), staged).await {
        Ok(outcome) => {
            tx.commit().await?;
            Ok(outcome)
        }
        Err(err) => {
            let _ = tx.rollback().await;
            Err(err)
        }
    }
}

async fn run_staged(
    model: &Model,
    translator: &Translator,
    tx: &mut (dyn SqlTransaction + '_),
    staged: Vec<(TreeSyncOperation, crate::transform::MutationTransformResult)>,
) -> BifrostResult<(u64, Option<Value>)> {
    let mut affected = 0u64;
    let mut root_key: Option<Value> = None;
    // Latest key per table, for filling child FK assignments.
    let mut last_keys: HashMap<String, Value> = HashMap::new();

    for (op, result) in staged {
        let table = model.require_table(&format!("{}.{}", op.schema, op.table))?;
        match result.mutation_type {
            MutationType::Insert => {
                let mut data = result.data;
                for (fk_column, parent_table) in &op.foreign_key_assignments {
                    if data.get(fk_column).is_none_or(Value::is_null) {
                        let parent_key =
                            last_keys.get(parent_table).cloned().ok_or_else(|| {
                                BifrostError::Execution(format!(
                                    "no generated key available for parent table {parent_table}"
                                ))
                            })?;
                        data.insert(fk_column.clone(), parent_key);
                    }
                }

                let mut params = SqlParameters::new(translator.dialect());
                let sql = translator.insert_sql(table, &data, &mut params)?;
                affected += tx.execute(&sql, &params.values()).await?;

                let new_key = if table.identity().is_some() {
                    tx.fetch_scalar(&translator.select_identity_sql(), &[])
                        .await?
                        .unwrap_or(Value::Null)
                } else {
                    single_pk_value(table, &data).unwrap_or(Value::Null)
                };
                if !new_key.is_null() {
                    last_keys.insert(op.table.clone(), new_key.clone());
                    if op.depth == 0 && root_key.is_none() {
                        root_key = Some(new_key);
                    }
                }
            }
            MutationType::Update => {
                let filter = Filter::combine(
                    Some(pk_filter(table, &result.data)?),
                    result.additional_filter.into_iter().collect(),
                )
                .expect("primary key filter is always present");

                let mut params = SqlParameters::new(translator.dialect());
                let sql = translator.update_sql(table, &result.data, &filter, &mut params)?;
                affected += tx.execute(&sql, &params.values()).await?;

                if let Some(key) = single_pk_value(table, &result.data) {
                    last_keys.insert(op.table.clone(), key.clone());
                    if op.depth == 0 && root_key.is_none() {
                        root_key = Some(key);
                    }
                }
            }
            MutationType::Delete => {
                let filter = Filter::combine(
                    Some(pk_filter(table, &result.data)?),
                    result.additional_filter.into_iter().collect(),
                )
                .expect("primary key filter is always present");

                let mut params = SqlParameters::new(translator.dialect());
                let sql = translator.delete_sql(table, &filter, &mut params)?;
                affected += tx.execute(&sql, &params.values()).await?;
            }
        }
    }

    Ok((affected, root_key))
}

/// Loads the stored child collections under a row, down to the tree-sync
/// depth limit, so the sync engine can diff against them.
pub(crate) fn attach_children<'a>(
    model: &'a Model,
    translator: &'a Translator,
    executor: &'a Arc<dyn SqlExecutor>,
    table: &'a Table,
    row: &'a mut crate::db::Row,
    depth: usize,
    max_depth: usize,
) -> Pin<Box<dyn Future<Output = BifrostResult<()>> + Send + 'a>> {
    Box::pin(async move {
        if depth + 1 >= max_depth {
            return Ok(());
        }
        for (link_name, link) in &table.multi_links {
            let Some(parent_key) = row.get(&link.parent_column).filter(|v| !v.is_null()).cloned()
            else {
                continue;
            };
            let child_table =
                model.require_table(&format!("{}.{}", link.child_schema, link.child_table))?;

            let mut query = ObjectQuery::new(child_table, QueryType::Join);
            query.limit = Some(UNLIMITED);
            query.filter = Some(Filter::column(
                &child_table.db_name,
                &link.child_column,
                FilterOp::Eq,
                parent_key,
            ));
            let mut params = SqlParameters::new(translator.dialect());
            let sql = translator.select_sql(&query, model, &mut params)?;
            let mut children = executor.fetch_all(&sql, &params.values()).await?;

            for child in &mut children {
                attach_children(
                    model,
                    translator,
                    executor,
                    child_table,
                    child,
                    depth + 1,
                    max_depth,
                )
                .await?;
            }
            row.insert(
                link_name.clone(),
                Value::Array(children.into_iter().map(Value::Object).collect()),
            );
        }
        Ok(())
    })
}

/// Fetches the row back by key after a mutation so the client sees the
/// stored state, audit columns included.
async fn reselect_node(
    ctx: &ResolverContext<'_>,
    table: &Table,
    key: &Value,
) -> async_graphql::Result<Option<GqlValue>> {
    let model = ctx.data::<Arc<Model>>()?;
    let translator = ctx.data::<Translator>()?;
    let executor = ctx.data::<Arc<dyn SqlExecutor>>()?;

    let pks = table.primary_keys();
    let [pk] = pks.as_slice() else {
        return Ok(None);
    };

    let mut query = ObjectQuery::new(table, QueryType::Single);
    query.limit = Some(1);
    query.filter = Some(Filter::column(
        &table.db_name,
        &pk.db_name,
        FilterOp::Eq,
        key.clone(),
    ));
    let mut params = SqlParameters::new(translator.dialect());
    let sql = translator
        .select_sql(&query, model, &mut params)
        .map_err(gql_err)?;
    let row = executor
        .fetch_all(&sql, &params.values())
        .await
        .map_err(gql_err)?
        .into_iter()
        .next();

    match row {
        Some(row) => Ok(Some(GqlValue::from_json(Value::Object(row))?)),
        None => Ok(None),
    }
}
