//! Read-side resolvers: build the query IR from arguments and the selection
//! set, run the transformer chain, translate, execute, and shape rows. Link
//! fields resolve through the bulk loader. Every failure crosses the
//! boundary as a [`BifrostExecutionError`] message.

use std::sync::Arc;

use async_graphql::dataloader::DataLoader;
use async_graphql::dynamic::{FieldFuture, ObjectAccessor, ResolverContext};
use async_graphql::{Name, Value as GqlValue};
use serde_json::Value;

use crate::context::{INCLUDE_DELETED_KEY, UserContext};
use crate::db::{ProcArg, SqlExecutor};
use crate::error::{BifrostError, BifrostExecutionError};
use crate::graphql::loader::{LinkKey, LinkLoader};
use crate::model::{Link, Model, StoredProc, Table};
use crate::query::filter::{Filter, FilterOp};
use crate::query::ir::{JoinQuery, ObjectQuery, QueryType, SortKey};
use crate::query::params::SqlParameters;
use crate::query::translator::Translator;
use crate::transform::QueryTransformerService;

pub(crate) fn gql_err(err: BifrostError) -> async_graphql::Error {
    BifrostExecutionError::from(err).into()
}

/// The request's user context plus any per-field `_includeDeleted` opt-out.
fn request_context(table: &Table, ctx: &ResolverContext<'_>) -> async_graphql::Result<UserContext> {
    let mut user_ctx = ctx
        .data_opt::<UserContext>()
        .cloned()
        .unwrap_or_default();
    if let Some(include) = ctx.args.get("_includeDeleted") {
        if include.boolean()? {
            user_ctx.set(
                format!(
                    "{INCLUDE_DELETED_KEY}:{}.{}",
                    table.schema_name, table.db_name
                ),
                true,
            );
        }
    }
    Ok(user_ctx)
}

fn push_unique(columns: &mut Vec<String>, name: &str) {
    if !columns.iter().any(|c| c == name) {
        columns.push(name.to_string());
    }
}

/// Builds the IR node for a list field: selected columns from the selection
/// set (plus the key and link columns the stitching needs), filter, sort,
/// pagination and any ad-hoc joins.
pub(crate) fn build_query(
    table: &Table,
    ctx: &ResolverContext<'_>,
    model: &Model,
) -> async_graphql::Result<ObjectQuery> {
    let mut query = ObjectQuery::new(table, QueryType::Standard);
    query.graphql_path = table.graphql_name.clone();

    let mut columns = Vec::new();
    for field in ctx.field().selection_set() {
        let name = field.name();
        if let Some(column) = table.column_by_graphql(name) {
            push_unique(&mut columns, &column.db_name);
        } else if let Some(link) = table.multi_links.get(name) {
            push_unique(&mut columns, &link.parent_column);
        } else if let Some(link) = table.single_links.get(name) {
            push_unique(&mut columns, &link.child_column);
        }
    }
    for pk in table.primary_keys() {
        push_unique(&mut columns, &pk.db_name);
    }
    if !columns.is_empty() {
        query.columns = columns;
    }

    if let Some(filter) = ctx.args.get("filter") {
        query.filter = parse_filter(table, &filter.object()?)?;
    }
    if let Some(sort) = ctx.args.get("sort") {
        for item in sort.list()?.iter() {
            let key = SortKey::parse(item.enum_name()?);
            let column = table
                .column_by_graphql(&key.column)
                .or_else(|| table.column(&key.column))
                .ok_or_else(|| {
                    gql_err(BifrostError::ColumnNotFound {
                        column: key.column.clone(),
                        table: table.db_name.clone(),
                    })
                })?;
            query.sort.push(SortKey {
                column: column.db_name.clone(),
                direction: key.direction,
            });
        }
    }
    if let Some(limit) = ctx.args.get("limit") {
        query.limit = Some(limit.i64()?);
    }
    if let Some(offset) = ctx.args.get("offset") {
        query.offset = Some(offset.u64()?);
    }
    if let Some(joins) = ctx.args.get("_join") {
        for item in joins.list()?.iter() {
            let link_name = item.enum_name()?;
            let link = table
                .multi_links
                .get(link_name)
                .or_else(|| table.single_links.get(link_name))
                .ok_or_else(|| {
                    gql_err(BifrostError::Execution(format!(
                        "link {link_name} not found on table {}",
                        table.db_name
                    )))
                })?;
            let target_key = if table.multi_links.contains_key(link_name) {
                format!("{}.{}", link.child_schema, link.child_table)
            } else {
                format!("{}.{}", link.parent_schema, link.parent_table)
            };
            let target = model.require_table(&target_key).map_err(gql_err)?;
            let mut child = ObjectQuery::new(target, QueryType::Join);
            child.graphql_path = format!("{}/{}", table.graphql_name, link_name);
            query.joins.push(JoinQuery {
                link_name: link_name.to_string(),
                query: child,
            });
        }
    }

    Ok(query)
}

/// Parses a table's filter input object into the filter tree. Sibling
/// conditions AND together; `_and` / `_or` nest explicitly.
pub(crate) fn parse_filter(
    table: &Table,
    object: &ObjectAccessor<'_>,
) -> async_graphql::Result<Option<Filter>> {
    let mut parts = Vec::new();

    for (name, value) in object.iter() {
        match name.as_str() {
            "_and" | "_or" => {
                let mut children = Vec::new();
                for item in value.list()?.iter() {
                    if let Some(child) = parse_filter(table, &item.object()?)? {
                        children.push(child);
                    }
                }
                if !children.is_empty() {
                    parts.push(if name.as_str() == "_and" {
                        Filter::And(children)
                    } else {
                        Filter::Or(children)
                    });
                }
            }
            field => {
                let column = table
                    .column_by_graphql(field)
                    .or_else(|| table.column(field))
                    .ok_or_else(|| {
                        gql_err(BifrostError::ColumnNotFound {
                            column: field.to_string(),
                            table: table.db_name.clone(),
                        })
                    })?;
                for (op_name, op_value) in value.object()?.iter() {
                    let op = FilterOp::parse(op_name.as_str()).ok_or_else(|| {
                        gql_err(BifrostError::Execution(format!(
                            "unknown filter operator {op_name}"
                        )))
                    })?;
                    let literal: Value = op_value.deserialize()?;
                    parts.push(Filter::column(
                        &table.db_name,
                        &column.db_name,
                        op,
                        literal,
                    ));
                }
            }
        }
    }

    Ok(Filter::combine(None, parts))
}

/// Resolver for `database.<table>`: list rows per the IR.
pub(crate) fn list_resolver(table_key: String, ctx: ResolverContext<'_>) -> FieldFuture<'_> {
    FieldFuture::new(async move {
        let model = ctx.data::<Arc<Model>>()?;
        let translator = ctx.data::<Translator>()?;
        let executor = ctx.data::<Arc<dyn SqlExecutor>>()?;
        let service = ctx.data::<Arc<QueryTransformerService>>()?;

        let table = model.require_table(&table_key).map_err(gql_err)?;
        let user_ctx = request_context(table, &ctx)?;

        let mut query = build_query(table, &ctx, model)?;
        service
            .apply_transformers(&mut query, model, &user_ctx)
            .map_err(gql_err)?;

        let mut params = SqlParameters::new(translator.dialect());
        let sql = translator
            .select_sql(&query, model, &mut params)
            .map_err(gql_err)?;
        let rows = executor
            .fetch_all(&sql, &params.values())
            .await
            .map_err(gql_err)?;

        let items = rows
            .into_iter()
            .map(|row| GqlValue::from_json(Value::Object(row)))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Some(GqlValue::List(items)))
    })
}

/// Resolver for `database.<table>_aggregate`.
pub(crate) fn aggregate_resolver(table_key: String, ctx: ResolverContext<'_>) -> FieldFuture<'_> {
    FieldFuture::new(async move {
        let model = ctx.data::<Arc<Model>>()?;
        let translator = ctx.data::<Translator>()?;
        let executor = ctx.data::<Arc<dyn SqlExecutor>>()?;
        let service = ctx.data::<Arc<QueryTransformerService>>()?;

        let table = model.require_table(&table_key).map_err(gql_err)?;
        let user_ctx = request_context(table, &ctx)?;

        let mut query = ObjectQuery::new(table, QueryType::Aggregate);
        query.graphql_path = format!("{}_aggregate", table.graphql_name);
        if let Some(filter) = ctx.args.get("filter") {
            query.filter = parse_filter(table, &filter.object()?)?;
        }
        service
            .apply_transformers(&mut query, model, &user_ctx)
            .map_err(gql_err)?;

        let mut params = SqlParameters::new(translator.dialect());
        let sql = translator
            .aggregate_sql(&query, model, &mut params)
            .map_err(gql_err)?;
        let count = executor
            .fetch_scalar(&sql, &params.values())
            .await
            .map_err(gql_err)?
            .unwrap_or(Value::from(0));

        Ok(Some(GqlValue::from_json(
            serde_json::json!({ "count": count }),
        )?))
    })
}

/// Resolver for a scalar column: reads the already-fetched parent row.
pub(crate) fn column_resolver(db_name: String, ctx: ResolverContext<'_>) -> FieldFuture<'_> {
    FieldFuture::new(async move {
        let value = parent_field(&ctx, &db_name).unwrap_or(GqlValue::Null);
        Ok(Some(value))
    })
}

/// Resolver for a single link (FK-holder side): loads the referenced parent
/// row through the bulk loader.
pub(crate) fn single_link_resolver(link: Link, ctx: ResolverContext<'_>) -> FieldFuture<'_> {
    FieldFuture::new(async move {
        let model = ctx.data::<Arc<Model>>()?;
        let loader = ctx.data::<DataLoader<LinkLoader>>()?;
        let service = ctx.data::<Arc<QueryTransformerService>>()?;
        let user_ctx = ctx.data_opt::<UserContext>().cloned().unwrap_or_default();

        let Some(fk_value) = parent_field(&ctx, &link.child_column) else {
            return Ok(None);
        };
        if fk_value == GqlValue::Null {
            return Ok(None);
        }
        let fk_json = fk_value.into_json()?;

        let target = model
            .require_table(&format!("{}.{}", link.parent_schema, link.parent_table))
            .map_err(gql_err)?;
        let filter = service
            .combined_filter(model, target, &user_ctx)
            .map_err(gql_err)?;

        let key = LinkKey::new(
            &target.schema_name,
            &target.db_name,
            &link.parent_column,
            &fk_json,
            filter.as_ref(),
        );
        let rows = loader
            .load_one(key)
            .await
            .map_err(|e| gql_err(BifrostError::Execution(e.to_string())))?;
        match rows.and_then(|rows| rows.first().cloned()) {
            Some(row) => Ok(Some(GqlValue::from_json(Value::Object(row))?)),
            None => Ok(None),
        }
    })
}

/// Resolver for a multi link (referenced side): loads the child collection
/// through the bulk loader.
pub(crate) fn multi_link_resolver(link: Link, ctx: ResolverContext<'_>) -> FieldFuture<'_> {
    FieldFuture::new(async move {
        let model = ctx.data::<Arc<Model>>()?;
        let loader = ctx.data::<DataLoader<LinkLoader>>()?;
        let service = ctx.data::<Arc<QueryTransformerService>>()?;
        let user_ctx = ctx.data_opt::<UserContext>().cloned().unwrap_or_default();

        let Some(key_value) = parent_field(&ctx, &link.parent_column) else {
            return Ok(Some(GqlValue::List(Vec::new())));
        };
        if key_value == GqlValue::Null {
            return Ok(Some(GqlValue::List(Vec::new())));
        }
        let key_json = key_value.into_json()?;

        let child = model
            .require_table(&format!("{}.{}", link.child_schema, link.child_table))
            .map_err(gql_err)?;
        let filter = service
            .combined_filter(model, child, &user_ctx)
            .map_err(gql_err)?;

        let key = LinkKey::new(
            &child.schema_name,
            &child.db_name,
            &link.child_column,
            &key_json,
            filter.as_ref(),
        );
        let rows = loader
            .load_one(key)
            .await
            .map_err(|e| gql_err(BifrostError::Execution(e.to_string())))?
            .unwrap_or_default();
        let items = rows
            .iter()
            .cloned()
            .map(|row| GqlValue::from_json(Value::Object(row)))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Some(GqlValue::List(items)))
    })
}

/// Resolver for a stored-procedure field; execution is delegated to the
/// driver adapter.
pub(crate) fn proc_resolver(proc_index: usize, ctx: ResolverContext<'_>) -> FieldFuture<'_> {
    FieldFuture::new(async move {
        let model = ctx.data::<Arc<Model>>()?;
        let translator = ctx.data::<Translator>()?;
        let executor = ctx.data::<Arc<dyn SqlExecutor>>()?;

        let proc: &StoredProc = model
            .procs()
            .nth(proc_index)
            .ok_or_else(|| gql_err(BifrostError::Execution("unknown stored procedure".into())))?;

        let input = ctx.args.get("input");
        let input = match &input {
            Some(accessor) => Some(accessor.object()?),
            None => None,
        };

        let mut args = Vec::new();
        for param in &proc.params {
            if !param.direction.accepts_input() {
                args.push(ProcArg {
                    name: param.db_name.clone(),
                    value: Value::Null,
                    direction: param.direction,
                });
                continue;
            }
            let value = input
                .as_ref()
                .and_then(|obj| obj.get(&param.graphql_name))
                .map(|v| v.deserialize::<Value>())
                .transpose()?
                .unwrap_or(Value::Null);
            args.push(ProcArg {
                name: param.db_name.clone(),
                value,
                direction: param.direction,
            });
        }

        let result = executor
            .call_procedure(&proc.full_db_ref(translator.dialect()), &args)
            .await
            .map_err(gql_err)?;

        let mut shaped = serde_json::Map::new();
        shaped.insert(
            "resultSets".into(),
            Value::Array(
                result
                    .result_sets
                    .into_iter()
                    .map(|set| Value::Array(set.into_iter().map(Value::Object).collect()))
                    .collect(),
            ),
        );
        shaped.insert("affectedRows".into(), Value::from(result.affected_rows));
        for param in &proc.params {
            if param.direction.produces_output() {
                let value = result
                    .output
                    .get(&param.db_name)
                    .cloned()
                    .unwrap_or(Value::Null);
                shaped.insert(param.graphql_name.clone(), value);
            }
        }

        Ok(Some(GqlValue::from_json(Value::Object(shaped))?))
    })
}

/// Reads a key out of the parent row object.
pub(crate) fn parent_field(ctx: &ResolverContext<'_>, name: &str) -> Option<GqlValue> {
    match ctx.parent_value.as_value() {
        Some(GqlValue::Object(map)) => map.get(&Name::new(name)).cloned(),
        _ => None,
    }
}
