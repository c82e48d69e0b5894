//! Emits dialect-correct parameterized SQL from the query IR. Every
//! user-supplied value goes through the parameter collection; SQL text only
//! ever contains identifiers, operators and parameter references.

use std::collections::BTreeMap;

use serde_json::Value;
use tracing::debug;

use crate::dialect::{Dialect, LikeKind, UNLIMITED};
use crate::error::{BifrostError, BifrostResult};
use crate::model::{Link, Model, Table};
use crate::query::filter::{Filter, FilterOp};
use crate::query::ir::{ObjectQuery, QueryType};
use crate::query::params::SqlParameters;
use crate::transform::mutation::DataMap;

#[derive(Debug, Clone, Copy)]
pub struct Translator {
    dialect: Dialect,
}

impl Translator {
    pub fn new(dialect: Dialect) -> Self {
        Self { dialect }
    }

    pub fn dialect(&self) -> Dialect {
        self.dialect
    }

    /// SELECT for one IR node: qualified columns in selection order, WHERE
    /// from the filter tree, ORDER BY plus dialect pagination.
    pub fn select_sql(
        &self,
        query: &ObjectQuery,
        model: &Model,
        params: &mut SqlParameters,
    ) -> BifrostResult<String> {
        self.select_with_extra(query, model, params, None)
    }

    /// `SELECT COUNT(*)` over the same WHERE clause.
    pub fn aggregate_sql(
        &self,
        query: &ObjectQuery,
        model: &Model,
        params: &mut SqlParameters,
    ) -> BifrostResult<String> {
        let table = self.table_for(query, model)?;
        let table_ref = self
            .dialect
            .table_reference(&table.schema_name, &table.db_name);
        let where_clause = self.where_clause(query.filter.as_ref(), params)?;
        Ok(format!(
            "SELECT COUNT(*) AS {} FROM {table_ref}{where_clause}",
            self.dialect.escape_identifier("count")
        ))
    }

    /// Bulk-loader query for a nested link: the child SELECT filtered by
    /// `child.fk IN (materialized parent key values)`, every key
    /// parameterized.
    pub fn join_sql(
        &self,
        child: &ObjectQuery,
        link: &Link,
        parent_keys: &[Value],
        model: &Model,
        params: &mut SqlParameters,
    ) -> BifrostResult<String> {
        let mut query = child.clone();
        query.filter = Filter::combine(
            query.filter.take(),
            vec![Filter::column(
                &link.child_table,
                &link.child_column,
                FilterOp::In,
                Value::Array(parent_keys.to_vec()),
            )],
        );
        self.select_with_extra(&query, model, params, None)
    }

    /// INSERT over the data map's columns. The generated identity is read
    /// back separately with [`Translator::select_identity_sql`].
    pub fn insert_sql(
        &self,
        table: &Table,
        data: &DataMap,
        params: &mut SqlParameters,
    ) -> BifrostResult<String> {
        let table_ref = self
            .dialect
            .table_reference(&table.schema_name, &table.db_name);

        let mut columns = Vec::with_capacity(data.len());
        let mut values = Vec::with_capacity(data.len());
        for (name, value) in data {
            let column = table
                .column(name)
                .ok_or_else(|| BifrostError::ColumnNotFound {
                    column: name.clone(),
                    table: table.db_name.clone(),
                })?;
            columns.push(self.dialect.escape_identifier(&column.db_name));
            values.push(params.add(value.clone()));
        }

        Ok(format!(
            "INSERT INTO {table_ref} ({}) VALUES ({})",
            columns.join(", "),
            values.join(", ")
        ))
    }

    pub fn select_identity_sql(&self) -> String {
        format!("SELECT {}", self.dialect.last_inserted_identity())
    }

    /// UPDATE setting the data map's non-key columns, scoped by `filter`.
    pub fn update_sql(
        &self,
        table: &Table,
        data: &DataMap,
        filter: &Filter,
        params: &mut SqlParameters,
    ) -> BifrostResult<String> {
        let table_ref = self
            .dialect
            .table_reference(&table.schema_name, &table.db_name);

        let mut assignments = Vec::new();
        for (name, value) in data {
            let column = table
                .column(name)
                .ok_or_else(|| BifrostError::ColumnNotFound {
                    column: name.clone(),
                    table: table.db_name.clone(),
                })?;
            if column.is_primary_key {
                continue;
            }
            assignments.push(format!(
                "{} = {}",
                self.dialect.escape_identifier(&column.db_name),
                params.add(value.clone())
            ));
        }
        if assignments.is_empty() {
            return Err(BifrostError::Execution(format!(
                "update on {} has no columns to set",
                table.db_name
            )));
        }

        let where_sql = self.filter_sql(filter, params)?;
        Ok(format!(
            "UPDATE {table_ref} SET {} WHERE {where_sql}",
            assignments.join(", ")
        ))
    }

    /// DELETE scoped by `filter`. An unscoped delete is refused.
    pub fn delete_sql(
        &self,
        table: &Table,
        filter: &Filter,
        params: &mut SqlParameters,
    ) -> BifrostResult<String> {
        let table_ref = self
            .dialect
            .table_reference(&table.schema_name, &table.db_name);
        let where_sql = self.filter_sql(filter, params)?;
        Ok(format!("DELETE FROM {table_ref} WHERE {where_sql}"))
    }

    fn table_for<'a>(&self, query: &ObjectQuery, model: &'a Model) -> BifrostResult<&'a Table> {
        model.require_table(&format!("{}.{}", query.schema_name, query.table_name))
    }

    fn select_with_extra(
        &self,
        query: &ObjectQuery,
        model: &Model,
        params: &mut SqlParameters,
        extra_clause: Option<String>,
    ) -> BifrostResult<String> {
        let table = self.table_for(query, model)?;
        let table_ref = self
            .dialect
            .table_reference(&table.schema_name, &table.db_name);

        let selected: Vec<String> = if query.columns.is_empty() {
            table
                .columns()
                .map(|c| format!("{table_ref}.{}", self.dialect.escape_identifier(&c.db_name)))
                .collect()
        } else {
            query
                .columns
                .iter()
                .map(|name| {
                    let column =
                        table
                            .column(name)
                            .ok_or_else(|| BifrostError::ColumnNotFound {
                                column: name.clone(),
                                table: table.db_name.clone(),
                            })?;
                    Ok(format!(
                        "{table_ref}.{}",
                        self.dialect.escape_identifier(&column.db_name)
                    ))
                })
                .collect::<BifrostResult<_>>()?
        };

        let mut clauses = Vec::new();
        if let Some(filter) = &query.filter {
            clauses.push(self.filter_sql(filter, params)?);
        }
        if let Some(extra) = extra_clause {
            clauses.push(extra);
        }
        let where_clause = if clauses.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", clauses.join(" AND "))
        };

        let paging = self.order_and_page(query, table, &table_ref)?;
        let sql = format!(
            "SELECT {} FROM {table_ref}{where_clause}{}{}",
            selected.join(", "),
            if paging.is_empty() { "" } else { " " },
            paging
        );
        debug!(%sql, "translated query");
        Ok(sql)
    }

    fn where_clause(
        &self,
        filter: Option<&Filter>,
        params: &mut SqlParameters,
    ) -> BifrostResult<String> {
        match filter {
            Some(filter) => Ok(format!(" WHERE {}", self.filter_sql(filter, params)?)),
            None => Ok(String::new()),
        }
    }

    fn filter_sql(&self, filter: &Filter, params: &mut SqlParameters) -> BifrostResult<String> {
        match filter {
            Filter::And(children) => self.group_sql(children, "AND", params),
            Filter::Or(children) => self.group_sql(children, "OR", params),
            Filter::Column(leaf) => {
                let column_ref = format!(
                    "{}.{}",
                    self.dialect.escape_identifier(&leaf.table_name),
                    self.dialect.escape_identifier(&leaf.column_name)
                );
                let op = leaf.next.op;
                let value = &leaf.next.value;

                match op {
                    FilterOp::Eq if value.is_null() => Ok(format!("{column_ref} IS NULL")),
                    FilterOp::Neq if value.is_null() => Ok(format!("{column_ref} IS NOT NULL")),
                    FilterOp::In => {
                        let Value::Array(items) = value else {
                            return Err(BifrostError::Execution(format!(
                                "_in on {} expects a list value",
                                leaf.column_name
                            )));
                        };
                        if items.is_empty() {
                            // IN over the empty set matches nothing.
                            return Ok("1 = 0".to_string());
                        }
                        let refs: Vec<String> =
                            items.iter().map(|item| params.add(item.clone())).collect();
                        Ok(format!("{column_ref} IN ({})", refs.join(", ")))
                    }
                    FilterOp::Between => {
                        let bounds = value.as_array().filter(|a| a.len() == 2).ok_or_else(|| {
                            BifrostError::Execution(format!(
                                "_between on {} expects [low, high]",
                                leaf.column_name
                            ))
                        })?;
                        let low = params.add(bounds[0].clone());
                        let high = params.add(bounds[1].clone());
                        Ok(format!("{column_ref} BETWEEN {low} AND {high}"))
                    }
                    FilterOp::Contains | FilterOp::StartsWith | FilterOp::EndsWith => {
                        let kind = match op {
                            FilterOp::Contains => LikeKind::Contains,
                            FilterOp::StartsWith => LikeKind::StartsWith,
                            _ => LikeKind::EndsWith,
                        };
                        let param_ref = params.add(value.clone());
                        Ok(format!(
                            "{column_ref} {} {}",
                            self.dialect.operator(op),
                            self.dialect.like_pattern(&param_ref, kind)
                        ))
                    }
                    _ => {
                        let param_ref = params.add(value.clone());
                        Ok(format!(
                            "{column_ref} {} {param_ref}",
                            self.dialect.operator(op)
                        ))
                    }
                }
            }
        }
    }

    fn group_sql(
        &self,
        children: &[Filter],
        joiner: &str,
        params: &mut SqlParameters,
    ) -> BifrostResult<String> {
        if children.is_empty() {
            return Ok("1 = 1".to_string());
        }
        let parts: Vec<String> = children
            .iter()
            .map(|child| self.filter_sql(child, params))
            .collect::<BifrostResult<_>>()?;
        Ok(format!("({})", parts.join(&format!(" {joiner} "))))
    }

    /// `ORDER BY` + paging. Sorts come from the IR; a paginated query with
    /// no sort keys falls back to the primary key so row order is
    /// deterministic. Aggregate nodes page nothing.
    fn order_and_page(
        &self,
        query: &ObjectQuery,
        table: &Table,
        table_ref: &str,
    ) -> BifrostResult<String> {
        if query.query_type == QueryType::Aggregate {
            return Ok(String::new());
        }

        let mut sorts = Vec::new();
        for key in &query.sort {
            let column =
                table
                    .column(&key.column)
                    .ok_or_else(|| BifrostError::ColumnNotFound {
                        column: key.column.clone(),
                        table: table.db_name.clone(),
                    })?;
            sorts.push(format!(
                "{table_ref}.{} {}",
                self.dialect.escape_identifier(&column.db_name),
                key.direction.sql()
            ));
        }
        if sorts.is_empty() && query.limit != Some(UNLIMITED) {
            sorts = table
                .primary_keys()
                .iter()
                .map(|pk| {
                    format!(
                        "{table_ref}.{} ASC",
                        self.dialect.escape_identifier(&pk.db_name)
                    )
                })
                .collect();
        }

        Ok(self.dialect.pagination(&sorts, query.offset, query.limit))
    }
}

/// Produces the per-table parameterized SQL for a query tree: the root
/// statement keyed by its table name, and one statement per nested join
/// keyed by the child's GraphQL path, filtered through an
/// `IN (SELECT parent key ...)` subselect so no parent rows are needed up
/// front.
pub fn add_sql_parameterized(
    query: &ObjectQuery,
    model: &Model,
    dialect: Dialect,
    sql_map: &mut BTreeMap<String, String>,
    params: &mut SqlParameters,
) -> BifrostResult<()> {
    let translator = Translator::new(dialect);
    let sql = translator.select_sql(query, model, params)?;
    sql_map.insert(query.table_name.clone(), sql);
    add_join_sql(query, model, &translator, sql_map, params)
}

fn add_join_sql(
    parent: &ObjectQuery,
    model: &Model,
    translator: &Translator,
    sql_map: &mut BTreeMap<String, String>,
    params: &mut SqlParameters,
) -> BifrostResult<()> {
    let dialect = translator.dialect();
    let parent_table = model.require_table(&format!("{}.{}", parent.schema_name, parent.table_name))?;

    for join in &parent.joins {
        let link = link_for(parent_table, &join.link_name).ok_or_else(|| {
            BifrostError::Execution(format!(
                "link {} not found on table {}",
                join.link_name, parent.table_name
            ))
        })?;

        // A multi-link join targets the link's child table (filter its FK by
        // our key); a single-link join targets the parent (filter its key by
        // our FK values).
        let (outer_column, inner_column) = if join.query.table_name == link.child_table {
            (link.child_column.clone(), link.parent_column.clone())
        } else {
            (link.parent_column.clone(), link.child_column.clone())
        };

        let mut key_query = parent.clone();
        key_query.columns = vec![inner_column.clone()];
        key_query.joins.clear();
        let inner = translator.select_sql(&key_query, model, params)?;

        // MySQL rejects LIMIT inside IN subqueries; a derived table works.
        let subselect = if dialect == Dialect::MySql {
            format!(
                "SELECT {key} FROM ({inner}) AS {alias}",
                key = dialect.escape_identifier(&inner_column),
                alias = dialect.escape_identifier("parent_keys")
            )
        } else {
            inner
        };

        let extra = format!(
            "{}.{} IN ({subselect})",
            dialect.escape_identifier(&join.query.table_name),
            dialect.escape_identifier(&outer_column)
        );
        let child_sql =
            translator.select_with_extra(&join.query, model, params, Some(extra))?;
        sql_map.insert(join.query.graphql_path.clone(), child_sql);

        add_join_sql(&join.query, model, translator, sql_map, params)?;
    }
    Ok(())
}

/// Resolves a join label against the table's multi links first, then its
/// single links.
fn link_for<'a>(table: &'a Table, name: &str) -> Option<&'a Link> {
    table
        .multi_links
        .get(name)
        .or_else(|| table.single_links.get(name))
}
