use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Logical comparison operators accepted on filter leaves. The GraphQL
/// surface spells these with a leading underscore (`_eq`, `_in`, ...).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FilterOp {
    Eq,
    Neq,
    Gt,
    Lt,
    Gte,
    Lte,
    In,
    Contains,
    StartsWith,
    EndsWith,
    Between,
}

impl FilterOp {
    pub fn parse(name: &str) -> Option<Self> {
        let op = match name {
            "_eq" => Self::Eq,
            "_neq" => Self::Neq,
            "_gt" => Self::Gt,
            "_lt" => Self::Lt,
            "_gte" => Self::Gte,
            "_lte" => Self::Lte,
            "_in" => Self::In,
            "_contains" => Self::Contains,
            "_starts_with" => Self::StartsWith,
            "_ends_with" => Self::EndsWith,
            "_between" => Self::Between,
            _ => return None,
        };
        Some(op)
    }

    pub fn graphql_name(&self) -> &'static str {
        match self {
            Self::Eq => "_eq",
            Self::Neq => "_neq",
            Self::Gt => "_gt",
            Self::Lt => "_lt",
            Self::Gte => "_gte",
            Self::Lte => "_lte",
            Self::In => "_in",
            Self::Contains => "_contains",
            Self::StartsWith => "_starts_with",
            Self::EndsWith => "_ends_with",
            Self::Between => "_between",
        }
    }
}

/// The value node hanging off a filter leaf: an operator and a literal.
/// A null value with `Eq` compiles to `IS NULL`, with `Neq` to `IS NOT NULL`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterValue {
    pub op: FilterOp,
    pub value: Value,
}

/// A single column comparison. `table_name` is always the table at the
/// current query scope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnFilter {
    pub table_name: String,
    pub column_name: String,
    pub next: FilterValue,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Filter {
    Column(ColumnFilter),
    And(Vec<Filter>),
    Or(Vec<Filter>),
}

impl Filter {
    pub fn column(
        table_name: impl Into<String>,
        column_name: impl Into<String>,
        op: FilterOp,
        value: Value,
    ) -> Self {
        Filter::Column(ColumnFilter {
            table_name: table_name.into(),
            column_name: column_name.into(),
            next: FilterValue { op, value },
        })
    }

    /// Combines a query's existing filter with transformer output: no
    /// filters yields `None`, a single filter passes through untouched, and
    /// anything more becomes one `And` node with the existing filter first
    /// and the transformer filters after it in the order given.
    pub fn combine(existing: Option<Filter>, additional: Vec<Filter>) -> Option<Filter> {
        let mut all = Vec::with_capacity(additional.len() + 1);
        if let Some(filter) = existing {
            all.push(filter);
        }
        all.extend(additional);
        match all.len() {
            0 => None,
            1 => all.pop(),
            _ => Some(Filter::And(all)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parse_round_trips_every_operator() {
        for name in [
            "_eq",
            "_neq",
            "_gt",
            "_lt",
            "_gte",
            "_lte",
            "_in",
            "_contains",
            "_starts_with",
            "_ends_with",
            "_between",
        ] {
            let op = FilterOp::parse(name).unwrap();
            assert_eq!(op.graphql_name(), name);
        }
        assert!(FilterOp::parse("_like").is_none());
    }

    #[test]
    fn combine_with_nothing_is_none() {
        assert_eq!(Filter::combine(None, vec![]), None);
    }

    #[test]
    fn combine_single_filter_passes_through() {
        let only = Filter::column("Orders", "tenant_id", FilterOp::Eq, json!(42));
        assert_eq!(Filter::combine(None, vec![only.clone()]), Some(only));

        let existing = Filter::column("Orders", "Total", FilterOp::Gt, json!(10));
        assert_eq!(
            Filter::combine(Some(existing.clone()), vec![]),
            Some(existing)
        );
    }

    #[test]
    fn combine_orders_existing_first_then_transformers() {
        let existing = Filter::column("Orders", "Total", FilterOp::Gt, json!(10));
        let tenant = Filter::column("Orders", "tenant_id", FilterOp::Eq, json!(42));
        let deleted = Filter::column("Orders", "deleted_at", FilterOp::Eq, Value::Null);

        let combined =
            Filter::combine(Some(existing.clone()), vec![tenant.clone(), deleted.clone()]);
        assert_eq!(combined, Some(Filter::And(vec![existing, tenant, deleted])));
    }
}
