use serde::{Deserialize, Serialize};

use crate::model::Table;
use crate::query::filter::Filter;

/// Classification of an [`ObjectQuery`] node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QueryType {
    Standard,
    Join,
    Single,
    Aggregate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SortDir {
    Asc,
    Desc,
}

impl SortDir {
    pub fn sql(&self) -> &'static str {
        match self {
            SortDir::Asc => "ASC",
            SortDir::Desc => "DESC",
        }
    }
}

/// One sort key, parsed from the `column_direction` surface form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SortKey {
    pub column: String,
    pub direction: SortDir,
}

impl SortKey {
    /// Parses `total_desc` / `total_asc`; a bare column name sorts ascending.
    pub fn parse(value: &str) -> Self {
        if let Some(column) = value.strip_suffix("_desc") {
            SortKey {
                column: column.to_string(),
                direction: SortDir::Desc,
            }
        } else if let Some(column) = value.strip_suffix("_asc") {
            SortKey {
                column: column.to_string(),
                direction: SortDir::Asc,
            }
        } else {
            SortKey {
                column: value.to_string(),
                direction: SortDir::Asc,
            }
        }
    }
}

/// A nested join: a child query labelled with the link that reaches it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JoinQuery {
    pub link_name: String,
    pub query: ObjectQuery,
}

/// One node of the relational query IR. Holds only names into the owning
/// model; resolution back to concrete tables goes through a `Model` lookup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectQuery {
    pub table_name: String,
    pub schema_name: String,
    pub graphql_path: String,
    pub query_type: QueryType,
    /// Database column names, in selection order.
    pub columns: Vec<String>,
    pub offset: Option<u64>,
    pub limit: Option<i64>,
    pub sort: Vec<SortKey>,
    pub filter: Option<Filter>,
    pub joins: Vec<JoinQuery>,
    /// The filter as it stood before any transformer ran. Re-applying the
    /// transformer chain recombines from here, which keeps the operation
    /// idempotent.
    base_filter: Option<Option<Filter>>,
}

impl ObjectQuery {
    pub fn new(table: &Table, query_type: QueryType) -> Self {
        Self {
            table_name: table.db_name.clone(),
            schema_name: table.schema_name.clone(),
            graphql_path: table.graphql_name.clone(),
            query_type,
            columns: table.columns().map(|c| c.db_name.clone()).collect(),
            offset: None,
            limit: None,
            sort: Vec::new(),
            filter: None,
            joins: Vec::new(),
            base_filter: None,
        }
    }

    /// The user filter the transformer chain starts from. Stashes the
    /// current filter the first time it is read.
    pub fn base_filter(&mut self) -> Option<Filter> {
        if self.base_filter.is_none() {
            self.base_filter = Some(self.filter.clone());
        }
        self.base_filter.clone().unwrap_or_default()
    }
}
