use serde_json::Value;

use crate::dialect::Dialect;

/// One tracked SQL parameter. Names are auto-generated (`p1`, `p2`, ...)
/// and referenced in SQL text with the dialect's prefix.
#[derive(Debug, Clone, PartialEq)]
pub struct SqlParameter {
    pub name: String,
    pub value: Value,
}

/// Request-scoped parameter collection. Every user-supplied value that
/// reaches SQL goes through here; literals are never inlined.
#[derive(Debug, Clone)]
pub struct SqlParameters {
    dialect: Dialect,
    params: Vec<SqlParameter>,
}

impl SqlParameters {
    pub fn new(dialect: Dialect) -> Self {
        Self {
            dialect,
            params: Vec::new(),
        }
    }

    pub fn dialect(&self) -> Dialect {
        self.dialect
    }

    /// Tracks a value and returns its dialect-prefixed reference, e.g.
    /// `@p1` on SQL Server or `$p1` on PostgreSQL.
    pub fn add(&mut self, value: Value) -> String {
        let name = format!("p{}", self.params.len() + 1);
        let reference = format!("{}{}", self.dialect.parameter_prefix(), name);
        self.params.push(SqlParameter { name, value });
        reference
    }

    pub fn len(&self) -> usize {
        self.params.len()
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &SqlParameter> {
        self.params.iter()
    }

    /// Parameter values in declaration order, ready for driver binding.
    pub fn values(&self) -> Vec<Value> {
        self.params.iter().map(|p| p.value.clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn names_are_sequential_and_prefixed() {
        let mut params = SqlParameters::new(Dialect::SqlServer);
        assert_eq!(params.add(json!(42)), "@p1");
        assert_eq!(params.add(json!("x")), "@p2");
        assert_eq!(params.len(), 2);
        assert_eq!(params.values(), vec![json!(42), json!("x")]);
    }

    #[test]
    fn postgres_uses_dollar_prefix() {
        let mut params = SqlParameters::new(Dialect::Postgres);
        assert_eq!(params.add(json!(1)), "$p1");
    }
}
