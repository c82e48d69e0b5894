use thiserror::Error;

/// Core error taxonomy. Variants carry the offending identifier so callers
/// can correct their input.
#[derive(Debug, Error)]
pub enum BifrostError {
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("schema load failed: {0}")]
    SchemaLoad(String),
    #[error("tenant key '{key}' is missing from the user context")]
    TenantMissing { key: String },
    #[error("tenant key '{key}' is null in the user context")]
    TenantNull { key: String },
    #[error("claim '{claim}' is missing from the user context")]
    ClaimMissing { claim: String },
    #[error("claim '{claim}' is null in the user context")]
    ClaimNull { claim: String },
    #[error("claim '{claim}' is an empty list")]
    ClaimEmpty { claim: String },
    #[error("invalid auto-filter mapping '{mapping}' on table {table}")]
    InvalidFormat { mapping: String, table: String },
    #[error("column {column} not found in table {table}")]
    ColumnNotFound { column: String, table: String },
    #[error("table {table} not found in model")]
    TableNotFound { table: String },
    #[error("execution failed: {0}")]
    Execution(String),
}

pub type BifrostResult<T> = Result<T, BifrostError>;

impl From<sqlx::Error> for BifrostError {
    fn from(err: sqlx::Error) -> Self {
        BifrostError::Execution(err.to_string())
    }
}

/// The single error kind surfaced across the host boundary. The GraphQL
/// layer converts this into the wire-level error envelope.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct BifrostExecutionError {
    pub message: String,
}

impl BifrostExecutionError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl From<BifrostError> for BifrostExecutionError {
    fn from(err: BifrostError) -> Self {
        Self {
            message: err.to_string(),
        }
    }
}
