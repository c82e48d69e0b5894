use std::time::Duration;

use async_graphql::dynamic::SchemaBuilder;
use serde::Deserialize;
use tracing::{debug, info};

use crate::db::DbExecutor;
use crate::dialect::Dialect;
use crate::error::{BifrostError, BifrostResult};
use crate::sync::DEFAULT_MAX_DEPTH;

/// Load configuration from a TOML file
pub fn load_config(config_path: &str) -> BifrostResult<BifrostConfig> {
    debug!("Loading config from: {}", config_path);

    if std::path::Path::new(config_path).exists() {
        info!("Config file found, loading from: {}", config_path);

        let config_content = std::fs::read_to_string(config_path).map_err(|e| {
            BifrostError::Config(format!("failed to read config file {config_path}: {e}"))
        })?;

        let config: BifrostConfig = toml::from_str(&config_content).map_err(|e| {
            BifrostError::Config(format!("failed to parse config file {config_path}: {e}"))
        })?;

        debug!("Config loaded successfully");
        return Ok(config);
    }

    Err(BifrostError::Config(format!(
        "config file {config_path} does not exist"
    )))
}

#[derive(Deserialize, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct BifrostConfig {
    pub server: ServerConfig,
    #[serde(default)]
    pub graphql: GraphQLConfig,
    pub database: DatabaseConfig,
    #[serde(default)]
    pub metadata: MetadataConfig,
    #[serde(default)]
    pub tree_sync: TreeSyncConfig,
}

impl BifrostConfig {
    pub fn from_path(path: &str) -> BifrostResult<Self> {
        load_config(path)
    }
}

#[derive(Deserialize, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Deserialize, Clone, Default)]
#[serde(rename_all = "kebab-case")]
pub struct GraphQLConfig {
    pub enable_playground: Option<bool>,
    pub limit_depth: Option<usize>,
    pub limit_complexity: Option<usize>,
    pub limit_recursive_depth: Option<usize>,
    pub limit_directives: Option<usize>,
    pub disable_suggestions: Option<bool>,
    pub disable_introspection: Option<bool>,
    pub introspection_only: Option<bool>,
}

impl GraphQLConfig {
    pub fn apply(&self, mut schema: SchemaBuilder) -> SchemaBuilder {
        if let Some(complexity) = self.limit_complexity {
            schema = schema.limit_complexity(complexity);
        }

        if let Some(depth) = self.limit_depth {
            schema = schema.limit_depth(depth);
        }

        if let Some(depth) = self.limit_recursive_depth {
            schema = schema.limit_recursive_depth(depth);
        }

        if let Some(directives) = self.limit_directives {
            schema = schema.limit_directives(directives);
        }

        if self.disable_suggestions.unwrap_or(false) {
            schema = schema.disable_suggestions();
        }

        if self.disable_introspection.unwrap_or(false) {
            schema = schema.disable_introspection();
        }

        if self.introspection_only.unwrap_or(false) {
            schema = schema.introspection_only();
        }

        schema
    }
}

#[derive(Deserialize, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct DatabaseConfig {
    pub dialect: Dialect,
    pub url: Option<String>,
    pub use_env: Option<bool>,
    pub max_connections: Option<u32>,
    /// Per-request SQL timeout, enforced at the driver boundary.
    pub sql_timeout_secs: Option<u64>,
}

impl DatabaseConfig {
    pub fn connection_url(&self) -> BifrostResult<String> {
        if let Some(url) = &self.url {
            return Ok(url.clone());
        }
        if self.use_env.unwrap_or(true) {
            if let Ok(url) = std::env::var("DATABASE_URL") {
                return Ok(url);
            }
        }
        Err(BifrostError::Config(
            "no database url configured (set database.url or DATABASE_URL)".into(),
        ))
    }

    pub async fn create_executor(&self) -> BifrostResult<DbExecutor> {
        let url = self.connection_url()?;
        DbExecutor::connect(
            self.dialect,
            &url,
            self.max_connections.unwrap_or(5),
            self.sql_timeout_secs.map(Duration::from_secs),
        )
        .await
    }
}

#[derive(Deserialize, Clone, Default)]
#[serde(rename_all = "kebab-case")]
pub struct MetadataConfig {
    /// Path to the TOML metadata sidecar file.
    pub path: Option<String>,
}

#[derive(Deserialize, Clone, Default)]
#[serde(rename_all = "kebab-case")]
pub struct TreeSyncConfig {
    pub max_depth: Option<usize>,
    pub delete_orphans: Option<bool>,
}

impl TreeSyncConfig {
    pub fn max_depth(&self) -> usize {
        self.max_depth.unwrap_or(DEFAULT_MAX_DEPTH)
    }

    pub fn delete_orphans(&self) -> bool {
        self.delete_orphans.unwrap_or(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_full_config() {
        let config: BifrostConfig = toml::from_str(
            r#"
[server]
host = "0.0.0.0"
port = 8000

[graphql]
enable-playground = true
limit-depth = 10

[database]
dialect = "sqlite"
url = "sqlite://local.db"
max-connections = 4
sql-timeout-secs = 30

[metadata]
path = "bifrost-metadata.toml"

[tree-sync]
max-depth = 5
delete-orphans = false
"#,
        )
        .unwrap();

        assert_eq!(config.server.port, 8000);
        assert_eq!(config.database.dialect, Dialect::Sqlite);
        assert_eq!(config.database.sql_timeout_secs, Some(30));
        assert_eq!(config.tree_sync.max_depth(), 5);
        assert!(!config.tree_sync.delete_orphans());
        assert_eq!(config.metadata.path.as_deref(), Some("bifrost-metadata.toml"));
    }

    #[test]
    fn dialect_accepts_the_mssql_alias() {
        let config: BifrostConfig = toml::from_str(
            r#"
[server]
host = "127.0.0.1"
port = 1
[database]
dialect = "mssql"
"#,
        )
        .unwrap();
        assert_eq!(config.database.dialect, Dialect::SqlServer);
    }

    #[test]
    fn missing_url_and_env_is_a_config_error() {
        let db = DatabaseConfig {
            dialect: Dialect::Sqlite,
            url: None,
            use_env: Some(false),
            max_connections: None,
            sql_timeout_secs: None,
        };
        assert!(matches!(db.connection_url(), Err(BifrostError::Config(_))));
    }

    #[test]
    fn defaults_for_optional_sections() {
        let config: BifrostConfig = toml::from_str(
            r#"
[server]
host = "127.0.0.1"
port = 8000
[database]
dialect = "postgres"
"#,
        )
        .unwrap();
        assert_eq!(config.tree_sync.max_depth(), DEFAULT_MAX_DEPTH);
        assert!(config.tree_sync.delete_orphans());
        assert!(config.metadata.path.is_none());
    }
}
