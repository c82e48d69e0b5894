//! Bifrost exposes a relational database as a GraphQL endpoint with no
//! per-table code: the schema is introspected at startup, a canonical model
//! is built from it plus sidecar metadata, and every request is translated
//! into parameterized SQL with the tenancy / soft-delete / auto-filter /
//! audit policy chain applied on the way through.

use std::sync::Arc;

use async_graphql::dataloader::DataLoader;
use async_graphql::http::GraphiQLSource;
use async_graphql_axum::GraphQL;
use axum::{Router, response::Html};
use tokio::net::TcpListener;
use tracing::info;

pub mod config;
pub mod context;
pub mod db;
pub mod dialect;
pub mod error;
pub mod graphql;
pub mod metadata;
pub mod model;
pub mod query;
pub mod schema;
pub mod sync;
pub mod transform;
pub mod typemap;

pub use context::UserContext;
pub use dialect::Dialect;
pub use error::{BifrostError, BifrostExecutionError, BifrostResult};
pub use metadata::MetadataFile;
pub use model::Model;
pub use query::translator::{Translator, add_sql_parameterized};
pub use sync::{TreeSync, TreeSyncOperation};
pub use transform::{
    MutationPipeline, MutationTransformResult, MutationType, QueryTransformerService,
};

use crate::config::BifrostConfig;
use crate::db::SqlExecutor;
use crate::graphql::loader::LinkLoader;

/// Applies the standard filter-transformer chain to a query tree, rewriting
/// its filter (and its joins' filters) in place.
pub fn apply_transformers(
    query: &mut query::ir::ObjectQuery,
    model: &Model,
    ctx: &UserContext,
) -> BifrostResult<()> {
    QueryTransformerService::standard().apply_transformers(query, model, ctx)
}

/// Runs one row through the standard mutation-transformer chain.
pub fn transform(
    model: &Model,
    table: &model::Table,
    mutation_type: MutationType,
    data: &transform::mutation::DataMap,
    ctx: &UserContext,
) -> MutationTransformResult {
    MutationPipeline::standard().transform(model, table, mutation_type, data, ctx)
}

pub struct BifrostSQL {
    config: BifrostConfig,
}

impl BifrostSQL {
    pub fn new(config: BifrostConfig) -> Self {
        Self { config }
    }

    /// Reads the raw schema over the executor and builds the immutable
    /// model, metadata applied.
    pub async fn introspect(&self, executor: &dyn SqlExecutor) -> BifrostResult<Arc<Model>> {
        let meta = match &self.config.metadata.path {
            Some(path) => MetadataFile::load(path)?,
            None => MetadataFile::default(),
        };
        let data = schema::read_schema(self.config.database.dialect, executor).await?;
        let model = Model::build(data, &meta)?;
        info!(tables = model.tables().count(), "model built");
        Ok(Arc::new(model))
    }

    /// Generates the dynamic GraphQL schema for a model and wires in the
    /// execution machinery.
    pub fn build_schema(
        &self,
        model: Arc<Model>,
        executor: Arc<dyn SqlExecutor>,
    ) -> async_graphql::Result<async_graphql::dynamic::Schema> {
        let dialect = self.config.database.dialect;
        let translator = Translator::new(dialect);

        let builder = graphql::schema::generate_schema(&model, dialect);
        let builder = self.config.graphql.apply(builder);

        let tree_sync = TreeSync::new(
            self.config.tree_sync.max_depth(),
            self.config.tree_sync.delete_orphans(),
        )
        .map_err(BifrostExecutionError::from)?;

        let loader = LinkLoader {
            model: model.clone(),
            executor: executor.clone(),
            translator,
        };

        Ok(builder
            .data(model)
            .data(executor)
            .data(translator)
            .data(Arc::new(QueryTransformerService::standard()))
            .data(Arc::new(MutationPipeline::standard()))
            .data(tree_sync)
            .data(DataLoader::new(loader, tokio::spawn))
            .finish()?)
    }

    /// Connects, introspects, and returns the router + listener pair ready
    /// for `axum::serve`.
    pub async fn build(&self) -> anyhow::Result<(Router, TcpListener)> {
        let executor: Arc<dyn SqlExecutor> =
            Arc::new(self.config.database.create_executor().await?);
        let model = self.introspect(executor.as_ref()).await?;
        let schema = self
            .build_schema(model, executor)
            .map_err(|e| anyhow::anyhow!(e.message))?;

        let mut router = Router::new();
        if self.config.graphql.enable_playground.unwrap_or(true) {
            router = router.route(
                "/",
                axum::routing::get(|| async move {
                    Html(GraphiQLSource::build().endpoint("/").finish())
                })
                .post_service(GraphQL::new(schema)),
            );
        } else {
            router = router.route("/", axum::routing::post_service(GraphQL::new(schema)));
        }

        let listener = TcpListener::bind(format!(
            "{}:{}",
            self.config.server.host, self.config.server.port
        ))
        .await?;

        info!(
            "GraphQL endpoint listening on {}:{}",
            self.config.server.host, self.config.server.port
        );
        Ok((router, listener))
    }
}

#[cfg(test)]
mod e2e_tests {
    use super::*;
    use crate::db::DbExecutor;
    use serde_json::json;

    async fn sqlite_schema(
        ddl: &[&str],
        metadata: &str,
    ) -> (async_graphql::dynamic::Schema, Arc<dyn SqlExecutor>) {
        let executor = DbExecutor::connect(Dialect::Sqlite, "sqlite::memory:", 1, None)
            .await
            .unwrap();
        for statement in ddl {
            executor.execute(statement, &[]).await.unwrap();
        }
        let executor: Arc<dyn SqlExecutor> = Arc::new(executor);

        let meta = MetadataFile::parse(metadata).unwrap();
        let data = schema::read_schema(Dialect::Sqlite, executor.as_ref())
            .await
            .unwrap();
        let model = Arc::new(Model::build(data, &meta).unwrap());

        let translator = Translator::new(Dialect::Sqlite);
        let loader = LinkLoader {
            model: model.clone(),
            executor: executor.clone(),
            translator,
        };
        let schema = graphql::schema::generate_schema(&model, Dialect::Sqlite)
            .data(model)
            .data(executor.clone())
            .data(translator)
            .data(Arc::new(QueryTransformerService::standard()))
            .data(Arc::new(MutationPipeline::standard()))
            .data(TreeSync::default())
            .data(DataLoader::new(loader, tokio::spawn))
            .finish()
            .unwrap();
        (schema, executor)
    }

    const BLOG_DDL: &[&str] = &[
        "CREATE TABLE authors (id INTEGER PRIMARY KEY, name TEXT NOT NULL)",
        "CREATE TABLE posts (id INTEGER PRIMARY KEY, author_id INTEGER NOT NULL REFERENCES authors(id), title TEXT NOT NULL)",
    ];

    #[tokio::test]
    async fn list_query_round_trips() {
        let (schema, executor) = sqlite_schema(BLOG_DDL, "").await;
        executor
            .execute("INSERT INTO authors (name) VALUES (@p1), (@p2)", &[
                json!("ann"),
                json!("bo"),
            ])
            .await
            .unwrap();

        let response = schema
            .execute("{ authors { id name } }")
            .await
            .into_result()
            .unwrap();
        let data = response.data.into_json().unwrap();
        assert_eq!(
            data,
            json!({"authors": [{"id": 1, "name": "ann"}, {"id": 2, "name": "bo"}]})
        );
    }

    #[tokio::test]
    async fn filter_sort_and_links_work_together() {
        let (schema, executor) = sqlite_schema(BLOG_DDL, "").await;
        executor
            .execute("INSERT INTO authors (name) VALUES (@p1), (@p2)", &[
                json!("ann"),
                json!("bo"),
            ])
            .await
            .unwrap();
        executor
            .execute(
                "INSERT INTO posts (author_id, title) VALUES (@p1, @p2), (@p3, @p4), (@p5, @p6)",
                &[
                    json!(1),
                    json!("first"),
                    json!(1),
                    json!("second"),
                    json!(2),
                    json!("other"),
                ],
            )
            .await
            .unwrap();

        let response = schema
            .execute(
                r#"{ authors(filter: {name: {_eq: "ann"}}) { name posts { title } } }"#,
            )
            .await
            .into_result()
            .unwrap();
        let data = response.data.into_json().unwrap();
        assert_eq!(
            data,
            json!({"authors": [{"name": "ann", "posts": [{"title": "first"}, {"title": "second"}]}]})
        );

        let response = schema
            .execute(r#"{ posts(sort: [title_asc]) { title authors { name } } }"#)
            .await
            .into_result()
            .unwrap();
        let data = response.data.into_json().unwrap();
        assert_eq!(data["posts"][0]["title"], json!("first"));
        assert_eq!(data["posts"][0]["authors"], json!({"name": "ann"}));
    }

    #[tokio::test]
    async fn aggregate_counts_rows() {
        let (schema, executor) = sqlite_schema(BLOG_DDL, "").await;
        executor
            .execute("INSERT INTO authors (name) VALUES (@p1), (@p2)", &[
                json!("ann"),
                json!("bo"),
            ])
            .await
            .unwrap();

        let response = schema
            .execute("{ authors_aggregate { count } }")
            .await
            .into_result()
            .unwrap();
        assert_eq!(
            response.data.into_json().unwrap(),
            json!({"authors_aggregate": {"count": 2}})
        );
    }

    #[tokio::test]
    async fn nested_insert_creates_parent_and_children() {
        let (schema, executor) = sqlite_schema(BLOG_DDL, "").await;

        let response = schema
            .execute(
                r#"mutation {
                    insert_authors(value: {name: "ann", posts: [{title: "a"}, {title: "b"}]}) {
                        id
                        name
                    }
                }"#,
            )
            .await
            .into_result()
            .unwrap();
        let data = response.data.into_json().unwrap();
        assert_eq!(data["insert_authors"]["name"], json!("ann"));

        let posts = executor
            .fetch_all("SELECT author_id, title FROM posts ORDER BY title", &[])
            .await
            .unwrap();
        assert_eq!(posts.len(), 2);
        assert!(posts.iter().all(|p| p["author_id"] == json!(1)));
    }

    #[tokio::test]
    async fn update_mutation_diffs_the_tree() {
        let (schema, executor) = sqlite_schema(BLOG_DDL, "").await;
        executor
            .execute("INSERT INTO authors (name) VALUES (@p1)", &[json!("ann")])
            .await
            .unwrap();
        executor
            .execute(
                "INSERT INTO posts (author_id, title) VALUES (@p1, @p2), (@p3, @p4)",
                &[json!(1), json!("keep"), json!(1), json!("drop")],
            )
            .await
            .unwrap();

        let response = schema
            .execute(
                r#"mutation {
                    update_authors(value: {id: 1, name: "anne", posts: [{id: 1, title: "kept"}]}) {
                        name
                    }
                }"#,
            )
            .await
            .into_result()
            .unwrap();
        assert_eq!(
            response.data.into_json().unwrap()["update_authors"]["name"],
            json!("anne")
        );

        let posts = executor
            .fetch_all("SELECT id, title FROM posts", &[])
            .await
            .unwrap();
        // The orphaned post was deleted, the kept one renamed.
        assert_eq!(posts.len(), 1);
        assert_eq!(posts[0]["title"], json!("kept"));
    }

    #[tokio::test]
    async fn delete_mutation_respects_soft_delete() {
        let metadata = "[tables.notes]\nsoft-delete = \"deleted_at\"\n";
        let (schema, executor) = sqlite_schema(
            &[
                "CREATE TABLE notes (id INTEGER PRIMARY KEY, body TEXT NOT NULL, deleted_at TEXT)",
            ],
            metadata,
        )
        .await;
        executor
            .execute("INSERT INTO notes (body) VALUES (@p1)", &[json!("hello")])
            .await
            .unwrap();

        let response = schema
            .execute("mutation { delete_notes(id: 1) }")
            .await
            .into_result()
            .unwrap();
        assert_eq!(
            response.data.into_json().unwrap(),
            json!({"delete_notes": 1})
        );

        // Row survives with deleted_at set, and reads now filter it out.
        let rows = executor
            .fetch_all("SELECT deleted_at FROM notes", &[])
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert!(rows[0]["deleted_at"].is_string());

        let response = schema
            .execute("{ notes { id } }")
            .await
            .into_result()
            .unwrap();
        assert_eq!(response.data.into_json().unwrap(), json!({"notes": []}));

        let response = schema
            .execute("{ notes(_includeDeleted: true) { id } }")
            .await
            .into_result()
            .unwrap();
        assert_eq!(
            response.data.into_json().unwrap(),
            json!({"notes": [{"id": 1}]})
        );
    }

    #[tokio::test]
    async fn tenant_filter_requires_and_uses_the_context() {
        let metadata = "[tables.orders]\ntenant-filter = \"tenant_id\"\n";
        let (schema, executor) = sqlite_schema(
            &["CREATE TABLE orders (id INTEGER PRIMARY KEY, tenant_id INTEGER NOT NULL, total REAL NOT NULL)"],
            metadata,
        )
        .await;
        executor
            .execute(
                "INSERT INTO orders (tenant_id, total) VALUES (@p1, @p2), (@p3, @p4)",
                &[json!(1), json!(10.0), json!(2), json!(20.0)],
            )
            .await
            .unwrap();

        // Without a tenant in context the request fails.
        let response = schema.execute("{ orders { id } }").await;
        assert!(!response.errors.is_empty());
        assert!(response.errors[0].message.contains("tenant_id"));

        // With one, only that tenant's rows come back.
        let mut ctx = UserContext::new();
        ctx.set("tenant_id", 2);
        let request = async_graphql::Request::new("{ orders { id total } }").data(ctx);
        let response = schema.execute(request).await.into_result().unwrap();
        assert_eq!(
            response.data.into_json().unwrap(),
            json!({"orders": [{"id": 2, "total": 20.0}]})
        );
    }
}
