use std::sync::Arc;

use anyhow::Context;
use bifrost_sql::BifrostSQL;
use bifrost_sql::config::BifrostConfig;
use bifrost_sql::db::SqlExecutor;
use clap::Parser;
use tracing_subscriber::EnvFilter;

mod cli;

use cli::{Cli, Commands};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = BifrostConfig::from_path(&cli.config)?;
    let app = BifrostSQL::new(config.clone());

    match cli.command {
        Commands::Serve => {
            let (router, listener) = app.build().await?;
            axum::serve(listener, router).await.context("server error")?;
        }
        Commands::Introspect { output } => {
            let executor: Arc<dyn SqlExecutor> =
                Arc::new(config.database.create_executor().await?);
            let model = app.introspect(executor.as_ref()).await?;
            let schema = app
                .build_schema(model, executor)
                .map_err(|e| anyhow::anyhow!(e.message))?;
            let sdl = schema.sdl();

            match output {
                Some(path) => {
                    std::fs::write(&path, &sdl)
                        .with_context(|| format!("failed to write {path}"))?;
                    println!("GraphQL schema written to: {path}");
                }
                None => println!("{sdl}"),
            }
        }
    }

    Ok(())
}
