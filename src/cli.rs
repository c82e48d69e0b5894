use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(version, about = "A GraphQL gateway for SQL databases", long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "bifrost.toml", env = "BIFROST_CONFIG")]
    pub config: String,
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start the GraphQL server
    Serve,
    /// Introspect the database schema and output the GraphQL SDL
    Introspect {
        /// Output file (stdout if not specified)
        #[arg(short, long)]
        output: Option<String>,
    },
}
