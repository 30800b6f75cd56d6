use clap::Parser;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// This struct is used for both args and environment variables
/// the basic idea is that every env var can be overriden by a cli arg
/// and these override the config file
/// env vars follow the pattern of TOOLGRID_{UPPERCASE_ARG_NAME}
#[derive(Debug, Parser, Serialize, Deserialize, Default)]
#[command(version, about, long_about = None)]
#[serde(default)]
pub struct CliArgs {
    /// The home directory of the application, where the toolgrid.toml configuration file is stored
    /// if not provided here or in an env var, a series of default directories will be tried
    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub home: Option<PathBuf>,

    /// The path to an optional dotenv file to try and load
    /// if not set, will be the current working directory's .env
    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dotenv: Option<PathBuf>,

    /// The port to bind the server to.
    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u32>,

    /// Log level in the format of comma-separated tracing directives.
    #[arg(long, value_delimiter = ',')]
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub log_level: Vec<String>,

    /// The host to bind the server to
    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,

    /// The directory to store all internal data files
    /// Default is /var/toolgrid
    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<PathBuf>,

    /// The allowed cors origins
    #[arg(long, value_delimiter = ',')]
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub cors_allowed_origins: Vec<String>,

    /// Path of the sqlite database file; defaults to <data>/toolgrid.db
    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub database_path: Option<PathBuf>,

    /// The key that authenticates administrative API calls
    /// (usually leave this as None and set it in the environment)
    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub master_api_key: Option<String>,

    /// API key for the embeddings provider; enables semantic search
    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub embeddings_api_key: Option<String>,

    /// Override the embeddings endpoint
    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub embeddings_url: Option<String>,

    /// Override the embeddings model
    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub embeddings_model: Option<String>,

    /// OTLP collector endpoint for traces and metrics
    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub otel_collector: Option<String>,

    /// Size of the compiled-template LRU cache
    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub template_cache_size: Option<usize>,

    /// Number of tokio worker threads; defaults to the core count
    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worker_threads: Option<usize>,
}

impl CliArgs {
    pub const ENV_VAR_PREFIX: &'static str = "TOOLGRID";
}
