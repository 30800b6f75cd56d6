use anyhow::{bail, Context, Result};
use figment::{providers::Format, Figment};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

use crate::args::CliArgs;

/// The fully parsed and validated config struct we use in the application
/// this is built up from the ConfigBuilder which can load from multiple sources (in order of preference):
///
/// 1. cli args
/// 2. environment variables
/// 3. config file
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Config {
    /// The port to bind the server to.
    /// Default is `8700`
    pub port: u32,
    /// The log-level to use, in the format of [tracing directives](https://docs.rs/tracing-subscriber/latest/tracing_subscriber/filter/struct.EnvFilter.html#directives).
    /// Default is `["info"]`
    pub log_level: Vec<String>,
    /// The host to bind the server to
    /// Default is `localhost`
    pub host: String,
    /// The directory to store all internal data files
    /// Default is `/var/toolgrid`
    pub data: PathBuf,
    /// The allowed cors origins
    /// Default is empty
    pub cors_allowed_origins: Vec<String>,

    /// Explicit database file path; when unset, `<data>/toolgrid.db`
    pub database_path: Option<PathBuf>,

    /// Required: the administrative API key. Refuses to boot without it.
    pub master_api_key: Option<String>,

    /// Optional embeddings provider credentials; semantic search is off
    /// without a key
    pub embeddings_api_key: Option<String>,
    pub embeddings_url: Option<String>,
    pub embeddings_model: Option<String>,

    /// OTLP collector endpoint; telemetry export is off when unset
    pub otel_collector: Option<String>,

    /// Compiled-template LRU size for the workflow engine
    pub template_cache_size: usize,

    /// Environment variables exposed to workflow templates as `env.*`
    pub workflow_env: BTreeMap<String, String>,

    /// Tokio worker threads; None = core count
    pub worker_threads: Option<usize>,
}

/// Default values for the config struct
/// these are only used to fill in holes after all the parsing and loading is done
impl Default for Config {
    fn default() -> Self {
        Self {
            port: 8700,
            log_level: vec!["info".to_string()],
            host: "localhost".to_string(),
            data: PathBuf::from("/var/toolgrid"),
            cors_allowed_origins: Vec::new(),
            database_path: None,
            master_api_key: None,
            embeddings_api_key: None,
            embeddings_url: None,
            embeddings_model: None,
            otel_collector: None,
            template_cache_size: 1000,
            workflow_env: BTreeMap::new(),
            worker_threads: None,
        }
    }
}

impl Config {
    pub fn database_path(&self) -> PathBuf {
        self.database_path
            .clone()
            .unwrap_or_else(|| self.data.join("toolgrid.db"))
    }

    pub fn master_api_key(&self) -> Result<&str> {
        self.master_api_key
            .as_deref()
            .filter(|key| !key.is_empty())
            .context("MASTER_API_KEY is required (env var, config file, or --master-api-key)")
    }

    pub fn tracing_env_filter(&self) -> Result<tracing_subscriber::EnvFilter> {
        let mut filter = tracing_subscriber::EnvFilter::from_default_env();
        for directive in &self.log_level {
            match directive.parse() {
                Ok(directive) => filter = filter.add_directive(directive),
                Err(err) => bail!("{}: {}", err, directive),
            }
        }

        Ok(filter)
    }
}

/// The builder we use to build Config
#[derive(Debug)]
pub struct ConfigBuilder {
    pub cli_args: CliArgs,
}

impl ConfigBuilder {
    pub const FILENAME: &'static str = "toolgrid.toml";
    pub const DIRNAME: &'static str = "toolgrid";
    pub const HIDDEN_DIRNAME: &'static str = ".toolgrid";

    pub fn new(cli_args: CliArgs) -> Self {
        Self { cli_args }
    }

    // merges the cli and env vars
    // which has optional values, by default None (or empty)
    pub fn merge_cli_env_args(&self) -> Result<CliArgs> {
        let cli_args: CliArgs = Figment::new()
            .merge(figment::providers::Env::prefixed(&format!(
                "{}_",
                CliArgs::ENV_VAR_PREFIX
            )))
            .merge(figment::providers::Serialized::defaults(&self.cli_args))
            .extract()?;

        Ok(cli_args)
    }

    pub fn build(self) -> Result<Config> {
        // try to load dotenv first, since it may affect env vars for filepaths
        let dotenv_path = self
            .cli_args
            .dotenv
            .clone()
            .unwrap_or(std::env::current_dir()?.join(".env"));

        if dotenv_path.exists() {
            if let Err(e) = dotenvy::from_path(dotenv_path) {
                bail!("Error loading dotenv file: {}", e);
            }
        }

        let mut cli_env_args = self.merge_cli_env_args()?;
        apply_bare_env_vars(&mut cli_env_args);

        // then, our final config, which can have more complex types with easier TOML-like syntax
        // and also fills in defaults for required values at the end
        let config: Config = Figment::new()
            .merge(figment::providers::Toml::file(Self::filepath(
                &cli_env_args,
            )?))
            .merge(figment::providers::Serialized::defaults(cli_env_args))
            .join(figment::providers::Serialized::defaults(Config::default()))
            .extract()?;

        Ok(Config {
            data: shellexpand::tilde(&config.data.to_string_lossy())
                .to_string()
                .into(),
            ..config
        })
    }

    /// finds the filepath through a series of fallbacks
    /// the argument is internally derived cli + env args
    pub fn filepath(cli_env_args: &CliArgs) -> Result<PathBuf> {
        let filepaths_to_try = Self::filepaths_to_try(cli_env_args);

        filepaths_to_try
            .iter()
            .find(|filename| filename.exists())
            .with_context(|| {
                format!(
                    "No config file found, try creating one of these: {:?}",
                    filepaths_to_try
                )
            })
            .cloned()
    }

    /// provides the list of filepaths to try for the config file
    /// the argument is internally from cli + env args
    pub fn filepaths_to_try(cli_env_args: &CliArgs) -> Vec<PathBuf> {
        // the paths returned will be tried in order of pushing
        let mut dirs = Vec::new();

        // explicit arg passed to the cli, e.g. --home /foo, or env var HOME="/foo"
        // this does not append the default "toolgrid" subdirectory
        // i.e. the path in this case will be /foo/toolgrid.toml
        if let Some(dir) = cli_env_args.home.clone() {
            dirs.push(dir);
        }

        // next, check the current working directory, wherever the command is run from
        // i.e. ./toolgrid.toml
        if let Ok(dir) = std::env::current_dir() {
            dirs.push(dir);
        }

        // the user's home directory directly, not in the `.config` subdirectory
        // to not pollute the home directory, it looks for ~/.toolgrid/toolgrid.toml
        if let Some(dir) = dirs::home_dir().map(|dir| dir.join(Self::HIDDEN_DIRNAME)) {
            dirs.push(dir);
        }

        // the system config directory, e.g. ~/.config/toolgrid/toolgrid.toml on Linux
        if let Some(dir) = dirs::config_dir().map(|dir| dir.join(Self::DIRNAME)) {
            dirs.push(dir);
        }

        // XDG may differ from config_dir on some platforms, try it explicitly
        if let Some(dir) = std::env::var("XDG_CONFIG_HOME")
            .ok()
            .map(PathBuf::from)
            .map(|dir| dir.join(Self::DIRNAME))
        {
            dirs.push(dir);
        }

        // `config_dir` may have already added this, but on systems like
        // Windows the config dir lands in AppData/Roaming, so add the
        // ~/.config variant explicitly as well
        if let Some(dir) = dirs::home_dir().map(|dir| dir.join(".config").join(Self::DIRNAME)) {
            dirs.push(dir);
        }

        // Lastly, try /etc/toolgrid/toolgrid.toml
        dirs.push(PathBuf::from("/etc").join(Self::DIRNAME));

        // now we have a list of directories to check, we need to add the filename to each
        dirs.into_iter()
            .map(|dir| dir.join(Self::FILENAME))
            .collect()
    }
}

/// The deployment contract names a few bare (unprefixed) env vars:
/// `PORT`, `MASTER_API_KEY`, `DATABASE_PATH`, `EMBEDDINGS_API_KEY`.
/// They fill holes the prefixed vars and CLI args left open.
fn apply_bare_env_vars(args: &mut CliArgs) {
    if args.port.is_none() {
        if let Ok(port) = std::env::var("PORT") {
            args.port = port.parse().ok();
        }
    }
    if args.master_api_key.is_none() {
        if let Ok(key) = std::env::var("MASTER_API_KEY") {
            args.master_api_key = Some(key);
        }
    }
    if args.database_path.is_none() {
        if let Ok(path) = std::env::var("DATABASE_PATH") {
            args.database_path = Some(PathBuf::from(path));
        }
    }
    if args.embeddings_api_key.is_none() {
        if let Ok(key) = std::env::var("EMBEDDINGS_API_KEY") {
            args.embeddings_api_key = Some(key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_fill_holes() {
        let config = Config::default();
        assert_eq!(config.port, 8700);
        assert_eq!(config.template_cache_size, 1000);
        assert!(config.master_api_key().is_err());
        assert_eq!(
            config.database_path(),
            PathBuf::from("/var/toolgrid/toolgrid.db")
        );
    }

    #[test]
    fn config_file_paths_end_with_filename() {
        let args = CliArgs::default();
        for path in ConfigBuilder::filepaths_to_try(&args) {
            assert!(path.ends_with(ConfigBuilder::FILENAME));
        }
    }
}
