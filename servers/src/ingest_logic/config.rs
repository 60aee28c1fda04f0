use anyhow::{Context, Result};
use clap::Parser;
use lib_common::configs::EngineSettings;
use lib_common::ingestors::{FeedKind, StreamApiConfig};
use lib_common::telemetry::Category;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

pub const DEFAULT_CONFIG_FILE: &str = "server_ingest.conf";

#[derive(Parser, Deserialize, Serialize, Debug, Clone, Default)]
#[clap(about = "Biosignal telemetry ingest server", version)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[clap(long, env = "INGEST_CONFIG_PATH", help = "Path to the JSON configuration file.")]
    pub config_path: Option<PathBuf>,

    #[clap(long, env = "INGEST_PORT", help = "Port of the /health endpoint.")]
    pub port: Option<u16>,

    #[clap(long, env = "INGEST_LOG_DIR", help = "Directory for log files.")]
    pub log_dir: Option<PathBuf>,

    #[clap(long, env = "INGEST_LOG_LEVEL", help = "Logging level (trace, debug, info, warn, error).")]
    pub log_level: Option<String>,

    #[clap(long, env = "DATABASE_URL", help = "PostgreSQL connection URL.")]
    pub database_url: Option<String>,

    #[clap(long, env = "INGEST_DB_MAX_CONNECTIONS", help = "Maximum pooled database connections.")]
    pub db_max_connections: Option<u32>,

    #[clap(long, env = "NEUROSITY_OAUTH_URL", help = "Provider OAuth token endpoint.")]
    pub oauth_url: Option<String>,

    #[clap(long, env = "NEUROSITY_OAUTH_CLIENT_ID", help = "Provider OAuth client id.")]
    pub client_id: Option<String>,

    #[clap(long, env = "NEUROSITY_OAUTH_CLIENT_SECRET", help = "Provider OAuth client secret.")]
    #[serde(skip_serializing)]
    pub client_secret: Option<String>,

    #[clap(long, env = "NEUROSITY_STREAM_URL", help = "Provider WebSocket base URL.")]
    pub stream_url: Option<String>,

    #[clap(long, env = "INGEST_ISOLATION", help = "Run each session in its own worker process (true/false).")]
    pub isolation: Option<bool>,

    #[clap(long, env = "INGEST_WORKER_PATH", help = "Path to the session_worker binary.")]
    pub worker_path: Option<PathBuf>,

    #[clap(long, env = "INGEST_EXIT_ON_LOAD_FAILURE", help = "Exit when the initial membership read fails (true/false).")]
    pub exit_on_load_failure: Option<bool>,

    #[clap(long, env = "INGEST_BUFFER_SIZE", help = "Buffered records that trigger an immediate flush.")]
    pub buffer_size: Option<usize>,

    #[clap(long, env = "INGEST_FLUSH_INTERVAL_MS", help = "Flush timer delay in milliseconds.")]
    pub flush_interval_ms: Option<u64>,

    #[clap(long, env = "INGEST_IDLE_CHECK_INTERVAL_MS", help = "Session idle check period in milliseconds.")]
    pub idle_check_interval_ms: Option<u64>,

    #[clap(long, env = "INGEST_INVALIDATE_ON_FAILURE", help = "Mark credentials invalid when a session fails to start (true/false).")]
    pub invalidate_on_failure: Option<bool>,

    #[clap(long, env = "INGEST_MEMBERSHIP_TABLE", help = "Membership table to read and watch.")]
    pub membership_table: Option<String>,

    // File only.
    #[clap(skip)]
    pub feeds: Option<BTreeMap<FeedKind, Category>>,

    // File only.
    #[clap(skip)]
    pub conflict_keys: Option<BTreeMap<Category, Vec<String>>>,
}

impl Config {
    // Merge two Config structs, where 'other' overrides 'self' for Some values
    fn merge(self, other: Config) -> Config {
        Config {
            config_path: other.config_path.or(self.config_path),
            port: other.port.or(self.port),
            log_dir: other.log_dir.or(self.log_dir),
            log_level: other.log_level.or(self.log_level),
            database_url: other.database_url.or(self.database_url),
            db_max_connections: other.db_max_connections.or(self.db_max_connections),
            oauth_url: other.oauth_url.or(self.oauth_url),
            client_id: other.client_id.or(self.client_id),
            client_secret: other.client_secret.or(self.client_secret),
            stream_url: other.stream_url.or(self.stream_url),
            isolation: other.isolation.or(self.isolation),
            worker_path: other.worker_path.or(self.worker_path),
            exit_on_load_failure: other.exit_on_load_failure.or(self.exit_on_load_failure),
            buffer_size: other.buffer_size.or(self.buffer_size),
            flush_interval_ms: other.flush_interval_ms.or(self.flush_interval_ms),
            idle_check_interval_ms: other.idle_check_interval_ms.or(self.idle_check_interval_ms),
            invalidate_on_failure: other.invalidate_on_failure.or(self.invalidate_on_failure),
            membership_table: other.membership_table.or(self.membership_table),
            feeds: other.feeds.or(self.feeds),
            conflict_keys: other.conflict_keys.or(self.conflict_keys),
        }
    }

    fn defaults() -> Config {
        let engine = EngineSettings::default();
        Config {
            port: Some(8080),
            log_dir: Some(PathBuf::from("./logs")),
            log_level: Some("info".to_string()),
            db_max_connections: Some(5),
            oauth_url: Some("https://api.neurosity.co/oauth/token".to_string()),
            stream_url: Some("wss://api.neurosity.co/stream".to_string()),
            isolation: Some(false),
            exit_on_load_failure: Some(true),
            buffer_size: Some(engine.buffer_size),
            flush_interval_ms: Some(engine.flush_interval_ms),
            idle_check_interval_ms: Some(engine.idle_check_interval_ms),
            invalidate_on_failure: Some(engine.invalidate_on_failure),
            membership_table: Some(engine.membership_table),
            ..Default::default()
        }
    }

    /// Engine settings: defaults overridden by whatever was configured.
    pub fn engine_settings(&self) -> EngineSettings {
        let mut settings = EngineSettings::default();
        if let Some(v) = self.buffer_size {
            settings.buffer_size = v;
        }
        if let Some(v) = self.flush_interval_ms {
            settings.flush_interval_ms = v;
        }
        if let Some(v) = self.idle_check_interval_ms {
            settings.idle_check_interval_ms = v;
        }
        if let Some(v) = self.invalidate_on_failure {
            settings.invalidate_on_failure = v;
        }
        if let Some(v) = &self.membership_table {
            settings.membership_table = v.clone();
        }
        if let Some(v) = &self.feeds {
            settings.feeds = v.clone();
        }
        if let Some(v) = &self.conflict_keys {
            settings.conflict_keys = v.clone();
        }
        settings
    }

    pub fn stream_api(&self) -> Result<StreamApiConfig> {
        Ok(StreamApiConfig {
            oauth_url: self.oauth_url.clone().context("provider OAuth URL is not configured")?,
            client_id: self.client_id.clone().context("NEUROSITY_OAUTH_CLIENT_ID is not configured")?,
            client_secret: self
                .client_secret
                .clone()
                .context("NEUROSITY_OAUTH_CLIENT_SECRET is not configured")?,
            stream_url: self.stream_url.clone().context("provider stream URL is not configured")?,
        })
    }

    pub fn database_url(&self) -> Result<&str> {
        self.database_url
            .as_deref()
            .context("database URL is not configured (--database-url or DATABASE_URL)")
    }
}

/// Resolves the configuration: defaults, then the JSON file, then
/// environment (`.env` included) and CLI flags.
pub fn load_config() -> Result<Config> {
    // 1. .env feeds the environment clap reads
    dotenvy::dotenv().ok();

    // 2. CLI and environment, parsed once; may name the config file
    let cli = Config::parse();
    let config_file_path = cli
        .config_path
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));

    resolve(cli, &config_file_path)
}

fn resolve(cli: Config, config_file_path: &Path) -> Result<Config> {
    let mut current_config = Config::defaults();

    if config_file_path.exists() {
        let config_str = fs::read_to_string(config_file_path)
            .with_context(|| format!("failed to read config file {}", config_file_path.display()))?;
        let file_config: Config = serde_json::from_str(&config_str)
            .with_context(|| format!("failed to parse config file {}", config_file_path.display()))?;
        current_config = current_config.merge(file_config);
    } else {
        // Logging is not up yet.
        eprintln!(
            "Config file not found at {}. Using defaults and environment/CLI variables.",
            config_file_path.display()
        );
    }

    Ok(current_config.merge(cli))
}
