use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub capture: CaptureConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub notify: NotifyConfig,
    #[serde(default)]
    pub admin: AdminConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub log_level: String,
    /// Debug mode. Notifications are suppressed unless notify.on_debug is set.
    pub debug: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
            log_level: "info".to_string(),
            debug: false,
        }
    }
}

/// Controls which parts of a request are snapshotted at tag time
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CaptureConfig {
    pub headers: bool,
    pub query_parameters: bool,
    pub query_string: bool,
    /// Name given to request loggers created by the tagger
    pub default_logger_name: String,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            headers: true,
            query_parameters: true,
            query_string: true,
            default_logger_name: "apm".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct StorageConfig {
    /// SQLite database URL. Point this at a separate file to keep APM data
    /// out of the application's primary database.
    pub database_url: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite:tracevault.db".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct NotifyConfig {
    /// Dispatch notifications through the background queue instead of inline
    pub background_queue: bool,
    /// Seconds the queue worker waits before processing each job
    pub queue_delay_secs: u64,
    /// Extra lookup attempts when a trace is not yet visible to the dispatcher
    pub trace_lookup_retries: u32,
    /// Extra attempts for a queued dispatch job that fails with a storage error
    pub task_retries: u32,
    /// Base URL used to build the admin link included in notifications
    pub admin_base_url: String,
    /// Send notifications even when the server runs in debug mode
    pub on_debug: bool,
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            background_queue: false,
            queue_delay_secs: 3,
            trace_lookup_retries: 3,
            task_retries: 3,
            admin_base_url: "http://localhost:8080/apm".to_string(),
            on_debug: false,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct AdminConfig {
    /// Bearer token required by the operator metrics API
    pub token: String,
}

pub fn load_config(path: &str) -> anyhow::Result<Config> {
    let config = config::Config::builder()
        .add_source(config::File::with_name(path).required(false))
        .add_source(config::Environment::with_prefix("TRACEVAULT").separator("__"))
        .build()?;

    let cfg: Config = config.try_deserialize()?;
    validate_config(&cfg)?;

    Ok(cfg)
}

fn validate_config(cfg: &Config) -> anyhow::Result<()> {
    if cfg.admin.token.is_empty() {
        anyhow::bail!("admin.token must be set (the operator API cannot run without it)");
    }

    if cfg.storage.database_url.is_empty() {
        anyhow::bail!("storage.database_url cannot be empty");
    }

    if cfg.notify.admin_base_url.is_empty() {
        anyhow::bail!("notify.admin_base_url cannot be empty");
    }

    if cfg.server.port == 0 {
        anyhow::bail!("server.port cannot be 0");
    }

    Ok(())
}
