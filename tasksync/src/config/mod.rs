//! Configuration for the `tasksync` client.
//!
//! Supports layered configuration with the following priority (highest first):
//! 1. CLI arguments
//! 2. Environment variables (via clap `env` attribute)
//! 3. TOML config file (`~/.config/tasksync/config.toml`)
//! 4. Compiled defaults
//!
//! Missing config file is not an error (defaults are used). An explicit
//! `--config` path that doesn't exist is an error.

use std::path::PathBuf;
use std::time::Duration;

use tasksync_proto::task::UserId;

use crate::engine::EngineSettings;
use crate::remote::ws::WsRemoteConfig;
use crate::sync::{Backoff, SyncSettings};

/// Errors that can occur when loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read the configuration file.
    #[error("failed to read config file {path}: {source}")]
    ReadFile {
        /// Path that was attempted.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// Failed to parse the TOML configuration.
    #[error("failed to parse config file: {0}")]
    ParseToml(#[from] toml::de::Error),

    /// A setting has a value the engine cannot run with.
    #[error("invalid value for {field}: {reason}")]
    InvalidValue {
        /// Name of the offending setting.
        field: &'static str,
        /// What is wrong with it.
        reason: &'static str,
    },
}

// ---------------------------------------------------------------------------
// TOML file structs (all fields Option for partial overrides)
// ---------------------------------------------------------------------------

/// Top-level TOML config file structure.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ConfigFile {
    store: StoreFileConfig,
    remote: RemoteFileConfig,
    sync: SyncFileConfig,
}

/// `[store]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct StoreFileConfig {
    path: Option<PathBuf>,
}

/// `[remote]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct RemoteFileConfig {
    url: Option<String>,
    user_id: Option<String>,
    token: Option<String>,
    connect_timeout_secs: Option<u64>,
}

/// `[sync]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct SyncFileConfig {
    interval_secs: Option<u64>,
    remote_timeout_secs: Option<u64>,
    max_attempts: Option<u32>,
    backoff_base_ms: Option<u64>,
    backoff_max_ms: Option<u64>,
    event_buffer: Option<usize>,
}

// ---------------------------------------------------------------------------
// Resolved configuration (concrete types, all fields populated)
// ---------------------------------------------------------------------------

/// Fully resolved client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    // -- Store --
    /// `SQLite` database file.
    pub store_path: PathBuf,
    /// Use in-memory store and remote instead.
    pub ephemeral: bool,

    // -- Remote --
    /// Task server WebSocket URL; `None` runs offline.
    pub remote_url: Option<String>,
    /// Account to sign in as; `None` stays signed out.
    pub user_id: Option<String>,
    /// Shared secret for the task server.
    pub token: Option<String>,
    /// Limit for connecting and authenticating.
    pub connect_timeout: Duration,

    // -- Sync --
    /// Period between scheduled drains.
    pub sync_interval: Duration,
    /// Limit for one remote call.
    pub remote_timeout: Duration,
    /// Attempts per change within one drain.
    pub max_attempts: u32,
    /// First retry delay.
    pub backoff_base: Duration,
    /// Largest retry delay.
    pub backoff_max: Duration,
    /// Capacity of the change event channel.
    pub event_buffer: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            store_path: default_store_path(),
            ephemeral: false,
            remote_url: None,
            user_id: None,
            token: None,
            connect_timeout: Duration::from_secs(10),
            sync_interval: Duration::from_secs(30),
            remote_timeout: Duration::from_secs(10),
            max_attempts: 3,
            backoff_base: Duration::from_millis(500),
            backoff_max: Duration::from_secs(5),
            event_buffer: 64,
        }
    }
}

impl ClientConfig {
    /// Load configuration by merging CLI args, env vars, and a TOML file.
    ///
    /// If `--config` is given and the file does not exist, returns an error.
    /// Otherwise the default path (`~/.config/tasksync/config.toml`) is
    /// tried and silently ignored if missing.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the config file cannot be read or parsed,
    /// or if a resolved value is out of range.
    pub fn load(cli: &CliArgs) -> Result<Self, ConfigError> {
        let file = load_config_file(cli.config.as_deref())?;
        let config = Self::resolve(cli, &file);
        config.validate()?;
        Ok(config)
    }

    /// Rejects zero periods, timeouts and attempt counts.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidValue`] naming the first bad setting.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let zero_durations = [
            ("sync.interval_secs", self.sync_interval),
            ("sync.remote_timeout_secs", self.remote_timeout),
            ("remote.connect_timeout_secs", self.connect_timeout),
        ];
        if let Some(&(field, _)) = zero_durations.iter().find(|(_, d)| d.is_zero()) {
            return Err(ConfigError::InvalidValue {
                field,
                reason: "must be greater than zero",
            });
        }
        if self.max_attempts == 0 {
            return Err(ConfigError::InvalidValue {
                field: "sync.max_attempts",
                reason: "must be at least 1",
            });
        }
        Ok(())
    }

    /// Priority: CLI > file > default.
    fn resolve(cli: &CliArgs, file: &ConfigFile) -> Self {
        let defaults = Self::default();

        Self {
            store_path: cli
                .db
                .clone()
                .or_else(|| file.store.path.clone())
                .unwrap_or(defaults.store_path),
            ephemeral: cli.ephemeral,
            remote_url: cli
                .remote_url
                .clone()
                .or_else(|| file.remote.url.clone()),
            user_id: cli.user.clone().or_else(|| file.remote.user_id.clone()),
            token: cli.token.clone().or_else(|| file.remote.token.clone()),
            connect_timeout: file
                .remote
                .connect_timeout_secs
                .map_or(defaults.connect_timeout, Duration::from_secs),
            sync_interval: cli
                .interval_secs
                .or(file.sync.interval_secs)
                .map_or(defaults.sync_interval, Duration::from_secs),
            remote_timeout: file
                .sync
                .remote_timeout_secs
                .map_or(defaults.remote_timeout, Duration::from_secs),
            max_attempts: file.sync.max_attempts.unwrap_or(defaults.max_attempts),
            backoff_base: file
                .sync
                .backoff_base_ms
                .map_or(defaults.backoff_base, Duration::from_millis),
            backoff_max: file
                .sync
                .backoff_max_ms
                .map_or(defaults.backoff_max, Duration::from_millis),
            event_buffer: file.sync.event_buffer.unwrap_or(defaults.event_buffer),
        }
    }

    /// Replay policy for the sync processor.
    #[must_use]
    pub fn sync_settings(&self) -> SyncSettings {
        SyncSettings {
            remote_timeout: self.remote_timeout,
            max_attempts: self.max_attempts,
            backoff: Backoff::new(self.backoff_base, self.backoff_max),
        }
    }

    /// Settings for [`SyncEngine`](crate::engine::SyncEngine).
    #[must_use]
    pub fn engine_settings(&self) -> EngineSettings {
        EngineSettings {
            sync: self.sync_settings(),
            event_buffer: self.event_buffer,
        }
    }

    /// WebSocket client settings, or `None` when no remote URL is set.
    #[must_use]
    pub fn ws_remote_config(&self) -> Option<WsRemoteConfig> {
        let url = self.remote_url.clone()?;
        Some(WsRemoteConfig {
            url,
            user_id: self.user_id.clone().map(UserId::new),
            token: self.token.clone(),
            connect_timeout: self.connect_timeout,
            request_timeout: self.remote_timeout,
        })
    }
}

/// Global CLI arguments parsed by clap.
#[derive(clap::Args, Debug, Default)]
pub struct CliArgs {
    /// Path to config file (default: `~/.config/tasksync/config.toml`).
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Task database file.
    #[arg(long, global = true, env = "TASKSYNC_DB")]
    pub db: Option<PathBuf>,

    /// WebSocket URL of the task server.
    #[arg(long, global = true, env = "TASKSYNC_REMOTE_URL")]
    pub remote_url: Option<String>,

    /// Account to sign in as.
    #[arg(long, global = true, env = "TASKSYNC_USER")]
    pub user: Option<String>,

    /// Shared secret for the task server.
    #[arg(long, global = true, env = "TASKSYNC_TOKEN", hide_env_values = true)]
    pub token: Option<String>,

    /// Seconds between scheduled drains.
    #[arg(long, global = true)]
    pub interval_secs: Option<u64>,

    /// Keep everything in memory (no database, in-process remote).
    #[arg(long, global = true)]
    pub ephemeral: bool,

    /// Print JSON instead of text.
    #[arg(long, global = true)]
    pub json: bool,

    /// Log level filter (trace, debug, info, warn, error).
    #[arg(long, global = true, default_value = "warn", env = "TASKSYNC_LOG")]
    pub log_level: String,

    /// Write logs to this file instead of stderr.
    #[arg(long, global = true)]
    pub log_file: Option<PathBuf>,
}

// ---------------------------------------------------------------------------
// Internal helpers
// ---------------------------------------------------------------------------

fn default_store_path() -> PathBuf {
    dirs::data_dir().map_or_else(
        || PathBuf::from("tasksync.db"),
        |dir| dir.join("tasksync").join("tasks.db"),
    )
}

/// Load and parse a TOML config file.
///
/// If `explicit_path` is `Some`, the file must exist (error if not).
/// If `explicit_path` is `None`, the default path is tried and missing file
/// is treated as empty config.
fn load_config_file(explicit_path: Option<&std::path::Path>) -> Result<ConfigFile, ConfigError> {
    if let Some(p) = explicit_path {
        let contents = std::fs::read_to_string(p).map_err(|e| ConfigError::ReadFile {
            path: p.to_path_buf(),
            source: e,
        })?;
        return Ok(toml::from_str(&contents)?);
    }

    let Some(config_dir) = dirs::config_dir() else {
        return Ok(ConfigFile::default());
    };
    let path = config_dir.join("tasksync").join("config.toml");

    match std::fs::read_to_string(&path) {
        Ok(contents) => Ok(toml::from_str(&contents)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(ConfigFile::default()),
        Err(e) => Err(ConfigError::ReadFile { path, source: e }),
    }
}
