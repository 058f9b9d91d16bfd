//! Configuration system for the `copresence` client.
//!
//! Supports layered configuration with the following priority (highest first):
//! 1. CLI arguments
//! 2. Environment variables (via clap `env` attribute)
//! 3. TOML config file (`~/.config/copresence/config.toml`)
//! 4. Compiled defaults
//!
//! Missing config file is not an error (defaults are used). An explicit
//! `--config` path that doesn't exist is an error.

use std::path::PathBuf;
use std::time::Duration;

use rand::Rng;

use crate::client::ClientOptions;
use crate::connection::ConnectionConfig;

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

    /// A setting required to run the client is missing.
    #[error("missing required setting: {0}")]
    Missing(&'static str),
}

// ---------------------------------------------------------------------------
// TOML file structs (all fields Option for partial overrides)
// ---------------------------------------------------------------------------

/// Top-level TOML config file structure.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ConfigFile {
    network: NetworkFileConfig,
    presence: PresenceFileConfig,
    reconnect: ReconnectFileConfig,
    sync: SyncFileConfig,
}

/// `[network]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct NetworkFileConfig {
    channel_url: Option<String>,
    api_url: Option<String>,
    token: Option<String>,
    user_id: Option<String>,
    partner_id: Option<String>,
    room_id: Option<String>,
    connect_timeout_secs: Option<u64>,
    auth_timeout_secs: Option<u64>,
    request_timeout_secs: Option<u64>,
    channel_capacity: Option<usize>,
}

/// `[presence]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct PresenceFileConfig {
    heartbeat_secs: Option<u64>,
    idle_threshold_secs: Option<u64>,
    idle_check_secs: Option<u64>,
    activity_poll_secs: Option<u64>,
    handshake_retry_secs: Option<u64>,
    handshake_attempts: Option<u32>,
}

/// `[reconnect]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ReconnectFileConfig {
    initial_delay_ms: Option<u64>,
    max_delay_ms: Option<u64>,
    max_attempts: Option<u32>,
    jitter_ms: Option<u64>,
}

/// `[sync]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct SyncFileConfig {
    dedup_window_ms: Option<u64>,
    dedup_retention_secs: Option<u64>,
}

// ---------------------------------------------------------------------------
// Resolved configuration (concrete types, all fields populated)
// ---------------------------------------------------------------------------

/// Capped exponential backoff for reconnect attempts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectConfig {
    /// Delay before the first attempt.
    pub initial_delay: Duration,
    /// Upper bound for any single delay (before jitter).
    pub max_delay: Duration,
    /// Attempts before giving up.
    pub max_attempts: u32,
    /// Maximum random jitter added to each delay.
    pub jitter: Duration,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(5),
            max_attempts: 10,
            jitter: Duration::from_millis(250),
        }
    }
}

impl ReconnectConfig {
    /// Delay before the 1-based `attempt`, without jitter.
    #[must_use]
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(16);
        self.initial_delay
            .saturating_mul(1 << shift)
            .min(self.max_delay)
    }

    /// Delay before the 1-based `attempt`, with random jitter applied.
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt);
        let jitter_ms = u64::try_from(self.jitter.as_millis()).unwrap_or(u64::MAX);
        if jitter_ms == 0 {
            return base;
        }
        base + Duration::from_millis(rand::rng().random_range(0..=jitter_ms))
    }
}

/// Presence timer settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresenceConfig {
    /// Interval between liveness pings while the session is open.
    pub heartbeat_interval: Duration,
    /// Inactivity after which the user is considered idle.
    pub idle_threshold: Duration,
    /// How often the idle condition is checked.
    pub idle_check_interval: Duration,
    /// Partner activity poll interval while the channel is down.
    pub activity_poll_interval: Duration,
    /// Wait for a `presence:ack` before resending `presence:init`.
    pub handshake_retry: Duration,
    /// Sends of one pairing handshake before it is given up.
    pub handshake_attempts: u32,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(30),
            idle_threshold: Duration::from_secs(5 * 60),
            idle_check_interval: Duration::from_secs(60),
            activity_poll_interval: Duration::from_secs(15),
            handshake_retry: Duration::from_secs(5),
            handshake_attempts: 4,
        }
    }
}

/// Room synchronization settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncConfig {
    /// Two actions on the same target by the same actor closer than this
    /// are the same logical action.
    pub dedup_window: Duration,
    /// How long recent actions are remembered.
    pub dedup_retention: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            dedup_window: Duration::from_secs(5),
            dedup_retention: Duration::from_secs(60),
        }
    }
}

/// Fully resolved client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    // -- Network --
    /// Push channel WebSocket URL.
    pub channel_url: Option<String>,
    /// Base URL of the pull surface.
    pub api_url: Option<String>,
    /// Session bearer token.
    pub token: Option<String>,
    /// Expected local identity; checked against the one the server binds.
    pub user_id: Option<String>,
    /// Counterpart to pair with on startup.
    pub partner_id: Option<String>,
    /// Room to join on startup.
    pub room_id: Option<String>,
    /// Timeout for establishing the push channel.
    pub connect_timeout: Duration,
    /// Timeout for the session handshake answer.
    pub auth_timeout: Duration,
    /// Timeout for each pull request.
    pub request_timeout: Duration,
    /// Capacity of command/event mpsc channels.
    pub channel_capacity: usize,

    /// Presence timers.
    pub presence: PresenceConfig,
    /// Reconnect backoff.
    pub reconnect: ReconnectConfig,
    /// Room synchronization.
    pub sync: SyncConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            channel_url: None,
            api_url: None,
            token: None,
            user_id: None,
            partner_id: None,
            room_id: None,
            connect_timeout: Duration::from_secs(10),
            auth_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(10),
            channel_capacity: 256,
            presence: PresenceConfig::default(),
            reconnect: ReconnectConfig::default(),
            sync: SyncConfig::default(),
        }
    }
}

impl ClientConfig {
    /// Load configuration by merging CLI args, env vars, and a TOML file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the explicit config file cannot be read
    /// or parsed.
    pub fn load(cli: &CliArgs) -> Result<Self, ConfigError> {
        let file = load_config_file(cli.config.as_deref())?;
        Ok(Self::resolve(cli, &file))
    }

    /// Resolve a `ClientConfig` from CLI args and a parsed config file.
    ///
    /// Priority: CLI > file > default.
    fn resolve(cli: &CliArgs, file: &ConfigFile) -> Self {
        let defaults = Self::default();
        let net = &file.network;
        let presence = &file.presence;
        let reconnect = &file.reconnect;

        Self {
            channel_url: cli.channel_url.clone().or_else(|| net.channel_url.clone()),
            api_url: cli.api_url.clone().or_else(|| net.api_url.clone()),
            token: cli.token.clone().or_else(|| net.token.clone()),
            user_id: cli.user_id.clone().or_else(|| net.user_id.clone()),
            partner_id: cli.partner_id.clone().or_else(|| net.partner_id.clone()),
            room_id: cli.room_id.clone().or_else(|| net.room_id.clone()),
            connect_timeout: net
                .connect_timeout_secs
                .map_or(defaults.connect_timeout, Duration::from_secs),
            auth_timeout: net
                .auth_timeout_secs
                .map_or(defaults.auth_timeout, Duration::from_secs),
            request_timeout: net
                .request_timeout_secs
                .map_or(defaults.request_timeout, Duration::from_secs),
            channel_capacity: net.channel_capacity.unwrap_or(defaults.channel_capacity),
            presence: PresenceConfig {
                heartbeat_interval: presence
                    .heartbeat_secs
                    .map_or(defaults.presence.heartbeat_interval, Duration::from_secs),
                idle_threshold: presence
                    .idle_threshold_secs
                    .map_or(defaults.presence.idle_threshold, Duration::from_secs),
                idle_check_interval: presence
                    .idle_check_secs
                    .map_or(defaults.presence.idle_check_interval, Duration::from_secs),
                activity_poll_interval: presence
                    .activity_poll_secs
                    .map_or(defaults.presence.activity_poll_interval, Duration::from_secs),
                handshake_retry: presence
                    .handshake_retry_secs
                    .map_or(defaults.presence.handshake_retry, Duration::from_secs),
                handshake_attempts: presence
                    .handshake_attempts
                    .unwrap_or(defaults.presence.handshake_attempts),
            },
            reconnect: ReconnectConfig {
                initial_delay: reconnect
                    .initial_delay_ms
                    .map_or(defaults.reconnect.initial_delay, Duration::from_millis),
                max_delay: reconnect
                    .max_delay_ms
                    .map_or(defaults.reconnect.max_delay, Duration::from_millis),
                max_attempts: reconnect
                    .max_attempts
                    .unwrap_or(defaults.reconnect.max_attempts),
                jitter: reconnect
                    .jitter_ms
                    .map_or(defaults.reconnect.jitter, Duration::from_millis),
            },
            sync: SyncConfig {
                dedup_window: file
                    .sync
                    .dedup_window_ms
                    .map_or(defaults.sync.dedup_window, Duration::from_millis),
                dedup_retention: file
                    .sync
                    .dedup_retention_secs
                    .map_or(defaults.sync.dedup_retention, Duration::from_secs),
            },
        }
    }

    /// Connection manager settings derived from this configuration.
    #[must_use]
    pub fn connection_config(&self) -> ConnectionConfig {
        ConnectionConfig {
            connect_timeout: self.connect_timeout,
            channel_capacity: self.channel_capacity,
            reconnect: self.reconnect.clone(),
        }
    }

    /// Client actor settings derived from this configuration.
    #[must_use]
    pub fn client_options(&self) -> ClientOptions {
        ClientOptions {
            presence: self.presence.clone(),
            sync: self.sync.clone(),
            channel_capacity: self.channel_capacity,
        }
    }

    /// Return the session token, or an error if none was configured.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Missing`] when no token is set.
    pub fn require_token(&self) -> Result<&str, ConfigError> {
        self.token
            .as_deref()
            .filter(|t| !t.is_empty())
            .ok_or(ConfigError::Missing("token"))
    }
}

/// CLI arguments parsed by clap.
#[derive(clap::Parser, Debug, Default)]
#[command(version, about = "Live presence and room-state sync client")]
pub struct CliArgs {
    /// WebSocket URL of the push channel.
    #[arg(long, env = "COPRESENCE_CHANNEL_URL")]
    pub channel_url: Option<String>,

    /// Base URL of the room API.
    #[arg(long, env = "COPRESENCE_API_URL")]
    pub api_url: Option<String>,

    /// Session bearer token.
    #[arg(long, env = "COPRESENCE_TOKEN", hide_env_values = true)]
    pub token: Option<String>,

    /// Expected local user identity.
    #[arg(long, env = "COPRESENCE_USER")]
    pub user_id: Option<String>,

    /// Counterpart to pair with.
    #[arg(long, env = "COPRESENCE_PARTNER")]
    pub partner_id: Option<String>,

    /// Room to join.
    #[arg(long, env = "COPRESENCE_ROOM")]
    pub room_id: Option<String>,

    /// Path to config file (default: `~/.config/copresence/config.toml`).
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Log level filter (trace, debug, info, warn, error).
    #[arg(long, default_value = "info", env = "COPRESENCE_LOG")]
    pub log_level: String,

    /// Path to log file (default: `$TMPDIR/copresence.log`).
    #[arg(long)]
    pub log_file: Option<PathBuf>,
}

// ---------------------------------------------------------------------------
// Internal helpers
// ---------------------------------------------------------------------------

/// Load and parse a TOML config file.
///
/// If `explicit_path` is `Some`, the file must exist (error if not).
/// If `explicit_path` is `None`, the default path is tried and missing file
/// is treated as empty config.
fn load_config_file(explicit_path: Option<&std::path::Path>) -> Result<ConfigFile, ConfigError> {
    let path = if let Some(p) = explicit_path {
        let contents = std::fs::read_to_string(p).map_err(|e| ConfigError::ReadFile {
            path: p.to_path_buf(),
            source: e,
        })?;
        return Ok(toml::from_str(&contents)?);
    } else {
        let Some(config_dir) = dirs::config_dir() else {
            return Ok(ConfigFile::default());
        };
        config_dir.join("copresence").join("config.toml")
    };

    match std::fs::read_to_string(&path) {
        Ok(contents) => Ok(toml::from_str(&contents)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(ConfigFile::default()),
        Err(e) => Err(ConfigError::ReadFile { path, source: e }),
    }
}
