//! Configuration system for loglink.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $LOGLINK_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/loglink/config.toml
//!   3. ~/.config/loglink/config.toml

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::frame::MAX_FRAME_PAYLOAD;
use crate::wire::{DEFAULT_CHUNK_CEILING, DEFAULT_MTU, NOTIFY_OVERHEAD};

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LoglinkConfig {
    pub storage: StorageConfig,
    pub notify: NotifyConfig,
    pub serial: SerialConfig,
    pub trigger: TriggerConfig,
    pub bridge: BridgeConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory the responder resolves requested names against.
    pub log_root: PathBuf,
    /// Directory the requester writes received logs into.
    pub inbox_path: PathBuf,
    /// Name requested when none is given.
    pub default_log_name: String,
}

/// Best-effort profile over the notification transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NotifyConfig {
    /// Upper bound on chunk payload.
    pub chunk_ceiling: u16,
    /// Transport header bytes charged against the MTU.
    pub overhead_bytes: u16,
    /// MTU assumed until the transport reports a negotiated one.
    pub mtu: u16,
    /// Pump delay between chunks while a session is active.
    pub active_interval_ms: u64,
    /// Pump poll interval while idle.
    pub idle_interval_ms: u64,
    /// Mailbox depth of each session actor.
    pub mailbox_depth: usize,
}

/// Acknowledged profile over the serial link.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialConfig {
    /// Serial device node. Line settings are configured outside loglink.
    pub device: PathBuf,
    /// DATA frame payload size.
    pub chunk_size: usize,
    pub ack_timeout_ms: u64,
    /// Total transmissions per frame, including the first.
    pub max_attempts: u32,
    pub commit_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TriggerConfig {
    pub queue_depth: usize,
    /// Presses closer together than this are treated as bounce.
    pub debounce_ms: u64,
}

/// One-way relay of received logs to the data host.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Serial device the relay writes to, or the collector reads from.
    pub device: PathBuf,
    /// A relayed log with no frame for this long is thrown away.
    pub idle_timeout_ms: u64,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            log_root: data_dir().join("logs"),
            inbox_path: data_dir().join("inbox"),
            default_log_name: "gps_points.csv".to_string(),
        }
    }
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            chunk_ceiling: DEFAULT_CHUNK_CEILING,
            overhead_bytes: NOTIFY_OVERHEAD,
            mtu: DEFAULT_MTU,
            active_interval_ms: 10,
            idle_interval_ms: 50,
            mailbox_depth: 32,
        }
    }
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            device: PathBuf::from("/dev/ttyS0"),
            chunk_size: MAX_FRAME_PAYLOAD,
            ack_timeout_ms: 500,
            max_attempts: 5,
            commit_timeout_ms: 2000,
        }
    }
}

impl Default for TriggerConfig {
    fn default() -> Self {
        Self {
            queue_depth: 4,
            debounce_ms: 200,
        }
    }
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            device: PathBuf::from("/dev/ttyS1"),
            idle_timeout_ms: 10_000,
        }
    }
}

impl NotifyConfig {
    pub fn active_interval(&self) -> Duration {
        Duration::from_millis(self.active_interval_ms)
    }

    pub fn idle_interval(&self) -> Duration {
        Duration::from_millis(self.idle_interval_ms)
    }
}

impl SerialConfig {
    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }

    pub fn commit_timeout(&self) -> Duration {
        Duration::from_millis(self.commit_timeout_ms)
    }
}

impl BridgeConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }
}

impl TriggerConfig {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".config"))
        .join("loglink")
}

pub fn data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".local").join("share"))
        .join("loglink")
}

fn dirs_or_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
    #[error("failed to write {0}: {1}")]
    WriteFailed(PathBuf, std::io::Error),
    #[error("failed to serialize: {0}")]
    SerializeFailed(toml::ser::Error),
    #[error("invalid setting {0}: {1}")]
    Invalid(&'static str, String),
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl LoglinkConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::file_path();
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(&path)
                .map_err(|e| ConfigError::ReadFailed(path.clone(), e))?;
            Self::from_toml(&text).map_err(|e| ConfigError::ParseFailed(path.clone(), e))?
        } else {
            LoglinkConfig::default()
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("LOGLINK_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Write default config if none exists. Returns the path.
    pub fn write_default_if_missing() -> Result<PathBuf, ConfigError> {
        let path = Self::file_path();
        if !path.exists() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
            }
            let text = toml::to_string_pretty(&LoglinkConfig::default())
                .map_err(ConfigError::SerializeFailed)?;
            std::fs::write(&path, text).map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
        }
        Ok(path)
    }

    /// Reject settings the protocol cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.serial.chunk_size == 0 || self.serial.chunk_size > MAX_FRAME_PAYLOAD {
            return Err(ConfigError::Invalid(
                "serial.chunk_size",
                format!("must be 1..={MAX_FRAME_PAYLOAD}, got {}", self.serial.chunk_size),
            ));
        }
        if self.serial.max_attempts == 0 {
            return Err(ConfigError::Invalid("serial.max_attempts", "must be at least 1".into()));
        }
        if self.trigger.queue_depth == 0 {
            return Err(ConfigError::Invalid("trigger.queue_depth", "must be at least 1".into()));
        }
        if self.notify.mailbox_depth == 0 {
            return Err(ConfigError::Invalid("notify.mailbox_depth", "must be at least 1".into()));
        }
        Ok(())
    }

    /// Apply LOGLINK_* env var overrides.
    fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(v) = lookup("LOGLINK_STORAGE__LOG_ROOT") {
            self.storage.log_root = PathBuf::from(v);
        }
        if let Some(v) = lookup("LOGLINK_STORAGE__INBOX_PATH") {
            self.storage.inbox_path = PathBuf::from(v);
        }
        if let Some(v) = lookup("LOGLINK_STORAGE__DEFAULT_LOG_NAME") {
            self.storage.default_log_name = v;
        }
        if let Some(p) = lookup("LOGLINK_NOTIFY__MTU").and_then(|v| v.parse().ok()) {
            self.notify.mtu = p;
        }
        if let Some(p) = lookup("LOGLINK_NOTIFY__CHUNK_CEILING").and_then(|v| v.parse().ok()) {
            self.notify.chunk_ceiling = p;
        }
        if let Some(v) = lookup("LOGLINK_SERIAL__DEVICE") {
            self.serial.device = PathBuf::from(v);
        }
        if let Some(p) = lookup("LOGLINK_SERIAL__ACK_TIMEOUT_MS").and_then(|v| v.parse().ok()) {
            self.serial.ack_timeout_ms = p;
        }
        if let Some(p) = lookup("LOGLINK_SERIAL__MAX_ATTEMPTS").and_then(|v| v.parse().ok()) {
            self.serial.max_attempts = p;
        }
        if let Some(v) = lookup("LOGLINK_BRIDGE__DEVICE") {
            self.bridge.device = PathBuf::from(v);
        }
        if let Some(p) = lookup("LOGLINK_TRIGGER__DEBOUNCE_MS").and_then(|v| v.parse().ok()) {
            self.trigger.debounce_ms = p;
        }
    }
}
