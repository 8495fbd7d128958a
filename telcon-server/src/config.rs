//! Configuration for the console server.

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use telcon_core::{ReadErrorPolicy, SessionConfig, TelconError};

/// Top-level configuration loaded from a TOML file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Listening sockets.
    pub network: NetworkConfig,
    /// Command session behaviour.
    pub session: SessionSettings,
    /// Log mirroring.
    pub console: ConsoleSettings,
    /// Values reported by the demo commands.
    pub device: DeviceConfig,
    /// Logging settings.
    pub logging: LoggingConfig,
}

/// Network configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Addresses to listen on, one acceptor each. Use `0.0.0.0:<port>` for
    /// IPv4 and `[::]:<port>` for IPv6.
    pub listen: Vec<String>,
    /// Start a fresh acceptor once a session ends.
    pub restart: bool,
}

/// What to do when a read from the client fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReadErrorAction {
    Fatal,
    Retry,
}

/// Session settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSettings {
    /// Longest accepted command line in bytes.
    pub max_line_len: usize,
    /// Prompt written after each command while the console runs.
    pub prompt: String,
    /// `"fatal"` ends the session on a read error; `"retry"` waits and reads again.
    pub on_read_error: ReadErrorAction,
    /// Delay between read retries in milliseconds.
    pub retry_backoff_ms: u64,
    /// Retries after consecutive read errors with `"retry"` (0 = unlimited).
    pub max_read_retries: u32,
}

/// Log mirroring settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsoleSettings {
    /// Longest log record copied to the client, in bytes.
    pub log_buffer_size: usize,
    /// Chunks queued for a slow client before new ones are dropped.
    pub outbound_queue_len: usize,
}

/// Device identity reported by the demo commands.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Station MAC address printed by `print_mac`.
    pub mac: String,
}

/// Logging settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level: "trace", "debug", "info", "warn", "error".
    pub level: String,
}

// ── Defaults ─────────────────────────────────────────────────────

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            listen: vec![format!("0.0.0.0:{}", telcon_core::DEFAULT_PORT)],
            restart: false,
        }
    }
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            max_line_len: telcon_core::DEFAULT_MAX_LINE_LEN,
            prompt: telcon_core::DEFAULT_PROMPT.into(),
            on_read_error: ReadErrorAction::Fatal,
            retry_backoff_ms: 100,
            max_read_retries: 0,
        }
    }
}

impl Default for ConsoleSettings {
    fn default() -> Self {
        Self {
            log_buffer_size: telcon_core::DEFAULT_LOG_BUFFER_SIZE,
            outbound_queue_len: telcon_core::DEFAULT_OUTBOUND_QUEUE_LEN,
        }
    }
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            mac: "00:11:22:33:44:55".into(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
        }
    }
}

// ── Loading ──────────────────────────────────────────────────────

impl ServerConfig {
    /// Load configuration from a TOML file, falling back to defaults.
    pub fn load(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(contents) => toml::from_str(&contents).unwrap_or_else(|e| {
                tracing::warn!("invalid config {}: {e}; using defaults", path.display());
                Self::default()
            }),
            Err(_) => {
                tracing::info!("no config at {}; using defaults", path.display());
                Self::default()
            }
        }
    }

    /// Replace the port of every listen address.
    pub fn override_port(&mut self, port: u16) -> Result<(), TelconError> {
        let addrs = self.listen_addrs()?;
        self.network.listen = addrs
            .into_iter()
            .map(|a| SocketAddr::new(a.ip(), port).to_string())
            .collect();
        Ok(())
    }

    /// Parsed listen addresses.
    pub fn listen_addrs(&self) -> Result<Vec<SocketAddr>, TelconError> {
        if self.network.listen.is_empty() {
            return Err(TelconError::InvalidConfig("no listen address configured".into()));
        }
        self.network
            .listen
            .iter()
            .map(|s| {
                s.parse()
                    .map_err(|e| TelconError::InvalidConfig(format!("listen address {s:?}: {e}")))
            })
            .collect()
    }

    /// Convert session settings into a validated `SessionConfig`.
    pub fn to_session_config(&self) -> Result<SessionConfig, TelconError> {
        let read_errors = match self.session.on_read_error {
            ReadErrorAction::Fatal => ReadErrorPolicy::Fatal,
            ReadErrorAction::Retry => ReadErrorPolicy::Retry {
                backoff: Duration::from_millis(self.session.retry_backoff_ms),
                max_retries: self.session.max_read_retries,
            },
        };
        let cfg = SessionConfig {
            max_line_len: self.session.max_line_len,
            prompt: self.session.prompt.clone().into_bytes().into(),
            log_buffer_size: self.console.log_buffer_size,
            outbound_queue_len: self.console.outbound_queue_len,
            read_errors,
        };
        cfg.validate()?;
        Ok(cfg)
    }
}

// ── Tests ────────────────────────────────────────────────────────
