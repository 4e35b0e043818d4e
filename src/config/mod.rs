//! Configuration management for roomcall

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Signaling channel configuration
    #[serde(default)]
    pub signaling: SignalingConfig,

    /// Relay server configuration (`--serve`)
    #[serde(default)]
    pub relay: RelayConfig,

    /// Local media and ICE configuration
    #[serde(default)]
    pub media: MediaConfig,

    /// Transcript analyzer configuration
    #[serde(default)]
    pub analyzer: AnalyzerConfig,

    /// Display name persistence
    #[serde(default)]
    pub profile: ProfileConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalingConfig {
    /// Broadcast channel shared by every participant
    #[serde(default = "default_channel")]
    pub channel: String,

    /// WebSocket relay URL
    #[serde(default = "default_relay_url")]
    pub relay_url: String,

    /// Room joined at start-up when a display name is known
    #[serde(default = "default_room")]
    pub default_room: String,
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            channel: default_channel(),
            relay_url: default_relay_url(),
            default_room: default_room(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Bind address
    #[serde(default = "default_relay_host")]
    pub host: String,

    /// Bind port
    #[serde(default = "default_relay_port")]
    pub port: u16,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            host: default_relay_host(),
            port: default_relay_port(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IceServerConfig {
    pub urls: Vec<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub credential: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaConfig {
    /// Capture audio
    #[serde(default = "default_true")]
    pub audio: bool,

    /// Capture video
    #[serde(default = "default_true")]
    pub video: bool,

    /// ICE servers handed to every transport session
    #[serde(default = "default_ice_servers")]
    pub ice_servers: Vec<IceServerConfig>,
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            audio: true,
            video: true,
            ice_servers: default_ice_servers(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalyzerConfig {
    /// Enable the remote analyzer; defaults apply otherwise
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Model name
    #[serde(default = "default_model")]
    pub model: String,

    /// API base URL
    #[serde(default = "default_endpoint")]
    pub endpoint: String,

    /// Environment variable holding the API key
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,

    /// Request timeout in seconds
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            model: default_model(),
            endpoint: default_endpoint(),
            api_key_env: default_api_key_env(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProfileConfig {
    /// Profile file holding the display name
    #[serde(default = "default_profile_path")]
    pub path: PathBuf,
}

impl Default for ProfileConfig {
    fn default() -> Self {
        Self {
            path: default_profile_path(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_channel() -> String {
    "roomcall_signaling".to_string()
}

fn default_relay_url() -> String {
    "ws://127.0.0.1:8787".to_string()
}

fn default_room() -> String {
    "STREAM-ALPHA".to_string()
}

fn default_relay_host() -> String {
    "127.0.0.1".to_string()
}

fn default_relay_port() -> u16 {
    8787
}

fn default_true() -> bool {
    true
}

fn default_ice_servers() -> Vec<IceServerConfig> {
    ["stun:stun.l.google.com:19302", "stun:stun1.l.google.com:19302"]
        .iter()
        .map(|url| IceServerConfig {
            urls: vec![url.to_string()],
            username: None,
            credential: None,
        })
        .collect()
}

fn default_model() -> String {
    "gemini-2.0-flash".to_string()
}

fn default_endpoint() -> String {
    "https://generativelanguage.googleapis.com/v1beta".to_string()
}

fn default_api_key_env() -> String {
    "GEMINI_API_KEY".to_string()
}

fn default_timeout_secs() -> u64 {
    20
}

fn default_profile_path() -> PathBuf {
    PathBuf::from("roomcall-profile.toml")
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    /// Load configuration from TOML file. A missing file yields defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Config::default());
        }

        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.signaling.channel.trim().is_empty() {
            return Err(ConfigError::Invalid("Signaling channel must not be empty".into()));
        }

        if self.signaling.default_room.trim().is_empty() {
            return Err(ConfigError::Invalid("Default room must not be empty".into()));
        }

        let relay_url = self.signaling.relay_url.as_str();
        if !relay_url.starts_with("ws://") && !relay_url.starts_with("wss://") {
            return Err(ConfigError::Invalid("Relay URL must start with ws:// or wss://".into()));
        }

        if !self.media.audio && !self.media.video {
            return Err(ConfigError::Invalid("At least one of audio or video must be enabled".into()));
        }

        if self.media.ice_servers.iter().any(|server| server.urls.is_empty()) {
            return Err(ConfigError::Invalid("ICE server entries need at least one URL".into()));
        }

        if self.analyzer.timeout_secs == 0 {
            return Err(ConfigError::Invalid("Analyzer timeout must be non-zero".into()));
        }

        Ok(())
    }
}
