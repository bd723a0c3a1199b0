use config::{Config as ConfigBuilder, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::logging::{parse_level, LogFormat};
use crate::media::MediaConstraints;

/// Client configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub signaling: SignalingConfig,
    pub stream: StreamConfig,
    pub roster: RosterConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SignalingConfig {
    /// WebSocket URL of the media-routing server
    pub url: String,
    pub connect_timeout_seconds: u64,
    /// Bound on each acknowledgment round trip
    pub request_timeout_seconds: u64,
    /// How long to wait for the server's `joined` push
    pub join_timeout_seconds: u64,
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            url: "ws://localhost:4000/signaling".to_string(),
            connect_timeout_seconds: 5,
            request_timeout_seconds: 10,
            join_timeout_seconds: 5,
        }
    }
}

impl SignalingConfig {
    #[must_use]
    pub const fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_seconds)
    }

    #[must_use]
    pub const fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_seconds)
    }

    #[must_use]
    pub const fn join_timeout(&self) -> Duration {
        Duration::from_secs(self.join_timeout_seconds)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// Ask the server for a TCP-only transport
    pub force_tcp: bool,
    pub audio: bool,
    pub video: bool,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            force_tcp: false,
            audio: true,
            video: true,
        }
    }
}

impl StreamConfig {
    #[must_use]
    pub const fn constraints(&self) -> MediaConstraints {
        MediaConstraints {
            audio: self.audio,
            video: self.video,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RosterConfig {
    pub enabled: bool,
    /// Base URL of the roster HTTP endpoints
    pub base_url: String,
    pub user_name: String,
    pub user_id: String,
    pub request_timeout_seconds: u64,
}

impl Default for RosterConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            base_url: "http://localhost:4000".to_string(),
            user_name: String::new(),
            user_id: String::new(),
            request_timeout_seconds: 10,
        }
    }
}

impl RosterConfig {
    #[must_use]
    pub const fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_seconds)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String, // "json" or "pretty"
    pub file_path: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            file_path: None,
        }
    }
}

impl Config {
    /// Load configuration from multiple sources with priority:
    /// 1. Environment variables (highest priority)
    /// 2. Config file (if provided)
    /// 3. Defaults (lowest priority)
    pub fn load(config_file: Option<&str>) -> Result<Self, ConfigError> {
        let mut builder = ConfigBuilder::builder();

        if let Some(path) = config_file {
            if Path::new(path).exists() {
                builder = builder.add_source(File::with_name(path));
            }
        }

        // LIVECAST_SIGNALING__URL, LIVECAST_STREAM__FORCE_TCP, ...
        builder = builder.add_source(
            Environment::with_prefix("LIVECAST")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder.build()?;
        config.try_deserialize()
    }

    /// Load from environment variables only
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(None)
    }

    /// Load from file path
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        Self::load(Some(path))
    }

    /// Check for misconfigurations, collecting every problem found.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        match url::Url::parse(&self.signaling.url) {
            Ok(url) if matches!(url.scheme(), "ws" | "wss") => {}
            Ok(url) => errors.push(format!(
                "signaling.url must use ws or wss, got '{}'",
                url.scheme()
            )),
            Err(e) => errors.push(format!("signaling.url is invalid: {e}")),
        }
        if self.signaling.request_timeout_seconds == 0 {
            errors.push("signaling.request_timeout_seconds must be positive".to_string());
        }
        if self.signaling.connect_timeout_seconds == 0 {
            errors.push("signaling.connect_timeout_seconds must be positive".to_string());
        }

        if !self.stream.audio && !self.stream.video {
            errors.push("stream: at least one of audio or video must be enabled".to_string());
        }

        if self.roster.enabled {
            if let Err(e) = url::Url::parse(&self.roster.base_url) {
                errors.push(format!("roster.base_url is invalid: {e}"));
            }
            if self.roster.user_name.trim().is_empty() {
                errors.push("roster.user_name is required when the roster is enabled".to_string());
            }
        }

        if self.logging.format.parse::<LogFormat>().is_err() {
            errors.push(format!(
                "logging.format must be 'json' or 'pretty', got '{}'",
                self.logging.format
            ));
        }
        if let Err(e) = parse_level(&self.logging.level) {
            errors.push(format!("logging.level: {e}"));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}
