use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{error, info, warn};

use crate::ws::codec::CodecKind;
use crate::ws::hub::HubSettings;
use crate::ws::pumps::PumpSettings;

const MIN_IDLE_TIMEOUT_SECS: u64 = 2;

/// Application configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// Server host address
    #[serde(default = "default_host")]
    pub host: String,

    /// Server port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Environment (dev, staging, prod)
    #[serde(default = "default_environment")]
    pub environment: String,

    /// CORS allowed origins (comma separated)
    pub cors_origins: Option<String>,

    /// Log level
    #[serde(default = "default_log_level")]
    pub log_level: String,

    // Cloud service identifiers
    #[serde(default = "default_service_name")]
    pub cloud_service_name: String,

    /// JWT secret key
    pub cloud_auth_jwt_secret: Option<String>,

    /// Database URL
    pub db_url: Option<String>,

    /// Base URL of the app service answering document access checks
    pub app_service_url: Option<String>,

    /// Secret used to sign guest share links
    pub share_link_secret: Option<String>,

    /// Origins allowed to open a WebSocket (comma separated, empty or `*` allows all)
    #[serde(default)]
    pub ws_allowed_origins: String,

    /// Payload codec relayed by the hubs (`yjs` or `json`)
    #[serde(default = "default_payload_codec")]
    pub ws_payload_codec: String,

    #[serde(default = "default_ping_interval_secs")]
    pub ws_ping_interval_secs: u64,

    #[serde(default = "default_idle_timeout_secs")]
    pub ws_idle_timeout_secs: u64,

    #[serde(default = "default_write_timeout_secs")]
    pub ws_write_timeout_secs: u64,

    #[serde(default = "default_max_frame_bytes")]
    pub ws_max_frame_bytes: usize,

    #[serde(default = "default_client_queue_size")]
    pub ws_client_queue_size: usize,

    /// How long a fresh connection may wait for its hub to accept it
    #[serde(default = "default_register_timeout_secs")]
    pub ws_register_timeout_secs: u64,

    #[serde(default = "default_persist_interval_secs")]
    pub hub_persist_interval_secs: u64,

    #[serde(default = "default_hub_channel_size")]
    pub hub_channel_size: usize,

    #[serde(default = "default_access_cache_ttl_secs")]
    pub access_cache_ttl_secs: u64,
}

impl Config {
    /// Load configuration from environment variables or app.env file
    pub fn load() -> Result<Self, ConfigError> {
        // Try to load from app.env file first
        if std::path::Path::new("app.env").exists() {
            dotenvy::from_filename("app.env").ok();
        } else {
            // Fallback to .env file
            dotenvy::dotenv().ok();
        }

        // Load from environment variables using envy
        match envy::from_env::<Config>() {
            Ok(config) => {
                info!("✅ Configuration loaded successfully");
                Ok(config.validate())
            }
            Err(e) => {
                error!("❌ Failed to load configuration: {}", e);
                Err(ConfigError::EnvError(e))
            }
        }
    }

    /// Fix up timing values that would break the keepalive contract.
    ///
    /// The ping interval must stay strictly below the idle-read timeout,
    /// otherwise healthy clients get dropped between two pings.
    pub fn validate(mut self) -> Self {
        if self.ws_idle_timeout_secs == 0 {
            warn!("WS_IDLE_TIMEOUT_SECS must be positive, using {}", default_idle_timeout_secs());
            self.ws_idle_timeout_secs = default_idle_timeout_secs();
        } else if self.ws_idle_timeout_secs < MIN_IDLE_TIMEOUT_SECS {
            // A whole-second ping cannot fit below a one-second idle timeout
            warn!(
                "WS_IDLE_TIMEOUT_SECS {} is too short, using {}",
                self.ws_idle_timeout_secs, MIN_IDLE_TIMEOUT_SECS
            );
            self.ws_idle_timeout_secs = MIN_IDLE_TIMEOUT_SECS;
        }
        if self.ws_ping_interval_secs == 0 || self.ws_ping_interval_secs >= self.ws_idle_timeout_secs {
            let ping = (self.ws_idle_timeout_secs * 9 / 10).max(1);
            warn!(
                "Ping interval {}s is not below idle timeout {}s, using {}s",
                self.ws_ping_interval_secs, self.ws_idle_timeout_secs, ping
            );
            self.ws_ping_interval_secs = ping;
        }
        if self.ws_client_queue_size == 0 {
            self.ws_client_queue_size = default_client_queue_size();
        }
        if self.hub_channel_size == 0 {
            self.hub_channel_size = default_hub_channel_size();
        }
        if self.hub_persist_interval_secs == 0 {
            self.hub_persist_interval_secs = default_persist_interval_secs();
        }
        if CodecKind::parse(&self.ws_payload_codec).is_none() {
            warn!("Unknown payload codec '{}', using yjs", self.ws_payload_codec);
            self.ws_payload_codec = default_payload_codec();
        }
        self
    }

    /// Get the full server address
    pub fn server_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Check if running in development mode
    pub fn is_development(&self) -> bool {
        self.environment.to_lowercase() == "dev" || self.environment.to_lowercase() == "development"
    }

    pub fn codec_kind(&self) -> CodecKind {
        CodecKind::parse(&self.ws_payload_codec).unwrap_or(CodecKind::Yjs)
    }

    pub fn allowed_origins(&self) -> Vec<String> {
        split_list(&self.ws_allowed_origins)
    }

    pub fn cors_origin_list(&self) -> Vec<String> {
        self.cors_origins.as_deref().map(split_list).unwrap_or_default()
    }

    pub fn register_timeout(&self) -> Duration {
        Duration::from_secs(self.ws_register_timeout_secs)
    }

    pub fn hub_settings(&self) -> HubSettings {
        HubSettings {
            persist_interval: Duration::from_secs(self.hub_persist_interval_secs),
            channel_size: self.hub_channel_size,
        }
    }

    pub fn pump_settings(&self) -> PumpSettings {
        PumpSettings {
            ping_interval: Duration::from_secs(self.ws_ping_interval_secs),
            idle_timeout: Duration::from_secs(self.ws_idle_timeout_secs),
            write_timeout: Duration::from_secs(self.ws_write_timeout_secs),
            max_frame_bytes: self.ws_max_frame_bytes,
            queue_size: self.ws_client_queue_size,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            environment: default_environment(),
            log_level: default_log_level(),
            cors_origins: None,
            cloud_service_name: default_service_name(),
            cloud_auth_jwt_secret: None,
            db_url: None,
            app_service_url: None,
            share_link_secret: None,
            ws_allowed_origins: String::new(),
            ws_payload_codec: default_payload_codec(),
            ws_ping_interval_secs: default_ping_interval_secs(),
            ws_idle_timeout_secs: default_idle_timeout_secs(),
            ws_write_timeout_secs: default_write_timeout_secs(),
            ws_max_frame_bytes: default_max_frame_bytes(),
            ws_client_queue_size: default_client_queue_size(),
            ws_register_timeout_secs: default_register_timeout_secs(),
            hub_persist_interval_secs: default_persist_interval_secs(),
            hub_channel_size: default_hub_channel_size(),
            access_cache_ttl_secs: default_access_cache_ttl_secs(),
        }
    }
}

#[derive(Debug)]
pub enum ConfigError {
    EnvError(envy::Error),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::EnvError(e) => write!(f, "Environment variable error: {}", e),
        }
    }
}

impl std::error::Error for ConfigError {}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

// Default value functions
fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    3000
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_service_name() -> String {
    "colabri-realtime".to_string()
}

fn default_environment() -> String {
    "development".to_string()
}

fn default_payload_codec() -> String {
    "yjs".to_string()
}

fn default_ping_interval_secs() -> u64 {
    30
}

fn default_idle_timeout_secs() -> u64 {
    60
}

fn default_write_timeout_secs() -> u64 {
    10
}

fn default_max_frame_bytes() -> usize {
    1024 * 1024
}

fn default_client_queue_size() -> usize {
    128
}

fn default_register_timeout_secs() -> u64 {
    10
}

fn default_persist_interval_secs() -> u64 {
    60
}

fn default_hub_channel_size() -> usize {
    256
}

fn default_access_cache_ttl_secs() -> u64 {
    60
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ping_interval_is_clamped_below_idle_timeout() {
        let config = Config {
            ws_ping_interval_secs: 90,
            ws_idle_timeout_secs: 60,
            ..Config::default()
        }
        .validate();
        assert_eq!(config.ws_ping_interval_secs, 54);
        assert!(config.pump_settings().ping_interval < config.pump_settings().idle_timeout);
    }

    #[test]
    fn one_second_idle_timeout_still_leaves_room_for_a_ping() {
        let config = Config {
            ws_ping_interval_secs: 5,
            ws_idle_timeout_secs: 1,
            ..Config::default()
        }
        .validate();
        assert_eq!(config.ws_idle_timeout_secs, 2);
        assert_eq!(config.ws_ping_interval_secs, 1);
        assert!(config.pump_settings().ping_interval < config.pump_settings().idle_timeout);
    }

    #[test]
    fn defaults_match_the_wire_contract() {
        let config = Config::default().validate();
        let pumps = config.pump_settings();
        assert_eq!(pumps.ping_interval, Duration::from_secs(30));
        assert_eq!(pumps.idle_timeout, Duration::from_secs(60));
        assert_eq!(pumps.write_timeout, Duration::from_secs(10));
        assert_eq!(pumps.queue_size, 128);
        assert_eq!(config.hub_settings().persist_interval, Duration::from_secs(60));
        assert_eq!(config.codec_kind(), CodecKind::Yjs);
    }

    #[test]
    fn unknown_codec_falls_back_to_yjs() {
        let config = Config {
            ws_payload_codec: "protobuf".to_string(),
            ..Config::default()
        }
        .validate();
        assert_eq!(config.ws_payload_codec, "yjs");
    }

    #[test]
    fn origin_lists_are_trimmed() {
        let config = Config {
            ws_allowed_origins: " https://a.example , ,https://b.example".to_string(),
            ..Config::default()
        };
        assert_eq!(config.allowed_origins(), vec!["https://a.example", "https://b.example"]);
    }
}
