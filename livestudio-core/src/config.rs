use config::{Config as ConfigBuilder, ConfigError, Environment, File};
use livestudio_sfu::{ChannelOptions, Role, RoomId, SessionConfig, UserId};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub logging: LoggingConfig,
    pub signaling: SignalingConfig,
    pub studio: StudioConfig,
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

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SignalingConfig {
    pub request_timeout_ms: u64,
    pub event_buffer: usize,
    pub max_frame_len: usize,
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: 10_000,
            event_buffer: 256,
            max_frame_len: 1024 * 1024,
        }
    }
}

impl SignalingConfig {
    #[must_use]
    pub fn channel_options(&self) -> ChannelOptions {
        ChannelOptions {
            request_timeout: Duration::from_millis(self.request_timeout_ms),
            event_buffer: self.event_buffer,
            max_frame_len: self.max_frame_len,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StudioConfig {
    pub room_id: String,
    pub display_name: String,
    pub role: Role,
    pub user_id: Option<String>,
    /// Join as soon as the host lets a guest in
    pub auto_join_on_approval: bool,
    /// Sources published right after joining
    pub publish_camera: bool,
    pub publish_microphone: bool,
}

impl Default for StudioConfig {
    fn default() -> Self {
        Self {
            room_id: "studio".to_string(),
            display_name: "Host".to_string(),
            role: Role::Host,
            user_id: None,
            auto_join_on_approval: true,
            publish_camera: true,
            publish_microphone: true,
        }
    }
}

impl StudioConfig {
    #[must_use]
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            room_id: RoomId::new(self.room_id.clone()),
            display_name: self.display_name.clone(),
            role: self.role,
            user_id: self.user_id.clone().map(UserId::new),
            auto_join_on_approval: self.auto_join_on_approval,
            ..SessionConfig::default()
        }
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigValidationError {
    #[error("studio.room_id must not be empty")]
    EmptyRoomId,

    #[error("studio.display_name must not be empty")]
    EmptyDisplayName,

    #[error("signaling.request_timeout_ms must be greater than zero")]
    ZeroRequestTimeout,

    #[error("signaling.event_buffer must be greater than zero")]
    ZeroEventBuffer,

    #[error("logging.format must be \"json\" or \"pretty\", got {0:?}")]
    UnknownLogFormat(String),
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

        // LIVESTUDIO_STUDIO__ROOM_ID, LIVESTUDIO_LOGGING__LEVEL, ...
        builder = builder.add_source(
            Environment::with_prefix("LIVESTUDIO")
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

    pub fn validate(&self) -> Result<(), ConfigValidationError> {
        if self.studio.room_id.trim().is_empty() {
            return Err(ConfigValidationError::EmptyRoomId);
        }
        if self.studio.display_name.trim().is_empty() {
            return Err(ConfigValidationError::EmptyDisplayName);
        }
        if self.signaling.request_timeout_ms == 0 {
            return Err(ConfigValidationError::ZeroRequestTimeout);
        }
        if self.signaling.event_buffer == 0 {
            return Err(ConfigValidationError::ZeroEventBuffer);
        }
        if !matches!(self.logging.format.as_str(), "json" | "pretty") {
            return Err(ConfigValidationError::UnknownLogFormat(
                self.logging.format.clone(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.studio.role, Role::Host);
        assert_eq!(
            config.signaling.channel_options().request_timeout,
            Duration::from_secs(10)
        );

        let session = config.studio.session_config();
        assert_eq!(session.room_id.as_str(), "studio");
        assert!(session.user_id.is_none());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
[studio]
room_id = "evening-show"
role = "guest"
publish_camera = false

[signaling]
request_timeout_ms = 2500
"#
        )
        .unwrap();

        let config = Config::from_file(file.path().to_str().unwrap()).unwrap();
        assert_eq!(config.studio.room_id, "evening-show");
        assert_eq!(config.studio.role, Role::Guest);
        assert!(!config.studio.publish_camera);
        assert!(config.studio.publish_microphone);
        assert_eq!(config.signaling.request_timeout_ms, 2500);
        assert_eq!(config.signaling.max_frame_len, 1024 * 1024);
    }

    #[test]
    fn test_missing_file_falls_back_to_defaults() {
        let config = Config::from_file("/nonexistent/livestudio.toml").unwrap();
        assert_eq!(config.logging.format, "pretty");
        assert_eq!(config.signaling.max_frame_len, 1024 * 1024);
    }

    #[test]
    fn test_env_overrides() {
        std::env::set_var("LIVESTUDIO_STUDIO__DISPLAY_NAME", "Night Host");
        std::env::set_var("LIVESTUDIO_SIGNALING__EVENT_BUFFER", "32");
        let config = Config::from_env();
        std::env::remove_var("LIVESTUDIO_STUDIO__DISPLAY_NAME");
        std::env::remove_var("LIVESTUDIO_SIGNALING__EVENT_BUFFER");

        let config = config.unwrap();
        assert_eq!(config.studio.display_name, "Night Host");
        assert_eq!(config.signaling.event_buffer, 32);
    }

    #[test]
    fn test_validate() {
        let mut config = Config::default();
        config.studio.room_id = "  ".to_string();
        assert_eq!(config.validate(), Err(ConfigValidationError::EmptyRoomId));

        let mut config = Config::default();
        config.signaling.request_timeout_ms = 0;
        assert_eq!(
            config.validate(),
            Err(ConfigValidationError::ZeroRequestTimeout)
        );

        let mut config = Config::default();
        config.logging.format = "yaml".to_string();
        assert!(matches!(
            config.validate(),
            Err(ConfigValidationError::UnknownLogFormat(_))
        ));
    }
}
