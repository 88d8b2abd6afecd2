//! Configuration types for the voice session core.

use crate::error::{Result, SessionError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct VoiceConfig {
    /// Audio capture/playback settings.
    pub audio: AudioConfig,
    /// Remote conversational engine settings.
    pub remote: RemoteConfig,
    /// Session lifecycle policy.
    pub session: SessionConfig,
    /// Ticket store settings.
    pub tickets: TicketConfig,
    /// Log output settings.
    pub logging: LoggingConfig,
}

/// Audio I/O configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    /// Capture sample rate in Hz sent to the remote engine.
    pub input_sample_rate: u32,
    /// Sample rate in Hz of the synthesized speech received back.
    pub output_sample_rate: u32,
    /// Samples per captured frame (4096 at 16kHz = 256ms).
    pub frame_samples: usize,
    /// Input device name (None = system default).
    pub input_device: Option<String>,
    /// Output device name (None = system default).
    pub output_device: Option<String>,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            input_sample_rate: 16_000,
            output_sample_rate: 24_000,
            frame_samples: 4096,
            input_device: None,
            output_device: None,
        }
    }
}

/// Remote conversational engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    /// WebSocket endpoint of the bidirectional session service.
    pub endpoint: String,
    /// Model identifier sent in the setup message.
    pub model: String,
    /// API key appended to the endpoint as `?key=`.
    pub api_key: Option<String>,
    /// Prebuilt voice used for synthesized replies.
    pub voice_name: String,
    /// Name the agent introduces itself with; used in status messages.
    pub agent_name: String,
    /// Behavior instructions for the remote engine.
    pub system_instruction: String,
    /// Upper bound on a single channel open attempt.
    pub connect_timeout_ms: u64,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            endpoint: "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent".to_owned(),
            model: "models/gemini-2.5-flash-native-audio-preview-09-2025".to_owned(),
            api_key: None,
            voice_name: "Kore".to_owned(),
            agent_name: "Maya".to_owned(),
            system_instruction: DEFAULT_SYSTEM_INSTRUCTION.to_owned(),
            connect_timeout_ms: 10_000,
        }
    }
}

impl RemoteConfig {
    /// Connect timeout as a [`Duration`].
    #[must_use]
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

const DEFAULT_SYSTEM_INSTRUCTION: &str = "You are Maya, an AI Municipal Agent. \
Your job is to log complaints concisely in under 3 mins. \
Speak in the user's language (English, Telugu, Hindi). \
Mandatory fields: Category, Location, Impact (how many people affected), Severity, Phone Number. \
Call 'log_complaint' when you have these. Summary MUST be English.";

/// Session lifecycle policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Hard ceiling on a single capture session in seconds.
    pub max_duration_secs: u64,
    /// Fixed delay between a channel drop and the reconnect attempt.
    pub reconnect_delay_ms: u64,
    /// Grace period after trailing playback drains before teardown.
    pub close_grace_ms: u64,
    /// End the session once a ticket has been logged.
    pub end_session_on_ticket: bool,
    /// Open the channel before the user begins capture.
    pub prewarm: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_duration_secs: 180,
            reconnect_delay_ms: 500,
            close_grace_ms: 1000,
            end_session_on_ticket: true,
            prewarm: true,
        }
    }
}

impl SessionConfig {
    #[must_use]
    pub fn max_duration(&self) -> Duration {
        Duration::from_secs(self.max_duration_secs)
    }

    #[must_use]
    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    #[must_use]
    pub fn close_grace(&self) -> Duration {
        Duration::from_millis(self.close_grace_ms)
    }
}

/// Ticket store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TicketConfig {
    /// Prefix of generated ticket ids (`PREFIX-NNNN`).
    pub id_prefix: String,
    /// Seed the store with sample tickets on startup.
    pub seed_demo_data: bool,
}

impl Default for TicketConfig {
    fn default() -> Self {
        Self {
            id_prefix: "MAH".to_owned(),
            seed_demo_data: true,
        }
    }
}

/// Log output configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Also write daily rolling log files under the logs directory.
    pub file: bool,
    /// Override for the log directory.
    pub dir: Option<PathBuf>,
}

impl VoiceConfig {
    /// Load configuration from a TOML file, falling back to defaults for missing fields.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed or fails validation.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self =
            toml::from_str(&content).map_err(|e| SessionError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a TOML file, creating parent directories as needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written or the config cannot be serialized.
    pub fn save_to_file(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content =
            toml::to_string_pretty(self).map_err(|e| SessionError::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Returns the default config file path.
    #[must_use]
    pub fn default_config_path() -> PathBuf {
        crate::app_dirs::config_file()
    }

    /// Reject values the audio and ticket paths cannot work with.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Config`] naming the first invalid field.
    pub fn validate(&self) -> Result<()> {
        if self.audio.input_sample_rate == 0 || self.audio.output_sample_rate == 0 {
            return Err(SessionError::Config("sample rates must be non-zero".into()));
        }
        if self.audio.frame_samples == 0 {
            return Err(SessionError::Config("frame_samples must be non-zero".into()));
        }
        if self.tickets.id_prefix.trim().is_empty() {
            return Err(SessionError::Config("ticket id_prefix must not be empty".into()));
        }
        if self.remote.endpoint.trim().is_empty() {
            return Err(SessionError::Config("remote endpoint must not be empty".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = VoiceConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.audio.input_sample_rate, 16_000);
        assert_eq!(config.audio.output_sample_rate, 24_000);
        assert_eq!(config.session.max_duration(), Duration::from_secs(180));
        assert_eq!(config.session.reconnect_delay(), Duration::from_millis(500));
        assert!(config.session.end_session_on_ticket);
        assert_eq!(config.tickets.id_prefix, "MAH");
    }

    #[test]
    fn save_and_load_round_trip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("nested").join("config.toml");

        let mut config = VoiceConfig::default();
        config.audio.frame_samples = 2048;
        config.session.end_session_on_ticket = false;
        config.tickets.id_prefix = "BLR".into();

        config.save_to_file(&path).expect("save");
        let loaded = VoiceConfig::from_file(&path).expect("load");
        assert_eq!(loaded.audio.frame_samples, 2048);
        assert!(!loaded.session.end_session_on_ticket);
        assert_eq!(loaded.tickets.id_prefix, "BLR");
    }

    #[test]
    fn partial_file_uses_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[session]\nmax_duration_secs = 60\n").expect("write");

        let loaded = VoiceConfig::from_file(&path).expect("load");
        assert_eq!(loaded.session.max_duration_secs, 60);
        assert_eq!(loaded.session.reconnect_delay_ms, 500);
        assert_eq!(loaded.remote.voice_name, "Kore");
    }

    #[test]
    fn from_file_invalid_toml_returns_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "this is not valid toml {{{").expect("write");
        assert!(matches!(
            VoiceConfig::from_file(&path),
            Err(SessionError::Config(_))
        ));
    }

    #[test]
    fn from_file_nonexistent_returns_io_error() {
        let result = VoiceConfig::from_file(Path::new("/nonexistent/path/config.toml"));
        assert!(matches!(result, Err(SessionError::Io(_))));
    }

    #[test]
    fn validate_rejects_zero_frame_size() {
        let mut config = VoiceConfig::default();
        config.audio.frame_samples = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_blank_prefix() {
        let mut config = VoiceConfig::default();
        config.tickets.id_prefix = "  ".into();
        assert!(config.validate().is_err());
    }
}
