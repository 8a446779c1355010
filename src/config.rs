//! # Configuration Management
//!
//! This module handles loading and managing application configuration from multiple sources:
//! - TOML configuration files (config.toml)
//! - Environment variables (with APP_ prefix, `__` between nested keys)
//! - Default values (built into the code)
//!
//! ## Configuration Priority (highest to lowest):
//! 1. Special environment variables (HOST, PORT, GEMINI_API_KEY)
//! 2. Environment variables (APP_SERVER__PORT, APP_LIVE__VOICE, etc.)
//! 3. Configuration file (config.toml)
//! 4. Default values (defined in the Default impl)
//!
//! ## Why the API key lives here:
//! The credential is read once at startup and then travels inside a
//! [`SessionSettings`] value into every `connect()` call. Nothing in the
//! session code reads the environment on its own.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;

/// Main application configuration that contains all settings.
///
/// ## Rust Concepts:
/// - **#[derive(...)]**: Automatically implements common traits:
///   - `Debug`: Allows printing with {:?} for debugging
///   - `Clone`: Allows making copies of the struct
///   - `Serialize` / `Deserialize`: Convert to/from TOML, JSON, environment
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub live: LiveConfig,
    pub audio: AudioConfig,
}

/// Server-specific configuration settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// Remote conversational service settings.
///
/// ## Fields:
/// - `endpoint`: WebSocket URL of the BidiGenerateContent service
/// - `api_key`: credential appended to the connect URL
/// - `model`: model identifier (without the `models/` prefix)
/// - `voice`: prebuilt voice name used for synthesized speech
/// - `system_instruction`: persona/behavior directive sent at setup
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LiveConfig {
    pub endpoint: String,
    #[serde(default)]
    pub api_key: String,
    pub model: String,
    pub voice: String,
    pub system_instruction: String,
}

/// Audio pipeline settings.
///
/// ## Fields:
/// - `capture_sample_rate`: rate sent upstream (16 kHz); the microphone runs
///   at its native rate and is resampled to this
/// - `capture_frame_size`: samples per captured frame (4096)
/// - `output_sample_rate`: rate of synthesized speech (24 kHz); the playback
///   clock switches to the speaker's native rate once it opens
/// - `input_device` / `output_device`: device names, `None` means the host default
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioConfig {
    pub capture_sample_rate: u32,
    pub capture_frame_size: usize,
    pub output_sample_rate: u32,
    pub channels: u16,
    #[serde(default)]
    pub input_device: Option<String>,
    #[serde(default)]
    pub output_device: Option<String>,
}

/// Snapshot of everything one session needs, handed to the controller at `start()`.
///
/// Runtime config updates therefore apply to the next session, never to the
/// running one.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub live: LiveConfig,
    pub audio: AudioConfig,
}

pub const DEFAULT_LIVE_ENDPOINT: &str = "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent";

/// Provides default configuration values.
///
/// ## Why defaults matter:
/// Default values ensure the application can start even if no configuration file exists.
/// They also serve as documentation of reasonable starting values.
impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 8080,
            },
            live: LiveConfig {
                endpoint: DEFAULT_LIVE_ENDPOINT.to_string(),
                api_key: String::new(),
                model: "gemini-2.5-flash-native-audio-preview-09-2025".to_string(),
                voice: "Zephyr".to_string(),
                system_instruction: "أنت مساعد ذكي متخصص في التسويق لمطعم جديد في بني سويف. تحدث باللهجة المصرية، وكن ودوداً ومختصراً. ساعد صاحب المطعم في تنفيذ خطة التسويق الخاصة به.".to_string(),
            },
            audio: AudioConfig::default(),
        }
    }
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            capture_sample_rate: 16000,  // what the live service expects upstream
            capture_frame_size: 4096,    // ~256ms per frame at 16kHz
            output_sample_rate: 24000,   // synthesized speech rate
            channels: 1,                 // mono both ways
            input_device: None,
            output_device: None,
        }
    }
}

impl AppConfig {
    /// Load configuration from defaults, config.toml, and the environment.
    ///
    /// ## Environment Variable Examples:
    /// - `APP_SERVER__PORT=3000`: Override server port
    /// - `APP_LIVE__VOICE=Puck`: Override the voice
    /// - `APP_AUDIO__INPUT_DEVICE=USB Mic`: Pick a specific microphone
    /// - `HOST`, `PORT`: Special cases for deployment platforms
    /// - `GEMINI_API_KEY`: Credential for the live service
    pub fn load() -> Result<Self> {
        let overrides: Vec<(&str, String)> = [
            ("server.host", env::var("HOST")),
            ("server.port", env::var("PORT")),
            ("live.api_key", env::var("GEMINI_API_KEY")),
        ]
        .into_iter()
        .filter_map(|(key, value)| value.ok().map(|v| (key, v)))
        .collect();

        Self::load_with_overrides(&overrides)
    }

    /// Same as [`AppConfig::load`] but with explicit highest-priority overrides.
    pub fn load_with_overrides(overrides: &[(&str, String)]) -> Result<Self> {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("config").required(false))
            .add_source(config::Environment::with_prefix("APP").prefix_separator("_").separator("__"));

        for (key, value) in overrides {
            settings = settings.set_override(*key, value.clone())?;
        }

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Validate that the configuration values make sense.
    ///
    /// ## What this checks:
    /// - Server port is not 0
    /// - A model identifier and endpoint are set
    /// - Audio rates, channel count and frame size are non-zero
    ///
    /// A missing API key is not a validation error: the service can still
    /// run and report health, `start()` fails with a connect error instead.
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow::anyhow!("Server port cannot be 0"));
        }

        if self.live.model.trim().is_empty() {
            return Err(anyhow::anyhow!("Live model identifier cannot be empty"));
        }

        if !self.live.endpoint.starts_with("ws://") && !self.live.endpoint.starts_with("wss://") {
            return Err(anyhow::anyhow!("Live endpoint must be a ws:// or wss:// URL"));
        }

        if self.audio.capture_sample_rate == 0 || self.audio.output_sample_rate == 0 {
            return Err(anyhow::anyhow!("Audio sample rates must be greater than 0"));
        }

        if self.audio.capture_frame_size == 0 {
            return Err(anyhow::anyhow!("Capture frame size must be greater than 0"));
        }

        if self.audio.channels != 1 {
            return Err(anyhow::anyhow!("Only mono audio is supported"));
        }

        Ok(())
    }

    /// Settings snapshot for the next session.
    pub fn session_settings(&self) -> SessionSettings {
        SessionSettings {
            live: self.live.clone(),
            audio: self.audio.clone(),
        }
    }

    /// Update configuration from a JSON string (used for runtime config updates).
    ///
    /// ## Partial updates:
    /// Only the fields present are changed. For example `{"live": {"voice": "Puck"}}`
    /// switches the voice for the next session and leaves everything else alone.
    /// The API key and server binding cannot be changed at runtime.
    pub fn update_from_json(&mut self, json_str: &str) -> Result<()> {
        let partial_config: serde_json::Value = serde_json::from_str(json_str)?;

        if let Some(live) = partial_config.get("live") {
            if let Some(model) = live.get("model").and_then(|v| v.as_str()) {
                self.live.model = model.to_string();
            }
            if let Some(voice) = live.get("voice").and_then(|v| v.as_str()) {
                self.live.voice = voice.to_string();
            }
            if let Some(instruction) = live.get("system_instruction").and_then(|v| v.as_str()) {
                self.live.system_instruction = instruction.to_string();
            }
        }

        if let Some(audio) = partial_config.get("audio") {
            if let Some(frame_size) = audio.get("capture_frame_size").and_then(|v| v.as_u64()) {
                self.audio.capture_frame_size = frame_size as usize;
            }
            if let Some(device) = audio.get("input_device") {
                self.audio.input_device = device.as_str().map(str::to_string);
            }
            if let Some(device) = audio.get("output_device") {
                self.audio.output_device = device.as_str().map(str::to_string);
            }
        }

        self.validate()?;
        Ok(())
    }

    /// JSON view of the configuration with the credential redacted.
    pub fn redacted_json(&self) -> serde_json::Value {
        serde_json::json!({
            "server": {
                "host": self.server.host,
                "port": self.server.port
            },
            "live": {
                "endpoint": self.live.endpoint,
                "api_key_set": !self.live.api_key.is_empty(),
                "model": self.live.model,
                "voice": self.live.voice,
                "system_instruction": self.live.system_instruction
            },
            "audio": {
                "capture_sample_rate": self.audio.capture_sample_rate,
                "capture_frame_size": self.audio.capture_frame_size,
                "output_sample_rate": self.audio.output_sample_rate,
                "channels": self.audio.channels,
                "input_device": self.audio.input_device,
                "output_device": self.audio.output_device
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.audio.capture_sample_rate, 16000);
        assert_eq!(config.audio.capture_frame_size, 4096);
        assert_eq!(config.audio.output_sample_rate, 24000);
        assert_eq!(config.live.voice, "Zephyr");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = AppConfig::default();
        config.server.port = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.audio.capture_frame_size = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.live.endpoint = "https://example.com".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_update() {
        let mut config = AppConfig::default();
        let json = r#"{"live": {"voice": "Puck"}, "audio": {"input_device": "USB Mic"}}"#;
        assert!(config.update_from_json(json).is_ok());
        assert_eq!(config.live.voice, "Puck");
        assert_eq!(config.audio.input_device.as_deref(), Some("USB Mic"));
        // Other fields should remain unchanged
        assert_eq!(config.live.model, AppConfig::default().live.model);
    }

    #[test]
    fn test_api_key_override() {
        let config = AppConfig::load_with_overrides(&[("live.api_key", "test-key".to_string())])
            .expect("config should load from defaults");
        assert_eq!(config.live.api_key, "test-key");
        assert_eq!(config.session_settings().live.api_key, "test-key");
    }

    #[test]
    fn test_redacted_json_hides_key() {
        let mut config = AppConfig::default();
        config.live.api_key = "secret-value".to_string();
        let json = config.redacted_json().to_string();
        assert!(!json.contains("secret-value"));
        assert!(json.contains("\"api_key_set\":true"));
    }
}
