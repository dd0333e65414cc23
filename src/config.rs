use anyhow::{ensure, Context, Result};
use serde::Deserialize;

use crate::realtime::TurnDetection;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub service: ServiceConfig,
    pub realtime: RealtimeConfig,
    pub connection: ConnectionConfig,
    pub audio: AudioConfig,
    pub fallback: FallbackConfig,
    /// Falls back to `OPENAI_API_KEY`
    pub api_key: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub name: String,
    pub http: HttpConfig,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: "colloquy".to_string(),
            http: HttpConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub bind: String,
    pub port: u16,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1".to_string(),
            port: 8080,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RealtimeConfig {
    pub url: String,
    pub model: String,
    pub turn_detection: TurnDetection,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            url: "wss://api.openai.com/v1/realtime".to_string(),
            model: "gpt-4o-realtime-preview-2024-10-01".to_string(),
            turn_detection: TurnDetection::default(),
        }
    }
}

impl RealtimeConfig {
    /// WebSocket URL including the model query
    pub fn endpoint(&self) -> String {
        let separator = if self.url.contains('?') { '&' } else { '?' };
        format!("{}{}model={}", self.url, separator, self.model)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    pub max_attempts: u32,
    pub retry_delay_ms: u64,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            retry_delay_ms: 2000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    pub sample_rate: u32,
    /// Microphone ring size; audio that does not fit is dropped
    pub input_buffer_ms: u64,
    /// Drop frames that follow an input overflow
    pub strict_overflow: bool,
    /// Read microphone audio from a WAV file instead of a device
    pub input_file: Option<String>,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate: crate::audio::SAMPLE_RATE,
            input_buffer_ms: 500,
            strict_overflow: true,
            input_file: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FallbackConfig {
    pub url: String,
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self {
            url: "https://api.openai.com/v1/chat/completions".to_string(),
            model: "gpt-4-0125-preview".to_string(),
            temperature: 0.85,
            max_tokens: 150,
        }
    }
}

impl Config {
    /// Load from an optional file plus `COLLOQUY__*` environment variables
    pub fn load(path: &str) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name(path).required(false))
            .add_source(
                config::Environment::with_prefix("COLLOQUY")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .with_context(|| format!("Failed to load config from {}", path))?;

        let cfg: Config = settings
            .try_deserialize()
            .context("Invalid configuration")?;
        cfg.validate()?;

        Ok(cfg)
    }

    fn validate(&self) -> Result<()> {
        let audio = &self.audio;
        ensure!(
            audio.sample_rate == crate::audio::SAMPLE_RATE,
            "audio.sample_rate must be {} (the realtime session format), got {}",
            crate::audio::SAMPLE_RATE,
            audio.sample_rate
        );
        ensure!(
            audio.input_buffer_ms >= u64::from(crate::audio::FRAME_MS),
            "audio.input_buffer_ms must hold at least one {} ms frame, got {}",
            crate::audio::FRAME_MS,
            audio.input_buffer_ms
        );
        ensure!(
            self.connection.max_attempts >= 1,
            "connection.max_attempts must be at least 1"
        );

        Ok(())
    }

    pub fn api_key(&self) -> Option<String> {
        self.api_key
            .clone()
            .filter(|key| !key.is_empty())
            .or_else(|| std::env::var("OPENAI_API_KEY").ok())
            .filter(|key| !key.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_missing_file_uses_defaults() {
        let cfg = Config::load("does/not/exist/colloquy").unwrap();
        assert_eq!(cfg.connection.max_attempts, 3);
        assert_eq!(cfg.connection.retry_delay_ms, 2000);
        assert_eq!(cfg.audio.sample_rate, 24_000);
        assert_eq!(cfg.realtime.turn_detection.silence_duration_ms, 800);
        assert_eq!(cfg.fallback.max_tokens, 150);
    }

    #[test]
    fn test_file_overrides_defaults() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            "[service.http]\nport = 9090\n\n[realtime.turn_detection]\ntype = \"server_vad\"\nthreshold = 0.7\nprefix_padding_ms = 300\nsilence_duration_ms = 500\n\n[audio]\nstrict_overflow = false"
        )
        .unwrap();

        let path = file.path().with_extension("");
        let cfg = Config::load(path.to_str().unwrap()).unwrap();

        assert_eq!(cfg.service.http.port, 9090);
        assert_eq!(cfg.service.http.bind, "127.0.0.1");
        assert_eq!(cfg.realtime.turn_detection.threshold, 0.7);
        assert!(!cfg.audio.strict_overflow);
    }

    fn load_toml(contents: &str) -> Result<Config> {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile()?;
        writeln!(file, "{}", contents)?;
        let path = file.path().with_extension("");
        Config::load(path.to_str().unwrap_or_default())
    }

    #[test]
    fn test_input_buffer_shorter_than_a_frame_is_rejected() {
        let err = load_toml("[audio]\ninput_buffer_ms = 10").unwrap_err();
        assert!(format!("{:#}", err).contains("input_buffer_ms"));

        let cfg = load_toml("[audio]\ninput_buffer_ms = 20").unwrap();
        assert_eq!(cfg.audio.input_buffer_ms, 20);
    }

    #[test]
    fn test_sample_rate_is_fixed() {
        let err = load_toml("[audio]\nsample_rate = 16000").unwrap_err();
        assert!(format!("{:#}", err).contains("sample_rate"));
    }

    #[test]
    fn test_zero_attempts_is_rejected() {
        assert!(load_toml("[connection]\nmax_attempts = 0").is_err());
    }

    #[test]
    fn test_endpoint_appends_model() {
        let realtime = RealtimeConfig::default();
        assert_eq!(
            realtime.endpoint(),
            "wss://api.openai.com/v1/realtime?model=gpt-4o-realtime-preview-2024-10-01"
        );
    }
}
