//! Server configuration.
//!
//! Sources, in priority order: YAML file > environment variables > .env
//! values > defaults. The `.env` file is loaded by `main` via dotenvy
//! before any of this runs, so here the last two collapse into one
//! environment lookup.

use std::path::Path;

use serde::Deserialize;
use tracing::info;

pub mod pricing;

pub use pricing::{Price, PricingTable, PricingUnit};

use crate::core::llm::LlmConfig;
use crate::core::stt::SttConfig;
use crate::core::tts::TtsConfig;
use crate::errors::{SessionError, SessionResult};
use crate::session::arbiter::TurnTakingConfig;
use crate::session::barge_in::BargeInConfig;
use crate::session::call::SessionConfig;
use std::time::Duration;

/// Recognition provider settings.
#[derive(Debug, Clone)]
pub struct RecognitionSettings {
    pub api_key: String,
    pub endpoint: String,
    pub model: String,
}

/// Synthesis provider settings. The voice itself comes from the persona
/// at call time; `default_voice_id` covers personas without one.
#[derive(Debug, Clone)]
pub struct SynthesisSettings {
    pub api_key: String,
    pub endpoint: String,
    pub model_id: String,
    pub default_voice_id: String,
}

/// Inference provider settings.
#[derive(Debug, Clone)]
pub struct InferenceSettings {
    pub api_key: String,
    pub endpoint: String,
    pub model: String,
}

/// Turn-taking thresholds, in milliseconds for YAML/env ergonomics.
#[derive(Debug, Clone, Deserialize)]
pub struct TurnTakingSettings {
    #[serde(default = "default_short_pause_ms")]
    pub short_pause_ms: u64,
    #[serde(default = "default_evaluation_threshold_ms")]
    pub evaluation_threshold_ms: u64,
    #[serde(default = "default_force_response_ms")]
    pub force_response_ms: u64,
    #[serde(default = "default_max_evaluations")]
    pub max_evaluations: u32,
    #[serde(default = "default_classifier_timeout_ms")]
    pub classifier_timeout_ms: u64,
}

fn default_short_pause_ms() -> u64 {
    300
}
fn default_evaluation_threshold_ms() -> u64 {
    1000
}
fn default_force_response_ms() -> u64 {
    2500
}
fn default_max_evaluations() -> u32 {
    3
}
fn default_classifier_timeout_ms() -> u64 {
    500
}

impl Default for TurnTakingSettings {
    fn default() -> Self {
        Self {
            short_pause_ms: default_short_pause_ms(),
            evaluation_threshold_ms: default_evaluation_threshold_ms(),
            force_response_ms: default_force_response_ms(),
            max_evaluations: default_max_evaluations(),
            classifier_timeout_ms: default_classifier_timeout_ms(),
        }
    }
}

/// Full server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub recognition: RecognitionSettings,
    pub synthesis: SynthesisSettings,
    pub inference: InferenceSettings,
    pub turn_taking: TurnTakingSettings,
    /// Heard-fraction fallback constant, tied to voice and codec
    pub barge_in_bytes_per_char: f64,
    pub idle_timeout_seconds: u64,
    /// Extra stage-direction patterns; empty keeps the built-in policy
    pub stage_direction_patterns: Vec<String>,
}

/// YAML file shape. Everything optional; missing keys fall through to
/// the environment and then defaults.
#[derive(Debug, Default, Deserialize)]
struct YamlConfig {
    host: Option<String>,
    port: Option<u16>,
    recognition: Option<YamlProvider>,
    synthesis: Option<YamlSynthesis>,
    inference: Option<YamlProvider>,
    turn_taking: Option<TurnTakingSettings>,
    barge_in_bytes_per_char: Option<f64>,
    idle_timeout_seconds: Option<u64>,
    stage_direction_patterns: Option<Vec<String>>,
}

#[derive(Debug, Default, Deserialize)]
struct YamlProvider {
    api_key: Option<String>,
    endpoint: Option<String>,
    model: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct YamlSynthesis {
    api_key: Option<String>,
    endpoint: Option<String>,
    model_id: Option<String>,
    default_voice_id: Option<String>,
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

impl ServerConfig {
    /// Build from environment variables (and .env values already loaded
    /// into the environment) over defaults.
    pub fn from_env() -> SessionResult<Self> {
        let config = Self::env_layer()?;
        config.validate()?;
        Ok(config)
    }

    /// Build from a YAML file with environment fallback for missing keys.
    pub fn from_file(path: &Path) -> SessionResult<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            SessionError::Configuration(format!("Cannot read {}: {e}", path.display()))
        })?;
        let yaml: YamlConfig = serde_yaml::from_str(&raw).map_err(|e| {
            SessionError::Configuration(format!("Invalid YAML in {}: {e}", path.display()))
        })?;
        info!("Loaded configuration from {}", path.display());

        let mut config = Self::env_layer()?;
        if let Some(host) = yaml.host {
            config.host = host;
        }
        if let Some(port) = yaml.port {
            config.port = port;
        }
        if let Some(recognition) = yaml.recognition {
            apply_provider(&mut config.recognition, recognition);
        }
        if let Some(synthesis) = yaml.synthesis {
            if let Some(api_key) = synthesis.api_key {
                config.synthesis.api_key = api_key;
            }
            if let Some(endpoint) = synthesis.endpoint {
                config.synthesis.endpoint = endpoint;
            }
            if let Some(model_id) = synthesis.model_id {
                config.synthesis.model_id = model_id;
            }
            if let Some(voice) = synthesis.default_voice_id {
                config.synthesis.default_voice_id = voice;
            }
        }
        if let Some(inference) = yaml.inference {
            if let Some(api_key) = inference.api_key {
                config.inference.api_key = api_key;
            }
            if let Some(endpoint) = inference.endpoint {
                config.inference.endpoint = endpoint;
            }
            if let Some(model) = inference.model {
                config.inference.model = model;
            }
        }
        if let Some(turn_taking) = yaml.turn_taking {
            config.turn_taking = turn_taking;
        }
        if let Some(bytes_per_char) = yaml.barge_in_bytes_per_char {
            config.barge_in_bytes_per_char = bytes_per_char;
        }
        if let Some(idle) = yaml.idle_timeout_seconds {
            config.idle_timeout_seconds = idle;
        }
        if let Some(patterns) = yaml.stage_direction_patterns {
            config.stage_direction_patterns = patterns;
        }

        config.validate()?;
        Ok(config)
    }

    /// Environment variables over defaults. Missing provider keys are
    /// left empty here; `validate` rejects them once YAML has had its
    /// chance to fill them in.
    fn env_layer() -> SessionResult<Self> {
        Ok(Self {
            host: env_var("PARLANCE_HOST").unwrap_or_else(|| "0.0.0.0".to_string()),
            port: match env_var("PARLANCE_PORT") {
                Some(raw) => raw.parse().map_err(|_| {
                    SessionError::Configuration(format!("Invalid PARLANCE_PORT: {raw}"))
                })?,
                None => 8080,
            },
            recognition: RecognitionSettings {
                api_key: env_var("RECOGNITION_API_KEY").unwrap_or_default(),
                endpoint: env_var("RECOGNITION_ENDPOINT")
                    .unwrap_or_else(|| SttConfig::default().endpoint),
                model: env_var("RECOGNITION_MODEL").unwrap_or_else(|| SttConfig::default().model),
            },
            synthesis: SynthesisSettings {
                api_key: env_var("SYNTHESIS_API_KEY").unwrap_or_default(),
                endpoint: env_var("SYNTHESIS_ENDPOINT")
                    .unwrap_or_else(|| TtsConfig::default().endpoint),
                model_id: env_var("SYNTHESIS_MODEL")
                    .unwrap_or_else(|| TtsConfig::default().model_id),
                default_voice_id: env_var("SYNTHESIS_VOICE_ID").unwrap_or_default(),
            },
            inference: InferenceSettings {
                api_key: env_var("INFERENCE_API_KEY").unwrap_or_default(),
                endpoint: env_var("INFERENCE_ENDPOINT")
                    .unwrap_or_else(|| LlmConfig::default().endpoint),
                model: env_var("INFERENCE_MODEL").unwrap_or_else(|| LlmConfig::default().model),
            },
            turn_taking: TurnTakingSettings::default(),
            barge_in_bytes_per_char: match env_var("BARGE_IN_BYTES_PER_CHAR") {
                Some(raw) => raw.parse().map_err(|_| {
                    SessionError::Configuration(format!("Invalid BARGE_IN_BYTES_PER_CHAR: {raw}"))
                })?,
                None => BargeInConfig::default().bytes_per_char,
            },
            idle_timeout_seconds: match env_var("IDLE_TIMEOUT_SECONDS") {
                Some(raw) => raw.parse().map_err(|_| {
                    SessionError::Configuration(format!("Invalid IDLE_TIMEOUT_SECONDS: {raw}"))
                })?,
                None => 120,
            },
            stage_direction_patterns: Vec::new(),
        })
    }

    /// Reject configurations that cannot possibly serve a call.
    pub fn validate(&self) -> SessionResult<()> {
        if self.recognition.api_key.is_empty() {
            return Err(SessionError::Configuration(
                "Recognition API key is not set (RECOGNITION_API_KEY)".to_string(),
            ));
        }
        if self.synthesis.api_key.is_empty() {
            return Err(SessionError::Configuration(
                "Synthesis API key is not set (SYNTHESIS_API_KEY)".to_string(),
            ));
        }
        if self.inference.api_key.is_empty() {
            return Err(SessionError::Configuration(
                "Inference API key is not set (INFERENCE_API_KEY)".to_string(),
            ));
        }
        self.validate_ranges()
    }

    fn validate_ranges(&self) -> SessionResult<()> {
        if self.barge_in_bytes_per_char <= 0.0 {
            return Err(SessionError::Configuration(
                "barge_in_bytes_per_char must be positive".to_string(),
            ));
        }
        let tt = &self.turn_taking;
        if tt.short_pause_ms >= tt.evaluation_threshold_ms
            || tt.evaluation_threshold_ms >= tt.force_response_ms
        {
            return Err(SessionError::Configuration(
                "turn-taking thresholds must increase: short_pause < evaluation < force_response"
                    .to_string(),
            ));
        }
        Ok(())
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn turn_taking_config(&self) -> TurnTakingConfig {
        TurnTakingConfig {
            short_pause: Duration::from_millis(self.turn_taking.short_pause_ms),
            evaluation_threshold: Duration::from_millis(self.turn_taking.evaluation_threshold_ms),
            force_response: Duration::from_millis(self.turn_taking.force_response_ms),
            max_evaluations: self.turn_taking.max_evaluations,
            classifier_timeout: Duration::from_millis(self.turn_taking.classifier_timeout_ms),
        }
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            turn_taking: self.turn_taking_config(),
            barge_in: BargeInConfig {
                bytes_per_char: self.barge_in_bytes_per_char,
            },
            idle_timeout: Duration::from_secs(self.idle_timeout_seconds),
        }
    }

    pub fn stt_config(&self) -> SttConfig {
        SttConfig {
            api_key: self.recognition.api_key.clone(),
            endpoint: self.recognition.endpoint.clone(),
            model: self.recognition.model.clone(),
            ..Default::default()
        }
    }

    pub fn tts_config(&self, voice_id: &str) -> TtsConfig {
        let voice = if voice_id.is_empty() {
            self.synthesis.default_voice_id.clone()
        } else {
            voice_id.to_string()
        };
        TtsConfig {
            api_key: self.synthesis.api_key.clone(),
            endpoint: self.synthesis.endpoint.clone(),
            voice_id: voice,
            model_id: self.synthesis.model_id.clone(),
            ..Default::default()
        }
    }

    pub fn llm_config(&self) -> LlmConfig {
        LlmConfig {
            api_key: self.inference.api_key.clone(),
            endpoint: self.inference.endpoint.clone(),
            model: self.inference.model.clone(),
        }
    }
}

fn apply_provider(settings: &mut RecognitionSettings, yaml: YamlProvider) {
    if let Some(api_key) = yaml.api_key {
        settings.api_key = api_key;
    }
    if let Some(endpoint) = yaml.endpoint {
        settings.endpoint = endpoint;
    }
    if let Some(model) = yaml.model {
        settings.model = model;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config() -> ServerConfig {
        ServerConfig {
            host: "0.0.0.0".to_string(),
            port: 8080,
            recognition: RecognitionSettings {
                api_key: "r-key".to_string(),
                endpoint: SttConfig::default().endpoint,
                model: SttConfig::default().model,
            },
            synthesis: SynthesisSettings {
                api_key: "s-key".to_string(),
                endpoint: TtsConfig::default().endpoint,
                model_id: TtsConfig::default().model_id,
                default_voice_id: "river".to_string(),
            },
            inference: InferenceSettings {
                api_key: "i-key".to_string(),
                endpoint: LlmConfig::default().endpoint,
                model: LlmConfig::default().model,
            },
            turn_taking: TurnTakingSettings::default(),
            barge_in_bytes_per_char: 64.0,
            idle_timeout_seconds: 120,
            stage_direction_patterns: Vec::new(),
        }
    }

    #[test]
    fn test_validate_requires_provider_keys() {
        let mut config = valid_config();
        assert!(config.validate().is_ok());
        config.recognition.api_key.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_inverted_thresholds() {
        let mut config = valid_config();
        config.turn_taking.force_response_ms = 100;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_session_config_conversion() {
        let config = valid_config();
        let session = config.session_config();
        assert_eq!(session.turn_taking.short_pause, Duration::from_millis(300));
        assert_eq!(
            session.turn_taking.force_response,
            Duration::from_millis(2500)
        );
        assert!((session.barge_in.bytes_per_char - 64.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_tts_config_uses_persona_voice_over_default() {
        let config = valid_config();
        assert_eq!(config.tts_config("lake").voice_id, "lake");
        assert_eq!(config.tts_config("").voice_id, "river");
    }

    #[test]
    fn test_yaml_overrides() {
        let yaml = r#"
host: 127.0.0.1
port: 9090
recognition:
  api_key: yaml-r
synthesis:
  api_key: yaml-s
  default_voice_id: brook
inference:
  api_key: yaml-i
turn_taking:
  evaluation_threshold_ms: 900
"#;
        let parsed: YamlConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(parsed.host.as_deref(), Some("127.0.0.1"));
        assert_eq!(parsed.port, Some(9090));
        assert_eq!(
            parsed.turn_taking.as_ref().unwrap().evaluation_threshold_ms,
            900
        );
        // Unset keys in a present section keep their defaults
        assert_eq!(parsed.turn_taking.unwrap().force_response_ms, 2500);
    }
}
