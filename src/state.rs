//! Shared application state.

use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use tracing::info;

use crate::collab::Collaborators;
use crate::config::{PricingTable, ServerConfig};

/// Registry entry for a call currently in progress.
#[derive(Debug, Clone)]
pub struct ActiveCall {
    pub stream_sid: String,
    pub user_id: String,
    pub started_at: Instant,
}

/// State shared across every connection.
pub struct AppState {
    pub config: ServerConfig,
    /// One connection pool for all inference traffic
    pub http: reqwest::Client,
    pub pricing: Arc<PricingTable>,
    pub collaborators: Collaborators,
    /// Calls currently running, keyed by call id
    pub active_calls: DashMap<String, ActiveCall>,
}

impl AppState {
    pub fn new(config: ServerConfig, collaborators: Collaborators) -> Arc<Self> {
        let pricing = Arc::new(PricingTable::new(collaborators.pricing.clone()));
        Arc::new(Self {
            config,
            http: reqwest::Client::new(),
            pricing,
            collaborators,
            active_calls: DashMap::new(),
        })
    }

    pub fn register_call(&self, call_id: &str, stream_sid: &str, user_id: &str) {
        self.active_calls.insert(
            call_id.to_string(),
            ActiveCall {
                stream_sid: stream_sid.to_string(),
                user_id: user_id.to_string(),
                started_at: Instant::now(),
            },
        );
        info!(
            call_id,
            active = self.active_calls.len(),
            "Call registered"
        );
    }

    pub fn unregister_call(&self, call_id: &str) {
        if self.active_calls.remove(call_id).is_some() {
            info!(
                call_id,
                active = self.active_calls.len(),
                "Call unregistered"
            );
        }
    }

    pub fn active_call_count(&self) -> usize {
        self.active_calls.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{
        InferenceSettings, RecognitionSettings, SynthesisSettings, TurnTakingSettings,
    };

    fn test_state() -> Arc<AppState> {
        let config = ServerConfig {
            host: "127.0.0.1".to_string(),
            port: 0,
            recognition: RecognitionSettings {
                api_key: "r".to_string(),
                endpoint: "wss://example.invalid/listen".to_string(),
                model: "m".to_string(),
            },
            synthesis: SynthesisSettings {
                api_key: "s".to_string(),
                endpoint: "wss://example.invalid/tts".to_string(),
                model_id: "m".to_string(),
                default_voice_id: "v".to_string(),
            },
            inference: InferenceSettings {
                api_key: "i".to_string(),
                endpoint: "https://example.invalid/chat".to_string(),
                model: "m".to_string(),
            },
            turn_taking: TurnTakingSettings::default(),
            barge_in_bytes_per_char: 64.0,
            idle_timeout_seconds: 120,
            stage_direction_patterns: Vec::new(),
        };
        AppState::new(config, Collaborators::in_memory())
    }

    #[test]
    fn test_call_registry_tracks_lifecycle() {
        let state = test_state();
        assert_eq!(state.active_call_count(), 0);
        state.register_call("call-1", "MZ1", "user-1");
        assert_eq!(state.active_call_count(), 1);
        state.unregister_call("call-1");
        state.unregister_call("call-1");
        assert_eq!(state.active_call_count(), 0);
    }
}
