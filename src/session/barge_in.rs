//! Barge-in reconstruction.
//!
//! When the caller speaks over the assistant, the in-flight response is
//! cut and the turn history has to record how much of it was actually
//! heard. Three estimate tiers, in order of preference: the alignment
//! trace (exact), elapsed playback over total duration (approximate),
//! and a configured bytes-per-character estimate (rough).

use crate::core::tts::AlignmentTrace;
use crate::session::turn::Turn;

/// Tuning for the lowest-precision estimate tier.
#[derive(Debug, Clone, Copy)]
pub struct BargeInConfig {
    /// Audio bytes per spoken character for the configured voice and
    /// codec; tied to the voice's speaking rate, so it is a parameter
    /// rather than a constant
    pub bytes_per_char: f64,
}

impl Default for BargeInConfig {
    fn default() -> Self {
        Self { bytes_per_char: 64.0 }
    }
}

/// How the heard fraction was derived.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EstimateMethod {
    Alignment,
    ElapsedRatio,
    ByteEstimate,
}

/// Heard portion of an interrupted response.
#[derive(Debug, Clone, Copy)]
pub struct HeardEstimate {
    /// Fraction of the full text heard, clamped to [0, 1]
    pub fraction: f32,
    /// Character count of the heard prefix
    pub chars: usize,
    pub method: EstimateMethod,
}

/// Computes heard estimates and reconstructs interrupted turns.
#[derive(Debug, Clone, Copy, Default)]
pub struct BargeInHandler {
    config: BargeInConfig,
}

impl BargeInHandler {
    pub fn new(config: BargeInConfig) -> Self {
        Self { config }
    }

    /// Estimate how much of `full_text` the caller heard after
    /// `elapsed_ms` of playback. `total_duration_ms` and
    /// `audio_bytes_sent` feed the fallback tiers when no alignment
    /// metadata arrived.
    pub fn estimate(
        &self,
        full_text: &str,
        alignment: &AlignmentTrace,
        elapsed_ms: u64,
        total_duration_ms: Option<u64>,
        audio_bytes_sent: u64,
    ) -> HeardEstimate {
        let total_chars = full_text.chars().count();
        if total_chars == 0 {
            return HeardEstimate {
                fraction: 0.0,
                chars: 0,
                method: EstimateMethod::Alignment,
            };
        }

        if !alignment.is_empty() {
            let chars = alignment.chars_spoken_by(elapsed_ms).min(total_chars);
            return HeardEstimate {
                fraction: chars as f32 / total_chars as f32,
                chars,
                method: EstimateMethod::Alignment,
            };
        }

        let total_ms = total_duration_ms.filter(|ms| *ms > 0);
        if let Some(total_ms) = total_ms {
            let fraction = (elapsed_ms as f64 / total_ms as f64).clamp(0.0, 1.0);
            return HeardEstimate {
                fraction: fraction as f32,
                chars: (fraction * total_chars as f64).floor() as usize,
                method: EstimateMethod::ElapsedRatio,
            };
        }

        let estimated_chars = (audio_bytes_sent as f64 / self.config.bytes_per_char).floor();
        let chars = (estimated_chars as usize).min(total_chars);
        HeardEstimate {
            fraction: chars as f32 / total_chars as f32,
            chars,
            method: EstimateMethod::ByteEstimate,
        }
    }

    /// Build the interrupted turn: heard prefix truncated on a char
    /// boundary, full intended text preserved.
    pub fn interrupted_turn(&self, full_text: &str, estimate: HeardEstimate) -> Turn {
        let heard: String = full_text.chars().take(estimate.chars).collect();
        Turn::interrupted(heard, full_text, estimate.fraction)
    }
}
