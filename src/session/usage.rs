//! Per-call usage metering.
//!
//! Quantities accumulate as the call runs; finalize converts them into
//! append-only usage events priced via the [`PricingTable`]. Finalize
//! is idempotent: the guard makes sure ledger entries are produced
//! exactly once per session even when both the graceful-stop and the
//! error-cleanup paths invoke it.

use crate::config::pricing::PricingTable;
use crate::core::llm::TokenUsage;
use crate::core::transport::TELEPHONY_SAMPLE_RATE;

/// Companded telephony audio is one byte per sample.
const BYTES_PER_MINUTE: f64 = TELEPHONY_SAMPLE_RATE as f64 * 60.0;

/// What a usage event measures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricKind {
    Minutes,
    Characters,
    Tokens,
}

/// One append-only ledger entry.
#[derive(Debug, Clone)]
pub struct UsageEvent {
    pub service: String,
    pub metric: MetricKind,
    pub quantity: f64,
    pub unit_price: f64,
    pub cost: f64,
}

/// Final cost totals for one call.
#[derive(Debug, Clone, Default)]
pub struct CostBreakdown {
    pub recognition: f64,
    pub synthesis: f64,
    pub inference: f64,
    pub total: f64,
    /// Billable call minutes, for the credit ledger
    pub minutes: f64,
}

/// Accumulators for one call session.
#[derive(Debug, Default)]
pub struct UsageMeter {
    audio_in_bytes: u64,
    chars_synthesized: u64,
    prompt_tokens: u64,
    completion_tokens: u64,
    finalized: Option<CostBreakdown>,
}

impl UsageMeter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_audio_in(&mut self, bytes: usize) {
        self.audio_in_bytes += bytes as u64;
    }

    pub fn record_synthesis_chars(&mut self, chars: usize) {
        self.chars_synthesized += chars as u64;
    }

    pub fn record_tokens(&mut self, usage: TokenUsage) {
        self.prompt_tokens += usage.prompt_tokens;
        self.completion_tokens += usage.completion_tokens;
    }

    /// Minutes of inbound caller audio seen so far.
    pub fn audio_minutes(&self) -> f64 {
        self.audio_in_bytes as f64 / BYTES_PER_MINUTE
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized.is_some()
    }

    /// Convert the accumulators into priced ledger events. The first
    /// call produces the events; every later call returns the cached
    /// breakdown and writes nothing.
    pub fn finalize(&mut self, pricing: &PricingTable) -> (CostBreakdown, Vec<UsageEvent>) {
        if let Some(breakdown) = &self.finalized {
            return (breakdown.clone(), Vec::new());
        }

        let mut events = Vec::new();

        let minutes = self.audio_minutes();
        let recognition = pricing.cost("recognition", "streaming", minutes);
        if minutes > 0.0 {
            events.push(UsageEvent {
                service: "recognition".to_string(),
                metric: MetricKind::Minutes,
                quantity: minutes,
                unit_price: pricing
                    .price("recognition", "streaming")
                    .map(|p| p.amount)
                    .unwrap_or(0.0),
                cost: recognition,
            });
        }

        let chars = self.chars_synthesized as f64;
        let synthesis = pricing.cost("synthesis", "characters", chars);
        if chars > 0.0 {
            events.push(UsageEvent {
                service: "synthesis".to_string(),
                metric: MetricKind::Characters,
                quantity: chars,
                unit_price: pricing
                    .price("synthesis", "characters")
                    .map(|p| p.amount)
                    .unwrap_or(0.0),
                cost: synthesis,
            });
        }

        let mut inference = 0.0;
        for (operation, tokens) in [
            ("prompt_tokens", self.prompt_tokens),
            ("completion_tokens", self.completion_tokens),
        ] {
            if tokens == 0 {
                continue;
            }
            let cost = pricing.cost("inference", operation, tokens as f64);
            inference += cost;
            events.push(UsageEvent {
                service: "inference".to_string(),
                metric: MetricKind::Tokens,
                quantity: tokens as f64,
                unit_price: pricing
                    .price("inference", operation)
                    .map(|p| p.amount)
                    .unwrap_or(0.0),
                cost,
            });
        }

        let breakdown = CostBreakdown {
            recognition,
            synthesis,
            inference,
            total: recognition + synthesis + inference,
            minutes,
        };
        self.finalized = Some(breakdown.clone());
        (breakdown, events)
    }
}
