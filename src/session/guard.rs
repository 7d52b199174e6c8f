//! Session guard: idle, duration, and liveness supervision.
//!
//! Checked from the session loop on a periodic tick. The guard tracks
//! wall-clock budgets with `tokio::time::Instant` so timer behavior is
//! testable under paused time.

use std::time::Duration;

use tokio::time::Instant;
use tracing::{info, warn};

/// Tick interval for guard checks and streaming-client liveness probes.
pub const HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(30);

/// Budget fractions at which spoken warnings fire, each at most once.
const WARNING_FRACTIONS: [f64; 3] = [0.66, 0.86, 0.96];

/// Guard thresholds for one call.
#[derive(Debug, Clone, Copy)]
pub struct GuardConfig {
    /// Caller silence that force-terminates the session
    pub idle_timeout: Duration,
    /// Hard call-duration budget, from the persona configuration
    pub max_duration: Duration,
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(120),
            max_duration: Duration::from_secs(600),
        }
    }
}

/// Why the guard terminated the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminateReason {
    Idle,
    MaxDuration,
}

/// What the session loop should do after a guard check.
#[derive(Debug, Clone, PartialEq)]
pub enum GuardAction {
    None,
    /// Speak a time-remaining warning
    SpeakWarning { text: String },
    Terminate(TerminateReason),
}

/// Per-call guard state.
#[derive(Debug)]
pub struct SessionGuard {
    config: GuardConfig,
    started_at: Instant,
    last_speech: Instant,
    warnings_fired: [bool; 3],
    terminated: bool,
}

impl SessionGuard {
    pub fn new(config: GuardConfig) -> Self {
        let now = Instant::now();
        Self {
            config,
            started_at: now,
            last_speech: now,
            warnings_fired: [false; 3],
            terminated: false,
        }
    }

    /// Reset the idle timer; called on any inbound caller speech.
    pub fn record_speech(&mut self) {
        self.last_speech = Instant::now();
    }

    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// One guard check. Termination fires at most once; warnings fire at
    /// most once per tier, in order.
    pub fn check(&mut self) -> GuardAction {
        if self.terminated {
            return GuardAction::None;
        }

        let elapsed = self.started_at.elapsed();
        if elapsed >= self.config.max_duration {
            warn!("Call duration budget exhausted, terminating");
            self.terminated = true;
            return GuardAction::Terminate(TerminateReason::MaxDuration);
        }

        if self.last_speech.elapsed() >= self.config.idle_timeout {
            info!("Caller idle past the threshold, terminating");
            self.terminated = true;
            return GuardAction::Terminate(TerminateReason::Idle);
        }

        let fraction = elapsed.as_secs_f64() / self.config.max_duration.as_secs_f64();
        for (i, threshold) in WARNING_FRACTIONS.iter().enumerate() {
            if fraction >= *threshold && !self.warnings_fired[i] {
                self.warnings_fired[i] = true;
                let remaining = self.config.max_duration.saturating_sub(elapsed);
                return GuardAction::SpeakWarning {
                    text: warning_text(i, remaining),
                };
            }
        }

        GuardAction::None
    }
}

fn warning_text(tier: usize, remaining: Duration) -> String {
    let minutes = (remaining.as_secs_f64() / 60.0).ceil() as u64;
    match tier {
        0 => format!(
            "Just so you know, we have about {minutes} minute{} left on this call.",
            plural(minutes)
        ),
        1 => format!(
            "A quick heads up, only around {minutes} minute{} remain{}.",
            plural(minutes),
            if minutes == 1 { "s" } else { "" }
        ),
        _ => "We're almost out of time, so we'll have to wrap up in a moment.".to_string(),
    }
}

fn plural(n: u64) -> &'static str {
    if n == 1 { "" } else { "s" }
}
