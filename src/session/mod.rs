//! Per-call orchestration: turn-taking, barge-in, metering, and the
//! session event loop.

pub mod arbiter;
pub mod barge_in;
pub mod call;
pub mod classifier;
pub mod events;
pub mod guard;
pub mod heuristic;
pub mod retry;
pub mod turn;
pub mod usage;

pub use arbiter::{ArbiterAction, ArbiterState, TurnArbiter, TurnTakingConfig};
pub use barge_in::{BargeInConfig, BargeInHandler, HeardEstimate};
pub use call::{CallContext, CallSession, SessionConfig, SessionParams};
pub use classifier::TurnClassifier;
pub use events::SessionEvent;
pub use guard::{GuardAction, GuardConfig, SessionGuard};
pub use heuristic::TurnDecision;
pub use retry::RetryPolicy;
pub use turn::{CompletionStatus, Turn, TurnHistory, TurnRole};
pub use usage::{CostBreakdown, UsageEvent, UsageMeter};
