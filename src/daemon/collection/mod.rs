//! Turns the window probe into a steady stream of [Observation]s for the engine.

use chrono::{DateTime, Utc};

use super::storage::entities::SpanContext;

pub mod idle;
pub mod sampler;

pub use idle::IdleDetector;
pub use sampler::Sampler;

/// What the probe saw on one tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Activity {
    Tracked(SpanContext),
    /// The foreground app is on the exclusion list. Its title never leaves the sampler.
    Excluded,
    /// The probe failed or timed out.
    Unknown,
}

/// One raw sample. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Observation {
    pub captured_at: DateTime<Utc>,
    pub activity: Activity,
    pub is_idle_signal: bool,
    /// Last moment the idle detector saw a distinguishing signal.
    pub last_signal_at: DateTime<Utc>,
}
