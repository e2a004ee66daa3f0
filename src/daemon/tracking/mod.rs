//! The tracking core. Every external trigger (ticks, control commands, classifier results,
//! shutdown) becomes an [EngineMessage] on one queue, and a single [Engine] task applies them to
//! the [SessionMachine] in order. Readers only ever see the snapshot published after a message
//! was fully applied.

pub mod aggregator;
pub mod engine;
pub mod session;

pub use aggregator::SpanAggregator;
pub use engine::{Engine, EngineMessage};
pub use session::SessionMachine;
