//! Sequence orchestration: multi-step, multi-channel outreach sequences with
//! timed steps, outcome branching, leased dispatch, and retry policy.

pub mod branching;
pub mod definition;
pub mod engine;
pub mod scheduler;
pub mod state_machine;

pub use definition::SequenceRegistry;
pub use engine::{EngineStores, SequenceEngine};
pub use scheduler::{Lease, Scheduler};
