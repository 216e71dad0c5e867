//! Application Services
//!
//! Services that own the domain state and drive the producers.
//!
//! - `SyncEngine`: serialized reconcile-and-dispatch loop
//! - `PollingScheduler`: recurring pull tasks feeding the engine

mod engine;
mod polling;

pub use engine::{EngineStats, EngineStopped, SubscribeError, SyncEngine};
pub use polling::{PollingScheduler, ScheduleError};
