//! Domain Layer - Core synchronization types and rules.
//!
//! Pure types and decision logic with no I/O: the connection lifecycle,
//! reconciliation of push and poll values, and subscriber bookkeeping.

/// Push channel lifecycle state machine and reconnect backoff.
pub mod connection;

/// Emission gates shared between producers and their owners.
pub mod gate;

/// Authoritative-state reconciliation.
pub mod reconciler;

/// Subscriber registry and fan-out.
pub mod subscription;

/// Keys, values, updates and authoritative state.
pub mod update;
