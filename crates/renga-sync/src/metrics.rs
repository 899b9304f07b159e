//! Monotonic session counters.
//!
//! The session bumps these alongside the matching [`SyncEvent`]s; they are
//! serialized into snapshots for hosts that poll instead of subscribing.
//!
//! [`SyncEvent`]: crate::events::SyncEvent

use serde::Serialize;

/// Counters kept by a session. Read them with `SyncSession::metrics`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct SyncMetrics {
    pub applied_local: u64,
    pub applied_remote: u64,
    pub deduplicated: u64,
    pub apply_failures: u64,
    pub malformed: u64,
    pub batches_sent: u64,
    pub commands_sent: u64,
    /// Commands held back by a tripped breaker, counted once each.
    pub commands_suppressed: u64,
    pub breaker_trips: u64,
    pub persisted: u64,
    pub persist_failures: u64,
    pub resyncs: u64,
    pub turn_merges: u64,
    pub turn_stale: u64,
    pub diagnostics: u64,
}
