//! Peer-to-peer command replication for renga sessions.
//!
//! Each peer runs a [`SyncSession`] that replicates an append-only,
//! per-category command log plus per-actor turn records over an unreliable
//! broadcast transport. One peer is the authority: it persists the merged log
//! and answers resync requests.
//!
//! The session is plain synchronous state. [`spawn_peer`] wraps it in a tokio
//! actor that owns the transport inbox and the timers.

pub mod config;
pub mod error;
pub mod events;
pub mod metrics;
pub mod notify;
pub mod peer;
pub mod protocol;
pub mod session;
pub mod store;
pub mod transport;
pub mod world;

pub use config::{ConfigError, SyncConfig};
pub use error::{ApplyError, StoreError, SyncError, SyncResult, TransportError};
pub use events::{EventBus, EventFilter, EventMessage, OpSource, Subscription, SyncEvent};
pub use metrics::SyncMetrics;
pub use notify::{NoticeLevel, Notifier, RecordingNotifier, TracingNotifier};
pub use peer::{PeerHandle, spawn_peer};
pub use protocol::{Decoded, Malformed, SyncMessage, TurnStates, decode};
pub use session::{
    BatchReport, InboundReport, Outbound, SessionSnapshot, SkipReason, SyncSession,
};
pub use store::{COMMANDS_KEY, CommandBlob, KvStore, MemoryStore, SqliteStore};
pub use transport::{Envelope, HubConfig, MemoryHub, Transport};
pub use world::{ActorTrait, CommandApplier, JournalEntry, Meter, World};
