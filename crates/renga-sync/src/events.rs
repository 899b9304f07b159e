//! Structured sync events on a pub/sub bus.
//!
//! The session publishes a [`SyncEvent`] for everything an observer might
//! care about. Every subject is `family.name` (`breaker.tripped`,
//! `persist.failed`), and a subscription picks events with an
//! [`EventFilter`]: everything (`*`), one family (`breaker.*`), or one
//! subject (`persist.failed`).
//!
//! Publishing never blocks and never fails; with no subscribers the event is
//! simply dropped.

use std::time::Instant;

use renga_types::{ActorId, Category, CommandId, PeerId, TurnPhase};
use tokio::sync::broadcast;

/// Where a batch of commands came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum OpSource {
    /// Created on this peer.
    #[default]
    Local,
    /// Received from a peer.
    Remote,
}

// ============================================================================
// Filters
// ============================================================================

/// Which subjects a subscription receives.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EventFilter {
    All,
    /// Every subject in one family, e.g. `breaker`.
    Family(String),
    Exact(String),
}

impl EventFilter {
    /// `*` or `>` alone is everything, a trailing `.*` or `.>` selects a
    /// family, and anything else must equal the subject.
    pub fn parse(pattern: &str) -> Self {
        match pattern {
            "*" | ">" => EventFilter::All,
            _ => match pattern
                .strip_suffix(".*")
                .or_else(|| pattern.strip_suffix(".>"))
            {
                Some(family) => EventFilter::Family(family.to_string()),
                None => EventFilter::Exact(pattern.to_string()),
            },
        }
    }

    pub fn matches(&self, subject: &str) -> bool {
        match self {
            EventFilter::All => true,
            EventFilter::Family(family) => subject
                .split_once('.')
                .is_some_and(|(head, _)| head == family),
            EventFilter::Exact(exact) => exact == subject,
        }
    }
}

// ============================================================================
// Events
// ============================================================================

#[derive(Clone, Debug, PartialEq)]
pub enum SyncEvent {
    CommandsApplied {
        category: Category,
        count: usize,
        source: OpSource,
    },
    Deduplicated {
        count: usize,
    },
    MalformedInput {
        category: Option<String>,
        reason: String,
    },
    ApplyFailed {
        category: Category,
        command_id: CommandId,
        reason: String,
    },
    BatchSent {
        commands: usize,
        turn_records: usize,
    },
    BreakerTripped {
        consecutive: u32,
    },
    /// Commands waiting behind a tripped breaker.
    BatchSuppressed {
        held: usize,
    },
    BreakerReset,
    Persisted {
        commands: usize,
    },
    PersistFailed {
        reason: String,
    },
    ResyncRequested,
    Resynced {
        commands: usize,
    },
    TurnTransition {
        actor: ActorId,
        from: TurnPhase,
        to: TurnPhase,
    },
    TurnMerged {
        actor: ActorId,
        fields: Vec<&'static str>,
    },
    ActionRequested {
        actor: ActorId,
        requester: PeerId,
        requester_name: String,
    },
}

impl SyncEvent {
    pub fn subject(&self) -> &'static str {
        match self {
            SyncEvent::CommandsApplied { .. } => "sync.applied",
            SyncEvent::Deduplicated { .. } => "sync.deduped",
            SyncEvent::MalformedInput { .. } => "sync.malformed",
            SyncEvent::ApplyFailed { .. } => "sync.apply_failed",
            SyncEvent::BatchSent { .. } => "sync.sent",
            SyncEvent::BreakerTripped { .. } => "breaker.tripped",
            SyncEvent::BatchSuppressed { .. } => "breaker.suppressed",
            SyncEvent::BreakerReset => "breaker.reset",
            SyncEvent::Persisted { .. } => "persist.ok",
            SyncEvent::PersistFailed { .. } => "persist.failed",
            SyncEvent::ResyncRequested => "resync.requested",
            SyncEvent::Resynced { .. } => "resync.completed",
            SyncEvent::TurnTransition { .. } => "turn.transition",
            SyncEvent::TurnMerged { .. } => "turn.merged",
            SyncEvent::ActionRequested { .. } => "turn.action_requested",
        }
    }
}

/// A published event.
#[derive(Clone, Debug)]
pub struct EventMessage {
    pub subject: &'static str,
    pub event: SyncEvent,
    pub timestamp: Instant,
}

// ============================================================================
// EventBus
// ============================================================================

#[derive(Clone, Debug)]
pub struct EventBus {
    tx: broadcast::Sender<EventMessage>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Returns the number of subscribers that received the event.
    pub fn publish(&self, event: SyncEvent) -> usize {
        let msg = EventMessage {
            subject: event.subject(),
            event,
            timestamp: Instant::now(),
        };
        self.tx.send(msg).unwrap_or(0)
    }

    pub fn subscribe(&self, pattern: &str) -> Subscription {
        Subscription {
            filter: EventFilter::parse(pattern),
            rx: self.tx.subscribe(),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

/// A filtered view of the bus.
pub struct Subscription {
    filter: EventFilter,
    rx: broadcast::Receiver<EventMessage>,
}

impl Subscription {
    pub fn filter(&self) -> &EventFilter {
        &self.filter
    }

    /// Wait for the next matching event. `None` once the bus is gone.
    pub async fn recv(&mut self) -> Option<EventMessage> {
        loop {
            match self.rx.recv().await {
                Ok(msg) if self.filter.matches(msg.subject) => return Some(msg),
                Ok(_) => {}
                Err(broadcast::error::RecvError::Closed) => return None,
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!(filter = ?self.filter, lagged = n, "event subscription lagged behind");
                }
            }
        }
    }

    /// Next matching event if one is already queued.
    pub fn try_recv(&mut self) -> Option<EventMessage> {
        loop {
            match self.rx.try_recv() {
                Ok(msg) if self.filter.matches(msg.subject) => return Some(msg),
                Ok(_) => {}
                Err(broadcast::error::TryRecvError::Empty)
                | Err(broadcast::error::TryRecvError::Closed) => return None,
                Err(broadcast::error::TryRecvError::Lagged(n)) => {
                    tracing::warn!(filter = ?self.filter, lagged = n, "event subscription lagged behind");
                }
            }
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("filter", &self.filter)
            .finish_non_exhaustive()
    }
}
