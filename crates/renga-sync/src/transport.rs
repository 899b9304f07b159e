//! Transport adapter seam plus an in-process hub.
//!
//! A transport only promises at-least-once, unordered delivery with no
//! acknowledgement. [`MemoryHub`] can be told to behave that way on purpose
//! (duplicates and random delays) so sessions are tested against it.
//!
//! ```text
//!   peer A ──broadcast──▶ MemoryHub ──▶ peer B inbox
//!                             │    └──▶ peer C inbox (maybe twice, maybe late)
//!                             └─send_to──▶ one inbox
//! ```

use std::sync::Arc;
use std::time::Duration;

use indexmap::IndexMap;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use renga_types::PeerId;
use tokio::sync::mpsc;
use tracing::{trace, warn};

use crate::error::TransportError;
use crate::protocol::SyncMessage;

/// One delivered message.
#[derive(Clone, Debug)]
pub struct Envelope {
    pub from: PeerId,
    /// Encoded [`SyncMessage`].
    pub payload: String,
}

pub trait Transport: Send + Sync {
    /// Deliver to every other peer.
    fn broadcast(&self, from: PeerId, message: &SyncMessage) -> Result<(), TransportError>;

    /// Deliver to one peer.
    fn send_to(&self, from: PeerId, to: PeerId, message: &SyncMessage) -> Result<(), TransportError>;

    /// Deliver to every peer including the sender.
    fn deliver_to_all(&self, from: PeerId, message: &SyncMessage) -> Result<(), TransportError>;
}

/// Delivery faults the hub injects.
#[derive(Clone, Debug)]
pub struct HubConfig {
    /// Probability each delivery is made a second time.
    pub duplicate_rate: f64,
    /// Each delivery waits a random 0..=max before landing (reorders).
    pub max_delay_ms: u64,
    pub seed: u64,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            duplicate_rate: 0.0,
            max_delay_ms: 0,
            seed: 0x5eed,
        }
    }
}

struct HubInner {
    inboxes: IndexMap<PeerId, mpsc::UnboundedSender<Envelope>>,
    rng: StdRng,
    config: HubConfig,
}

/// In-process transport connecting any number of peers.
#[derive(Clone)]
pub struct MemoryHub {
    inner: Arc<Mutex<HubInner>>,
}

impl MemoryHub {
    pub fn new(config: HubConfig) -> Self {
        let rng = StdRng::seed_from_u64(config.seed);
        Self {
            inner: Arc::new(Mutex::new(HubInner {
                inboxes: IndexMap::new(),
                rng,
                config,
            })),
        }
    }

    /// Register a peer and return its inbox.
    pub fn join(&self, peer: PeerId) -> mpsc::UnboundedReceiver<Envelope> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.lock().inboxes.insert(peer, tx);
        rx
    }

    pub fn leave(&self, peer: &PeerId) {
        self.inner.lock().inboxes.shift_remove(peer);
    }

    pub fn peer_count(&self) -> usize {
        self.inner.lock().inboxes.len()
    }

    fn route(&self, from: PeerId, targets: Targets, message: &SyncMessage) -> Result<(), TransportError> {
        let payload = message
            .encode()
            .map_err(|e| TransportError::Encode(e.to_string()))?;

        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let recipients: Vec<(PeerId, mpsc::UnboundedSender<Envelope>)> = match targets {
            Targets::Others => inner
                .inboxes
                .iter()
                .filter(|(id, _)| **id != from)
                .map(|(id, tx)| (*id, tx.clone()))
                .collect(),
            Targets::All => inner
                .inboxes
                .iter()
                .map(|(id, tx)| (*id, tx.clone()))
                .collect(),
            Targets::One(to) => {
                let tx = inner
                    .inboxes
                    .get(&to)
                    .cloned()
                    .ok_or(TransportError::UnknownPeer(to))?;
                vec![(to, tx)]
            }
        };

        let dup_rate = inner.config.duplicate_rate;
        for (to, tx) in recipients {
            let copies = if dup_rate > 0.0 && inner.rng.gen_bool(dup_rate.min(1.0)) {
                2
            } else {
                1
            };
            for _ in 0..copies {
                let delay = match inner.config.max_delay_ms {
                    0 => 0,
                    max => inner.rng.gen_range(0..=max),
                };
                let envelope = Envelope {
                    from,
                    payload: payload.clone(),
                };
                trace!(%from, %to, kind = message.kind(), delay, "route");
                deliver(tx.clone(), envelope, delay);
            }
        }
        Ok(())
    }
}

enum Targets {
    Others,
    All,
    One(PeerId),
}

fn deliver(tx: mpsc::UnboundedSender<Envelope>, envelope: Envelope, delay_ms: u64) {
    let runtime = tokio::runtime::Handle::try_current();
    match runtime {
        Ok(handle) if delay_ms > 0 => {
            handle.spawn(async move {
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                // Receiver may be gone by now
                let _ = tx.send(envelope);
            });
        }
        _ => {
            if tx.send(envelope).is_err() {
                warn!("dropping message for a closed inbox");
            }
        }
    }
}

impl Transport for MemoryHub {
    fn broadcast(&self, from: PeerId, message: &SyncMessage) -> Result<(), TransportError> {
        self.route(from, Targets::Others, message)
    }

    fn send_to(&self, from: PeerId, to: PeerId, message: &SyncMessage) -> Result<(), TransportError> {
        self.route(from, Targets::One(to), message)
    }

    fn deliver_to_all(&self, from: PeerId, message: &SyncMessage) -> Result<(), TransportError> {
        self.route(from, Targets::All, message)
    }
}
