//! Actor wrapper around a [`SyncSession`].
//!
//! The session is single-threaded state; the actor owns it and serializes
//! every local call, inbound envelope, and timer tick through one loop. After
//! each step the actor flushes whatever the session queued to the transport.
//!
//! ```text
//!   PeerHandle (Clone)       mpsc      PeerActor (tokio task)
//!   ┌──────────────────┐  ────────▶  ┌──────────────────────────────┐
//!   │ .submit()        │             │ SyncSession                  │
//!   │ .turn()          │  ◀────────  │ inbox ◀── Transport          │
//!   │ .snapshot()      │   oneshot   │ auto-persist + retry timers  │
//!   └──────────────────┘             └──────────────────────────────┘
//! ```

use std::sync::Arc;

use renga_turn::{Transition, TurnEdit, TurnEvent};
use renga_types::{ActorId, Category, Command, CommandId, PeerId, TurnPhase, now_millis};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::error::{SyncError, SyncResult};
use crate::events::EventBus;
use crate::session::{Outbound, SessionSnapshot, SyncSession};
use crate::transport::{Envelope, Transport};

// ============================================================================
// Commands (internal)
// ============================================================================

enum PeerCommand {
    Append {
        category: Category,
        command: Command,
        reply: oneshot::Sender<SyncResult<CommandId>>,
    },
    Turn {
        actor: ActorId,
        event: TurnEvent,
        reply: oneshot::Sender<SyncResult<Transition>>,
    },
    Edit {
        actor: ActorId,
        edit: TurnEdit,
        reply: oneshot::Sender<SyncResult<()>>,
    },
    SetActive {
        actor: Option<ActorId>,
        reply: oneshot::Sender<()>,
    },
    RequestAction {
        actor: ActorId,
        reply: oneshot::Sender<()>,
    },
    ResetBreaker {
        reply: oneshot::Sender<()>,
    },
    FullReset {
        reply: oneshot::Sender<usize>,
    },
    Resync {
        reply: oneshot::Sender<()>,
    },
    Persist {
        reply: oneshot::Sender<SyncResult<bool>>,
    },
    Snapshot {
        reply: oneshot::Sender<SessionSnapshot>,
    },
    /// Fired by the retry timer.
    RetryElapsed { actor: ActorId },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

// ============================================================================
// PeerHandle
// ============================================================================

/// Cloneable handle to a running peer.
#[derive(Clone)]
pub struct PeerHandle {
    id: PeerId,
    tx: mpsc::UnboundedSender<PeerCommand>,
    events: EventBus,
}

impl PeerHandle {
    pub fn id(&self) -> PeerId {
        self.id
    }

    /// The session's event bus.
    pub fn events(&self) -> &EventBus {
        &self.events
    }

    async fn call<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> PeerCommand,
    ) -> SyncResult<T> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(make(reply)).map_err(|_| SyncError::Shutdown)?;
        rx.await.map_err(|_| SyncError::Shutdown)
    }

    /// Create and apply a command locally; it is broadcast on the next flush.
    pub async fn submit(
        &self,
        category: Category,
        kind: &str,
        payload: serde_json::Value,
    ) -> SyncResult<CommandId> {
        self.append(category, Command::new(kind, payload)).await
    }

    pub async fn append(&self, category: Category, command: Command) -> SyncResult<CommandId> {
        self.call(|reply| PeerCommand::Append {
            category,
            command,
            reply,
        })
        .await?
    }

    pub async fn turn(&self, actor: ActorId, event: TurnEvent) -> SyncResult<Transition> {
        self.call(|reply| PeerCommand::Turn {
            actor,
            event,
            reply,
        })
        .await?
    }

    pub async fn edit(&self, actor: ActorId, edit: TurnEdit) -> SyncResult<()> {
        self.call(|reply| PeerCommand::Edit { actor, edit, reply })
            .await?
    }

    pub async fn set_active_actor(&self, actor: Option<ActorId>) -> SyncResult<()> {
        self.call(|reply| PeerCommand::SetActive { actor, reply }).await
    }

    pub async fn request_action(&self, actor: ActorId) -> SyncResult<()> {
        self.call(|reply| PeerCommand::RequestAction { actor, reply })
            .await
    }

    pub async fn reset_breaker(&self) -> SyncResult<()> {
        self.call(|reply| PeerCommand::ResetBreaker { reply }).await
    }

    pub async fn full_reset(&self) -> SyncResult<usize> {
        self.call(|reply| PeerCommand::FullReset { reply }).await
    }

    pub async fn resync(&self) -> SyncResult<()> {
        self.call(|reply| PeerCommand::Resync { reply }).await
    }

    pub async fn persist(&self) -> SyncResult<bool> {
        self.call(|reply| PeerCommand::Persist { reply }).await?
    }

    pub async fn snapshot(&self) -> SyncResult<SessionSnapshot> {
        self.call(|reply| PeerCommand::Snapshot { reply }).await
    }

    /// Flush, persist if needed, and stop the actor.
    pub async fn shutdown(&self) -> SyncResult<()> {
        self.call(|reply| PeerCommand::Shutdown { reply }).await
    }
}

// ============================================================================
// PeerActor
// ============================================================================

struct PeerActor {
    session: SyncSession,
    transport: Arc<dyn Transport>,
    /// For timers that post back into the loop without keeping it alive.
    self_tx: mpsc::WeakUnboundedSender<PeerCommand>,
}

impl PeerActor {
    async fn run(
        mut self,
        mut rx: mpsc::UnboundedReceiver<PeerCommand>,
        mut inbox: mpsc::UnboundedReceiver<Envelope>,
    ) {
        let mut persist_timer = self.session.config().auto_persist_interval().map(|every| {
            let mut timer = tokio::time::interval_at(tokio::time::Instant::now() + every, every);
            timer.set_missed_tick_behavior(MissedTickBehavior::Skip);
            timer
        });
        let mut inbox_open = true;

        // Bootstrap may have queued a resync request
        self.flush();

        loop {
            tokio::select! {
                cmd = rx.recv() => match cmd {
                    Some(PeerCommand::Shutdown { reply }) => {
                        self.flush();
                        if let Err(e) = self.session.persist_if_dirty() {
                            warn!(error = %e, "final persist failed");
                        }
                        let _ = reply.send(());
                        break;
                    }
                    Some(cmd) => self.handle_command(cmd),
                    None => break,
                },
                envelope = inbox.recv(), if inbox_open => match envelope {
                    Some(Envelope { from, payload }) => {
                        self.session.handle_envelope(from, &payload);
                    }
                    None => {
                        debug!("inbox closed");
                        inbox_open = false;
                    }
                },
                _ = tick(&mut persist_timer) => {
                    // Failures are already reported by the session
                    let _ = self.session.persist_if_dirty();
                    self.session.compact_dedup(now_millis());
                }
            }
            self.flush();
        }
        info!(peer = %self.session.identity().name, "peer actor stopped");
    }

    fn handle_command(&mut self, cmd: PeerCommand) {
        match cmd {
            PeerCommand::Append {
                category,
                command,
                reply,
            } => {
                let _ = reply.send(self.session.append_local(&category, command));
            }
            PeerCommand::Turn {
                actor,
                event,
                reply,
            } => {
                let result = self.session.turn_event(actor, event);
                if let Ok(transition) = &result {
                    if transition.to == TurnPhase::RetryResolving {
                        self.schedule_retry(actor);
                    }
                }
                let _ = reply.send(result);
            }
            PeerCommand::Edit { actor, edit, reply } => {
                let _ = reply.send(self.session.turn_edit(actor, edit));
            }
            PeerCommand::SetActive { actor, reply } => {
                self.session.set_active_actor(actor);
                let _ = reply.send(());
            }
            PeerCommand::RequestAction { actor, reply } => {
                self.session.request_action(actor);
                let _ = reply.send(());
            }
            PeerCommand::ResetBreaker { reply } => {
                self.session.reset_breaker();
                let _ = reply.send(());
            }
            PeerCommand::FullReset { reply } => {
                let _ = reply.send(self.session.full_reset());
            }
            PeerCommand::Resync { reply } => {
                self.session.request_resync();
                let _ = reply.send(());
            }
            PeerCommand::Persist { reply } => {
                let _ = reply.send(self.session.persist());
            }
            PeerCommand::Snapshot { reply } => {
                let _ = reply.send(self.session.snapshot());
            }
            PeerCommand::RetryElapsed { actor } => {
                // A reset or remote merge may have moved the turn on already
                if let Err(e) = self.session.turn_event(actor, TurnEvent::RetryElapsed) {
                    debug!(actor = %actor, error = %e, "stale retry timer");
                }
            }
            PeerCommand::Shutdown { reply } => {
                let _ = reply.send(());
            }
        }
    }

    fn schedule_retry(&self, actor: ActorId) {
        let Some(tx) = self.self_tx.upgrade() else {
            return;
        };
        let delay = self.session.config().retry_delay();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(PeerCommand::RetryElapsed { actor });
        });
    }

    /// Hand everything the session queued to the transport.
    fn flush(&mut self) {
        let from = self.session.identity().id;
        for outbound in self.session.collect_outgoing() {
            let result = match &outbound {
                Outbound::Broadcast(message) => self.transport.broadcast(from, message),
                Outbound::SendTo { to, message } => self.transport.send_to(from, *to, message),
            };
            if let Err(e) = result {
                warn!(error = %e, "send failed");
            }
        }
    }
}

async fn tick(timer: &mut Option<Interval>) {
    match timer {
        Some(timer) => {
            timer.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

// ============================================================================
// Public spawn function
// ============================================================================

/// Spawn a peer actor on the current tokio runtime.
///
/// `session` should already be bootstrapped. `inbox` is the receiving end the
/// transport delivers this peer's envelopes to.
pub fn spawn_peer(
    session: SyncSession,
    transport: Arc<dyn Transport>,
    inbox: mpsc::UnboundedReceiver<Envelope>,
) -> PeerHandle {
    let (tx, rx) = mpsc::unbounded_channel();
    let handle = PeerHandle {
        id: session.identity().id,
        tx: tx.clone(),
        events: session.events().clone(),
    };
    let actor = PeerActor {
        session,
        transport,
        self_tx: tx.downgrade(),
    };
    tokio::spawn(actor.run(rx, inbox));
    handle
}
