//! One peer's replication session.
//!
//! `SyncSession` owns everything a peer replicates: the command log, the
//! idempotency filter, the circuit breaker, the turn book, and the host's
//! [`CommandApplier`]. It is synchronous and transport-agnostic. Inbound
//! messages go in through [`SyncSession::handle_envelope`]; outbound messages
//! are collected with [`SyncSession::collect_outgoing`] and handed to a
//! [`Transport`](crate::transport::Transport) by the caller (usually the peer
//! actor in [`crate::peer`]).
//!
//! # Inbound pipeline
//!
//! ```text
//! raw ─▶ decode ─▶ own message? ─▶ per category:
//!                                    admit ids ─▶ sort ─▶ apply ─▶ absorb
//!                                  turn states: merge per actor
//!                                  authority: persist
//! ```
//!
//! A command whose referenced entity has not arrived yet is parked together
//! with everything after it in the batch, and the session asks for a full
//! resync instead of leaving a half-applied batch behind. Parked commands
//! keep their ids in the filter; they are retried after every batch that
//! applies something and replayed with every rebuild. A command no history
//! can fix (unknown type, invalid payload) is reported as malformed and
//! dropped.
//!
//! Once the filter has been compacted, a command from the compacted range is
//! looked up in the log and the parked list before it is called a duplicate.

use std::collections::HashSet;
use std::sync::Arc;

use indexmap::IndexMap;
use renga_log::{Admission, CircuitBreaker, CommandLog, Gate, IdempotencyFilter};
use renga_turn::{MergeOutcome, Transition, TurnBook, TurnContext, TurnEdit, TurnEvent};
use renga_types::{
    ActorId, Category, Command, CommandId, PeerId, PeerIdentity, TurnRecord, now_millis,
    sort_for_replay,
};
use serde::Serialize;
use tracing::{debug, error, info, trace, warn};

use crate::config::SyncConfig;
use crate::error::{ApplyError, SyncError, SyncResult};
use crate::events::{EventBus, OpSource, SyncEvent};
use crate::metrics::SyncMetrics;
use crate::notify::{NoticeLevel, Notifier, TracingNotifier};
use crate::protocol::{self, Decoded, Malformed, SyncMessage, TurnStates};
use crate::store::{CommandBlob, KvStore, load_commands, store_commands};
use crate::world::{CommandApplier, World};

/// A message the session wants sent.
#[derive(Clone, Debug, PartialEq)]
pub enum Outbound {
    /// To every other peer.
    Broadcast(SyncMessage),
    /// To one peer (resync snapshots).
    SendTo { to: PeerId, message: SyncMessage },
}

/// What an inbound `commandsAdded` did.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct BatchReport {
    pub applied: usize,
    pub deduplicated: usize,
    pub malformed: Vec<Malformed>,
    pub turns_merged: usize,
    pub turns_stale: usize,
    /// Commands held back because an earlier one failed.
    pub parked: usize,
    /// Set when a command failed to apply and a resync was requested.
    pub failure: Option<String>,
    pub persisted: bool,
}

/// Result of handling one inbound message.
#[derive(Clone, Debug, PartialEq)]
pub enum InboundReport {
    Batch(BatchReport),
    /// A take-action prompt was shown to the operator.
    Surfaced { actor: ActorId },
    SnapshotSent { to: PeerId, commands: usize },
    Resynced { commands: usize },
    Skipped { reason: SkipReason },
}

/// Reason an inbound message was not acted on.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SkipReason {
    /// Our own broadcast echoed back.
    OwnMessage,
    Diagnostic,
    /// Take-action prompt for an actor we do not control.
    NotController,
    /// Message only the authority (or only a non-authority) acts on.
    WrongRole,
    Malformed(String),
}

/// A point-in-time view of a session, for hosts and tests.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub identity: PeerIdentity,
    pub world: serde_json::Value,
    pub log_lengths: IndexMap<Category, usize>,
    pub turns: IndexMap<ActorId, TurnRecord>,
    pub active_actor: Option<ActorId>,
    pub metrics: SyncMetrics,
    pub breaker_tripped: bool,
    pub dedup_len: usize,
    pub parked: usize,
}

pub struct SyncSession {
    identity: PeerIdentity,
    config: SyncConfig,
    log: CommandLog,
    filter: IdempotencyFilter,
    breaker: CircuitBreaker,
    /// Pending commands already counted as suppressed while tripped.
    held_back: usize,
    turns: TurnBook,
    active_actor: Option<ActorId>,
    active_dirty: bool,
    applier: Box<dyn CommandApplier>,
    store: Option<Arc<dyn KvStore>>,
    notifier: Arc<dyn Notifier>,
    events: EventBus,
    metrics: SyncMetrics,
    outbox: Vec<Outbound>,
    /// Received commands that could not be applied yet, in arrival order.
    parked: Vec<(Category, Command)>,
    /// Log changed since the last successful save.
    unpersisted: bool,
    awaiting_snapshot: bool,
}

impl SyncSession {
    pub fn new(config: SyncConfig, identity: PeerIdentity) -> Self {
        let ctx = TurnContext::new(identity.id, identity.role);
        Self {
            log: CommandLog::new(config.categories.iter().cloned()),
            filter: IdempotencyFilter::new(),
            breaker: CircuitBreaker::new(config.breaker),
            held_back: 0,
            turns: TurnBook::new(ctx),
            active_actor: None,
            active_dirty: false,
            applier: Box::new(World::new()),
            store: None,
            notifier: Arc::new(TracingNotifier),
            events: EventBus::default(),
            metrics: SyncMetrics::default(),
            outbox: Vec::new(),
            parked: Vec::new(),
            unpersisted: false,
            awaiting_snapshot: false,
            config,
            identity,
        }
    }

    /// Durable store. Only the authority ever writes to it.
    pub fn with_store(mut self, store: Arc<dyn KvStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_applier(mut self, applier: Box<dyn CommandApplier>) -> Self {
        self.applier = applier;
        self
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = events;
        self
    }

    // ── Accessors ───────────────────────────────────────────────────────────

    pub fn identity(&self) -> &PeerIdentity {
        &self.identity
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn log(&self) -> &CommandLog {
        &self.log
    }

    pub fn filter(&self) -> &IdempotencyFilter {
        &self.filter
    }

    pub fn turns(&self) -> &TurnBook {
        &self.turns
    }

    pub fn turn(&self, actor: &ActorId) -> Option<&TurnRecord> {
        self.turns.get(actor)
    }

    pub fn active_actor(&self) -> Option<ActorId> {
        self.active_actor
    }

    pub fn metrics(&self) -> &SyncMetrics {
        &self.metrics
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn applier(&self) -> &dyn CommandApplier {
        self.applier.as_ref()
    }

    pub fn is_tripped(&self) -> bool {
        self.breaker.is_tripped()
    }

    pub fn has_unpersisted(&self) -> bool {
        self.unpersisted
    }

    pub fn is_awaiting_snapshot(&self) -> bool {
        self.awaiting_snapshot
    }

    /// Received commands waiting for something they depend on.
    pub fn parked_len(&self) -> usize {
        self.parked.len()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            identity: self.identity.clone(),
            world: self.applier.snapshot(),
            log_lengths: self
                .log
                .categories()
                .map(|c| (c.clone(), self.log.commands(c.as_str()).len()))
                .collect(),
            turns: self.turns.snapshot(),
            active_actor: self.active_actor,
            metrics: self.metrics.clone(),
            breaker_tripped: self.breaker.is_tripped(),
            dedup_len: self.filter.len(),
            parked: self.parked.len(),
        }
    }

    // ── Startup ─────────────────────────────────────────────────────────────

    /// Load durable history (authority) or ask for it (everyone else).
    ///
    /// Loaded command ids are registered with the idempotency filter before
    /// anything is replayed, so a peer re-broadcasting old history cannot
    /// double-apply it.
    pub fn bootstrap(&mut self) -> SyncResult<usize> {
        if !self.identity.is_authority() {
            self.request_resync();
            return Ok(0);
        }
        let blob = match &self.store {
            Some(store) => load_commands(store.as_ref())?,
            None => CommandBlob::new(),
        };
        let replayed = self.rebuild(blob);
        info!(peer = %self.identity.name, replayed, "authority bootstrapped from store");
        Ok(replayed)
    }

    // ── Local writes ────────────────────────────────────────────────────────

    /// Apply a locally created command and queue it for broadcast.
    pub fn append_local(&mut self, category: &Category, command: Command) -> SyncResult<CommandId> {
        if !self.log.has_category(category.as_str()) {
            return Err(SyncError::UnknownCategory(category.to_string()));
        }
        let command_id = command.command_id;
        self.applier
            .apply(category, &command)
            .map_err(|source| SyncError::Apply {
                category: category.clone(),
                command_id,
                source,
            })?;
        self.filter.register_all(std::iter::once(&command));
        self.log.append(category, command);
        self.unpersisted = true;
        self.metrics.applied_local += 1;
        self.events.publish(SyncEvent::CommandsApplied {
            category: category.clone(),
            count: 1,
            source: OpSource::Local,
        });
        Ok(command_id)
    }

    pub fn submit(
        &mut self,
        category: &Category,
        kind: &str,
        payload: serde_json::Value,
    ) -> SyncResult<CommandId> {
        self.append_local(category, Command::new(kind, payload))
    }

    // ── Turns ───────────────────────────────────────────────────────────────

    /// Drive an actor's turn machine.
    ///
    /// Commits produced by the transition are checked against the world
    /// first. If any would fail, the record is put back and nothing is
    /// appended.
    #[tracing::instrument(skip_all, name = "turn.event", fields(actor = %actor, kind = %event.kind()))]
    pub fn turn_event(&mut self, actor: ActorId, event: TurnEvent) -> SyncResult<Transition> {
        let before = self.turns.record(actor).clone();
        let transition = self.turns.apply(actor, event)?;

        for commit in &transition.commits {
            if !self.log.has_category(commit.category.as_str()) {
                self.turns.restore(actor, before);
                return Err(SyncError::UnknownCategory(commit.category.to_string()));
            }
            if let Err(source) = self.applier.check(&commit.category, &commit.command) {
                warn!(category = %commit.category, kind = %commit.command.kind, error = %source, "commit rejected, rolling back turn");
                self.turns.restore(actor, before);
                return Err(SyncError::Apply {
                    category: commit.category.clone(),
                    command_id: commit.command.command_id,
                    source,
                });
            }
        }
        for commit in &transition.commits {
            self.append_local(&commit.category, commit.command.clone())?;
        }

        debug!(from = %transition.from, to = %transition.to, commits = transition.commits.len(), "turn transition");
        self.events.publish(SyncEvent::TurnTransition {
            actor,
            from: transition.from,
            to: transition.to,
        });
        Ok(transition)
    }

    pub fn turn_edit(&mut self, actor: ActorId, edit: TurnEdit) -> SyncResult<()> {
        self.turns.edit(actor, edit)?;
        Ok(())
    }

    /// Change the active actor. Rides along with the next batch.
    pub fn set_active_actor(&mut self, actor: Option<ActorId>) {
        if self.active_actor != actor {
            self.active_actor = actor;
            self.active_dirty = true;
        }
    }

    /// Clear every actor's turn, including dead-ended ones.
    pub fn full_reset(&mut self) -> usize {
        self.turns.full_reset()
    }

    /// Prompt whoever controls `actor` to take a turn.
    pub fn request_action(&mut self, actor: ActorId) {
        self.outbox.push(Outbound::Broadcast(SyncMessage::TakeAction {
            actor_id: actor,
            requester_id: self.identity.id,
            requester_name: self.identity.name.clone(),
        }));
    }

    /// Queue a connectivity check.
    pub fn diagnostic(&mut self, text: impl Into<String>) {
        self.outbox
            .push(Outbound::Broadcast(SyncMessage::Diagnostic { text: text.into() }));
    }

    // ── Outbound ────────────────────────────────────────────────────────────

    /// Drain everything waiting to go out.
    ///
    /// The command diff passes through the circuit breaker before the cursor
    /// moves. The batch that trips it is still sent; after that, commands and
    /// turn records stay queued and go out as one batch once the breaker is
    /// reset.
    #[tracing::instrument(skip_all, name = "sync.outgoing")]
    pub fn collect_outgoing(&mut self) -> Vec<Outbound> {
        let mut out = std::mem::take(&mut self.outbox);

        let count = self.log.total_pending();
        if count > 0 {
            match self.breaker.observe(count) {
                Gate::Open => {}
                Gate::Tripping { consecutive } => {
                    self.metrics.breaker_trips += 1;
                    self.notifier.notify(
                        NoticeLevel::Error,
                        &format!(
                            "sync paused: {consecutive} oversized batches in a row; reset the breaker to resume"
                        ),
                    );
                    self.events.publish(SyncEvent::BreakerTripped { consecutive });
                }
                Gate::Suppressed => {
                    let added = count.saturating_sub(self.held_back);
                    self.held_back = count;
                    if added > 0 {
                        self.metrics.commands_suppressed += added as u64;
                        debug!(added, held = count, "breaker holding outgoing commands");
                        self.events.publish(SyncEvent::BatchSuppressed { held: count });
                    }
                    return out;
                }
            }
        } else if self.breaker.is_tripped() {
            return out;
        }
        let commands = self.log.drain_new();

        let turn_states = if self.turns.has_dirty() || self.active_dirty {
            self.active_dirty = false;
            Some(TurnStates {
                by_actor: self.turns.take_dirty(),
                active_actor_id: self.active_actor,
            })
        } else {
            None
        };
        if count == 0 && turn_states.is_none() {
            return out;
        }

        let turn_records = turn_states.as_ref().map_or(0, |t| t.by_actor.len());
        trace!(commands = count, turn_records, "queue batch");
        out.push(Outbound::Broadcast(SyncMessage::CommandsAdded {
            sender_id: self.identity.id,
            sender_name: self.identity.name.clone(),
            command_count: count,
            commands,
            turn_states,
            timestamp: now_millis(),
        }));
        self.metrics.batches_sent += 1;
        self.metrics.commands_sent += count as u64;
        self.events.publish(SyncEvent::BatchSent {
            commands: count,
            turn_records,
        });
        out
    }

    /// Resume sending after a trip. Everything held meanwhile goes out with
    /// the next [`collect_outgoing`](Self::collect_outgoing).
    #[tracing::instrument(skip_all, name = "breaker.reset")]
    pub fn reset_breaker(&mut self) {
        if !self.breaker.is_tripped() && self.breaker.consecutive_large() == 0 {
            return;
        }
        self.breaker.reset();
        self.held_back = 0;
        self.notifier.notify(NoticeLevel::Info, "sync resumed");
        self.events.publish(SyncEvent::BreakerReset);
    }

    // ── Inbound ─────────────────────────────────────────────────────────────

    /// Decode and handle one raw message. Never fails; problems are reported.
    pub fn handle_envelope(&mut self, from: PeerId, raw: &str) -> InboundReport {
        match protocol::decode(raw) {
            Ok(Decoded { message, malformed }) => {
                for m in &malformed {
                    self.report_malformed(m.category.clone(), &m.reason);
                }
                let mut report = self.handle_message(from, message);
                if let InboundReport::Batch(batch) = &mut report {
                    batch.malformed.extend(malformed);
                }
                report
            }
            Err(m) => {
                self.report_malformed(m.category.clone(), &m.reason);
                InboundReport::Skipped {
                    reason: SkipReason::Malformed(m.reason),
                }
            }
        }
    }

    pub fn handle_message(&mut self, from: PeerId, message: SyncMessage) -> InboundReport {
        trace!(%from, kind = message.kind(), "inbound");
        match message {
            SyncMessage::CommandsAdded {
                sender_id,
                commands,
                turn_states,
                ..
            } => {
                if sender_id == self.identity.id {
                    return InboundReport::Skipped {
                        reason: SkipReason::OwnMessage,
                    };
                }
                InboundReport::Batch(self.apply_batch(commands, turn_states))
            }
            SyncMessage::Diagnostic { text } => {
                self.metrics.diagnostics += 1;
                trace!(%from, text, "diagnostic");
                InboundReport::Skipped {
                    reason: SkipReason::Diagnostic,
                }
            }
            SyncMessage::TakeAction {
                actor_id,
                requester_id,
                requester_name,
            } => {
                if !self.identity.controls(&actor_id) && !self.identity.is_authority() {
                    return InboundReport::Skipped {
                        reason: SkipReason::NotController,
                    };
                }
                self.notifier.notify(
                    NoticeLevel::Info,
                    &format!("{requester_name} asks actor {} to take action", actor_id.short()),
                );
                self.events.publish(SyncEvent::ActionRequested {
                    actor: actor_id,
                    requester: requester_id,
                    requester_name,
                });
                InboundReport::Surfaced { actor: actor_id }
            }
            SyncMessage::ResyncRequest { requester_id } => {
                if requester_id == self.identity.id {
                    return InboundReport::Skipped {
                        reason: SkipReason::OwnMessage,
                    };
                }
                if !self.identity.is_authority() {
                    return InboundReport::Skipped {
                        reason: SkipReason::WrongRole,
                    };
                }
                let blob = self.authority_blob();
                let commands = blob.values().map(Vec::len).sum();
                info!(to = %requester_id, commands, "sending resync snapshot");
                self.outbox.push(Outbound::SendTo {
                    to: requester_id,
                    message: SyncMessage::ResyncSnapshot {
                        commands: blob,
                        turn_states: Some(TurnStates {
                            by_actor: self.turns.snapshot(),
                            active_actor_id: self.active_actor,
                        }),
                    },
                });
                InboundReport::SnapshotSent {
                    to: requester_id,
                    commands,
                }
            }
            SyncMessage::ResyncSnapshot {
                commands,
                turn_states,
            } => {
                if self.identity.is_authority() {
                    return InboundReport::Skipped {
                        reason: SkipReason::WrongRole,
                    };
                }
                // Keep anything we already hold; the rebuild dedupes by id
                let mut blob = self.log.snapshot();
                for (category, list) in commands {
                    blob.entry(category).or_default().extend(list);
                }
                let replayed = self.rebuild(blob);
                if let Some(states) = turn_states {
                    self.merge_turn_states(states, None);
                }
                self.awaiting_snapshot = false;
                self.metrics.resyncs += 1;
                self.events.publish(SyncEvent::Resynced { commands: replayed });
                info!(replayed, "resynced from authority snapshot");
                InboundReport::Resynced { commands: replayed }
            }
        }
    }

    #[tracing::instrument(skip_all, name = "sync.inbound", fields(categories = commands.len()))]
    fn apply_batch(
        &mut self,
        commands: IndexMap<Category, Vec<Command>>,
        turn_states: Option<TurnStates>,
    ) -> BatchReport {
        let mut report = BatchReport::default();

        let mut failure: Option<(Category, CommandId, ApplyError)> = None;

        for (category, incoming) in commands {
            if !self.log.has_category(category.as_str()) {
                let reason = "unknown category".to_string();
                self.report_malformed(Some(category.to_string()), &reason);
                report.malformed.push(Malformed {
                    category: Some(category.to_string()),
                    reason,
                });
                continue;
            }

            let mut fresh = Vec::with_capacity(incoming.len());
            for command in incoming {
                match self.filter.admit(&command) {
                    Admission::Fresh => fresh.push(command),
                    Admission::Duplicate => report.deduplicated += 1,
                    Admission::BelowWatermark if self.holds(&category, &command.command_id) => {
                        report.deduplicated += 1;
                    }
                    Admission::BelowWatermark => {
                        // Compacted range, but never applied here
                        self.filter.record(&command);
                        fresh.push(command);
                    }
                }
            }
            sort_for_replay(&mut fresh);

            let mut applied = Vec::with_capacity(fresh.len());
            for command in fresh {
                if failure.is_some() {
                    report.parked += 1;
                    self.parked.push((category.clone(), command));
                    continue;
                }
                match self.applier.apply(&category, &command) {
                    Ok(()) => applied.push(command),
                    Err(e) if e.awaits_dependency() => {
                        failure = Some((category.clone(), command.command_id, e));
                        report.parked += 1;
                        self.parked.push((category.clone(), command));
                    }
                    Err(e) => {
                        let reason = format!("{}: {e}", command.command_id);
                        self.report_malformed(Some(category.to_string()), &reason);
                        report.malformed.push(Malformed {
                            category: Some(category.to_string()),
                            reason,
                        });
                    }
                }
            }
            self.absorb_applied(&category, applied, &mut report);
        }

        match failure {
            Some((category, command_id, e)) => {
                let reason = e.to_string();
                warn!(category = %category, command_id = %command_id, error = %reason, parked = report.parked, "apply failed, requesting resync");
                self.metrics.apply_failures += 1;
                self.events.publish(SyncEvent::ApplyFailed {
                    category: category.clone(),
                    command_id,
                    reason: reason.clone(),
                });
                self.notifier.notify(
                    NoticeLevel::Warn,
                    &format!("could not apply a {category} command ({reason}); resynchronizing"),
                );
                report.failure = Some(format!("{category}: {reason}"));
                self.request_resync();
            }
            None if report.applied > 0 && !self.parked.is_empty() => {
                for (category, command) in self.release_parked() {
                    self.absorb_applied(&category, vec![command], &mut report);
                }
            }
            None => {}
        }

        if let Some(states) = turn_states {
            self.merge_turn_states(states, Some(&mut report));
        }

        if report.deduplicated > 0 {
            self.metrics.deduplicated += report.deduplicated as u64;
            self.events.publish(SyncEvent::Deduplicated {
                count: report.deduplicated,
            });
        }

        if report.failure.is_none() && report.applied > 0 && self.identity.is_authority() {
            // Failures are reported inside persist and never block the merge
            report.persisted = self.persist().unwrap_or(false);
        }
        report
    }

    /// Apply parked commands whose dependencies are now present.
    fn release_parked(&mut self) -> Vec<(Category, Command)> {
        let mut released = Vec::new();
        loop {
            let mut parked = std::mem::take(&mut self.parked);
            parked.sort_by(|a, b| a.1.replay_cmp(&b.1));
            let before = parked.len();
            for (category, command) in parked {
                match self.applier.apply(&category, &command) {
                    Ok(()) => released.push((category, command)),
                    Err(e) if e.awaits_dependency() => self.parked.push((category, command)),
                    Err(e) => {
                        let reason = format!("{}: {e}", command.command_id);
                        self.report_malformed(Some(category.to_string()), &reason);
                    }
                }
            }
            if self.parked.is_empty() || self.parked.len() == before {
                break;
            }
        }
        if !released.is_empty() {
            debug!(released = released.len(), remaining = self.parked.len(), "released parked commands");
        }
        released
    }

    /// Whether `id` was already applied or is waiting in the parked list.
    fn holds(&self, category: &Category, id: &CommandId) -> bool {
        self.log.contains(category.as_str(), id)
            || self
                .parked
                .iter()
                .any(|(c, parked)| c == category && parked.command_id == *id)
    }

    fn absorb_applied(&mut self, category: &Category, applied: Vec<Command>, report: &mut BatchReport) {
        if applied.is_empty() {
            return;
        }
        let count = applied.len();
        self.log.absorb(category, applied);
        self.unpersisted = true;
        self.metrics.applied_remote += count as u64;
        report.applied += count;
        self.events.publish(SyncEvent::CommandsApplied {
            category: category.clone(),
            count,
            source: OpSource::Remote,
        });
    }

    fn merge_turn_states(&mut self, states: TurnStates, mut report: Option<&mut BatchReport>) {
        for (actor, remote) in &states.by_actor {
            let outcome = self.turns.merge_remote(*actor, remote);
            match &outcome {
                MergeOutcome::Stale => {
                    self.metrics.turn_stale += 1;
                    if let Some(r) = report.as_deref_mut() {
                        r.turns_stale += 1;
                    }
                }
                MergeOutcome::Cleared => {
                    self.events.publish(SyncEvent::TurnMerged {
                        actor: *actor,
                        fields: vec!["state"],
                    });
                }
                MergeOutcome::Updated { fields, rejected } => {
                    for (field, err) in rejected {
                        debug!(actor = %actor, field, error = %err, "kept local value for invalid remote field");
                    }
                    if !fields.is_empty() {
                        self.events.publish(SyncEvent::TurnMerged {
                            actor: *actor,
                            fields: fields.clone(),
                        });
                    }
                }
                MergeOutcome::Unchanged => {}
            }
            if outcome.changed() {
                self.metrics.turn_merges += 1;
                if let Some(r) = report.as_deref_mut() {
                    r.turns_merged += 1;
                }
            }
        }
        if let Some(active) = states.active_actor_id {
            self.active_actor = Some(active);
        }
    }

    fn report_malformed(&mut self, category: Option<String>, reason: &str) {
        self.metrics.malformed += 1;
        warn!(category = category.as_deref().unwrap_or("-"), reason, "malformed input");
        self.events.publish(SyncEvent::MalformedInput {
            category,
            reason: reason.to_string(),
        });
    }

    // ── Resync ──────────────────────────────────────────────────────────────

    /// Start a full resynchronization.
    ///
    /// The authority rebuilds from its own store and log. Everyone else asks
    /// the authority for a snapshot.
    pub fn request_resync(&mut self) {
        self.events.publish(SyncEvent::ResyncRequested);
        if self.identity.is_authority() {
            let blob = self.authority_blob();
            let replayed = self.rebuild(blob);
            self.metrics.resyncs += 1;
            self.events.publish(SyncEvent::Resynced { commands: replayed });
            return;
        }
        self.awaiting_snapshot = true;
        self.outbox.push(Outbound::Broadcast(SyncMessage::ResyncRequest {
            requester_id: self.identity.id,
        }));
    }

    /// Stored history plus whatever the live log holds beyond it.
    fn authority_blob(&self) -> CommandBlob {
        let mut blob = match &self.store {
            Some(store) => load_commands(store.as_ref()).unwrap_or_else(|e| {
                warn!(error = %e, "could not read store for snapshot, using live log only");
                CommandBlob::new()
            }),
            None => CommandBlob::new(),
        };
        for (category, list) in self.log.snapshot() {
            blob.entry(category).or_default().extend(list);
        }
        for list in blob.values_mut() {
            let mut seen = HashSet::new();
            list.retain(|c| seen.insert(c.command_id));
        }
        blob
    }

    /// Replace world, log, and filter with a replay of `blob` plus whatever
    /// is parked. Commands still missing a dependency stay parked; malformed
    /// ones are reported and dropped.
    ///
    /// Local commands that were never broadcast stay queued for the next
    /// diff; everything else counts as already sent.
    #[tracing::instrument(skip_all, name = "resync.rebuild", fields(categories = blob.len()))]
    fn rebuild(&mut self, mut blob: CommandBlob) -> usize {
        let mut unsent = HashSet::new();
        for (category, pending) in self.log.drain_new() {
            unsent.extend(pending.iter().map(|c| c.command_id));
            blob.entry(category).or_default().extend(pending);
        }
        for (category, command) in std::mem::take(&mut self.parked) {
            blob.entry(category).or_default().push(command);
        }
        self.applier.clear();
        self.log.clear();
        self.filter.clear();
        for commands in blob.values() {
            self.filter.register_all(commands);
        }

        let mut replayed = 0;
        let mut requeue = Vec::new();
        for (category, mut commands) in blob {
            if !self.log.has_category(category.as_str()) {
                self.report_malformed(Some(category.to_string()), "unconfigured category in snapshot");
                continue;
            }
            let mut seen = HashSet::new();
            commands.retain(|c| seen.insert(c.command_id));
            sort_for_replay(&mut commands);

            let mut kept = Vec::with_capacity(commands.len());
            for command in commands {
                match self.applier.apply(&category, &command) {
                    Ok(()) if unsent.contains(&command.command_id) => {
                        requeue.push((category.clone(), command));
                    }
                    Ok(()) => kept.push(command),
                    Err(e) if e.awaits_dependency() => {
                        debug!(category = %category, command_id = %command.command_id, error = %e, "parking command during replay");
                        self.parked.push((category.clone(), command));
                    }
                    Err(e) => {
                        let reason = format!("{}: {e}", command.command_id);
                        self.report_malformed(Some(category.to_string()), &reason);
                    }
                }
            }
            replayed += kept.len();
            self.log.absorb(&category, kept);
        }
        // Same-millisecond ties can replay a dependent command first
        for (category, command) in self.release_parked() {
            if unsent.contains(&command.command_id) {
                requeue.push((category, command));
            } else {
                replayed += 1;
                self.log.absorb(&category, std::iter::once(command));
            }
        }
        self.log.mark_all_sent();
        replayed += requeue.len();
        for (category, command) in requeue {
            self.log.append(&category, command);
        }
        if !self.parked.is_empty() {
            warn!(parked = self.parked.len(), "commands still unresolved after rebuild");
        }
        replayed
    }

    // ── Persistence ─────────────────────────────────────────────────────────

    /// Save the whole log. Only the authority with a store persists; for
    /// everyone else this is `Ok(false)`.
    ///
    /// A failed save is logged and surfaced, and the log stays marked
    /// unsaved so the next attempt retries.
    #[tracing::instrument(skip_all, name = "persist")]
    pub fn persist(&mut self) -> SyncResult<bool> {
        if !self.identity.is_authority() {
            return Ok(false);
        }
        let Some(store) = self.store.clone() else {
            return Ok(false);
        };

        let blob = self.log.snapshot();
        let commands = blob.values().map(Vec::len).sum();
        match store_commands(store.as_ref(), &blob) {
            Ok(()) => {
                self.unpersisted = false;
                self.metrics.persisted += 1;
                debug!(commands, "persisted command log");
                self.events.publish(SyncEvent::Persisted { commands });
                Ok(true)
            }
            Err(e) => {
                self.metrics.persist_failures += 1;
                error!(error = %e, "persisting command log failed");
                self.notifier
                    .notify(NoticeLevel::Warn, &format!("could not save session: {e}"));
                self.events.publish(SyncEvent::PersistFailed {
                    reason: e.to_string(),
                });
                Err(e.into())
            }
        }
    }

    /// Persist only if something changed since the last save.
    pub fn persist_if_dirty(&mut self) -> SyncResult<bool> {
        if !self.unpersisted {
            return Ok(false);
        }
        self.persist()
    }

    /// Forget command ids older than the configured retention window.
    pub fn compact_dedup(&mut self, now_ms: u64) -> usize {
        match self.config.dedup_retention_ms() {
            Some(retention) => self.filter.compact(now_ms.saturating_sub(retention)),
            None => 0,
        }
    }
}

impl std::fmt::Debug for SyncSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncSession")
            .field("peer", &self.identity.name)
            .field("role", &self.identity.role)
            .field("log_len", &self.log.total_len())
            .field("tripped", &self.breaker.is_tripped())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::RecordingNotifier;
    use crate::store::MemoryStore;
    use renga_log::BreakerConfig;
    use renga_types::{Effect, Position, TurnPhase};
    use serde_json::json;

    fn clocks() -> Category {
        Category::clocks()
    }

    fn create_meter(id: &str) -> Command {
        Command::new("meter.create", json!({"meterId": id, "label": id, "segments": 4}))
            .with_timestamp(100)
    }

    fn advance(id: &str, ticks: i64) -> Command {
        Command::new("meter.advance", json!({"meterId": id, "ticks": ticks})).with_timestamp(200)
    }

    fn batch_from(sender: &PeerIdentity, category: Category, commands: Vec<Command>) -> SyncMessage {
        let mut map = IndexMap::new();
        let count = commands.len();
        map.insert(category, commands);
        SyncMessage::CommandsAdded {
            sender_id: sender.id,
            sender_name: sender.name.clone(),
            command_count: count,
            commands: map,
            turn_states: None,
            timestamp: now_millis(),
        }
    }

    fn filled(session: &SyncSession, meter: &str) -> u64 {
        session.applier().snapshot()["meters"][meter]["filled"]
            .as_u64()
            .expect("meter present")
    }

    #[test]
    fn test_local_append_applies_and_queues() {
        let mut session = SyncSession::new(SyncConfig::default(), PeerIdentity::peer("ana"));
        session.append_local(&clocks(), create_meter("heat")).expect("append");

        let out = session.collect_outgoing();
        assert_eq!(out.len(), 1);
        let Outbound::Broadcast(SyncMessage::CommandsAdded { command_count, .. }) = &out[0] else {
            panic!("expected batch");
        };
        assert_eq!(*command_count, 1);
        assert!(session.collect_outgoing().is_empty());
    }

    #[test]
    fn test_failed_local_apply_is_not_logged() {
        let mut session = SyncSession::new(SyncConfig::default(), PeerIdentity::peer("ana"));
        let err = session.append_local(&clocks(), advance("ghost", 1)).expect_err("missing meter");
        assert!(matches!(err, SyncError::Apply { .. }));
        assert_eq!(session.log().total_len(), 0);

        let err = session
            .append_local(&Category::new("loot"), create_meter("x"))
            .expect_err("unknown category");
        assert!(matches!(err, SyncError::UnknownCategory(_)));
    }

    #[test]
    fn test_duplicate_delivery_applies_once() {
        let sender = PeerIdentity::peer("bo");
        let mut session = SyncSession::new(SyncConfig::default(), PeerIdentity::peer("ana"));
        let msg = batch_from(&sender, clocks(), vec![create_meter("heat"), advance("heat", 1)]);

        let first = session.handle_message(sender.id, msg.clone());
        let second = session.handle_message(sender.id, msg);
        let (InboundReport::Batch(first), InboundReport::Batch(second)) = (first, second) else {
            panic!("expected batches");
        };
        assert_eq!(first.applied, 2);
        assert_eq!(second.applied, 0);
        assert_eq!(second.deduplicated, 2);
        assert_eq!(filled(&session, "heat"), 1);
    }

    #[test]
    fn test_received_commands_are_not_echoed() {
        let sender = PeerIdentity::peer("bo");
        let mut session = SyncSession::new(SyncConfig::default(), PeerIdentity::peer("ana"));
        session.handle_message(sender.id, batch_from(&sender, clocks(), vec![create_meter("heat")]));
        assert!(session.collect_outgoing().is_empty());
    }

    #[test]
    fn test_own_echo_is_skipped() {
        let me = PeerIdentity::peer("ana");
        let mut session = SyncSession::new(SyncConfig::default(), me.clone());
        let report = session.handle_message(me.id, batch_from(&me, clocks(), vec![create_meter("x")]));
        assert_eq!(
            report,
            InboundReport::Skipped {
                reason: SkipReason::OwnMessage
            }
        );
    }

    #[test]
    fn test_apply_failure_parks_and_requests_resync() {
        let sender = PeerIdentity::peer("bo");
        let mut session = SyncSession::new(SyncConfig::default(), PeerIdentity::peer("ana"));
        let orphan = advance("heat", 1);
        let orphan_id = orphan.command_id;

        let report = session.handle_message(sender.id, batch_from(&sender, clocks(), vec![orphan.clone()]));
        let InboundReport::Batch(report) = report else {
            panic!("expected batch");
        };
        assert!(report.failure.is_some());
        assert_eq!(report.parked, 1);
        assert!(session.filter().contains(&orphan_id));
        assert!(session.is_awaiting_snapshot());

        let out = session.collect_outgoing();
        assert!(out.iter().any(|o| matches!(o, Outbound::Broadcast(SyncMessage::ResyncRequest { .. }))));

        // A redelivery is a duplicate; the late create releases the parked advance
        let again = session.handle_message(sender.id, batch_from(&sender, clocks(), vec![orphan]));
        assert!(matches!(again, InboundReport::Batch(BatchReport { deduplicated: 1, .. })));
        session.handle_message(sender.id, batch_from(&sender, clocks(), vec![create_meter("heat")]));
        assert_eq!(session.parked_len(), 0);
        assert_eq!(filled(&session, "heat"), 1);
        assert_eq!(session.log().commands("clocks").len(), 2);
    }

    #[test]
    fn test_unknown_category_is_malformed_not_fatal() {
        let sender = PeerIdentity::peer("bo");
        let mut session = SyncSession::new(SyncConfig::default(), PeerIdentity::peer("ana"));
        let mut commands = IndexMap::new();
        commands.insert(Category::new("loot"), vec![create_meter("x")]);
        commands.insert(clocks(), vec![create_meter("heat")]);
        let report = session.handle_message(
            sender.id,
            SyncMessage::CommandsAdded {
                sender_id: sender.id,
                sender_name: sender.name.clone(),
                command_count: 2,
                commands,
                turn_states: None,
                timestamp: 0,
            },
        );
        let InboundReport::Batch(report) = report else {
            panic!("expected batch");
        };
        assert_eq!(report.applied, 1);
        assert_eq!(report.malformed.len(), 1);
        assert_eq!(session.metrics().malformed, 1);
    }

    #[test]
    fn test_garbage_envelope_never_errors() {
        let mut session = SyncSession::new(SyncConfig::default(), PeerIdentity::peer("ana"));
        let report = session.handle_envelope(PeerId::new(), "{{{");
        assert!(matches!(
            report,
            InboundReport::Skipped {
                reason: SkipReason::Malformed(_)
            }
        ));
    }

    #[test]
    fn test_breaker_trips_then_suppresses() {
        let config = SyncConfig {
            breaker: BreakerConfig {
                large_batch_threshold: 2,
                trip_after: 2,
            },
            ..Default::default()
        };
        let notifier = RecordingNotifier::new();
        let mut session = SyncSession::new(config, PeerIdentity::peer("ana"))
            .with_notifier(Arc::new(notifier.clone()));
        let journal = Category::journal();
        let burst = |session: &mut SyncSession| {
            for i in 0..3 {
                session
                    .submit(&journal, "entry.add", json!({"text": format!("line {i}")}))
                    .expect("append");
            }
            session.collect_outgoing()
        };

        assert_eq!(burst(&mut session).len(), 1);
        // The tripping batch still goes out
        assert_eq!(burst(&mut session).len(), 1);
        assert!(session.is_tripped());
        assert_eq!(notifier.count(NoticeLevel::Error), 1);

        assert!(burst(&mut session).is_empty());
        assert!(session.collect_outgoing().is_empty());
        assert_eq!(session.metrics().commands_suppressed, 3);
        assert_eq!(session.log().total_pending(), 3);

        // The held backlog goes out with the first batch after the reset
        session.reset_breaker();
        assert!(!session.is_tripped());
        session.submit(&journal, "entry.add", json!({"text": "after"})).expect("append");
        let out = session.collect_outgoing();
        let Outbound::Broadcast(SyncMessage::CommandsAdded { command_count, .. }) = &out[0] else {
            panic!("expected batch");
        };
        assert_eq!(*command_count, 4);
        assert_eq!(session.log().total_pending(), 0);
    }

    #[test]
    fn test_authority_persists_after_remote_batch() {
        let store = Arc::new(MemoryStore::new());
        let sender = PeerIdentity::peer("bo");
        let mut gm = SyncSession::new(SyncConfig::default(), PeerIdentity::authority("gm"))
            .with_store(store.clone());
        gm.bootstrap().expect("bootstrap");

        let report = gm.handle_message(sender.id, batch_from(&sender, clocks(), vec![create_meter("heat")]));
        let InboundReport::Batch(report) = report else {
            panic!("expected batch");
        };
        assert!(report.persisted);
        assert_eq!(load_commands(store.as_ref()).expect("load")[&clocks()].len(), 1);
    }

    #[test]
    fn test_persist_failure_does_not_block_merge() {
        let store = Arc::new(MemoryStore::new());
        store.set_fail_writes(true);
        let notifier = RecordingNotifier::new();
        let sender = PeerIdentity::peer("bo");
        let mut gm = SyncSession::new(SyncConfig::default(), PeerIdentity::authority("gm"))
            .with_store(store.clone())
            .with_notifier(Arc::new(notifier.clone()));

        let report = gm.handle_message(sender.id, batch_from(&sender, clocks(), vec![create_meter("heat")]));
        let InboundReport::Batch(report) = report else {
            panic!("expected batch");
        };
        assert_eq!(report.applied, 1);
        assert!(!report.persisted);
        assert!(gm.has_unpersisted());
        assert_eq!(notifier.count(NoticeLevel::Warn), 1);

        store.set_fail_writes(false);
        assert!(gm.persist_if_dirty().expect("retry"));
        assert!(!gm.has_unpersisted());
    }

    #[test]
    fn test_non_authority_never_persists() {
        let store = Arc::new(MemoryStore::new());
        let mut peer = SyncSession::new(SyncConfig::default(), PeerIdentity::peer("ana"))
            .with_store(store.clone());
        peer.append_local(&clocks(), create_meter("heat")).expect("append");
        assert!(!peer.persist().expect("persist"));
        assert!(load_commands(store.as_ref()).expect("load").is_empty());
    }

    #[test]
    fn test_bootstrap_preregisters_loaded_ids() {
        let store = Arc::new(MemoryStore::new());
        let create = create_meter("heat");
        let tick = advance("heat", 1);
        let mut blob = CommandBlob::new();
        blob.insert(clocks(), vec![create.clone(), tick.clone()]);
        store_commands(store.as_ref(), &blob).expect("seed");

        let mut gm = SyncSession::new(SyncConfig::default(), PeerIdentity::authority("gm"))
            .with_store(store);
        assert_eq!(gm.bootstrap().expect("bootstrap"), 2);
        assert!(gm.collect_outgoing().is_empty());

        let sender = PeerIdentity::peer("bo");
        let report = gm.handle_message(sender.id, batch_from(&sender, clocks(), vec![create, tick]));
        let InboundReport::Batch(report) = report else {
            panic!("expected batch");
        };
        assert_eq!(report.deduplicated, 2);
        assert_eq!(filled(&gm, "heat"), 1);
    }

    #[test]
    fn test_take_action_routing() {
        let actor = ActorId::from_name("Vex");
        let requester = PeerIdentity::peer("bo");
        let prompt = SyncMessage::TakeAction {
            actor_id: actor,
            requester_id: requester.id,
            requester_name: requester.name.clone(),
        };

        let mut controller =
            SyncSession::new(SyncConfig::default(), PeerIdentity::peer("ana").controlling(actor));
        let mut bystander = SyncSession::new(SyncConfig::default(), PeerIdentity::peer("cy"));
        let mut gm = SyncSession::new(SyncConfig::default(), PeerIdentity::authority("gm"));

        assert_eq!(
            controller.handle_message(requester.id, prompt.clone()),
            InboundReport::Surfaced { actor }
        );
        assert_eq!(
            bystander.handle_message(requester.id, prompt.clone()),
            InboundReport::Skipped {
                reason: SkipReason::NotController
            }
        );
        assert_eq!(gm.handle_message(requester.id, prompt), InboundReport::Surfaced { actor });
    }

    #[test]
    fn test_failed_commit_rolls_back_turn() {
        let gm = PeerIdentity::authority("gm");
        let mut session = SyncSession::new(SyncConfig::default(), gm);
        let actor = ActorId::from_name("Vex");

        session.turn_event(actor, TurnEvent::StartTurn).expect("start");
        session
            .turn_edit(actor, TurnEdit::Action(Some("skirmish".into())))
            .expect("action");
        session.turn_edit(actor, TurnEdit::Position(Some(Position::Risky))).expect("position");
        session.turn_edit(actor, TurnEdit::Effect(Some(Effect::Standard))).expect("effect");
        session.turn_event(actor, TurnEvent::CommitRoll).expect("commit roll");
        session
            .turn_event(actor, TurnEvent::Rolled(renga_types::RollOutcome::from_dice(&[2], false)))
            .expect("rolled");
        session
            .turn_edit(
                actor,
                TurnEdit::Consequence(Some(renga_types::ConsequenceTransaction {
                    target: Some("missing-meter".into()),
                    segments: 2,
                    note: None,
                })),
            )
            .expect("consequence");
        let before = session.turn(&actor).cloned().expect("record");

        let err = session
            .turn_event(actor, TurnEvent::CommitConsequence)
            .expect_err("meter does not exist");
        assert!(matches!(err, SyncError::Apply { .. }));
        assert_eq!(session.turn(&actor), Some(&before));
        assert_eq!(session.turn(&actor).map(|r| r.state), Some(TurnPhase::AwaitingResolution));
    }

    #[test]
    fn test_dedup_compaction_respects_retention() {
        let config = SyncConfig {
            dedup_retention_secs: 1,
            ..Default::default()
        };
        let mut session = SyncSession::new(config, PeerIdentity::peer("ana"));
        session
            .append_local(&clocks(), create_meter("heat").with_timestamp(1_000))
            .expect("append");
        assert_eq!(session.compact_dedup(1_500), 0);
        assert_eq!(session.compact_dedup(5_000), 1);
        assert!(session.filter().is_empty());

        let mut keep_all = SyncSession::new(SyncConfig::default(), PeerIdentity::peer("bo"));
        keep_all
            .append_local(&clocks(), create_meter("heat").with_timestamp(1_000))
            .expect("append");
        assert_eq!(keep_all.compact_dedup(u64::MAX), 0);
    }

    #[test]
    fn test_compacted_range_still_admits_unseen_commands() {
        let config = SyncConfig {
            dedup_retention_secs: 1,
            ..Default::default()
        };
        let sender = PeerIdentity::peer("bo");
        let mut session = SyncSession::new(config, PeerIdentity::peer("ana"));
        let create = create_meter("heat");
        session.handle_message(sender.id, batch_from(&sender, clocks(), vec![create.clone()]));
        assert_eq!(session.compact_dedup(5_000), 1);

        // Written before the watermark but delayed in transit
        let late = advance("heat", 1).with_timestamp(3_000);
        let report = session.handle_message(sender.id, batch_from(&sender, clocks(), vec![late.clone()]));
        assert!(matches!(report, InboundReport::Batch(BatchReport { applied: 1, .. })));
        assert_eq!(filled(&session, "heat"), 1);

        // Compacted and redelivered commands are still recognized
        let report = session.handle_message(sender.id, batch_from(&sender, clocks(), vec![create, late]));
        assert!(matches!(
            report,
            InboundReport::Batch(BatchReport { applied: 0, deduplicated: 2, .. })
        ));
        assert_eq!(filled(&session, "heat"), 1);
        assert_eq!(session.log().commands("clocks").len(), 2);
    }

    #[test]
    fn test_malformed_commands_are_dropped_not_parked() {
        let sender = PeerIdentity::peer("bo");
        let mut session = SyncSession::new(SyncConfig::default(), PeerIdentity::peer("ana"));
        session.collect_outgoing();
        let bad_payload = Command::new("meter.create", json!({"meterId": "x", "segments": 0}));
        let bad_type = Command::new("meter.explode", json!({"meterId": "x"}));
        let bad_id = bad_type.command_id;

        let report = session.handle_message(
            sender.id,
            batch_from(&sender, clocks(), vec![bad_payload, bad_type.clone(), create_meter("heat")]),
        );
        let InboundReport::Batch(report) = report else {
            panic!("expected batch");
        };
        assert_eq!(report.applied, 1);
        assert_eq!(report.malformed.len(), 2);
        assert_eq!(report.parked, 0);
        assert!(report.failure.is_none());
        assert_eq!(session.parked_len(), 0);
        assert!(!session.is_awaiting_snapshot());
        assert!(session.collect_outgoing().is_empty());

        // A redelivery is not reported again
        let again = session.handle_message(sender.id, batch_from(&sender, clocks(), vec![bad_type]));
        assert!(matches!(again, InboundReport::Batch(BatchReport { deduplicated: 1, .. })));
        assert!(session.filter().contains(&bad_id));
    }

    #[test]
    fn test_rebuild_drops_malformed_history() {
        let store = Arc::new(MemoryStore::new());
        let mut blob = CommandBlob::new();
        blob.insert(
            clocks(),
            vec![
                create_meter("heat"),
                Command::new("meter.explode", json!({})).with_timestamp(150),
                advance("heat", 1),
            ],
        );
        store_commands(store.as_ref(), &blob).expect("seed");

        let mut gm = SyncSession::new(SyncConfig::default(), PeerIdentity::authority("gm"))
            .with_store(store);
        assert_eq!(gm.bootstrap().expect("bootstrap"), 2);
        assert_eq!(gm.parked_len(), 0);
        assert_eq!(gm.metrics().malformed, 1);
        assert_eq!(filled(&gm, "heat"), 1);
    }
}
