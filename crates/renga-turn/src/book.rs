//! Every actor's turn record, keyed by [`ActorId`].
//!
//! Records are created lazily on first reference as the default idle record.
//! Local changes mark the actor dirty; [`TurnBook::take_dirty`] hands the
//! changed records to the sync layer for broadcast. Remote merges never mark
//! anything dirty, so a received record is not echoed back.

use std::collections::BTreeSet;

use indexmap::IndexMap;
use renga_types::{ActorId, TurnRecord};
use tracing::{debug, info};

use crate::error::TurnResult;
use crate::machine::{self, Transition, TurnContext, TurnEdit, TurnEvent};
use crate::merge::{self, MergeOutcome};

#[derive(Debug, Clone)]
pub struct TurnBook {
    ctx: TurnContext,
    records: IndexMap<ActorId, TurnRecord>,
    dirty: BTreeSet<ActorId>,
}

impl TurnBook {
    pub fn new(ctx: TurnContext) -> Self {
        Self {
            ctx,
            records: IndexMap::new(),
            dirty: BTreeSet::new(),
        }
    }

    pub fn context(&self) -> &TurnContext {
        &self.ctx
    }

    /// The record for `actor`, or `None` if it was never referenced.
    pub fn get(&self, actor: &ActorId) -> Option<&TurnRecord> {
        self.records.get(actor)
    }

    /// The record for `actor`, created idle on first reference.
    pub fn record(&mut self, actor: ActorId) -> &TurnRecord {
        self.records.entry(actor).or_default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn actors(&self) -> impl Iterator<Item = &ActorId> {
        self.records.keys()
    }

    /// Drive `actor`'s machine with one event.
    pub fn apply(&mut self, actor: ActorId, event: TurnEvent) -> TurnResult<Transition> {
        let record = self.records.entry(actor).or_default();
        let transition = machine::apply(record, event, &self.ctx)?;
        self.dirty.insert(actor);
        Ok(transition)
    }

    /// Change one staged field of `actor`'s record.
    pub fn edit(&mut self, actor: ActorId, edit: TurnEdit) -> TurnResult<()> {
        let record = self.records.entry(actor).or_default();
        machine::edit(record, edit, &self.ctx)?;
        self.dirty.insert(actor);
        Ok(())
    }

    /// Merge a record received from a peer.
    pub fn merge_remote(&mut self, actor: ActorId, remote: &TurnRecord) -> MergeOutcome {
        let record = self.records.entry(actor).or_default();
        let outcome = merge::merge(record, remote);
        if outcome.changed() {
            debug!(actor = %actor, state = %record.state, ?outcome, "merged remote turn record");
        }
        outcome
    }

    /// Put back a record captured before a transition whose side effects
    /// could not be committed.
    pub fn restore(&mut self, actor: ActorId, record: TurnRecord) {
        self.records.insert(actor, record);
    }

    /// Clear every actor's record, including dead-ended ones.
    ///
    /// Every record that was not already reset is stamped and marked dirty so
    /// the clear propagates.
    pub fn full_reset(&mut self) -> usize {
        let mut cleared = 0;
        for (actor, record) in self.records.iter_mut() {
            if record.is_reset() {
                continue;
            }
            // FullReset is legal from every phase
            if machine::apply(record, TurnEvent::FullReset, &self.ctx).is_ok() {
                self.dirty.insert(*actor);
                cleared += 1;
            }
        }
        info!(cleared, "full turn reset");
        cleared
    }

    /// Records changed locally since the last call.
    pub fn take_dirty(&mut self) -> IndexMap<ActorId, TurnRecord> {
        let dirty = std::mem::take(&mut self.dirty);
        dirty
            .into_iter()
            .filter_map(|actor| self.records.get(&actor).map(|r| (actor, r.clone())))
            .collect()
    }

    pub fn has_dirty(&self) -> bool {
        !self.dirty.is_empty()
    }

    /// Copy of every record (resync snapshots).
    pub fn snapshot(&self) -> IndexMap<ActorId, TurnRecord> {
        self.records.clone()
    }

    /// Drop every record and pending broadcast.
    pub fn clear(&mut self) {
        self.records.clear();
        self.dirty.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TurnError;
    use renga_types::{PeerId, Role, TurnPhase};

    fn book() -> TurnBook {
        TurnBook::new(TurnContext::new(PeerId::new(), Role::Peer))
    }

    #[test]
    fn test_lazy_idle_record() {
        let mut book = book();
        let actor = ActorId::from_name("Nyx");
        assert!(book.get(&actor).is_none());
        assert_eq!(book.record(actor).state, TurnPhase::Idle);
        assert_eq!(book.len(), 1);
        assert!(!book.has_dirty());
    }

    #[test]
    fn test_local_changes_mark_dirty_once() {
        let mut book = book();
        let actor = ActorId::from_name("Nyx");
        book.apply(actor, TurnEvent::StartTurn).expect("start");
        book.edit(actor, TurnEdit::Action(Some("tinker".into()))).expect("edit");

        let dirty = book.take_dirty();
        assert_eq!(dirty.len(), 1);
        assert_eq!(dirty[&actor].action.as_deref(), Some("tinker"));
        assert!(book.take_dirty().is_empty());
    }

    #[test]
    fn test_rejected_transition_is_not_dirty() {
        let mut book = book();
        let actor = ActorId::from_name("Nyx");
        let err = book.apply(actor, TurnEvent::Close).expect_err("idle cannot close");
        assert!(matches!(err, TurnError::IllegalTransition { .. }));
        assert!(!book.has_dirty());
    }

    #[test]
    fn test_remote_merge_is_not_rebroadcast() {
        let mut book = book();
        let actor = ActorId::from_name("Nyx");
        let remote = TurnRecord {
            state: TurnPhase::Deciding,
            revision: 1,
            editor: Some(PeerId::new()),
            ..Default::default()
        };
        assert!(book.merge_remote(actor, &remote).changed());
        assert!(!book.has_dirty());
    }

    #[test]
    fn test_full_reset_clears_locked_records() {
        let mut book = book();
        let a = ActorId::from_name("Nyx");
        let b = ActorId::from_name("Vex");
        book.merge_remote(
            a,
            &TurnRecord {
                state: TurnPhase::RetryLocked,
                action: Some("skirmish".into()),
                revision: 9,
                editor: Some(PeerId::new()),
                ..Default::default()
            },
        );
        book.record(b);

        assert_eq!(book.full_reset(), 1);
        assert!(book.get(&a).expect("a").is_reset());
        assert_eq!(book.get(&a).expect("a").revision, 10);
        assert_eq!(book.get(&a).expect("a").epoch, 1);
        assert_eq!(book.take_dirty().len(), 1);
    }
}
