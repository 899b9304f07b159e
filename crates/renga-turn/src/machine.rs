//! The turn state machine.
//!
//! A record moves between [`TurnPhase`]s only through the table in
//! [`next_phase`]. Anything not in the table is rejected and the record is left
//! exactly as it was.
//!
//! ```text
//!  IDLE ─start─▶ DECIDING ─commit roll─▶ RESOLVING ─favorable─▶ SUCCESS ─close─▶ COMPLETE ─reset─▶ IDLE
//!                                          │   ▲
//!                              unfavorable │   │ retry elapsed
//!                                          ▼   │
//!                              AWAITING_RESOLUTION ─spend retry─▶ RETRY_RESOLVING
//!                                │            └─retry exhausted─▶ RETRY_LOCKED
//!                                └─commit consequence─▶ APPLYING ─finish─▶ COMPLETE
//!
//!  cancel: DECIDING | RESOLVING | RETRY_RESOLVING | AWAITING_RESOLUTION | SUCCESS ─▶ IDLE
//!  full reset: any ─▶ IDLE
//! ```
//!
//! Staged transactions become durable [`Command`]s only on the two commit
//! transitions (`CommitConsequence` and `Close`), and only if the whole
//! transition succeeds.

use std::fmt;

use renga_types::{
    Category, Command, ConsequenceTransaction, Effect, PeerId, Position, Role, RollOutcome,
    TraitOp, TraitTransaction, TurnPhase, TurnRecord,
};
use serde_json::json;
use strum::EnumIter;
use tracing::{debug, trace};

use crate::error::{TurnError, TurnResult};
use crate::fields;

// ============================================================================
// Transitions
// ============================================================================

/// The label of an edge in the transition table.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, EnumIter)]
pub enum TransitionKind {
    StartTurn,
    CommitRoll,
    Favorable,
    Unfavorable,
    Close,
    Reset,
    CommitConsequence,
    SpendRetry,
    RetryExhausted,
    RetryElapsed,
    Finish,
    Cancel,
    FullReset,
}

impl TransitionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransitionKind::StartTurn => "start turn",
            TransitionKind::CommitRoll => "commit roll",
            TransitionKind::Favorable => "resolve favorably",
            TransitionKind::Unfavorable => "resolve unfavorably",
            TransitionKind::Close => "close",
            TransitionKind::Reset => "reset",
            TransitionKind::CommitConsequence => "commit consequence",
            TransitionKind::SpendRetry => "spend retry",
            TransitionKind::RetryExhausted => "spend exhausted retry",
            TransitionKind::RetryElapsed => "finish retry delay",
            TransitionKind::Finish => "finish",
            TransitionKind::Cancel => "cancel",
            TransitionKind::FullReset => "full reset",
        }
    }
}

impl fmt::Display for TransitionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The transition table. `None` means the edge does not exist.
pub fn next_phase(from: TurnPhase, kind: TransitionKind) -> Option<TurnPhase> {
    use TransitionKind as K;
    use TurnPhase as P;

    match (from, kind) {
        (_, K::FullReset) => Some(P::Idle),
        (P::Idle, K::StartTurn) => Some(P::Deciding),
        (P::Deciding, K::CommitRoll) => Some(P::Resolving),
        (P::Resolving, K::Favorable) => Some(P::Success),
        (P::Resolving, K::Unfavorable) => Some(P::AwaitingResolution),
        (P::Success, K::Close) => Some(P::Complete),
        (P::Complete, K::Reset) => Some(P::Idle),
        (P::AwaitingResolution, K::CommitConsequence) => Some(P::Applying),
        (P::AwaitingResolution, K::SpendRetry) => Some(P::RetryResolving),
        (P::AwaitingResolution, K::RetryExhausted) => Some(P::RetryLocked),
        (P::RetryResolving, K::RetryElapsed) => Some(P::Resolving),
        (P::Applying, K::Finish) => Some(P::Complete),
        (
            P::Deciding | P::Resolving | P::RetryResolving | P::AwaitingResolution | P::Success,
            K::Cancel,
        ) => Some(P::Idle),
        _ => None,
    }
}

/// An event driving the machine. Some carry the data their edge needs.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TurnEvent {
    StartTurn,
    /// Lock in the plan; action, position and effect must be chosen.
    CommitRoll,
    /// The dice landed. Favorable results go to `SUCCESS`.
    Rolled(RollOutcome),
    Close,
    Reset,
    CommitConsequence,
    /// Spend the retry resource; `available` is whether the actor had any.
    SpendRetry { available: bool },
    RetryElapsed,
    Finish,
    Cancel,
    FullReset,
}

impl TurnEvent {
    pub fn kind(&self) -> TransitionKind {
        match self {
            TurnEvent::StartTurn => TransitionKind::StartTurn,
            TurnEvent::CommitRoll => TransitionKind::CommitRoll,
            TurnEvent::Rolled(roll) if roll.result.is_favorable() => TransitionKind::Favorable,
            TurnEvent::Rolled(_) => TransitionKind::Unfavorable,
            TurnEvent::Close => TransitionKind::Close,
            TurnEvent::Reset => TransitionKind::Reset,
            TurnEvent::CommitConsequence => TransitionKind::CommitConsequence,
            TurnEvent::SpendRetry { available: true } => TransitionKind::SpendRetry,
            TurnEvent::SpendRetry { available: false } => TransitionKind::RetryExhausted,
            TurnEvent::RetryElapsed => TransitionKind::RetryElapsed,
            TurnEvent::Finish => TransitionKind::Finish,
            TurnEvent::Cancel => TransitionKind::Cancel,
            TurnEvent::FullReset => TransitionKind::FullReset,
        }
    }
}

/// Who is driving a transition or edit.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TurnContext {
    pub editor: PeerId,
    pub role: Role,
}

impl TurnContext {
    pub fn new(editor: PeerId, role: Role) -> Self {
        Self { editor, role }
    }
}

/// A durable command produced by a commit transition.
#[derive(Clone, Debug, PartialEq)]
pub struct StagedCommit {
    pub category: Category,
    pub command: Command,
}

/// What a successful transition did.
#[derive(Clone, Debug, PartialEq)]
pub struct Transition {
    pub from: TurnPhase,
    pub to: TurnPhase,
    pub kind: TransitionKind,
    /// Durable commands to append, in order.
    pub commits: Vec<StagedCommit>,
}

/// Apply one event to a record.
///
/// On error the record is unchanged. On success the record's write stamp is
/// bumped to `ctx.editor`, and a transition that leaves the record reset
/// opens a new epoch.
pub fn apply(record: &mut TurnRecord, event: TurnEvent, ctx: &TurnContext) -> TurnResult<Transition> {
    let from = record.state;
    let kind = event.kind();
    let Some(to) = next_phase(from, kind) else {
        debug!(%from, transition = %kind, "rejected illegal transition");
        return Err(TurnError::IllegalTransition {
            from,
            transition: kind,
        });
    };

    // Build the replacement first so a failed check leaves `record` alone
    let mut next = record.clone();
    let mut commits = Vec::new();

    match event {
        TurnEvent::StartTurn | TurnEvent::Reset | TurnEvent::Cancel | TurnEvent::FullReset => {
            clear_staged(&mut next);
        }
        TurnEvent::CommitRoll => {
            check_plan(&next)?;
        }
        TurnEvent::Rolled(roll) => {
            fields::last_roll(Some(&roll))?;
            next.last_roll = Some(roll);
        }
        TurnEvent::Close => {
            if let Some(tx) = &next.consequence_tx {
                // Optional meter adjustment on the success branch
                commits.push(meter_commit(tx)?);
            }
            if let Some(tx) = &next.trait_tx {
                commits.extend(trait_commit(tx));
            }
        }
        TurnEvent::CommitConsequence => {
            if !ctx.role.is_authority() {
                return Err(TurnError::NotAuthorized {
                    action: "commit a consequence",
                });
            }
            let tx = next
                .consequence_tx
                .as_ref()
                .ok_or_else(|| TurnError::missing("no consequence staged"))?;
            commits.push(meter_commit(tx)?);
            if let Some(tx) = &next.trait_tx {
                commits.extend(trait_commit(tx));
            }
        }
        TurnEvent::SpendRetry { .. } | TurnEvent::Finish => {}
        TurnEvent::RetryElapsed => {
            // Reroll with the same plan
            next.last_roll = None;
        }
    }

    next.state = to;
    stamp(&mut next, record.revision, ctx.editor);
    if next.is_reset() && !record.is_reset() {
        next.epoch = record.epoch + 1;
    }
    *record = next;

    trace!(%from, %to, transition = %kind, commits = commits.len(), "turn transition");
    Ok(Transition {
        from,
        to,
        kind,
        commits,
    })
}

fn clear_staged(record: &mut TurnRecord) {
    *record = TurnRecord {
        epoch: record.epoch,
        revision: record.revision,
        editor: record.editor,
        ..TurnRecord::default()
    };
}

fn stamp(record: &mut TurnRecord, previous: u64, editor: PeerId) {
    record.revision = previous + 1;
    record.editor = Some(editor);
}

fn check_plan(record: &TurnRecord) -> TurnResult<()> {
    if record.action.is_none() {
        return Err(TurnError::missing("no action chosen"));
    }
    if record.position.is_none() {
        return Err(TurnError::missing("no position chosen"));
    }
    if record.effect.is_none() {
        return Err(TurnError::missing("no effect chosen"));
    }
    Ok(())
}

fn meter_commit(tx: &ConsequenceTransaction) -> TurnResult<StagedCommit> {
    let target = tx
        .target
        .as_deref()
        .ok_or_else(|| TurnError::missing("consequence has no target meter"))?;
    if tx.segments == 0 {
        return Err(TurnError::missing("consequence has no segments"));
    }
    Ok(StagedCommit {
        category: Category::clocks(),
        command: Command::new(
            "meter.advance",
            json!({ "meterId": target, "ticks": tx.segments }),
        ),
    })
}

fn trait_commit(tx: &TraitTransaction) -> Option<StagedCommit> {
    match &tx.op {
        TraitOp::Create { name } => Some(StagedCommit {
            category: Category::traits(),
            command: Command::new(
                "trait.create",
                json!({
                    "traitId": uuid::Uuid::new_v4().simple().to_string(),
                    "actorId": tx.target_actor,
                    "name": name,
                }),
            ),
        }),
        // The trait already exists durably
        TraitOp::Reuse { .. } => None,
    }
}

// ============================================================================
// Field edits
// ============================================================================

/// A local change to one staged field.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TurnEdit {
    Action(Option<String>),
    Position(Option<Position>),
    Effect(Option<Effect>),
    Equipped(Vec<String>),
    Approved(bool),
    Pushed(bool),
    Improved(bool),
    Trait(Option<TraitTransaction>),
    Consequence(Option<ConsequenceTransaction>),
}

impl TurnEdit {
    pub fn field(&self) -> &'static str {
        match self {
            TurnEdit::Action(_) => "action",
            TurnEdit::Position(_) => "position",
            TurnEdit::Effect(_) => "effect",
            TurnEdit::Equipped(_) => "equipped",
            TurnEdit::Approved(_) => "approved",
            TurnEdit::Pushed(_) => "pushed",
            TurnEdit::Improved(_) => "improved",
            TurnEdit::Trait(_) => "traitTx",
            TurnEdit::Consequence(_) => "consequenceTx",
        }
    }

    /// Phases in which this field may be edited.
    fn allowed_in(&self, phase: TurnPhase) -> bool {
        match self {
            TurnEdit::Action(_)
            | TurnEdit::Position(_)
            | TurnEdit::Effect(_)
            | TurnEdit::Equipped(_)
            | TurnEdit::Approved(_)
            | TurnEdit::Pushed(_)
            | TurnEdit::Improved(_) => phase == TurnPhase::Deciding,
            TurnEdit::Trait(_) | TurnEdit::Consequence(_) => {
                matches!(phase, TurnPhase::AwaitingResolution | TurnPhase::Success)
            }
        }
    }
}

/// Apply a field edit to a record in place.
pub fn edit(record: &mut TurnRecord, edit: TurnEdit, ctx: &TurnContext) -> TurnResult<()> {
    let field = edit.field();
    if !edit.allowed_in(record.state) {
        return Err(TurnError::EditNotAllowed {
            field,
            phase: record.state,
        });
    }

    match edit {
        TurnEdit::Action(value) => {
            fields::action(value.as_deref())?;
            record.action = value;
        }
        TurnEdit::Position(value) => record.position = value,
        TurnEdit::Effect(value) => record.effect = value,
        TurnEdit::Equipped(items) => {
            fields::equipped(&items)?;
            record.equipped = items;
        }
        TurnEdit::Approved(value) => {
            if !ctx.role.is_authority() {
                return Err(TurnError::NotAuthorized {
                    action: "approve a plan",
                });
            }
            record.approved = value;
        }
        TurnEdit::Pushed(value) => record.pushed = value,
        TurnEdit::Improved(value) => record.improved = value,
        TurnEdit::Trait(tx) => {
            fields::trait_tx(tx.as_ref())?;
            record.trait_tx = tx;
        }
        TurnEdit::Consequence(tx) => {
            if record.state == TurnPhase::AwaitingResolution && !ctx.role.is_authority() {
                return Err(TurnError::NotAuthorized {
                    action: "configure a consequence",
                });
            }
            fields::consequence_tx(tx.as_ref())?;
            record.consequence_tx = tx;
        }
    }

    let previous = record.revision;
    stamp(record, previous, ctx.editor);
    trace!(field, revision = record.revision, "turn field edited");
    Ok(())
}
