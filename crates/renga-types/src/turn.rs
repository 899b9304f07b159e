//! Turn-state record types: the ephemeral half of the data model.
//!
//! One [`TurnRecord`] exists per actor. Its fields are replicated individually
//! and merged field-by-field (see `renga-turn`); this module only defines the
//! data and a few predicates the merge rules need.
//!
//! ## Staged transactions
//!
//! [`TraitTransaction`] and [`ConsequenceTransaction`] are provisional edits
//! held inside the record. They only become durable commands when the turn
//! machine reaches a commit transition.

use std::str::FromStr;

use serde::{Deserialize, Serialize};
use strum::{EnumIter, EnumString};

use crate::ids::{ActorId, PeerId};

/// Where an actor's turn currently sits.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, Default, Serialize, Deserialize, EnumString, EnumIter,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE", ascii_case_insensitive)]
pub enum TurnPhase {
    /// No turn in progress.
    #[default]
    Idle,
    /// Player is choosing action, position, effect, and gear.
    Deciding,
    /// Dice/outcome in flight.
    Resolving,
    /// Bounded reroll path after spending a retry resource.
    RetryResolving,
    /// Retry resource exhausted; only an external full reset clears this.
    RetryLocked,
    /// Favorable outcome; optional meter adjustment before closing.
    Success,
    /// The authority is configuring a consequence.
    AwaitingResolution,
    /// Consequence committed, transient.
    Applying,
    /// Terminal; triggers cleanup.
    Complete,
}

impl TurnPhase {
    /// Parse from string (case-insensitive).
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        <Self as FromStr>::from_str(s).ok()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TurnPhase::Idle => "IDLE",
            TurnPhase::Deciding => "DECIDING",
            TurnPhase::Resolving => "RESOLVING",
            TurnPhase::RetryResolving => "RETRY_RESOLVING",
            TurnPhase::RetryLocked => "RETRY_LOCKED",
            TurnPhase::Success => "SUCCESS",
            TurnPhase::AwaitingResolution => "AWAITING_RESOLUTION",
            TurnPhase::Applying => "APPLYING",
            TurnPhase::Complete => "COMPLETE",
        }
    }

    /// Any phase other than `Idle` counts as an active turn.
    pub fn is_active(&self) -> bool {
        !matches!(self, TurnPhase::Idle)
    }
}

impl std::fmt::Display for TurnPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// How dangerous the chosen approach is.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(ascii_case_insensitive)]
pub enum Position {
    Controlled,
    Risky,
    Desperate,
}

impl Position {
    pub fn as_str(&self) -> &'static str {
        match self {
            Position::Controlled => "controlled",
            Position::Risky => "risky",
            Position::Desperate => "desperate",
        }
    }
}

/// How much the action accomplishes on success.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(ascii_case_insensitive)]
pub enum Effect {
    Zero,
    Limited,
    Standard,
    Great,
    Extreme,
}

impl Effect {
    pub fn as_str(&self) -> &'static str {
        match self {
            Effect::Zero => "zero",
            Effect::Limited => "limited",
            Effect::Standard => "standard",
            Effect::Great => "great",
            Effect::Extreme => "extreme",
        }
    }

    /// One level better, saturating at `Extreme`.
    pub fn improved(self) -> Self {
        match self {
            Effect::Zero => Effect::Limited,
            Effect::Limited => Effect::Standard,
            Effect::Standard => Effect::Great,
            Effect::Great | Effect::Extreme => Effect::Extreme,
        }
    }

    /// Meter segments this effect level ticks on a progress meter.
    pub fn ticks(self) -> u32 {
        match self {
            Effect::Zero => 0,
            Effect::Limited => 1,
            Effect::Standard => 2,
            Effect::Great => 3,
            Effect::Extreme => 5,
        }
    }
}

/// Result band of a dice roll.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RollResult {
    Critical,
    Success,
    Partial,
    Failure,
}

impl RollResult {
    /// Favorable outcomes go to `Success`; everything else needs a consequence.
    pub fn is_favorable(&self) -> bool {
        matches!(self, RollResult::Critical | RollResult::Success)
    }
}

/// A finished roll: the dice shown to players plus the result band.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RollOutcome {
    pub dice: Vec<u8>,
    pub result: RollResult,
}

impl RollOutcome {
    /// Read a d6 pool.
    ///
    /// With a zero pool the caller rolls two dice and keeps the lowest, which
    /// also means no critical is possible.
    pub fn from_dice(dice: &[u8], zero_pool: bool) -> Self {
        let result = if dice.is_empty() {
            RollResult::Failure
        } else if zero_pool {
            band(dice.iter().copied().min().unwrap_or(1))
        } else {
            let sixes = dice.iter().filter(|&&d| d == 6).count();
            if sixes >= 2 {
                RollResult::Critical
            } else {
                band(dice.iter().copied().max().unwrap_or(1))
            }
        };
        Self {
            dice: dice.to_vec(),
            result,
        }
    }
}

fn band(die: u8) -> RollResult {
    match die {
        6 => RollResult::Success,
        4 | 5 => RollResult::Partial,
        _ => RollResult::Failure,
    }
}

/// Trait edit staged during a turn.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TraitTransaction {
    pub target_actor: ActorId,
    pub op: TraitOp,
}

/// Create a new trait or reuse one the actor already has.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum TraitOp {
    #[serde(rename_all = "camelCase")]
    Create { name: String },
    #[serde(rename_all = "camelCase")]
    Reuse { trait_id: String },
}

/// Meter adjustment staged during a turn.
///
/// `target` is the meter id in the `clocks` category; it stays `None` until
/// the authority picks one.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsequenceTransaction {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    pub segments: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

/// Per-actor turn record.
///
/// `epoch`, `revision` and `editor` form the record's write stamp: a merge
/// ignores a remote record whose stamp is older than the local one. Every
/// transition into the reset shape opens a new epoch, so a reset outranks
/// any edit made before its writer saw it.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TurnRecord {
    pub state: TurnPhase,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub position: Option<Position>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub effect: Option<Effect>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub equipped: Vec<String>,
    pub approved: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trait_tx: Option<TraitTransaction>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub consequence_tx: Option<ConsequenceTransaction>,
    pub pushed: bool,
    pub improved: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_roll: Option<RollOutcome>,
    /// Reset generation.
    pub epoch: u64,
    pub revision: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub editor: Option<PeerId>,
}

impl TurnRecord {
    /// Whether any per-turn field holds a value.
    pub fn has_staged_data(&self) -> bool {
        self.action.is_some()
            || self.position.is_some()
            || self.effect.is_some()
            || !self.equipped.is_empty()
            || self.approved
            || self.trait_tx.is_some()
            || self.consequence_tx.is_some()
            || self.pushed
            || self.improved
            || self.last_roll.is_some()
    }

    /// Idle with nothing in flight: the shape a cleared record is broadcast in.
    pub fn is_reset(&self) -> bool {
        self.state == TurnPhase::Idle && !self.has_staged_data()
    }

    /// Field-wise equality, ignoring the write stamp.
    pub fn same_content(&self, other: &Self) -> bool {
        let Self {
            state,
            action,
            position,
            effect,
            equipped,
            approved,
            trait_tx,
            consequence_tx,
            pushed,
            improved,
            last_roll,
            epoch: _,
            revision: _,
            editor: _,
        } = self;
        *state == other.state
            && *action == other.action
            && *position == other.position
            && *effect == other.effect
            && *equipped == other.equipped
            && *approved == other.approved
            && *trait_tx == other.trait_tx
            && *consequence_tx == other.consequence_tx
            && *pushed == other.pushed
            && *improved == other.improved
            && *last_roll == other.last_roll
    }

    /// Write stamp used for last-writer-wins ordering.
    pub fn stamp(&self) -> (u64, u64, Option<PeerId>) {
        (self.epoch, self.revision, self.editor)
    }

    /// Effective effect after the improvement flag.
    pub fn effective_effect(&self) -> Option<Effect> {
        self.effect
            .map(|e| if self.improved { e.improved() } else { e })
    }
}
