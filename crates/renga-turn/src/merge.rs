//! Field-by-field merge of a remote turn record into the local copy.
//!
//! Rules run in a fixed order; the first structural rule that matches ends
//! the merge:
//!
//! 1. **Unchanged**: contents already agree. Only the newer write stamp is kept.
//! 2. **Stale**: the remote write stamp `(epoch, revision, editor)` is older
//!    than the local one. Ignored. Resets open a new epoch, so a reset is only
//!    stale against a record written after it.
//! 3. **Cleared**: the remote record is a reset (idle, nothing staged). The
//!    local record is replaced outright, never field-merged, so no stale
//!    partial field survives.
//! 4. **Fields**: every row of [`FIELD_RULES`] whose value differs is
//!    validated and applied on its own. A rejected field keeps its local
//!    value and does not block the others.
//!
//! Validation looks only at the incoming value, and the surviving record is
//! the one with the newest stamp, so two peers that see the same set of
//! records end up with the same content in any arrival order. The stamp
//! covers the whole record: when two peers edit different fields at once, the
//! newer record wins every field.

use renga_types::TurnRecord;
use tracing::{debug, trace, warn};

use crate::error::{TurnError, TurnResult};
use crate::fields;

/// What a merge did to the local record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeOutcome {
    Unchanged,
    Stale,
    Cleared,
    Updated {
        fields: Vec<&'static str>,
        rejected: Vec<(&'static str, TurnError)>,
    },
}

impl MergeOutcome {
    /// Whether the local record's content changed.
    pub fn changed(&self) -> bool {
        match self {
            MergeOutcome::Cleared => true,
            MergeOutcome::Updated { fields, .. } => !fields.is_empty(),
            MergeOutcome::Unchanged | MergeOutcome::Stale => false,
        }
    }
}

/// One row of the field table.
pub struct FieldRule {
    pub name: &'static str,
    differs: fn(&TurnRecord, &TurnRecord) -> bool,
    apply: fn(&mut TurnRecord, &TurnRecord) -> TurnResult<()>,
}

macro_rules! plain_rule {
    ($name:literal, $field:ident) => {
        FieldRule {
            name: $name,
            differs: |local, remote| local.$field != remote.$field,
            apply: |local, remote| {
                local.$field = remote.$field.clone();
                Ok(())
            },
        }
    };
    ($name:literal, $field:ident, $check:expr) => {
        FieldRule {
            name: $name,
            differs: |local, remote| local.$field != remote.$field,
            apply: |local, remote| {
                $check(remote)?;
                local.$field = remote.$field.clone();
                Ok(())
            },
        }
    };
}

/// Field rules in application order. `state` goes first so later rows land
/// on a record that already sits in the remote phase.
pub const FIELD_RULES: &[FieldRule] = &[
    plain_rule!("state", state),
    plain_rule!("action", action, |r: &TurnRecord| fields::action(r.action.as_deref())),
    plain_rule!("position", position),
    plain_rule!("effect", effect),
    plain_rule!("equipped", equipped, |r: &TurnRecord| fields::equipped(&r.equipped)),
    plain_rule!("approved", approved),
    plain_rule!("traitTx", trait_tx, |r: &TurnRecord| fields::trait_tx(r.trait_tx.as_ref())),
    plain_rule!("consequenceTx", consequence_tx, |r: &TurnRecord| {
        fields::consequence_tx(r.consequence_tx.as_ref())
    }),
    plain_rule!("pushed", pushed),
    plain_rule!("improved", improved),
    plain_rule!("lastRoll", last_roll, |r: &TurnRecord| fields::last_roll(r.last_roll.as_ref())),
];

/// Merge `remote` into `local`.
pub fn merge(local: &mut TurnRecord, remote: &TurnRecord) -> MergeOutcome {
    if local.same_content(remote) {
        if remote.stamp() > local.stamp() {
            adopt_stamp(local, remote);
        }
        return MergeOutcome::Unchanged;
    }

    if remote.stamp() < local.stamp() {
        trace!(
            local_epoch = local.epoch,
            remote_epoch = remote.epoch,
            local_revision = local.revision,
            remote_revision = remote.revision,
            "ignoring stale turn record"
        );
        return MergeOutcome::Stale;
    }

    if remote.is_reset() {
        debug!(from = %local.state, "remote reset clears local turn record");
        *local = remote.clone();
        return MergeOutcome::Cleared;
    }

    let mut applied = Vec::new();
    let mut rejected = Vec::new();
    for rule in FIELD_RULES {
        if !(rule.differs)(local, remote) {
            continue;
        }
        match (rule.apply)(local, remote) {
            Ok(()) => applied.push(rule.name),
            Err(e) => {
                warn!(field = rule.name, error = %e, "rejected remote turn field");
                rejected.push((rule.name, e));
            }
        }
    }
    adopt_stamp(local, remote);

    MergeOutcome::Updated {
        fields: applied,
        rejected,
    }
}

fn adopt_stamp(local: &mut TurnRecord, remote: &TurnRecord) {
    local.epoch = remote.epoch;
    local.revision = remote.revision;
    local.editor = remote.editor;
}
