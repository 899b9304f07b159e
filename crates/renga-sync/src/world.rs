//! World state built by replaying commands.
//!
//! [`CommandApplier`] is the seam between the replication engine and whatever
//! the commands mean. [`World`] is the stock implementation for the three
//! default categories:
//!
//! | category  | command          | payload                         |
//! |-----------|------------------|---------------------------------|
//! | `clocks`  | `meter.create`   | `{meterId, label, segments}`    |
//! | `clocks`  | `meter.advance`  | `{meterId, ticks}`              |
//! | `clocks`  | `meter.remove`   | `{meterId}`                     |
//! | `traits`  | `trait.create`   | `{traitId, actorId, name}`      |
//! | `traits`  | `trait.remove`   | `{traitId}`                     |
//! | `journal` | `entry.add`      | `{text, actorId?}`              |
//!
//! Every command is first decoded and checked against current state into a
//! [`WorldOp`]; only a fully checked op mutates anything.
//!
//! The same set of commands yields the same world whatever order it arrives
//! in: a meter keeps the running sum of its advances and shows it clamped,
//! re-definitions go to the newest `meter.create`, and the journal is kept in
//! timestamp order.

use indexmap::IndexMap;
use renga_types::{ActorId, Category, Command, CommandId};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::error::ApplyError;

/// Applies durable commands to host state.
pub trait CommandApplier: Send {
    /// Check a command against current state without changing anything.
    fn check(&self, category: &Category, command: &Command) -> Result<(), ApplyError>;

    /// Apply a command. On error nothing changed.
    fn apply(&mut self, category: &Category, command: &Command) -> Result<(), ApplyError>;

    /// Drop all state (before a full replay).
    fn clear(&mut self);

    /// A comparable view of the state, for diagnostics and tests.
    fn snapshot(&self) -> serde_json::Value;
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Meter {
    pub label: String,
    pub segments: u32,
    /// `ticks` clamped to `0..=segments`.
    pub filled: u32,
    /// Sum of every advance.
    pub ticks: i64,
    /// Stamp of the `meter.create` that defined the current shape.
    #[serde(skip)]
    defined_by: Option<(u64, CommandId)>,
}

impl Meter {
    fn clamp(ticks: i64, segments: u32) -> u32 {
        ticks.clamp(0, i64::from(segments)) as u32
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActorTrait {
    pub actor_id: ActorId,
    pub name: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JournalEntry {
    pub id: CommandId,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actor_id: Option<ActorId>,
    pub timestamp: u64,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct World {
    pub meters: IndexMap<String, Meter>,
    pub traits: IndexMap<String, ActorTrait>,
    pub journal: Vec<JournalEntry>,
}

// ── Payloads ────────────────────────────────────────────────────────────────

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct MeterCreate {
    meter_id: String,
    #[serde(default)]
    label: String,
    segments: u32,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct MeterAdvance {
    meter_id: String,
    ticks: i64,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct MeterRef {
    meter_id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct TraitCreate {
    trait_id: String,
    actor_id: ActorId,
    name: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct TraitRef {
    trait_id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct EntryAdd {
    text: String,
    #[serde(default)]
    actor_id: Option<ActorId>,
}

/// A decoded, state-checked mutation.
#[derive(Debug)]
enum WorldOp {
    CreateMeter { id: String, meter: Meter },
    /// An older definition of a meter that already has a newer one.
    KeepMeter,
    SetTicks { id: String, ticks: i64 },
    RemoveMeter { id: String },
    CreateTrait { id: String, entry: ActorTrait },
    RemoveTrait { id: String },
    AddEntry(JournalEntry),
}

/// Largest meter a command may create.
const MAX_SEGMENTS: u32 = 64;

fn payload<T: DeserializeOwned>(command: &Command) -> Result<T, ApplyError> {
    serde_json::from_value(command.payload.clone()).map_err(|e| ApplyError::InvalidPayload {
        command_type: command.kind.clone(),
        reason: e.to_string(),
    })
}

fn invalid(command: &Command, reason: impl Into<String>) -> ApplyError {
    ApplyError::InvalidPayload {
        command_type: command.kind.clone(),
        reason: reason.into(),
    }
}

impl World {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn meter(&self, id: &str) -> Option<&Meter> {
        self.meters.get(id)
    }

    fn plan(&self, category: &Category, command: &Command) -> Result<WorldOp, ApplyError> {
        let unknown = || ApplyError::UnknownType {
            category: category.clone(),
            command_type: command.kind.clone(),
        };

        match (category.as_str(), command.kind.as_str()) {
            (Category::CLOCKS, "meter.create") => {
                let p: MeterCreate = payload(command)?;
                if p.meter_id.is_empty() {
                    return Err(invalid(command, "empty meterId"));
                }
                if p.segments == 0 || p.segments > MAX_SEGMENTS {
                    return Err(invalid(command, format!("segments must be 1..={MAX_SEGMENTS}")));
                }
                let stamp = (command.timestamp, command.command_id);
                let existing = self.meters.get(&p.meter_id);
                if existing.and_then(|m| m.defined_by).is_some_and(|by| by > stamp) {
                    return Ok(WorldOp::KeepMeter);
                }
                // Re-creating keeps progress
                let ticks = existing.map_or(0, |m| m.ticks);
                Ok(WorldOp::CreateMeter {
                    id: p.meter_id,
                    meter: Meter {
                        label: p.label,
                        segments: p.segments,
                        filled: Meter::clamp(ticks, p.segments),
                        ticks,
                        defined_by: Some(stamp),
                    },
                })
            }
            (Category::CLOCKS, "meter.advance") => {
                let p: MeterAdvance = payload(command)?;
                let meter = self.meters.get(&p.meter_id).ok_or(ApplyError::MissingEntity {
                    kind: "meter",
                    id: p.meter_id.clone(),
                })?;
                Ok(WorldOp::SetTicks {
                    ticks: meter.ticks.saturating_add(p.ticks),
                    id: p.meter_id,
                })
            }
            (Category::CLOCKS, "meter.remove") => {
                let p: MeterRef = payload(command)?;
                if !self.meters.contains_key(&p.meter_id) {
                    return Err(ApplyError::MissingEntity {
                        kind: "meter",
                        id: p.meter_id,
                    });
                }
                Ok(WorldOp::RemoveMeter { id: p.meter_id })
            }
            (Category::TRAITS, "trait.create") => {
                let p: TraitCreate = payload(command)?;
                if p.trait_id.is_empty() || p.name.trim().is_empty() {
                    return Err(invalid(command, "traitId and name are required"));
                }
                Ok(WorldOp::CreateTrait {
                    id: p.trait_id,
                    entry: ActorTrait {
                        actor_id: p.actor_id,
                        name: p.name,
                    },
                })
            }
            (Category::TRAITS, "trait.remove") => {
                let p: TraitRef = payload(command)?;
                if !self.traits.contains_key(&p.trait_id) {
                    return Err(ApplyError::MissingEntity {
                        kind: "trait",
                        id: p.trait_id,
                    });
                }
                Ok(WorldOp::RemoveTrait { id: p.trait_id })
            }
            (Category::JOURNAL, "entry.add") => {
                let p: EntryAdd = payload(command)?;
                Ok(WorldOp::AddEntry(JournalEntry {
                    id: command.command_id,
                    text: p.text,
                    actor_id: p.actor_id,
                    timestamp: command.timestamp,
                }))
            }
            _ => Err(unknown()),
        }
    }

    fn execute(&mut self, op: WorldOp) {
        match op {
            WorldOp::CreateMeter { id, meter } => {
                self.meters.insert(id, meter);
            }
            WorldOp::KeepMeter => {}
            WorldOp::SetTicks { id, ticks } => {
                if let Some(meter) = self.meters.get_mut(&id) {
                    meter.ticks = ticks;
                    meter.filled = Meter::clamp(ticks, meter.segments);
                }
            }
            WorldOp::RemoveMeter { id } => {
                self.meters.shift_remove(&id);
            }
            WorldOp::CreateTrait { id, entry } => {
                self.traits.insert(id, entry);
            }
            WorldOp::RemoveTrait { id } => {
                self.traits.shift_remove(&id);
            }
            WorldOp::AddEntry(entry) => {
                let key = (entry.timestamp, entry.id);
                let at = self.journal.partition_point(|e| (e.timestamp, e.id) < key);
                self.journal.insert(at, entry);
            }
        }
    }
}

impl CommandApplier for World {
    fn check(&self, category: &Category, command: &Command) -> Result<(), ApplyError> {
        self.plan(category, command).map(|_| ())
    }

    fn apply(&mut self, category: &Category, command: &Command) -> Result<(), ApplyError> {
        let op = self.plan(category, command)?;
        trace!(category = %category, kind = %command.kind, ?op, "apply");
        self.execute(op);
        Ok(())
    }

    fn clear(&mut self) {
        *self = World::default();
    }

    fn snapshot(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}
