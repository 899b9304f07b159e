//! Wire messages exchanged between peers.
//!
//! Every message is a JSON object tagged by `kind`:
//!
//! | kind             | direction            | purpose                               |
//! |------------------|----------------------|---------------------------------------|
//! | `commandsAdded`  | broadcast            | new commands + changed turn records   |
//! | `diagnostic`     | any                  | connectivity check, ignored           |
//! | `takeAction`     | broadcast            | prompt a controller to start a turn   |
//! | `resyncRequest`  | broadcast            | ask the authority for a full snapshot |
//! | `resyncSnapshot` | authority → one peer | the full durable log + turn records   |
//!
//! Decoding is lenient about `commandsAdded`: a category whose command list
//! does not parse is reported and dropped, and the other categories still go
//! through.

use indexmap::IndexMap;
use renga_types::{ActorId, Category, Command, PeerId, TurnRecord};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Turn records attached to a batch.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TurnStates {
    pub by_actor: IndexMap<ActorId, TurnRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_actor_id: Option<ActorId>,
}

impl TurnStates {
    pub fn is_empty(&self) -> bool {
        self.by_actor.is_empty() && self.active_actor_id.is_none()
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum SyncMessage {
    #[serde(rename_all = "camelCase")]
    CommandsAdded {
        sender_id: PeerId,
        sender_name: String,
        command_count: usize,
        commands: IndexMap<Category, Vec<Command>>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        turn_states: Option<TurnStates>,
        timestamp: u64,
    },
    Diagnostic {
        text: String,
    },
    #[serde(rename_all = "camelCase")]
    TakeAction {
        actor_id: ActorId,
        requester_id: PeerId,
        requester_name: String,
    },
    #[serde(rename_all = "camelCase")]
    ResyncRequest { requester_id: PeerId },
    #[serde(rename_all = "camelCase")]
    ResyncSnapshot {
        commands: IndexMap<Category, Vec<Command>>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        turn_states: Option<TurnStates>,
    },
}

impl SyncMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            SyncMessage::CommandsAdded { .. } => "commandsAdded",
            SyncMessage::Diagnostic { .. } => "diagnostic",
            SyncMessage::TakeAction { .. } => "takeAction",
            SyncMessage::ResyncRequest { .. } => "resyncRequest",
            SyncMessage::ResyncSnapshot { .. } => "resyncSnapshot",
        }
    }

    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Input that failed structural checks, scoped as narrowly as possible.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Malformed {
    /// `None` when the whole message was unusable.
    pub category: Option<String>,
    pub reason: String,
}

/// A decoded message plus whatever parts of it had to be dropped.
#[derive(Clone, Debug, PartialEq)]
pub struct Decoded {
    pub message: SyncMessage,
    pub malformed: Vec<Malformed>,
}

/// `commandsAdded` with its command lists left as raw JSON.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct LenientBatch {
    sender_id: PeerId,
    #[serde(default)]
    sender_name: String,
    #[serde(default)]
    command_count: usize,
    #[serde(default)]
    commands: IndexMap<String, serde_json::Value>,
    #[serde(default)]
    turn_states: Option<serde_json::Value>,
    #[serde(default)]
    timestamp: u64,
}

/// Decode one wire message.
pub fn decode(raw: &str) -> Result<Decoded, Malformed> {
    let value: serde_json::Value = serde_json::from_str(raw).map_err(|e| Malformed {
        category: None,
        reason: format!("not JSON: {e}"),
    })?;

    match serde_json::from_value::<SyncMessage>(value.clone()) {
        Ok(message) => Ok(Decoded {
            message,
            malformed: Vec::new(),
        }),
        Err(e) if value.get("kind").and_then(|k| k.as_str()) == Some("commandsAdded") => {
            salvage_batch(value, e)
        }
        Err(e) => Err(Malformed {
            category: None,
            reason: e.to_string(),
        }),
    }
}

/// Keep the parts of a damaged `commandsAdded` that still parse.
fn salvage_batch(value: serde_json::Value, cause: serde_json::Error) -> Result<Decoded, Malformed> {
    let batch: LenientBatch = serde_json::from_value(value).map_err(|e| Malformed {
        category: None,
        reason: format!("{cause}; envelope unusable: {e}"),
    })?;

    let mut malformed = Vec::new();
    let mut commands = IndexMap::new();
    for (category, raw) in batch.commands {
        match serde_json::from_value::<Vec<Command>>(raw) {
            Ok(list) => {
                commands.insert(Category::new(category), list);
            }
            Err(e) => {
                warn!(category = %category, error = %e, "dropping malformed category");
                malformed.push(Malformed {
                    category: Some(category),
                    reason: e.to_string(),
                });
            }
        }
    }

    let turn_states = match batch.turn_states {
        None => None,
        Some(raw) => match serde_json::from_value::<TurnStates>(raw) {
            Ok(states) => Some(states),
            Err(e) => {
                malformed.push(Malformed {
                    category: None,
                    reason: format!("turnStates: {e}"),
                });
                None
            }
        },
    };

    Ok(Decoded {
        message: SyncMessage::CommandsAdded {
            sender_id: batch.sender_id,
            sender_name: batch.sender_name,
            command_count: batch.command_count,
            commands,
            turn_states,
            timestamp: batch.timestamp,
        },
        malformed,
    })
}
