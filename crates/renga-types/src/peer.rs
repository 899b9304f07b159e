//! Who a peer is and what it may do.
//!
//! The role is handed to a peer by its host at startup. Nothing infers
//! authority from other properties.

use serde::{Deserialize, Serialize};

use crate::ids::{ActorId, PeerId};

/// Whether this peer may write durable storage and commit consequences.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// The single elected persister ("game master").
    Authority,
    #[default]
    Peer,
}

impl Role {
    pub fn is_authority(&self) -> bool {
        matches!(self, Role::Authority)
    }
}

/// Identity a host assigns to the local peer.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerIdentity {
    pub id: PeerId,
    pub name: String,
    pub role: Role,
    /// Actors this peer plays; used to route `takeAction` prompts.
    #[serde(default)]
    pub controlled_actors: Vec<ActorId>,
}

impl PeerIdentity {
    pub fn new(name: impl Into<String>, role: Role) -> Self {
        Self {
            id: PeerId::new(),
            name: name.into(),
            role,
            controlled_actors: Vec::new(),
        }
    }

    pub fn authority(name: impl Into<String>) -> Self {
        Self::new(name, Role::Authority)
    }

    pub fn peer(name: impl Into<String>) -> Self {
        Self::new(name, Role::Peer)
    }

    pub fn controlling(mut self, actor: ActorId) -> Self {
        if !self.controlled_actors.contains(&actor) {
            self.controlled_actors.push(actor);
        }
        self
    }

    pub fn controls(&self, actor: &ActorId) -> bool {
        self.controlled_actors.contains(actor)
    }

    pub fn is_authority(&self) -> bool {
        self.role.is_authority()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_controlling_dedupes() {
        let actor = ActorId::from_name("Vex");
        let me = PeerIdentity::peer("ana").controlling(actor).controlling(actor);
        assert_eq!(me.controlled_actors.len(), 1);
        assert!(me.controls(&actor));
        assert!(!me.is_authority());
    }

    #[test]
    fn test_role_wire_name() {
        let json = serde_json::to_string(&Role::Authority).expect("serialize");
        assert_eq!(json, "\"authority\"");
    }
}
