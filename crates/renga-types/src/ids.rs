//! Typed identifiers for peers, actors, and commands.
//!
//! All ID types wrap a UUID. Peers and actors use UUIDv7 (time-ordered);
//! commands use UUIDv4 so that a command id carries no ordering meaning; the
//! replay order is decided by the command timestamp, not by its id. The
//! `short()` form (first 8 hex chars) is for log lines only, never a lookup key.

use std::fmt;

use serde::{Deserialize, Serialize};

/// A peer identifier (one per connected participant process).
#[derive(Clone, Copy, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(uuid::Uuid);

/// An actor identifier (a character whose turn state is tracked).
#[derive(Clone, Copy, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ActorId(uuid::Uuid);

/// A command identifier. Unique per originating peer; nothing else is implied.
#[derive(Clone, Copy, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CommandId(uuid::Uuid);

// ── Shared behavior ─────────────────────────────────────────────────────────

macro_rules! impl_typed_id {
    ($T:ident, $name:literal, $ctor:ident) => {
        impl $T {
            /// Create a fresh ID.
            pub fn new() -> Self {
                Self(uuid::Uuid::$ctor())
            }

            /// First 8 hex characters, for display only.
            pub fn short(&self) -> String {
                self.0.as_simple().to_string()[..8].to_string()
            }

            /// Full 32-character hex string (no hyphens).
            pub fn to_hex(&self) -> String {
                self.0.as_simple().to_string()
            }

            /// The raw 16 bytes.
            pub fn as_bytes(&self) -> &[u8; 16] {
                self.0.as_bytes()
            }

            /// Reconstruct from 16 bytes.
            pub fn from_bytes(b: [u8; 16]) -> Self {
                Self(uuid::Uuid::from_bytes(b))
            }

            /// Parse from a hex string (32 chars, no hyphens) or standard UUID format.
            pub fn parse(s: &str) -> Result<Self, uuid::Error> {
                uuid::Uuid::parse_str(s).map(Self)
            }

            /// A nil ID for sentinel values.
            pub fn nil() -> Self {
                Self(uuid::Uuid::nil())
            }

            /// Check if this is the nil ID.
            pub fn is_nil(&self) -> bool {
                self.0.is_nil()
            }
        }

        impl Default for $T {
            fn default() -> Self {
                Self::new()
            }
        }

        impl From<uuid::Uuid> for $T {
            fn from(u: uuid::Uuid) -> Self {
                Self(u)
            }
        }

        impl From<$T> for uuid::Uuid {
            fn from(id: $T) -> uuid::Uuid {
                id.0
            }
        }

        impl fmt::Display for $T {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                // Full UUID with hyphens for log readability
                write!(f, "{}", self.0)
            }
        }

        impl fmt::Debug for $T {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", $name, self.short())
            }
        }
    };
}

impl_typed_id!(PeerId, "PeerId", now_v7);
impl_typed_id!(ActorId, "ActorId", now_v7);
impl_typed_id!(CommandId, "CommandId", new_v4);

/// Fixed namespace for deriving deterministic ActorIds via UUIDv5.
const RENGA_ACTOR_NS: uuid::Uuid = uuid::uuid!("5b0f3e52-91c4-4d6a-b7e8-2a6c9d41f0e3");

impl ActorId {
    /// Derive a stable actor id from a host-side name.
    ///
    /// Hosts that already key characters by string use this so every peer
    /// computes the same `ActorId` without exchanging it.
    pub fn from_name(name: &str) -> Self {
        Self(uuid::Uuid::new_v5(&RENGA_ACTOR_NS, name.as_bytes()))
    }
}
