//! Error types for the sync layer.

use renga_types::{Category, CommandId, PeerId};
use renga_turn::TurnError;
use thiserror::Error;

/// A command could not be applied to world state.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ApplyError {
    #[error("{kind} {id} does not exist")]
    MissingEntity { kind: &'static str, id: String },

    #[error("invalid {command_type} payload: {reason}")]
    InvalidPayload {
        command_type: String,
        reason: String,
    },

    #[error("unknown command type {command_type} in {category}")]
    UnknownType {
        category: Category,
        command_type: String,
    },
}

impl ApplyError {
    /// Whether the command may apply once more history arrives. Anything
    /// else is wrong on every peer and never will.
    pub fn awaits_dependency(&self) -> bool {
        matches!(self, ApplyError::MissingEntity { .. })
    }
}

/// Durable store failures.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("stored blob is not valid: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Transport failures. Delivery itself is never acknowledged.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("peer {0} is not connected")]
    UnknownPeer(PeerId),

    #[error("transport closed")]
    Closed,

    #[error("encode failed: {0}")]
    Encode(String),
}

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("apply failed for {command_id} in {category}: {source}")]
    Apply {
        category: Category,
        command_id: CommandId,
        #[source]
        source: ApplyError,
    },

    #[error("unknown category {0}")]
    UnknownCategory(String),

    #[error(transparent)]
    Turn(#[from] TurnError),

    #[error("persistence failed: {0}")]
    Store(#[from] StoreError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("peer shut down")]
    Shutdown,
}

pub type SyncResult<T> = Result<T, SyncError>;
