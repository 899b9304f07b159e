//! Shared identity, command, and turn-record types for renga.
//!
//! This crate is the leaf of the workspace: typed IDs, the durable
//! [`Command`], its [`Category`] partition, and the ephemeral [`TurnRecord`].
//! It has **no internal renga dependencies**.
//!
//! # Key Types
//!
//! |------------------|-----------------------------------------------|
//! | Type             | Purpose                                       |
//! |------------------|-----------------------------------------------|
//! | [`PeerId`]       | Which participant process                     |
//! | [`ActorId`]      | Which character (turn-record key)             |
//! | [`CommandId`]    | Dedup key of a durable command                |
//! | [`Category`]     | Independent log partition (`clocks`, ...)     |
//! | [`Command`]      | Immutable durable mutation                    |
//! | [`TurnRecord`]   | Field-mergeable per-actor turn state          |
//! | [`PeerIdentity`] | Host-assigned id, name, role, actors          |
//! |------------------|-----------------------------------------------|

pub mod command;
pub mod ids;
pub mod peer;
pub mod turn;

pub use command::{Category, Command, now_millis, sort_for_replay};
pub use ids::{ActorId, CommandId, PeerId};
pub use peer::{PeerIdentity, Role};
pub use turn::{
    ConsequenceTransaction, Effect, Position, RollOutcome, RollResult, TraitOp, TraitTransaction,
    TurnPhase, TurnRecord,
};
