//! Per-actor turn resolution for renga.
//!
//! The machine ([`machine`]) decides which transitions are legal and turns
//! staged transactions into durable commands on commit. The merge table
//! ([`merge`]) folds records received from peers into the local copy one
//! field at a time. [`TurnBook`] keeps one record per actor and tracks which
//! ones need broadcasting.

pub mod book;
pub mod error;
pub mod fields;
pub mod machine;
pub mod merge;

pub use book::TurnBook;
pub use error::{TurnError, TurnResult};
pub use machine::{
    StagedCommit, Transition, TransitionKind, TurnContext, TurnEdit, TurnEvent, next_phase,
};
pub use merge::{FIELD_RULES, MergeOutcome, merge};
