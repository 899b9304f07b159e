use renga_types::TurnPhase;
use thiserror::Error;

use crate::machine::TransitionKind;

/// Why a turn operation was refused. The record is untouched in every case.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TurnError {
    #[error("cannot {transition} from {from}")]
    IllegalTransition {
        from: TurnPhase,
        transition: TransitionKind,
    },

    #[error("cannot edit {field} while {phase}")]
    EditNotAllowed {
        field: &'static str,
        phase: TurnPhase,
    },

    #[error("missing staged data: {reason}")]
    MissingStagedData { reason: String },

    #[error("only the authority may {action}")]
    NotAuthorized { action: &'static str },

    #[error("invalid {field}: {reason}")]
    InvalidField {
        field: &'static str,
        reason: String,
    },
}

impl TurnError {
    pub fn missing(reason: impl Into<String>) -> Self {
        Self::MissingStagedData {
            reason: reason.into(),
        }
    }

    pub fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidField {
            field,
            reason: reason.into(),
        }
    }
}

pub type TurnResult<T> = Result<T, TurnError>;
