use crate::import::session::Step;
use crate::store::StoreError;
use thiserror::Error;

/// Failures of a session operation as a whole. Per-row problems are
/// [`ValidationError`](crate::import::validate::ValidationError)s and
/// per-unit problems land in the execution outcome instead.
#[derive(Debug, Error)]
pub enum ImportError {
    #[error("unknown entity type: {0}")]
    UnknownEntity(String),

    /// The operation is not allowed from the session's current step.
    #[error("cannot {action} while the session is in {from}")]
    InvalidTransition { from: Step, action: &'static str },

    #[error("{errors} validation error(s) must be fixed before executing")]
    ValidationBlocked { errors: usize },

    #[error("nothing to apply: every row is unchanged or the file has no rows")]
    NothingToApply,

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("csv write failed: {0}")]
    Csv(#[from] csv::Error),
}

impl ImportError {
    /// Stable code for the IPC error envelope.
    pub fn code(&self) -> &'static str {
        match self {
            Self::UnknownEntity(_) => "bad_params",
            Self::InvalidTransition { .. } => "bad_state",
            Self::ValidationBlocked { .. } => "validation_blocked",
            Self::NothingToApply => "nothing_to_apply",
            Self::Store(_) => "db_query_failed",
            Self::Csv(_) => "csv_failed",
        }
    }
}
