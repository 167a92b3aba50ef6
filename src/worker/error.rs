//! Job failures and outcomes.

use thiserror::Error;

use crate::Amount;
use crate::job::CancelReason;
use crate::ledger::LedgerError;
use crate::scoring::ScoringError;

/// Reason a job ended without committing a terminal state.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum JobError {
    #[error("scoring failed: {0}")]
    Scoring(#[from] ScoringError),

    #[error("ledger write failed: {0}")]
    Ledger(#[from] LedgerError),

    #[error("job timed out before reaching a terminal state")]
    TimedOut,

    #[error("job cancelled")]
    Cancelled,
}

impl From<CancelReason> for JobError {
    fn from(reason: CancelReason) -> Self {
        match reason {
            CancelReason::Deadline => JobError::TimedOut,
            CancelReason::Aborted => JobError::Cancelled,
        }
    }
}

/// How a job ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    /// Committed `PROCESSED` and credited `accrual`.
    Processed { accrual: Amount },
    /// Committed `INVALID`.
    Invalid,
    /// Aborted; the order keeps its last committed status.
    Failed(JobError),
}

impl JobOutcome {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, JobOutcome::Failed(_))
    }
}
