use referral_ledger_types::{ReferralId, ReferralInvariantError, SettingsError, TransitionError};
use thiserror::Error as ThisError;

#[derive(Debug, ThisError)]
pub enum LedgerError {
    #[error("administrator privileges required")]
    Unauthorized,
    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: String },
    #[error("invalid {entity} transition {from} -> {to}")]
    InvalidTransition {
        entity: &'static str,
        from: String,
        to: String,
    },
    #[error("invalid settings: {0}")]
    InvalidSettings(#[from] SettingsError),
    #[error(
        "insufficient balance (available={available_cents}, requested={requested_cents}, minimum={min_payout_cents})"
    )]
    InsufficientBalance {
        available_cents: u64,
        requested_cents: u64,
        min_payout_cents: u64,
    },
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("referral program is not active")]
    ProgramInactive,
    #[error("ledger invariant violated for referral {referral_id}: {source}")]
    Inconsistent {
        referral_id: ReferralId,
        #[source]
        source: ReferralInvariantError,
    },
}

impl LedgerError {
    /// Stable machine-readable error kind.
    pub fn kind(&self) -> &'static str {
        match self {
            LedgerError::Unauthorized => "unauthorized",
            LedgerError::NotFound { .. } => "not_found",
            LedgerError::InvalidTransition { .. } => "invalid_transition",
            LedgerError::InvalidSettings(_) => "invalid_settings",
            LedgerError::InsufficientBalance { .. } => "insufficient_balance",
            LedgerError::InvalidRequest(_) => "invalid_request",
            LedgerError::ProgramInactive => "program_inactive",
            LedgerError::Inconsistent { .. } => "ledger_inconsistent",
        }
    }

    pub(crate) fn not_found(kind: &'static str, id: impl ToString) -> Self {
        LedgerError::NotFound {
            kind,
            id: id.to_string(),
        }
    }

    pub(crate) fn transition(
        entity: &'static str,
        from: impl ToString,
        to: impl ToString,
    ) -> Self {
        LedgerError::InvalidTransition {
            entity,
            from: from.to_string(),
            to: to.to_string(),
        }
    }
}

impl From<TransitionError> for LedgerError {
    fn from(err: TransitionError) -> Self {
        LedgerError::transition("referral", err.from, err.to)
    }
}
