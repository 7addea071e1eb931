use std::fmt;

use crate::backend::types::{Amount, BlockHeight, SaleTicket, TicketError, TransferError};

/// Phase of one participation flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParticipationPhase {
    Initialization,
    TicketReservation,
    Transfer,
    Notify,
    Resync,
    Done,
    Aborted,
}

impl fmt::Display for ParticipationPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ParticipationPhase::Initialization => "initialization",
            ParticipationPhase::TicketReservation => "ticket-reservation",
            ParticipationPhase::Transfer => "transfer",
            ParticipationPhase::Notify => "notify",
            ParticipationPhase::Resync => "resync",
            ParticipationPhase::Done => "done",
            ParticipationPhase::Aborted => "aborted",
        };
        f.write_str(name)
    }
}

/// Mutable progress of one coordinator instance, discarded once the flow
/// reaches a terminal phase.
#[derive(Debug, Clone)]
pub struct ParticipationState {
    pub phase: ParticipationPhase,
    /// The adopted ticket, freshly fetched or freshly created; never assumed.
    pub ticket: Option<SaleTicket>,
    /// Set when the ledger reported the transfer as older than its replay
    /// window; changes only how a later notify failure is handled.
    pub has_too_old_error: bool,
}

impl ParticipationState {
    pub(crate) fn new() -> Self {
        Self {
            phase: ParticipationPhase::Initialization,
            ticket: None,
            has_too_old_error: false,
        }
    }
}

/// Terminal success of a participation flow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParticipationOutcome {
    /// Ledger height of the transfer, when this flow performed or observed
    /// one. Absent when a stale transfer was reconciled by the backend alone.
    pub block_height: Option<BlockHeight>,
    /// Total amount the backend reports as accepted for this participant.
    pub accepted: Amount,
}

/// Reasons a participation flow aborts.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ParticipationError {
    #[error("amount {requested} plus the {fee} transfer fee exceeds the available balance {balance}")]
    BalanceTooLow {
        requested: Amount,
        fee: Amount,
        balance: Amount,
    },
    #[error("amount {requested} is below the per-participant minimum {min}")]
    BelowMinimum { requested: Amount, min: Amount },
    #[error("amount {requested} would push the total commitment above the per-participant maximum {max}")]
    AboveMaximum { requested: Amount, max: Amount },
    #[error("ticket reservation rejected: {0}")]
    TicketRejected(#[source] TicketError),
    #[error("ledger transfer failed: {0}")]
    TransferFailed(#[source] TransferError),
    #[error("gave up on {step} after {attempts} attempts")]
    RetriesExhausted { step: &'static str, attempts: u32 },
    #[error("participation flow was cancelled")]
    Cancelled,
    #[error("unexpected failure during {step}: {message}")]
    Unexpected {
        step: &'static str,
        message: String,
    },
}
