//! Domain types and the typed error taxonomy shared across the data-access
//! layer.
//!
//! Every remote call this layer drives returns either a typed success value or
//! one of the error enums below. Each enum carries a classifier used by the
//! retry predicates; no handling path matches on a generic catch-all.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Monetary quantity in the smallest token unit. All arithmetic on amounts in
/// this layer is integer arithmetic.
pub type Amount = u64;
/// Height of a settled ledger block.
pub type BlockHeight = u64;
/// Backend-assigned sale ticket identifier.
pub type TicketId = u64;
/// Nanoseconds since the Unix epoch.
pub type TimestampNanos = u64;

/// Decimal places of the native token.
pub const TOKEN_DECIMALS: u32 = 8;

/// Identifier of a capacity-limited token sale.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SaleId(pub String);

impl fmt::Display for SaleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SaleId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// 32-byte sub-identifier selecting one sub-account under an owner.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Subaccount(pub [u8; 32]);

impl fmt::Debug for Subaccount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Subaccount({})", hex::encode(self.0))
    }
}

/// Account addressed by an owner credential and an optional sub-identifier.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AccountId {
    pub owner: [u8; 32],
    pub subaccount: Option<Subaccount>,
}

impl AccountId {
    pub fn new(owner: [u8; 32]) -> Self {
        Self {
            owner,
            subaccount: None,
        }
    }

    pub fn with_subaccount(owner: [u8; 32], subaccount: Subaccount) -> Self {
        Self {
            owner,
            subaccount: Some(subaccount),
        }
    }
}

impl fmt::Debug for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.subaccount {
            Some(subaccount) => write!(
                f,
                "AccountId({}.{})",
                hex::encode(self.owner),
                hex::encode(subaccount.0)
            ),
            None => write!(f, "AccountId({})", hex::encode(self.owner)),
        }
    }
}

/// Backend-issued reservation of a user's intent to participate in a sale.
///
/// Tickets are created only by the backend; the client holds at most a
/// freshly-fetched or freshly-created view and never fabricates one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SaleTicket {
    pub ticket_id: TicketId,
    /// Creation time assigned by the backend. Together with `ticket_id` it
    /// forms the idempotency tag of the ledger transfer paying for the ticket.
    pub creation_time: TimestampNanos,
    /// Reserved amount in the smallest token unit.
    pub amount: Amount,
    /// The participant the ticket was reserved for.
    pub account: AccountId,
}

impl SaleTicket {
    /// Creation time as a wall-clock timestamp, for logs.
    pub fn created_at_utc(&self) -> chrono::DateTime<chrono::Utc> {
        chrono::DateTime::from_timestamp_nanos(self.creation_time as i64)
    }
}

/// The caller's currently-known parameters of one sale, used by `initiate`
/// validation and for building the collection transfer.
#[derive(Debug, Clone)]
pub struct SaleSnapshot {
    pub sale_id: SaleId,
    /// Sub-account participants transfer funds into.
    pub collection_account: AccountId,
    pub min_participant_commitment: Amount,
    pub max_participant_commitment: Amount,
    /// Amount the backend already accepted for this participant in earlier
    /// rounds.
    pub prior_commitment: Amount,
    pub transfer_fee: Amount,
}

/// Reservation request for a sale ticket.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TicketRequest {
    pub sale_id: SaleId,
    pub amount: Amount,
    pub subaccount: Option<Subaccount>,
}

/// Ledger transfer request carrying the idempotency tag, so replaying the
/// same transfer is recognized as the same operation rather than a new one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferRequest {
    pub from_subaccount: Option<Subaccount>,
    pub to: AccountId,
    pub amount: Amount,
    pub fee: Amount,
    /// Idempotency tag, first half: the ticket the transfer pays for.
    pub memo: TicketId,
    /// Idempotency tag, second half: the ticket's creation time.
    pub created_at: TimestampNanos,
}

/// Outcomes of `reserve_ticket`.
#[derive(Debug, Clone, Serialize, Deserialize, thiserror::Error)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TicketError {
    /// An open ticket already exists for this (sale, caller) pair; the
    /// existing ticket is carried in the payload.
    #[error("an open ticket already exists for this sale")]
    AlreadyExists { ticket: SaleTicket },
    #[error("amount is outside the per-participant bounds [{min}, {max}]")]
    InvalidAmount { min: Amount, max: Amount },
    #[error("invalid participant sub-identifier")]
    InvalidSubaccount,
    #[error("the sale is not open yet")]
    SaleNotOpen,
    #[error("the sale is closed")]
    SaleClosed,
    /// Transport or queueing failure; retried.
    #[error("sale backend unavailable: {reason}")]
    Unavailable { reason: String },
}

impl TicketError {
    /// True for outcomes the reservation poll must not retry.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, TicketError::Unavailable { .. })
    }
}

/// Outcomes of a ledger transfer.
#[derive(Debug, Clone, Serialize, Deserialize, thiserror::Error)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TransferError {
    /// A transfer with the same idempotency tag already settled at `height`.
    #[error("duplicate of the transfer settled at block {height}")]
    Duplicate { height: BlockHeight },
    #[error("insufficient funds: available balance is {balance}")]
    InsufficientFunds { balance: Amount },
    /// The creation time is older than the ledger's replay window.
    #[error("transfer is older than the ledger replay window")]
    TooOld,
    /// The creation time is ahead of the replica's clock; self-resolves
    /// within seconds.
    #[error("transfer creation time is ahead of the replica clock")]
    CreatedInFuture,
    #[error("bad transfer fee; the ledger expects {expected}")]
    BadFee { expected: Amount },
    #[error("ledger unavailable: {reason}")]
    Unavailable { reason: String },
    #[error("ledger rejected the transfer: {reason}")]
    Rejected { reason: String },
}

impl TransferError {
    /// True when another attempt can still settle the transfer (clock skew or
    /// transport failure).
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TransferError::CreatedInFuture | TransferError::Unavailable { .. }
        )
    }
}

/// Outcomes of `notify_participation`.
#[derive(Debug, Clone, Serialize, Deserialize, thiserror::Error)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NotifyError {
    /// The backend has not reconciled the transfer yet; retried.
    #[error("participation is still being processed")]
    StillProcessing,
    #[error("sale backend unavailable: {reason}")]
    Unavailable { reason: String },
    #[error("participation rejected: {reason}")]
    Rejected { reason: String },
}

impl NotifyError {
    pub fn is_transient(&self) -> bool {
        !matches!(self, NotifyError::Rejected { .. })
    }
}

/// Failures of the remaining sale backend calls (ticket lookup, release).
#[derive(Debug, Clone, Serialize, Deserialize, thiserror::Error)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SaleGatewayError {
    #[error("sale backend unavailable: {reason}")]
    Unavailable { reason: String },
    #[error("sale backend error: {reason}")]
    Internal { reason: String },
}

impl SaleGatewayError {
    pub fn is_transient(&self) -> bool {
        matches!(self, SaleGatewayError::Unavailable { .. })
    }
}

/// Failures of ledger reads.
#[derive(Debug, Clone, Serialize, Deserialize, thiserror::Error)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LedgerError {
    #[error("ledger unavailable: {reason}")]
    Unavailable { reason: String },
    #[error("ledger error: {reason}")]
    Internal { reason: String },
}

/// Failure of the best-effort account refresh.
#[derive(Debug, Clone, thiserror::Error)]
#[error("account refresh failed: {0}")]
pub struct RefreshError(pub String);
