//! Collaborator contracts this layer consumes.
//!
//! Each operation is an opaque asynchronous call returning a typed success
//! value or one of the typed errors in [`super::types`]; the wire encoding
//! belongs to the implementation behind the trait. Reads take the consistency
//! [`Tier`] they should be serviced at; the sale coordinator always passes
//! [`Tier::Authoritative`].

use async_trait::async_trait;

use crate::reader::Tier;

use super::types::{
    AccountId, Amount, BlockHeight, LedgerError, NotifyError, RefreshError, SaleGatewayError,
    SaleId, SaleTicket, TicketError, TicketRequest, TransferError, TransferRequest,
};

/// The backend's sale-ticket operation set.
#[async_trait]
pub trait SaleGateway: Send + Sync {
    /// Reserve a ticket recording the caller's intent to participate.
    /// Re-creation is idempotent: the backend surfaces an existing open
    /// ticket as [`TicketError::AlreadyExists`].
    async fn reserve_ticket(&self, request: &TicketRequest) -> Result<SaleTicket, TicketError>;

    /// Fetch the caller's open ticket for `sale_id`, if any.
    async fn open_ticket(
        &self,
        sale_id: &SaleId,
        account: &AccountId,
        tier: Tier,
    ) -> Result<Option<SaleTicket>, SaleGatewayError>;

    /// Ask the backend to reconcile the amount received on the sale's
    /// collection account with the caller's ledger transfer. Returns the
    /// total amount accepted for this participant.
    async fn notify_participation(
        &self,
        sale_id: &SaleId,
        account: &AccountId,
    ) -> Result<Amount, NotifyError>;

    /// Report a failed payment, dropping the caller's open ticket. Returns
    /// the dropped ticket when one existed.
    async fn notify_payment_failure(
        &self,
        sale_id: &SaleId,
    ) -> Result<Option<SaleTicket>, SaleGatewayError>;
}

/// Ledger operations this layer drives.
#[async_trait]
pub trait LedgerGateway: Send + Sync {
    async fn transfer(&self, request: &TransferRequest) -> Result<BlockHeight, TransferError>;

    async fn balance(&self, account: &AccountId, tier: Tier) -> Result<Amount, LedgerError>;
}

/// Best-effort refresh of locally displayed account state; fire-and-forget
/// from this layer's point of view.
#[async_trait]
pub trait AccountRefresher: Send + Sync {
    async fn refresh_accounts(&self, account: &AccountId) -> Result<(), RefreshError>;
}
