//! Sale participation coordinator.
//!
//! This module defines the `SaleParticipationCoordinator`, the resumable
//! state machine that drives one user's participation in a capacity-limited
//! token sale to a single successful outcome: reserve a ticket, transfer the
//! funds to the sale's collection account, notify the backend, resync local
//! balances. Every network step runs through the retry engine and always at
//! the authoritative consistency tier.
//!
//! The coordinator is responsible for:
//! - Validating the requested amount before any network call is made
//! - Adopting an already-open ticket instead of failing, which makes
//!   re-invocation after a crash safe
//! - Releasing the ticket exactly on the paths where the user could otherwise
//!   never fund it, and deliberately withholding it wherever an unresolved
//!   ledger transfer might still land
//! - Emitting one progress event per state transition and exactly one
//!   terminal notification per flow
//!
//! `restore` is the designed way to pick an interrupted flow back up; there is
//! no mid-transfer cancellation, since a transfer in flight must be allowed to
//! reach a terminal ledger outcome.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::backend::traits::{AccountRefresher, LedgerGateway, SaleGateway};
use crate::backend::types::{
    AccountId, Amount, BlockHeight, NotifyError, SaleGatewayError, SaleSnapshot, SaleTicket,
    TOKEN_DECIMALS, TicketError, TicketRequest, TransferError, TransferRequest,
};
use crate::reader::Tier;
use crate::retry::{PollError, PollIdentity, PollOptions, RetryEngine};
use crate::utils::{format_token_amount, generate_flow_id};

use super::events::{EventDispatcher, NotificationSink, ParticipationEvent};
use super::types::{
    ParticipationError, ParticipationOutcome, ParticipationPhase, ParticipationState,
};

/// Attempt ceiling for the notify poll; reconciliation can lag the transfer
/// by a while.
const NOTIFY_MAX_ATTEMPTS: u32 = 20;

/// Drives one (sale, caller) participation through its states. Not
/// re-entrant: the exclusive borrow taken by the entry points serializes all
/// progress within an instance.
pub struct SaleParticipationCoordinator {
    sale: SaleSnapshot,
    account: AccountId,
    /// Correlates the log lines of one flow.
    flow_id: String,
    engine: Arc<RetryEngine>,
    sale_gateway: Arc<dyn SaleGateway>,
    ledger: Arc<dyn LedgerGateway>,
    refresher: Arc<dyn AccountRefresher>,
    notifications: Arc<dyn NotificationSink>,
    dispatcher: EventDispatcher,
    state: ParticipationState,
}

impl SaleParticipationCoordinator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        sale: SaleSnapshot,
        account: AccountId,
        engine: Arc<RetryEngine>,
        sale_gateway: Arc<dyn SaleGateway>,
        ledger: Arc<dyn LedgerGateway>,
        refresher: Arc<dyn AccountRefresher>,
        notifications: Arc<dyn NotificationSink>,
        dispatcher: EventDispatcher,
    ) -> Self {
        Self {
            sale,
            account,
            flow_id: generate_flow_id(),
            engine,
            sale_gateway,
            ledger,
            refresher,
            notifications,
            dispatcher,
            state: ParticipationState::new(),
        }
    }

    /// Current progress of this flow.
    pub fn state(&self) -> &ParticipationState {
        &self.state
    }

    /// Start a fresh participation of `amount`, validated against
    /// `available_balance` and the sale bounds before any network call is
    /// made.
    pub async fn initiate(
        &mut self,
        amount: Amount,
        available_balance: Amount,
    ) -> Result<ParticipationOutcome, ParticipationError> {
        self.enter_phase(ParticipationPhase::Initialization).await;
        info!(
            flow = %self.flow_id,
            sale = %self.sale.sale_id,
            amount = %format_token_amount(amount, TOKEN_DECIMALS),
            "initiating sale participation"
        );

        if let Err(error) = self.validate_amount(amount, available_balance) {
            return Err(self.fail(error).await);
        }

        self.enter_phase(ParticipationPhase::TicketReservation).await;
        let ticket = match self.reserve_ticket(amount).await {
            Ok(ticket) => ticket,
            Err(error) => return Err(self.fail(error).await),
        };
        self.adopt_ticket(ticket).await;

        self.drive_to_completion().await
    }

    /// Resume an interrupted flow, e.g. after a crash or page reload. Queries
    /// the backend for an open ticket; when none exists the flow ends as a
    /// no-op, otherwise the ticket is adopted and the flow continues at the
    /// transfer.
    pub async fn restore(&mut self) -> Result<Option<ParticipationOutcome>, ParticipationError> {
        self.enter_phase(ParticipationPhase::Initialization).await;
        info!(
            flow = %self.flow_id,
            sale = %self.sale.sale_id,
            "looking for an interrupted participation"
        );

        let ticket = match self.fetch_open_ticket().await {
            Ok(ticket) => ticket,
            Err(error) => return Err(self.fail(error).await),
        };
        let Some(ticket) = ticket else {
            info!(flow = %self.flow_id, "no open ticket; nothing to resume");
            return Ok(None);
        };

        info!(
            flow = %self.flow_id,
            ticket_id = ticket.ticket_id,
            "adopting open ticket and resuming at the transfer"
        );
        self.adopt_ticket(ticket).await;
        self.drive_to_completion().await.map(Some)
    }

    fn validate_amount(
        &self,
        amount: Amount,
        available_balance: Amount,
    ) -> Result<(), ParticipationError> {
        match amount.checked_add(self.sale.transfer_fee) {
            Some(required) if required <= available_balance => {}
            _ => {
                return Err(ParticipationError::BalanceTooLow {
                    requested: amount,
                    fee: self.sale.transfer_fee,
                    balance: available_balance,
                });
            }
        }
        if amount < self.sale.min_participant_commitment {
            return Err(ParticipationError::BelowMinimum {
                requested: amount,
                min: self.sale.min_participant_commitment,
            });
        }
        if amount.saturating_add(self.sale.prior_commitment) > self.sale.max_participant_commitment
        {
            return Err(ParticipationError::AboveMaximum {
                requested: amount,
                max: self.sale.max_participant_commitment,
            });
        }
        Ok(())
    }

    async fn reserve_ticket(&mut self, amount: Amount) -> Result<SaleTicket, ParticipationError> {
        let request = TicketRequest {
            sale_id: self.sale.sale_id.clone(),
            amount,
            subaccount: self.account.subaccount,
        };
        let gateway = Arc::clone(&self.sale_gateway);
        let outcome = self
            .engine
            .poll(
                move || {
                    let gateway = Arc::clone(&gateway);
                    let request = request.clone();
                    async move { gateway.reserve_ticket(&request).await }
                },
                TicketError::is_terminal,
                PollOptions::default()
                    .with_exponential_backoff()
                    .with_identity(self.ticket_poll_identity()),
            )
            .await;

        match outcome {
            Ok(ticket) => Ok(ticket),
            // Re-creation found an open ticket; adopt it instead of failing.
            Err(PollError::Operation(TicketError::AlreadyExists { ticket })) => {
                info!(
                    flow = %self.flow_id,
                    ticket_id = ticket.ticket_id,
                    "an open ticket already exists; adopting it"
                );
                Ok(ticket)
            }
            Err(PollError::Operation(error)) => Err(ParticipationError::TicketRejected(error)),
            Err(PollError::LimitExceeded { attempts, .. }) => {
                Err(ParticipationError::RetriesExhausted {
                    step: "ticket reservation",
                    attempts,
                })
            }
            Err(PollError::Cancelled(_)) => Err(ParticipationError::Cancelled),
        }
    }

    async fn fetch_open_ticket(&mut self) -> Result<Option<SaleTicket>, ParticipationError> {
        let gateway = Arc::clone(&self.sale_gateway);
        let sale_id = self.sale.sale_id.clone();
        let account = self.account;
        let outcome = self
            .engine
            .poll(
                move || {
                    let gateway = Arc::clone(&gateway);
                    let sale_id = sale_id.clone();
                    async move {
                        gateway
                            .open_ticket(&sale_id, &account, Tier::Authoritative)
                            .await
                    }
                },
                |error: &SaleGatewayError| !error.is_transient(),
                PollOptions::default()
                    .with_exponential_backoff()
                    .with_identity(self.ticket_poll_identity()),
            )
            .await;

        match outcome {
            Ok(ticket) => Ok(ticket),
            Err(PollError::Operation(error)) => Err(ParticipationError::Unexpected {
                step: "ticket lookup",
                message: error.to_string(),
            }),
            Err(PollError::LimitExceeded { attempts, .. }) => {
                Err(ParticipationError::RetriesExhausted {
                    step: "ticket lookup",
                    attempts,
                })
            }
            Err(PollError::Cancelled(_)) => Err(ParticipationError::Cancelled),
        }
    }

    async fn drive_to_completion(&mut self) -> Result<ParticipationOutcome, ParticipationError> {
        self.enter_phase(ParticipationPhase::Transfer).await;
        let block_height = match self.transfer_funds().await {
            Ok(height) => height,
            Err(error) => return Err(self.fail(error).await),
        };

        self.enter_phase(ParticipationPhase::Notify).await;
        let accepted = match self.notify_backend().await {
            Ok(accepted) => accepted,
            Err(error) => return Err(self.fail(error).await),
        };

        self.enter_phase(ParticipationPhase::Resync).await;
        self.resync().await;

        self.enter_phase(ParticipationPhase::Done).await;
        // Drop the completed ticket so the user can participate again to
        // increase their commitment in a later round.
        self.release_ticket("participation complete").await;
        info!(
            flow = %self.flow_id,
            accepted = %format_token_amount(accepted, TOKEN_DECIMALS),
            "sale participation completed"
        );
        self.notifications
            .participation_succeeded(&self.sale.sale_id, accepted);
        self.dispatcher
            .dispatch(&ParticipationEvent::ReloadRequested)
            .await;

        Ok(ParticipationOutcome {
            block_height,
            accepted,
        })
    }

    /// Transfer `ticket.amount` to the sale's collection account, tagged with
    /// the ticket's id and creation time so a replay is recognized by the
    /// ledger as the same transfer.
    async fn transfer_funds(&mut self) -> Result<Option<BlockHeight>, ParticipationError> {
        let ticket = self
            .state
            .ticket
            .clone()
            .expect("transfer phase requires an adopted ticket");
        let request = TransferRequest {
            from_subaccount: self.account.subaccount,
            to: self.sale.collection_account,
            amount: ticket.amount,
            fee: self.sale.transfer_fee,
            memo: ticket.ticket_id,
            created_at: ticket.creation_time,
        };
        let ledger = Arc::clone(&self.ledger);
        let outcome = self
            .engine
            .poll(
                move || {
                    let ledger = Arc::clone(&ledger);
                    let request = request.clone();
                    async move { ledger.transfer(&request).await }
                },
                |error: &TransferError| !error.is_retryable(),
                PollOptions::default().with_exponential_backoff(),
            )
            .await;

        match outcome {
            Ok(height) => Ok(Some(height)),
            // The funds already moved in a prior attempt; the idempotency tag
            // made the replay visible.
            Err(PollError::Operation(TransferError::Duplicate { height })) => {
                info!(flow = %self.flow_id, height, "transfer already settled; continuing");
                Ok(Some(height))
            }
            Err(PollError::Operation(TransferError::InsufficientFunds { balance })) => {
                // A ticket the user can never fund must not stay open.
                self.release_ticket("insufficient funds").await;
                Err(ParticipationError::TransferFailed(
                    TransferError::InsufficientFunds { balance },
                ))
            }
            Err(PollError::Operation(TransferError::TooOld)) => {
                warn!(
                    flow = %self.flow_id,
                    ticket_id = ticket.ticket_id,
                    created_at = %ticket.created_at_utc(),
                    "ticket is older than the ledger replay window; notify may still reconcile it"
                );
                self.state.has_too_old_error = true;
                Ok(None)
            }
            Err(PollError::Operation(error)) => {
                self.release_ticket("transfer failed").await;
                Err(ParticipationError::TransferFailed(error))
            }
            // The transfer may still land; leave the ticket for `restore`.
            Err(PollError::LimitExceeded { attempts, .. }) => {
                Err(ParticipationError::RetriesExhausted {
                    step: "ledger transfer",
                    attempts,
                })
            }
            Err(PollError::Cancelled(_)) => Err(ParticipationError::Cancelled),
        }
    }

    async fn notify_backend(&mut self) -> Result<Amount, ParticipationError> {
        let ticket = self
            .state
            .ticket
            .clone()
            .expect("notify phase requires an adopted ticket");
        let gateway = Arc::clone(&self.sale_gateway);
        let sale_id = self.sale.sale_id.clone();
        let account = self.account;
        let outcome = self
            .engine
            .poll(
                move || {
                    let gateway = Arc::clone(&gateway);
                    let sale_id = sale_id.clone();
                    async move { gateway.notify_participation(&sale_id, &account).await }
                },
                |error: &NotifyError| !error.is_transient(),
                PollOptions::default()
                    .with_exponential_backoff()
                    .with_max_attempts(NOTIFY_MAX_ATTEMPTS),
            )
            .await;

        match outcome {
            Ok(accepted) => {
                let expected = ticket.amount.saturating_add(self.sale.prior_commitment);
                if accepted != expected {
                    warn!(
                        flow = %self.flow_id,
                        expected,
                        accepted,
                        "backend accepted a different amount than locally computed"
                    );
                    self.notifications
                        .amount_mismatch(&self.sale.sale_id, expected, accepted);
                }
                Ok(accepted)
            }
            Err(error) => {
                let transient_kind = match &error {
                    PollError::LimitExceeded { .. } => true,
                    PollError::Operation(notify_error) => notify_error.is_transient(),
                    PollError::Cancelled(_) => false,
                };
                if self.state.has_too_old_error && transient_kind {
                    // The ledger refused the stale transfer and the backend
                    // cannot see it either; drop the stuck ticket instead of
                    // stranding the user.
                    self.release_ticket("stale transfer never reconciled").await;
                }
                Err(ParticipationError::Unexpected {
                    step: "participation notify",
                    message: error.to_string(),
                })
            }
        }
    }

    /// Best-effort balance refresh; the participation has already succeeded
    /// by this point.
    async fn resync(&mut self) {
        if let Err(error) = self.refresher.refresh_accounts(&self.account).await {
            warn!(flow = %self.flow_id, %error, "account resync failed");
        }
    }

    /// Ask the backend to drop the open ticket. Failures are logged; every
    /// call site either aborts afterwards or has already completed the flow.
    async fn release_ticket(&mut self, reason: &str) {
        debug!(flow = %self.flow_id, reason, "releasing sale ticket");
        match self
            .sale_gateway
            .notify_payment_failure(&self.sale.sale_id)
            .await
        {
            Ok(dropped) => {
                if let Some(ticket) = dropped {
                    debug!(flow = %self.flow_id, ticket_id = ticket.ticket_id, "ticket released");
                }
                self.state.ticket = None;
            }
            Err(error) => warn!(flow = %self.flow_id, %error, "failed to release sale ticket"),
        }
    }

    async fn fail(&mut self, error: ParticipationError) -> ParticipationError {
        self.enter_phase(ParticipationPhase::Aborted).await;
        warn!(flow = %self.flow_id, %error, "participation aborted");
        self.notifications
            .participation_failed(&self.sale.sale_id, &error);
        error
    }

    async fn adopt_ticket(&mut self, ticket: SaleTicket) {
        self.dispatcher
            .dispatch(&ParticipationEvent::TicketAdopted {
                ticket: ticket.clone(),
            })
            .await;
        self.state.ticket = Some(ticket);
    }

    async fn enter_phase(&mut self, phase: ParticipationPhase) {
        debug!(flow = %self.flow_id, %phase, "entering phase");
        self.state.phase = phase;
        self.dispatcher
            .dispatch(&ParticipationEvent::PhaseEntered { phase })
            .await;
    }

    fn ticket_poll_identity(&self) -> PollIdentity {
        PollIdentity::from(format!("{}:ticket", self.sale.sale_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::types::{LedgerError, RefreshError, SaleId, Subaccount};
    use crate::retry::HighLoadSink;
    use crate::sale::events::{EventHandlerError, ParticipationEventHandler};
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use ParticipationPhase::*;

    const AMOUNT: Amount = 10_00000000;
    const FEE: Amount = 10000;
    const BALANCE: Amount = 20_00000000;

    fn account_id() -> AccountId {
        AccountId::new([7u8; 32])
    }

    fn ticket(amount: Amount) -> SaleTicket {
        SaleTicket {
            ticket_id: 42,
            creation_time: 1_700_000_000_000_000_000,
            amount,
            account: account_id(),
        }
    }

    fn snapshot() -> SaleSnapshot {
        SaleSnapshot {
            sale_id: SaleId::from("sale-1"),
            collection_account: AccountId::with_subaccount([9u8; 32], Subaccount([1u8; 32])),
            min_participant_commitment: 1_00000000,
            max_participant_commitment: 100_00000000,
            prior_commitment: 0,
            transfer_fee: FEE,
        }
    }

    /// Pop the next scripted response; the final entry repeats forever.
    fn next<T: Clone>(script: &Mutex<VecDeque<T>>) -> T {
        let mut script = script.lock().unwrap();
        if script.len() > 1 {
            script.pop_front().unwrap()
        } else {
            script.front().cloned().expect("stub script exhausted")
        }
    }

    fn scripted<T>(items: Vec<T>) -> Mutex<VecDeque<T>> {
        Mutex::new(items.into())
    }

    #[derive(Default)]
    struct StubSaleGateway {
        reserve_script: Mutex<VecDeque<Result<SaleTicket, TicketError>>>,
        open_ticket_script: Mutex<VecDeque<Result<Option<SaleTicket>, SaleGatewayError>>>,
        notify_script: Mutex<VecDeque<Result<Amount, NotifyError>>>,
        reserve_calls: AtomicUsize,
        notify_calls: AtomicUsize,
        release_calls: AtomicUsize,
    }

    #[async_trait]
    impl SaleGateway for StubSaleGateway {
        async fn reserve_ticket(
            &self,
            _request: &TicketRequest,
        ) -> Result<SaleTicket, TicketError> {
            self.reserve_calls.fetch_add(1, Ordering::SeqCst);
            next(&self.reserve_script)
        }

        async fn open_ticket(
            &self,
            _sale_id: &SaleId,
            _account: &AccountId,
            _tier: Tier,
        ) -> Result<Option<SaleTicket>, SaleGatewayError> {
            next(&self.open_ticket_script)
        }

        async fn notify_participation(
            &self,
            _sale_id: &SaleId,
            _account: &AccountId,
        ) -> Result<Amount, NotifyError> {
            self.notify_calls.fetch_add(1, Ordering::SeqCst);
            next(&self.notify_script)
        }

        async fn notify_payment_failure(
            &self,
            _sale_id: &SaleId,
        ) -> Result<Option<SaleTicket>, SaleGatewayError> {
            self.release_calls.fetch_add(1, Ordering::SeqCst);
            Ok(Some(ticket(AMOUNT)))
        }
    }

    #[derive(Default)]
    struct StubLedger {
        transfer_script: Mutex<VecDeque<Result<BlockHeight, TransferError>>>,
        transfer_calls: AtomicUsize,
    }

    #[async_trait]
    impl LedgerGateway for StubLedger {
        async fn transfer(
            &self,
            _request: &TransferRequest,
        ) -> Result<BlockHeight, TransferError> {
            self.transfer_calls.fetch_add(1, Ordering::SeqCst);
            next(&self.transfer_script)
        }

        async fn balance(&self, _account: &AccountId, _tier: Tier) -> Result<Amount, LedgerError> {
            Ok(BALANCE)
        }
    }

    #[derive(Default)]
    struct StubRefresher {
        calls: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl AccountRefresher for StubRefresher {
        async fn refresh_accounts(&self, _account: &AccountId) -> Result<(), RefreshError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(RefreshError("refresh endpoint down".to_string()))
            } else {
                Ok(())
            }
        }
    }

    #[derive(Default)]
    struct RecordingSink {
        successes: AtomicUsize,
        failures: Mutex<Vec<String>>,
        mismatches: Mutex<Vec<(Amount, Amount)>>,
        high_load_started: AtomicUsize,
        high_load_cleared: AtomicUsize,
    }

    impl NotificationSink for RecordingSink {
        fn participation_succeeded(&self, _sale_id: &SaleId, _accepted: Amount) {
            self.successes.fetch_add(1, Ordering::SeqCst);
        }

        fn participation_failed(&self, _sale_id: &SaleId, error: &ParticipationError) {
            self.failures.lock().unwrap().push(error.to_string());
        }

        fn amount_mismatch(&self, _sale_id: &SaleId, expected: Amount, accepted: Amount) {
            self.mismatches.lock().unwrap().push((expected, accepted));
        }
    }

    impl HighLoadSink for RecordingSink {
        fn high_load_started(&self) {
            self.high_load_started.fetch_add(1, Ordering::SeqCst);
        }

        fn high_load_cleared(&self) {
            self.high_load_cleared.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct RecordingHandler {
        phases: Arc<Mutex<Vec<ParticipationPhase>>>,
        tickets: Arc<Mutex<Vec<SaleTicket>>>,
        reloads: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl ParticipationEventHandler for RecordingHandler {
        async fn handle(&mut self, event: &ParticipationEvent) -> Result<(), EventHandlerError> {
            match event {
                ParticipationEvent::PhaseEntered { phase } => {
                    self.phases.lock().unwrap().push(*phase)
                }
                ParticipationEvent::TicketAdopted { ticket } => {
                    self.tickets.lock().unwrap().push(ticket.clone())
                }
                ParticipationEvent::ReloadRequested => {
                    self.reloads.fetch_add(1, Ordering::SeqCst);
                }
            }
            Ok(())
        }

        fn name(&self) -> &'static str {
            "recording"
        }
    }

    struct Fixture {
        gateway: Arc<StubSaleGateway>,
        ledger: Arc<StubLedger>,
        refresher: Arc<StubRefresher>,
        sink: Arc<RecordingSink>,
        phases: Arc<Mutex<Vec<ParticipationPhase>>>,
        tickets: Arc<Mutex<Vec<SaleTicket>>>,
        reloads: Arc<AtomicUsize>,
        coordinator: SaleParticipationCoordinator,
    }

    fn fixture(gateway: StubSaleGateway, ledger: StubLedger) -> Fixture {
        let gateway = Arc::new(gateway);
        let ledger = Arc::new(ledger);
        let refresher = Arc::new(StubRefresher::default());
        let sink = Arc::new(RecordingSink::default());
        let phases = Arc::new(Mutex::new(Vec::new()));
        let tickets = Arc::new(Mutex::new(Vec::new()));
        let reloads = Arc::new(AtomicUsize::new(0));

        let mut dispatcher = EventDispatcher::new();
        dispatcher.register_handler(Box::new(RecordingHandler {
            phases: Arc::clone(&phases),
            tickets: Arc::clone(&tickets),
            reloads: Arc::clone(&reloads),
        }));

        let engine = Arc::new(RetryEngine::new(sink.clone()));
        let coordinator = SaleParticipationCoordinator::new(
            snapshot(),
            account_id(),
            engine,
            gateway.clone(),
            ledger.clone(),
            refresher.clone(),
            sink.clone(),
            dispatcher,
        );

        Fixture {
            gateway,
            ledger,
            refresher,
            sink,
            phases,
            tickets,
            reloads,
            coordinator,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn end_to_end_success() {
        let gateway = StubSaleGateway {
            reserve_script: scripted(vec![Ok(ticket(AMOUNT))]),
            notify_script: scripted(vec![Ok(AMOUNT)]),
            ..Default::default()
        };
        let ledger = StubLedger {
            transfer_script: scripted(vec![Ok(7)]),
            ..Default::default()
        };
        let mut f = fixture(gateway, ledger);

        let outcome = f.coordinator.initiate(AMOUNT, BALANCE).await.unwrap();

        assert_eq!(
            outcome,
            ParticipationOutcome {
                block_height: Some(7),
                accepted: AMOUNT,
            }
        );
        assert_eq!(f.gateway.release_calls.load(Ordering::SeqCst), 1);
        assert_eq!(f.sink.successes.load(Ordering::SeqCst), 1);
        assert!(f.sink.failures.lock().unwrap().is_empty());
        assert!(f.sink.mismatches.lock().unwrap().is_empty());
        assert_eq!(f.reloads.load(Ordering::SeqCst), 1);
        assert_eq!(f.refresher.calls.load(Ordering::SeqCst), 1);
        assert_eq!(
            f.phases.lock().unwrap().as_slice(),
            &[Initialization, TicketReservation, Transfer, Notify, Resync, Done]
        );
        assert_eq!(f.tickets.lock().unwrap().len(), 1);
        assert!(f.coordinator.state().ticket.is_none());
    }

    #[tokio::test]
    async fn insufficient_balance_aborts_before_any_network_call() {
        let mut f = fixture(StubSaleGateway::default(), StubLedger::default());

        let error = f.coordinator.initiate(AMOUNT, 5_00000000).await.unwrap_err();

        assert!(matches!(error, ParticipationError::BalanceTooLow { .. }));
        assert_eq!(f.gateway.reserve_calls.load(Ordering::SeqCst), 0);
        assert_eq!(f.ledger.transfer_calls.load(Ordering::SeqCst), 0);
        assert_eq!(f.sink.failures.lock().unwrap().len(), 1);
        assert_eq!(
            f.phases.lock().unwrap().as_slice(),
            &[Initialization, Aborted]
        );
    }

    #[tokio::test]
    async fn amount_above_the_participant_ceiling_is_rejected_locally() {
        let mut f = fixture(StubSaleGateway::default(), StubLedger::default());

        let error = f
            .coordinator
            .initiate(150_00000000, 200_00000000)
            .await
            .unwrap_err();

        assert!(matches!(error, ParticipationError::AboveMaximum { .. }));
        assert_eq!(f.gateway.reserve_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn existing_ticket_is_adopted_instead_of_failing() {
        let gateway = StubSaleGateway {
            reserve_script: scripted(vec![Err(TicketError::AlreadyExists {
                ticket: ticket(AMOUNT),
            })]),
            notify_script: scripted(vec![Ok(AMOUNT)]),
            ..Default::default()
        };
        let ledger = StubLedger {
            transfer_script: scripted(vec![Ok(7)]),
            ..Default::default()
        };
        let mut f = fixture(gateway, ledger);

        let outcome = f.coordinator.initiate(AMOUNT, BALANCE).await.unwrap();

        assert_eq!(outcome.accepted, AMOUNT);
        // No second reservation was issued for the existing ticket.
        assert_eq!(f.gateway.reserve_calls.load(Ordering::SeqCst), 1);
        assert_eq!(f.tickets.lock().unwrap()[0].ticket_id, 42);
        assert_eq!(f.sink.successes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_reservation_failures_are_retried() {
        let gateway = StubSaleGateway {
            reserve_script: scripted(vec![
                Err(TicketError::Unavailable {
                    reason: "gateway timeout".to_string(),
                }),
                Err(TicketError::Unavailable {
                    reason: "gateway timeout".to_string(),
                }),
                Ok(ticket(AMOUNT)),
            ]),
            notify_script: scripted(vec![Ok(AMOUNT)]),
            ..Default::default()
        };
        let ledger = StubLedger {
            transfer_script: scripted(vec![Ok(7)]),
            ..Default::default()
        };
        let mut f = fixture(gateway, ledger);

        f.coordinator.initiate(AMOUNT, BALANCE).await.unwrap();

        assert_eq!(f.gateway.reserve_calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn closed_sale_aborts_without_releasing() {
        let gateway = StubSaleGateway {
            reserve_script: scripted(vec![Err(TicketError::SaleClosed)]),
            ..Default::default()
        };
        let mut f = fixture(gateway, StubLedger::default());

        let error = f.coordinator.initiate(AMOUNT, BALANCE).await.unwrap_err();

        assert!(matches!(
            error,
            ParticipationError::TicketRejected(TicketError::SaleClosed)
        ));
        assert_eq!(f.gateway.release_calls.load(Ordering::SeqCst), 0);
        assert_eq!(f.ledger.transfer_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn duplicate_transfer_continues_to_notify() {
        let gateway = StubSaleGateway {
            reserve_script: scripted(vec![Ok(ticket(AMOUNT))]),
            notify_script: scripted(vec![Ok(AMOUNT)]),
            ..Default::default()
        };
        let ledger = StubLedger {
            transfer_script: scripted(vec![Err(TransferError::Duplicate { height: 5 })]),
            ..Default::default()
        };
        let mut f = fixture(gateway, ledger);

        let outcome = f.coordinator.initiate(AMOUNT, BALANCE).await.unwrap();

        assert_eq!(outcome.block_height, Some(5));
        assert_eq!(f.gateway.notify_calls.load(Ordering::SeqCst), 1);
        assert_eq!(f.sink.successes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn insufficient_funds_releases_the_ticket_exactly_once() {
        let gateway = StubSaleGateway {
            reserve_script: scripted(vec![Ok(ticket(AMOUNT))]),
            ..Default::default()
        };
        let ledger = StubLedger {
            transfer_script: scripted(vec![Err(TransferError::InsufficientFunds {
                balance: 5_00000000,
            })]),
            ..Default::default()
        };
        let mut f = fixture(gateway, ledger);

        let error = f.coordinator.initiate(AMOUNT, BALANCE).await.unwrap_err();

        assert!(matches!(
            error,
            ParticipationError::TransferFailed(TransferError::InsufficientFunds { .. })
        ));
        assert_eq!(f.gateway.release_calls.load(Ordering::SeqCst), 1);
        assert_eq!(f.gateway.notify_calls.load(Ordering::SeqCst), 0);
        assert_eq!(f.sink.failures.lock().unwrap().len(), 1);
        assert_eq!(f.phases.lock().unwrap().last(), Some(&Aborted));
    }

    #[tokio::test(start_paused = true)]
    async fn rejected_transfer_releases_the_ticket_and_aborts() {
        let gateway = StubSaleGateway {
            reserve_script: scripted(vec![Ok(ticket(AMOUNT))]),
            ..Default::default()
        };
        let ledger = StubLedger {
            transfer_script: scripted(vec![Err(TransferError::Rejected {
                reason: "account frozen".to_string(),
            })]),
            ..Default::default()
        };
        let mut f = fixture(gateway, ledger);

        let error = f.coordinator.initiate(AMOUNT, BALANCE).await.unwrap_err();

        assert!(matches!(
            error,
            ParticipationError::TransferFailed(TransferError::Rejected { .. })
        ));
        assert_eq!(f.gateway.release_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn too_old_transfer_still_notifies() {
        let gateway = StubSaleGateway {
            reserve_script: scripted(vec![Ok(ticket(AMOUNT))]),
            notify_script: scripted(vec![Ok(AMOUNT)]),
            ..Default::default()
        };
        let ledger = StubLedger {
            transfer_script: scripted(vec![Err(TransferError::TooOld)]),
            ..Default::default()
        };
        let mut f = fixture(gateway, ledger);

        let outcome = f.coordinator.initiate(AMOUNT, BALANCE).await.unwrap();

        // The backend reconciled the stale transfer on its own.
        assert_eq!(outcome.block_height, None);
        assert_eq!(f.gateway.notify_calls.load(Ordering::SeqCst), 1);
        assert_eq!(f.sink.successes.load(Ordering::SeqCst), 1);
        // Released once, at DONE.
        assert_eq!(f.gateway.release_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn too_old_then_stuck_notify_forces_a_release() {
        let gateway = StubSaleGateway {
            reserve_script: scripted(vec![Ok(ticket(AMOUNT))]),
            notify_script: scripted(vec![Err(NotifyError::StillProcessing)]),
            ..Default::default()
        };
        let ledger = StubLedger {
            transfer_script: scripted(vec![Err(TransferError::TooOld)]),
            ..Default::default()
        };
        let mut f = fixture(gateway, ledger);

        let error = f.coordinator.initiate(AMOUNT, BALANCE).await.unwrap_err();

        assert!(matches!(
            error,
            ParticipationError::Unexpected {
                step: "participation notify",
                ..
            }
        ));
        assert_eq!(
            f.gateway.notify_calls.load(Ordering::SeqCst),
            NOTIFY_MAX_ATTEMPTS as usize
        );
        assert_eq!(f.gateway.release_calls.load(Ordering::SeqCst), 1);
        assert_eq!(f.sink.failures.lock().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn rejected_notify_keeps_the_ticket_in_place() {
        let gateway = StubSaleGateway {
            reserve_script: scripted(vec![Ok(ticket(AMOUNT))]),
            notify_script: scripted(vec![Err(NotifyError::Rejected {
                reason: "sale aborted by governance".to_string(),
            })]),
            ..Default::default()
        };
        let ledger = StubLedger {
            transfer_script: scripted(vec![Ok(7)]),
            ..Default::default()
        };
        let mut f = fixture(gateway, ledger);

        let error = f.coordinator.initiate(AMOUNT, BALANCE).await.unwrap_err();

        assert!(matches!(error, ParticipationError::Unexpected { .. }));
        // The ledger transfer resolved; the ticket stays so `restore` can
        // pick the flow back up.
        assert_eq!(f.gateway.release_calls.load(Ordering::SeqCst), 0);
        assert_eq!(f.sink.failures.lock().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn amount_mismatch_warns_but_still_succeeds() {
        let accepted = AMOUNT - 1;
        let gateway = StubSaleGateway {
            reserve_script: scripted(vec![Ok(ticket(AMOUNT))]),
            notify_script: scripted(vec![Ok(accepted)]),
            ..Default::default()
        };
        let ledger = StubLedger {
            transfer_script: scripted(vec![Ok(7)]),
            ..Default::default()
        };
        let mut f = fixture(gateway, ledger);

        let outcome = f.coordinator.initiate(AMOUNT, BALANCE).await.unwrap();

        assert_eq!(outcome.accepted, accepted);
        assert_eq!(
            f.sink.mismatches.lock().unwrap().as_slice(),
            &[(AMOUNT, accepted)]
        );
        assert_eq!(f.sink.successes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn restore_without_an_open_ticket_is_a_noop() {
        let gateway = StubSaleGateway {
            open_ticket_script: scripted(vec![Ok(None)]),
            ..Default::default()
        };
        let mut f = fixture(gateway, StubLedger::default());

        let outcome = f.coordinator.restore().await.unwrap();

        assert!(outcome.is_none());
        assert_eq!(f.ledger.transfer_calls.load(Ordering::SeqCst), 0);
        assert_eq!(f.sink.successes.load(Ordering::SeqCst), 0);
        assert!(f.sink.failures.lock().unwrap().is_empty());
        assert_eq!(f.phases.lock().unwrap().as_slice(), &[Initialization]);
    }

    #[tokio::test(start_paused = true)]
    async fn restore_with_an_open_ticket_resumes_at_the_transfer() {
        let gateway = StubSaleGateway {
            open_ticket_script: scripted(vec![Ok(Some(ticket(AMOUNT)))]),
            notify_script: scripted(vec![Ok(AMOUNT)]),
            ..Default::default()
        };
        let ledger = StubLedger {
            transfer_script: scripted(vec![Ok(7)]),
            ..Default::default()
        };
        let mut f = fixture(gateway, ledger);

        let outcome = f.coordinator.restore().await.unwrap().unwrap();

        assert_eq!(outcome.block_height, Some(7));
        assert_eq!(f.gateway.reserve_calls.load(Ordering::SeqCst), 0);
        assert_eq!(f.sink.successes.load(Ordering::SeqCst), 1);
        assert_eq!(f.gateway.release_calls.load(Ordering::SeqCst), 1);
        assert_eq!(
            f.phases.lock().unwrap().as_slice(),
            &[Initialization, Transfer, Notify, Resync, Done]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn failed_resync_does_not_change_the_outcome() {
        let gateway = StubSaleGateway {
            reserve_script: scripted(vec![Ok(ticket(AMOUNT))]),
            notify_script: scripted(vec![Ok(AMOUNT)]),
            ..Default::default()
        };
        let ledger = StubLedger {
            transfer_script: scripted(vec![Ok(7)]),
            ..Default::default()
        };
        let mut f = fixture(gateway, ledger);
        // Swap in a refresher that always fails.
        let failing = Arc::new(StubRefresher {
            fail: true,
            ..Default::default()
        });
        f.coordinator.refresher = failing.clone();

        let outcome = f.coordinator.initiate(AMOUNT, BALANCE).await;

        assert!(outcome.is_ok());
        assert_eq!(failing.calls.load(Ordering::SeqCst), 1);
        assert_eq!(f.sink.successes.load(Ordering::SeqCst), 1);
    }
}
