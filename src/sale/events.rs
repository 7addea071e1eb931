//! Progress events and user-facing notification seams for sale participation.
//!
//! The coordinator emits a [`ParticipationEvent`] for every state transition
//! and dispatches it to all registered handlers; handlers are how a caller
//! drives progress display without the coordinator knowing anything about
//! rendering. Terminal outcomes and warnings go through the
//! [`NotificationSink`] collaborator instead, which this layer only calls,
//! never renders.

use async_trait::async_trait;

use crate::backend::types::{Amount, SaleId, SaleTicket};

use super::types::{ParticipationError, ParticipationPhase};

/// Events emitted while a participation flow advances.
#[derive(Debug, Clone)]
pub enum ParticipationEvent {
    /// The flow entered a new phase.
    PhaseEntered { phase: ParticipationPhase },
    /// An existing or freshly reserved ticket became the flow's ticket.
    TicketAdopted { ticket: SaleTicket },
    /// The flow finished successfully and caller-side state should be
    /// reloaded.
    ReloadRequested,
}

#[derive(Debug, thiserror::Error)]
#[error("event handler failed: {0}")]
pub struct EventHandlerError(pub String);

/// Trait for observing participation progress.
#[async_trait]
pub trait ParticipationEventHandler: Send + Sync {
    /// Handle one event. Called for every event the coordinator dispatches.
    async fn handle(&mut self, event: &ParticipationEvent) -> Result<(), EventHandlerError>;

    /// Name used in logs when a handler fails.
    fn name(&self) -> &'static str;
}

/// Dispatcher fanning events out to every registered handler.
///
/// Handlers are called in registration order. Errors from handlers are
/// logged, but do not stop other handlers from running.
pub struct EventDispatcher {
    handlers: Vec<Box<dyn ParticipationEventHandler>>,
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self {
            handlers: Vec::new(),
        }
    }

    pub fn register_handler(&mut self, handler: Box<dyn ParticipationEventHandler>) {
        self.handlers.push(handler);
    }

    pub async fn dispatch(&mut self, event: &ParticipationEvent) {
        for handler in &mut self.handlers {
            if let Err(e) = handler.handle(event).await {
                tracing::error!("handler {} failed to process event: {}", handler.name(), e);
            }
        }
    }
}

impl Default for EventDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

/// Terminal and warning notifications surfaced to the user. Exactly one
/// terminal notification is emitted per flow.
pub trait NotificationSink: Send + Sync {
    fn participation_succeeded(&self, sale_id: &SaleId, accepted: Amount);

    fn participation_failed(&self, sale_id: &SaleId, error: &ParticipationError);

    /// Non-fatal: the backend accepted a different amount than the client
    /// computed. The backend's figure is authoritative.
    fn amount_mismatch(&self, sale_id: &SaleId, expected: Amount, accepted: Amount);
}
