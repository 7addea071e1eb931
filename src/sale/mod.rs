//! Sale participation flow.
//!
//! This module contains the state machine that drives one user's token-sale
//! participation to exactly one terminal outcome, plus the event and
//! notification seams it reports through:
//!
//! - `coordinator`: the resumable `SaleParticipationCoordinator` state machine
//! - `events`: progress events, the dispatcher, and the notification sink
//! - `types`: phases, flow state, outcomes, and the surfaced error taxonomy

pub mod coordinator;
pub mod events;
pub mod types;

pub use coordinator::SaleParticipationCoordinator;
pub use events::{
    EventDispatcher, EventHandlerError, NotificationSink, ParticipationEvent,
    ParticipationEventHandler,
};
pub use types::{ParticipationError, ParticipationOutcome, ParticipationPhase, ParticipationState};
