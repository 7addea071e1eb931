//! Cancellable exponential-backoff retry driver.
//!
//! - `engine`: the poll loop, its options and its distinguished error taxonomy
//! - `registry`: identity-token cancellation bookkeeping shared by the engine
//!   and its callers

pub mod engine;
pub mod registry;

pub use engine::{
    DEFAULT_HIGH_LOAD_THRESHOLD, DEFAULT_MAX_ATTEMPTS, DEFAULT_WAIT, HighLoadSink, PollError,
    PollOptions, RetryEngine,
};
pub use registry::{CancelRegistry, PollIdentity};
