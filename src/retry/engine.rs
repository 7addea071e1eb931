//! Generic cancellable retry driver for asynchronous backend operations.
//!
//! The engine runs an operation, classifies each failure through a
//! caller-supplied `should_exit` predicate, and retries non-terminal failures
//! with a fixed or doubling delay up to an attempt ceiling. Both the in-flight
//! operation and every inter-attempt wait race against the cancellation signal
//! of the poll's identity token, so cancellation is observed promptly even
//! while a call is still outstanding (the underlying network call itself is
//! not aborted, only the engine's wait on it).
//!
//! Giving up and being cancelled are distinguished from anything the wrapped
//! operation can produce: `PollError::LimitExceeded` and
//! `PollError::Cancelled` versus `PollError::Operation`.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use super::registry::{CancelRegistry, PollIdentity, PollRegistration};

/// Default attempt ceiling.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 10;
/// Default base delay between attempts.
pub const DEFAULT_WAIT: Duration = Duration::from_millis(500);
/// Default number of consecutive failures before the high-load notification.
pub const DEFAULT_HIGH_LOAD_THRESHOLD: u32 = 6;

/// Receiver of the one "system under high load" warning a long-failing poll
/// emits, and of its retraction when the poll exits.
pub trait HighLoadSink: Send + Sync {
    fn high_load_started(&self);
    fn high_load_cleared(&self);
}

/// Drops high-load notifications.
impl HighLoadSink for () {
    fn high_load_started(&self) {}
    fn high_load_cleared(&self) {}
}

/// Tuning of one poll loop.
#[derive(Debug, Clone)]
pub struct PollOptions {
    /// Total attempts before the engine gives up with `LimitExceeded`.
    pub max_attempts: u32,
    /// Base delay before the second attempt.
    pub wait: Duration,
    /// Double the delay after every failed attempt.
    pub exponential_backoff: bool,
    /// Identity registered for the poll's lifetime; enables cancellation and
    /// refuses a second concurrent poll under the same identity.
    pub identity: Option<PollIdentity>,
    /// Consecutive failures before the high-load notification. Zero disables.
    pub high_load_threshold: u32,
}

impl Default for PollOptions {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            wait: DEFAULT_WAIT,
            exponential_backoff: false,
            identity: None,
            high_load_threshold: DEFAULT_HIGH_LOAD_THRESHOLD,
        }
    }
}

impl PollOptions {
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_wait(mut self, wait: Duration) -> Self {
        self.wait = wait;
        self
    }

    pub fn with_exponential_backoff(mut self) -> Self {
        self.exponential_backoff = true;
        self
    }

    pub fn with_identity(mut self, identity: impl Into<PollIdentity>) -> Self {
        self.identity = Some(identity.into());
        self
    }

    pub fn with_high_load_threshold(mut self, threshold: u32) -> Self {
        self.high_load_threshold = threshold;
        self
    }
}

/// Failure of a poll loop, keeping "the operation failed terminally" apart
/// from "the engine gave up" and "the poll was cancelled".
#[derive(Debug, thiserror::Error)]
pub enum PollError<E> {
    /// The operation failed and `should_exit` classified the error as
    /// terminal; the error is propagated verbatim.
    #[error("operation failed: {0}")]
    Operation(E),
    /// The attempt ceiling was reached without a success.
    #[error("gave up after {attempts} attempts; last error: {last}")]
    LimitExceeded { attempts: u32, last: E },
    /// The poll's identity token was cancelled, or was still claimed by an
    /// earlier poll when this one started.
    #[error("poll {0} was cancelled")]
    Cancelled(PollIdentity),
}

impl<E> PollError<E> {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, PollError::Cancelled(_))
    }
}

/// Retry driver holding the cancellation registry and the high-load sink.
pub struct RetryEngine {
    registry: CancelRegistry,
    load_sink: Arc<dyn HighLoadSink>,
}

impl RetryEngine {
    pub fn new(load_sink: Arc<dyn HighLoadSink>) -> Self {
        Self {
            registry: CancelRegistry::new(),
            load_sink,
        }
    }

    /// Build an engine sharing an existing registry, so several engines can
    /// honor one cancellation namespace.
    pub fn with_registry(registry: CancelRegistry, load_sink: Arc<dyn HighLoadSink>) -> Self {
        Self {
            registry,
            load_sink,
        }
    }

    pub fn registry(&self) -> &CancelRegistry {
        &self.registry
    }

    /// Cancel the poll registered under `identity`, if any.
    pub fn cancel(&self, identity: &PollIdentity) -> bool {
        self.registry.cancel(identity)
    }

    /// Run `operation` until it succeeds, fails terminally per `should_exit`,
    /// exhausts `options.max_attempts`, or is cancelled. The first attempt
    /// runs immediately; later attempts wait the configured delay.
    pub async fn poll<T, E, F, Fut>(
        &self,
        mut operation: F,
        should_exit: impl Fn(&E) -> bool,
        options: PollOptions,
    ) -> Result<T, PollError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: fmt::Display,
    {
        let mut registration = match &options.identity {
            Some(identity) => match self.registry.register(identity) {
                Ok(registration) => Some(registration),
                Err(_) => {
                    warn!(%identity, "refusing a second poll under an active identity");
                    return Err(PollError::Cancelled(identity.clone()));
                }
            },
            None => None,
        };

        let mut notified_high_load = false;
        let result = self
            .drive(
                &mut operation,
                &should_exit,
                &options,
                &mut registration,
                &mut notified_high_load,
            )
            .await;
        if notified_high_load {
            self.load_sink.high_load_cleared();
        }
        result
    }

    async fn drive<T, E, F, Fut>(
        &self,
        operation: &mut F,
        should_exit: &impl Fn(&E) -> bool,
        options: &PollOptions,
        registration: &mut Option<PollRegistration>,
        notified_high_load: &mut bool,
    ) -> Result<T, PollError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: fmt::Display,
    {
        let mut attempts: u32 = 0;
        let mut wait = options.wait;
        loop {
            let outcome = tokio::select! {
                outcome = operation() => outcome,
                identity = wait_cancelled(registration.as_mut()) => {
                    return Err(PollError::Cancelled(identity));
                }
            };
            let error = match outcome {
                Ok(value) => return Ok(value),
                Err(error) if should_exit(&error) => return Err(PollError::Operation(error)),
                Err(error) => error,
            };

            attempts += 1;
            if options.high_load_threshold > 0
                && attempts == options.high_load_threshold
                && !*notified_high_load
            {
                *notified_high_load = true;
                self.load_sink.high_load_started();
            }
            if attempts >= options.max_attempts {
                return Err(PollError::LimitExceeded {
                    attempts,
                    last: error,
                });
            }

            debug!(
                attempt = attempts,
                wait_ms = wait.as_millis() as u64,
                %error,
                "retrying after transient failure"
            );
            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                identity = wait_cancelled(registration.as_mut()) => {
                    return Err(PollError::Cancelled(identity));
                }
            }
            if options.exponential_backoff {
                wait = wait.saturating_mul(2);
            }
        }
    }
}

async fn wait_cancelled(registration: Option<&mut PollRegistration>) -> PollIdentity {
    match registration {
        Some(registration) => {
            registration.cancelled().await;
            registration.identity().clone()
        }
        None => std::future::pending().await,
    }
}
