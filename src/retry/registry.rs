//! Cancellation bookkeeping for in-flight retry loops.
//!
//! Every poll started with an identity token registers itself here for the
//! task's lifetime. A `cancel` call flips the token's signal, which the poll
//! loop races against both the in-flight operation and the inter-attempt wait.
//! The registry is an explicit object owned by the engine instance, not a
//! process-wide global; at most one poll may be active per identity.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};

use tokio::sync::watch;

/// Stable identity of one retry loop, used for cancellation and for refusing
/// a second concurrent poll with the same identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PollIdentity(String);

impl PollIdentity {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PollIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for PollIdentity {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for PollIdentity {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Returned by `register` when a poll with the same identity is still active.
#[derive(Debug, thiserror::Error)]
#[error("a poll with identity {0} is already active")]
pub struct AlreadyActive(pub PollIdentity);

/// Identity-token to cancel-handle map shared between an engine and its
/// callers.
#[derive(Clone, Default)]
pub struct CancelRegistry {
    inner: Arc<Mutex<HashMap<PollIdentity, watch::Sender<bool>>>>,
}

impl CancelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `identity` for a new poll. Fails while a previous registration
    /// under the same identity is still alive.
    pub(crate) fn register(
        &self,
        identity: &PollIdentity,
    ) -> Result<PollRegistration, AlreadyActive> {
        let mut active = self.inner.lock().unwrap();
        if active.contains_key(identity) {
            return Err(AlreadyActive(identity.clone()));
        }
        let (sender, signal) = watch::channel(false);
        active.insert(identity.clone(), sender);
        Ok(PollRegistration {
            registry: self.clone(),
            identity: identity.clone(),
            signal,
        })
    }

    /// Signal the poll registered under `identity` to stop. Returns whether a
    /// registration was found.
    pub fn cancel(&self, identity: &PollIdentity) -> bool {
        match self.inner.lock().unwrap().get(identity) {
            Some(sender) => sender.send(true).is_ok(),
            None => false,
        }
    }

    /// Whether a poll is currently registered under `identity`.
    pub fn is_active(&self, identity: &PollIdentity) -> bool {
        self.inner.lock().unwrap().contains_key(identity)
    }

    fn deregister(&self, identity: &PollIdentity) {
        self.inner.lock().unwrap().remove(identity);
    }
}

/// Live claim on an identity. Dropping it releases the identity on every poll
/// exit path, including early returns and cancellation itself.
pub(crate) struct PollRegistration {
    registry: CancelRegistry,
    identity: PollIdentity,
    signal: watch::Receiver<bool>,
}

impl PollRegistration {
    pub(crate) fn identity(&self) -> &PollIdentity {
        &self.identity
    }

    /// Resolves once this registration has been cancelled.
    pub(crate) async fn cancelled(&mut self) {
        loop {
            if *self.signal.borrow_and_update() {
                return;
            }
            if self.signal.changed().await.is_err() {
                // Sender gone without a cancellation; nothing can fire anymore.
                std::future::pending::<()>().await;
            }
        }
    }
}

impl Drop for PollRegistration {
    fn drop(&mut self) {
        self.registry.deregister(&self.identity);
    }
}
