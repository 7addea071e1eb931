//! Concurrent reads through both consistency tiers of the backend.
//!
//! A read issued here is launched once per selected tier; each settlement is
//! delivered to the caller's success or failure callback together with the
//! tier it came from. Once the authoritative call has settled, a later
//! speculative settlement is discarded, so a slow stale response can never
//! overwrite a result the caller already treated as ground truth. The call
//! itself resolves as soon as the first launched read settles; reconciling an
//! authoritative result against previously delivered speculative state stays
//! with the caller.

use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex};

use tracing::debug;

/// Consistency tier a single read is serviced at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Tier {
    /// Fast, possibly stale or unreplicated.
    Speculative,
    /// Confirmed by the replica set's consensus.
    Authoritative,
}

impl Tier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Speculative => "speculative",
            Tier::Authoritative => "authoritative",
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which tiers a fetch launches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FetchStrategy {
    #[default]
    Both,
    SpeculativeOnly,
    AuthoritativeOnly,
}

impl FetchStrategy {
    fn tiers(&self) -> &'static [Tier] {
        match self {
            FetchStrategy::Both => &[Tier::Authoritative, Tier::Speculative],
            FetchStrategy::SpeculativeOnly => &[Tier::Speculative],
            FetchStrategy::AuthoritativeOnly => &[Tier::Authoritative],
        }
    }
}

struct Delivery<S, F> {
    on_success: S,
    on_failure: F,
    authoritative_settled: bool,
}

/// Launch one read per tier selected by `strategy` and deliver settlements to
/// the callbacks. Resolves once the first launched read settles; remaining
/// reads keep delivering through the suppression latch described above.
pub async fn fetch<T, E, F, Fut, S, FE>(factory: F, on_success: S, on_failure: FE, strategy: FetchStrategy)
where
    F: Fn(Tier) -> Fut,
    Fut: Future<Output = Result<T, E>> + Send + 'static,
    T: Send + 'static,
    E: fmt::Display + Send + 'static,
    S: FnMut(Tier, T) + Send + 'static,
    FE: FnMut(Tier, E) + Send + 'static,
{
    let tiers = strategy.tiers();
    let delivery = Arc::new(Mutex::new(Delivery {
        on_success,
        on_failure,
        authoritative_settled: false,
    }));

    let mut reads = Vec::with_capacity(tiers.len());
    for &tier in tiers {
        let read = factory(tier);
        let delivery = Arc::clone(&delivery);
        reads.push(tokio::spawn(async move {
            let outcome = read.await;
            // Latch check and callback dispatch are one critical section, so
            // no speculative settlement can slip in between the authoritative
            // settlement and its delivery.
            let mut delivery = delivery.lock().unwrap();
            if tier == Tier::Speculative && delivery.authoritative_settled {
                debug!("discarding speculative result; authoritative tier already settled");
            } else {
                if tier == Tier::Authoritative {
                    delivery.authoritative_settled = true;
                }
                match outcome {
                    Ok(value) => (delivery.on_success)(tier, value),
                    Err(error) => {
                        debug!(%tier, %error, "tiered read failed");
                        (delivery.on_failure)(tier, error);
                    }
                }
            }
            tier
        }));
    }

    // Detached handles keep running after this resolves on the first settle.
    let (first, _, _) = futures_util::future::select_all(reads).await;
    match first {
        Ok(tier) => debug!(%tier, "first tiered read settled"),
        Err(error) => debug!(%error, "tiered read task failed"),
    }
}
