//! Two-level concurrency limiter.
//!
//! A global semaphore bounds all in-flight dispatches; one semaphore per
//! provider bounds each backend. Waiting is cooperative and bounded by the
//! request deadline.

use crate::error::AiError;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;
use tracing::debug;

#[derive(Debug)]
struct ProviderSlots {
    semaphore: Arc<Semaphore>,
    ceiling: usize,
}

/// Bounds in-flight requests globally and per provider.
#[derive(Debug)]
pub struct ConcurrencyLimiter {
    global: Arc<Semaphore>,
    global_ceiling: usize,
    providers: HashMap<String, ProviderSlots>,
}

impl ConcurrencyLimiter {
    /// Create a limiter from a global ceiling and `(provider, ceiling)` pairs
    pub fn new<I, S>(global_ceiling: usize, providers: I) -> Self
    where
        I: IntoIterator<Item = (S, usize)>,
        S: Into<String>,
    {
        let providers = providers
            .into_iter()
            .map(|(name, ceiling)| {
                (
                    name.into(),
                    ProviderSlots {
                        semaphore: Arc::new(Semaphore::new(ceiling)),
                        ceiling,
                    },
                )
            })
            .collect();

        Self {
            global: Arc::new(Semaphore::new(global_ceiling)),
            global_ceiling,
            providers,
        }
    }

    /// Acquire a global slot, then a slot for `provider`.
    ///
    /// Fails with [`AiError::Timeout`] if `deadline` passes first; no slot is
    /// held in that case.
    pub async fn acquire(&self, provider: &str, deadline: Instant) -> Result<SlotGuard, AiError> {
        let slots = self
            .providers
            .get(provider)
            .ok_or_else(|| AiError::configuration(format!("no concurrency slots for provider '{provider}'")))?;

        if self.global.available_permits() == 0 {
            debug!("Waiting for a global slot ({} in flight)", self.global_ceiling);
        }
        let global = acquire_until(&self.global, deadline, "global").await?;

        if slots.semaphore.available_permits() == 0 {
            debug!("Waiting for a {} slot ({} in flight)", provider, slots.ceiling);
        }
        let provider_permit = acquire_until(&slots.semaphore, deadline, provider).await?;

        Ok(SlotGuard {
            _provider: provider_permit,
            _global: global,
        })
    }

    /// Free global slots
    pub fn global_available(&self) -> usize {
        self.global.available_permits()
    }

    /// Free slots for `provider`, `None` for unknown providers
    pub fn available(&self, provider: &str) -> Option<usize> {
        self.providers
            .get(provider)
            .map(|s| s.semaphore.available_permits())
    }

    pub fn global_ceiling(&self) -> usize {
        self.global_ceiling
    }

    pub fn ceiling(&self, provider: &str) -> Option<usize> {
        self.providers.get(provider).map(|s| s.ceiling)
    }
}

async fn acquire_until(
    semaphore: &Arc<Semaphore>,
    deadline: Instant,
    scope: &str,
) -> Result<OwnedSemaphorePermit, AiError> {
    match tokio::time::timeout_at(deadline, Arc::clone(semaphore).acquire_owned()).await {
        Ok(Ok(permit)) => Ok(permit),
        Ok(Err(_closed)) => Err(AiError::other(format!("{scope} limiter closed"))),
        Err(_elapsed) => Err(AiError::timeout(format!(
            "deadline elapsed waiting for a {scope} concurrency slot"
        ))),
    }
}

/// Held slots; both are returned when the guard drops.
#[derive(Debug)]
pub struct SlotGuard {
    // Field order: the provider slot is released before the global one.
    _provider: OwnedSemaphorePermit,
    _global: OwnedSemaphorePermit,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn test_per_provider_ceiling_times_out() {
        let limiter = ConcurrencyLimiter::new(4, [("a", 1)]);
        let deadline = Instant::now() + Duration::from_secs(1);

        let held = limiter.acquire("a", deadline).await.unwrap();
        assert_eq!(limiter.available("a"), Some(0));
        assert_eq!(limiter.global_available(), 3);

        let err = limiter.acquire("a", deadline).await.unwrap_err();
        assert!(matches!(err, AiError::Timeout(_)));
        // The failed attempt gave its global slot back
        assert_eq!(limiter.global_available(), 3);

        drop(held);
        assert_eq!(limiter.available("a"), Some(1));
        assert_eq!(limiter.global_available(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_global_ceiling_spans_providers() {
        let limiter = Arc::new(ConcurrencyLimiter::new(1, [("a", 2), ("b", 2)]));
        let far = Instant::now() + Duration::from_secs(60);

        let held = limiter.acquire("a", far).await.unwrap();
        let waiter = {
            let limiter = limiter.clone();
            tokio::spawn(async move { limiter.acquire("b", far).await.map(|_| ()) })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());

        drop(held);
        waiter.await.unwrap().unwrap();
        assert_eq!(limiter.global_available(), 1);
    }

    #[tokio::test]
    async fn test_unknown_provider() {
        let limiter = ConcurrencyLimiter::new(1, [("a", 1)]);
        let deadline = Instant::now() + Duration::from_secs(1);
        assert!(matches!(
            limiter.acquire("zzz", deadline).await,
            Err(AiError::Configuration(_))
        ));
    }
}
