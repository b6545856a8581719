//! Content-addressed response cache with single-flight.
//!
//! Completed non-streamed responses are memoized under a [`CacheKey`]. When
//! several requests miss on the same key at once, only the first (the
//! leader) runs the computation; the others await the leader's shared future
//! and receive a copy of its outcome, success or failure.

use crate::error::AiError;
use crate::types::AiResponse;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::{BoxFuture, FutureExt, Shared};
use sha2::{Digest, Sha256};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Deterministic fingerprint of a cache-equivalent request.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
    /// Hash over function id, normalized prompt, context digest, model and
    /// temperature.
    pub fn fingerprint(
        function_id: &str,
        prompt: &str,
        context: Option<&str>,
        selected_text: Option<&str>,
        model: &str,
        temperature: Option<f32>,
    ) -> Self {
        let context_digest = digest_text(context.unwrap_or_default(), selected_text.unwrap_or_default());
        let temperature = temperature.map(|t| format!("{t:.3}")).unwrap_or_default();

        let mut hasher = Sha256::new();
        for field in [
            function_id,
            normalize_prompt(prompt).as_str(),
            context_digest.as_str(),
            model,
            temperature.as_str(),
        ] {
            // Length prefix keeps field boundaries unambiguous
            hasher.update((field.len() as u64).to_le_bytes());
            hasher.update(field.as_bytes());
        }
        Self(format!("{:x}", hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0[..16.min(self.0.len())])
    }
}

/// Trim and collapse runs of whitespace
pub fn normalize_prompt(prompt: &str) -> String {
    prompt.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn digest_text(context: &str, selected_text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update((context.len() as u64).to_le_bytes());
    hasher.update(context.as_bytes());
    hasher.update((selected_text.len() as u64).to_le_bytes());
    hasher.update(selected_text.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Stored response; immutable once written
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub response: AiResponse,
    pub created_at: Instant,
    pub ttl: Duration,
}

impl CacheEntry {
    pub fn is_expired(&self, now: Instant) -> bool {
        now.duration_since(self.created_at) >= self.ttl
    }
}

/// How a [`ResponseCache::get_or_compute`] call was satisfied
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheOutcome {
    Hit,
    /// This caller ran the computation
    Leader,
    /// This caller joined an in-flight computation
    Follower,
}

/// Cache counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub coalesced: u64,
    pub evictions: u64,
    pub entries: usize,
}

type FlightFuture = Shared<BoxFuture<'static, Result<AiResponse, AiError>>>;

#[derive(Debug)]
struct Flight {
    id: u64,
    future: FlightFuture,
}

/// Concurrent response cache.
#[derive(Debug)]
pub struct ResponseCache {
    entries: DashMap<CacheKey, CacheEntry>,
    inflight: DashMap<CacheKey, Flight>,
    default_ttl: Duration,
    max_entries: usize,
    next_flight: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    coalesced: AtomicU64,
    evictions: AtomicU64,
}

impl ResponseCache {
    pub fn new(default_ttl: Duration, max_entries: usize) -> Self {
        Self {
            entries: DashMap::new(),
            inflight: DashMap::new(),
            default_ttl,
            max_entries: max_entries.max(1),
            next_flight: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            coalesced: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    /// Look up a live entry. Expired entries are dropped on the way.
    pub fn get(&self, key: &CacheKey) -> Option<AiResponse> {
        match self.peek(key) {
            Some(response) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                debug!("Cache hit: {}", key);
                Some(response)
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    fn peek(&self, key: &CacheKey) -> Option<AiResponse> {
        let now = Instant::now();
        {
            let entry = self.entries.get(key)?;
            if !entry.is_expired(now) {
                return Some(entry.response.clone());
            }
        }
        self.entries.remove_if(key, |_, entry| entry.is_expired(now));
        None
    }

    /// Store a response. Evicts expired entries, then the oldest one, when full.
    pub fn put(&self, key: CacheKey, response: AiResponse, ttl: Duration) {
        if !self.entries.contains_key(&key) && self.entries.len() >= self.max_entries {
            self.evict_for_insert();
        }
        let mut response = response;
        response.chunks.clear();
        self.entries.insert(
            key,
            CacheEntry {
                response,
                created_at: Instant::now(),
                ttl,
            },
        );
    }

    fn evict_for_insert(&self) {
        let removed = self.sweep_expired();
        if removed > 0 && self.entries.len() < self.max_entries {
            return;
        }

        let oldest = self
            .entries
            .iter()
            .min_by_key(|entry| entry.created_at)
            .map(|entry| entry.key().clone());
        if let Some(key) = oldest {
            self.entries.remove(&key);
            self.evictions.fetch_add(1, Ordering::Relaxed);
            debug!("Cache evicted oldest entry: {}", key);
        }
    }

    /// Drop every expired entry, returning how many were removed
    pub fn sweep_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.is_expired(now));
        let removed = before.saturating_sub(self.entries.len());
        if removed > 0 {
            self.evictions.fetch_add(removed as u64, Ordering::Relaxed);
        }
        removed
    }

    pub fn invalidate(&self, key: &CacheKey) -> bool {
        self.entries.remove(key).is_some()
    }

    pub fn clear(&self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of keys with a computation in flight
    pub fn inflight(&self) -> usize {
        self.inflight.len()
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            coalesced: self.coalesced.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            entries: self.entries.len(),
        }
    }

    /// Return the cached response for `key`, or run `compute` exactly once
    /// across concurrent callers and cache a successful result for `ttl`.
    ///
    /// If the leader is dropped before completion, callers already waiting
    /// keep driving the computation; later callers start a fresh one.
    pub async fn get_or_compute<F>(
        self: &Arc<Self>,
        key: CacheKey,
        ttl: Duration,
        compute: F,
    ) -> (Result<AiResponse, AiError>, CacheOutcome)
    where
        F: FnOnce() -> BoxFuture<'static, Result<AiResponse, AiError>>,
    {
        if let Some(hit) = self.get(&key) {
            return (Ok(hit), CacheOutcome::Hit);
        }

        let (future, outcome, _guard) = match self.inflight.entry(key.clone()) {
            Entry::Occupied(flight) => {
                self.coalesced.fetch_add(1, Ordering::Relaxed);
                debug!("Joining in-flight computation: {}", key);
                (flight.get().future.clone(), CacheOutcome::Follower, None)
            }
            Entry::Vacant(slot) => {
                // A leader may have finished between the miss and here
                if let Some(hit) = self.peek(&key) {
                    return (Ok(hit), CacheOutcome::Hit);
                }

                let id = self.next_flight.fetch_add(1, Ordering::Relaxed);
                let cache = Arc::clone(self);
                let flight_key = key.clone();
                let work = compute();
                let future = async move {
                    let result = work.await;
                    if let Ok(response) = &result {
                        if response.is_success() {
                            cache.put(flight_key.clone(), response.clone(), ttl);
                        }
                    }
                    cache.finish_flight(&flight_key, id);
                    result
                }
                .boxed()
                .shared();

                slot.insert(Flight {
                    id,
                    future: future.clone(),
                });
                let guard = FlightGuard {
                    cache: Arc::clone(self),
                    key,
                    id,
                };
                (future, CacheOutcome::Leader, Some(guard))
            }
        };

        (future.await, outcome)
    }

    fn finish_flight(&self, key: &CacheKey, id: u64) {
        self.inflight.remove_if(key, |_, flight| flight.id == id);
    }
}

/// Unregisters the leader's flight if the leader goes away early
struct FlightGuard {
    cache: Arc<ResponseCache>,
    key: CacheKey,
    id: u64,
}

impl Drop for FlightGuard {
    fn drop(&mut self) {
        self.cache.finish_flight(&self.key, self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{FinishReason, ProviderResponse, Usage};
    use std::sync::atomic::AtomicUsize;

    fn response(text: &str) -> AiResponse {
        AiResponse::succeeded(
            "req",
            "mock",
            ProviderResponse {
                id: "resp".into(),
                model: "m".into(),
                text: text.into(),
                finish_reason: FinishReason::Stop,
                usage: Usage::new(1, 1),
            },
        )
    }

    fn key(prompt: &str) -> CacheKey {
        CacheKey::fingerprint("f", prompt, Some("ctx"), None, "m", Some(0.7))
    }

    #[test]
    fn test_fingerprint_is_deterministic_and_normalized() {
        assert_eq!(key("hello world"), key("hello world"));
        assert_eq!(key("  hello \n\t world "), key("hello world"));
        assert_ne!(key("hello world"), key("hello there"));

        let other_model = CacheKey::fingerprint("f", "hello world", Some("ctx"), None, "m2", Some(0.7));
        assert_ne!(key("hello world"), other_model);
        let other_temp = CacheKey::fingerprint("f", "hello world", Some("ctx"), None, "m", Some(0.2));
        assert_ne!(key("hello world"), other_temp);
        let other_context = CacheKey::fingerprint("f", "hello world", Some("ctx2"), None, "m", Some(0.7));
        assert_ne!(key("hello world"), other_context);
    }

    #[test]
    fn test_context_and_selection_do_not_alias() {
        let a = CacheKey::fingerprint("f", "", Some("ab"), Some("c"), "m", None);
        let b = CacheKey::fingerprint("f", "", Some("a"), Some("bc"), "m", None);
        assert_ne!(a, b);
    }

    #[tokio::test(start_paused = true)]
    async fn test_entries_expire_lazily() {
        let cache = ResponseCache::new(Duration::from_secs(60), 10);
        cache.put(key("a"), response("A"), Duration::from_secs(10));

        assert_eq!(cache.get(&key("a")).unwrap().text, "A");
        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(cache.get(&key("a")).is_none());
        assert!(cache.is_empty());

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_eviction_prefers_expired_then_oldest() {
        let cache = ResponseCache::new(Duration::from_secs(60), 2);
        cache.put(key("short"), response("S"), Duration::from_secs(1));
        tokio::time::advance(Duration::from_millis(10)).await;
        cache.put(key("old"), response("O"), Duration::from_secs(60));
        tokio::time::advance(Duration::from_secs(2)).await;

        cache.put(key("new"), response("N"), Duration::from_secs(60));
        assert!(cache.get(&key("old")).is_some());
        assert!(cache.get(&key("short")).is_none());

        cache.put(key("newer"), response("N2"), Duration::from_secs(60));
        assert_eq!(cache.len(), 2);
        assert!(cache.get(&key("old")).is_none());
        assert!(cache.get(&key("newer")).is_some());
    }

    #[tokio::test]
    async fn test_single_flight_runs_once() {
        let cache = Arc::new(ResponseCache::new(Duration::from_secs(60), 10));
        let calls = Arc::new(AtomicUsize::new(0));
        let gate = Arc::new(tokio::sync::Notify::new());

        let run = |cache: Arc<ResponseCache>| {
            let calls = calls.clone();
            let gate = gate.clone();
            async move {
                cache
                    .get_or_compute(key("same"), Duration::from_secs(60), move || {
                        async move {
                            calls.fetch_add(1, Ordering::SeqCst);
                            gate.notified().await;
                            Ok(response("shared"))
                        }
                        .boxed()
                    })
                    .await
            }
        };

        let first = tokio::spawn(run(cache.clone()));
        while cache.inflight() == 0 {
            tokio::task::yield_now().await;
        }
        let second = tokio::spawn(run(cache.clone()));
        while cache.stats().coalesced == 0 {
            tokio::task::yield_now().await;
        }
        gate.notify_waiters();

        let (a, a_outcome) = first.await.unwrap();
        let (b, b_outcome) = second.await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(a.unwrap().text, "shared");
        assert_eq!(b.unwrap().text, "shared");
        assert_eq!(a_outcome, CacheOutcome::Leader);
        assert_eq!(b_outcome, CacheOutcome::Follower);
        assert_eq!(cache.inflight(), 0);

        let (hit, outcome) = run(cache.clone()).await;
        assert_eq!(outcome, CacheOutcome::Hit);
        assert_eq!(hit.unwrap().text, "shared");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failures_are_shared_but_not_cached() {
        let cache = Arc::new(ResponseCache::new(Duration::from_secs(60), 10));
        let (result, _) = cache
            .get_or_compute(key("x"), Duration::from_secs(60), || {
                async { Err(AiError::transient("boom")) }.boxed()
            })
            .await;
        assert!(matches!(result, Err(AiError::Transient(_))));
        assert!(cache.is_empty());
        assert_eq!(cache.inflight(), 0);
    }

    #[tokio::test]
    async fn test_dropped_leader_unregisters_flight() {
        let cache = Arc::new(ResponseCache::new(Duration::from_secs(60), 10));
        let leader = {
            let cache = cache.clone();
            tokio::spawn(async move {
                cache
                    .get_or_compute(key("slow"), Duration::from_secs(60), || {
                        futures::future::pending().boxed()
                    })
                    .await
            })
        };
        while cache.inflight() == 0 {
            tokio::task::yield_now().await;
        }
        leader.abort();
        let _ = leader.await;
        assert_eq!(cache.inflight(), 0);
    }
}
