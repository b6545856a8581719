//! Per-provider circuit breakers.
//!
//! `Closed` lets requests through. After `failure_threshold` consecutive
//! backend failures the circuit goes `Open` and every dispatch short-circuits
//! with [`AiError::ProviderUnavailable`]. Once the cooldown elapses the next
//! admission moves it to `HalfOpen` and grants exactly one trial; the trial's
//! outcome closes the circuit or re-opens it with a doubled cooldown.
//!
//! The monitor is the only writer of circuit state. Locks are per provider
//! and never held across an await.

use crate::error::AiError;
use crate::events::{ObserverHub, OrchestrationEvent};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitStatus {
    Closed,
    Open,
    HalfOpen,
}

/// Circuit state for one provider
#[derive(Debug, Clone)]
pub struct CircuitState {
    pub status: CircuitStatus,
    pub consecutive_failures: u32,
    pub last_failure: Option<Instant>,
    pub cooldown_until: Option<Instant>,
    /// Openings since the circuit was last closed; drives the backoff
    pub open_count: u32,
    pub trial_in_flight: bool,
}

impl Default for CircuitState {
    fn default() -> Self {
        Self {
            status: CircuitStatus::Closed,
            consecutive_failures: 0,
            last_failure: None,
            cooldown_until: None,
            open_count: 0,
            trial_in_flight: false,
        }
    }
}

impl CircuitState {
    fn cooldown_elapsed(&self, now: Instant) -> bool {
        self.cooldown_until.map_or(true, |until| now >= until)
    }
}

/// Thresholds and cooldowns
#[derive(Debug, Clone)]
pub struct CircuitPolicy {
    pub failure_threshold: u32,
    pub base_cooldown: Duration,
    pub max_cooldown: Duration,
}

impl Default for CircuitPolicy {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            base_cooldown: Duration::from_secs(30),
            max_cooldown: Duration::from_secs(300),
        }
    }
}

impl CircuitPolicy {
    /// Cooldown for the n-th consecutive opening (1-based)
    pub fn cooldown_for(&self, open_count: u32) -> Duration {
        let exponent = open_count.saturating_sub(1).min(16);
        self.base_cooldown
            .saturating_mul(1u32 << exponent)
            .min(self.max_cooldown)
    }
}

/// Tracks provider liveness from dispatch outcomes.
#[derive(Debug)]
pub struct HealthMonitor {
    policy: CircuitPolicy,
    circuits: DashMap<String, CircuitState>,
    observers: ObserverHub,
}

impl HealthMonitor {
    pub fn new(policy: CircuitPolicy, observers: ObserverHub) -> Self {
        Self {
            policy,
            circuits: DashMap::new(),
            observers,
        }
    }

    pub fn policy(&self) -> &CircuitPolicy {
        &self.policy
    }

    /// Start tracking a provider with a closed circuit
    pub fn register(&self, provider: &str) {
        self.circuits.entry(provider.to_string()).or_default();
    }

    /// Current status as seen by provider selection.
    ///
    /// An open circuit whose cooldown has elapsed reads as `HalfOpen`: it is
    /// eligible for a trial even before any request has promoted it.
    pub fn status(&self, provider: &str) -> CircuitStatus {
        let now = Instant::now();
        match self.circuits.get(provider) {
            None => CircuitStatus::Closed,
            Some(state) => match state.status {
                CircuitStatus::Open if state.cooldown_elapsed(now) => CircuitStatus::HalfOpen,
                status => status,
            },
        }
    }

    /// Whether an admission attempt would currently succeed
    pub fn is_available(&self, provider: &str) -> bool {
        let now = Instant::now();
        match self.circuits.get(provider) {
            None => true,
            Some(state) => match state.status {
                CircuitStatus::Closed => true,
                CircuitStatus::Open => state.cooldown_elapsed(now) && !state.trial_in_flight,
                CircuitStatus::HalfOpen => !state.trial_in_flight,
            },
        }
    }

    /// Copy of the circuit state for diagnostics
    pub fn snapshot(&self, provider: &str) -> Option<CircuitState> {
        self.circuits.get(provider).map(|s| s.clone())
    }

    /// Ask to dispatch to `provider`.
    ///
    /// Fails without side effects on the network when the circuit is open or
    /// a half-open trial is already running.
    pub fn admit(self: &Arc<Self>, provider: &str) -> Result<Admission, AiError> {
        let now = Instant::now();
        let mut event = None;

        let trial = {
            let mut state = self.circuits.entry(provider.to_string()).or_default();
            match state.status {
                CircuitStatus::Closed => false,
                CircuitStatus::Open if state.cooldown_elapsed(now) => {
                    info!("Circuit for {} moving to HALF_OPEN", provider);
                    state.status = CircuitStatus::HalfOpen;
                    state.trial_in_flight = true;
                    event = Some(OrchestrationEvent::CircuitHalfOpened {
                        provider: provider.to_string(),
                    });
                    true
                }
                CircuitStatus::HalfOpen if !state.trial_in_flight => {
                    state.trial_in_flight = true;
                    true
                }
                _ => {
                    debug!("Circuit for {} is open, rejecting dispatch", provider);
                    return Err(AiError::provider_unavailable(provider));
                }
            }
        };

        if let Some(event) = event {
            self.observers.emit(event);
        }

        Ok(Admission {
            monitor: Arc::clone(self),
            provider: provider.to_string(),
            trial,
            settled: false,
        })
    }

    /// Report a successful dispatch.
    ///
    /// Outside `Closed` only the half-open trial (`trial == true`) may change
    /// the circuit; late outcomes of requests admitted earlier are ignored.
    pub fn record_success(&self, provider: &str, trial: bool) {
        let closed = {
            let mut state = self.circuits.entry(provider.to_string()).or_default();
            match state.status {
                CircuitStatus::Closed => {
                    state.consecutive_failures = 0;
                    false
                }
                CircuitStatus::HalfOpen if trial => {
                    *state = CircuitState::default();
                    true
                }
                status => {
                    debug!("Late success for {} ignored while {:?}", provider, status);
                    false
                }
            }
        };

        if closed {
            info!("Circuit for {} recovered, moving to CLOSED", provider);
            self.observers.emit(OrchestrationEvent::CircuitClosed {
                provider: provider.to_string(),
            });
        }
    }

    /// Report a backend failure (network, timeout, 5xx).
    ///
    /// Same rule as [`record_success`](Self::record_success): a non-trial
    /// failure outside `Closed` only updates `last_failure`.
    pub fn record_failure(&self, provider: &str, trial: bool) {
        let now = Instant::now();
        let opened = {
            let mut state = self.circuits.entry(provider.to_string()).or_default();
            state.last_failure = Some(now);

            let should_open = match state.status {
                CircuitStatus::Closed => {
                    state.consecutive_failures = state.consecutive_failures.saturating_add(1);
                    state.consecutive_failures >= self.policy.failure_threshold
                }
                CircuitStatus::HalfOpen if trial => {
                    state.consecutive_failures = state.consecutive_failures.saturating_add(1);
                    true
                }
                CircuitStatus::HalfOpen | CircuitStatus::Open => false,
            };

            if should_open {
                state.open_count = state.open_count.saturating_add(1);
                let cooldown = self.policy.cooldown_for(state.open_count);
                state.status = CircuitStatus::Open;
                state.cooldown_until = Some(now + cooldown);
                state.trial_in_flight = false;
                Some((cooldown, state.consecutive_failures))
            } else {
                debug!(
                    "Circuit for {} - failure {}/{} ({:?})",
                    provider, state.consecutive_failures, self.policy.failure_threshold, state.status
                );
                None
            }
        };

        if let Some((cooldown, failures)) = opened {
            warn!(
                "Circuit for {} OPENING after {} consecutive failures, cooldown {:?}",
                provider, failures, cooldown
            );
            self.observers.emit(OrchestrationEvent::CircuitOpened {
                provider: provider.to_string(),
                cooldown,
            });
        }
    }

    /// Give back a half-open trial that ended without a backend outcome
    fn release_trial(&self, provider: &str) {
        if let Some(mut state) = self.circuits.get_mut(provider) {
            if state.trial_in_flight {
                debug!("Half-open trial for {} released without outcome", provider);
                state.trial_in_flight = false;
            }
        }
    }

    /// Providers whose circuit is waiting for a recovery trial
    pub fn probe_candidates(&self) -> Vec<String> {
        let now = Instant::now();
        self.circuits
            .iter()
            .filter(|entry| match entry.status {
                CircuitStatus::Closed => false,
                CircuitStatus::Open => entry.cooldown_elapsed(now) && !entry.trial_in_flight,
                CircuitStatus::HalfOpen => !entry.trial_in_flight,
            })
            .map(|entry| entry.key().clone())
            .collect()
    }
}

/// Permission to dispatch once to a provider.
///
/// Settle it with [`success`](Self::success) or [`failure`](Self::failure).
/// Dropping it unsettled (cancellation, caller-side errors) reports nothing
/// and frees a half-open trial for the next request.
#[derive(Debug)]
pub struct Admission {
    monitor: Arc<HealthMonitor>,
    provider: String,
    trial: bool,
    settled: bool,
}

impl Admission {
    pub fn provider(&self) -> &str {
        &self.provider
    }

    /// Whether this admission is the single half-open trial
    pub fn is_trial(&self) -> bool {
        self.trial
    }

    pub fn success(mut self) {
        self.settled = true;
        self.monitor.record_success(&self.provider, self.trial);
    }

    pub fn failure(mut self) {
        self.settled = true;
        self.monitor.record_failure(&self.provider, self.trial);
    }
}

impl Drop for Admission {
    fn drop(&mut self) {
        if !self.settled && self.trial {
            self.monitor.release_trial(&self.provider);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::RecordingObserver;

    fn monitor(threshold: u32, cooldown_secs: u64) -> (Arc<HealthMonitor>, Arc<RecordingObserver>) {
        let recorder = Arc::new(RecordingObserver::new());
        let policy = CircuitPolicy {
            failure_threshold: threshold,
            base_cooldown: Duration::from_secs(cooldown_secs),
            max_cooldown: Duration::from_secs(cooldown_secs * 4),
        };
        let monitor = HealthMonitor::new(policy, ObserverHub::new(vec![recorder.clone()]));
        monitor.register("a");
        (Arc::new(monitor), recorder)
    }

    #[tokio::test(start_paused = true)]
    async fn test_opens_after_threshold_and_short_circuits() {
        let (monitor, recorder) = monitor(5, 30);

        for _ in 0..4 {
            monitor.admit("a").unwrap().failure();
        }
        assert_eq!(monitor.status("a"), CircuitStatus::Closed);

        monitor.admit("a").unwrap().failure();
        assert_eq!(monitor.status("a"), CircuitStatus::Open);
        assert!(matches!(
            monitor.admit("a"),
            Err(AiError::ProviderUnavailable(p)) if p == "a"
        ));
        assert_eq!(recorder.names(), vec!["circuitOpened"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_resets_consecutive_failures() {
        let (monitor, _) = monitor(3, 30);
        monitor.admit("a").unwrap().failure();
        monitor.admit("a").unwrap().failure();
        monitor.admit("a").unwrap().success();
        monitor.admit("a").unwrap().failure();
        monitor.admit("a").unwrap().failure();
        assert_eq!(monitor.status("a"), CircuitStatus::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_allows_exactly_one_trial() {
        let (monitor, recorder) = monitor(1, 30);
        monitor.admit("a").unwrap().failure();
        assert!(monitor.admit("a").is_err());

        tokio::time::advance(Duration::from_secs(30)).await;
        assert_eq!(monitor.status("a"), CircuitStatus::HalfOpen);

        let trial = monitor.admit("a").unwrap();
        assert!(trial.is_trial());
        assert!(monitor.admit("a").is_err());

        trial.success();
        assert_eq!(monitor.status("a"), CircuitStatus::Closed);
        assert_eq!(monitor.snapshot("a").unwrap().consecutive_failures, 0);
        assert_eq!(
            recorder.names(),
            vec!["circuitOpened", "circuitHalfOpened", "circuitClosed"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_trial_reopens_with_backoff() {
        let (monitor, _) = monitor(1, 10);
        monitor.admit("a").unwrap().failure();

        tokio::time::advance(Duration::from_secs(10)).await;
        monitor.admit("a").unwrap().failure();
        assert_eq!(monitor.status("a"), CircuitStatus::Open);
        assert_eq!(monitor.snapshot("a").unwrap().open_count, 2);

        // Second cooldown is doubled
        tokio::time::advance(Duration::from_secs(10)).await;
        assert_eq!(monitor.status("a"), CircuitStatus::Open);
        tokio::time::advance(Duration::from_secs(10)).await;
        assert_eq!(monitor.status("a"), CircuitStatus::HalfOpen);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unsettled_trial_is_released() {
        let (monitor, _) = monitor(1, 5);
        monitor.admit("a").unwrap().failure();
        tokio::time::advance(Duration::from_secs(5)).await;

        let trial = monitor.admit("a").unwrap();
        assert!(monitor.probe_candidates().is_empty());
        drop(trial);

        assert_eq!(monitor.probe_candidates(), vec!["a".to_string()]);
        assert!(monitor.admit("a").unwrap().is_trial());
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_outcomes_do_not_decide_the_trial() {
        let (monitor, _) = monitor(1, 10);
        let late_failure = monitor.admit("a").unwrap();
        let late_success = monitor.admit("a").unwrap();
        monitor.admit("a").unwrap().failure();
        assert_eq!(monitor.status("a"), CircuitStatus::Open);

        tokio::time::advance(Duration::from_secs(10)).await;
        let trial = monitor.admit("a").unwrap();
        assert!(trial.is_trial());

        late_failure.failure();
        let state = monitor.snapshot("a").unwrap();
        assert_eq!(state.status, CircuitStatus::HalfOpen);
        assert_eq!(state.open_count, 1);
        assert!(state.trial_in_flight);

        late_success.success();
        assert_eq!(monitor.status("a"), CircuitStatus::HalfOpen);
        assert!(monitor.admit("a").is_err());

        trial.success();
        assert_eq!(monitor.status("a"), CircuitStatus::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_failure_while_open_keeps_cooldown() {
        let (monitor, _) = monitor(1, 10);
        let late = monitor.admit("a").unwrap();
        monitor.admit("a").unwrap().failure();
        let cooldown_until = monitor.snapshot("a").unwrap().cooldown_until;

        late.failure();
        let state = monitor.snapshot("a").unwrap();
        assert_eq!(state.open_count, 1);
        assert_eq!(state.cooldown_until, cooldown_until);
    }

    #[test]
    fn test_cooldown_is_capped() {
        let policy = CircuitPolicy {
            failure_threshold: 5,
            base_cooldown: Duration::from_secs(30),
            max_cooldown: Duration::from_secs(100),
        };
        assert_eq!(policy.cooldown_for(1), Duration::from_secs(30));
        assert_eq!(policy.cooldown_for(2), Duration::from_secs(60));
        assert_eq!(policy.cooldown_for(3), Duration::from_secs(100));
        assert_eq!(policy.cooldown_for(40), Duration::from_secs(100));
    }
}
