//! Orchestrator configuration.
//!
//! The host application owns parsing and storage; the core only receives a
//! value of [`OrchestratorConfig`] and validates it once at build time.

use crate::error::AiError;
use crate::types::{FunctionDescriptor, ProviderDescriptor};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;

/// Orchestration parameters plus provider and function declarations.
///
/// Providers are tried in declaration order.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct OrchestratorConfig {
    pub providers: Vec<ProviderDescriptor>,
    pub functions: Vec<FunctionDescriptor>,
    pub max_retries: u32,
    pub circuit_failure_threshold: u32,
    pub circuit_cooldown_seconds: u64,
    /// Cap for the exponentially growing cooldown
    pub circuit_max_cooldown_seconds: u64,
    pub cache_ttl_seconds: u64,
    pub cache_max_entries: usize,
    pub global_concurrency_limit: usize,
    /// Applies to providers that declare no ceiling of their own
    pub per_provider_concurrency_limit: usize,
    pub retry_initial_delay_ms: u64,
    pub retry_max_delay_ms: u64,
    pub backoff_multiplier: f64,
    pub health_probe_timeout_seconds: u64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            providers: Vec::new(),
            functions: Vec::new(),
            max_retries: 3,
            circuit_failure_threshold: 5,
            circuit_cooldown_seconds: 30,
            circuit_max_cooldown_seconds: 300,
            cache_ttl_seconds: 3600,
            cache_max_entries: 1000,
            global_concurrency_limit: 16,
            per_provider_concurrency_limit: 4,
            retry_initial_delay_ms: 200,
            retry_max_delay_ms: 5000,
            backoff_multiplier: 2.0,
            health_probe_timeout_seconds: 5,
        }
    }
}

impl OrchestratorConfig {
    /// Add a provider; declaration order is selection priority
    pub fn with_provider(mut self, provider: ProviderDescriptor) -> Self {
        self.providers.push(provider);
        self
    }

    pub fn with_function(mut self, function: FunctionDescriptor) -> Self {
        self.functions.push(function);
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_circuit_failure_threshold(mut self, threshold: u32) -> Self {
        self.circuit_failure_threshold = threshold;
        self
    }

    pub fn with_circuit_cooldown(mut self, cooldown: Duration) -> Self {
        self.circuit_cooldown_seconds = cooldown.as_secs();
        self
    }

    pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl_seconds = ttl.as_secs();
        self
    }

    pub fn with_global_concurrency_limit(mut self, limit: usize) -> Self {
        self.global_concurrency_limit = limit;
        self
    }

    pub fn with_per_provider_concurrency_limit(mut self, limit: usize) -> Self {
        self.per_provider_concurrency_limit = limit;
        self
    }

    pub fn with_retry_delays(mut self, initial: Duration, max: Duration) -> Self {
        self.retry_initial_delay_ms = initial.as_millis() as u64;
        self.retry_max_delay_ms = max.as_millis() as u64;
        self
    }

    pub fn circuit_cooldown(&self) -> Duration {
        Duration::from_secs(self.circuit_cooldown_seconds)
    }

    pub fn circuit_max_cooldown(&self) -> Duration {
        Duration::from_secs(self.circuit_max_cooldown_seconds)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_seconds)
    }

    pub fn health_probe_timeout(&self) -> Duration {
        Duration::from_secs(self.health_probe_timeout_seconds)
    }

    /// Effective in-flight ceiling for a provider
    pub fn ceiling_for(&self, provider: &ProviderDescriptor) -> usize {
        provider
            .concurrency_ceiling
            .unwrap_or(self.per_provider_concurrency_limit)
    }

    /// Look up a declared provider by name
    pub fn provider(&self, name: &str) -> Option<&ProviderDescriptor> {
        self.providers.iter().find(|p| p.name == name)
    }

    /// Reject values the orchestrator cannot run with.
    pub fn validate(&self) -> Result<(), AiError> {
        if self.circuit_failure_threshold == 0 {
            return Err(AiError::configuration("circuitFailureThreshold must be at least 1"));
        }
        if self.global_concurrency_limit == 0 {
            return Err(AiError::configuration("globalConcurrencyLimit must be at least 1"));
        }
        if self.per_provider_concurrency_limit == 0 {
            return Err(AiError::configuration("perProviderConcurrencyLimit must be at least 1"));
        }
        if self.circuit_max_cooldown_seconds < self.circuit_cooldown_seconds {
            return Err(AiError::configuration(
                "circuitMaxCooldownSeconds must not be below circuitCooldownSeconds",
            ));
        }
        if !(self.backoff_multiplier.is_finite() && self.backoff_multiplier >= 1.0) {
            return Err(AiError::configuration("backoffMultiplier must be a finite value >= 1.0"));
        }

        let mut seen = HashSet::new();
        for provider in &self.providers {
            if provider.name.trim().is_empty() {
                return Err(AiError::configuration("provider name must not be empty"));
            }
            if !seen.insert(provider.name.as_str()) {
                return Err(AiError::configuration(format!(
                    "provider '{}' declared twice",
                    provider.name
                )));
            }
            if provider.concurrency_ceiling == Some(0) {
                return Err(AiError::configuration(format!(
                    "provider '{}' has a zero concurrency ceiling",
                    provider.name
                )));
            }
        }

        for function in &self.functions {
            if function.id.trim().is_empty() {
                return Err(AiError::configuration("function id must not be empty"));
            }
        }

        Ok(())
    }
}
