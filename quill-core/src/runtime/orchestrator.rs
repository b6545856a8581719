//! Orchestrator implementation.
//!
//! The [`Orchestrator`] is the entry point for AI requests. It validates a
//! request, consults the response cache, resolves the execution mode, picks a
//! provider through the health monitor, takes concurrency slots and
//! dispatches with retry and failover.

use crate::cache::{CacheKey, CacheOutcome, ResponseCache};
use crate::config::OrchestratorConfig;
use crate::error::AiError;
use crate::events::{Observer, ObserverHub, OrchestrationEvent};
use crate::health::{Admission, CircuitPolicy, CircuitStatus, HealthMonitor};
use crate::limiter::{ConcurrencyLimiter, SlotGuard};
use crate::mode::{build_messages, resolve_input};
use crate::provider::{Provider, TextStream};
use crate::registry::{register_builtin_functions, FunctionRegistry};
use crate::retry::RetryPolicy;
use crate::runtime::stream::{ResponseStream, Sequenced, SequencedChunk, StreamItem};
use crate::types::*;
use futures::future::BoxFuture;
use futures::{FutureExt, Stream, StreamExt};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Type-erased provider that can be shared across threads
type BoxedProvider = Arc<dyn Provider>;

/// Far-future stand-in for deadlines that would overflow the clock
const MAX_DEADLINE: Duration = Duration::from_secs(60 * 60 * 24 * 365);

/// A declared provider paired with its adapter
#[derive(Debug, Clone)]
struct Route {
    descriptor: Arc<ProviderDescriptor>,
    adapter: BoxedProvider,
}

/// Builder for an [`Orchestrator`].
///
/// # Example
///
/// ```ignore
/// let orchestrator = Orchestrator::builder(config)
///     .provider("openai", LoggingLayer::new().layer(openai))
///     .provider("deepseek", deepseek)
///     .observer(Arc::new(TracingObserver::new()))
///     .finish()?;
/// ```
pub struct OrchestratorBuilder {
    config: OrchestratorConfig,
    adapters: Vec<(String, BoxedProvider)>,
    registry: Option<Arc<FunctionRegistry>>,
    observers: Vec<Arc<dyn Observer>>,
}

impl OrchestratorBuilder {
    pub fn new(config: OrchestratorConfig) -> Self {
        Self {
            config,
            adapters: Vec::new(),
            registry: None,
            observers: Vec::new(),
        }
    }

    /// Attach the adapter serving the provider declared as `name`
    pub fn provider<P: Provider>(self, name: impl Into<String>, provider: P) -> Self {
        self.provider_arc(name, Arc::new(provider))
    }

    /// Attach an already shared adapter
    pub fn provider_arc(mut self, name: impl Into<String>, provider: Arc<dyn Provider>) -> Self {
        self.adapters.push((name.into(), provider));
        self
    }

    /// Attach several adapters, e.g. from an adapter factory
    pub fn providers<I>(mut self, providers: I) -> Self
    where
        I: IntoIterator<Item = (String, Arc<dyn Provider>)>,
    {
        self.adapters.extend(providers);
        self
    }

    /// Use an existing registry instead of a fresh one with the built-in functions
    pub fn registry(mut self, registry: Arc<FunctionRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Subscribe an observer to request and circuit events
    pub fn observer(mut self, observer: Arc<dyn Observer>) -> Self {
        self.observers.push(observer);
        self
    }

    /// Validate the configuration and wire every component together
    pub fn finish(self) -> Result<Orchestrator, AiError> {
        let config = self.config;
        config.validate()?;
        if config.providers.is_empty() {
            return Err(AiError::configuration("at least one provider must be declared"));
        }

        let mut adapters: HashMap<String, BoxedProvider> = HashMap::new();
        for (name, adapter) in self.adapters {
            if adapters.insert(name.clone(), adapter).is_some() {
                return Err(AiError::configuration(format!(
                    "adapter for provider '{name}' supplied twice"
                )));
            }
        }

        let mut routes = Vec::with_capacity(config.providers.len());
        for descriptor in &config.providers {
            let adapter = adapters.remove(&descriptor.name).ok_or_else(|| {
                AiError::configuration(format!("no adapter for provider '{}'", descriptor.name))
            })?;
            routes.push(Route {
                descriptor: Arc::new(descriptor.clone()),
                adapter,
            });
        }
        if let Some(name) = adapters.keys().next() {
            return Err(AiError::configuration(format!(
                "adapter '{name}' has no provider declaration"
            )));
        }

        let registry = self.registry.unwrap_or_else(|| {
            let registry = FunctionRegistry::new();
            register_builtin_functions(&registry);
            Arc::new(registry)
        });
        for function in &config.functions {
            registry.register(function.clone());
        }

        let observers = ObserverHub::new(self.observers);
        let health = Arc::new(HealthMonitor::new(
            CircuitPolicy {
                failure_threshold: config.circuit_failure_threshold,
                base_cooldown: config.circuit_cooldown(),
                max_cooldown: config.circuit_max_cooldown(),
            },
            observers.clone(),
        ));
        for route in &routes {
            health.register(&route.descriptor.name);
        }

        let limiter = ConcurrencyLimiter::new(
            config.global_concurrency_limit,
            routes
                .iter()
                .map(|r| (r.descriptor.name.clone(), config.ceiling_for(&r.descriptor))),
        );
        let cache = Arc::new(ResponseCache::new(config.cache_ttl(), config.cache_max_entries));
        let retry = RetryPolicy::from_config(&config);

        info!(
            "Orchestrator ready: {} providers, {} functions, {} observers",
            routes.len(),
            registry.len(),
            observers.observers().len()
        );

        Ok(Orchestrator {
            inner: Arc::new(Inner {
                config,
                routes,
                registry,
                health,
                limiter,
                cache,
                retry,
                observers,
            }),
        })
    }
}

/// Entry point for AI requests.
///
/// Cheap to clone; clones share the cache, circuits and slots.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

struct Inner {
    config: OrchestratorConfig,
    /// Declaration order is selection priority
    routes: Vec<Route>,
    registry: Arc<FunctionRegistry>,
    health: Arc<HealthMonitor>,
    limiter: ConcurrencyLimiter,
    cache: Arc<ResponseCache>,
    retry: RetryPolicy,
    observers: ObserverHub,
}

impl fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let providers: Vec<&str> = self.inner.routes.iter().map(|r| r.descriptor.name.as_str()).collect();
        f.debug_struct("Orchestrator")
            .field("providers", &providers)
            .field("functions", &self.inner.registry.len())
            .finish_non_exhaustive()
    }
}

impl Orchestrator {
    /// Create a new builder
    pub fn builder(config: OrchestratorConfig) -> OrchestratorBuilder {
        OrchestratorBuilder::new(config)
    }

    /// Run a request to completion.
    pub async fn submit(&self, request: AiRequest) -> Result<AiResponse, AiError> {
        self.submit_with_cancel(request, CancellationToken::new()).await
    }

    /// Run a request that the caller may cancel through `token`.
    ///
    /// Cancellation and the request deadline are honored at every
    /// suspension point; held slots are released on every exit path.
    pub async fn submit_with_cancel(
        &self,
        request: AiRequest,
        token: CancellationToken,
    ) -> Result<AiResponse, AiError> {
        let inner = &self.inner;
        inner.validate(&request)?;

        let started = Instant::now();
        let deadline = deadline_for(started, request.timeout);
        inner.emit_started(&request, false);

        let result = tokio::select! {
            biased;
            _ = token.cancelled() => Err(AiError::Cancelled),
            result = Arc::clone(inner).run_cached(request.clone(), token.clone(), deadline) => result,
            _ = tokio::time::sleep_until(deadline) => Err(AiError::timeout(format!(
                "request {} exceeded {:?}",
                request.id, request.timeout
            ))),
        };

        inner.finish(&request, started, result)
    }

    /// Like [`submit`](Self::submit), but never fails: errors come back as an
    /// [`AiResponse`] with status `Failed` or `Cancelled`.
    pub async fn execute(&self, request: AiRequest, token: CancellationToken) -> AiResponse {
        let request_id = request.id.clone();
        let started = Instant::now();
        match self.submit_with_cancel(request, token).await {
            Ok(response) => response,
            Err(err) => {
                let mut response = AiResponse::from_error(request_id, None, err);
                response.latency = started.elapsed();
                response
            }
        }
    }

    /// Start a streamed request.
    ///
    /// Failures before the first chunk (validation, input, provider
    /// selection, connection retries) are returned as errors. Once the
    /// stream is open every outcome, including cancellation, arrives as the
    /// final [`StreamItem::Done`].
    pub async fn submit_stream(
        &self,
        request: AiRequest,
        token: CancellationToken,
    ) -> Result<ResponseStream, AiError> {
        let inner = Arc::clone(&self.inner);
        inner.validate(&request)?;

        let started = Instant::now();
        let deadline = deadline_for(started, request.timeout);
        inner.emit_started(&request, true);

        if let Some(hit) = inner.cache.get(&inner.cache_key(&request)) {
            return Ok(inner.replay_cached(&request, hit, started));
        }

        let connect = async {
            let plan = inner.plan(&request, deadline, true)?;
            let dispatched = inner
                .dispatch_loop(&plan, &token, |adapter, req| {
                    async move { adapter.dispatch_streaming(req).await }.boxed()
                })
                .await?;
            Ok::<_, AiError>((plan, dispatched))
        };

        let connected = tokio::select! {
            biased;
            _ = token.cancelled() => Err(AiError::Cancelled),
            connected = connect => connected,
            _ = tokio::time::sleep_until(deadline) => Err(AiError::timeout(format!(
                "request {} exceeded {:?} before streaming",
                request.id, request.timeout
            ))),
        };

        match connected {
            Ok((plan, dispatched)) => {
                let model = plan.model_for(&dispatched.route.descriptor);
                Ok(ResponseStream::new(Arc::clone(&inner).pipe_stream(
                    request.id,
                    model,
                    dispatched,
                    token,
                    started,
                    deadline,
                )))
            }
            Err(err) => {
                inner.report_error(&request.id, None, &err);
                Err(err)
            }
        }
    }

    /// Probe every provider whose open circuit is due for a recovery trial.
    ///
    /// Probes bypass the concurrency limiter. Returns `(provider, healthy)`
    /// for each provider probed.
    pub async fn probe_providers(&self) -> Vec<(String, bool)> {
        let inner = &self.inner;
        let timeout = inner.config.health_probe_timeout();
        let mut results = Vec::new();

        for name in inner.health.probe_candidates() {
            let Some(route) = inner.route(&name) else {
                continue;
            };
            let admission = match inner.health.admit(&name) {
                Ok(admission) => admission,
                Err(_) => continue,
            };

            let healthy = tokio::time::timeout(timeout, route.adapter.health_probe())
                .await
                .unwrap_or(false);
            debug!("Health probe for {}: {}", name, if healthy { "ok" } else { "failed" });
            if healthy {
                admission.success();
            } else {
                admission.failure();
            }
            results.push((name, healthy));
        }

        results
    }

    /// Run [`probe_providers`](Self::probe_providers) every `interval` until
    /// `token` is cancelled.
    pub fn spawn_health_probes(&self, interval: Duration, token: CancellationToken) -> JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        this.probe_providers().await;
                    }
                }
            }
            debug!("Health probe task stopped");
        })
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.inner.config
    }

    pub fn registry(&self) -> &Arc<FunctionRegistry> {
        &self.inner.registry
    }

    pub fn health(&self) -> &Arc<HealthMonitor> {
        &self.inner.health
    }

    pub fn limiter(&self) -> &ConcurrencyLimiter {
        &self.inner.limiter
    }

    pub fn cache(&self) -> &Arc<ResponseCache> {
        &self.inner.cache
    }

    /// Provider names in selection order
    pub fn provider_names(&self) -> Vec<String> {
        self.inner
            .routes
            .iter()
            .map(|r| r.descriptor.name.clone())
            .collect()
    }
}

/// Everything a dispatch attempt needs, resolved once per request
#[derive(Debug)]
struct Plan {
    request_id: String,
    provider: Option<String>,
    model: Option<String>,
    messages: Vec<Message>,
    required: Vec<Capability>,
    temperature: Option<f32>,
    max_tokens: Option<u32>,
    deadline: Instant,
    stream: bool,
}

impl Plan {
    fn model_for(&self, descriptor: &ProviderDescriptor) -> String {
        self.model
            .clone()
            .unwrap_or_else(|| descriptor.default_model.clone())
    }

    fn provider_request(&self, descriptor: &ProviderDescriptor) -> ProviderRequest {
        let mut req = ProviderRequest::new(self.model_for(descriptor), self.messages.clone());
        req.request_id = self.request_id.clone();
        req.temperature = self.temperature;
        req.max_tokens = self.max_tokens;
        req.timeout = self.deadline.saturating_duration_since(Instant::now());
        req.stream = self.stream;
        req
    }
}

/// Output of a successful attempt, with its admission and slots still held
struct Dispatched<T> {
    route: Route,
    admission: Admission,
    slots: SlotGuard,
    output: T,
    attempts: u32,
}

enum Step {
    Next(Option<Result<SequencedChunk, AiError>>),
    Stop(AiError),
}

impl Inner {
    fn route(&self, name: &str) -> Option<&Route> {
        self.routes.iter().find(|r| r.descriptor.name == name)
    }

    /// Shape checks only; no events, no cache or health access
    fn validate(&self, request: &AiRequest) -> Result<(), AiError> {
        if request.function_id.trim().is_empty() {
            return Err(AiError::invalid_request("function id must not be empty"));
        }
        if request.timeout.is_zero() {
            return Err(AiError::invalid_request("timeout must be positive"));
        }
        if request.max_tokens == Some(0) {
            return Err(AiError::invalid_request("max tokens must be positive"));
        }
        if let Some(temperature) = request.temperature {
            if !(temperature.is_finite() && (0.0..=2.0).contains(&temperature)) {
                return Err(AiError::invalid_request(format!(
                    "temperature {temperature} outside [0, 2]"
                )));
            }
        }
        if let Some(provider) = &request.provider {
            if self.route(provider).is_none() {
                return Err(AiError::invalid_request(format!("unknown provider '{provider}'")));
            }
        }
        Ok(())
    }

    fn cache_key(&self, request: &AiRequest) -> CacheKey {
        let model = request
            .model
            .as_deref()
            .or_else(|| {
                request
                    .provider
                    .as_deref()
                    .and_then(|p| self.route(p))
                    .map(|r| r.descriptor.default_model.as_str())
            })
            .unwrap_or("*");

        CacheKey::fingerprint(
            &request.function_id,
            &request.prompt,
            request.context.as_deref(),
            request.selected_text.as_deref(),
            model,
            request.temperature,
        )
    }

    /// Resolve function, mode and input into a dispatch plan
    fn plan(&self, request: &AiRequest, deadline: Instant, stream: bool) -> Result<Plan, AiError> {
        let descriptor = self.registry.resolve(&request.function_id)?;
        let mode = request.mode.unwrap_or(descriptor.default_mode);
        let input = resolve_input(
            &descriptor,
            mode,
            &request.prompt,
            request.context.as_deref(),
            request.selected_text.as_deref(),
        )?;
        debug!(
            "Request {} resolved {:?} input from {:?}",
            request.id, input.mode, input.source
        );

        let mut required = descriptor.capabilities.clone();
        if stream && !required.contains(&Capability::Streaming) {
            required.push(Capability::Streaming);
        }

        Ok(Plan {
            request_id: request.id.clone(),
            provider: request.provider.clone(),
            model: request.model.clone(),
            messages: build_messages(&descriptor, &request.prompt, &input),
            required,
            temperature: request.temperature,
            max_tokens: request.max_tokens,
            deadline,
            stream,
        })
    }

    /// Pick a provider: a non-open override, else the first closed provider
    /// in declaration order, else one whose circuit awaits a trial.
    fn select_provider(&self, requested: Option<&str>, required: &[Capability]) -> Result<&Route, AiError> {
        if let Some(name) = requested {
            let route = self
                .route(name)
                .ok_or_else(|| AiError::invalid_request(format!("unknown provider '{name}'")))?;
            if !route.descriptor.supports_all(required) {
                return Err(AiError::unsupported(format!(
                    "provider '{name}' lacks required capabilities {required:?}"
                )));
            }
            if self.health.status(name) != CircuitStatus::Open {
                return Ok(route);
            }
            debug!("Requested provider {} is open, falling back", name);
        }

        let mut eligible = self
            .routes
            .iter()
            .filter(|r| r.descriptor.supports_all(required))
            .peekable();
        if eligible.peek().is_none() {
            return Err(AiError::unsupported(format!(
                "no provider offers {required:?}"
            )));
        }

        let mut half_open = None;
        for route in eligible {
            let name = route.descriptor.name.as_str();
            match self.health.status(name) {
                CircuitStatus::Closed => return Ok(route),
                CircuitStatus::HalfOpen if half_open.is_none() && self.health.is_available(name) => {
                    half_open = Some(route);
                }
                _ => {}
            }
        }
        half_open.ok_or(AiError::AllProvidersUnavailable)
    }

    /// Dispatch with retry and failover.
    ///
    /// Each pass re-selects a provider, so a circuit that opened during an
    /// earlier attempt moves traffic to the next provider. At most
    /// `max_retries + 1` attempts are made.
    async fn dispatch_loop<T, F>(
        &self,
        plan: &Plan,
        token: &CancellationToken,
        call: F,
    ) -> Result<Dispatched<T>, AiError>
    where
        F: Fn(BoxedProvider, ProviderRequest) -> BoxFuture<'static, Result<T, AiError>>,
    {
        let max_attempts = self.retry.max_attempts();
        let mut reached = 0u32;
        let mut last_error = None;

        for attempt in 0..max_attempts {
            let route = self.select_provider(plan.provider.as_deref(), &plan.required)?.clone();
            let name = route.descriptor.name.clone();

            let admission = match self.health.admit(&name) {
                Ok(admission) => admission,
                Err(err) => {
                    debug!("Attempt {} for {} rejected: {}", attempt + 1, plan.request_id, err);
                    last_error = Some(err);
                    if attempt + 1 < max_attempts {
                        self.backoff(plan, token, self.retry.delay(attempt)).await?;
                    }
                    continue;
                }
            };

            let slots = tokio::select! {
                biased;
                _ = token.cancelled() => return Err(AiError::Cancelled),
                slots = self.limiter.acquire(&name, plan.deadline) => slots?,
            };

            reached += 1;
            debug!(
                "Dispatching {} to {} (attempt {}/{})",
                plan.request_id,
                name,
                attempt + 1,
                max_attempts
            );
            let pending = call(Arc::clone(&route.adapter), plan.provider_request(&route.descriptor));
            let outcome = tokio::select! {
                biased;
                _ = token.cancelled() => return Err(AiError::Cancelled),
                outcome = tokio::time::timeout_at(plan.deadline, pending) => outcome,
            };

            let (err, deadline_hit) = match outcome {
                Ok(Ok(output)) => {
                    return Ok(Dispatched {
                        route,
                        admission,
                        slots,
                        output,
                        attempts: reached,
                    })
                }
                Ok(Err(err)) => (err, false),
                Err(_elapsed) => (
                    AiError::timeout(format!("{name} did not answer before the deadline")),
                    true,
                ),
            };
            drop(slots);

            if err.is_backend_failure() {
                admission.failure();
            }
            if deadline_hit || !err.is_retryable() {
                return Err(err);
            }
            if attempt + 1 == max_attempts {
                last_error = Some(err);
                break;
            }

            let delay = self.retry.delay(attempt);
            warn!(
                "Request {} failed on {} (attempt {}/{}): {}. Retrying in {:?}",
                plan.request_id,
                name,
                attempt + 1,
                max_attempts,
                err,
                delay
            );
            self.observers.emit(OrchestrationEvent::RequestRetrying {
                request_id: plan.request_id.clone(),
                provider: name,
                attempt: attempt + 1,
                delay,
                reason: err.to_string(),
            });
            last_error = Some(err);
            self.backoff(plan, token, delay).await?;
        }

        Err(AiError::ExhaustedRetries {
            attempts: max_attempts,
            last: Box::new(last_error.unwrap_or(AiError::AllProvidersUnavailable)),
        })
    }

    /// Sleep `delay` before the next attempt, bounded by the deadline
    async fn backoff(&self, plan: &Plan, token: &CancellationToken, delay: Duration) -> Result<(), AiError> {
        let wake = (Instant::now() + delay).min(plan.deadline);
        tokio::select! {
            biased;
            _ = token.cancelled() => return Err(AiError::Cancelled),
            _ = tokio::time::sleep_until(wake) => {}
        }
        if Instant::now() >= plan.deadline {
            return Err(AiError::timeout(format!(
                "deadline elapsed before retrying {}",
                plan.request_id
            )));
        }
        Ok(())
    }

    /// Non-streamed pipeline from mode resolution to a successful response
    async fn run(
        self: Arc<Self>,
        request: AiRequest,
        token: CancellationToken,
        deadline: Instant,
    ) -> Result<AiResponse, AiError> {
        let plan = self.plan(&request, deadline, false)?;
        let Dispatched {
            route,
            admission,
            slots,
            output,
            attempts,
        } = self
            .dispatch_loop(&plan, &token, |adapter, req| {
                async move { adapter.dispatch(req).await }.boxed()
            })
            .await?;

        drop(slots);
        admission.success();

        let mut response = AiResponse::succeeded(&request.id, route.descriptor.name.clone(), output);
        response.attempts = attempts;
        Ok(response)
    }

    /// Serve from the cache or join/lead a single-flight computation
    async fn run_cached(
        self: Arc<Self>,
        request: AiRequest,
        token: CancellationToken,
        deadline: Instant,
    ) -> Result<AiResponse, AiError> {
        let key = self.cache_key(&request);
        loop {
            let inner = Arc::clone(&self);
            let (flight_request, flight_token) = (request.clone(), token.clone());
            let (result, outcome) = self
                .cache
                .get_or_compute(key.clone(), self.cache.default_ttl(), move || {
                    inner.run(flight_request, flight_token, deadline).boxed()
                })
                .await;

            match (result, outcome) {
                (Err(AiError::Cancelled), CacheOutcome::Follower) if !token.is_cancelled() => {
                    debug!("Leader for {} was cancelled, computing again", key);
                }
                (Ok(response), outcome) => {
                    let mut response = response.for_request(&request.id);
                    response.cached = outcome == CacheOutcome::Hit;
                    return Ok(response);
                }
                (Err(err), _) => return Err(err),
            }
        }
    }

    fn replay_cached(&self, request: &AiRequest, hit: AiResponse, started: Instant) -> ResponseStream {
        let mut response = hit.for_request(&request.id);
        response.cached = true;
        response.latency = started.elapsed();

        let mut items = Vec::with_capacity(2);
        if !response.text.is_empty() {
            let chunk = OutputChunk {
                sequence: 0,
                delta: response.text.clone(),
            };
            response.chunks = vec![chunk.clone()];
            items.push(StreamItem::Chunk(chunk));
        }

        debug!("Replaying cached response for {}", request.id);
        self.report_terminal(&response);
        items.push(StreamItem::Done(response));
        ResponseStream::new(tokio_stream::iter(items))
    }

    /// Forward backend deltas to the caller with sequence numbers, then a
    /// terminal response.
    fn pipe_stream(
        self: Arc<Self>,
        request_id: String,
        model: String,
        dispatched: Dispatched<Box<TextStream>>,
        token: CancellationToken,
        started: Instant,
        deadline: Instant,
    ) -> impl Stream<Item = StreamItem> + Send + 'static {
        let Dispatched {
            route,
            admission,
            slots,
            output,
            attempts,
        } = dispatched;

        async_stream::stream! {
            let provider = route.descriptor.name.clone();
            let mut source = Sequenced::new(output);
            let mut chunks = Vec::new();
            let mut text = String::new();
            let mut usage = Usage::default();
            let mut finish_reason = None;

            let outcome = loop {
                let step = tokio::select! {
                    biased;
                    _ = token.cancelled() => Step::Stop(AiError::Cancelled),
                    item = source.next() => Step::Next(item),
                    _ = tokio::time::sleep_until(deadline) => {
                        Step::Stop(AiError::timeout(format!("{provider} stream exceeded the deadline")))
                    }
                };

                match step {
                    Step::Stop(err) => break Err(err),
                    Step::Next(None) => break Ok(()),
                    Step::Next(Some(Err(err))) => break Err(err),
                    Step::Next(Some(Ok(item))) => {
                        if let Some(u) = item.usage {
                            usage = u;
                        }
                        if item.finish_reason.is_some() {
                            finish_reason = item.finish_reason;
                        }
                        if let Some(chunk) = item.output {
                            text.push_str(&chunk.delta);
                            chunks.push(chunk.clone());
                            yield StreamItem::Chunk(chunk);
                        }
                    }
                }
            };

            // Close the transport and free the slots before reporting
            drop(source);
            drop(slots);
            usage.output_bytes = text.len() as u64;

            let response = match outcome {
                Ok(()) => {
                    admission.success();
                    AiResponse {
                        request_id,
                        provider: Some(provider),
                        model: Some(model),
                        text,
                        chunks,
                        usage,
                        finish_reason: Some(finish_reason.unwrap_or(FinishReason::Stop)),
                        latency: started.elapsed(),
                        status: ResponseStatus::Succeeded,
                        error: None,
                        attempts,
                        cached: false,
                    }
                }
                Err(err) => {
                    if err.is_backend_failure() {
                        admission.failure();
                    } else {
                        drop(admission);
                    }
                    let mut response = AiResponse::from_error(request_id, Some(provider), err);
                    response.model = Some(model);
                    response.text = text;
                    response.chunks = chunks;
                    response.usage = usage;
                    response.finish_reason = finish_reason;
                    response.latency = started.elapsed();
                    response.attempts = attempts;
                    response
                }
            };

            self.report_terminal(&response);
            yield StreamItem::Done(response);
        }
    }

    fn emit_started(&self, request: &AiRequest, streaming: bool) {
        debug!(
            "Request {} started: function={} priority={:?} streaming={}",
            request.id, request.function_id, request.priority, streaming
        );
        self.observers.emit(OrchestrationEvent::RequestStarted {
            request_id: request.id.clone(),
            function_id: request.function_id.clone(),
            priority: request.priority,
            streaming,
        });
    }

    fn finish(
        &self,
        request: &AiRequest,
        started: Instant,
        result: Result<AiResponse, AiError>,
    ) -> Result<AiResponse, AiError> {
        match result {
            Ok(mut response) => {
                response.latency = started.elapsed();
                self.report_terminal(&response);
                Ok(response)
            }
            Err(err) => {
                self.report_error(&request.id, None, &err);
                Err(err)
            }
        }
    }

    fn report_terminal(&self, response: &AiResponse) {
        match (&response.status, &response.error) {
            (ResponseStatus::Succeeded, _) | (_, None) => {
                info!(
                    "Request {} completed by {} in {:?}{}",
                    response.request_id,
                    response.provider.as_deref().unwrap_or("-"),
                    response.latency,
                    if response.cached { " (cached)" } else { "" }
                );
                self.observers.emit(OrchestrationEvent::RequestCompleted {
                    request_id: response.request_id.clone(),
                    provider: response.provider.clone(),
                    latency: response.latency,
                    cached: response.cached,
                });
            }
            (_, Some(err)) => self.report_error(&response.request_id, response.provider.clone(), err),
        }
    }

    fn report_error(&self, request_id: &str, provider: Option<String>, err: &AiError) {
        if err.is_cancelled() {
            info!("Request {} cancelled", request_id);
            self.observers.emit(OrchestrationEvent::RequestCancelled {
                request_id: request_id.to_string(),
            });
        } else {
            warn!("Request {} failed: {}", request_id, err);
            self.observers.emit(OrchestrationEvent::RequestFailed {
                request_id: request_id.to_string(),
                provider,
                error: err.to_string(),
            });
        }
    }
}

fn deadline_for(start: Instant, timeout: Duration) -> Instant {
    start
        .checked_add(timeout)
        .unwrap_or_else(|| start + MAX_DEADLINE)
}
