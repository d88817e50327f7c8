//! Endpoint health tracking on top of the default unifier: a circuit
//! breaker per endpoint, consecutive-failure-driven state transitions,
//! a background TTL sweep, and forced rediscovery via an injected
//! `DiscoveryClient`. This is the layer a long-running process wraps
//! around `DefaultUnifier`; a one-shot script can use
//! `modelmesh-unify` directly and skip all of this.

mod discovery;
mod events;

pub use discovery::DiscoveryClient;
pub use events::{StateTransitionEvent, EVENT_CHANNEL_CAPACITY};

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use modelmesh_breaker::CircuitBreakerRegistry;
use modelmesh_config::Config;
use modelmesh_types::{Clock, CircuitBreakerStats, Descriptor, EndpointState, EndpointStateInfo, Error, Result, SystemClock, UnifiedModel};
use modelmesh_unify::DefaultUnifier;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Wraps a `DefaultUnifier` with endpoint health, circuit breaking, and
/// background cleanup. Cheap to construct; `start`/`stop` drive the
/// background tasks and require the caller to hold it in an `Arc`.
pub struct LifecycleUnifier {
    unifier: DefaultUnifier,
    breakers: CircuitBreakerRegistry,
    endpoint_states: dashmap::DashMap<String, EndpointStateInfo>,
    config: Config,
    clock: Arc<dyn Clock>,
    discovery: Mutex<Option<Arc<dyn DiscoveryClient>>>,
    events_tx: mpsc::Sender<StateTransitionEvent>,
    events_rx: Mutex<Option<mpsc::Receiver<StateTransitionEvent>>>,
    started: AtomicBool,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl LifecycleUnifier {
    pub fn new(config: Config) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: Config, clock: Arc<dyn Clock>) -> Self {
        let config = config.normalized();
        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            unifier: DefaultUnifier::with_clock(config.cleanup_interval_ms, clock.clone()),
            breakers: CircuitBreakerRegistry::new(config.circuit_breaker),
            endpoint_states: dashmap::DashMap::new(),
            config,
            clock,
            discovery: Mutex::new(None),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            started: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Attaches the client used by `force_endpoint_check`. A lifecycle
    /// unifier with no discovery client can still ingest and track health
    /// passively.
    pub fn with_discovery(self, client: Arc<dyn DiscoveryClient>) -> Self {
        *self.discovery.lock().expect("discovery mutex poisoned") = Some(client);
        self
    }

    pub fn unifier(&self) -> &DefaultUnifier {
        &self.unifier
    }

    /// Resolves by id, exact alias, or case-insensitive alias scan.
    /// Delegates straight to the wrapped unifier; lifecycle adds no
    /// resolution semantics of its own.
    pub fn resolve(&self, name_or_id: &str) -> Result<UnifiedModel> {
        self.unifier.resolve(name_or_id)
    }

    pub fn get_all(&self) -> Vec<UnifiedModel> {
        self.unifier.get_all()
    }

    pub fn get_aliases(&self, id: &str) -> Result<Vec<String>> {
        self.unifier.get_aliases(id)
    }

    pub fn merge(&self, models: Vec<UnifiedModel>) -> Result<UnifiedModel> {
        self.unifier.merge(models)
    }

    pub fn register_rule(&self, platform_tag: impl Into<String>, rule: Arc<dyn modelmesh_rules::UnificationRule>) {
        self.unifier.register_rule(platform_tag, rule);
    }

    /// Clears the catalog. Breaker and endpoint-state registries are
    /// untouched — a caller that wants a full reset also drops and
    /// reconstructs the `LifecycleUnifier`.
    pub fn clear(&self) {
        self.unifier.clear();
    }

    pub fn stats(&self) -> modelmesh_types::Stats {
        self.unifier.stats()
    }

    /// Starts background cleanup and event draining. Errors if already
    /// started; callers that `stop()` may `start()` again.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(Error::invalid_input("lifecycle unifier is already started"));
        }

        let mut tasks = self.tasks.lock().expect("tasks mutex poisoned");

        if self.config.enable_background_cleanup {
            tasks.push(tokio::spawn(run_cleanup_loop(self.clone())));
        }
        if self.config.enable_state_transition_logging {
            if let Some(rx) = self.events_rx.lock().expect("events_rx mutex poisoned").take() {
                tasks.push(tokio::spawn(run_event_drainer(self.clone(), rx)));
            }
        }
        Ok(())
    }

    /// Cancels and joins every background task, waiting at most
    /// `timeout`. A no-op if never started. Safe to call more than once.
    pub async fn stop(self: &Arc<Self>, timeout: Duration) -> Result<()> {
        if !self.started.swap(false, Ordering::SeqCst) {
            return Ok(());
        }

        self.shutdown.cancel();
        let handles: Vec<_> = self.tasks.lock().expect("tasks mutex poisoned").drain(..).collect();
        match tokio::time::timeout(timeout, futures::future::join_all(handles)).await {
            Ok(_) => Ok(()),
            Err(_) => Err(Error::Timeout(timeout)),
        }
    }

    /// Gates ingestion on the endpoint's circuit breaker: an open
    /// breaker short-circuits before the rule pipeline ever runs.
    /// Success and failure both feed the breaker and the endpoint's
    /// tracked health state.
    pub fn unify_models(&self, endpoint: &str, descriptors: Vec<Descriptor>) -> Result<Vec<UnifiedModel>> {
        let now = self.clock.now_ms();
        let breaker = self.breakers.get_or_create(endpoint);
        if !breaker.allow(now) {
            return Err(Error::CircuitOpen(endpoint.to_string()));
        }

        match self.unifier.unify_batch(descriptors, endpoint) {
            Ok(models) => {
                breaker.record_success();
                self.record_success(endpoint, now);
                let ids: Vec<String> = models.iter().map(|m| m.id.clone()).collect();
                Ok(ids.into_iter().filter_map(|id| self.unifier.catalog().get(&id)).collect())
            }
            Err(err) => {
                breaker.record_failure(now);
                self.record_failure(endpoint, now, &err.to_string());
                Err(err)
            }
        }
    }

    /// Polls the discovery client for `endpoint` outside the normal
    /// ingest cadence and re-ingests whatever it returns. Requires a
    /// discovery client; each attempt is bounded by a hard 30s timeout so
    /// a wedged backend can't block the caller indefinitely. A `Transient`
    /// failure is retried with backoff per `discovery_retry_policy`, up to
    /// its `max_attempts`; `Permanent`/`Timeout`/`Cancelled` never retry.
    pub async fn force_endpoint_check(&self, endpoint: &str) -> Result<Vec<UnifiedModel>> {
        let client = self
            .discovery
            .lock()
            .expect("discovery mutex poisoned")
            .clone()
            .ok_or_else(|| Error::invalid_input("no discovery client configured"))?;

        let policy = self.config.discovery_retry_policy;
        let mut last_err = Error::invalid_input("discovery retry loop ran zero attempts");

        for attempt in 1..=policy.max_attempts {
            last_err = match tokio::time::timeout(Duration::from_secs(30), client.discover_models(endpoint)).await {
                Ok(Ok(descriptors)) => return self.unify_models(endpoint, descriptors),
                Ok(Err(err)) => err,
                Err(_) => Error::Timeout(Duration::from_secs(30)),
            };

            if !last_err.is_retryable() || attempt == policy.max_attempts {
                break;
            }

            log::debug!(endpoint, attempt; "discovery attempt failed, backing off before retry");
            tokio::time::sleep(policy.backoff_duration(attempt, rand::random::<f64>())).await;
        }

        let now = self.clock.now_ms();
        self.breakers.get_or_create(endpoint).record_failure(now);
        let err = if last_err.is_retryable() {
            Error::RetryExhausted { attempts: policy.max_attempts, source: Box::new(last_err) }
        } else {
            last_err
        };
        self.record_failure(endpoint, now, &err.to_string());
        Err(err)
    }

    /// Detaches `endpoint` from every model it touches, deleting models
    /// left with no remaining endpoint, then purges its breaker and
    /// tracked health state eagerly rather than waiting for the next
    /// sweep — predictable over lazy.
    pub fn remove_endpoint(&self, endpoint: &str) {
        for id in self.unifier.catalog().ids_for_endpoint(endpoint) {
            let Some(mut model) = self.unifier.catalog().get(&id) else { continue };
            model.source_endpoints.retain(|e| e.url != endpoint);
            if model.source_endpoints.is_empty() {
                self.unifier.catalog().remove(&id);
            } else {
                model.recompute_disk_size();
                model.recompute_last_seen();
                self.unifier.catalog().upsert(model);
            }
        }
        self.endpoint_states.remove(endpoint);
        self.breakers.remove(endpoint);
    }

    pub fn get_endpoint_state(&self, endpoint: &str) -> Option<EndpointStateInfo> {
        self.endpoint_states.get(endpoint).map(|entry| entry.clone())
    }

    /// Records a failure observed outside the ingest path (e.g. an
    /// external health poller), driving the same breaker and state
    /// machine as a failed `unify_models` call.
    pub fn record_endpoint_failure(&self, endpoint: &str, message: &str) {
        let now = self.clock.now_ms();
        self.breakers.get_or_create(endpoint).record_failure(now);
        self.record_failure(endpoint, now, message);
    }

    pub fn circuit_breaker_stats(&self) -> std::collections::HashMap<String, CircuitBreakerStats> {
        self.breakers.stats()
    }

    fn record_success(&self, endpoint: &str, now: i64) {
        let mut entry = self.endpoint_states.entry(endpoint.to_string()).or_insert_with(|| EndpointStateInfo::new(now));
        let previous = entry.state;
        entry.consecutive_failures = 0;
        entry.last_error = None;
        if previous != EndpointState::Online {
            entry.state = EndpointState::Online;
            entry.last_state_change = now;
        }
        let snapshot = entry.clone();
        drop(entry);
        self.emit_transition(endpoint, previous, snapshot.state, now);
        self.stamp_endpoint_state(endpoint, &snapshot);
    }

    fn record_failure(&self, endpoint: &str, now: i64, message: &str) {
        let mut entry = self.endpoint_states.entry(endpoint.to_string()).or_insert_with(|| EndpointStateInfo::new(now));
        let previous = entry.state;
        entry.consecutive_failures += 1;
        entry.last_error = Some(message.to_string());
        let next = if entry.consecutive_failures >= self.config.max_consecutive_failures {
            EndpointState::Offline
        } else {
            EndpointState::Degraded
        };
        if next != previous {
            entry.state = next;
            entry.last_state_change = now;
        }
        let snapshot = entry.clone();
        drop(entry);
        self.emit_transition(endpoint, previous, snapshot.state, now);
        self.stamp_endpoint_state(endpoint, &snapshot);
    }

    /// Mirrors the tracked endpoint state onto every `SourceEndpoint`
    /// that references it, so a caller reading a model back from the
    /// catalog sees current health without a second lookup.
    fn stamp_endpoint_state(&self, endpoint: &str, info: &EndpointStateInfo) {
        for id in self.unifier.catalog().ids_for_endpoint(endpoint) {
            let Some(mut model) = self.unifier.catalog().get(&id) else { continue };
            let mut changed = false;
            for source in model.source_endpoints.iter_mut().filter(|e| e.url == endpoint) {
                source.state = info.state;
                source.last_state_check = info.last_state_change.max(source.last_state_check);
                source.state_info = Some(info.clone());
                changed = true;
            }
            if changed {
                self.unifier.catalog().upsert(model);
            }
        }
    }

    fn emit_transition(&self, endpoint: &str, from: EndpointState, to: EndpointState, now: i64) {
        if from == to {
            return;
        }
        let event = StateTransitionEvent { id: Uuid::new_v4(), endpoint: endpoint.to_string(), from, to, at: now };
        if let Err(mpsc::error::TrySendError::Full(_)) = self.events_tx.try_send(event) {
            log::warn!(endpoint; "state transition event channel full, dropping event");
        }
    }

    fn run_cleanup_once(&self) {
        let now = self.clock.now_ms();
        let removed = self.unifier.catalog().sweep(now, self.config.model_ttl_ms);
        if !removed.is_empty() {
            log::debug!(removed = removed.len(); "ttl sweep removed stale models");
        }

        let active: HashSet<String> =
            self.unifier.get_all().into_iter().flat_map(|m| m.source_endpoints.into_iter().map(|e| e.url)).collect();
        self.endpoint_states.retain(|url, _| active.contains(url));
        self.breakers.retain_urls(&active);
    }
}

async fn run_cleanup_loop(lifecycle: Arc<LifecycleUnifier>) {
    let mut interval = tokio::time::interval(Duration::from_millis(lifecycle.config.cleanup_interval_ms.max(1) as u64));
    loop {
        tokio::select! {
            _ = lifecycle.shutdown.cancelled() => break,
            _ = interval.tick() => lifecycle.run_cleanup_once(),
        }
    }
}

async fn run_event_drainer(lifecycle: Arc<LifecycleUnifier>, mut events: mpsc::Receiver<StateTransitionEvent>) {
    loop {
        tokio::select! {
            _ = lifecycle.shutdown.cancelled() => break,
            event = events.recv() => {
                match event {
                    Some(event) => log::info!(
                        "endpoint {} transitioned {:?} -> {:?}",
                        event.endpoint, event.from, event.to
                    ),
                    None => break,
                }
            }
        }
    }
}
