//! Request Dispatcher
//!
//! Drives every request through its lifecycle: cache check, coalescing of
//! identical in-flight requests, routing, the backend call, retries and the
//! terminal outcome. The dispatcher is the only component that records
//! breaker outcomes and commits budget spend.
//!
//! # Architecture
//!
//! ```text
//! submit() --> RequestQueue (priority, bounded) --> worker loop
//!                                                       |
//!                                   one task per request, at most
//!                                   sum(max_concurrent) + bookkeeping
//!                                                       |
//!            +-------------------+----------------------+-------------------+
//!            v                   v                      v                   v
//!      SemanticCache          Router           InferenceBackend      DeadLetterSink
//! ```
//!
//! Every wait (queue, coalescing, routing poll, backend call, backoff) is
//! bounded by the request deadline. A request never holds a lock across a
//! wait.

pub mod dead_letter;
pub mod events;
pub mod outcome;
pub mod queue;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::{broadcast, oneshot, watch, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::Instant;

pub use dead_letter::{
    DeadLetterEntry, DeadLetterError, DeadLetterSink, InMemoryDeadLetterSink, JsonlDeadLetterSink,
};
pub use events::{DispatchEvent, EventLog, RequestState};
pub use outcome::{DispatchFailure, FailureKind, Verdict, VerdictSource};
pub use queue::{QueueError, RequestQueue};

use self::events::RequestTrace;
use crate::backend::{BackendError, BackendErrorKind, InferenceBackend, ResponseChunk};
use crate::cache::{CachedResponse, SemanticCache};
use crate::clock::{elapsed_between, Clock, SystemClock};
use crate::request::{Fingerprint, Request, Submission};
use crate::routing::{
    GatewayMetrics, NoBackendAvailable, RetryDecision, RetryPolicy, Router, Selection,
};

// ============================================================================
// Configuration
// ============================================================================

/// Dispatcher tuning
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DispatcherConfig {
    /// Time allowed until a backend starts answering
    pub first_response_timeout: Duration,
    /// Time allowed for a complete backend answer
    pub total_timeout: Duration,
    /// Re-poll interval while no backend is eligible
    pub routing_poll_interval: Duration,
    /// Inbound queue capacity
    pub queue_capacity: usize,
    /// Worker slots beyond the sum of backend concurrency
    pub bookkeeping_slots: usize,
    /// Events buffered per subscriber
    pub event_buffer: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            first_response_timeout: Duration::from_secs(5),
            total_timeout: Duration::from_secs(30),
            routing_poll_interval: Duration::from_millis(250),
            queue_capacity: 1024,
            bookkeeping_slots: 4,
            event_buffer: 1024,
        }
    }
}

/// Dispatcher could not be assembled
#[derive(Debug, Error, PartialEq, Eq)]
pub enum BuildError {
    /// A routed backend has no implementation
    #[error("no backend implementation registered for '{0}'")]
    MissingBackend(String),

    /// `build` was called outside a tokio runtime
    #[error("dispatcher must be built inside a tokio runtime")]
    NoRuntime,
}

// ============================================================================
// Builder
// ============================================================================

/// Assembles a [`Dispatcher`] from explicit component instances
pub struct DispatcherBuilder {
    router: Arc<Router>,
    cache: Arc<SemanticCache>,
    config: DispatcherConfig,
    retry: RetryPolicy,
    backends: HashMap<String, Arc<dyn InferenceBackend>>,
    dead_letters: Option<Arc<dyn DeadLetterSink>>,
    metrics: Option<Arc<GatewayMetrics>>,
    clock: Option<Arc<dyn Clock>>,
}

impl DispatcherBuilder {
    /// Dispatcher tuning
    #[must_use]
    pub fn with_config(mut self, config: DispatcherConfig) -> Self {
        self.config = config;
        self
    }

    /// Retry policy
    #[must_use]
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Register a backend implementation under its own name
    #[must_use]
    pub fn with_backend(mut self, backend: Arc<dyn InferenceBackend>) -> Self {
        self.backends.insert(backend.name().to_string(), backend);
        self
    }

    /// Dead-letter destination (in-memory by default)
    #[must_use]
    pub fn with_dead_letter_sink(mut self, sink: Arc<dyn DeadLetterSink>) -> Self {
        self.dead_letters = Some(sink);
        self
    }

    /// Shared metrics (fresh by default)
    #[must_use]
    pub fn with_metrics(mut self, metrics: Arc<GatewayMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Time source (system clock by default); should match the router's
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Validate and start the worker loop
    pub fn build(self) -> Result<Dispatcher, BuildError> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| BuildError::NoRuntime)?;

        if let Some(missing) = self
            .router
            .candidates()
            .iter()
            .find(|d| !self.backends.contains_key(&d.name))
        {
            return Err(BuildError::MissingBackend(missing.name.clone()));
        }

        let slots: usize = self
            .router
            .candidates()
            .iter()
            .map(|d| d.max_concurrent as usize)
            .sum::<usize>()
            + self.config.bookkeeping_slots;
        let worker_slots = u32::try_from(slots.max(1)).unwrap_or(u32::MAX);

        let metrics = self.metrics.unwrap_or_else(|| {
            Arc::new(GatewayMetrics::new(
                self.router.candidates().iter().map(|d| d.name.as_str()),
            ))
        });

        let shared = Arc::new(Shared {
            events: Arc::new(EventLog::new(self.config.event_buffer)),
            config: self.config,
            router: self.router,
            cache: self.cache,
            retry: self.retry,
            backends: self.backends,
            dead_letters: self
                .dead_letters
                .unwrap_or_else(|| Arc::new(InMemoryDeadLetterSink::new())),
            metrics,
            clock: self.clock.unwrap_or_else(|| Arc::new(SystemClock)),
            leaders: DashMap::new(),
        });

        let queue = Arc::new(RequestQueue::new(shared.config.queue_capacity));
        let workers = Arc::new(Semaphore::new(worker_slots as usize));
        let worker_loop = runtime.spawn(run_worker_loop(
            Arc::clone(&shared),
            Arc::clone(&queue),
            Arc::clone(&workers),
        ));

        tracing::info!(
            backends = shared.backends.len(),
            worker_slots,
            queue_capacity = shared.config.queue_capacity,
            "Dispatcher started"
        );

        Ok(Dispatcher {
            shared,
            queue,
            workers,
            worker_slots,
            worker_loop: parking_lot::Mutex::new(Some(worker_loop)),
        })
    }
}

// ============================================================================
// Dispatcher
// ============================================================================

struct Job {
    request: Request,
    trace: RequestTrace,
    reply: oneshot::Sender<Result<Verdict, DispatchFailure>>,
}

/// Entry point for producers
pub struct Dispatcher {
    shared: Arc<Shared>,
    queue: Arc<RequestQueue<Job>>,
    workers: Arc<Semaphore>,
    worker_slots: u32,
    worker_loop: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl Dispatcher {
    /// Start assembling a dispatcher around a router and a cache
    #[must_use]
    pub fn builder(router: Arc<Router>, cache: Arc<SemanticCache>) -> DispatcherBuilder {
        DispatcherBuilder {
            router,
            cache,
            config: DispatcherConfig::default(),
            retry: RetryPolicy::default(),
            backends: HashMap::new(),
            dead_letters: None,
            metrics: None,
            clock: None,
        }
    }

    /// Submit a document and wait for its verdict
    ///
    /// Never waits past the submission's deadline.
    pub async fn submit(&self, submission: Submission) -> Result<Verdict, DispatchFailure> {
        let shared = &self.shared;
        let now = shared.clock.now();
        let request = Request::new(submission, now);
        let request_id = request.id;
        let remaining = request.remaining(now);

        shared.metrics.submitted.inc();
        let mut trace = RequestTrace::new(
            Arc::clone(&shared.events),
            Arc::clone(&shared.clock),
            &request,
        );
        trace.advance(RequestState::Queued);

        if request.is_expired(now) {
            trace.advance(RequestState::Cancelled);
            shared.metrics.cancelled.inc();
            return Err(DispatchFailure::new(
                request_id,
                FailureKind::DeadlineExceeded,
                0,
                "deadline already passed at submission",
            ));
        }

        let (reply, rx) = oneshot::channel();
        let priority = request.priority;
        if let Err(e) = self.queue.push(Job { request, trace, reply }, priority) {
            shared.metrics.failed.inc();
            let kind = match e {
                QueueError::Full(_) => FailureKind::QueueFull,
                QueueError::Closed => FailureKind::ShuttingDown,
            };
            tracing::warn!(request_id = %request_id, error = %e, "Submission rejected");
            return Err(DispatchFailure::new(request_id, kind, 0, e.to_string()));
        }
        shared.metrics.queue_depth.inc();

        match tokio::time::timeout(remaining, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(DispatchFailure::new(
                request_id,
                FailureKind::ShuttingDown,
                0,
                "dispatcher stopped before the request finished",
            )),
            Err(_) => {
                // still waiting for a worker: give the slot back now
                let unclaimed = self.queue.remove_where(|job| job.request.id == request_id);
                if let Some(mut job) = unclaimed {
                    shared.metrics.queue_depth.dec();
                    job.trace.advance(RequestState::Cancelled);
                    shared.metrics.cancelled.inc();
                    tracing::info!(
                        request_id = %request_id,
                        "Request cancelled at deadline while queued"
                    );
                }
                Err(DispatchFailure::new(
                    request_id,
                    FailureKind::DeadlineExceeded,
                    0,
                    "deadline passed while waiting for a result",
                ))
            }
        }
    }

    /// Receive every dispatch event published from now on
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<DispatchEvent> {
        self.shared.events.subscribe()
    }

    /// Shared metrics
    #[must_use]
    pub fn metrics(&self) -> &Arc<GatewayMetrics> {
        &self.shared.metrics
    }

    /// Router in use
    #[must_use]
    pub fn router(&self) -> &Arc<Router> {
        &self.shared.router
    }

    /// Cache in use
    #[must_use]
    pub fn cache(&self) -> &Arc<SemanticCache> {
        &self.shared.cache
    }

    /// Requests waiting for a worker
    #[must_use]
    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    /// Stop accepting submissions and wait for accepted ones to finish
    pub async fn shutdown(&self) {
        self.queue.close();

        let worker_loop = self.worker_loop.lock().take();
        if let Some(handle) = worker_loop {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "Dispatcher worker loop failed");
            }
        }

        // every in-flight request holds one slot
        if let Ok(all) = self.workers.acquire_many(self.worker_slots).await {
            drop(all);
        }
        tracing::info!("Dispatcher drained");
    }
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("router", &self.shared.router)
            .field("queued", &self.queue.len())
            .field("worker_slots", &self.worker_slots)
            .finish()
    }
}

async fn run_worker_loop(
    shared: Arc<Shared>,
    queue: Arc<RequestQueue<Job>>,
    workers: Arc<Semaphore>,
) {
    loop {
        let Ok(slot) = Arc::clone(&workers).acquire_owned().await else {
            break;
        };
        let Some(job) = queue.pop().await else {
            break;
        };
        shared.metrics.queue_depth.dec();

        let shared = Arc::clone(&shared);
        tokio::spawn(async move {
            let _slot = slot;
            shared.process(job).await;
        });
    }
    tracing::debug!("Dispatcher worker loop stopped");
}

// ============================================================================
// Request Processing
// ============================================================================

type CoalesceKey = (String, Fingerprint);

struct Shared {
    config: DispatcherConfig,
    router: Arc<Router>,
    cache: Arc<SemanticCache>,
    retry: RetryPolicy,
    backends: HashMap<String, Arc<dyn InferenceBackend>>,
    dead_letters: Arc<dyn DeadLetterSink>,
    events: Arc<EventLog>,
    metrics: Arc<GatewayMetrics>,
    clock: Arc<dyn Clock>,
    /// Identical requests currently calling a backend
    leaders: DashMap<CoalesceKey, watch::Sender<()>>,
}

/// Held by the one request calling a backend for a given key
struct Leadership<'a> {
    leaders: &'a DashMap<CoalesceKey, watch::Sender<()>>,
    key: CoalesceKey,
}

impl Drop for Leadership<'_> {
    fn drop(&mut self) {
        // dropping the sender wakes every follower
        self.leaders.remove(&self.key);
    }
}

enum Claim<'a> {
    Leader(Leadership<'a>),
    Follower(watch::Receiver<()>),
}

enum CallOutcome {
    Response(crate::backend::BackendResponse),
    Failed(BackendError),
    DeadlineCut,
}

enum RoutingOutcome {
    Selected(Selection),
    Terminal(NoBackendAvailable),
    DeadlineReached,
}

impl Shared {
    async fn process(&self, job: Job) {
        let Job {
            request,
            mut trace,
            reply,
        } = job;

        let result = self.run(&request, &mut trace).await;

        let latency = elapsed_between(request.submitted_at, self.clock.now());
        self.metrics.end_to_end.record_duration(latency);
        if result.is_ok() {
            self.metrics.completed.inc();
        }
        // the producer may have given up at its deadline
        let _ = reply.send(result);
    }

    fn remaining(&self, request: &Request) -> Duration {
        request.remaining(self.clock.now())
    }

    async fn run(
        &self,
        request: &Request,
        trace: &mut RequestTrace,
    ) -> Result<Verdict, DispatchFailure> {
        if request.is_expired(self.clock.now()) {
            return Err(self.cancel(request, trace, 0, None));
        }

        trace.advance(RequestState::CacheCheck);
        let mut waited = false;
        loop {
            if let Some(hit) = self.cache.lookup(&request.subject_key, &request.content) {
                return Ok(self.serve_cached(request, trace, hit, waited));
            }

            match self.claim(request) {
                Claim::Leader(leadership) => {
                    // an identical request may have stored between lookup and claim
                    if let Some(hit) = self.cache.lookup(&request.subject_key, &request.content) {
                        drop(leadership);
                        return Ok(self.serve_cached(request, trace, hit, waited));
                    }
                    self.metrics.cache_misses.inc();
                    let result = self.route_and_call(request, trace).await;
                    drop(leadership);
                    return result;
                }
                Claim::Follower(mut leader) => {
                    waited = true;
                    tracing::debug!(
                        request_id = %request.id,
                        fingerprint = %request.content_fingerprint,
                        "Waiting on identical in-flight request"
                    );
                    let remaining = self.remaining(request);
                    if tokio::time::timeout(remaining, leader.changed())
                        .await
                        .is_err()
                    {
                        return Err(self.cancel(request, trace, 0, None));
                    }
                }
            }
        }
    }

    fn claim(&self, request: &Request) -> Claim<'_> {
        let key = (request.subject_key.clone(), request.content_fingerprint);
        match self.leaders.entry(key.clone()) {
            Entry::Occupied(leader) => Claim::Follower(leader.get().subscribe()),
            Entry::Vacant(slot) => {
                let (sender, _) = watch::channel(());
                slot.insert(sender);
                Claim::Leader(Leadership {
                    leaders: &self.leaders,
                    key,
                })
            }
        }
    }

    fn serve_cached(
        &self,
        request: &Request,
        trace: &mut RequestTrace,
        hit: CachedResponse,
        waited: bool,
    ) -> Verdict {
        self.metrics.cache_hits.inc();
        if waited {
            self.metrics.coalesced.inc();
        }
        trace.advance(RequestState::CacheHit);
        trace.advance(RequestState::Done);

        Verdict {
            request_id: request.id,
            response: hit.response,
            source: if waited {
                VerdictSource::Coalesced
            } else {
                VerdictSource::Cache
            },
            backend: None,
            attempts: 0,
            latency_ms: self.latency_ms(request),
            cost_usd: 0.0,
            similarity: Some(hit.similarity),
        }
    }

    async fn route_and_call(
        &self,
        request: &Request,
        trace: &mut RequestTrace,
    ) -> Result<Verdict, DispatchFailure> {
        let mut attempts = 0u32;
        let mut last_error: Option<BackendError> = None;
        trace.advance(RequestState::Routing);

        loop {
            let selection = match self.await_selection(request).await {
                RoutingOutcome::Selected(selection) => selection,
                RoutingOutcome::DeadlineReached => {
                    return Err(self.cancel(request, trace, attempts, last_error));
                }
                RoutingOutcome::Terminal(none) => {
                    trace.advance(RequestState::Failed);
                    tracing::warn!(request_id = %request.id, reason = %none, attempts, "Request cannot be routed");
                    let failure = self.unroutable(request, attempts, last_error).await;
                    return Err(DispatchFailure {
                        message: none.to_string(),
                        ..failure
                    });
                }
            };

            let Selection {
                descriptor,
                admission,
                permit,
                reservation,
            } = selection;
            let name = descriptor.name.as_str();
            let Some(backend) = self.backends.get(name).cloned() else {
                // build() guarantees an implementation for every candidate
                trace.advance(RequestState::Failed);
                return Err(self.unroutable(request, attempts, last_error).await);
            };
            let breaker = self.router.breaker(name).cloned();
            let backend_metrics = self.metrics.backend(name).cloned();

            attempts += 1;
            trace.set_backend(name);
            trace.set_attempt(attempts);
            trace.advance(RequestState::Admitted);
            trace.advance(RequestState::InFlight);

            if let Some(m) = &backend_metrics {
                m.call_started();
            }
            let started = std::time::Instant::now();
            let outcome = self.call(backend.as_ref(), request).await;
            if let Some(m) = &backend_metrics {
                m.call_finished(started);
            }
            drop(permit);

            match outcome {
                CallOutcome::Response(mut response) => {
                    if let Some(breaker) = &breaker {
                        breaker.record_success(admission);
                    }
                    let reported = response
                        .cost_usd
                        .filter(|c| c.is_finite() && *c >= 0.0)
                        .unwrap_or(descriptor.cost_per_request_usd);
                    let cost = match reservation {
                        Some(reservation) => self.router.ledger().commit(reservation, reported),
                        None => reported,
                    };
                    if let Some(m) = &backend_metrics {
                        m.successes.inc();
                        m.add_spend(cost);
                    }
                    if response.model.is_none() {
                        response.model = Some(name.to_string());
                    }

                    trace.advance_with_cost(RequestState::Success, Some(cost));
                    trace.advance(RequestState::CacheStore);
                    self.cache
                        .store(&request.subject_key, &request.content, &response);
                    trace.advance(RequestState::Done);

                    return Ok(Verdict {
                        request_id: request.id,
                        response,
                        source: VerdictSource::Backend,
                        backend: Some(name.to_string()),
                        attempts,
                        latency_ms: self.latency_ms(request),
                        cost_usd: cost,
                        similarity: None,
                    });
                }
                CallOutcome::DeadlineCut => {
                    if let Some(breaker) = &breaker {
                        breaker.cancel(admission);
                    }
                    if let Some(reservation) = reservation {
                        self.router.ledger().release(reservation);
                    }
                    if let Some(m) = &backend_metrics {
                        m.cancelled.inc();
                    }
                    return Err(self.cancel(request, trace, attempts, last_error));
                }
                CallOutcome::Failed(error) => {
                    if let Some(breaker) = &breaker {
                        if error.kind.reflects_backend_health() {
                            breaker.record_failure(admission);
                        } else {
                            breaker.cancel(admission);
                        }
                    }
                    if let Some(reservation) = reservation {
                        self.router.ledger().release(reservation);
                    }
                    if let Some(m) = &backend_metrics {
                        m.failures.inc();
                        if error.kind == BackendErrorKind::Timeout {
                            m.timeouts.inc();
                        }
                    }

                    trace.advance(RequestState::Failure);
                    tracing::warn!(
                        request_id = %request.id,
                        backend = name,
                        attempt = attempts,
                        error = %error,
                        "Backend call failed"
                    );

                    let decision = self.retry.classify(error.kind);
                    last_error = Some(error);

                    if decision == RetryDecision::Fatal {
                        trace.advance(RequestState::DeadLettered);
                        return Err(self
                            .dead_letter(request, attempts, last_error, FailureKind::Fatal)
                            .await);
                    }
                    if !self.retry.allows_another(attempts) {
                        trace.advance(RequestState::RetriesExhausted);
                        trace.advance(RequestState::DeadLettered);
                        return Err(self
                            .dead_letter(request, attempts, last_error, FailureKind::RetriesExhausted)
                            .await);
                    }

                    trace.advance(RequestState::RetryWait);
                    self.metrics.retries.inc();
                    let remaining = self.remaining(request);
                    let delay = self.retry.next_delay(attempts - 1).min(remaining);
                    tracing::debug!(
                        request_id = %request.id,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        "Backing off before retry"
                    );
                    // Exponential backoff before routing again
                    tokio::time::sleep(delay).await;

                    if request.is_expired(self.clock.now()) {
                        return Err(self.cancel(request, trace, attempts, last_error));
                    }
                    trace.advance(RequestState::Routing);
                }
            }
        }
    }

    /// Poll the router until a backend admits the request or waiting is pointless
    async fn await_selection(&self, request: &Request) -> RoutingOutcome {
        loop {
            let none = match self.router.select_backend(request) {
                Ok(selection) => return RoutingOutcome::Selected(selection),
                Err(none) if none.is_terminal() => return RoutingOutcome::Terminal(none),
                Err(none) => none,
            };

            let remaining = self.remaining(request);
            if remaining.is_zero() {
                return RoutingOutcome::DeadlineReached;
            }
            tracing::trace!(request_id = %request.id, reason = %none, "No backend eligible yet");

            // a released permit usually frees a backend before the poll interval
            let wait = remaining.min(self.config.routing_poll_interval);
            let released = self.router.limiter().released().notified();
            let _ = tokio::time::timeout(wait, released).await;
        }
    }

    /// Run one backend call under the first-response and total timeouts
    async fn call(&self, backend: &dyn InferenceBackend, request: &Request) -> CallOutcome {
        let remaining = self.remaining(request);
        let total = self.config.total_timeout.min(remaining);
        let first = self.config.first_response_timeout.min(total);
        let started = Instant::now();
        let first_deadline = started + first;
        let total_deadline = started + total;

        let timed_out = |limit: Duration, what: &str| {
            if limit >= remaining {
                CallOutcome::DeadlineCut
            } else {
                CallOutcome::Failed(BackendError::timeout(format!(
                    "no {what} within {} ms",
                    limit.as_millis()
                )))
            }
        };

        let mut chunks = match tokio::time::timeout_at(
            first_deadline,
            backend.invoke_streaming(&request.content, total),
        )
        .await
        {
            Ok(Ok(chunks)) => chunks,
            Ok(Err(error)) => return CallOutcome::Failed(error),
            Err(_) => return timed_out(first, "first response"),
        };

        let mut text = String::new();
        let mut next = match tokio::time::timeout_at(first_deadline, chunks.recv()).await {
            Ok(chunk) => chunk,
            Err(_) => return timed_out(first, "first response"),
        };
        loop {
            match next {
                Some(ResponseChunk::Text(part)) => text.push_str(&part),
                Some(ResponseChunk::Complete(mut response)) => {
                    if response.text.is_empty() {
                        response.text = text;
                    }
                    return CallOutcome::Response(response);
                }
                Some(ResponseChunk::Error(error)) => return CallOutcome::Failed(error),
                None => {
                    return CallOutcome::Failed(BackendError::unavailable(
                        "response stream ended without completing",
                    ))
                }
            }
            next = match tokio::time::timeout_at(total_deadline, chunks.recv()).await {
                Ok(chunk) => chunk,
                Err(_) => return timed_out(total, "complete response"),
            };
        }
    }

    fn cancel(
        &self,
        request: &Request,
        trace: &mut RequestTrace,
        attempts: u32,
        last_error: Option<BackendError>,
    ) -> DispatchFailure {
        trace.advance(RequestState::Cancelled);
        self.metrics.cancelled.inc();
        tracing::info!(
            request_id = %request.id,
            attempts,
            state = ?trace.state(),
            "Request cancelled at deadline"
        );
        DispatchFailure::new(
            request.id,
            FailureKind::DeadlineExceeded,
            attempts,
            "deadline reached before a result",
        )
        .with_last_error(last_error.map(|e| e.kind))
    }

    /// No backend can take the request. Only requests that reached a backend
    /// at least once are dead-lettered.
    async fn unroutable(
        &self,
        request: &Request,
        attempts: u32,
        last_error: Option<BackendError>,
    ) -> DispatchFailure {
        if attempts > 0 {
            return self
                .dead_letter(request, attempts, last_error, FailureKind::NoBackendAvailable)
                .await;
        }
        self.metrics.failed.inc();
        let reason = FailureKind::NoBackendAvailable;
        DispatchFailure::new(request.id, reason, 0, reason.to_string())
    }

    async fn dead_letter(
        &self,
        request: &Request,
        attempts: u32,
        last_error: Option<BackendError>,
        reason: FailureKind,
    ) -> DispatchFailure {
        self.metrics.failed.inc();
        let message = last_error
            .as_ref()
            .map_or_else(|| reason.to_string(), ToString::to_string);
        let failure = DispatchFailure::new(request.id, reason, attempts, message)
            .with_last_error(last_error.as_ref().map(|e| e.kind));

        let entry = DeadLetterEntry {
            request: request.clone(),
            last_error,
            attempts,
            failed_at: self.clock.now(),
            reason,
        };
        match self.dead_letters.record(entry).await {
            Ok(()) => {
                self.metrics.dead_lettered.inc();
                tracing::warn!(
                    request_id = %request.id,
                    reason = %reason,
                    attempts,
                    "Request dead-lettered"
                );
            }
            Err(e) => {
                tracing::error!(
                    request_id = %request.id,
                    error = %e,
                    "Failed to record dead letter"
                );
            }
        }
        failure
    }

    fn latency_ms(&self, request: &Request) -> u64 {
        let latency = elapsed_between(request.submitted_at, self.clock.now());
        u64::try_from(latency.as_millis()).unwrap_or(u64::MAX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{CacheConfig, HashingEmbedder};
    use crate::routing::test_utils::ScriptedBackend;
    use crate::routing::test_utils::Outcome;
    use crate::routing::{
        BackendDescriptor, BackendTier, BreakerConfig, BudgetConfig, BudgetLedger,
    };
    use chrono::Utc;

    const TEXT: &str = "Globex shares slid after the regulator opened an inquiry";

    fn router(max_concurrent: u32) -> Arc<Router> {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        Arc::new(Router::new(
            vec![BackendDescriptor::new(
                "local",
                BackendTier::Local,
                max_concurrent,
                4096,
            )],
            &BreakerConfig::default(),
            Arc::new(BudgetLedger::new(BudgetConfig::default(), Arc::clone(&clock))),
            clock,
        ))
    }

    fn cache() -> Arc<SemanticCache> {
        Arc::new(SemanticCache::new(
            CacheConfig::default(),
            Arc::new(HashingEmbedder::default()),
            Arc::new(SystemClock),
        ))
    }

    fn fast_retry() -> RetryPolicy {
        RetryPolicy::default()
            .with_base_delay(Duration::from_millis(5))
            .with_jitter_ratio(0.0)
    }

    fn deadline_in(ms: i64) -> chrono::DateTime<Utc> {
        Utc::now() + chrono::Duration::milliseconds(ms)
    }

    #[tokio::test]
    async fn test_build_requires_backend_for_every_candidate() {
        let err = Dispatcher::builder(router(1), cache()).build().unwrap_err();
        assert!(matches!(err, BuildError::MissingBackend(name) if name == "local"));
    }

    #[tokio::test]
    async fn test_backend_receives_content_and_leadership_is_released() {
        let backend = ScriptedBackend::new("local").shared();
        let dispatcher = Dispatcher::builder(router(2), cache())
            .with_backend(Arc::clone(&backend) as Arc<dyn InferenceBackend>)
            .build()
            .unwrap();

        let verdict = dispatcher
            .submit(Submission::new(TEXT, "GLBX", deadline_in(5_000)))
            .await
            .unwrap();

        assert_eq!(verdict.response.text, "neutral");
        assert_eq!(verdict.response.model.as_deref(), Some("local"));
        assert_eq!(backend.contents(), [TEXT]);
        assert!(dispatcher.shared.leaders.is_empty());
        assert_eq!(dispatcher.cache().stats().entries, 1);
    }

    #[tokio::test]
    async fn test_retry_counts_and_recovery() {
        let backend = ScriptedBackend::new("local")
            .then_fail(BackendErrorKind::Unavailable)
            .then_fail(BackendErrorKind::Timeout)
            .then_respond("negative")
            .shared();
        let dispatcher = Dispatcher::builder(router(1), cache())
            .with_retry_policy(fast_retry())
            .with_backend(Arc::clone(&backend) as Arc<dyn InferenceBackend>)
            .build()
            .unwrap();

        let verdict = dispatcher
            .submit(Submission::new(TEXT, "GLBX", deadline_in(5_000)))
            .await
            .unwrap();

        assert_eq!(verdict.response.text, "negative");
        assert_eq!(verdict.attempts, 3);
        assert_eq!(dispatcher.metrics().snapshot().retries, 2);
    }

    #[tokio::test]
    async fn test_backoff_never_outlasts_deadline() {
        let backend = ScriptedBackend::new("local")
            .always_failing(BackendErrorKind::Unavailable)
            .shared();
        let sink = Arc::new(InMemoryDeadLetterSink::new());
        let dispatcher = Dispatcher::builder(router(1), cache())
            .with_retry_policy(
                RetryPolicy::default()
                    .with_base_delay(Duration::from_secs(10))
                    .with_max_delay(Duration::from_secs(60)),
            )
            .with_dead_letter_sink(Arc::clone(&sink) as Arc<dyn DeadLetterSink>)
            .with_backend(Arc::clone(&backend) as Arc<dyn InferenceBackend>)
            .build()
            .unwrap();

        let started = std::time::Instant::now();
        let failure = dispatcher
            .submit(Submission::new(TEXT, "GLBX", deadline_in(300)))
            .await
            .unwrap_err();

        assert_eq!(failure.kind, FailureKind::DeadlineExceeded);
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(backend.calls(), 1);

        dispatcher.shutdown().await;
        assert!(sink.is_empty());
    }

    #[tokio::test]
    async fn test_full_queue_rejects_submission() {
        let backend = ScriptedBackend::new("local")
            .with_default(Outcome::Hang)
            .shared();
        let dispatcher = Arc::new(
            Dispatcher::builder(router(1), cache())
                .with_config(DispatcherConfig {
                    queue_capacity: 1,
                    bookkeeping_slots: 0,
                    ..DispatcherConfig::default()
                })
                .with_backend(Arc::clone(&backend) as Arc<dyn InferenceBackend>)
                .build()
                .unwrap(),
        );

        let mut pending = Vec::new();
        for subject in ["A", "B"] {
            let dispatcher = Arc::clone(&dispatcher);
            pending.push(tokio::spawn(async move {
                dispatcher
                    .submit(Submission::new(TEXT, subject, deadline_in(400)))
                    .await
            }));
            tokio::time::sleep(Duration::from_millis(30)).await;
        }
        assert_eq!(dispatcher.queued(), 1);

        let rejected = dispatcher
            .submit(Submission::new(TEXT, "C", deadline_in(400)))
            .await
            .unwrap_err();
        assert_eq!(rejected.kind, FailureKind::QueueFull);

        for handle in pending {
            let failure = handle.await.unwrap().unwrap_err();
            assert_eq!(failure.kind, FailureKind::DeadlineExceeded);
        }
    }

    #[tokio::test]
    async fn test_expired_queued_request_gives_up_its_slot() {
        let backend = ScriptedBackend::new("local")
            .with_default(Outcome::Hang)
            .shared();
        let dispatcher = Arc::new(
            Dispatcher::builder(router(1), cache())
                .with_config(DispatcherConfig {
                    queue_capacity: 1,
                    bookkeeping_slots: 0,
                    ..DispatcherConfig::default()
                })
                .with_backend(Arc::clone(&backend) as Arc<dyn InferenceBackend>)
                .build()
                .unwrap(),
        );
        let mut events = dispatcher.subscribe();

        // holds the only worker until its deadline
        let holder = {
            let dispatcher = Arc::clone(&dispatcher);
            tokio::spawn(async move {
                dispatcher
                    .submit(Submission::new(TEXT, "A", deadline_in(1_500)))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;

        let expired = dispatcher
            .submit(Submission::new(TEXT, "B", deadline_in(100)))
            .await
            .unwrap_err();
        assert_eq!(expired.kind, FailureKind::DeadlineExceeded);
        assert_eq!(dispatcher.queued(), 0);
        assert_eq!(dispatcher.metrics().snapshot().cancelled, 1);

        let mut seen = Vec::new();
        while let Ok(event) = events.try_recv() {
            if event.request_id == expired.request_id {
                seen.push((event.from, event.to));
            }
        }
        assert_eq!(
            seen.last(),
            Some(&(Some(RequestState::Queued), RequestState::Cancelled))
        );

        let next = dispatcher
            .submit(Submission::new(TEXT, "C", deadline_in(200)))
            .await
            .unwrap_err();
        assert_eq!(next.kind, FailureKind::DeadlineExceeded);
        assert_eq!(dispatcher.queued(), 0);

        let held = holder.await.unwrap().unwrap_err();
        assert_eq!(held.kind, FailureKind::DeadlineExceeded);
        assert_eq!(backend.calls(), 1);
    }
}
