//! Priority request queue with bounded concurrency
//!
//! Pending requests are ordered by priority (`High > Medium > Low`) and then by
//! arrival. Whenever a concurrency slot frees up, the head of the pending list
//! is dispatched onto the runtime. Failed `High` requests are put back at the
//! front of the pending list up to the configured number of retries; every
//! other failure goes straight back to the caller.

use crate::config::QueueConfig;
use crate::error::{BookingError, Result};
use crate::event::{events, EventEmitter, SessionEvent};
use async_trait::async_trait;
use futures_util::FutureExt;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, Mutex};
use tokio::time::Instant;
use uuid::Uuid;

/// Request identifier
pub type RequestId = String;

/// Receiver side of an enqueued request; settles exactly once
pub type RequestReceiver = oneshot::Receiver<Result<serde_json::Value>>;

/// Request priority
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Low => "low",
            Priority::Medium => "medium",
            Priority::High => "high",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Deferred unit of work submitted to the queue
///
/// `execute` may be called more than once when a high-priority request is
/// retried.
#[async_trait]
pub trait Operation: Send + Sync {
    /// Run the operation
    async fn execute(&self) -> Result<serde_json::Value>;

    /// Get operation type (for logging/debugging)
    fn operation_type(&self) -> &str;
}

/// Adapter turning an async closure into an [`Operation`].
pub struct FnOperation<F> {
    operation_type: String,
    f: F,
}

impl<F> FnOperation<F> {
    pub fn new(operation_type: impl Into<String>, f: F) -> Self {
        Self {
            operation_type: operation_type.into(),
            f,
        }
    }
}

#[async_trait]
impl<F, Fut> Operation for FnOperation<F>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<serde_json::Value>> + Send + 'static,
{
    async fn execute(&self) -> Result<serde_json::Value> {
        (self.f)().await
    }

    fn operation_type(&self) -> &str {
        &self.operation_type
    }
}

struct QueuedRequest {
    id: RequestId,
    sequence: u64,
    priority: Priority,
    operation: Arc<dyn Operation>,
    enqueued_at: Instant,
    retry_count: u32,
    result_tx: Option<oneshot::Sender<Result<serde_json::Value>>>,
}

impl QueuedRequest {
    fn settle(&mut self, result: Result<serde_json::Value>) {
        if let Some(tx) = self.result_tx.take() {
            // The caller may have dropped its receiver
            let _ = tx.send(result);
        }
    }

    fn event_fields(&self) -> HashMap<String, serde_json::Value> {
        HashMap::from([
            ("request_id".to_string(), serde_json::json!(self.id)),
            ("priority".to_string(), serde_json::json!(self.priority)),
            (
                "operation_type".to_string(),
                serde_json::json!(self.operation.operation_type()),
            ),
        ])
    }
}

struct QueueState {
    /// Sorted by (priority desc, sequence asc)
    pending: VecDeque<QueuedRequest>,
    /// In-flight request count
    active: usize,
    next_sequence: u64,
    /// Requests sleeping out a retry delay
    delayed: usize,
    /// Bumped by `clear()` so delayed retries know they were wiped
    clear_generation: u64,
}

impl QueueState {
    fn new() -> Self {
        Self {
            pending: VecDeque::new(),
            active: 0,
            next_sequence: 0,
            delayed: 0,
            clear_generation: 0,
        }
    }

    fn sort_pending(&mut self) {
        self.pending.make_contiguous().sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then(a.sequence.cmp(&b.sequence))
        });
    }
}

struct QueueInner {
    config: QueueConfig,
    state: Mutex<QueueState>,
    event_emitter: EventEmitter,
}

/// Pending counts per priority
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriorityCounts {
    pub high: usize,
    pub medium: usize,
    pub low: usize,
}

/// Queue statistics snapshot
///
/// `total` and `by_priority` count pending requests only; in-flight requests
/// are reported in `active`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub total: usize,
    pub active: usize,
    pub by_priority: PriorityCounts,
    pub oldest_request_age_ms: u64,
    pub delayed_retries: usize,
}

/// Priority request queue
///
/// Cloning is cheap and every clone drives the same queue.
#[derive(Clone)]
pub struct PriorityRequestQueue {
    inner: Arc<QueueInner>,
}

impl PriorityRequestQueue {
    /// Create a queue with the default configuration
    pub fn new(event_emitter: EventEmitter) -> Self {
        Self::from_parts(event_emitter, QueueConfig::default())
    }

    /// Create a queue with a custom configuration
    pub fn with_config(event_emitter: EventEmitter, config: QueueConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self::from_parts(event_emitter, config))
    }

    fn from_parts(event_emitter: EventEmitter, config: QueueConfig) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                config,
                state: Mutex::new(QueueState::new()),
                event_emitter,
            }),
        }
    }

    /// Get the queue configuration
    pub fn config(&self) -> &QueueConfig {
        &self.inner.config
    }

    /// Enqueue an operation.
    ///
    /// Dispatch happens on a spawned task, so this must be called from within
    /// a tokio runtime. The receiver settles once the operation (including any
    /// retries) finishes, or with [`BookingError::QueueCleared`] if the
    /// request is cleared before it runs.
    pub async fn enqueue(
        &self,
        operation: Box<dyn Operation>,
        priority: Priority,
    ) -> RequestReceiver {
        let (tx, rx) = oneshot::channel();

        let mut state = self.inner.state.lock().await;
        let sequence = state.next_sequence;
        state.next_sequence += 1;

        let request = QueuedRequest {
            id: Uuid::new_v4().to_string(),
            sequence,
            priority,
            operation: Arc::from(operation),
            enqueued_at: Instant::now(),
            retry_count: 0,
            result_tx: Some(tx),
        };

        tracing::debug!(
            request_id = %request.id,
            priority = %priority,
            operation_type = request.operation.operation_type(),
            "Request enqueued"
        );
        self.inner.event_emitter.emit(SessionEvent::with_map(
            events::REQUEST_ENQUEUED,
            request.event_fields(),
        ));

        state.pending.push_back(request);
        state.sort_pending();
        drop(state);

        tokio::spawn(Arc::clone(&self.inner).drain());
        rx
    }

    /// Enqueue an async closure
    pub async fn enqueue_fn<F, Fut>(
        &self,
        operation_type: &str,
        f: F,
        priority: Priority,
    ) -> RequestReceiver
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<serde_json::Value>> + Send + 'static,
    {
        self.enqueue(Box::new(FnOperation::new(operation_type, f)), priority)
            .await
    }

    /// Get a snapshot of the queue
    pub async fn stats(&self) -> QueueStats {
        let state = self.inner.state.lock().await;
        let now = Instant::now();

        let mut by_priority = PriorityCounts::default();
        for request in &state.pending {
            match request.priority {
                Priority::High => by_priority.high += 1,
                Priority::Medium => by_priority.medium += 1,
                Priority::Low => by_priority.low += 1,
            }
        }

        let oldest = state
            .pending
            .iter()
            .map(|r| now.saturating_duration_since(r.enqueued_at))
            .max()
            .unwrap_or_default();

        QueueStats {
            total: state.pending.len(),
            active: state.active,
            by_priority,
            oldest_request_age_ms: oldest.as_millis() as u64,
            delayed_retries: state.delayed,
        }
    }

    /// Reject every pending request with [`BookingError::QueueCleared`].
    ///
    /// In-flight requests are not cancelled and settle on their own. Returns
    /// the number of pending requests that were cleared.
    pub async fn clear(&self) -> usize {
        let cleared: Vec<QueuedRequest> = {
            let mut state = self.inner.state.lock().await;
            state.clear_generation += 1;
            state.pending.drain(..).collect()
        };

        let count = cleared.len();
        for mut request in cleared {
            request.settle(Err(BookingError::QueueCleared));
        }

        tracing::info!(cleared = count, "Request queue cleared");
        self.inner.event_emitter.emit(SessionEvent::with_map(
            events::QUEUE_CLEARED,
            HashMap::from([("cleared".to_string(), serde_json::json!(count))]),
        ));
        count
    }

    /// Check if nothing is pending, in flight, or waiting to retry
    pub async fn is_idle(&self) -> bool {
        let state = self.inner.state.lock().await;
        state.pending.is_empty() && state.active == 0 && state.delayed == 0
    }

    /// Wait until the queue is idle (with timeout)
    pub async fn wait_idle(&self, timeout: Duration) -> Result<()> {
        let start = Instant::now();

        loop {
            if self.is_idle().await {
                return Ok(());
            }

            if start.elapsed() >= timeout {
                return Err(BookingError::Timeout(timeout));
            }

            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

impl QueueInner {
    /// Dispatch pending requests until every slot is taken
    async fn drain(self: Arc<Self>) {
        let mut state = self.state.lock().await;
        while state.active < self.config.max_concurrent {
            let Some(request) = state.pending.pop_front() else {
                break;
            };
            state.active += 1;

            tracing::debug!(
                request_id = %request.id,
                priority = %request.priority,
                attempt = request.retry_count + 1,
                "Dispatching request"
            );
            let mut fields = request.event_fields();
            fields.insert(
                "attempt".to_string(),
                serde_json::json!(request.retry_count + 1),
            );
            self.event_emitter
                .emit(SessionEvent::with_map(events::REQUEST_STARTED, fields));

            tokio::spawn(Arc::clone(&self).execute(request));
        }
    }

    // Boxed so the drain -> execute -> drain cycle has a nameable, Send future type
    fn execute(
        self: Arc<Self>,
        mut request: QueuedRequest,
    ) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        Box::pin(async move {
            let operation = Arc::clone(&request.operation);
            let attempt =
                AssertUnwindSafe(async move { operation.execute().await }).catch_unwind();
            let result = match self.config.operation_timeout {
                Some(limit) => match tokio::time::timeout(limit, attempt).await {
                    Ok(r) => r,
                    Err(_) => Ok(Err(BookingError::Timeout(limit))),
                },
                None => attempt.await,
            }
            .unwrap_or_else(|payload| Err(panic_to_error(payload.as_ref())));

            match result {
                Ok(value) => {
                    self.event_emitter.emit(SessionEvent::with_map(
                        events::REQUEST_COMPLETED,
                        request.event_fields(),
                    ));
                    self.release_slot().await;
                    request.settle(Ok(value));
                }
                Err(err) => {
                    let policy = &self.config.high_priority_retry;
                    if request.priority == Priority::High && policy.should_retry(request.retry_count)
                    {
                        request.retry_count += 1;
                        let delay = policy.delay_for_attempt(request.retry_count);

                        tracing::info!(
                            request_id = %request.id,
                            retry_attempt = request.retry_count,
                            error = %err,
                            "Retrying high-priority request"
                        );
                        let mut fields = request.event_fields();
                        fields.insert(
                            "attempt".to_string(),
                            serde_json::json!(request.retry_count + 1),
                        );
                        self.event_emitter
                            .emit(SessionEvent::with_map(events::REQUEST_RETRY, fields));

                        let mut state = self.state.lock().await;
                        state.active = state.active.saturating_sub(1);
                        if delay.is_zero() {
                            state.pending.push_front(request);
                            state.sort_pending();
                        } else {
                            state.delayed += 1;
                            let generation = state.clear_generation;
                            tokio::spawn(Arc::clone(&self).requeue_after(
                                request, delay, generation,
                            ));
                        }
                    } else {
                        let is_timeout = matches!(err, BookingError::Timeout(_));
                        tracing::warn!(
                            request_id = %request.id,
                            priority = %request.priority,
                            attempts = request.retry_count + 1,
                            error = %err,
                            "Request failed"
                        );
                        let mut fields = request.event_fields();
                        fields.insert("error".to_string(), serde_json::json!(err.to_string()));
                        self.event_emitter.emit(SessionEvent::with_map(
                            if is_timeout {
                                events::REQUEST_TIMEOUT
                            } else {
                                events::REQUEST_FAILED
                            },
                            fields,
                        ));

                        self.release_slot().await;
                        request.settle(Err(err));
                    }
                }
            }

            self.drain().await;
        })
    }

    /// Must run before the request settles so a resumed caller sees the slot free
    async fn release_slot(&self) {
        let mut state = self.state.lock().await;
        state.active = state.active.saturating_sub(1);
    }

    /// Put a retried request back after its backoff delay
    async fn requeue_after(
        self: Arc<Self>,
        mut request: QueuedRequest,
        delay: Duration,
        generation: u64,
    ) {
        tokio::time::sleep(delay).await;

        let mut state = self.state.lock().await;
        state.delayed = state.delayed.saturating_sub(1);
        if state.clear_generation != generation {
            drop(state);
            request.settle(Err(BookingError::QueueCleared));
            return;
        }
        state.pending.push_front(request);
        state.sort_pending();
        drop(state);

        self.drain().await;
    }
}

fn panic_to_error(payload: &(dyn Any + Send)) -> BookingError {
    let message = payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic payload".to_string());
    BookingError::OperationFailed(format!("operation panicked: {message}"))
}
