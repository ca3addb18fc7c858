//! Booking session: the composition root owning one countdown manager and one
//! request queue for the lifetime of a client session

use crate::config::{CountdownConfig, QueueConfig};
use crate::countdown::CountdownManager;
use crate::error::{BookingError, Result};
use crate::event::{events, EventEmitter, EventStream, SessionEvent};
use crate::queue::{Operation, Priority, PriorityRequestQueue, RequestReceiver};
use crate::SessionStats;
use std::sync::atomic::{AtomicBool, Ordering};

/// Booking session
pub struct BookingSession {
    countdowns: CountdownManager,
    requests: PriorityRequestQueue,
    event_emitter: EventEmitter,
    is_shutting_down: AtomicBool,
}

impl BookingSession {
    /// Get the countdown manager
    pub fn countdowns(&self) -> &CountdownManager {
        &self.countdowns
    }

    /// Get the request queue
    pub fn requests(&self) -> &PriorityRequestQueue {
        &self.requests
    }

    /// Submit an operation to the request queue
    pub async fn submit(
        &self,
        operation: Box<dyn Operation>,
        priority: Priority,
    ) -> Result<RequestReceiver> {
        if self.is_shutting_down() {
            return Err(BookingError::ShutdownInProgress);
        }
        Ok(self.requests.enqueue(operation, priority).await)
    }

    /// Get session statistics
    pub async fn stats(&self) -> SessionStats {
        SessionStats {
            active_countdowns: self.countdowns.active_count(),
            queue: self.requests.stats().await,
        }
    }

    /// Subscribe to all session events
    pub fn subscribe_stream(&self) -> EventStream {
        self.event_emitter.subscribe_stream()
    }

    /// Subscribe to filtered session events
    pub fn subscribe_filtered(
        &self,
        filter: impl Fn(&SessionEvent) -> bool + Send + Sync + 'static,
    ) -> EventStream {
        self.event_emitter.subscribe_filtered(filter)
    }

    /// Check if shutdown is in progress
    pub fn is_shutting_down(&self) -> bool {
        self.is_shutting_down.load(Ordering::SeqCst)
    }

    /// Tear the session down: stop every countdown and clear pending requests.
    ///
    /// In-flight requests still settle on their own. Safe to call repeatedly.
    pub async fn shutdown(&self) {
        if self.is_shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::info!("Shutting down booking session");

        self.countdowns.stop_all();
        let cleared = self.requests.clear().await;

        self.event_emitter.emit(SessionEvent::with_map(
            events::SESSION_SHUTDOWN,
            std::collections::HashMap::from([(
                "cleared_requests".to_string(),
                serde_json::json!(cleared),
            )]),
        ));
    }
}

/// Builder for [`BookingSession`]
pub struct BookingSessionBuilder {
    event_emitter: EventEmitter,
    queue_config: QueueConfig,
    countdown_config: CountdownConfig,
}

impl BookingSessionBuilder {
    /// Create a new session builder
    pub fn new(event_emitter: EventEmitter) -> Self {
        Self {
            event_emitter,
            queue_config: QueueConfig::default(),
            countdown_config: CountdownConfig::default(),
        }
    }

    /// Set the request queue configuration
    pub fn with_queue_config(mut self, config: QueueConfig) -> Self {
        self.queue_config = config;
        self
    }

    /// Set the countdown configuration
    pub fn with_countdown_config(mut self, config: CountdownConfig) -> Self {
        self.countdown_config = config;
        self
    }

    /// Build the session
    pub fn build(self) -> Result<BookingSession> {
        self.countdown_config.validate()?;
        let requests =
            PriorityRequestQueue::with_config(self.event_emitter.clone(), self.queue_config)?;
        let countdowns =
            CountdownManager::with_config(self.event_emitter.clone(), self.countdown_config);

        Ok(BookingSession {
            countdowns,
            requests,
            event_emitter: self.event_emitter,
            is_shutting_down: AtomicBool::new(false),
        })
    }
}
