//! Per-booking countdown clocks
//!
//! A [`CountdownManager`] keeps at most one ticking clock per booking id. Each
//! clock reports a [`CountdownSnapshot`] to its update callback once when it
//! starts and once per tick afterwards, then fires its expiry callback exactly
//! once at the tick where the remaining time reaches zero.
//!
//! Ticks come from `tokio::time::interval_at`, whose schedule is anchored to
//! the start instant. A late tick is followed by a burst of catch-up ticks, so
//! callers still observe every second exactly once and the final tick lands on
//! the deadline computed at start.
//!
//! ```rust,ignore
//! let countdowns = CountdownManager::new(EventEmitter::new(64));
//! countdowns.start(
//!     "booking-17",
//!     5.0,
//!     |snapshot| println!("{} left", snapshot.formatted_time),
//!     || println!("therapist did not respond in time"),
//! )?;
//! ```

use crate::config::CountdownConfig;
use crate::error::{BookingError, Result};
use crate::event::{events, EventEmitter, SessionEvent};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

/// Booking identifier
pub type BookingId = String;

/// Remaining time of a countdown as handed to the update callback
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CountdownSnapshot {
    pub minutes_remaining: u64,
    pub seconds_remaining: u64,
    pub total_seconds_remaining: u64,
    pub is_expired: bool,
    /// `M:SS`, minutes unpadded
    pub formatted_time: String,
}

impl CountdownSnapshot {
    pub fn from_seconds(total_seconds: u64) -> Self {
        Self {
            minutes_remaining: total_seconds / 60,
            seconds_remaining: total_seconds % 60,
            total_seconds_remaining: total_seconds,
            is_expired: total_seconds == 0,
            formatted_time: format_time(total_seconds),
        }
    }
}

/// Format seconds as `M:SS`
pub fn format_time(total_seconds: u64) -> String {
    format!("{}:{:02}", total_seconds / 60, total_seconds % 60)
}

struct ActiveCountdown {
    generation: u64,
    cancelled: Arc<AtomicBool>,
    /// Set once the tick task is spawned, after the initial update
    handle: Option<JoinHandle<()>>,
}

impl ActiveCountdown {
    fn cancel(self) {
        self.cancelled.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle {
            handle.abort();
        }
    }
}

/// Manages one countdown per booking id
pub struct CountdownManager {
    timers: Arc<DashMap<BookingId, ActiveCountdown>>,
    next_generation: AtomicU64,
    config: CountdownConfig,
    event_emitter: EventEmitter,
}

impl CountdownManager {
    /// Create a countdown manager ticking once per second
    pub fn new(event_emitter: EventEmitter) -> Self {
        Self::with_config(event_emitter, CountdownConfig::default())
    }

    /// Create a countdown manager with a custom configuration
    pub fn with_config(event_emitter: EventEmitter, config: CountdownConfig) -> Self {
        Self {
            timers: Arc::new(DashMap::new()),
            next_generation: AtomicU64::new(0),
            config,
            event_emitter,
        }
    }

    /// Start (or restart) the countdown for `booking_id`.
    ///
    /// `on_update` is called once before this returns and once per tick;
    /// `on_expired` is called once when the countdown reaches zero. The
    /// countdown is already registered when the first `on_update` runs, so
    /// `is_running` reports it and `stop` cancels it. Must be called from
    /// within a tokio runtime.
    pub fn start<U, E>(
        &self,
        booking_id: impl Into<BookingId>,
        duration_minutes: f64,
        on_update: U,
        on_expired: E,
    ) -> Result<()>
    where
        U: FnMut(CountdownSnapshot) + Send + 'static,
        E: FnOnce() + Send + 'static,
    {
        let booking_id = validate_booking_id(booking_id.into())?;
        if !duration_minutes.is_finite() || duration_minutes <= 0.0 {
            return Err(BookingError::InvalidCountdown(format!(
                "duration must be a positive number of minutes, got {duration_minutes}"
            )));
        }
        let total_seconds = (duration_minutes * 60.0).round() as u64;
        if total_seconds == 0 {
            return Err(BookingError::InvalidCountdown(format!(
                "duration of {duration_minutes} minutes is shorter than one second"
            )));
        }

        self.launch(booking_id, total_seconds, on_update, on_expired)
    }

    /// Start (or restart) the countdown for `booking_id` ending at `deadline`.
    ///
    /// Remaining time is rounded up to whole seconds. A deadline that has
    /// already passed reports an expired snapshot and fires `on_expired`
    /// immediately without registering a timer.
    pub fn start_until<U, E>(
        &self,
        booking_id: impl Into<BookingId>,
        deadline: DateTime<Utc>,
        mut on_update: U,
        on_expired: E,
    ) -> Result<()>
    where
        U: FnMut(CountdownSnapshot) + Send + 'static,
        E: FnOnce() + Send + 'static,
    {
        let booking_id = validate_booking_id(booking_id.into())?;
        let millis = (deadline - Utc::now()).num_milliseconds();
        if millis <= 0 {
            self.stop(&booking_id);
            tracing::info!(booking_id = %booking_id, "Countdown deadline already passed");
            on_update(CountdownSnapshot::from_seconds(0));
            on_expired();
            self.event_emitter
                .emit(SessionEvent::for_booking(events::COUNTDOWN_EXPIRED, &booking_id));
            return Ok(());
        }

        let total_seconds = (millis as u64).div_ceil(1000);
        self.launch(booking_id, total_seconds, on_update, on_expired)
    }

    fn launch<U, E>(
        &self,
        booking_id: BookingId,
        total_seconds: u64,
        mut on_update: U,
        on_expired: E,
    ) -> Result<()>
    where
        U: FnMut(CountdownSnapshot) + Send + 'static,
        E: FnOnce() + Send + 'static,
    {
        let tick = self.config.tick_interval;
        let first_tick = Instant::now().checked_add(tick).ok_or_else(|| {
            BookingError::InvalidCountdown(format!(
                "tick interval of {}ms is out of range",
                tick.as_millis()
            ))
        })?;

        self.stop(&booking_id);

        let generation = self.next_generation.fetch_add(1, Ordering::SeqCst);
        let cancelled = Arc::new(AtomicBool::new(false));
        let entry = ActiveCountdown {
            generation,
            cancelled: Arc::clone(&cancelled),
            handle: None,
        };
        // A concurrent start for the same id may have slipped in after stop()
        if let Some(previous) = self.timers.insert(booking_id.clone(), entry) {
            previous.cancel();
        }

        tracing::debug!(
            booking_id = %booking_id,
            total_seconds,
            "Countdown started"
        );
        self.event_emitter.emit(SessionEvent::with_map(
            events::COUNTDOWN_STARTED,
            std::collections::HashMap::from([
                ("booking_id".to_string(), serde_json::json!(booking_id)),
                ("total_seconds".to_string(), serde_json::json!(total_seconds)),
            ]),
        ));

        on_update(CountdownSnapshot::from_seconds(total_seconds));
        // The initial update may have stopped or restarted this countdown
        if cancelled.load(Ordering::SeqCst) {
            return Ok(());
        }

        let timers = Arc::clone(&self.timers);
        let flag = Arc::clone(&cancelled);
        let event_emitter = self.event_emitter.clone();
        let id = booking_id.clone();

        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval_at(first_tick, tick);
            interval.set_missed_tick_behavior(MissedTickBehavior::Burst);
            let mut remaining = total_seconds;

            loop {
                interval.tick().await;
                if flag.load(Ordering::SeqCst) {
                    return;
                }
                remaining -= 1;
                on_update(CountdownSnapshot::from_seconds(remaining));
                if remaining == 0 {
                    break;
                }
            }

            // on_update may have stopped this countdown on the final tick
            if flag.load(Ordering::SeqCst) {
                return;
            }
            on_expired();

            timers.remove_if(&id, |_, entry| entry.generation == generation);
            tracing::info!(booking_id = %id, "Countdown expired");
            event_emitter.emit(SessionEvent::for_booking(events::COUNTDOWN_EXPIRED, &id));
        });

        match self.timers.get_mut(&booking_id) {
            Some(mut entry) if entry.generation == generation => entry.handle = Some(handle),
            // Superseded between the initial update and the spawn
            _ => handle.abort(),
        }
        Ok(())
    }

    /// Stop the countdown for `booking_id`.
    ///
    /// Returns whether a countdown was running; stopping an unknown id is a no-op.
    pub fn stop(&self, booking_id: &str) -> bool {
        match self.timers.remove(booking_id) {
            Some((_, entry)) => {
                entry.cancel();
                tracing::debug!(booking_id = %booking_id, "Countdown stopped");
                self.event_emitter
                    .emit(SessionEvent::for_booking(events::COUNTDOWN_STOPPED, booking_id));
                true
            }
            None => false,
        }
    }

    /// Stop every active countdown
    pub fn stop_all(&self) {
        let ids: Vec<BookingId> = self.timers.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            self.stop(&id);
        }
    }

    /// Check whether a countdown is active for `booking_id`
    pub fn is_running(&self, booking_id: &str) -> bool {
        self.timers.contains_key(booking_id)
    }

    /// Number of active countdowns
    pub fn active_count(&self) -> usize {
        self.timers.len()
    }
}

impl Drop for CountdownManager {
    fn drop(&mut self) {
        self.stop_all();
    }
}

fn validate_booking_id(booking_id: BookingId) -> Result<BookingId> {
    if booking_id.trim().is_empty() {
        return Err(BookingError::InvalidCountdown(
            "booking id must not be empty".to_string(),
        ));
    }
    Ok(booking_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use std::sync::Mutex;
    use std::time::Duration;

    fn manager() -> CountdownManager {
        CountdownManager::new(EventEmitter::new(100))
    }

    /// Records every snapshot's remaining seconds and counts expiries
    fn recorder() -> (
        Arc<Mutex<Vec<CountdownSnapshot>>>,
        Arc<AtomicU32>,
        impl FnMut(CountdownSnapshot) + Send + 'static,
        impl FnOnce() + Send + 'static,
    ) {
        let updates = Arc::new(Mutex::new(Vec::new()));
        let expired = Arc::new(AtomicU32::new(0));
        let updates_clone = Arc::clone(&updates);
        let expired_clone = Arc::clone(&expired);
        (
            updates,
            expired,
            move |s: CountdownSnapshot| updates_clone.lock().unwrap().push(s),
            move || {
                expired_clone.fetch_add(1, Ordering::SeqCst);
            },
        )
    }

    #[test]
    fn test_format_time() {
        assert_eq!(format_time(125), "2:05");
        assert_eq!(format_time(65), "1:05");
        assert_eq!(format_time(5), "0:05");
        assert_eq!(format_time(0), "0:00");
        assert_eq!(format_time(600), "10:00");
    }

    #[test]
    fn test_snapshot_from_seconds() {
        let snapshot = CountdownSnapshot::from_seconds(125);
        assert_eq!(snapshot.minutes_remaining, 2);
        assert_eq!(snapshot.seconds_remaining, 5);
        assert_eq!(snapshot.total_seconds_remaining, 125);
        assert!(!snapshot.is_expired);
        assert_eq!(snapshot.formatted_time, "2:05");

        assert!(CountdownSnapshot::from_seconds(0).is_expired);
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_fires_initial_update_synchronously() {
        let countdowns = manager();
        let (updates, _, on_update, on_expired) = recorder();

        countdowns.start("b1", 5.0, on_update, on_expired).unwrap();

        let updates = updates.lock().unwrap();
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].total_seconds_remaining, 300);
        assert_eq!(updates[0].formatted_time, "5:00");
        assert!(countdowns.is_running("b1"));
        assert_eq!(countdowns.active_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_countdown_decrements_by_one_until_zero() {
        let countdowns = manager();
        let (updates, expired, on_update, on_expired) = recorder();

        countdowns.start("b1", 1.0, on_update, on_expired).unwrap();
        tokio::time::sleep(Duration::from_secs(90)).await;

        let seen: Vec<u64> = updates
            .lock()
            .unwrap()
            .iter()
            .map(|s| s.total_seconds_remaining)
            .collect();
        let expected: Vec<u64> = (0..=60).rev().collect();
        assert_eq!(seen, expected);

        let updates = updates.lock().unwrap();
        assert!(updates.last().unwrap().is_expired);
        assert!(updates[..updates.len() - 1].iter().all(|s| !s.is_expired));
        assert_eq!(expired.load(Ordering::SeqCst), 1);
        assert!(!countdowns.is_running("b1"));
        assert_eq!(countdowns.active_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expiry_fires_exactly_once() {
        let countdowns = manager();
        let (_, expired, on_update, on_expired) = recorder();

        countdowns.start("b1", 0.05, on_update, on_expired).unwrap();
        tokio::time::sleep(Duration::from_secs(600)).await;

        assert_eq!(expired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_supersedes_previous_countdown() {
        let countdowns = manager();
        let (updates1, expired1, u1, e1) = recorder();
        let (updates2, expired2, u2, e2) = recorder();

        countdowns.start("b1", 5.0, u1, e1).unwrap();
        countdowns.start("b1", 1.0, u2, e2).unwrap();
        assert_eq!(countdowns.active_count(), 1);

        tokio::time::sleep(Duration::from_secs(400)).await;

        assert_eq!(updates1.lock().unwrap().len(), 1);
        assert_eq!(expired1.load(Ordering::SeqCst), 0);
        assert_eq!(updates2.lock().unwrap().len(), 61);
        assert_eq!(expired2.load(Ordering::SeqCst), 1);
        assert_eq!(countdowns.active_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_prevents_further_ticks() {
        let countdowns = manager();
        let (updates, expired, on_update, on_expired) = recorder();

        countdowns.start("b1", 1.0, on_update, on_expired).unwrap();
        tokio::time::sleep(Duration::from_millis(3500)).await;
        assert!(countdowns.stop("b1"));
        tokio::time::sleep(Duration::from_secs(120)).await;

        assert_eq!(updates.lock().unwrap().len(), 4);
        assert_eq!(expired.load(Ordering::SeqCst), 0);
        assert!(!countdowns.is_running("b1"));
    }

    #[tokio::test]
    async fn test_stop_unknown_id_is_noop() {
        let countdowns = manager();
        assert!(!countdowns.stop("missing"));
        assert!(!countdowns.stop("missing"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_independent_countdowns() {
        let countdowns = manager();
        let (_, expired_a, ua, ea) = recorder();
        let (_, expired_b, ub, eb) = recorder();

        countdowns.start("a", 0.5, ua, ea).unwrap();
        countdowns.start("b", 2.0, ub, eb).unwrap();
        assert_eq!(countdowns.active_count(), 2);

        tokio::time::sleep(Duration::from_secs(45)).await;
        assert_eq!(expired_a.load(Ordering::SeqCst), 1);
        assert_eq!(expired_b.load(Ordering::SeqCst), 0);
        assert!(!countdowns.is_running("a"));
        assert!(countdowns.is_running("b"));
    }

    #[test]
    fn test_stop_all_when_idle() {
        let countdowns = manager();
        countdowns.stop_all();
        countdowns.stop_all();
        assert_eq!(countdowns.active_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_all_cancels_everything() {
        let countdowns = manager();
        let (_, expired_a, ua, ea) = recorder();
        let (_, expired_b, ub, eb) = recorder();

        countdowns.start("a", 1.0, ua, ea).unwrap();
        countdowns.start("b", 1.0, ub, eb).unwrap();
        countdowns.stop_all();
        assert_eq!(countdowns.active_count(), 0);

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(expired_a.load(Ordering::SeqCst), 0);
        assert_eq!(expired_b.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drop_stops_countdowns() {
        let (_, expired, on_update, on_expired) = recorder();
        {
            let countdowns = manager();
            countdowns.start("b1", 0.1, on_update, on_expired).unwrap();
        }
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(expired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_start_rejects_invalid_input() {
        let countdowns = manager();

        let err = countdowns.start("", 5.0, |_| {}, || {}).unwrap_err();
        assert!(matches!(err, BookingError::InvalidCountdown(_)));

        assert!(countdowns.start("b1", 0.0, |_| {}, || {}).is_err());
        assert!(countdowns.start("b1", -1.0, |_| {}, || {}).is_err());
        assert!(countdowns.start("b1", f64::NAN, |_| {}, || {}).is_err());
        assert!(countdowns.start("b1", 0.001, |_| {}, || {}).is_err());
        assert_eq!(countdowns.active_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_until_past_deadline_expires_immediately() {
        let countdowns = manager();
        let (updates, expired, on_update, on_expired) = recorder();

        let deadline = Utc::now() - chrono::Duration::seconds(10);
        countdowns
            .start_until("b1", deadline, on_update, on_expired)
            .unwrap();

        let updates = updates.lock().unwrap();
        assert_eq!(updates.len(), 1);
        assert!(updates[0].is_expired);
        assert_eq!(expired.load(Ordering::SeqCst), 1);
        assert!(!countdowns.is_running("b1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_until_future_deadline() {
        let countdowns = manager();
        let (updates, expired, on_update, on_expired) = recorder();

        let deadline = Utc::now() + chrono::Duration::seconds(3);
        countdowns
            .start_until("b1", deadline, on_update, on_expired)
            .unwrap();
        assert_eq!(updates.lock().unwrap()[0].total_seconds_remaining, 3);

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(updates.lock().unwrap().len(), 4);
        assert_eq!(expired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_custom_tick_interval() {
        let config = CountdownConfig::default().with_tick_interval(Duration::from_millis(100));
        let countdowns = CountdownManager::with_config(EventEmitter::new(16), config);
        let (_, expired, on_update, on_expired) = recorder();

        countdowns.start("b1", 0.5, on_update, on_expired).unwrap();
        tokio::time::sleep(Duration::from_secs(4)).await;

        assert_eq!(expired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_initial_update_sees_registered_countdown() {
        let countdowns = Arc::new(manager());
        let observed = Arc::new(Mutex::new(Vec::new()));

        let weak = Arc::downgrade(&countdowns);
        let seen = Arc::clone(&observed);
        countdowns
            .start(
                "b1",
                1.0,
                move |_| {
                    if let Some(countdowns) = weak.upgrade() {
                        seen.lock().unwrap().push(countdowns.is_running("b1"));
                    }
                },
                || {},
            )
            .unwrap();

        assert_eq!(*observed.lock().unwrap(), vec![true]);
        assert!(countdowns.is_running("b1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_from_initial_update_cancels_countdown() {
        let countdowns = Arc::new(manager());
        let (_, expired, _, on_expired) = recorder();
        let updates = Arc::new(AtomicU32::new(0));

        let weak = Arc::downgrade(&countdowns);
        let count = Arc::clone(&updates);
        countdowns
            .start(
                "b1",
                0.1,
                move |_| {
                    count.fetch_add(1, Ordering::SeqCst);
                    if let Some(countdowns) = weak.upgrade() {
                        countdowns.stop("b1");
                    }
                },
                on_expired,
            )
            .unwrap();

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(updates.load(Ordering::SeqCst), 1);
        assert_eq!(expired.load(Ordering::SeqCst), 0);
        assert!(!countdowns.is_running("b1"));
    }

    #[tokio::test]
    async fn test_out_of_range_tick_is_rejected() {
        let config = CountdownConfig::default().with_tick_interval(Duration::MAX);
        let countdowns = CountdownManager::with_config(EventEmitter::new(16), config);
        let (updates, _, on_update, on_expired) = recorder();

        let err = countdowns.start("b1", 1.0, on_update, on_expired).unwrap_err();
        assert!(matches!(err, BookingError::InvalidCountdown(_)));
        assert!(updates.lock().unwrap().is_empty());
        assert_eq!(countdowns.active_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_countdown_events() {
        let emitter = EventEmitter::new(100);
        let mut rx = emitter.subscribe();
        let countdowns = CountdownManager::new(emitter);

        countdowns.start("b9", 0.05, |_| {}, || {}).unwrap();
        tokio::time::sleep(Duration::from_secs(10)).await;

        let started = rx.recv().await.unwrap();
        assert_eq!(started.key, events::COUNTDOWN_STARTED);
        assert_eq!(started.field("total_seconds"), Some(&serde_json::json!(3)));

        let expired = rx.recv().await.unwrap();
        assert_eq!(expired.key, events::COUNTDOWN_EXPIRED);
        assert_eq!(expired.field("booking_id"), Some(&serde_json::json!("b9")));
    }
}
