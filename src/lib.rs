//! # Booking Lane
//!
//! Client-side coordination utilities for a service-booking marketplace.
//!
//! - [`CountdownManager`]: one ticking response-window clock per booking, with
//!   an update callback every second and a one-shot expiry callback
//! - [`PriorityRequestQueue`]: bounded-concurrency admission control for
//!   outbound operations, ordered by priority then arrival, with automatic
//!   retry for high-priority requests
//! - [`BookingSession`]: owns one of each for the lifetime of a client session
//! - Event system for countdown and request lifecycle notifications
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use booking_lane::{BookingSessionBuilder, EventEmitter, FnOperation, Priority};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let session = BookingSessionBuilder::new(EventEmitter::new(100)).build()?;
//!
//!     session.countdowns().start(
//!         "booking-17",
//!         5.0,
//!         |s| println!("{} left to respond", s.formatted_time),
//!         || println!("response window closed"),
//!     )?;
//!
//!     let rx = session
//!         .submit(
//!             Box::new(FnOperation::new("accept_booking", || async {
//!                 Ok(serde_json::json!({"status": "accepted"}))
//!             })),
//!             Priority::High,
//!         )
//!         .await?;
//!     println!("Result: {}", rx.await??);
//!
//!     session.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod countdown;
pub mod error;
pub mod event;
pub mod queue;
pub mod retry;
pub mod session;

pub use config::{CountdownConfig, QueueConfig};
pub use countdown::{format_time, BookingId, CountdownManager, CountdownSnapshot};
pub use error::{BookingError, Result};
pub use event::{events, EventEmitter, EventPayload, EventStream, SessionEvent};
pub use queue::{
    FnOperation, Operation, Priority, PriorityCounts, PriorityRequestQueue, QueueStats,
    RequestId, RequestReceiver,
};
pub use retry::RetryPolicy;
pub use session::{BookingSession, BookingSessionBuilder};

use serde::{Deserialize, Serialize};

/// Session statistics snapshot
///
/// # Fields
///
/// * `active_countdowns` - Number of countdowns currently ticking
/// * `queue` - Pending/in-flight breakdown of the request queue
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionStats {
    pub active_countdowns: usize,
    pub queue: QueueStats,
}
