//! Error types for booking countdowns and the request queue
//!
//! All errors implement the `std::error::Error` trait via `thiserror::Error`.
//!
//! # Error Handling
//!
//! The [`BookingError`] enum covers:
//! - Wrapped operation failures surfaced through the request queue
//! - The synthetic "queue cleared" failure delivered by `clear()`
//! - Invalid countdown input and invalid configuration
//!
//! # Example
//!
//! ```rust,ignore
//! use booking_lane::{BookingError, Priority};
//!
//! let rx = queue.enqueue(op, Priority::High).await;
//! match rx.await {
//!     Ok(Ok(value)) => { /* handle success */ },
//!     Ok(Err(BookingError::QueueCleared)) => {
//!         // the queue was wiped before this request ran
//!     },
//!     Ok(Err(e)) => eprintln!("Request failed: {}", e),
//!     Err(_) => eprintln!("Queue dropped"),
//! }
//! ```

use thiserror::Error;

/// Booking utilities error type
///
/// # Variants
///
/// * `OperationFailed` - A wrapped operation returned a failure
/// * `QueueCleared` - The request was still pending when the queue was cleared
/// * `Timeout` - An operation exceeded the configured per-operation timeout
/// * `InvalidCountdown` - A countdown was started with unusable input
/// * `ConfigError` - Invalid configuration (e.g., zero concurrency)
/// * `ShutdownInProgress` - The session is shutting down
/// * `Other` - Catch-all for unexpected errors
#[derive(Error, Debug)]
pub enum BookingError {
    /// Wrapped operation failure
    #[error("Operation failed: {0}")]
    OperationFailed(String),

    /// Pending request removed by `clear()`
    #[error("Request queue cleared before the request was dispatched")]
    QueueCleared,

    /// Operation timeout
    #[error("Operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// Invalid countdown input
    #[error("Invalid countdown: {0}")]
    InvalidCountdown(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Shutdown in progress
    #[error("Session is shutting down, not accepting new requests")]
    ShutdownInProgress,

    /// Other error
    #[error("{0}")]
    Other(String),
}

impl BookingError {
    /// True when the failure came from `clear()` rather than the operation itself
    pub fn is_queue_cleared(&self) -> bool {
        matches!(self, BookingError::QueueCleared)
    }
}

/// Result type alias using BookingError
pub type Result<T> = std::result::Result<T, BookingError>;
