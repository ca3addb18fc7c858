//! Booking flow example
//!
//! Simulates a customer waiting on a therapist's response:
//! - A response-window countdown is started for the booking
//! - Backend calls are pushed through the priority request queue
//! - A flaky high-priority call is retried automatically
//! - The session is torn down at the end

use async_trait::async_trait;
use booking_lane::{
    events, BookingError, BookingSessionBuilder, CountdownConfig, EventEmitter, FnOperation,
    Operation, Priority, QueueConfig, Result,
};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::time::Duration;

/// Fake call to the hosted backend that fails its first attempt
struct AcceptBooking {
    booking_id: String,
    attempts: Arc<AtomicU32>,
}

#[async_trait]
impl Operation for AcceptBooking {
    async fn execute(&self) -> Result<serde_json::Value> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(50)).await;
        if attempt == 0 {
            return Err(BookingError::OperationFailed(
                "backend returned 503".to_string(),
            ));
        }
        Ok(serde_json::json!({
            "booking_id": self.booking_id,
            "status": "accepted",
            "attempts": attempt + 1,
        }))
    }

    fn operation_type(&self) -> &str {
        "accept_booking"
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    println!("=== Booking Lane: Booking Flow Example ===\n");

    // Shorten the tick so the demo finishes quickly
    let session = BookingSessionBuilder::new(EventEmitter::new(256))
        .with_queue_config(QueueConfig::new(2))
        .with_countdown_config(
            CountdownConfig::default().with_tick_interval(Duration::from_millis(20)),
        )
        .build()?;

    let mut expirations = session.subscribe_filtered(|e| e.key == events::COUNTDOWN_EXPIRED);

    session.countdowns().start(
        "booking-17",
        0.1,
        |snapshot| println!("  ⏱  booking-17: {} left", snapshot.formatted_time),
        || println!("  ✗ booking-17: therapist response window closed"),
    )?;
    println!("✓ Countdown started for booking-17\n");

    println!("Submitting backend calls...");
    let mut receivers = Vec::new();
    for (label, priority) in [
        ("load_chat_history", Priority::Low),
        ("refresh_therapist_profile", Priority::Medium),
        ("load_spa_listing", Priority::Low),
    ] {
        let rx = session
            .submit(
                Box::new(FnOperation::new(label, move || async move {
                    tokio::time::sleep(Duration::from_millis(30)).await;
                    Ok(serde_json::json!({ "call": label }))
                })),
                priority,
            )
            .await?;
        receivers.push((label.to_string(), rx));
        println!("  → {} ({})", label, priority);
    }

    let rx = session
        .submit(
            Box::new(AcceptBooking {
                booking_id: "booking-17".to_string(),
                attempts: Arc::new(AtomicU32::new(0)),
            }),
            Priority::High,
        )
        .await?;
    receivers.push(("accept_booking".to_string(), rx));
    println!("  → accept_booking ({})", Priority::High);

    let stats = session.stats().await;
    println!(
        "\nQueue: {} waiting, {} in flight\n",
        stats.queue.total, stats.queue.active
    );

    for (label, rx) in receivers {
        match rx.await {
            Ok(Ok(value)) => println!("✓ {}: {}", label, value),
            Ok(Err(e)) => eprintln!("✗ {}: {}", label, e),
            Err(e) => eprintln!("✗ {}: channel error {}", label, e),
        }
    }

    if let Some(event) = expirations.recv().await {
        println!("\nEvent: {} at {}", event.key, event.timestamp);
    }

    println!("\n=== Shutting Down ===");
    session.shutdown().await;
    session.requests().wait_idle(Duration::from_secs(5)).await?;
    println!("✓ Shutdown complete");

    Ok(())
}
