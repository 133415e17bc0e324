//! # Conveyor - Reliable Event Pipeline Runtime
//!
//! Conveyor is an event-processing pipeline built around one hard problem:
//! delivering each event's side effect *effectively once* over
//! infrastructure that only promises at-least-once, without transactional
//! coupling between the log and the store.
//!
//! - **Durable ordered log**: events are appended once, consumed through a
//!   shared consumer-group cursor
//! - **Idempotent side effects**: duplicate deliveries collapse on a
//!   caller-chosen idempotency key
//! - **Bounded retries**: failures back off exponentially (capped at 30 s)
//!   under a global retry budget
//! - **Dead-lettering**: permanently failing events are audited and taken
//!   out of circulation, never silently dropped
//! - **Cooperative shutdown**: draining never loses or duplicates work
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────┐   append    ┌─────────────────────────────────────┐
//! │   Producer   │────────────▶│            Event Log                │
//! │  (publish)   │             │  stream · group cursor · pending    │
//! └──────────────┘             └──────────────┬──────────────────────┘
//!                                  new + pending reads │ ▲ ack
//!                                                      ▼ │
//!                              ┌─────────────────────────┴───────────┐
//!                              │          Delivery Loop              │
//!                              │  merge → idempotency gate → effect  │
//!                              │        └─ retry scheduler ─┐        │
//!                              └──────────────┬─────────────┼────────┘
//!                                             ▼             ▼
//!                              ┌──────────────────────────────────────┐
//!                              │          State Store (SQLite)        │
//!                              │ processed · retry · dead-letter ·    │
//!                              │ projections (unique keys enforced)   │
//!                              └──────────────────────────────────────┘
//! ```
//!
//! ## Core Invariants
//!
//! 1. **At most one Processed Record per idempotency key, ever** - its
//!    existence is the sole source of truth for "do not redo this effect"
//! 2. **A message is acknowledged only after its work is recorded** (or
//!    after it is dead-lettered); anything else stays pending and redelivers
//! 3. **A dead entry never re-enters circulation**, even if redelivered -
//!    the `DEAD` retry record is a permanent marker
//! 4. **No two side effects from one loop instance run concurrently**;
//!    cross-instance safety rests on the store's unique indexes alone
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use conveyor::{EventLog, MemoryLog, Pipeline, PipelineConfig, StateStore};
//!
//! #[tokio::main]
//! async fn main() -> conveyor::Result<()> {
//!     let log: Arc<dyn EventLog> = Arc::new(MemoryLog::new());
//!     let store = Arc::new(StateStore::open("conveyor.db")?);
//!     let pipeline = Pipeline::start(log, store, PipelineConfig::from_env()).await?;
//!
//!     let event_id = pipeline
//!         .publish(
//!             "booking.created",
//!             &serde_json::json!({ "bookingId": "b-1", "seats": 2 }),
//!             "idemp-b-1",
//!         )
//!         .await?;
//!     println!("published {event_id}");
//!
//!     pipeline.shutdown().await;
//!     Ok(())
//! }
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

/// Wall-clock abstraction so retry windows are testable.
pub mod clock;

/// Operational parameters (stream/group identity, batch size, budgets).
pub mod config;

/// The delivery loop and consumer-group bootstrap.
pub mod consumer;

/// Error types for pipeline operations.
pub mod error;

/// The idempotency & side-effect gate.
pub mod gate;

/// The event-log contract and the in-process implementation.
pub mod log;

/// The pipeline handle: wiring, publish boundary, shutdown coordination.
pub mod pipeline;

/// The event producer (envelope construction and append).
pub mod producer;

/// Retry scheduling, backoff, and dead-letter escalation.
pub mod retry;

/// The SQLite-backed state store.
pub mod store;

/// Domain types: envelope, identifiers, store records.
pub mod types;

// =============================================================================
// Re-exports
// =============================================================================

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::PipelineConfig;
pub use consumer::{ensure_group, DeliveryLoop};
pub use error::{Error, Result};
pub use gate::{Applied, SideEffectGate};
pub use log::{EventLog, MemoryLog};
pub use pipeline::Pipeline;
pub use producer::EventProducer;
pub use retry::{backoff_ms, RetryDecision, RetryScheduler, MAX_BACKOFF_MS};
pub use store::StateStore;
pub use types::{
    DeadLetterRecord, EventEnvelope, EventId, IdempotencyKey, LogEntry, MessageId,
    ProcessedRecord, ProcessedStatus, ProjectionRecord, RetryRecord, RetryStatus,
};
