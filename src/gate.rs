//! # Idempotency & Side-Effect Gate
//!
//! The gate decides, per message, whether the work behind it has already been
//! done, and performs the side effect exactly once if not:
//!
//! 1. Look up the Processed Record by idempotency key. Found → no-op: the
//!    caller still acknowledges the message, but no side effect runs and no
//!    new record is written.
//! 2. Honor the deliberate-failure flag (`"forced_fail": true` in the
//!    payload) *before* any side effect, so the retry path can be exercised
//!    without persistent writes.
//! 3. Create the Projection Record (the side effect), then the Processed
//!    Record.
//!
//! ## The Known Race
//!
//! The lookup and the two writes are not one transaction. Two concurrent
//! deliveries of the same key (a second consumer instance, or a redelivery
//! racing a not-yet-committed ack) can both pass the lookup; the loser's
//! processed insert is then rejected by the unique index and mapped to the
//! benign [`Applied::AlreadyProcessed`] outcome. The *observable* effect -
//! exactly one Processed Record per key - holds either way, but the
//! projection write itself may have run twice in that window. If the
//! projection must be exactly-once too, the surrounding business logic has
//! to make it idempotent (e.g. upsert semantics); the engine does not.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::clock::Clock;
use crate::error::{Error, Result};
use crate::store::StateStore;
use crate::types::{LogEntry, ProcessedRecord, ProcessedStatus, ProjectionRecord};

/// What the gate did with a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    /// The side effect ran and the operation is now recorded as processed.
    Performed,
    /// The operation was already recorded; nothing was (re)done.
    AlreadyProcessed,
}

/// Applies a message's side effect effectively once.
pub struct SideEffectGate {
    store: Arc<StateStore>,
    clock: Arc<dyn Clock>,
}

impl SideEffectGate {
    /// Creates a gate over the given store.
    pub fn new(store: Arc<StateStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Runs the gate for one delivered entry with its parsed payload.
    ///
    /// Returns [`Applied`] on the success paths; any error is a per-message
    /// processing failure the caller routes to the retry scheduler.
    pub async fn apply(&self, entry: &LogEntry, payload: &serde_json::Value) -> Result<Applied> {
        let envelope = &entry.envelope;
        let key = envelope.idempotency_key.as_str();

        if self.store.find_processed_by_key(key).await?.is_some() {
            debug!(id = %entry.id, key, "skipping already processed operation");
            return Ok(Applied::AlreadyProcessed);
        }

        if payload.get("forced_fail").and_then(|v| v.as_bool()) == Some(true) {
            return Err(Error::Processing {
                message: "forced failure requested by producer".to_string(),
            });
        }

        let now_ms = self.clock.now_ms();
        self.store
            .insert_projection(&ProjectionRecord {
                event_type: envelope.event_type.clone(),
                source_message_id: entry.id,
                payload: payload.to_string(),
                created_at_ms: now_ms,
            })
            .await?;

        let processed = ProcessedRecord {
            stream_message_id: entry.id,
            idempotency_key: key.to_string(),
            event_type: envelope.event_type.clone(),
            status: ProcessedStatus::Processed,
            processed_at_ms: now_ms,
        };
        match self.store.insert_processed(&processed).await {
            Ok(()) => Ok(Applied::Performed),
            Err(Error::AlreadyProcessed { .. }) => {
                // Lost the check-then-act race to a concurrent delivery. The
                // durable truth is intact; our projection write was the
                // duplicate the module docs warn about.
                warn!(id = %entry.id, key, "concurrent duplicate delivery detected by unique index");
                Ok(Applied::AlreadyProcessed)
            }
            Err(e) => Err(e),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
