//! # Event Producer
//!
//! Builds the canonical envelope and appends it to the shared log. The
//! producer promises *at-least-once* production: if `publish` fails the
//! caller may retry freely, and if the retry double-appends, the consumer's
//! idempotency gate collapses the duplicates on the caller's key. That is
//! why the idempotency key is a required argument and not an optional nicety.

use std::sync::Arc;

use tracing::debug;

use crate::clock::Clock;
use crate::error::{Error, Result};
use crate::log::EventLog;
use crate::types::{EventEnvelope, EventId, IdempotencyKey};

/// Appends canonical event envelopes to a stream.
pub struct EventProducer {
    log: Arc<dyn EventLog>,
    stream: String,
    clock: Arc<dyn Clock>,
}

impl EventProducer {
    /// Creates a producer appending to `stream`.
    pub fn new(log: Arc<dyn EventLog>, stream: impl Into<String>, clock: Arc<dyn Clock>) -> Self {
        Self {
            log,
            stream: stream.into(),
            clock,
        }
    }

    /// Publishes a logical event.
    ///
    /// Generates a fresh [`EventId`], serializes the payload, stamps the
    /// envelope, and appends it; the entry is visible to the consumer group
    /// from the next read cycle onward. Fails with [`Error::InvalidEvent`]
    /// for an empty type or key, and [`Error::Publish`] when the log append
    /// fails (caller's call whether to retry).
    pub async fn publish(
        &self,
        event_type: &str,
        payload: &serde_json::Value,
        idempotency_key: impl Into<IdempotencyKey>,
    ) -> Result<EventId> {
        let idempotency_key = idempotency_key.into();
        if event_type.is_empty() {
            return Err(Error::InvalidEvent {
                message: "event_type must not be empty".to_string(),
            });
        }
        if idempotency_key.is_empty() {
            return Err(Error::InvalidEvent {
                message: "idempotency_key must not be empty".to_string(),
            });
        }

        let envelope = EventEnvelope {
            event_id: EventId::generate(),
            event_type: event_type.to_string(),
            idempotency_key,
            payload: payload.to_string(),
            occurred_at_ms: self.clock.now_ms(),
        };

        let id = self
            .log
            .append(&self.stream, &envelope)
            .await
            .map_err(|e| Error::Publish {
                message: e.to_string(),
            })?;
        debug!(
            stream = %self.stream,
            id = %id,
            event_id = %envelope.event_id,
            key = %envelope.idempotency_key,
            "event published"
        );
        Ok(envelope.event_id)
    }
}

// =============================================================================
// Tests
// =============================================================================
