//! # Domain Types for Conveyor
//!
//! This module defines the core types used throughout the pipeline: the event
//! envelope that travels over the log, the log-assigned message id, and the
//! four record kinds the delivery loop persists to the state store.
//!
//! ## Design Philosophy: Newtypes for Safety
//!
//! We use the "newtype pattern" for the identifiers - wrapping primitive types
//! in single-field structs. This provides:
//!
//! - **Type safety**: Can't accidentally pass an `EventId` where a
//!   [`MessageId`] is expected (they identify different things!)
//! - **Self-documenting code**: Function signatures tell you what they expect
//! - **Encapsulation**: Can add validation or change representation later
//!
//! ## Two Identities per Event
//!
//! Every event carries *two* identifiers, and confusing them is a classic bug:
//!
//! - [`EventId`]: generated by the producer, travels inside the envelope,
//!   stable across redeliveries of the same log entry.
//! - [`MessageId`]: assigned by the log on append, strictly increasing,
//!   identifies the *log entry*. Acknowledgment and retry state are keyed by
//!   this id, because redelivery happens at the log-entry level.
//!
//! A third identifier, [`IdempotencyKey`], is chosen by the *caller* and
//! identifies the logical operation across duplicate publishes.

use std::fmt;

use serde::{Deserialize, Serialize};

// =============================================================================
// Identifiers
// =============================================================================

/// A log-assigned position for an appended event.
///
/// # Invariants
///
/// - Strictly increases within a stream, never reused
/// - Starts at 1 (zero is invalid/sentinel)
/// - Distinct from the producer-generated [`EventId`]
///
/// Acknowledgments, retry records, and dead-letter records are all keyed by
/// this id: the log redelivers *entries*, not logical events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MessageId(u64);

impl MessageId {
    /// The first valid message id (1, not 0).
    pub const FIRST: MessageId = MessageId(1);

    /// Creates a MessageId from a raw value.
    ///
    /// # Panics
    ///
    /// Panics if `value` is 0. Use [`MessageId::from_raw_unchecked`] when
    /// reading from a trusted source (e.g. the store).
    pub fn from_raw(value: u64) -> Self {
        assert!(value > 0, "MessageId cannot be zero");
        Self(value)
    }

    /// Creates a MessageId without checking for zero.
    ///
    /// Caller must ensure `value > 0`; zero violates the log's invariants.
    pub fn from_raw_unchecked(value: u64) -> Self {
        Self(value)
    }

    /// Returns the raw u64 value for storage.
    pub fn as_raw(&self) -> u64 {
        self.0
    }

    /// Returns the next message id.
    pub fn next(&self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A producer-generated unique identifier for an event.
///
/// Generated once at publish time (a UUID), carried inside the envelope, and
/// returned to the caller of `publish`. Unlike [`MessageId`] it says nothing
/// about log position.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EventId(String);

impl EventId {
    /// Creates an EventId from an existing string (e.g. read back from a log).
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generates a fresh random event id.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Returns the string representation.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A caller-chosen identifier for a logical operation.
///
/// # Why the Caller Chooses It
///
/// The producer may publish the same logical operation more than once (retry
/// after a timeout, a duplicate request, at-least-once delivery upstream).
/// Only the caller knows that two publishes *mean* the same operation, so the
/// caller picks the key and the consumer collapses duplicates on it.
///
/// At most one Processed Record will ever exist per key - that record is the
/// sole source of truth for "this work is done, do not redo it".
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IdempotencyKey(String);

impl IdempotencyKey {
    /// Creates a new idempotency key.
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// Returns the string representation.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns true if the key is empty (rejected at the publish boundary).
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for IdempotencyKey {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for IdempotencyKey {
    fn from(s: String) -> Self {
        Self(s)
    }
}

// =============================================================================
// Event Envelope
// =============================================================================

/// The canonical event envelope appended to the log.
///
/// Created only by the producer; immutable once appended. The payload is kept
/// serialized - the pipeline is payload-agnostic until the consumer parses it
/// at dispatch time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventEnvelope {
    /// Producer-generated unique id.
    pub event_id: EventId,

    /// String tag classifying the event (e.g. "booking.created").
    pub event_type: String,

    /// Caller-supplied key identifying the logical operation.
    pub idempotency_key: IdempotencyKey,

    /// Serialized payload (JSON text).
    pub payload: String,

    /// Producer timestamp, Unix milliseconds.
    pub occurred_at_ms: u64,
}

/// An envelope as delivered by the log: the log-assigned id plus the envelope.
#[derive(Debug, Clone)]
pub struct LogEntry {
    /// Log-assigned monotonic id; the unit of acknowledgment and retry state.
    pub id: MessageId,

    /// The immutable envelope the producer appended.
    pub envelope: EventEnvelope,

    /// How many times the log has handed this entry to a consumer.
    pub delivery_count: u32,
}

// =============================================================================
// Store Records
// =============================================================================

/// Terminal status of a Processed Record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessedStatus {
    /// The side effect ran to completion.
    Processed,
    /// Reserved for operations completed with a business-level failure.
    Failed,
}

impl ProcessedStatus {
    /// Returns the status as stored in the database.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Processed => "PROCESSED",
            Self::Failed => "FAILED",
        }
    }

    /// Parses a stored status string.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PROCESSED" => Some(Self::Processed),
            "FAILED" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// One row per *successfully completed* logical operation.
///
/// Its existence is the durable truth that the operation's side effect ran;
/// the unique indexes on both `stream_message_id` and `idempotency_key` are
/// the only cross-instance synchronization the pipeline relies on. Never
/// mutated, never deleted.
#[derive(Debug, Clone)]
pub struct ProcessedRecord {
    pub stream_message_id: MessageId,
    pub idempotency_key: String,
    pub event_type: String,
    pub status: ProcessedStatus,
    pub processed_at_ms: u64,
}

/// Status of a Retry Record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryStatus {
    /// Failure budget remains; the entry is waiting out its backoff.
    Retrying,
    /// Budget exhausted; permanent marker so the entry is never retried
    /// again, even if the log redelivers it.
    Dead,
}

impl RetryStatus {
    /// Returns the status as stored in the database.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Retrying => "RETRYING",
            Self::Dead => "DEAD",
        }
    }

    /// Parses a stored status string.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "RETRYING" => Some(Self::Retrying),
            "DEAD" => Some(Self::Dead),
            _ => None,
        }
    }
}

/// One row per log entry currently in a failed/retrying/dead state.
///
/// Created on first failure, upserted (count incremented, `next_retry_at_ms`
/// advanced) on each subsequent failure, deleted once the entry is eventually
/// processed, left in place with [`RetryStatus::Dead`] after escalation.
#[derive(Debug, Clone)]
pub struct RetryRecord {
    pub stream_message_id: MessageId,
    pub idempotency_key: String,
    pub retry_count: u32,
    pub last_error: String,
    pub next_retry_at_ms: u64,
    pub status: RetryStatus,
}

/// Append-only audit row for a permanently failed event.
#[derive(Debug, Clone)]
pub struct DeadLetterRecord {
    pub event_type: String,
    pub source_message_id: MessageId,
    pub payload: String,
    pub created_at_ms: u64,
}

/// The materialized side effect of processing an event (a read-model row).
///
/// Creating this row is the "work" the idempotency gate makes
/// effectively-once.
#[derive(Debug, Clone)]
pub struct ProjectionRecord {
    pub event_type: String,
    pub source_message_id: MessageId,
    pub payload: String,
    pub created_at_ms: u64,
}

// =============================================================================
// Tests
// =============================================================================
