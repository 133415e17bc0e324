//! # Retry Scheduling & Dead-Letter Escalation
//!
//! When a message fails, the scheduler decides between two transitions:
//!
//! ```text
//!             failure #n (n < budget)            failure #budget
//! (pending) ──────────────────────▶ RETRYING ──────────────────▶ DEAD
//!               backoff 2^n s, cap 30 s          dead-letter row,
//!               entry stays pending              entry acknowledged
//! ```
//!
//! Backoff is realized *without a timer thread*: the scheduler persists
//! `next_retry_at_ms` and the delivery loop skips the entry (leaving it
//! pending) until a later cycle finds the deadline elapsed.
//!
//! A `DEAD` retry record is never removed. It doubles as a permanent marker:
//! if the log somehow redelivers an escalated entry (crash between the
//! dead-letter write and the acknowledgment), the loop sees the marker and
//! re-acks without processing.

use std::sync::Arc;

use tracing::{error, warn};

use crate::error::{Error, Result};
use crate::store::StateStore;
use crate::types::{DeadLetterRecord, LogEntry, RetryRecord, RetryStatus};

// =============================================================================
// Backoff
// =============================================================================

/// Base delay for the first retry, in milliseconds.
pub const BASE_BACKOFF_MS: u64 = 1_000;

/// Ceiling on the backoff delay, in milliseconds.
pub const MAX_BACKOFF_MS: u64 = 30_000;

/// Exponential backoff delay for the given retry count: `2^n` seconds,
/// capped at 30 seconds.
pub fn backoff_ms(retry_count: u32) -> u64 {
    let factor = 1u64.checked_shl(retry_count).unwrap_or(u64::MAX);
    BASE_BACKOFF_MS.saturating_mul(factor).min(MAX_BACKOFF_MS)
}

// =============================================================================
// Scheduler
// =============================================================================

/// Outcome of a failure report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Budget remains: the entry must stay pending (no ack) until
    /// `next_retry_at_ms`.
    Retry {
        /// When the entry becomes eligible for reprocessing.
        next_retry_at_ms: u64,
    },
    /// Budget exhausted: the entry was dead-lettered and must be
    /// acknowledged so it never re-enters the pending set.
    Dead,
}

/// Persists retry state and decides dead-letter escalation.
pub struct RetryScheduler {
    store: Arc<StateStore>,
    max_retries: u32,
}

impl RetryScheduler {
    /// Creates a scheduler with the given global retry budget.
    pub fn new(store: Arc<StateStore>, max_retries: u32) -> Self {
        Self { store, max_retries }
    }

    /// Records a failed delivery of `entry` and returns what the loop must
    /// do with the log message.
    ///
    /// Reads the current retry count (absent record counts as zero), bumps
    /// it, and either schedules the next attempt or escalates. All writes go
    /// through the store's upsert, so repeated failures converge to one row.
    pub async fn on_failure(
        &self,
        entry: &LogEntry,
        error: &Error,
        now_ms: u64,
    ) -> Result<RetryDecision> {
        let previous = self
            .store
            .find_retry(entry.id)
            .await?
            .map(|record| record.retry_count)
            .unwrap_or(0);
        let retry_count = previous + 1;
        let envelope = &entry.envelope;

        if retry_count >= self.max_retries {
            // Out of budget: audit the event, leave a permanent DEAD marker.
            self.store
                .insert_dead_letter(&DeadLetterRecord {
                    event_type: envelope.event_type.clone(),
                    source_message_id: entry.id,
                    payload: envelope.payload.clone(),
                    created_at_ms: now_ms,
                })
                .await?;
            self.store
                .upsert_retry(&RetryRecord {
                    stream_message_id: entry.id,
                    idempotency_key: envelope.idempotency_key.as_str().to_string(),
                    retry_count,
                    last_error: error.to_string(),
                    next_retry_at_ms: now_ms,
                    status: RetryStatus::Dead,
                })
                .await?;
            error!(
                id = %entry.id,
                key = %envelope.idempotency_key,
                failures = retry_count,
                "retry budget exhausted, event dead-lettered"
            );
            Ok(RetryDecision::Dead)
        } else {
            let delay_ms = backoff_ms(retry_count);
            let next_retry_at_ms = now_ms + delay_ms;
            self.store
                .upsert_retry(&RetryRecord {
                    stream_message_id: entry.id,
                    idempotency_key: envelope.idempotency_key.as_str().to_string(),
                    retry_count,
                    last_error: error.to_string(),
                    next_retry_at_ms,
                    status: RetryStatus::Retrying,
                })
                .await?;
            warn!(
                id = %entry.id,
                key = %envelope.idempotency_key,
                attempt = retry_count,
                max = self.max_retries,
                delay_ms,
                "processing failed, retry scheduled"
            );
            Ok(RetryDecision::Retry { next_retry_at_ms })
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
