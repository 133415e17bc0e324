//! # The Delivery Loop
//!
//! The scheduling core of the pipeline. Each cycle merges newly available
//! and previously-delivered-but-unacknowledged entries into one ordered
//! batch, then dispatches them sequentially through the idempotency gate and
//! the retry scheduler:
//!
//! ```text
//! ┌──────────────────────────── one cycle ─────────────────────────────┐
//! │                                                                    │
//! │   read_new (blocking ≤ timeout) ─┐                                 │
//! │                                  ├─ join ─▶ merge, sort by id      │
//! │   read_pending (non-blocking) ───┘             │                   │
//! │                                                ▼                   │
//! │              ┌──────────────── per entry, in order ─────────────┐  │
//! │              │ shutdown requested?        → stop, stay pending  │  │
//! │              │ retry record DEAD?         → re-ack, skip        │  │
//! │              │ next_retry_at in future?   → skip, no ack        │  │
//! │              │ parse + gate               → ack, clear retry    │  │
//! │              │   └─ on failure            → retry scheduler     │  │
//! │              │        └─ RETRY: no ack    / DEAD: ack           │  │
//! │              └──────────────────────────────────────────────────┘  │
//! └────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Why No Timer Thread
//!
//! Backoff is realized by *skipping without acknowledging*: an entry whose
//! `next_retry_at_ms` lies in the future simply stays in the pending set and
//! is re-evaluated on a later cycle. The pending read re-surfaces it every
//! cycle until it is due.
//!
//! ## Failure Isolation
//!
//! The two fetches are joined, not chained - a failure on either side must
//! not silently drop the other side's results. Only when *both* fail does
//! the cycle itself fail, and then the loop pauses briefly and tries again;
//! a log outage never kills the consumer. Per-message failures are converted
//! into retry state by the scheduler and never escape the dispatch step.
//!
//! Dispatch is strictly sequential within a loop instance: ordering
//! guarantees are per-consumer, never global. Cross-instance safety comes
//! from the idempotency gate and the store's unique indexes alone.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::clock::Clock;
use crate::config::PipelineConfig;
use crate::error::{Error, Result};
use crate::gate::{Applied, SideEffectGate};
use crate::log::EventLog;
use crate::retry::{RetryDecision, RetryScheduler};
use crate::store::StateStore;
use crate::types::{LogEntry, MessageId, RetryStatus};

// =============================================================================
// Bootstrap
// =============================================================================

/// Ensures the durable consumer group exists before consumption starts.
///
/// "Already exists" is success - bootstrap is idempotent across restarts and
/// across multiple instances racing to start. Any other failure is fatal and
/// surfaces as [`Error::Bootstrap`].
pub async fn ensure_group(log: &dyn EventLog, stream: &str, group: &str) -> Result<()> {
    match log.create_group(stream, group).await {
        Ok(()) => {
            info!(stream, group, "consumer group created");
            Ok(())
        }
        Err(Error::GroupAlreadyExists { .. }) => {
            debug!(stream, group, "consumer group already exists");
            Ok(())
        }
        Err(e) => Err(Error::Bootstrap {
            message: format!("creating consumer group '{group}' on stream '{stream}': {e}"),
        }),
    }
}

// =============================================================================
// DeliveryLoop
// =============================================================================

/// One consumer instance's delivery loop.
///
/// Runs until the cancellation token fires; termination is observable
/// through the task handle of [`run`](DeliveryLoop::run). Several instances
/// (distinct consumer names, shared group) may run against the same log and
/// store.
pub struct DeliveryLoop {
    log: Arc<dyn EventLog>,
    store: Arc<StateStore>,
    gate: SideEffectGate,
    scheduler: RetryScheduler,
    clock: Arc<dyn Clock>,
    config: PipelineConfig,
    cancel: CancellationToken,
}

impl DeliveryLoop {
    /// Creates a loop; nothing runs until [`run`](Self::run) is awaited.
    pub fn new(
        log: Arc<dyn EventLog>,
        store: Arc<StateStore>,
        config: PipelineConfig,
        cancel: CancellationToken,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let gate = SideEffectGate::new(Arc::clone(&store), Arc::clone(&clock));
        let scheduler = RetryScheduler::new(Arc::clone(&store), config.max_retries);
        Self {
            log,
            store,
            gate,
            scheduler,
            clock,
            config,
            cancel,
        }
    }

    /// Runs cycles until shutdown is requested.
    ///
    /// A cycle-level failure (log unreachable) is logged and followed by a
    /// fixed pause so a dead log doesn't produce a tight error loop.
    pub async fn run(self) {
        info!(
            stream = %self.config.stream,
            group = %self.config.group,
            consumer = %self.config.consumer,
            "delivery loop started, waiting for events"
        );
        while !self.cancel.is_cancelled() {
            if let Err(e) = self.cycle().await {
                error!(error = %e, "delivery cycle failed");
                tokio::select! {
                    _ = self.cancel.cancelled() => break,
                    _ = tokio::time::sleep(self.config.cycle_retry_pause) => {}
                }
            }
        }
        info!(consumer = %self.config.consumer, "delivery loop stopped");
    }

    /// One fetch-merge-dispatch cycle.
    async fn cycle(&self) -> Result<()> {
        let (new_entries, pending_entries) = tokio::join!(
            self.log.read_new(
                &self.config.stream,
                &self.config.group,
                &self.config.consumer,
                self.config.read_batch_size,
                self.config.block_timeout,
            ),
            self.log.read_pending(
                &self.config.stream,
                &self.config.group,
                &self.config.consumer,
                self.config.read_batch_size,
            ),
        );
        let batch = merge_batches(new_entries, pending_entries)?;

        for entry in &batch {
            if self.cancel.is_cancelled() {
                // Undispatched entries stay pending; safe to redeliver later.
                debug!(id = %entry.id, "shutdown requested mid-batch, leaving remaining entries pending");
                break;
            }
            self.dispatch(entry).await?;
        }
        Ok(())
    }

    /// Applies per-message policy to one delivered entry.
    async fn dispatch(&self, entry: &LogEntry) -> Result<()> {
        let now_ms = self.clock.now_ms();

        if let Some(record) = self.store.find_retry(entry.id).await? {
            match record.status {
                RetryStatus::Dead => {
                    // Permanent marker: the entry was dead-lettered but the
                    // ack may not have landed before a crash. Never process
                    // it again; just stop the redelivery.
                    warn!(id = %entry.id, "dead entry redelivered, re-acknowledging without processing");
                    self.ack(entry.id).await?;
                    return Ok(());
                }
                RetryStatus::Retrying if record.next_retry_at_ms > now_ms => {
                    // Backoff not elapsed: no ack, stays pending.
                    return Ok(());
                }
                RetryStatus::Retrying => {}
            }
        }

        match self.process(entry).await {
            Ok(applied) => {
                self.ack(entry.id).await?;
                self.store.delete_retry(entry.id).await?;
                match applied {
                    Applied::Performed => {
                        info!(
                            id = %entry.id,
                            key = %entry.envelope.idempotency_key,
                            "event processed and acknowledged"
                        );
                    }
                    Applied::AlreadyProcessed => {
                        info!(
                            id = %entry.id,
                            key = %entry.envelope.idempotency_key,
                            "duplicate delivery acknowledged without effect"
                        );
                    }
                }
            }
            Err(failure) => {
                // Parse and side-effect failures both land here; the
                // scheduler decides between backoff and dead-letter.
                match self.scheduler.on_failure(entry, &failure, now_ms).await? {
                    RetryDecision::Dead => {
                        // A dead entry must never re-enter the pending set.
                        self.ack(entry.id).await?;
                    }
                    RetryDecision::Retry { .. } => {
                        // No ack: the entry stays pending for a later cycle.
                    }
                }
            }
        }
        Ok(())
    }

    async fn process(&self, entry: &LogEntry) -> Result<Applied> {
        let payload: serde_json::Value = serde_json::from_str(&entry.envelope.payload)?;
        self.gate.apply(entry, &payload).await
    }

    async fn ack(&self, id: MessageId) -> Result<()> {
        self.log
            .ack(&self.config.stream, &self.config.group, id)
            .await
    }
}

// =============================================================================
// Merge
// =============================================================================

/// Merges the two fetch results into one id-ordered batch.
///
/// One side failing is tolerated (the other side's entries still get
/// dispatched); both failing fails the cycle. Entries racing into both sets
/// are collapsed by id.
fn merge_batches(
    new: Result<Vec<LogEntry>>,
    pending: Result<Vec<LogEntry>>,
) -> Result<Vec<LogEntry>> {
    let mut batch = match (new, pending) {
        (Ok(mut new), Ok(pending)) => {
            new.extend(pending);
            new
        }
        (Ok(new), Err(e)) => {
            warn!(error = %e, "pending-entry fetch failed, continuing with new entries only");
            new
        }
        (Err(e), Ok(pending)) => {
            warn!(error = %e, "new-entry fetch failed, continuing with pending entries only");
            pending
        }
        (Err(e), Err(other)) => {
            debug!(error = %other, "both fetches failed");
            return Err(e);
        }
    };
    batch.sort_by_key(|entry| entry.id);
    batch.dedup_by_key(|entry| entry.id);
    Ok(batch)
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{EventEnvelope, EventId};

    fn entry(id: u64) -> LogEntry {
        LogEntry {
            id: MessageId::from_raw(id),
            envelope: EventEnvelope {
                event_id: EventId::generate(),
                event_type: "test.event".to_string(),
                idempotency_key: format!("key-{id}").into(),
                payload: "{}".to_string(),
                occurred_at_ms: 0,
            },
            delivery_count: 1,
        }
    }

    #[test]
    fn test_merge_orders_by_id_across_sets() {
        let merged = merge_batches(Ok(vec![entry(5), entry(7)]), Ok(vec![entry(2), entry(6)])).unwrap();
        let ids: Vec<u64> = merged.iter().map(|e| e.id.as_raw()).collect();
        assert_eq!(ids, vec![2, 5, 6, 7]);
    }

    #[test]
    fn test_merge_collapses_entries_seen_in_both_sets() {
        let merged = merge_batches(Ok(vec![entry(3)]), Ok(vec![entry(3)])).unwrap();
        assert_eq!(merged.len(), 1);
    }

    #[test]
    fn test_merge_survives_one_sided_failure() {
        let failed = || {
            Err(Error::LogUnavailable {
                message: "down".to_string(),
            })
        };
        let merged = merge_batches(failed(), Ok(vec![entry(1)])).unwrap();
        assert_eq!(merged.len(), 1);
        let merged = merge_batches(Ok(vec![entry(2)]), failed()).unwrap();
        assert_eq!(merged.len(), 1);
    }

    #[test]
    fn test_merge_fails_only_when_both_fetches_fail() {
        let failed = || {
            Err(Error::LogUnavailable {
                message: "down".to_string(),
            })
        };
        assert!(matches!(
            merge_batches(failed(), failed()),
            Err(Error::LogUnavailable { .. })
        ));
    }
}
