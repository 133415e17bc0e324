//! # The Event Log Contract
//!
//! The pipeline consumes an append-only, ordered log through a consumer-group
//! cursor. The log itself is an external collaborator - this module pins down
//! exactly the contract the engine relies on ([`EventLog`]) and provides an
//! in-process implementation ([`MemoryLog`]) for embedded use and tests.
//!
//! ## The Contract
//!
//! - **Append** with an auto-assigned, strictly increasing [`MessageId`].
//! - **Group creation** starting at the beginning of the stream, creating the
//!   stream if absent; creating an existing group fails with
//!   [`Error::GroupAlreadyExists`] (the bootstrapper maps that to success).
//! - **Read new**: up to N entries not yet delivered to the group, with a
//!   bounded blocking wait while none exist. Delivered entries enter the
//!   consumer's pending set.
//! - **Read pending**: up to N entries already delivered to *this consumer*
//!   but not yet acknowledged, non-blocking. Each redelivery increments the
//!   entry's delivery count.
//! - **Acknowledge** by message id, removing the entry from the pending set.
//!   Acking an unknown or already-acked id is a no-op.
//!
//! A production deployment would put a Redis-Streams (or similar) client
//! behind this trait; the delivery loop never sees the difference.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::error::{Error, Result};
use crate::types::{EventEnvelope, LogEntry, MessageId};

// =============================================================================
// EventLog Trait
// =============================================================================

/// Group-based consumption contract over an append-only ordered log.
#[async_trait]
pub trait EventLog: Send + Sync {
    /// Appends an envelope to `stream`, creating the stream if absent.
    ///
    /// Returns the log-assigned message id. The entry becomes visible to
    /// consumer groups from the next read cycle onward.
    async fn append(&self, stream: &str, envelope: &EventEnvelope) -> Result<MessageId>;

    /// Creates a durable consumer group on `stream`, positioned at the
    /// beginning, creating the stream if absent.
    ///
    /// Fails with [`Error::GroupAlreadyExists`] if the group is already
    /// present; callers bootstrapping idempotently should treat that as
    /// success (see `consumer::ensure_group`).
    async fn create_group(&self, stream: &str, group: &str) -> Result<()>;

    /// Reads up to `count` entries not yet delivered to `group`.
    ///
    /// Entries returned here are recorded as pending for `consumer` until
    /// acknowledged. If no new entries exist, waits up to `block` for one to
    /// arrive before returning an empty batch.
    async fn read_new(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> Result<Vec<LogEntry>>;

    /// Reads up to `count` entries already delivered to `consumer` but not
    /// yet acknowledged, in id order. Never blocks.
    async fn read_pending(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
    ) -> Result<Vec<LogEntry>>;

    /// Acknowledges `id` for `group`, removing it from the pending set.
    /// Idempotent: unknown ids are ignored.
    async fn ack(&self, stream: &str, group: &str, id: MessageId) -> Result<()>;
}

// =============================================================================
// MemoryLog
// =============================================================================

/// In-process [`EventLog`] implementation.
///
/// State lives behind one mutex; the blocking new-entry read parks on a
/// [`Notify`] that every append signals, so idle consumers wake as soon as
/// there is work instead of polling.
#[derive(Default)]
pub struct MemoryLog {
    streams: Mutex<HashMap<String, StreamState>>,
    appended: Notify,
}

#[derive(Default)]
struct StreamState {
    /// Next id to assign; ids start at 1.
    next_id: u64,
    /// All appended entries, in id order (never trimmed).
    entries: Vec<(u64, EventEnvelope)>,
    groups: HashMap<String, GroupState>,
}

#[derive(Default)]
struct GroupState {
    /// Highest id handed out via a new-entry read (the group cursor).
    last_delivered: u64,
    /// Delivered-but-unacknowledged entries, keyed by id.
    pending: BTreeMap<u64, PendingEntry>,
}

struct PendingEntry {
    consumer: String,
    delivery_count: u32,
}

impl MemoryLog {
    /// Creates an empty in-process log.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of delivered-but-unacknowledged entries for `group`, across
    /// all consumers. Observability hook for tests and the soak driver;
    /// not part of the consumption contract.
    pub fn pending_count(&self, stream: &str, group: &str) -> usize {
        self.lock()
            .ok()
            .and_then(|streams| {
                streams
                    .get(stream)
                    .and_then(|s| s.groups.get(group))
                    .map(|g| g.pending.len())
            })
            .unwrap_or(0)
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<String, StreamState>>> {
        self.streams.lock().map_err(|_| Error::LogUnavailable {
            message: "log state poisoned".to_string(),
        })
    }
}

fn no_such_group(stream: &str, group: &str) -> Error {
    Error::LogUnavailable {
        message: format!("no such consumer group '{group}' on stream '{stream}'"),
    }
}

#[async_trait]
impl EventLog for MemoryLog {
    async fn append(&self, stream: &str, envelope: &EventEnvelope) -> Result<MessageId> {
        let id = {
            let mut streams = self.lock()?;
            let state = streams.entry(stream.to_string()).or_default();
            state.next_id += 1;
            let id = state.next_id;
            state.entries.push((id, envelope.clone()));
            id
        };
        // Wake any consumer blocked on an empty stream.
        self.appended.notify_waiters();
        Ok(MessageId::from_raw_unchecked(id))
    }

    async fn create_group(&self, stream: &str, group: &str) -> Result<()> {
        let mut streams = self.lock()?;
        let state = streams.entry(stream.to_string()).or_default();
        if state.groups.contains_key(group) {
            return Err(Error::GroupAlreadyExists {
                group: group.to_string(),
            });
        }
        state.groups.insert(group.to_string(), GroupState::default());
        Ok(())
    }

    async fn read_new(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> Result<Vec<LogEntry>> {
        let deadline = Instant::now() + block;
        loop {
            // Arm the notification before checking state so an append racing
            // with the check cannot be missed.
            let notified = self.appended.notified();
            {
                let mut streams = self.lock()?;
                let state = streams
                    .get_mut(stream)
                    .ok_or_else(|| no_such_group(stream, group))?;
                let entries = &state.entries;
                let group_state = state
                    .groups
                    .get_mut(group)
                    .ok_or_else(|| no_such_group(stream, group))?;

                let cursor = group_state.last_delivered;
                let batch: Vec<LogEntry> = entries
                    .iter()
                    .filter(|(id, _)| *id > cursor)
                    .take(count)
                    .map(|(id, envelope)| LogEntry {
                        id: MessageId::from_raw_unchecked(*id),
                        envelope: envelope.clone(),
                        delivery_count: 1,
                    })
                    .collect();

                if !batch.is_empty() {
                    for entry in &batch {
                        group_state.pending.insert(
                            entry.id.as_raw(),
                            PendingEntry {
                                consumer: consumer.to_string(),
                                delivery_count: 1,
                            },
                        );
                    }
                    group_state.last_delivered = batch[batch.len() - 1].id.as_raw();
                    return Ok(batch);
                }
            }

            if block.is_zero() || Instant::now() >= deadline {
                return Ok(Vec::new());
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(Vec::new());
            }
        }
    }

    async fn read_pending(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
    ) -> Result<Vec<LogEntry>> {
        let mut streams = self.lock()?;
        let state = streams
            .get_mut(stream)
            .ok_or_else(|| no_such_group(stream, group))?;
        let entries = &state.entries;
        let group_state = state
            .groups
            .get_mut(group)
            .ok_or_else(|| no_such_group(stream, group))?;

        let mut batch = Vec::new();
        for (id, pending) in group_state
            .pending
            .iter_mut()
            .filter(|(_, p)| p.consumer == consumer)
            .take(count)
        {
            pending.delivery_count += 1;
            // Entries are never trimmed, so every pending id resolves.
            if let Ok(idx) = entries.binary_search_by_key(id, |(entry_id, _)| *entry_id) {
                batch.push(LogEntry {
                    id: MessageId::from_raw_unchecked(*id),
                    envelope: entries[idx].1.clone(),
                    delivery_count: pending.delivery_count,
                });
            }
        }
        Ok(batch)
    }

    async fn ack(&self, stream: &str, group: &str, id: MessageId) -> Result<()> {
        let mut streams = self.lock()?;
        if let Some(state) = streams.get_mut(stream) {
            if let Some(group_state) = state.groups.get_mut(group) {
                group_state.pending.remove(&id.as_raw());
            }
        }
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================
