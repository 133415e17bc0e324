//! # Pipeline Handle & Shutdown Coordination
//!
//! [`Pipeline`] wires the pieces together: it bootstraps the consumer group,
//! spawns the delivery loop, and exposes the publish boundary an inbound
//! handler (HTTP or otherwise) would call.
//!
//! ## Shutdown Protocol
//!
//! Shutdown is cooperative - there is no hard interrupt of an in-flight side
//! effect:
//!
//! 1. New publishes are refused at the boundary.
//! 2. The cancellation token fires; the loop observes it at cycle start and
//!    before each per-message dispatch.
//! 3. We wait up to the configured grace period for the loop task to finish.
//!    A loop that doesn't drain in time is abandoned - its in-flight entry
//!    remains unacknowledged and will be redelivered on restart, which
//!    at-least-once semantics make safe.
//! 4. The store is released, then the log, in that order.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::clock::{Clock, SystemClock};
use crate::config::PipelineConfig;
use crate::consumer::{ensure_group, DeliveryLoop};
use crate::error::{Error, Result};
use crate::log::EventLog;
use crate::producer::EventProducer;
use crate::store::StateStore;
use crate::types::{EventId, IdempotencyKey};

/// A running pipeline instance: producer boundary plus one delivery loop.
pub struct Pipeline {
    producer: EventProducer,
    store: Arc<StateStore>,
    log: Arc<dyn EventLog>,
    cancel: CancellationToken,
    loop_handle: JoinHandle<()>,
    config: PipelineConfig,
}

impl Pipeline {
    /// Bootstraps the consumer group and starts the delivery loop.
    ///
    /// Fails with [`Error::Bootstrap`] if the group cannot be ensured; by
    /// then the caller should already have verified the store opens, so a
    /// failure here aborts startup.
    pub async fn start(
        log: Arc<dyn EventLog>,
        store: Arc<StateStore>,
        config: PipelineConfig,
    ) -> Result<Self> {
        Self::start_with_clock(log, store, config, Arc::new(SystemClock)).await
    }

    /// Same as [`start`](Self::start) with an injected clock (tests drive
    /// backoff windows with a manual clock).
    pub async fn start_with_clock(
        log: Arc<dyn EventLog>,
        store: Arc<StateStore>,
        config: PipelineConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        ensure_group(log.as_ref(), &config.stream, &config.group).await?;

        let cancel = CancellationToken::new();
        let delivery = DeliveryLoop::new(
            Arc::clone(&log),
            Arc::clone(&store),
            config.clone(),
            cancel.clone(),
            Arc::clone(&clock),
        );
        let loop_handle = tokio::spawn(delivery.run());
        let producer = EventProducer::new(Arc::clone(&log), config.stream.clone(), clock);

        info!(
            stream = %config.stream,
            group = %config.group,
            consumer = %config.consumer,
            "pipeline started"
        );
        Ok(Self {
            producer,
            store,
            log,
            cancel,
            loop_handle,
            config,
        })
    }

    /// Publishes an event through the production boundary.
    ///
    /// Refused once shutdown has begun; otherwise delegates to the producer.
    pub async fn publish(
        &self,
        event_type: &str,
        payload: &serde_json::Value,
        idempotency_key: impl Into<IdempotencyKey>,
    ) -> Result<EventId> {
        if self.cancel.is_cancelled() {
            return Err(Error::Publish {
                message: "pipeline is shutting down".to_string(),
            });
        }
        self.producer.publish(event_type, payload, idempotency_key).await
    }

    /// The state store, for inspection (projection counts, dead letters).
    pub fn store(&self) -> &StateStore {
        &self.store
    }

    /// Drains the delivery loop and releases connections.
    ///
    /// Waits up to the configured grace period for the loop to observe the
    /// cancellation; an overrunning loop is abandoned (its in-flight entry
    /// stays pending and redelivers on restart).
    pub async fn shutdown(self) {
        let Pipeline {
            producer,
            store,
            log,
            cancel,
            loop_handle,
            config,
        } = self;

        info!("shutdown requested, draining delivery loop");
        cancel.cancel();
        match tokio::time::timeout(config.shutdown_grace, loop_handle).await {
            Ok(Ok(())) => info!("delivery loop drained"),
            Ok(Err(e)) => error!(error = %e, "delivery loop task failed"),
            Err(_) => warn!(
                grace_ms = config.shutdown_grace.as_millis() as u64,
                "grace period elapsed, abandoning delivery loop"
            ),
        }

        // Release order: producer (holds the log), then store, then log.
        drop(producer);
        drop(store);
        drop(log);
        info!("pipeline stopped");
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log::MemoryLog;
    use std::time::Duration;

    fn fast_config() -> PipelineConfig {
        PipelineConfig {
            block_timeout: Duration::from_millis(20),
            cycle_retry_pause: Duration::from_millis(20),
            shutdown_grace: Duration::from_secs(2),
            ..PipelineConfig::default()
        }
    }

    #[tokio::test]
    async fn test_start_is_idempotent_across_restarts() {
        let log: Arc<dyn EventLog> = Arc::new(MemoryLog::new());
        let store = Arc::new(StateStore::open_in_memory().unwrap());

        let first = Pipeline::start(Arc::clone(&log), Arc::clone(&store), fast_config())
            .await
            .unwrap();
        first.shutdown().await;

        // Second start sees the existing group and must not fail.
        let second = Pipeline::start(log, store, fast_config()).await.unwrap();
        second.shutdown().await;
    }

    #[tokio::test]
    async fn test_publish_refused_after_shutdown_begins() {
        let log: Arc<dyn EventLog> = Arc::new(MemoryLog::new());
        let store = Arc::new(StateStore::open_in_memory().unwrap());
        let pipeline = Pipeline::start(log, store, fast_config()).await.unwrap();

        pipeline.cancel.cancel();
        let err = pipeline
            .publish("test.event", &serde_json::json!({}), "key-1")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Publish { .. }));
        pipeline.shutdown().await;
    }
}
