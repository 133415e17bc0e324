mod common;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use conveyor::{
    DeliveryLoop, EventEnvelope, EventId, EventLog, LogEntry, ManualClock, MemoryLog, MessageId,
    Result, StateStore,
};

/// Wraps a [`MemoryLog`] and fires a cancellation token on the first ack, so
/// shutdown lands deterministically *between* two dispatches of one batch.
struct CancelOnAckLog {
    inner: Arc<MemoryLog>,
    cancel: CancellationToken,
}

#[async_trait]
impl EventLog for CancelOnAckLog {
    async fn append(&self, stream: &str, envelope: &EventEnvelope) -> Result<MessageId> {
        self.inner.append(stream, envelope).await
    }

    async fn create_group(&self, stream: &str, group: &str) -> Result<()> {
        self.inner.create_group(stream, group).await
    }

    async fn read_new(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> Result<Vec<LogEntry>> {
        self.inner.read_new(stream, group, consumer, count, block).await
    }

    async fn read_pending(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
    ) -> Result<Vec<LogEntry>> {
        self.inner.read_pending(stream, group, consumer, count).await
    }

    async fn ack(&self, stream: &str, group: &str, id: MessageId) -> Result<()> {
        self.cancel.cancel();
        self.inner.ack(stream, group, id).await
    }
}

fn envelope(n: usize) -> EventEnvelope {
    EventEnvelope {
        event_id: EventId::generate(),
        event_type: "booking.created".to_string(),
        idempotency_key: format!("idemp-{n}").into(),
        payload: r#"{"seats":1}"#.to_string(),
        occurred_at_ms: 0,
    }
}

#[tokio::test]
async fn shutdown_mid_batch_leaves_undispatched_messages_pending() {
    let inner = Arc::new(MemoryLog::new());
    let store = Arc::new(StateStore::open_in_memory().unwrap());
    let cancel = CancellationToken::new();
    let config = common::fast_config();

    inner
        .create_group(&config.stream, &config.group)
        .await
        .unwrap();
    for n in 0..5 {
        inner.append(&config.stream, &envelope(n)).await.unwrap();
    }

    // Shutdown fires the moment message #1 is acknowledged, so the loop
    // must stop before dispatching the rest of the batch.
    let log: Arc<dyn EventLog> = Arc::new(CancelOnAckLog {
        inner: Arc::clone(&inner),
        cancel: cancel.clone(),
    });
    let delivery = DeliveryLoop::new(
        log,
        Arc::clone(&store),
        config.clone(),
        cancel.clone(),
        Arc::new(ManualClock::new(common::EPOCH_MS)),
    );
    let handle = tokio::spawn(delivery.run());

    // The loop observes the cancellation and terminates on its own.
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("loop terminates after cancellation")
        .unwrap();

    // Exactly one message made it through; the other four were delivered
    // into the pending set but never dispatched, never acknowledged.
    assert_eq!(store.processed_count().await.unwrap(), 1);
    assert_eq!(store.projection_count().await.unwrap(), 1);
    assert_eq!(inner.pending_count(&config.stream, &config.group), 4);
}

#[tokio::test]
async fn graceful_shutdown_drains_in_flight_work() {
    let t = common::start_pipeline(common::fast_config()).await;

    for n in 0..3 {
        t.pipeline
            .publish(
                "booking.created",
                &serde_json::json!({"seats": 1}),
                format!("idemp-{n}"),
            )
            .await
            .unwrap();
    }
    // Everything processed and acked before the stores are released.
    common::settle(|| {
        let store = Arc::clone(&t.store);
        let log = Arc::clone(&t.log);
        async move {
            let processed = store.processed_count().await.unwrap();
            let drained = log.pending_count("conveyor:events", "conveyor-workers") == 0;
            (processed == 3 && drained).then_some(())
        }
    })
    .await;

    t.pipeline.shutdown().await;
}

#[tokio::test]
async fn shutdown_of_an_idle_loop_returns_promptly() {
    let t = common::start_pipeline(common::fast_config()).await;

    // No traffic at all; the loop is parked on the blocking read.
    tokio::time::timeout(Duration::from_secs(2), t.pipeline.shutdown())
        .await
        .expect("idle shutdown completes within the grace period");
}
