mod common;

use std::sync::Arc;
use std::time::Duration;

use conveyor::{
    EventEnvelope, EventId, EventLog, MessageId, RetryRecord, RetryStatus,
};

#[tokio::test]
async fn always_failing_event_is_dead_lettered_after_the_retry_budget() {
    let t = common::start_pipeline(common::fast_config()).await;

    t.pipeline
        .publish(
            "booking.created",
            &serde_json::json!({ "bookingId": "booking-dead-1", "forced_fail": true }),
            "idemp-dead-1",
        )
        .await
        .unwrap();

    // Each poll leaps the clock past any backoff window, so the entry is
    // re-attempted every cycle until the budget (5) runs out.
    let record = common::eventually(Duration::from_secs(10), Duration::from_millis(10), || {
        t.clock.advance(60_000);
        let store = Arc::clone(&t.store);
        async move {
            if store.dead_letter_count().await.unwrap() != 1 {
                return None;
            }
            let record = store.find_retry(MessageId::from_raw(1)).await.unwrap()?;
            (record.status == RetryStatus::Dead).then_some(record)
        }
    })
    .await;
    assert_eq!(record.status, RetryStatus::Dead);
    assert_eq!(record.retry_count, 5);

    let letters = t.store.dead_letters().await.unwrap();
    assert_eq!(letters.len(), 1);
    assert_eq!(letters[0].event_type, "booking.created");
    assert_eq!(letters[0].source_message_id, MessageId::from_raw(1));
    assert!(letters[0].payload.contains("forced_fail"));

    // Dead means out of circulation: acked, no side effects, ever.
    common::settle(|| {
        let log = Arc::clone(&t.log);
        async move { (log.pending_count("conveyor:events", "conveyor-workers") == 0).then_some(()) }
    })
    .await;
    assert_eq!(t.store.projection_count().await.unwrap(), 0);
    assert_eq!(t.store.processed_count().await.unwrap(), 0);

    // And it stays that way: more cycles, still exactly one dead letter.
    t.clock.advance(60_000);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(t.store.dead_letter_count().await.unwrap(), 1);
    assert_eq!(
        t.store
            .find_retry(MessageId::from_raw(1))
            .await
            .unwrap()
            .unwrap()
            .retry_count,
        5
    );

    t.pipeline.shutdown().await;
}

#[tokio::test]
async fn dead_marker_blocks_reprocessing_even_when_redelivered() {
    let t = common::start_pipeline(common::fast_config()).await;

    // Simulate the crash window: an entry was escalated (DEAD marker
    // persisted) but the final ack never landed, so the log will deliver it.
    // The marker is seeded before the append lands, exactly as a restart
    // would observe it.
    let id = MessageId::from_raw(1);
    t.store
        .upsert_retry(&RetryRecord {
            stream_message_id: id,
            idempotency_key: "idemp-ghost".to_string(),
            retry_count: 5,
            last_error: "processing failed: boom".to_string(),
            next_retry_at_ms: 0,
            status: RetryStatus::Dead,
        })
        .await
        .unwrap();
    let appended = t
        .log
        .append(
            "conveyor:events",
            &EventEnvelope {
                event_id: EventId::generate(),
                event_type: "booking.created".to_string(),
                idempotency_key: "idemp-ghost".into(),
                payload: r#"{"seats":1}"#.to_string(),
                occurred_at_ms: 0,
            },
        )
        .await
        .unwrap();
    assert_eq!(appended, id);

    // The loop must re-ack it without touching the stores.
    common::settle(|| {
        let log = Arc::clone(&t.log);
        async move { (log.pending_count("conveyor:events", "conveyor-workers") == 0).then_some(()) }
    })
    .await;
    assert_eq!(t.store.processed_count().await.unwrap(), 0);
    assert_eq!(t.store.projection_count().await.unwrap(), 0);
    // No duplicate dead letter either - escalation already happened.
    assert_eq!(t.store.dead_letter_count().await.unwrap(), 0);

    t.pipeline.shutdown().await;
}
