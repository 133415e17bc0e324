#![allow(dead_code)]

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use conveyor::{Clock, EventLog, ManualClock, MemoryLog, Pipeline, PipelineConfig, StateStore};

/// Fixed test epoch so retry deadlines are predictable.
pub const EPOCH_MS: u64 = 1_000_000;

/// Config with tight timings so cycles spin fast under test.
pub fn fast_config() -> PipelineConfig {
    PipelineConfig {
        block_timeout: Duration::from_millis(10),
        cycle_retry_pause: Duration::from_millis(10),
        shutdown_grace: Duration::from_secs(5),
        ..PipelineConfig::default()
    }
}

/// A started pipeline plus handles to its collaborators for inspection.
pub struct TestPipeline {
    pub log: Arc<MemoryLog>,
    pub store: Arc<StateStore>,
    pub clock: Arc<ManualClock>,
    pub pipeline: Pipeline,
}

/// Starts a pipeline over a fresh in-process log and in-memory store, with a
/// manual clock pinned to [`EPOCH_MS`].
pub async fn start_pipeline(config: PipelineConfig) -> TestPipeline {
    let log = Arc::new(MemoryLog::new());
    let store = Arc::new(StateStore::open_in_memory().expect("open in-memory store"));
    let clock = Arc::new(ManualClock::new(EPOCH_MS));
    let pipeline = Pipeline::start_with_clock(
        Arc::clone(&log) as Arc<dyn EventLog>,
        Arc::clone(&store),
        config,
        Arc::clone(&clock) as Arc<dyn Clock>,
    )
    .await
    .expect("start pipeline");
    TestPipeline {
        log,
        store,
        clock,
        pipeline,
    }
}

/// Starts a second pipeline instance (distinct consumer name) against an
/// existing log and store, sharing the same group cursor.
pub async fn join_pipeline(
    base: &TestPipeline,
    consumer: &str,
    config: PipelineConfig,
) -> Pipeline {
    let config = PipelineConfig {
        consumer: consumer.to_string(),
        ..config
    };
    Pipeline::start_with_clock(
        Arc::clone(&base.log) as Arc<dyn EventLog>,
        Arc::clone(&base.store),
        config,
        Arc::clone(&base.clock) as Arc<dyn Clock>,
    )
    .await
    .expect("start second pipeline")
}

/// Polls an async condition until it yields a value or the timeout elapses.
pub async fn eventually<T, F, Fut>(timeout: Duration, interval: Duration, mut f: F) -> T
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Option<T>>,
{
    let start = std::time::Instant::now();
    loop {
        if let Some(v) = f().await {
            return v;
        }
        if start.elapsed() > timeout {
            panic!("condition not met within {:?}", timeout);
        }
        tokio::time::sleep(interval).await;
    }
}

/// `eventually` with the usual test timings (5 s limit, 10 ms polls).
pub async fn settle<T, F, Fut>(f: F) -> T
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Option<T>>,
{
    eventually(Duration::from_secs(5), Duration::from_millis(10), f).await
}
