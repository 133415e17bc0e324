//! Conveyor Soak Driver
//!
//! A standalone binary that drives a full pipeline end to end: it publishes a
//! mixed workload (unique keys, duplicate keys, events rigged to fail), waits
//! for the consumer to converge, and prints the resulting record counts.
//! Run with: `cargo run --bin soak -- [OPTIONS]`
//!
//! This is separate from the test suite because:
//! 1. Forced failures wait out real backoff windows, so a run takes a while
//! 2. It's configurable via command-line arguments
//! 3. It exercises the wiring a deployment would use (env config, tracing)
//!
//! # Examples
//!
//! ```bash
//! # Default: 100 unique events, 10 duplicates, 2 forced failures
//! cargo run --release --bin soak
//!
//! # Bigger workload against a file-backed store
//! cargo run --release --bin soak -- --events 1000 --duplicates 100 --db soak.db
//! ```

use std::process;
use std::sync::Arc;
use std::time::{Duration, Instant};

use conveyor::{EventLog, MemoryLog, Pipeline, PipelineConfig, StateStore};

/// Soak run configuration.
struct SoakConfig {
    /// Number of events with unique idempotency keys.
    events: usize,
    /// Number of extra publishes that reuse already-sent keys.
    duplicates: usize,
    /// Number of events rigged to fail every attempt (dead-letter path).
    forced_failures: usize,
    /// Retry budget for the consumer.
    max_retries: u32,
    /// Path to the store database (in-memory if None).
    db_path: Option<String>,
}

impl Default for SoakConfig {
    fn default() -> Self {
        Self {
            events: 100,
            duplicates: 10,
            forced_failures: 2,
            max_retries: 3,
            db_path: None,
        }
    }
}

fn parse_args() -> SoakConfig {
    let args: Vec<String> = std::env::args().collect();
    let mut config = SoakConfig::default();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--events" | "-e" => {
                i += 1;
                config.events = args[i].parse().expect("Invalid --events value");
            }
            "--duplicates" => {
                i += 1;
                config.duplicates = args[i].parse().expect("Invalid --duplicates value");
            }
            "--forced" => {
                i += 1;
                config.forced_failures = args[i].parse().expect("Invalid --forced value");
            }
            "--max-retries" => {
                i += 1;
                config.max_retries = args[i].parse().expect("Invalid --max-retries value");
            }
            "--db" | "-d" => {
                i += 1;
                config.db_path = Some(args[i].clone());
            }
            "--help" | "-h" => {
                println!(
                    r#"Conveyor Soak Driver

Usage: soak [OPTIONS]

Options:
  -e, --events <N>      Events with unique keys (default: 100)
  --duplicates <N>      Re-publishes of already-sent keys (default: 10)
  --forced <N>          Events that fail every attempt (default: 2)
  --max-retries <N>     Consumer retry budget (default: 3)
  -d, --db <PATH>       Store database path (default: in-memory)
  -h, --help            Show this help
"#
                );
                process::exit(0);
            }
            arg => {
                eprintln!("Unknown argument: {}", arg);
                process::exit(1);
            }
        }
        i += 1;
    }

    config
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    if let Err(err) = run(parse_args()).await {
        eprintln!("fatal: {err}");
        process::exit(1);
    }
}

async fn run(soak: SoakConfig) -> conveyor::Result<()> {
    let store = Arc::new(match &soak.db_path {
        Some(path) => StateStore::open(path)?,
        None => StateStore::open_in_memory()?,
    });
    let log: Arc<dyn EventLog> = Arc::new(MemoryLog::new());

    let pipeline_config = PipelineConfig {
        max_retries: soak.max_retries,
        block_timeout: Duration::from_millis(100),
        ..PipelineConfig::from_env()
    };
    let pipeline = Pipeline::start(log, Arc::clone(&store), pipeline_config).await?;

    let started = Instant::now();

    for n in 0..soak.events {
        pipeline
            .publish(
                "soak.event",
                &serde_json::json!({ "n": n }),
                format!("soak-key-{n}"),
            )
            .await?;
    }
    // Duplicates reuse the first keys; the consumer must collapse them.
    for n in 0..soak.duplicates {
        pipeline
            .publish(
                "soak.event",
                &serde_json::json!({ "n": n, "duplicate": true }),
                format!("soak-key-{}", n % soak.events.max(1)),
            )
            .await?;
    }
    for n in 0..soak.forced_failures {
        pipeline
            .publish(
                "soak.event",
                &serde_json::json!({ "n": n, "forced_fail": true }),
                format!("soak-dead-{n}"),
            )
            .await?;
    }
    println!(
        "published {} events ({} unique, {} duplicates, {} forced failures)",
        soak.events + soak.duplicates + soak.forced_failures,
        soak.events,
        soak.duplicates,
        soak.forced_failures
    );

    // Convergence: every unique key processed, every rigged event
    // dead-lettered. Forced failures wait out real backoff, so allow for
    // the full escalation schedule.
    let deadline = Instant::now() + Duration::from_secs(120);
    loop {
        let processed = store.processed_count().await?;
        let dead = store.dead_letter_count().await?;
        if processed as usize >= soak.events && dead as usize >= soak.forced_failures {
            break;
        }
        if Instant::now() > deadline {
            eprintln!(
                "did not converge: {processed}/{} processed, {dead}/{} dead-lettered",
                soak.events, soak.forced_failures
            );
            break;
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    }

    let elapsed = started.elapsed();
    println!("\n=== Soak Results ===");
    println!("elapsed:            {:.2?}", elapsed);
    println!("processed records:  {}", store.processed_count().await?);
    println!("projection records: {}", store.projection_count().await?);
    println!("dead letters:       {}", store.dead_letter_count().await?);
    for letter in store.dead_letters().await? {
        println!(
            "  dead letter: type={} source={} payload={}",
            letter.event_type, letter.source_message_id, letter.payload
        );
    }

    pipeline.shutdown().await;
    Ok(())
}
