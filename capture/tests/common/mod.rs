#![allow(dead_code)]

use std::sync::{Arc, Once};
use std::time::Duration;

use serde_json::json;
use time::macros::datetime;
use time::OffsetDateTime;

use capture::codec::{Base64JsonCodec, Codec};
use capture::config::PipelineSettings;
use capture::event::{EventRecord, EventSource};
use capture::health::HealthRegistry;
use capture::pipeline::Pipeline;
use capture::pipeline_config::PipelineConfig;
use capture::store::{parse_entry_key, MemoryBackend};
use capture::time::ManualTime;

pub const NOW: OffsetDateTime = datetime!(2024-03-20 12:00 UTC);

static TRACING_INIT: Once = Once::new();
pub fn setup_tracing() {
    TRACING_INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_writer(tracing_subscriber::fmt::TestWriter::new())
            .init()
    });
}

pub fn record(id: &str) -> EventRecord {
    record_at(id, NOW)
}

pub fn record_at(id: &str, occurred_at: OffsetDateTime) -> EventRecord {
    EventRecord::new(
        id,
        "message",
        occurred_at,
        EventSource::Network,
        json!({"id": id, "body": format!("payload of {id}")}),
    )
}

pub fn records(prefix: &str, count: usize) -> Vec<EventRecord> {
    (0..count).map(|i| record(&format!("{prefix}-{i}"))).collect()
}

pub fn settings(config: PipelineConfig) -> PipelineSettings {
    PipelineSettings {
        default_batch_size: config.batch_size,
        default_flush_interval_ms: config.flush_interval_ms,
        default_capacity: config.capacity,
        default_retention_ms: config.retention_ms,
        ..Default::default()
    }
}

/// A pipeline over an in-memory backend, with a clock tests move by hand.
pub struct TestPipeline {
    pub pipeline: Arc<Pipeline>,
    pub backend: MemoryBackend,
    pub clock: ManualTime,
}

impl TestPipeline {
    pub async fn new(settings: PipelineSettings) -> TestPipeline {
        Self::build(settings, MemoryBackend::new(), None).await
    }

    pub async fn build(
        settings: PipelineSettings,
        backend: MemoryBackend,
        liveness: Option<HealthRegistry>,
    ) -> TestPipeline {
        setup_tracing();
        let clock = ManualTime::new(NOW);
        let pipeline = Pipeline::new(
            Arc::new(backend.clone()),
            Arc::new(Base64JsonCodec),
            Arc::new(clock.clone()),
            &settings,
            liveness,
        )
        .await;
        TestPipeline {
            pipeline: Arc::new(pipeline),
            backend,
            clock,
        }
    }

    pub async fn started(settings: PipelineSettings) -> TestPipeline {
        let test = Self::new(settings).await;
        test.pipeline.start().await.expect("pipeline starts");
        test
    }

    pub async fn stored(&self) -> usize {
        self.pipeline.list_entries().await.expect("store readable").len()
    }

    /// Ids of the stored records, oldest insertion first.
    pub async fn stored_ids(&self) -> Vec<String> {
        self.pipeline
            .list_entries()
            .await
            .expect("store readable")
            .iter()
            .map(|entry| {
                Base64JsonCodec
                    .decode(&entry.encoded)
                    .expect("entry decodes")
                    .id
            })
            .collect()
    }

    /// Sizes of the commits that produced the stored entries, in commit order.
    pub async fn commit_sizes(&self) -> Vec<usize> {
        let entries = self.pipeline.list_entries().await.expect("store readable");
        let mut sizes: Vec<(i128, usize)> = vec![];
        for entry in entries {
            let (stamp, _) = parse_entry_key(&entry.key).expect("well-formed key");
            match sizes.last_mut() {
                Some((last, size)) if *last == stamp => *size += 1,
                _ => sizes.push((stamp, 1)),
            }
        }
        sizes.into_iter().map(|(_, size)| size).collect()
    }
}

/// Lets spawned tasks run without moving the paused clock noticeably.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(1)).await;
}
