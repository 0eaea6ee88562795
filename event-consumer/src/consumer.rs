use std::fmt;
use std::time::Duration;

use metrics::Counter;
use pipeline_common::event::{EnrichedRecord, Event};
use pipeline_common::shutdown::sleep_or_cancelled;
use pipeline_common::time::TimeSource;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::CommitPolicy;
use crate::sink::EventStore;
use crate::source::{EventSource, MessagePosition, SourceMessage};

/// Reads events one at a time, enriches them with their end-to-end latency and
/// persists them, until cancelled.
pub struct ConsumerLoop<S, K, T> {
    source: S,
    store: K,
    clock: T,
    commit_policy: CommitPolicy,
    read_backoff: Duration,
    /// Incremented for every record the store accepted.
    consumed: Counter,
}

impl<S, K, T> ConsumerLoop<S, K, T>
where
    S: EventSource,
    K: EventStore,
    T: TimeSource,
{
    pub fn new(
        source: S,
        store: K,
        clock: T,
        commit_policy: CommitPolicy,
        read_backoff: Duration,
        consumed: Counter,
    ) -> Self {
        Self {
            source,
            store,
            clock,
            commit_policy,
            read_backoff,
            consumed,
        }
    }

    pub async fn run(&self, shutdown: &CancellationToken) {
        info!("waiting for messages ({:?})...", self.commit_policy);

        loop {
            let received = tokio::select! {
                _ = shutdown.cancelled() => break,
                received = self.source.recv() => received,
            };

            match received {
                Ok(message) => self.process(message).await,
                Err(e) => {
                    error!("failed to read message: {}", e);
                    metrics::counter!("events_read_errors_total").increment(1);
                    if !sleep_or_cancelled(shutdown, self.read_backoff).await {
                        break;
                    }
                }
            }
        }

        info!("consumer loop stopped");
    }

    async fn process(&self, message: SourceMessage) {
        let position = message.position;
        if self.commit_policy == CommitPolicy::AfterRead {
            self.commit(&position);
        }

        let payload = message.payload.unwrap_or_default();
        let event = match Event::from_json(&payload) {
            Ok(event) => event,
            Err(e) => return self.skip_malformed(&position, &payload, &e),
        };

        let record = match EnrichedRecord::new(event, self.clock.current_millis()) {
            Ok(record) => record,
            Err(e) => return self.skip_malformed(&position, &payload, &e),
        };

        match self.store.insert(&record).await {
            Ok(id) => {
                self.consumed.increment(1);
                metrics::histogram!("event_latency_ms").record(record.latency_ms as f64);
                info!(
                    "stored event {} from {} ({}, latency {} ms)",
                    id, record.event.user_id, record.event.event_type, record.latency_ms
                );
                if self.commit_policy == CommitPolicy::AfterWrite {
                    self.commit(&position);
                }
            }
            Err(e) => {
                error!("failed to store event at {}, dropping it: {}", position, e);
                metrics::counter!("events_store_errors_total").increment(1);
            }
        }
    }

    fn skip_malformed(
        &self,
        position: &MessagePosition,
        payload: &[u8],
        error: &dyn fmt::Display,
    ) {
        warn!(
            "skipping malformed message at {}: {} (payload: {})",
            position,
            error,
            String::from_utf8_lossy(payload)
        );
        metrics::counter!("events_malformed_total").increment(1);
        // Never retried, it would fail the same way
        if self.commit_policy == CommitPolicy::AfterWrite {
            self.commit(position);
        }
    }

    fn commit(&self, position: &MessagePosition) {
        if let Err(e) = self.source.commit(position) {
            warn!("failed to store offset {}: {}", position, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::StoreError;
    use crate::source::RecvError;
    use async_trait::async_trait;
    use pipeline_common::event::EventType;
    use pipeline_common::metrics::MetricsRegistry;
    use pipeline_common::time::FixedTime;
    use rdkafka::error::{KafkaError, RDKafkaErrorCode};
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Replays a script of reads, then cancels the loop once it runs out.
    struct ScriptedSource {
        script: Mutex<VecDeque<Result<SourceMessage, RecvError>>>,
        commits: Mutex<Vec<MessagePosition>>,
        shutdown: CancellationToken,
    }

    impl ScriptedSource {
        fn new(
            script: Vec<Result<SourceMessage, RecvError>>,
            shutdown: &CancellationToken,
        ) -> Self {
            Self {
                script: Mutex::new(script.into()),
                commits: Mutex::new(vec![]),
                shutdown: shutdown.clone(),
            }
        }
    }

    #[async_trait]
    impl EventSource for ScriptedSource {
        async fn recv(&self) -> Result<SourceMessage, RecvError> {
            let next = self.script.lock().unwrap().pop_front();
            match next {
                Some(read) => read,
                None => {
                    self.shutdown.cancel();
                    std::future::pending().await
                }
            }
        }

        fn commit(&self, position: &MessagePosition) -> Result<(), RecvError> {
            self.commits.lock().unwrap().push(*position);
            Ok(())
        }
    }

    /// Keeps records in memory, rejecting those whose user id is listed in `rejected`.
    #[derive(Default)]
    struct MemoryStore {
        rejected: Vec<String>,
        records: Mutex<Vec<EnrichedRecord>>,
    }

    #[async_trait]
    impl EventStore for MemoryStore {
        async fn insert(&self, record: &EnrichedRecord) -> Result<String, StoreError> {
            if self.rejected.contains(&record.event.user_id) {
                let error = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "write rejected");
                return Err(StoreError::Mongo(error.into()));
            }
            let mut records = self.records.lock().unwrap();
            records.push(record.clone());
            Ok(records.len().to_string())
        }
    }

    fn message(offset: i64, payload: &[u8]) -> Result<SourceMessage, RecvError> {
        Ok(SourceMessage {
            payload: Some(payload.to_vec()),
            position: MessagePosition {
                partition: 0,
                offset,
            },
        })
    }

    const CLICK: &[u8] =
        br#"{"user_id":"user_3","event_type":"click","timestamp":1000,"url":"/home"}"#;
    const LOGIN: &[u8] =
        br#"{"user_id":"user_7","event_type":"login","timestamp":1100,"url":"/about"}"#;

    fn consumer_loop(
        source: ScriptedSource,
        store: MemoryStore,
        commit_policy: CommitPolicy,
        registry: &MetricsRegistry,
    ) -> ConsumerLoop<ScriptedSource, MemoryStore, FixedTime> {
        ConsumerLoop::new(
            source,
            store,
            FixedTime { millis: 1150 },
            commit_policy,
            Duration::from_secs(1),
            registry.counter("events_consumed_total", "Total events consumed."),
        )
    }

    fn offsets(positions: &[MessagePosition]) -> Vec<i64> {
        positions.iter().map(|p| p.offset).collect()
    }

    #[tokio::test]
    async fn enriches_with_latency() {
        let registry = MetricsRegistry::new().expect("failed to build registry");
        let shutdown = CancellationToken::new();
        let source = ScriptedSource::new(vec![message(0, CLICK)], &shutdown);
        let consumer = consumer_loop(
            source,
            MemoryStore::default(),
            CommitPolicy::AfterRead,
            &registry,
        );

        consumer.run(&shutdown).await;

        let records = consumer.store.records.lock().unwrap();
        assert_eq!(
            *records,
            vec![EnrichedRecord {
                event: Event {
                    user_id: "user_3".to_string(),
                    event_type: EventType::Click,
                    timestamp: 1000,
                    url: "/home".to_string(),
                },
                processing_time: 1150,
                latency_ms: 150,
            }]
        );
        assert!(registry
            .render()
            .lines()
            .any(|l| l == "events_consumed_total 1"));
    }

    #[tokio::test]
    async fn skips_malformed_messages() {
        let registry = MetricsRegistry::new().expect("failed to build registry");
        let shutdown = CancellationToken::new();
        let source = ScriptedSource::new(
            vec![
                message(0, b"not json"),
                Ok(SourceMessage {
                    payload: None,
                    position: MessagePosition {
                        partition: 0,
                        offset: 1,
                    },
                }),
                message(
                    2,
                    br#"{"user_id":"user_3","event_type":"teleport","timestamp":1000,"url":"/home"}"#,
                ),
                message(
                    3,
                    br#"{"user_id":"","event_type":"click","timestamp":1000,"url":"/home"}"#,
                ),
                message(4, CLICK),
            ],
            &shutdown,
        );
        let consumer = consumer_loop(
            source,
            MemoryStore::default(),
            CommitPolicy::AfterRead,
            &registry,
        );

        consumer.run(&shutdown).await;

        let records = consumer.store.records.lock().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].event.user_id, "user_3");
        assert!(registry
            .render()
            .lines()
            .any(|l| l == "events_consumed_total 1"));
    }

    #[tokio::test]
    async fn skips_events_whose_latency_overflows() {
        let registry = MetricsRegistry::new().expect("failed to build registry");
        let shutdown = CancellationToken::new();
        let source = ScriptedSource::new(
            vec![
                message(
                    0,
                    br#"{"user_id":"user_1","event_type":"click","timestamp":-9223372036854775808,"url":"/home"}"#,
                ),
                message(1, CLICK),
            ],
            &shutdown,
        );
        let consumer = consumer_loop(
            source,
            MemoryStore::default(),
            CommitPolicy::AfterWrite,
            &registry,
        );

        consumer.run(&shutdown).await;

        // Stored as consumed, so it is not replayed after a restart
        assert_eq!(offsets(&consumer.source.commits.lock().unwrap()), vec![0, 1]);
        let records = consumer.store.records.lock().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].event.user_id, "user_3");
        assert_eq!(records[0].latency_ms, 150);
        assert!(registry
            .render()
            .lines()
            .any(|l| l == "events_consumed_total 1"));
    }

    #[tokio::test(start_paused = true)]
    async fn backs_off_on_read_errors() {
        let registry = MetricsRegistry::new().expect("failed to build registry");
        let shutdown = CancellationToken::new();
        let source = ScriptedSource::new(
            vec![
                Err(RecvError::Kafka(KafkaError::MessageConsumption(
                    RDKafkaErrorCode::BrokerTransportFailure,
                ))),
                Err(RecvError::Closed),
                message(0, CLICK),
            ],
            &shutdown,
        );
        let consumer = consumer_loop(
            source,
            MemoryStore::default(),
            CommitPolicy::AfterRead,
            &registry,
        );

        let start = tokio::time::Instant::now();
        consumer.run(&shutdown).await;

        assert!(start.elapsed() >= Duration::from_secs(2));
        assert_eq!(consumer.store.records.lock().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_interrupts_backoff() {
        let registry = MetricsRegistry::new().expect("failed to build registry");
        let shutdown = CancellationToken::new();
        let source = ScriptedSource::new(vec![Err(RecvError::Closed)], &shutdown);
        let mut consumer = consumer_loop(
            source,
            MemoryStore::default(),
            CommitPolicy::AfterRead,
            &registry,
        );
        consumer.read_backoff = Duration::from_secs(3600);

        let canceller = shutdown.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            canceller.cancel();
        });

        let start = tokio::time::Instant::now();
        consumer.run(&shutdown).await;

        assert!(start.elapsed() < Duration::from_secs(3600));
    }

    #[tokio::test]
    async fn store_failures_are_not_counted() {
        let registry = MetricsRegistry::new().expect("failed to build registry");
        let shutdown = CancellationToken::new();
        let source = ScriptedSource::new(vec![message(0, CLICK), message(1, LOGIN)], &shutdown);
        let store = MemoryStore {
            rejected: vec!["user_3".to_string()],
            ..Default::default()
        };
        let consumer = consumer_loop(source, store, CommitPolicy::AfterRead, &registry);

        consumer.run(&shutdown).await;

        let records = consumer.store.records.lock().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].event.user_id, "user_7");
        assert_eq!(records[0].latency_ms, 50);
        assert!(registry
            .render()
            .lines()
            .any(|l| l == "events_consumed_total 1"));
    }

    #[tokio::test]
    async fn after_read_stores_every_offset() {
        let registry = MetricsRegistry::new().expect("failed to build registry");
        let shutdown = CancellationToken::new();
        let source = ScriptedSource::new(
            vec![message(0, CLICK), message(1, b"{}"), message(2, LOGIN)],
            &shutdown,
        );
        let store = MemoryStore {
            rejected: vec!["user_7".to_string()],
            ..Default::default()
        };
        let consumer = consumer_loop(source, store, CommitPolicy::AfterRead, &registry);

        consumer.run(&shutdown).await;

        // The offset of the lost record is stored all the same
        assert_eq!(
            offsets(&consumer.source.commits.lock().unwrap()),
            vec![0, 1, 2]
        );
    }

    #[tokio::test]
    async fn after_write_holds_back_failed_writes() {
        let registry = MetricsRegistry::new().expect("failed to build registry");
        let shutdown = CancellationToken::new();
        let source = ScriptedSource::new(
            vec![message(0, CLICK), message(1, b"{}"), message(2, LOGIN)],
            &shutdown,
        );
        let store = MemoryStore {
            rejected: vec!["user_7".to_string()],
            ..Default::default()
        };
        let consumer = consumer_loop(source, store, CommitPolicy::AfterWrite, &registry);

        consumer.run(&shutdown).await;

        assert_eq!(offsets(&consumer.source.commits.lock().unwrap()), vec![0, 1]);
        assert_eq!(consumer.store.records.lock().unwrap().len(), 1);
    }
}
