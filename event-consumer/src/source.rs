use std::fmt;

use async_trait::async_trait;
use pipeline_common::config::KafkaConfig;
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::error::KafkaError;
use rdkafka::{ClientConfig, Message};
use thiserror::Error;
use tracing::{debug, info};

#[derive(Error, Debug)]
pub enum RecvError {
    #[error("Kafka error: {0}")]
    Kafka(#[from] KafkaError),
    /// The source has no more messages and never will. `KafkaSource` never
    /// closes; finite sources such as replays and in-memory topics return this
    /// once drained.
    #[error("source closed")]
    Closed,
}

/// Where a message sits in the topic.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MessagePosition {
    pub partition: i32,
    pub offset: i64,
}

impl fmt::Display for MessagePosition {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}@{}", self.partition, self.offset)
    }
}

#[derive(Clone, Debug)]
pub struct SourceMessage {
    /// Raw bytes, not yet validated. Kafka allows messages without a payload.
    pub payload: Option<Vec<u8>>,
    pub position: MessagePosition,
}

/// A stream of raw messages from the events topic.
#[async_trait]
pub trait EventSource: Send + Sync {
    async fn recv(&self) -> Result<SourceMessage, RecvError>;

    /// Mark everything up to and including `position` as consumed.
    fn commit(&self, position: &MessagePosition) -> Result<(), RecvError>;
}

/// Reads the events topic as part of a consumer group.
///
/// Offsets are stored explicitly through `commit` and flushed to the broker by
/// the client's periodic auto-commit.
pub struct KafkaSource {
    consumer: StreamConsumer,
    topic: String,
}

impl KafkaSource {
    pub fn new(config: &KafkaConfig, group: &str, offset_reset: &str) -> Result<Self, KafkaError> {
        info!(
            "subscribing to topic '{}' as group '{}'...",
            config.kafka_topic, group
        );

        let client_config = consumer_config(config, group, offset_reset);
        debug!("rdkafka configuration: {:?}", client_config);
        let consumer: StreamConsumer = client_config.create()?;
        consumer.subscribe(&[config.kafka_topic.as_str()])?;

        Ok(Self {
            consumer,
            topic: config.kafka_topic.to_owned(),
        })
    }
}

fn consumer_config(config: &KafkaConfig, group: &str, offset_reset: &str) -> ClientConfig {
    let mut client_config = ClientConfig::new();
    client_config
        .set("bootstrap.servers", &config.kafka_hosts)
        .set("group.id", group)
        .set("auto.offset.reset", offset_reset)
        .set("enable.auto.commit", "true")
        .set("enable.auto.offset.store", "false");

    if config.kafka_tls {
        client_config
            .set("security.protocol", "ssl")
            .set("enable.ssl.certificate.verification", "false");
    };

    client_config
}

#[async_trait]
impl EventSource for KafkaSource {
    async fn recv(&self) -> Result<SourceMessage, RecvError> {
        let message = self.consumer.recv().await?;

        Ok(SourceMessage {
            payload: message.payload().map(|p| p.to_vec()),
            position: MessagePosition {
                partition: message.partition(),
                offset: message.offset(),
            },
        })
    }

    fn commit(&self, position: &MessagePosition) -> Result<(), RecvError> {
        self.consumer
            .store_offset(&self.topic, position.partition, position.offset)?;
        Ok(())
    }
}
