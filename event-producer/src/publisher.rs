use std::time::Duration;

use async_trait::async_trait;
use metrics::gauge;
use pipeline_common::config::KafkaConfig;
use rdkafka::error::KafkaError;
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::ClientConfig;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Error, Debug)]
pub enum KafkaProduceError {
    #[error("failed to produce to kafka: {error}")]
    KafkaProduceError { error: KafkaError },
    #[error("failed to produce to kafka (timeout)")]
    KafkaProduceCanceled,
}

/// Appends serialized events to the events topic.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Resolves once the broker acknowledged the write, or the write failed for good.
    async fn publish(&self, payload: &[u8]) -> Result<(), KafkaProduceError>;
}

pub struct KafkaContext {}

impl rdkafka::ClientContext for KafkaContext {
    fn stats(&self, stats: rdkafka::Statistics) {
        gauge!("producer_kafka_queue_depth").set(stats.msg_cnt as f64);
        gauge!("producer_kafka_queue_depth_limit").set(stats.msg_max as f64);

        for (_, stats) in stats.brokers {
            gauge!(
                "producer_kafka_broker_requests_pending",
                "broker" => stats.nodeid.to_string()
            )
            .set(stats.outbuf_cnt as f64);
        }
    }
}

pub struct KafkaPublisher {
    producer: FutureProducer<KafkaContext>,
    topic: String,
}

impl KafkaPublisher {
    pub fn new(config: &KafkaConfig) -> Result<Self, KafkaError> {
        info!("connecting to Kafka brokers at {}...", config.kafka_hosts);

        let mut client_config = ClientConfig::new();
        client_config
            .set("bootstrap.servers", &config.kafka_hosts)
            .set("statistics.interval.ms", "10000")
            .set("linger.ms", config.kafka_producer_linger_ms.to_string())
            .set(
                "message.timeout.ms",
                config.kafka_message_timeout_ms.to_string(),
            )
            .set(
                "compression.codec",
                config.kafka_compression_codec.to_owned(),
            );

        if config.kafka_tls {
            client_config
                .set("security.protocol", "ssl")
                .set("enable.ssl.certificate.verification", "false");
        };

        debug!("rdkafka configuration: {:?}", client_config);
        let producer: FutureProducer<KafkaContext> =
            client_config.create_with_context(KafkaContext {})?;

        Ok(Self {
            producer,
            topic: config.kafka_topic.to_owned(),
        })
    }

    /// Wait for queued events to be delivered.
    pub fn flush(&self) -> Result<(), KafkaError> {
        self.producer.flush(Duration::from_secs(30))
    }
}

#[async_trait]
impl EventPublisher for KafkaPublisher {
    async fn publish(&self, payload: &[u8]) -> Result<(), KafkaProduceError> {
        let record = FutureRecord::<(), [u8]>::to(&self.topic).payload(payload);

        let delivery = self
            .producer
            .send_result(record)
            .map_err(|(error, _)| KafkaProduceError::KafkaProduceError { error })?;

        match delivery.await {
            // Cancelled due to timeout while retrying
            Err(_) => Err(KafkaProduceError::KafkaProduceCanceled),
            Ok(Err((error, _))) => Err(KafkaProduceError::KafkaProduceError { error }),
            Ok(Ok(_)) => Ok(()),
        }
    }
}
