use pipeline_common::metrics::MetricsError;
use rdkafka::error::KafkaError;
use thiserror::Error;

use crate::sink::StoreError;

/// Enumeration of errors that stop the consumer from starting.
#[derive(Error, Debug)]
pub enum ConsumerError {
    #[error("a Kafka client error occurred: {0}")]
    KafkaError(#[from] KafkaError),
    #[error("failed to set up the event store: {0}")]
    StoreError(#[from] StoreError),
    #[error("failed to set up metrics: {0}")]
    MetricsError(#[from] MetricsError),
}
