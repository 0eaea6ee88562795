use pipeline_common::bootstrap::BootstrapError;
use pipeline_common::metrics::MetricsError;
use rdkafka::error::KafkaError;
use thiserror::Error;

use crate::generator::PacingError;

/// Enumeration of errors that stop the producer from starting or shutting down cleanly.
#[derive(Error, Debug)]
pub enum ProducerError {
    #[error("could not initialize Kafka topic: {0}")]
    BootstrapError(#[from] BootstrapError),
    #[error("a Kafka client error occurred: {0}")]
    KafkaError(#[from] KafkaError),
    #[error("failed to set up metrics: {0}")]
    MetricsError(#[from] MetricsError),
    #[error("invalid pacing configuration: {0}")]
    PacingError(#[from] PacingError),
}
