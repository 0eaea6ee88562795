//! Make sure the events topic exists before anything is produced to it.
use std::time::Duration;

use async_trait::async_trait;
use rdkafka::admin::{AdminClient, AdminOptions, NewTopic, TopicReplication};
use rdkafka::client::DefaultClientContext;
use rdkafka::error::KafkaError;
use rdkafka::ClientConfig;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::KafkaConfig;
use crate::retry::{Decision, Failure, RetryPolicy};
use crate::shutdown::sleep_or_cancelled;

/// The topology the topic is created with.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TopicSpec {
    pub name: String,
    pub partitions: i32,
    pub replication_factor: i32,
}

/// Opens control connections to the broker.
#[async_trait]
pub trait BrokerConnector: Send + Sync {
    type Admin: TopicAdmin;

    async fn connect(&self) -> Result<Self::Admin, KafkaError>;
}

/// A control connection able to create topics.
#[async_trait]
pub trait TopicAdmin: Send + Sync {
    async fn create_topic(&self, topic: &TopicSpec) -> Result<(), KafkaError>;
}

#[derive(Error, Debug)]
pub enum BootstrapError {
    #[error("failed to connect to Kafka after {attempts} attempts (last error: {last_error})")]
    Unreachable { attempts: u32, last_error: KafkaError },
    #[error("failed to create topic {topic} (non-retryable error): {error}")]
    NonRetryable { topic: String, error: KafkaError },
    #[error("failed to create topic {topic} after {attempts} attempts (last error: {last_error})")]
    CreationExhausted {
        topic: String,
        attempts: u32,
        last_error: KafkaError,
    },
    #[error("topic bootstrap was cancelled")]
    Cancelled,
}

/// What it took to get the topic in place.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct BootstrapReport {
    pub connection_attempts: u32,
    pub creation_attempts: u32,
    /// Number of backoff waits across both phases.
    pub waits: u32,
    /// False if the topic was already there.
    pub created: bool,
}

pub struct TopicBootstrapper<C> {
    connector: C,
    policy: RetryPolicy,
}

impl<C: BrokerConnector> TopicBootstrapper<C> {
    pub fn new(connector: C, policy: RetryPolicy) -> Self {
        Self { connector, policy }
    }

    /// Connect to the broker and create `topic` if it does not exist yet.
    /// Any error returned is fatal: the process cannot start producing.
    pub async fn ensure_topic(
        &self,
        topic: &TopicSpec,
        shutdown: &CancellationToken,
    ) -> Result<BootstrapReport, BootstrapError> {
        let mut report = BootstrapReport::default();

        info!("initializing Kafka connection...");
        let admin = self.connect(&mut report, shutdown).await?;

        info!("attempting to create topic '{}'...", topic.name);
        self.create(&admin, topic, &mut report, shutdown).await?;

        Ok(report)
    }

    async fn connect(
        &self,
        report: &mut BootstrapReport,
        shutdown: &CancellationToken,
    ) -> Result<C::Admin, BootstrapError> {
        let max_attempts = self.policy.max_attempts();
        let mut attempt = 0;

        loop {
            attempt += 1;
            report.connection_attempts = attempt;
            info!(
                "attempting to connect to Kafka (attempt {}/{})...",
                attempt, max_attempts
            );

            let connected = tokio::select! {
                _ = shutdown.cancelled() => return Err(BootstrapError::Cancelled),
                connected = self.connector.connect() => connected,
            };

            let error = match connected {
                Ok(admin) => {
                    info!("successfully connected to Kafka");
                    return Ok(admin);
                }
                Err(error) => error,
            };

            match self.policy.on_connect_failure(attempt, error) {
                Ok(delay) => {
                    warn!("Kafka not ready, retrying in {:?}...", delay);
                    Self::wait(delay, report, shutdown).await?;
                }
                Err(Failure::Exhausted {
                    attempts,
                    last_error,
                }) => {
                    return Err(BootstrapError::Unreachable {
                        attempts,
                        last_error,
                    })
                }
                Err(Failure::NonRetryable(last_error)) => {
                    return Err(BootstrapError::Unreachable {
                        attempts: attempt,
                        last_error,
                    })
                }
            }
        }
    }

    async fn create(
        &self,
        admin: &C::Admin,
        topic: &TopicSpec,
        report: &mut BootstrapReport,
        shutdown: &CancellationToken,
    ) -> Result<(), BootstrapError> {
        let max_attempts = self.policy.max_attempts();
        let mut attempt = 0;

        loop {
            attempt += 1;
            report.creation_attempts = attempt;

            let result = admin.create_topic(topic).await;
            if let Err(error) = &result {
                debug!("create topic attempt {} failed: {}", attempt, error);
            }

            match self.policy.on_create(attempt, result) {
                Decision::Done => {
                    info!("topic '{}' created successfully", topic.name);
                    report.created = true;
                    return Ok(());
                }
                Decision::Exists => {
                    info!("topic '{}' already exists, skipping creation", topic.name);
                    return Ok(());
                }
                Decision::Retry(delay) => {
                    warn!(
                        "Kafka controller not ready, retrying in {:?}... (attempt {}/{})",
                        delay, attempt, max_attempts
                    );
                    Self::wait(delay, report, shutdown).await?;
                }
                Decision::Abort(Failure::NonRetryable(error)) => {
                    return Err(BootstrapError::NonRetryable {
                        topic: topic.name.clone(),
                        error,
                    })
                }
                Decision::Abort(Failure::Exhausted {
                    attempts,
                    last_error,
                }) => {
                    return Err(BootstrapError::CreationExhausted {
                        topic: topic.name.clone(),
                        attempts,
                        last_error,
                    })
                }
            }
        }
    }

    async fn wait(
        delay: Duration,
        report: &mut BootstrapReport,
        shutdown: &CancellationToken,
    ) -> Result<(), BootstrapError> {
        report.waits += 1;
        if sleep_or_cancelled(shutdown, delay).await {
            Ok(())
        } else {
            Err(BootstrapError::Cancelled)
        }
    }
}

/// Connects to the brokers listed in `KafkaConfig` through an rdkafka `AdminClient`.
pub struct KafkaConnector {
    config: KafkaConfig,
    metadata_timeout: Duration,
}

impl KafkaConnector {
    pub fn new(config: KafkaConfig, metadata_timeout: Duration) -> Self {
        Self {
            config,
            metadata_timeout,
        }
    }
}

#[async_trait]
impl BrokerConnector for KafkaConnector {
    type Admin = KafkaTopicAdmin;

    async fn connect(&self) -> Result<KafkaTopicAdmin, KafkaError> {
        let mut client_config = ClientConfig::new();
        client_config.set("bootstrap.servers", &self.config.kafka_hosts);

        if self.config.kafka_tls {
            client_config
                .set("security.protocol", "ssl")
                .set("enable.ssl.certificate.verification", "false");
        };

        debug!("rdkafka admin configuration: {:?}", client_config);
        let timeout = self.metadata_timeout;

        // The client connects lazily, "ping" the brokers by requesting metadata.
        // fetch_metadata blocks for up to the timeout, keep it off the runtime threads.
        let (admin, brokers) = tokio::task::spawn_blocking(move || {
            let admin: AdminClient<DefaultClientContext> = client_config.create()?;
            let metadata = admin.inner().fetch_metadata(None, timeout)?;
            let brokers = metadata.brokers().len();
            Ok::<_, KafkaError>((admin, brokers))
        })
        .await
        .map_err(|e| KafkaError::ClientCreation(format!("metadata request aborted: {}", e)))??;
        info!("reached Kafka cluster with {} brokers", brokers);

        Ok(KafkaTopicAdmin {
            admin,
            operation_timeout: self.metadata_timeout,
        })
    }
}

pub struct KafkaTopicAdmin {
    admin: AdminClient<DefaultClientContext>,
    operation_timeout: Duration,
}

#[async_trait]
impl TopicAdmin for KafkaTopicAdmin {
    async fn create_topic(&self, topic: &TopicSpec) -> Result<(), KafkaError> {
        let new_topic = NewTopic::new(
            &topic.name,
            topic.partitions,
            TopicReplication::Fixed(topic.replication_factor),
        );
        let opts = AdminOptions::new().operation_timeout(Some(self.operation_timeout));

        let results = self.admin.create_topics(&[new_topic], &opts).await?;
        for result in results {
            if let Err((_, code)) = result {
                return Err(KafkaError::AdminOp(code));
            }
        }

        Ok(())
    }
}
