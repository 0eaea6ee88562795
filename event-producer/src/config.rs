use envconfig::Envconfig;
use pipeline_common::bootstrap::TopicSpec;
use pipeline_common::config::{EnvMsDuration, KafkaConfig, MetricsServerConfig};
use pipeline_common::retry::RetryPolicy;

use crate::generator::{Pacing, PacingError};

#[derive(Envconfig, Clone)]
pub struct Config {
    #[envconfig(nested = true)]
    pub kafka: KafkaConfig,

    #[envconfig(nested = true)]
    pub metrics_server: MetricsServerConfig,

    #[envconfig(default = "1")]
    pub topic_partitions: i32,

    #[envconfig(default = "1")]
    pub topic_replication_factor: i32,

    #[envconfig(default = "5")]
    pub bootstrap_max_attempts: u32,

    #[envconfig(default = "3000")]
    pub bootstrap_retry_interval_ms: EnvMsDuration,

    #[envconfig(default = "10000")]
    pub bootstrap_metadata_timeout_ms: EnvMsDuration,

    #[envconfig(default = "1000")]
    pub pacing_min_ms: EnvMsDuration,

    #[envconfig(default = "2500")]
    pub pacing_max_ms: EnvMsDuration,

    #[envconfig(default = "500")]
    pub pacing_step_ms: EnvMsDuration,

    #[envconfig(default = "10")]
    pub user_pool_size: u32,

    #[envconfig(default = "events_produced_total")]
    pub produced_metric_name: String,
}

impl Config {
    pub fn topic_spec(&self) -> TopicSpec {
        TopicSpec {
            name: self.kafka.kafka_topic.clone(),
            partitions: self.topic_partitions,
            replication_factor: self.topic_replication_factor,
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.bootstrap_max_attempts,
            self.bootstrap_retry_interval_ms.0,
        )
    }

    pub fn pacing(&self) -> Result<Pacing, PacingError> {
        Pacing::new(
            self.pacing_min_ms.0,
            self.pacing_max_ms.0,
            self.pacing_step_ms.0,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::time::Duration;

    #[test]
    fn loads_defaults() {
        let config = Config::init_from_hashmap(&HashMap::new()).expect("failed to load defaults");

        assert_eq!(config.kafka.kafka_hosts, "kafka:19092");
        assert_eq!(config.metrics_server.bind(), "0.0.0.0:8080");
        assert_eq!(
            config.topic_spec(),
            TopicSpec {
                name: "user_events".to_string(),
                partitions: 1,
                replication_factor: 1,
            }
        );
        assert_eq!(config.retry_policy().max_attempts(), 5);
        assert_eq!(config.bootstrap_retry_interval_ms.0, Duration::from_secs(3));
        assert!(config.pacing().is_ok());
        assert_eq!(config.produced_metric_name, "events_produced_total");
    }

    #[test]
    fn rejects_inverted_pacing() {
        let env = HashMap::from([
            ("PACING_MIN_MS".to_string(), "3000".to_string()),
            ("PACING_MAX_MS".to_string(), "1000".to_string()),
        ]);
        let config = Config::init_from_hashmap(&env).expect("failed to load config");

        assert!(config.pacing().is_err());
    }
}
