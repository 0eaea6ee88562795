//! Publish synthetic user activity events to Kafka.
use envconfig::Envconfig;
use rand::rngs::StdRng;
use rand::SeedableRng;
use tokio_util::sync::CancellationToken;

use event_producer::config::Config;
use event_producer::error::ProducerError;
use event_producer::generator::EventGenerator;
use event_producer::producer::ProducerLoop;
use event_producer::publisher::KafkaPublisher;
use pipeline_common::bootstrap::{KafkaConnector, TopicBootstrapper};
use pipeline_common::metrics::{serve, setup_metrics_router, MetricsRegistry};
use pipeline_common::shutdown::cancel_on_shutdown_signal;
use pipeline_common::time::SystemTime;

#[tokio::main]
async fn main() -> Result<(), ProducerError> {
    tracing_subscriber::fmt::init();

    let config = Config::init_from_env().expect("Invalid configuration:");

    let shutdown = CancellationToken::new();
    cancel_on_shutdown_signal(shutdown.clone());

    let pacing = config.pacing()?;

    let registry = MetricsRegistry::new()?;
    let produced = registry.counter(
        &config.produced_metric_name,
        "Total number of events produced",
    );
    let handle = registry.install()?;

    let bind = config.metrics_server.bind();
    let server_shutdown = shutdown.clone();
    tokio::task::spawn(async move {
        let router = setup_metrics_router("event-producer", handle);
        if let Err(e) = serve(router, &bind, server_shutdown.clone()).await {
            tracing::error!("failed to serve metrics on {}: {}", bind, e);
            server_shutdown.cancel();
        }
    });

    let bootstrapper = TopicBootstrapper::new(
        KafkaConnector::new(
            config.kafka.clone(),
            config.bootstrap_metadata_timeout_ms.0,
        ),
        config.retry_policy(),
    );
    let report = bootstrapper
        .ensure_topic(&config.topic_spec(), &shutdown)
        .await?;
    tracing::debug!("topic bootstrap: {:?}", report);

    let publisher = KafkaPublisher::new(&config.kafka)?;
    let generator = EventGenerator::new(
        StdRng::from_entropy(),
        SystemTime {},
        config.user_pool_size,
    );

    tracing::info!(
        "producing to '{}' every {:?} to {:?}",
        config.kafka.kafka_topic,
        config.pacing_min_ms.0,
        config.pacing_max_ms.0
    );
    let mut producer = ProducerLoop::new(publisher, generator, pacing, produced);
    producer.run(&shutdown).await;

    producer.into_publisher().flush()?;
    tracing::info!("Producer closed.");

    Ok(())
}
