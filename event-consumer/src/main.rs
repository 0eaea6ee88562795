//! Persist events read from Kafka to MongoDB, with their end-to-end latency.
use envconfig::Envconfig;
use tokio_util::sync::CancellationToken;

use event_consumer::config::Config;
use event_consumer::consumer::ConsumerLoop;
use event_consumer::error::ConsumerError;
use event_consumer::sink::MongoStore;
use event_consumer::source::KafkaSource;
use pipeline_common::metrics::{serve, setup_metrics_router, MetricsRegistry};
use pipeline_common::shutdown::cancel_on_shutdown_signal;
use pipeline_common::time::SystemTime;

#[tokio::main]
async fn main() -> Result<(), ConsumerError> {
    tracing_subscriber::fmt::init();

    let config = Config::init_from_env().expect("Invalid configuration:");

    let shutdown = CancellationToken::new();
    cancel_on_shutdown_signal(shutdown.clone());

    let registry = MetricsRegistry::new()?;
    let consumed = registry.counter(
        &config.consumed_metric_name,
        "Total number of events consumed",
    );
    let handle = registry.install()?;

    let bind = config.metrics_server.bind();
    let server_shutdown = shutdown.clone();
    tokio::task::spawn(async move {
        let router = setup_metrics_router("event-consumer", handle);
        if let Err(e) = serve(router, &bind, server_shutdown.clone()).await {
            tracing::error!("failed to serve metrics on {}: {}", bind, e);
            server_shutdown.cancel();
        }
    });

    let store = MongoStore::connect(
        &config.mongo_uri,
        &config.mongo_database,
        &config.mongo_collection,
        config.mongo_connect_timeout_ms.0,
        config.mongo_server_selection_timeout_ms.0,
    )
    .await?;

    let source = KafkaSource::new(
        &config.kafka,
        &config.kafka_consumer_group,
        &config.kafka_consumer_offset_reset,
    )?;

    let consumer = ConsumerLoop::new(
        source,
        store,
        SystemTime {},
        config.commit_policy,
        config.read_backoff_ms.0,
        consumed,
    );
    consumer.run(&shutdown).await;

    tracing::info!("Consumer closed.");

    Ok(())
}
