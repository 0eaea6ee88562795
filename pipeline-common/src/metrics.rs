use std::time::Instant;

use axum::{
    body::Body, extract::MatchedPath, http::Request, middleware::Next, response::IntoResponse,
    routing::get, Router,
};
use metrics::{Counter, Key, KeyName, Level, Metadata, Recorder};
use metrics_exporter_prometheus::{
    BuildError, Matcher, PrometheusBuilder, PrometheusHandle, PrometheusRecorder,
};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

#[derive(Error, Debug)]
pub enum MetricsError {
    #[error("failed to build the prometheus recorder: {0}")]
    Build(#[from] BuildError),
    #[error("a global metrics recorder is already installed")]
    AlreadyInstalled,
}

/// Process-wide metrics, rendered in the Prometheus text format.
///
/// Counters the pipeline depends on are registered explicitly and their handles
/// handed to the loops that increment them. Once `install`ed, the registry also
/// receives everything recorded through the `metrics` macros.
pub struct MetricsRegistry {
    recorder: PrometheusRecorder,
    handle: PrometheusHandle,
}

impl MetricsRegistry {
    pub fn new() -> Result<Self, MetricsError> {
        const BUCKETS: &[f64] = &[
            0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 50.0, 100.0, 250.0,
            500.0, 1000.0, 2500.0, 5000.0,
        ];

        // End-to-end event latency, in milliseconds
        const LATENCY_MS_BUCKETS: &[f64] = &[
            1.0, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 2500.0, 5000.0, 10000.0,
            30000.0, 60000.0,
        ];

        let recorder = PrometheusBuilder::new()
            .set_buckets(BUCKETS)?
            .set_buckets_for_metric(
                Matcher::Full("event_latency_ms".to_string()),
                LATENCY_MS_BUCKETS,
            )?
            .build_recorder();
        let handle = recorder.handle();

        Ok(Self { recorder, handle })
    }

    /// Register a monotonic counter. Counter handles are cheap to clone and can be
    /// incremented concurrently.
    pub fn counter(&self, name: &str, help: &str) -> Counter {
        let metadata = Metadata::new(module_path!(), Level::INFO, Some(module_path!()));
        self.recorder.describe_counter(
            KeyName::from(name.to_owned()),
            None,
            help.to_owned().into(),
        );
        self.recorder
            .register_counter(&Key::from_name(name.to_owned()), &metadata)
    }

    pub fn handle(&self) -> PrometheusHandle {
        self.handle.clone()
    }

    pub fn render(&self) -> String {
        self.handle.render()
    }

    /// Make this registry the global recorder, so the `metrics` macros record into it.
    pub fn install(self) -> Result<PrometheusHandle, MetricsError> {
        let handle = self.handle;
        metrics::set_global_recorder(self.recorder)
            .map_err(|_| MetricsError::AlreadyInstalled)?;

        Ok(handle)
    }
}

/// Bind a `TcpListener` on the provided bind address to serve a `Router` on it,
/// until `shutdown` is cancelled.
pub async fn serve(
    router: Router,
    bind: &str,
    shutdown: CancellationToken,
) -> Result<(), std::io::Error> {
    let listener = tokio::net::TcpListener::bind(bind).await?;
    tracing::info!("serving metrics on {}", bind);

    axum::serve(listener, router)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;

    Ok(())
}

/// Build a Router exposing `handle` on `/metrics`, plus an index naming the service.
pub fn setup_metrics_router(service: &'static str, handle: PrometheusHandle) -> Router {
    Router::new()
        .route("/", get(move || std::future::ready(service)))
        .route("/metrics", get(move || std::future::ready(handle.render())))
        .layer(axum::middleware::from_fn(track_metrics))
}

/// Middleware to record some common HTTP metrics
/// Someday tower-http might provide a metrics middleware: https://github.com/tower-rs/tower-http/issues/57
pub async fn track_metrics(req: Request<Body>, next: Next) -> impl IntoResponse {
    let start = Instant::now();

    let path = if let Some(matched_path) = req.extensions().get::<MatchedPath>() {
        matched_path.as_str().to_owned()
    } else {
        req.uri().path().to_owned()
    };

    let method = req.method().clone();

    let response = next.run(req).await;

    let latency = start.elapsed().as_secs_f64();
    let status = response.status().as_u16().to_string();

    let labels = [
        ("method", method.to_string()),
        ("path", path),
        ("status", status),
    ];

    metrics::counter!("http_requests_total", &labels).increment(1);
    metrics::histogram!("http_requests_duration_seconds", &labels).record(latency);

    response
}
