use metrics::Counter;
use pipeline_common::shutdown::sleep_or_cancelled;
use pipeline_common::time::TimeSource;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::generator::{EventGenerator, Pacing};
use crate::publisher::EventPublisher;

/// Generates events and publishes them one at a time, until cancelled.
///
/// Each generated event gets exactly one publish attempt: if it fails, the event
/// is logged and dropped and the loop moves on to the next one.
pub struct ProducerLoop<P, R, T> {
    publisher: P,
    generator: EventGenerator<R, T>,
    pacing: Pacing,
    pacing_rng: StdRng,
    /// Incremented for every event the broker acknowledged.
    produced: Counter,
}

impl<P, R, T> ProducerLoop<P, R, T>
where
    P: EventPublisher,
    R: Rng,
    T: TimeSource,
{
    pub fn new(
        publisher: P,
        generator: EventGenerator<R, T>,
        pacing: Pacing,
        produced: Counter,
    ) -> Self {
        Self {
            publisher,
            generator,
            pacing,
            pacing_rng: StdRng::from_entropy(),
            produced,
        }
    }

    pub async fn run(&mut self, shutdown: &CancellationToken) {
        while !shutdown.is_cancelled() {
            self.produce_one().await;

            let delay = self.pacing.next_delay(&mut self.pacing_rng);
            if !sleep_or_cancelled(shutdown, delay).await {
                break;
            }
        }

        info!("producer loop stopped");
    }

    async fn produce_one(&mut self) {
        let event = self.generator.generate();

        let payload = match event.to_json() {
            Ok(payload) => payload,
            Err(e) => {
                error!("error serializing event: {}", e);
                metrics::counter!("events_dropped_total", "cause" => "serialization").increment(1);
                return;
            }
        };

        match self.publisher.publish(&payload).await {
            Ok(()) => {
                self.produced.increment(1);
                info!(
                    "produced event: user_id={}, type={}, url={}",
                    event.user_id, event.event_type, event.url
                );
            }
            Err(e) => {
                error!("failed to write message to Kafka: {}", e);
                metrics::counter!("events_dropped_total", "cause" => "publish").increment(1);
            }
        }
    }

    pub fn into_publisher(self) -> P {
        self.publisher
    }
}
