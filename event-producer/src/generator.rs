use std::time::Duration;

use pipeline_common::event::{Event, EventType};
use pipeline_common::time::TimeSource;
use rand::seq::SliceRandom;
use rand::Rng;
use thiserror::Error;

pub const URLS: [&str; 6] = [
    "/home",
    "/product/a",
    "/product/b",
    "/checkout",
    "/blog",
    "/about",
];

/// Synthesizes plausible user activity.
pub struct EventGenerator<R, T> {
    rng: R,
    clock: T,
    user_pool_size: u32,
}

impl<R: Rng, T: TimeSource> EventGenerator<R, T> {
    pub fn new(rng: R, clock: T, user_pool_size: u32) -> Self {
        Self {
            rng,
            clock,
            user_pool_size: user_pool_size.max(1),
        }
    }

    /// An event from a random user of the pool, timestamped now.
    pub fn generate(&mut self) -> Event {
        let user = self.rng.gen_range(1..=self.user_pool_size);
        let event_type = *EventType::ALL
            .choose(&mut self.rng)
            .unwrap_or(&EventType::View);
        let url = URLS.choose(&mut self.rng).unwrap_or(&URLS[0]);

        Event {
            user_id: format!("user_{}", user),
            event_type,
            timestamp: self.clock.current_millis(),
            url: url.to_string(),
        }
    }
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum PacingError {
    #[error("pacing step must be greater than zero")]
    ZeroStep,
    #[error("pacing maximum {max:?} is lower than its minimum {min:?}")]
    InvertedBounds { min: Duration, max: Duration },
}

/// Irregular delays between two produced events, drawn uniformly from
/// `min, min + step, ..., max`.
#[derive(Clone, Copy, Debug)]
pub struct Pacing {
    min: Duration,
    step: Duration,
    steps: u32,
}

impl Pacing {
    pub fn new(min: Duration, max: Duration, step: Duration) -> Result<Self, PacingError> {
        if step.is_zero() {
            return Err(PacingError::ZeroStep);
        }
        if max < min {
            return Err(PacingError::InvertedBounds { min, max });
        }

        let span = (max - min).as_millis() / step.as_millis().max(1);
        Ok(Self {
            min,
            step,
            steps: u32::try_from(span).unwrap_or(u32::MAX - 1) + 1,
        })
    }

    pub fn next_delay<R: Rng + ?Sized>(&self, rng: &mut R) -> Duration {
        self.min + self.step * rng.gen_range(0..self.steps)
    }
}

impl Default for Pacing {
    fn default() -> Self {
        Self {
            min: Duration::from_millis(1000),
            step: Duration::from_millis(500),
            steps: 4,
        }
    }
}
