use std::time::Duration;

use rdkafka::error::{KafkaError, RDKafkaErrorCode};

/// How a failed topic creation request is handled.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CreateErrorClass {
    /// Someone else created the topic first, nothing left to do.
    AlreadyExists,
    /// The controller is not ready yet, the same request may succeed later.
    Transient,
    NonRetryable,
}

/// Topic creation error codes that are not fatal. Anything else is non-retryable.
const CREATE_ERROR_CLASSES: &[(RDKafkaErrorCode, CreateErrorClass)] = &[
    (
        RDKafkaErrorCode::TopicAlreadyExists,
        CreateErrorClass::AlreadyExists,
    ),
    // A freshly started broker reports this until it has registered itself
    (
        RDKafkaErrorCode::InvalidReplicationFactor,
        CreateErrorClass::Transient,
    ),
    (RDKafkaErrorCode::NotController, CreateErrorClass::Transient),
];

pub fn classify_create_error(error: &KafkaError) -> CreateErrorClass {
    error
        .rdkafka_error_code()
        .and_then(|code| {
            CREATE_ERROR_CLASSES
                .iter()
                .find(|(known, _)| *known == code)
                .map(|(_, class)| *class)
        })
        .unwrap_or(CreateErrorClass::NonRetryable)
}

/// What to do after an attempt.
#[derive(Debug)]
pub enum Decision {
    Done,
    /// Treated as success: the desired state already holds.
    Exists,
    Retry(Duration),
    Abort(Failure),
}

#[derive(Debug)]
pub enum Failure {
    Exhausted { attempts: u32, last_error: KafkaError },
    NonRetryable(KafkaError),
}

#[derive(Copy, Clone, Debug)]
/// The retry policy that the topic bootstrapper uses for both of its phases.
pub struct RetryPolicy {
    /// Attempts allowed per phase, including the first one.
    max_attempts: u32,
    /// Fixed wait between two attempts.
    retry_interval: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, retry_interval: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            retry_interval,
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Decide after the `attempt`-th (1-based) try at reaching the broker failed.
    /// Every connection error is worth retrying: returns the delay before the next
    /// attempt, or the failure once attempts are exhausted.
    pub fn on_connect_failure(
        &self,
        attempt: u32,
        error: KafkaError,
    ) -> Result<Duration, Failure> {
        self.retry_or_exhausted(attempt, error)
    }

    /// Decide after the `attempt`-th (1-based) try at creating the topic.
    pub fn on_create(&self, attempt: u32, result: Result<(), KafkaError>) -> Decision {
        match result {
            Ok(()) => Decision::Done,
            Err(error) => match classify_create_error(&error) {
                CreateErrorClass::AlreadyExists => Decision::Exists,
                CreateErrorClass::Transient => match self.retry_or_exhausted(attempt, error) {
                    Ok(delay) => Decision::Retry(delay),
                    Err(failure) => Decision::Abort(failure),
                },
                CreateErrorClass::NonRetryable => Decision::Abort(Failure::NonRetryable(error)),
            },
        }
    }

    fn retry_or_exhausted(&self, attempt: u32, error: KafkaError) -> Result<Duration, Failure> {
        if attempt >= self.max_attempts {
            Err(Failure::Exhausted {
                attempts: attempt,
                last_error: error,
            })
        } else {
            Ok(self.retry_interval)
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            retry_interval: Duration::from_secs(3),
        }
    }
}
