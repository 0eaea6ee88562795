pub trait TimeSource {
    // Return the current time as milliseconds since the Unix epoch
    fn current_millis(&self) -> i64;
}

#[derive(Clone)]
pub struct SystemTime {}

impl TimeSource for SystemTime {
    fn current_millis(&self) -> i64 {
        let nanos = time::OffsetDateTime::now_utc().unix_timestamp_nanos();

        (nanos / 1_000_000) as i64
    }
}

/// A clock stuck at a given instant, for tests and replays.
#[derive(Clone, Debug)]
pub struct FixedTime {
    pub millis: i64,
}

impl TimeSource for FixedTime {
    fn current_millis(&self) -> i64 {
        self.millis
    }
}

impl<T: TimeSource + ?Sized> TimeSource for &T {
    fn current_millis(&self) -> i64 {
        (**self).current_millis()
    }
}
