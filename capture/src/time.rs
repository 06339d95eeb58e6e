use std::sync::{Arc, Mutex, PoisonError};

use time::OffsetDateTime;

pub trait TimeSource {
    // Wall-clock time used for commit keys and retention cutoffs
    fn now(&self) -> OffsetDateTime;
}

#[derive(Clone)]
pub struct SystemTime {}

impl TimeSource for SystemTime {
    fn now(&self) -> OffsetDateTime {
        OffsetDateTime::now_utc()
    }
}

/// A clock that only moves when told to. Lets tests commit entries "in the past"
/// and run retention sweeps against a known cutoff.
#[derive(Clone)]
pub struct ManualTime {
    now: Arc<Mutex<OffsetDateTime>>,
}

impl ManualTime {
    pub fn new(start: OffsetDateTime) -> Self {
        Self {
            now: Arc::new(Mutex::new(start)),
        }
    }

    pub fn set(&self, at: OffsetDateTime) {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner) = at;
    }

    pub fn advance(&self, by: time::Duration) {
        let mut now = self.now.lock().unwrap_or_else(PoisonError::into_inner);
        *now += by;
    }
}

impl TimeSource for ManualTime {
    fn now(&self) -> OffsetDateTime {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn manual_time_moves_only_when_told() {
        let clock = ManualTime::new(datetime!(2024-01-01 00:00 UTC));
        assert_eq!(clock.now(), datetime!(2024-01-01 00:00 UTC));

        clock.advance(time::Duration::hours(1));
        assert_eq!(clock.now(), datetime!(2024-01-01 01:00 UTC));

        clock.set(datetime!(2023-06-01 12:30 UTC));
        assert_eq!(clock.now(), datetime!(2023-06-01 12:30 UTC));
    }
}
