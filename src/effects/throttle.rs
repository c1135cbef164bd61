use std::time::Duration;

/// Rate limiter for non-audio parameter refresh: fires at most once per
/// `interval`, independent of the render frame rate. Driven by the caller's
/// clock so export renders stay deterministic.
#[derive(Clone, Copy, Debug)]
pub struct Throttle {
    interval: Duration,
    last: Option<Duration>,
}

impl Throttle {
    pub fn new(interval: Duration) -> Self {
        Self { interval, last: None }
    }

    pub fn from_millis(ms: u64) -> Self {
        Self::new(Duration::from_millis(ms))
    }

    /// True if enough time has passed since the last firing; records `now`
    /// as the new firing time when it returns true.
    pub fn ready(&mut self, now: Duration) -> bool {
        let due = match self.last {
            None => true,
            Some(last) => now < last || now - last >= self.interval,
        };
        if due {
            self.last = Some(now);
        }
        due
    }

    pub fn reset(&mut self) {
        self.last = None;
    }
}
