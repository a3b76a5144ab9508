use std::time::{Duration, SystemTime, UNIX_EPOCH};

pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

/// Sleep schedule for store polling: starts at `initial`, grows by `factor`
/// each round and never exceeds `max`.
#[derive(Clone, Debug)]
pub struct AdaptiveBackoff {
    next: Duration,
    max: Duration,
    factor: f64,
}

impl AdaptiveBackoff {
    pub fn new(initial: Duration, max: Duration, factor: f64) -> Self {
        Self {
            next: initial.min(max),
            max,
            factor: factor.max(1.0),
        }
    }

    pub fn next_delay(&mut self) -> Duration {
        let delay = self.next;
        if self.next < self.max {
            self.next = self.next.mul_f64(self.factor).min(self.max);
        }
        delay
    }
}
