use std::time::Duration;

/// Doubling idle interval of the worker loop.
#[derive(Debug, Clone)]
pub(crate) struct IdleBackoff {
    min: Duration,
    max: Duration,
    current: Duration,
}

impl IdleBackoff {
    pub(crate) fn new(min: Duration, max: Duration) -> Self {
        let max = max.max(min);
        Self {
            min,
            max,
            current: min,
        }
    }

    /// The sleep to take for this empty poll; the next one doubles, up to `max`.
    pub(crate) fn on_idle(&mut self) -> Duration {
        let sleep = self.current;
        self.current = self.current.saturating_mul(2).min(self.max);
        sleep
    }

    pub(crate) fn reset(&mut self) {
        self.current = self.min;
    }

    pub(crate) fn min(&self) -> Duration {
        self.min
    }
}
