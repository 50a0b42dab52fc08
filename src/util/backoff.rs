use std::cmp::min;

/// Counts timer ticks and decides on which ticks something (a channel search) is (re)sent. The
///  gap between sends grows by a configured factor up to a maximum number of ticks, and a reset
///  restarts at the initial gap.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    counter: u32,
    send_threshold: u32,

    initial_threshold: u32,
    max_threshold: u32,
    threshold_factor_eighths: u32,
}

impl ExponentialBackoff {
    pub fn new(initial_threshold: u32, max_threshold: u32, threshold_factor_eighths: u32) -> Self {
        assert!(threshold_factor_eighths >= 8, "back-off must not shrink");
        assert!(initial_threshold >= 1);

        ExponentialBackoff {
            counter: 0,
            send_threshold: initial_threshold,
            initial_threshold,
            max_threshold: max_threshold.max(initial_threshold),
            threshold_factor_eighths,
        }
    }

    #[must_use]
    pub fn should_send(&mut self, reset: bool) -> bool {
        if reset {
            self.counter = 0;
            self.send_threshold = self.initial_threshold;
            return true;
        }

        self.counter += 1;
        if self.counter < self.send_threshold {
            return false;
        }

        self.counter = 0;
        // factor 1 would never grow beyond 1 with integer arithmetic
        self.send_threshold = ((self.send_threshold * self.threshold_factor_eighths) >> 3).max(self.send_threshold + 1);
        self.send_threshold = min(self.send_threshold, self.max_threshold);
        true
    }
}
