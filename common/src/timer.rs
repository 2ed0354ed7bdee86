/// Milliseconds from `since` to `now` on a wrapping 32-bit counter.
pub fn elapsed_ms(now_ms: u32, since_ms: u32) -> u32 {
    now_ms.wrapping_sub(since_ms)
}

/// A periodic deadline on the wrapping millisecond clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ticker {
    last_ms: u32,
}

impl Ticker {
    /// Starts counting from `now_ms`; the first trigger is one interval later.
    pub const fn new(now_ms: u32) -> Self {
        Self { last_ms: now_ms }
    }

    pub fn is_due(&self, now_ms: u32, interval_ms: u32) -> bool {
        elapsed_ms(now_ms, self.last_ms) >= interval_ms
    }

    pub fn fire(&mut self, now_ms: u32) {
        self.last_ms = now_ms;
    }

    /// Fires and returns `true` when due.
    pub fn poll(&mut self, now_ms: u32, interval_ms: u32) -> bool {
        if self.is_due(now_ms, interval_ms) {
            self.fire(now_ms);
            true
        } else {
            false
        }
    }

    pub fn last_ms(&self) -> u32 {
        self.last_ms
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn due_exactly_at_interval() {
        let ticker = Ticker::new(1_000);
        assert!(!ticker.is_due(1_999, 1_000));
        assert!(ticker.is_due(2_000, 1_000));
    }

    #[test]
    fn poll_rearms_from_trigger_time() {
        let mut ticker = Ticker::new(0);
        assert!(ticker.poll(1_250, 1_000));
        assert_eq!(ticker.last_ms(), 1_250);
        assert!(!ticker.poll(2_000, 1_000));
        assert!(ticker.poll(2_250, 1_000));
    }

    #[test]
    fn survives_counter_wraparound() {
        let start = u32::MAX - 300;
        let ticker = Ticker::new(start);

        assert_eq!(elapsed_ms(199, start), 500);
        assert!(!ticker.is_due(100, 500));
        assert!(ticker.is_due(199, 500));
    }

    #[test]
    fn zero_interval_is_always_due() {
        let ticker = Ticker::new(42);
        assert!(ticker.is_due(42, 0));
    }
}
