/// Number of raw samples the main loop's filter keeps.
pub const FILTER_WINDOW: usize = 5;

/// Median over the last `N` raw samples.
#[derive(Debug, Clone)]
pub struct SampleFilter<const N: usize> {
    samples: [f32; N],
    pos: usize,
    count: usize,
}

impl<const N: usize> SampleFilter<N> {
    pub const fn new() -> Self {
        Self {
            samples: [0.0; N],
            pos: 0,
            count: 0,
        }
    }

    /// Stores `value`, overwriting the oldest sample once full, and returns the median.
    pub fn push(&mut self, value: f32) -> f32 {
        self.samples[self.pos] = value;
        self.pos = (self.pos + 1) % N;
        self.count = (self.count + 1).min(N);
        self.median()
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn clear(&mut self) {
        self.pos = 0;
        self.count = 0;
    }

    fn median(&self) -> f32 {
        let mut scratch = self.samples;
        let held = &mut scratch[..self.count];

        // Bubble sort, stopping after the first pass without swaps.
        for pass in 0..held.len().saturating_sub(1) {
            let mut swapped = false;
            for j in 0..held.len() - pass - 1 {
                if held[j] > held[j + 1] {
                    held.swap(j, j + 1);
                    swapped = true;
                }
            }
            if !swapped {
                break;
            }
        }

        held[(held.len() - 1) / 2]
    }
}

impl<const N: usize> Default for SampleFilter<N> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn first_sample_is_its_own_median() {
        let mut filter = SampleFilter::<5>::new();
        assert_eq!(filter.push(21.5), 21.5);
        assert_eq!(filter.len(), 1);
    }

    #[test]
    fn even_count_takes_lower_middle() {
        let mut filter = SampleFilter::<5>::new();
        filter.push(4.0);
        filter.push(1.0);
        filter.push(3.0);
        assert_eq!(filter.push(2.0), 2.0);
    }

    #[test]
    fn single_spike_is_rejected() {
        let mut filter = SampleFilter::<5>::new();
        for value in [20.0, 20.1, 19.9, 20.0] {
            filter.push(value);
        }
        assert_eq!(filter.push(85.0), 20.0);
    }

    #[test]
    fn oldest_sample_is_overwritten_when_full() {
        let mut filter = SampleFilter::<3>::new();
        filter.push(1.0);
        filter.push(2.0);
        filter.push(3.0);
        filter.push(10.0);
        // Held: 10, 2, 3.
        assert_eq!(filter.push(11.0), 10.0);
        assert_eq!(filter.len(), 3);
    }

    #[test]
    fn sustained_sensor_loss_reaches_the_median() {
        let mut filter = SampleFilter::<FILTER_WINDOW>::new();
        for _ in 0..FILTER_WINDOW {
            filter.push(22.0);
        }
        assert_eq!(filter.push(-127.0), 22.0);
        assert_eq!(filter.push(-127.0), 22.0);
        assert_eq!(filter.push(-127.0), -127.0);
    }

    #[test]
    fn median_stays_within_held_range() {
        // Deterministic LCG so the sweep is reproducible without extra crates.
        let mut seed: u32 = 0x1234_5678;
        let mut next = move || {
            seed = seed.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
            (seed >> 8) as f32 / 65_536.0 - 128.0
        };

        let mut filter = SampleFilter::<7>::new();
        let mut history = Vec::new();
        for _ in 0..2_000 {
            let value = next();
            history.push(value);
            let median = filter.push(value);

            let held = &history[history.len().saturating_sub(7)..];
            let min = held.iter().copied().fold(f32::INFINITY, f32::min);
            let max = held.iter().copied().fold(f32::NEG_INFINITY, f32::max);
            assert!(
                (min..=max).contains(&median),
                "median {median} outside [{min}, {max}]"
            );
            assert!(held.contains(&median));
        }
    }

    #[test]
    fn clear_forgets_samples() {
        let mut filter = SampleFilter::<5>::new();
        filter.push(1.0);
        filter.push(2.0);
        filter.clear();
        assert!(filter.is_empty());
        assert_eq!(filter.push(7.0), 7.0);
    }
}
