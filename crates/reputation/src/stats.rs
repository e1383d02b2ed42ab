use std::time::{SystemTime, UNIX_EPOCH};

/// A sliding window of one-second counter buckets, used for the request
/// statistics surfaced by the front-ends.
///
/// Advancing the current bucket zeroes every skipped second, so the window
/// stays correct across idle periods and forward clock jumps.
pub struct StatisticsRing {
    buckets: Vec<u64>,
    current: usize,
    current_time: u64,
    total: u64,
}

impl StatisticsRing {
    pub const DEFAULT_WINDOW: usize = 300;

    pub fn new(seconds: usize) -> Self {
        Self {
            buckets: vec![0; seconds.max(1)],
            current: 0,
            current_time: wall_clock(),
            total: 0,
        }
    }

    pub fn report(&mut self) {
        self.report_at(wall_clock());
    }

    /// Mean count per bucket across the window.
    pub fn average(&mut self) -> u64 {
        self.average_at(wall_clock())
    }

    /// Lifetime count, unaffected by the window.
    pub fn total(&self) -> u64 {
        self.total
    }

    fn report_at(&mut self, now: u64) {
        self.total += 1;
        self.advance(now);
        self.buckets[self.current] += 1;
    }

    fn average_at(&mut self, now: u64) -> u64 {
        self.advance(now);
        self.buckets.iter().sum::<u64>() / self.buckets.len() as u64
    }

    fn advance(&mut self, now: u64) {
        if now <= self.current_time {
            return;
        }
        let jumped = now - self.current_time;
        if jumped as usize >= self.buckets.len() {
            // The whole window has aged out.
            self.buckets.iter_mut().for_each(|b| *b = 0);
        } else {
            for _ in 0..jumped {
                self.current = (self.current + 1) % self.buckets.len();
                self.buckets[self.current] = 0;
            }
        }
        self.current_time = now;
    }
}

impl Default for StatisticsRing {
    fn default() -> Self {
        Self::new(Self::DEFAULT_WINDOW)
    }
}

fn wall_clock() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

#[cfg(test)]
mod test {
    use super::*;

    fn ring_at(seconds: usize, start: u64) -> StatisticsRing {
        let mut ring = StatisticsRing::new(seconds);
        ring.current_time = start;
        ring
    }

    #[test]
    fn test_average_over_window() {
        let mut ring = ring_at(10, 100);
        for t in 100..110 {
            ring.report_at(t);
            ring.report_at(t);
        }
        assert_eq!(ring.average_at(109), 2);
        assert_eq!(ring.total(), 20);
    }

    #[test]
    fn test_idle_seconds_zero_out() {
        let mut ring = ring_at(10, 100);
        for _ in 0..30 {
            ring.report_at(100);
        }
        assert_eq!(ring.average_at(100), 3);

        // Five idle seconds halve the window sum.
        assert_eq!(ring.average_at(105), 3);
        ring.report_at(105);
        assert_eq!(ring.total(), 31);

        // Once the whole window has aged out only fresh counts remain.
        assert_eq!(ring.average_at(200), 0);
        assert_eq!(ring.total(), 31);
    }

    #[test]
    fn test_clock_standing_still() {
        let mut ring = ring_at(5, 50);
        ring.report_at(50);
        ring.report_at(50);
        ring.report_at(49); // A backwards step lands in the current bucket.
        assert_eq!(ring.total(), 3);
        assert_eq!(ring.average_at(50), 0); // 3 / 5 rounds down.
    }
}
