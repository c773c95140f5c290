//! Dispatch statistics

/// Blend a latency sample into a running average.
///
/// The average moves halfway toward each new sample, so the first sample
/// lands at half its value and recent samples dominate quickly.
pub fn blend(average_ms: f64, sample_ms: f64) -> f64 {
    (average_ms + sample_ms) / 2.0
}

/// Point-in-time copy of the dispatch counters
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TaskStats {
    /// Task requests sent
    pub tasks_dispatched: u64,
    /// Task responses received, including failures
    pub tasks_completed: u64,
    /// Task responses that carried an error
    pub tasks_failed: u64,
    /// Tasks swept or dropped without a response
    pub tasks_expired: u64,
    /// Blended average response time over all agents
    pub avg_response_time_ms: f64,
}

/// Global dispatch counters
#[derive(Debug, Default)]
pub struct StatsCollector {
    stats: TaskStats,
}

impl StatsCollector {
    /// Create an empty collector
    pub fn new() -> Self {
        Self::default()
    }

    /// Count a sent task request
    pub fn record_dispatch(&mut self) {
        self.stats.tasks_dispatched += 1;
    }

    /// Count a task response and fold its latency into the average
    pub fn record_completion(&mut self, elapsed_ms: f64, failed: bool) {
        self.stats.tasks_completed += 1;
        if failed {
            self.stats.tasks_failed += 1;
        }
        self.stats.avg_response_time_ms = blend(self.stats.avg_response_time_ms, elapsed_ms);
    }

    /// Count a task that will never be answered
    pub fn record_expiry(&mut self) {
        self.stats.tasks_expired += 1;
    }

    /// Current counters
    pub fn snapshot(&self) -> TaskStats {
        self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blend_halves_toward_sample() {
        assert_eq!(blend(0.0, 100.0), 50.0);
        assert_eq!(blend(50.0, 100.0), 75.0);
        assert_eq!(blend(75.0, 25.0), 50.0);
    }

    #[test]
    fn test_collector_counts() {
        let mut stats = StatsCollector::new();
        stats.record_dispatch();
        stats.record_dispatch();
        stats.record_completion(40.0, false);
        stats.record_completion(80.0, true);
        stats.record_expiry();

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.tasks_dispatched, 2);
        assert_eq!(snapshot.tasks_completed, 2);
        assert_eq!(snapshot.tasks_failed, 1);
        assert_eq!(snapshot.tasks_expired, 1);
        assert_eq!(snapshot.avg_response_time_ms, 50.0);
    }
}
