use std::time::Duration;

/// Base wait budget in minutes for any job.
const BASE_MINUTES: u64 = 20;
/// Hard ceiling so pathological inputs cannot pin resources forever.
const MAX_MINUTES: u64 = 60;
/// File sizes above this many (decimal) megabytes extend the budget.
const SIZE_THRESHOLD_MB: f64 = 50.0;
/// Durations above this many minutes extend the budget.
const DURATION_THRESHOLD_MIN: f64 = 30.0;
/// Seconds between status polls.
pub const POLL_INTERVAL_SECS: u64 = 5;

/// Declared input dimensions, as supplied by the client. Untrusted: either
/// may be zero or wildly wrong, which is why the result is bounded.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct JobDimensions {
    pub size_bytes: u64,
    pub duration_secs: f64,
}

impl JobDimensions {
    pub fn new(size_bytes: u64, duration_secs: f64) -> Self {
        Self {
            size_bytes,
            duration_secs,
        }
    }

    pub fn size_mb(&self) -> f64 {
        self.size_bytes as f64 / 1_000_000.0
    }

    pub fn duration_minutes(&self) -> f64 {
        self.duration_secs / 60.0
    }

    /// Whether the input is large enough that chunking is worth suggesting
    /// in a timeout diagnostic.
    pub fn is_oversized(&self) -> bool {
        self.size_mb() > SIZE_THRESHOLD_MB || self.duration_minutes() > DURATION_THRESHOLD_MIN
    }
}

/// Wait budget for one job's polling loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollBudget {
    pub minutes: u64,
    pub max_attempts: u32,
}

impl PollBudget {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(POLL_INTERVAL_SECS)
    }
}

/// Compute the wait budget for a job from its declared dimensions.
///
/// Pure and deterministic: no clock, no I/O. Linear scaling keeps small
/// inputs fast-failing; the 60-minute cap bounds the worst case.
pub fn estimate(dims: JobDimensions) -> PollBudget {
    let mut minutes = BASE_MINUTES;

    let size_mb = dims.size_mb();
    if size_mb > SIZE_THRESHOLD_MB {
        minutes += (size_mb / SIZE_THRESHOLD_MB).ceil() as u64;
    }

    let duration_min = dims.duration_minutes();
    if duration_min > DURATION_THRESHOLD_MIN {
        minutes += (duration_min / DURATION_THRESHOLD_MIN * 2.0).ceil() as u64;
    }

    let minutes = minutes.min(MAX_MINUTES);
    let max_attempts = (minutes * 60 / POLL_INTERVAL_SECS) as u32;

    PollBudget {
        minutes,
        max_attempts,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MB: u64 = 1_000_000;

    #[test]
    fn unknown_dimensions_get_base_budget() {
        let budget = estimate(JobDimensions::new(0, 0.0));
        assert_eq!(budget.minutes, 20);
        assert_eq!(budget.max_attempts, 20 * 12);
    }

    #[test]
    fn large_file_extends_budget() {
        let budget = estimate(JobDimensions::new(300 * MB, 0.0));
        assert_eq!(budget.minutes, 26);
    }

    #[test]
    fn long_duration_extends_budget() {
        let budget = estimate(JobDimensions::new(0, 3600.0));
        assert_eq!(budget.minutes, 24);
    }

    #[test]
    fn budget_is_capped_at_sixty_minutes() {
        let budget = estimate(JobDimensions::new(10_000_000 * MB, 1_000_000.0));
        assert_eq!(budget.minutes, 60);
        assert_eq!(budget.max_attempts, 60 * 12);
    }

    #[test]
    fn thresholds_are_exclusive() {
        // Exactly at threshold: no extension.
        assert_eq!(estimate(JobDimensions::new(50 * MB, 0.0)).minutes, 20);
        assert_eq!(estimate(JobDimensions::new(0, 30.0 * 60.0)).minutes, 20);
        // Just over: extension kicks in.
        assert!(estimate(JobDimensions::new(51 * MB, 0.0)).minutes > 20);
        assert!(estimate(JobDimensions::new(0, 31.0 * 60.0)).minutes > 20);
    }

    #[test]
    fn estimate_is_monotone_in_both_dimensions() {
        let sizes = [0u64, 10 * MB, 50 * MB, 100 * MB, 500 * MB, 2000 * MB];
        let durations = [0.0, 600.0, 1800.0, 3600.0, 7200.0, 36_000.0];

        for w in sizes.windows(2) {
            for &d in &durations {
                let a = estimate(JobDimensions::new(w[0], d));
                let b = estimate(JobDimensions::new(w[1], d));
                assert!(b.minutes >= a.minutes, "size monotonicity violated");
            }
        }
        for w in durations.windows(2) {
            for &s in &sizes {
                let a = estimate(JobDimensions::new(s, w[0]));
                let b = estimate(JobDimensions::new(s, w[1]));
                assert!(b.minutes >= a.minutes, "duration monotonicity violated");
            }
        }
    }

    #[test]
    fn attempts_follow_poll_interval() {
        let budget = estimate(JobDimensions::new(0, 3600.0));
        assert_eq!(budget.max_attempts as u64, budget.minutes * 60 / 5);
        assert_eq!(budget.poll_interval(), Duration::from_secs(5));
    }

    #[test]
    fn oversized_detection() {
        assert!(JobDimensions::new(200 * MB, 0.0).is_oversized());
        assert!(JobDimensions::new(0, 7200.0).is_oversized());
        assert!(!JobDimensions::new(10 * MB, 120.0).is_oversized());
    }
}
