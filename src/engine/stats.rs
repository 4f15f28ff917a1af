//! Running duration statistics per task type.
//!
//! The scheduler orders ready tasks of equal deadline by how long they are
//! expected to take, so that cheap tasks go first. Expectations come from the
//! durations previously measured for tasks of the same type, normalised by
//! each task's complexity.

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::Mutex;

/// Number of samples after which the smallest and largest measurements are
/// dropped from the estimate, once.
pub(crate) const OUTLIER_THRESHOLD: u32 = 64;

#[derive(Debug, Clone, Default)]
struct Samples {
    sum: f64,
    sum_sq: f64,
    min: f64,
    max: f64,
    count: u32,
    corrected: bool,
}

impl Samples {
    fn push(&mut self, value: f64) {
        if self.count == 0 {
            self.min = value;
            self.max = value;
        } else {
            self.min = self.min.min(value);
            self.max = self.max.max(value);
        }

        self.sum += value;
        self.sum_sq += value * value;
        self.count += 1;

        if !self.corrected && self.count >= OUTLIER_THRESHOLD {
            self.sum -= self.min + self.max;
            self.sum_sq -= self.min * self.min + self.max * self.max;
            self.count -= 2;
            self.corrected = true;
        }
    }

    fn mean(&self) -> f64 {
        if self.count == 0 {
            return 0.0;
        }
        self.sum / self.count as f64
    }

    fn stddev(&self) -> f64 {
        if self.count == 0 {
            return 0.0;
        }
        let mean = self.mean();
        // rounding can push the variance slightly below zero
        (self.sum_sq / self.count as f64 - mean * mean).max(0.0).sqrt()
    }
}

/// Per-type summary returned by [`DurationStats::snapshot`].
#[derive(Debug, Clone, PartialEq)]
pub struct TypeStats {
    pub type_key: &'static str,
    pub samples: u32,
    pub mean: Duration,
    pub stddev: Duration,
    pub expected: Duration,
}

/// Lock-guarded table of duration samples keyed by task type.
///
/// Each scheduler owns its own table; nothing is shared between scheduler
/// instances.
#[derive(Debug, Default)]
pub struct DurationStats {
    table: Mutex<HashMap<&'static str, Samples>>,
}

impl DurationStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds one sample, in seconds per unit of complexity.
    pub fn record(&self, type_key: &'static str, seconds: f64) {
        self.table.lock().entry(type_key).or_default().push(seconds);
    }

    /// Expected duration in seconds of one unit of complexity of the given
    /// type: the mean plus two standard deviations. Unknown types are
    /// expected to be free.
    pub fn expected(&self, type_key: &str) -> f64 {
        match self.table.lock().get(type_key) {
            Some(samples) => samples.mean() + 2.0 * samples.stddev(),
            None => 0.0,
        }
    }

    pub fn samples(&self, type_key: &str) -> u32 {
        self.table.lock().get(type_key).map_or(0, |s| s.count)
    }

    pub fn snapshot(&self) -> Vec<TypeStats> {
        let table = self.table.lock();
        let mut stats: Vec<_> = table
            .iter()
            .map(|(&type_key, samples)| TypeStats {
                type_key,
                samples: samples.count,
                mean: Duration::from_secs_f64(samples.mean()),
                stddev: Duration::from_secs_f64(samples.stddev()),
                expected: Duration::from_secs_f64(samples.mean() + 2.0 * samples.stddev()),
            })
            .collect();
        stats.sort_by_key(|s| s.type_key);
        stats
    }

    pub fn clear(&self) {
        self.table.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn unknown_type_is_free() {
        let stats = DurationStats::new();
        assert_eq!(stats.expected("nothing"), 0.0);
        assert_eq!(stats.samples("nothing"), 0);
    }

    #[test]
    fn constant_samples_have_no_spread() {
        let stats = DurationStats::new();
        for _ in 0..10 {
            stats.record("tile", 0.5);
        }
        assert!(close(stats.expected("tile"), 0.5));
    }

    #[test]
    fn expected_is_mean_plus_two_stddev() {
        let stats = DurationStats::new();
        stats.record("tile", 1.0);
        stats.record("tile", 3.0);
        // mean 2, stddev 1
        assert!(close(stats.expected("tile"), 4.0));
    }

    #[test]
    fn outliers_are_dropped_once() {
        let stats = DurationStats::new();
        stats.record("tile", 100.0);
        for _ in 0..(OUTLIER_THRESHOLD - 2) {
            stats.record("tile", 1.0);
        }
        stats.record("tile", 0.0);

        // the spike and the dip are gone, the remaining samples are all 1.0
        assert_eq!(stats.samples("tile"), OUTLIER_THRESHOLD - 2);
        assert!(close(stats.expected("tile"), 1.0));

        // later spikes are not corrected again
        stats.record("tile", 1000.0);
        assert_eq!(stats.samples("tile"), OUTLIER_THRESHOLD - 1);
        assert!(stats.expected("tile") > 1.0);
    }

    #[test]
    fn snapshot_is_sorted_and_clear_resets() {
        let stats = DurationStats::new();
        stats.record("b", 1.0);
        stats.record("a", 2.0);

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot[0].type_key, "a");
        assert_eq!(snapshot[0].mean, Duration::from_secs(2));

        stats.clear();
        assert!(stats.snapshot().is_empty());
    }
}
