use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Tunables of a [`MultithreadScheduler`](crate::MultithreadScheduler).
///
/// Every field is optional when deserializing; missing fields take the
/// defaults below, which describe a scheduler that runs everything on the
/// calling thread and never prefetches.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Minimum number of prefetch tasks to execute per call to `run`.
    pub prefetch_rate: u32,
    /// Maximum number of waiting prefetch tasks. `0` means unbounded.
    pub prefetch_queue_size: usize,
    /// Target frames per second. `0` disables frame pacing.
    pub frame_rate: f32,
    /// Number of worker threads besides the calling thread.
    pub thread_count: usize,
    /// Restrict worker threads to prefetch tasks, leaving all immediate work
    /// to the calling thread.
    pub strict_prefetch: bool,
    /// Keep a record of every executed task, see
    /// [`MultithreadScheduler::take_diagnostics`](crate::MultithreadScheduler::take_diagnostics).
    pub record_diagnostics: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            prefetch_rate: 0,
            prefetch_queue_size: 0,
            frame_rate: 0.0,
            thread_count: 0,
            strict_prefetch: false,
            record_diagnostics: false,
        }
    }
}

impl SchedulerConfig {
    /// Parses and validates a JSON configuration.
    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.frame_rate.is_finite() || self.frame_rate < 0.0 {
            return Err(ConfigError::FrameRate(self.frame_rate));
        }
        Ok(())
    }

    /// Duration of one frame, or `None` when execution is not paced.
    pub fn frame_period(&self) -> Option<Duration> {
        (self.frame_rate > 0.0).then(|| Duration::from_secs_f64(1.0 / self.frame_rate as f64))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_fields_take_defaults() {
        let config = SchedulerConfig::from_json(r#"{ "thread_count": 3 }"#).unwrap();
        assert_eq!(config.thread_count, 3);
        assert_eq!(config.prefetch_rate, 0);
        assert!(!config.strict_prefetch);
        assert_eq!(config.frame_period(), None);
    }

    #[test]
    fn frame_period_from_rate() {
        let config = SchedulerConfig {
            frame_rate: 50.0,
            ..Default::default()
        };
        assert_eq!(config.frame_period(), Some(Duration::from_millis(20)));
    }

    #[test]
    fn negative_frame_rate_is_rejected() {
        let err = SchedulerConfig::from_json(r#"{ "frame_rate": -1.0 }"#).unwrap_err();
        assert!(matches!(err, ConfigError::FrameRate(rate) if rate == -1.0));
    }

    #[test]
    fn malformed_json_is_a_parse_error() {
        let err = SchedulerConfig::from_json("{ thread_count: }").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }
}
