use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Couldn't parse scheduler configuration.\n{0}")]
    Parse(#[from] serde_json::Error),

    #[error("Frame rate must be a finite, non-negative number, got {0}")]
    FrameRate(f32),
}

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("Invalid scheduler configuration:\n{0}")]
    Config(#[from] ConfigError),

    #[error("Failed to spawn worker thread {index}:\n{source}")]
    Spawn {
        index: usize,
        #[source]
        source: std::io::Error,
    },
}

#[cfg(feature = "logging")]
#[derive(Debug, Error)]
#[error("Couldn't install the logging subscriber.\n{0}")]
pub struct LoggingError(#[from] tracing_subscriber::util::TryInitError);
