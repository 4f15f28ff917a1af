#![forbid(unsafe_code)]
//! Deadline-driven task scheduling and tile caching for streaming
//! procedurally produced data, such as terrain height fields rendered at
//! interactive frame rates.
//!
//! The crate has three layers:
//!
//! - [`Task`]s: primitive units of [`Work`], or graphs of sub-tasks with
//!   ordering constraints. Tasks remember when they last completed, so work
//!   whose inputs did not change is never executed twice.
//! - A [`Scheduler`], implemented by [`MultithreadScheduler`], which runs the
//!   immediate part of a task graph before returning and keeps computing
//!   prefetched tasks in the background, ordered by deadline.
//! - A [`TileCache`], which maps tile coordinates to slots of a fixed-size
//!   [`TileStorage`] pool, recycles the least recently released tiles, and
//!   reuses production tasks of evicted tiles when they are needed again.
//!
//! A typical frame gets the tiles it needs from the cache with an
//! [`IMMEDIATE`] deadline, collects their production tasks into a graph,
//! runs that graph through the scheduler, reads the slots, and releases the
//! tiles. Tiles likely to be needed soon are prefetched with later deadlines.

mod core;
mod engine;
mod error;
mod scheduler;
mod tile;

pub use crate::core::{ContextKey, Deadline, ExecutionContext, IMMEDIATE, Reason, TaskId};
pub use crate::engine::{DurationStats, Task, TaskListener, TypeStats, Work};
pub use crate::error::*;
pub use crate::scheduler::{
    Diagnostics, MultithreadScheduler, Scheduler, SchedulerConfig, TaskExecution, TypeSummary,
};
pub use crate::tile::{
    FillTile, ProducerId, Slot, SlotId, Tile, TileCache, TileId, TileProducer, TileStorage,
};

/// Installs a `tracing` subscriber printing to stderr, filtered by the
/// `RUST_LOG` environment variable (`info` when unset).
///
/// Succeeds without changes if a global subscriber is already installed.
#[cfg(feature = "logging")]
pub fn init_logging() -> Result<(), LoggingError> {
    use tracing_subscriber::EnvFilter;
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    if tracing::dispatcher::has_been_set() {
        return Ok(());
    }

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let installed = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .try_init();

    match installed {
        // lost a race against another thread installing one
        Err(_) if tracing::dispatcher::has_been_set() => Ok(()),
        result => Ok(result?),
    }
}

#[cfg(all(test, feature = "logging"))]
mod tests {
    use super::*;

    #[test]
    fn logging_can_be_initialized_twice() {
        assert!(init_logging().is_ok());
        assert!(init_logging().is_ok());
    }
}
