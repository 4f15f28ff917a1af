//! Task schedulers.
//!
//! A scheduler receives tasks or task graphs, flattens them into primitive
//! tasks, and executes them in dependency order. Tasks whose deadline is
//! [`IMMEDIATE`](crate::IMMEDIATE) are executed before [`Scheduler::run`]
//! returns; tasks with a later deadline are *prefetched*, i.e. run ahead of
//! time when there is spare capacity.

mod config;
mod diagnostics;
mod multithread;
mod ready;

use std::sync::Arc;

use crate::core::{Deadline, Reason};
use crate::engine::Task;

pub use config::SchedulerConfig;
pub use diagnostics::{Diagnostics, TaskExecution, TypeSummary};
pub use multithread::MultithreadScheduler;

pub trait Scheduler: Send + Sync {
    /// Whether tasks of the given kind can be executed ahead of their
    /// deadline. When this returns `false`, scheduling a prefetch task is
    /// pointless because it would only run once it is needed anyway.
    fn supports_prefetch(&self, gpu: bool) -> bool;

    /// Adds `task` to the set of tasks to execute and returns immediately.
    ///
    /// Returns `false` if the task was dropped because too many prefetch
    /// tasks are already waiting.
    fn schedule(&self, task: &Arc<Task>) -> bool;

    /// Marks `task` not done for `reason` and makes sure it, and everything
    /// it depends on, is executed no later than `deadline`.
    fn reschedule(&self, task: &Arc<Task>, reason: Reason, deadline: Deadline);

    /// Schedules `task` and blocks until every immediate task is done.
    fn run(&self, task: &Arc<Task>);
}
