use std::collections::{BTreeMap, HashMap};
use std::fmt::Write;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::core::TaskId;
use crate::engine::{Task, flatten};

/// One execution of a primitive task.
#[derive(Debug, Clone)]
pub struct TaskExecution {
    pub task: TaskId,
    pub type_key: &'static str,
    pub start: Instant,
    pub duration: Duration,
    /// Name of the thread that ran the task, if it had one.
    pub thread: Option<String>,
}

/// Aggregated executions of one task type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeSummary {
    pub type_key: &'static str,
    pub count: usize,
    pub total: Duration,
    pub max: Duration,
}

/// Execution records collected by a scheduler with
/// [`record_diagnostics`](crate::SchedulerConfig::record_diagnostics) set.
/// Skipped tasks are not recorded.
#[derive(Debug, Default)]
pub struct Diagnostics {
    pub executions: Vec<TaskExecution>,
}

impl Diagnostics {
    pub fn is_empty(&self) -> bool {
        self.executions.is_empty()
    }

    /// Totals per task type, ordered by type key.
    pub fn summary(&self) -> Vec<TypeSummary> {
        let mut types: BTreeMap<&'static str, TypeSummary> = BTreeMap::new();
        for exec in &self.executions {
            let entry = types.entry(exec.type_key).or_insert(TypeSummary {
                type_key: exec.type_key,
                count: 0,
                total: Duration::ZERO,
                max: Duration::ZERO,
            });
            entry.count += 1;
            entry.total += exec.duration;
            entry.max = entry.max.max(exec.duration);
        }
        types.into_values().collect()
    }

    /// Renders the primitive tasks of `graph` as a Mermaid flowchart,
    /// color-coded by their latest measured duration.
    ///
    /// * **Green**: Fast
    /// * **Yellow**: Moderate
    /// * **Red**: Slow
    /// * **Blue**: Not executed (skipped or cached)
    pub fn render_mermaid(&self, graph: &Arc<Task>) -> String {
        let flat = flatten(graph);

        let mut latest: HashMap<TaskId, &TaskExecution> = HashMap::new();
        for exec in &self.executions {
            latest.insert(exec.task, exec);
        }

        let (mut min_time, mut max_time) = latest
            .values()
            .map(|exec| exec.duration.as_secs_f64())
            .fold((f64::MAX, f64::MIN), |(lo, hi), secs| (lo.min(secs), hi.max(secs)));

        if min_time > max_time {
            min_time = 0.0;
            max_time = 0.0;
        }
        if (max_time - min_time).abs() < f64::EPSILON {
            max_time = min_time + 1.0;
        }

        let mut f = String::new();
        let _ = writeln!(f, "graph LR");

        for (id, node) in &flat.tasks {
            let (label, color) = match latest.get(id) {
                Some(exec) => {
                    let t = (exec.duration.as_secs_f64() - min_time) / (max_time - min_time);
                    (format!("{:.2?}", exec.duration), heat(t))
                }
                None => ("skipped/cached".to_string(), "#ADD8E6".to_string()),
            };
            let name = node.task.type_key().replace('"', "\\\"");
            let _ = writeln!(f, "    t{}[\"{} {}\\n{}\"]", id.get(), name, id, label);
            let _ = writeln!(f, "    style t{} fill:{}", id.get(), color);
        }

        for (from, to, _) in flat.edges.all_edges() {
            let _ = writeln!(f, "    t{} --> t{}", from.get(), to.get());
        }

        f
    }
}

/// Green at 0.0, yellow at 0.5, red at 1.0.
fn heat(t: f64) -> String {
    let t = t.clamp(0.0, 1.0);
    let (r, g) = if t < 0.5 {
        ((255.0 * t * 2.0) as u8, 255)
    } else {
        (255, (255.0 * (1.0 - (t - 0.5) * 2.0)) as u8)
    };
    format!("#{:02X}{:02X}00", r, g)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::Work;

    struct Nop;

    impl Work for Nop {
        fn type_key(&self) -> &'static str {
            "nop"
        }

        fn run(&self) -> bool {
            true
        }
    }

    fn exec(task: TaskId, type_key: &'static str, millis: u64) -> TaskExecution {
        TaskExecution {
            task,
            type_key,
            start: Instant::now(),
            duration: Duration::from_millis(millis),
            thread: None,
        }
    }

    #[test]
    fn summary_groups_by_type() {
        let diagnostics = Diagnostics {
            executions: vec![
                exec(TaskId::next(), "fill", 2),
                exec(TaskId::next(), "fill", 5),
                exec(TaskId::next(), "blend", 1),
            ],
        };
        let summary = diagnostics.summary();
        assert_eq!(summary.len(), 2);
        assert_eq!(summary[0].type_key, "blend");
        assert_eq!(summary[1].count, 2);
        assert_eq!(summary[1].total, Duration::from_millis(7));
        assert_eq!(summary[1].max, Duration::from_millis(5));
    }

    #[test]
    fn mermaid_marks_slow_fast_and_skipped() {
        let fast = Task::new(Nop);
        let slow = Task::new(Nop);
        let skipped = Task::new(Nop);
        let graph = Task::graph();
        graph.add_task(&fast);
        graph.add_task(&slow);
        graph.add_task(&skipped);
        graph.add_dependency(&slow, &fast);

        let diagnostics = Diagnostics {
            executions: vec![exec(fast.id(), "nop", 1), exec(slow.id(), "nop", 9)],
        };
        let chart = diagnostics.render_mermaid(&graph);

        assert!(chart.starts_with("graph LR\n"));
        assert!(chart.contains(&format!("style t{} fill:#00FF00", fast.id().get())));
        assert!(chart.contains(&format!("style t{} fill:#FF0000", slow.id().get())));
        assert!(chart.contains(&format!("style t{} fill:#ADD8E6", skipped.id().get())));
        assert!(chart.contains(&format!("t{} --> t{}", fast.id().get(), slow.id().get())));
    }

    #[test]
    fn heat_ramp_endpoints() {
        assert_eq!(heat(0.0), "#00FF00");
        assert_eq!(heat(0.5), "#FFFF00");
        assert_eq!(heat(1.0), "#FF0000");
    }
}
