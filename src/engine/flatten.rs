use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use petgraph::Direction;
use petgraph::graphmap::DiGraphMap;

use crate::core::{Deadline, TaskId};
use crate::engine::Task;

/// A primitive task reached while flattening, with the earliest deadline of
/// the task itself and every graph enclosing it.
pub(crate) struct FlatTask {
    pub(crate) task: Arc<Task>,
    pub(crate) deadline: Deadline,
}

/// Primitive tasks of a (possibly nested) task graph and the ordering
/// constraints between them. Edges point from predecessor to successor.
#[derive(Default)]
pub(crate) struct FlatGraph {
    pub(crate) tasks: BTreeMap<TaskId, FlatTask>,
    pub(crate) edges: DiGraphMap<TaskId, ()>,
    /// Every task, predecessors before successors.
    pub(crate) order: Vec<TaskId>,
}

impl FlatGraph {
    pub(crate) fn predecessors(&self, id: TaskId) -> impl Iterator<Item = TaskId> + '_ {
        self.edges.neighbors_directed(id, Direction::Incoming)
    }

    pub(crate) fn len(&self) -> usize {
        self.tasks.len()
    }

    fn insert(&mut self, task: &Arc<Task>, deadline: Deadline) {
        self.tasks
            .entry(task.id())
            .and_modify(|flat| flat.deadline = flat.deadline.min(deadline))
            .or_insert_with(|| FlatTask {
                task: task.clone(),
                deadline,
            });
        self.edges.add_node(task.id());
    }
}

#[derive(Clone, Copy)]
enum Side {
    First,
    Last,
}

/// Expands `root` into its primitive tasks.
///
/// A dependency between two sub-graphs becomes a set of primitive edges from
/// every last leaf of the predecessor to every first leaf of the successor.
/// Graphs shared by several parents are expanded once.
///
/// # Panics
/// Panics if the resulting dependency relation has a cycle.
pub(crate) fn flatten(root: &Arc<Task>) -> FlatGraph {
    let mut flat = FlatGraph::default();
    let mut graphs: HashMap<TaskId, Deadline> = HashMap::new();
    let mut dependencies = Vec::new();
    let mut stack = vec![(root.clone(), root.deadline())];

    while let Some((task, inherited)) = stack.pop() {
        let deadline = inherited.min(task.deadline());
        if !task.is_graph() {
            flat.insert(&task, deadline);
            continue;
        }

        match graphs.get(&task.id()) {
            Some(&seen) if seen <= deadline => continue,
            Some(_) => {
                // reached again through a more urgent parent
                graphs.insert(task.id(), deadline);
                stack.extend(task.tasks().into_iter().map(|child| (child, deadline)));
            }
            None => {
                graphs.insert(task.id(), deadline);
                let (children, edges) = task.snapshot();
                stack.extend(children.into_iter().map(|child| (child, deadline)));
                dependencies.extend(edges);
            }
        }
    }

    let mut firsts = HashMap::new();
    let mut lasts = HashMap::new();
    for (pred, succ) in dependencies {
        let from = leaves(&pred, Side::Last, &mut lasts);
        let to = leaves(&succ, Side::First, &mut firsts);
        for &p in &from {
            for &s in &to {
                flat.edges.add_edge(p, s, ());
            }
        }
    }

    match petgraph::algo::toposort(&flat.edges, None) {
        Ok(order) => flat.order = order,
        Err(cycle) => panic!("Cycle detected in task graph at task {}", cycle.node_id()),
    }

    flat
}

fn leaves(task: &Arc<Task>, side: Side, memo: &mut HashMap<TaskId, Vec<TaskId>>) -> Vec<TaskId> {
    if !task.is_graph() {
        return vec![task.id()];
    }
    if let Some(found) = memo.get(&task.id()) {
        return found.clone();
    }

    let mut found = BTreeSet::new();
    let mut seen = HashSet::new();
    let mut stack = vec![task.clone()];
    while let Some(next) = stack.pop() {
        if !next.is_graph() {
            found.insert(next.id());
            continue;
        }
        if seen.insert(next.id()) {
            stack.extend(match side {
                Side::First => next.first_tasks(),
                Side::Last => next.last_tasks(),
            });
        }
    }

    let found: Vec<_> = found.into_iter().collect();
    memo.insert(task.id(), found.clone());
    found
}
