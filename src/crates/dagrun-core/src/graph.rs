//! Execution graph: the step DAG for one attempt.
//!
//! Construction indexes nodes by id and name, populates the forward and
//! reverse adjacency maps from each step's `depends`, rejects unknown
//! references, and runs Kahn's algorithm to reject cycles. Edges are
//! read-only after construction, so lookups need no locking.

use crate::error::{CoreError, Result};
use crate::node::Node;
use chrono::{DateTime, Utc};
use dagrun_model::{RunStatus, Step};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

/// Aggregate status flags recomputed on demand for scheduler predicates.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NodeStateFlags {
    pub has_running: bool,
    pub has_not_started: bool,
    /// A not-started node still waiting on a non-terminal dependency
    pub has_waiting: bool,
}

/// The step DAG of one attempt, with runtime nodes attached.
pub struct ExecutionGraph {
    nodes: Vec<Arc<Node>>,
    index_by_id: HashMap<usize, usize>,
    index_by_name: HashMap<String, usize>,
    /// parent id → child ids
    from: HashMap<usize, Vec<usize>>,
    /// child id → parent ids
    to: HashMap<usize, Vec<usize>>,
    started_at: DateTime<Utc>,
    finished_at: Mutex<Option<DateTime<Utc>>>,
}

impl ExecutionGraph {
    /// Build a fresh graph from step definitions.
    pub fn new(steps: impl IntoIterator<Item = Step>) -> Result<Self> {
        Self::from_nodes(steps.into_iter().map(|s| Arc::new(Node::new(s))).collect())
    }

    /// Build a graph around existing nodes (used by the retry constructors,
    /// which keep prior state).
    pub fn from_nodes(nodes: Vec<Arc<Node>>) -> Result<Self> {
        let mut index_by_id = HashMap::with_capacity(nodes.len());
        let mut index_by_name = HashMap::with_capacity(nodes.len());
        for (idx, node) in nodes.iter().enumerate() {
            index_by_id.insert(node.id(), idx);
            if index_by_name.insert(node.name().to_string(), idx).is_some() {
                return Err(CoreError::Validation(format!(
                    "duplicate step name '{}'",
                    node.name()
                )));
            }
        }

        let mut from: HashMap<usize, Vec<usize>> = HashMap::new();
        let mut to: HashMap<usize, Vec<usize>> = HashMap::new();
        for node in &nodes {
            for dep in &node.step().depends {
                let Some(&dep_idx) = index_by_name.get(dep) else {
                    return Err(CoreError::StepNotFound { name: dep.clone() });
                };
                let dep_id = nodes[dep_idx].id();
                from.entry(dep_id).or_default().push(node.id());
                to.entry(node.id()).or_default().push(dep_id);
            }
        }

        let graph = Self {
            nodes,
            index_by_id,
            index_by_name,
            from,
            to,
            started_at: Utc::now(),
            finished_at: Mutex::new(None),
        };
        graph.check_acyclic()?;
        Ok(graph)
    }

    /// Reopen every `Failed`/`Aborted` node and all of its transitive
    /// descendants, keeping the rest of the prior run's state.
    pub fn create_retry_graph(nodes: Vec<Arc<Node>>) -> Result<Self> {
        let graph = Self::from_nodes(nodes)?;

        let seeds: Vec<usize> = graph
            .nodes
            .iter()
            .filter(|n| matches!(n.status(), RunStatus::Failed | RunStatus::Aborted))
            .map(|n| n.id())
            .collect();

        let mut reopen: Vec<usize> = Vec::new();
        let mut queue: VecDeque<usize> = seeds.into();
        while let Some(id) = queue.pop_front() {
            if reopen.contains(&id) {
                continue;
            }
            reopen.push(id);
            queue.extend(graph.dependents(id));
        }

        for id in reopen {
            if let Some(node) = graph.node_by_id(id) {
                node.reset_state();
            }
        }
        Ok(graph)
    }

    /// Reopen only the named step, zeroing its retry count and leaving
    /// downstream state untouched.
    pub fn create_step_retry_graph(nodes: Vec<Arc<Node>>, step_name: &str) -> Result<Self> {
        let graph = Self::from_nodes(nodes)?;
        let node = graph
            .node_by_name(step_name)
            .ok_or_else(|| CoreError::StepNotFound {
                name: step_name.to_string(),
            })?;
        node.reset_state();
        Ok(graph)
    }

    fn check_acyclic(&self) -> Result<()> {
        let mut indegree: HashMap<usize, usize> = self
            .nodes
            .iter()
            .map(|n| (n.id(), self.dependencies(n.id()).len()))
            .collect();
        let mut queue: VecDeque<usize> = indegree
            .iter()
            .filter(|(_, &d)| d == 0)
            .map(|(&id, _)| id)
            .collect();

        let mut visited = 0usize;
        while let Some(id) = queue.pop_front() {
            visited += 1;
            for &child in self.dependents(id) {
                let entry = indegree
                    .get_mut(&child)
                    .ok_or(CoreError::CycleDetected)?;
                *entry -= 1;
                if *entry == 0 {
                    queue.push_back(child);
                }
            }
        }

        if visited == self.nodes.len() {
            Ok(())
        } else {
            Err(CoreError::CycleDetected)
        }
    }

    pub fn nodes(&self) -> &[Arc<Node>] {
        &self.nodes
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node_by_id(&self, id: usize) -> Option<&Arc<Node>> {
        self.index_by_id.get(&id).map(|&idx| &self.nodes[idx])
    }

    pub fn node_by_name(&self, name: &str) -> Option<&Arc<Node>> {
        self.index_by_name.get(name).map(|&idx| &self.nodes[idx])
    }

    /// Parent ids of `id`.
    pub fn dependencies(&self, id: usize) -> &[usize] {
        self.to.get(&id).map(Vec::as_slice).unwrap_or_default()
    }

    /// Child ids of `id`.
    pub fn dependents(&self, id: usize) -> &[usize] {
        self.from.get(&id).map(Vec::as_slice).unwrap_or_default()
    }

    /// All transitive ancestors of `id`, nearest parents last.
    pub fn ancestors(&self, id: usize) -> Vec<usize> {
        let mut seen: Vec<usize> = Vec::new();
        let mut queue: VecDeque<usize> = self.dependencies(id).iter().copied().collect();
        while let Some(parent) = queue.pop_front() {
            if seen.contains(&parent) {
                continue;
            }
            seen.push(parent);
            queue.extend(self.dependencies(parent));
        }
        seen.reverse();
        seen
    }

    /// One pass over all node states.
    pub fn node_states(&self) -> NodeStateFlags {
        let mut flags = NodeStateFlags::default();
        for node in &self.nodes {
            match node.status() {
                RunStatus::Running => flags.has_running = true,
                RunStatus::NotStarted => {
                    flags.has_not_started = true;
                    let waiting = self
                        .dependencies(node.id())
                        .iter()
                        .filter_map(|&d| self.node_by_id(d))
                        .any(|dep| !dep.status().is_terminal());
                    if waiting {
                        flags.has_waiting = true;
                    }
                }
                _ => {}
            }
        }
        flags
    }

    /// Whether the plan still has live work: a running node, or a
    /// not-started node while the plan has not been finished.
    pub fn is_running(&self) -> bool {
        let flags = self.node_states();
        flags.has_running || (flags.has_not_started && self.finished_at.lock().is_none())
    }

    /// Mark the plan finished once no node is running or waiting to start.
    /// Idempotent; returns whether the plan is finished.
    pub fn check_finished(&self) -> bool {
        let flags = self.node_states();
        if flags.has_running || flags.has_not_started {
            return false;
        }
        let mut finished = self.finished_at.lock();
        if finished.is_none() {
            *finished = Some(Utc::now());
        }
        true
    }

    /// Force the finish timestamp (canceled runs leave nodes NotStarted).
    pub fn finish(&self) {
        let mut finished = self.finished_at.lock();
        if finished.is_none() {
            *finished = Some(Utc::now());
        }
    }

    pub fn is_started(&self) -> bool {
        true
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn finished_at(&self) -> Option<DateTime<Utc>> {
        *self.finished_at.lock()
    }
}

impl std::fmt::Debug for ExecutionGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionGraph")
            .field("nodes", &self.nodes.len())
            .field("edges", &self.from.values().map(Vec::len).sum::<usize>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chain() -> Vec<Step> {
        vec![
            Step::command("a", "true"),
            Step::command("b", "true").depends_on("a"),
            Step::command("c", "true").depends_on("b"),
        ]
    }

    #[test]
    fn builds_adjacency_from_depends() {
        let graph = ExecutionGraph::new(chain()).unwrap();
        let a = graph.node_by_name("a").unwrap().id();
        let b = graph.node_by_name("b").unwrap().id();
        let c = graph.node_by_name("c").unwrap().id();

        assert_eq!(graph.dependents(a), &[b]);
        assert_eq!(graph.dependencies(b), &[a]);
        assert_eq!(graph.dependencies(c), &[b]);
        assert!(graph.dependencies(a).is_empty());
    }

    #[test]
    fn rejects_cycles() {
        let steps = vec![
            Step::command("a", "true").depends_on("b"),
            Step::command("b", "true").depends_on("a"),
        ];
        assert!(matches!(
            ExecutionGraph::new(steps),
            Err(CoreError::CycleDetected)
        ));
    }

    #[test]
    fn rejects_self_dependency() {
        let steps = vec![Step::command("a", "true").depends_on("a")];
        assert!(matches!(
            ExecutionGraph::new(steps),
            Err(CoreError::CycleDetected)
        ));
    }

    #[test]
    fn rejects_unknown_dependency() {
        let steps = vec![Step::command("a", "true").depends_on("ghost")];
        let result = ExecutionGraph::new(steps);
        assert!(matches!(
            result,
            Err(CoreError::StepNotFound { name }) if name == "ghost"
        ));
    }

    #[test]
    fn rejects_duplicate_names() {
        let steps = vec![Step::command("a", "true"), Step::command("a", "false")];
        assert!(matches!(
            ExecutionGraph::new(steps),
            Err(CoreError::Validation(_))
        ));
    }

    #[test]
    fn ancestors_are_transitive() {
        let graph = ExecutionGraph::new(chain()).unwrap();
        let a = graph.node_by_name("a").unwrap().id();
        let b = graph.node_by_name("b").unwrap().id();
        let c = graph.node_by_name("c").unwrap().id();
        assert_eq!(graph.ancestors(c), vec![a, b]);
    }

    #[test]
    fn check_finished_is_idempotent() {
        let graph = ExecutionGraph::new(vec![Step::command("a", "true")]).unwrap();
        assert!(!graph.check_finished());
        assert!(graph.is_running());

        graph.node_by_name("a").unwrap().set_status(RunStatus::Succeeded);
        assert!(graph.check_finished());
        let first = graph.finished_at().unwrap();
        assert!(graph.check_finished());
        assert_eq!(graph.finished_at().unwrap(), first);
        assert!(!graph.is_running());
    }

    #[test]
    fn retry_graph_reopens_failures_and_descendants() {
        let graph = ExecutionGraph::new(chain()).unwrap();
        graph.node_by_name("a").unwrap().set_status(RunStatus::Succeeded);
        graph.node_by_name("b").unwrap().set_status(RunStatus::Failed);
        graph.node_by_name("c").unwrap().set_status(RunStatus::Aborted);

        let nodes = graph.nodes().to_vec();
        let retry = ExecutionGraph::create_retry_graph(nodes).unwrap();

        assert_eq!(
            retry.node_by_name("a").unwrap().status(),
            RunStatus::Succeeded,
            "succeeded upstream keeps its state"
        );
        assert_eq!(retry.node_by_name("b").unwrap().status(), RunStatus::NotStarted);
        assert_eq!(retry.node_by_name("c").unwrap().status(), RunStatus::NotStarted);
    }

    #[test]
    fn step_retry_graph_reopens_only_the_named_step() {
        let graph = ExecutionGraph::new(chain()).unwrap();
        for name in ["a", "b", "c"] {
            graph.node_by_name(name).unwrap().set_status(RunStatus::Succeeded);
        }
        graph.node_by_name("b").unwrap().mark_retry();

        let nodes = graph.nodes().to_vec();
        let retry = ExecutionGraph::create_step_retry_graph(nodes, "b").unwrap();

        assert_eq!(retry.node_by_name("a").unwrap().status(), RunStatus::Succeeded);
        assert_eq!(retry.node_by_name("b").unwrap().status(), RunStatus::NotStarted);
        assert_eq!(retry.node_by_name("b").unwrap().state_snapshot().retry_count, 0);
        assert_eq!(retry.node_by_name("c").unwrap().status(), RunStatus::Succeeded);

        let missing = ExecutionGraph::create_step_retry_graph(retry.nodes().to_vec(), "zzz");
        assert!(matches!(missing, Err(CoreError::StepNotFound { .. })));
    }

    #[test]
    fn node_state_flags() {
        let graph = ExecutionGraph::new(chain()).unwrap();
        let flags = graph.node_states();
        assert!(!flags.has_running);
        assert!(flags.has_not_started);
        assert!(flags.has_waiting, "b and c wait on unfinished parents");

        graph.node_by_name("a").unwrap().set_status(RunStatus::Running);
        assert!(graph.node_states().has_running);
    }
}
