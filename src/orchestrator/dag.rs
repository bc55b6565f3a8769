//! Per-request scheduling state over a validated task graph

use crate::graph::TaskGraph;
use crate::models::{RequestStatus, TaskStatus};
use crate::Result;
use std::collections::{BTreeSet, HashMap};

pub struct DagState {
    order: Vec<String>,
    status: HashMap<String, TaskStatus>,
    dependencies: HashMap<String, BTreeSet<String>>,
    dependents: HashMap<String, Vec<String>>,
    optional: HashMap<String, bool>,
}

impl DagState {
    /// Fails with `PlanningError` on a cycle or dangling dependency, before
    /// anything can be dispatched.
    pub fn new(graph: &TaskGraph) -> Result<Self> {
        let order = graph.topological_order()?;

        let dependents: HashMap<String, Vec<String>> = graph
            .nodes
            .iter()
            .map(|n| {
                let children = graph.dependents_of(&n.id).into_iter().map(str::to_string).collect();
                (n.id.clone(), children)
            })
            .collect();

        Ok(Self {
            status: order.iter().map(|id| (id.clone(), TaskStatus::Pending)).collect(),
            dependencies: graph
                .nodes
                .iter()
                .map(|n| (n.id.clone(), n.dependency_ids.clone()))
                .collect(),
            optional: graph.nodes.iter().map(|n| (n.id.clone(), n.optional)).collect(),
            dependents,
            order,
        })
    }

    pub fn status(&self, id: &str) -> Option<TaskStatus> {
        self.status.get(id).copied()
    }

    pub fn is_optional(&self, id: &str) -> bool {
        self.optional.get(id).copied().unwrap_or(false)
    }

    /// Pending nodes whose whole dependency set has succeeded, promoted to
    /// `Ready`, in topological order
    pub fn promote_ready(&mut self) -> Vec<String> {
        let ready: Vec<String> = self
            .order
            .iter()
            .filter(|id| self.status.get(*id) == Some(&TaskStatus::Pending))
            .filter(|id| {
                self.dependencies.get(*id).map_or(true, |deps| {
                    deps.iter()
                        .all(|d| self.status.get(d) == Some(&TaskStatus::Succeeded))
                })
            })
            .cloned()
            .collect();
        for id in &ready {
            self.status.insert(id.clone(), TaskStatus::Ready);
        }
        ready
    }

    /// The next ready node in topological order
    pub fn next_ready(&mut self) -> Option<String> {
        self.promote_ready();
        let id = self
            .order
            .iter()
            .find(|id| self.status.get(*id) == Some(&TaskStatus::Ready))?
            .clone();
        Some(id)
    }

    pub fn mark_running(&mut self, id: &str) {
        self.set(id, TaskStatus::Running);
    }

    pub fn mark_succeeded(&mut self, id: &str) {
        self.set(id, TaskStatus::Succeeded);
    }

    /// Mark `id` failed and skip every transitive dependent that has not
    /// finished yet. Returns the newly skipped ids.
    pub fn mark_failed(&mut self, id: &str) -> Vec<String> {
        self.set(id, TaskStatus::Failed);
        self.skip_dependents_of(id)
    }

    /// Skip `id` and its unfinished transitive dependents
    pub fn mark_skipped(&mut self, id: &str) -> Vec<String> {
        self.set(id, TaskStatus::Skipped);
        self.skip_dependents_of(id)
    }

    fn skip_dependents_of(&mut self, id: &str) -> Vec<String> {
        let mut skipped = Vec::new();
        let mut stack = vec![id.to_string()];
        while let Some(current) = stack.pop() {
            let Some(children) = self.dependents.get(&current).cloned() else {
                continue;
            };
            for child in children {
                if self.status.get(&child).map_or(true, |s| s.is_terminal()) {
                    continue;
                }
                self.status.insert(child.clone(), TaskStatus::Skipped);
                skipped.push(child.clone());
                stack.push(child);
            }
        }
        skipped.sort_by_key(|s| self.position(s));
        skipped
    }

    /// Running nodes that feed something, where everything they feed has
    /// already been skipped. Their results can no longer be used.
    pub fn orphaned_running(&self) -> Vec<String> {
        self.order
            .iter()
            .filter(|id| self.status.get(*id) == Some(&TaskStatus::Running))
            .filter(|id| {
                self.dependents.get(*id).map_or(false, |children| {
                    !children.is_empty()
                        && children
                            .iter()
                            .all(|c| self.status.get(c) == Some(&TaskStatus::Skipped))
                })
            })
            .cloned()
            .collect()
    }

    /// Every node not yet terminal, in topological order
    pub fn outstanding(&self) -> Vec<String> {
        self.order
            .iter()
            .filter(|id| self.status.get(*id).map_or(false, |s| !s.is_terminal()))
            .cloned()
            .collect()
    }

    pub fn running(&self) -> Vec<String> {
        self.order
            .iter()
            .filter(|id| self.status.get(*id) == Some(&TaskStatus::Running))
            .cloned()
            .collect()
    }

    pub fn is_done(&self) -> bool {
        self.status.values().all(TaskStatus::is_terminal)
    }

    /// Failed if the deadline passed or a required node failed; partial if
    /// anything else did not succeed; completed otherwise.
    pub fn outcome(&self, timed_out: bool) -> RequestStatus {
        if timed_out {
            return RequestStatus::Failed;
        }
        let required_failed = self
            .status
            .iter()
            .any(|(id, s)| *s == TaskStatus::Failed && !self.is_optional(id));
        if required_failed {
            return RequestStatus::Failed;
        }
        if self.status.values().any(|s| *s != TaskStatus::Succeeded) {
            return RequestStatus::Partial;
        }
        RequestStatus::Completed
    }

    fn set(&mut self, id: &str, status: TaskStatus) {
        if let Some(slot) = self.status.get_mut(id) {
            *slot = status;
        }
    }

    fn position(&self, id: &str) -> usize {
        self.order.iter().position(|o| o == id).unwrap_or(usize::MAX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::TaskNode;
    use serde_json::json;
    use uuid::Uuid;

    fn fan_out(a_optional: bool) -> TaskGraph {
        let mut a = TaskNode::new("a", "fetch_sales", json!({}));
        if a_optional {
            a = a.optional();
        }
        TaskGraph::new(
            Uuid::new_v4(),
            vec![
                a,
                TaskNode::new("b", "period_total", json!({})).depends_on(["a"]),
                TaskNode::new("c", "period_total", json!({})).depends_on(["a"]),
            ],
        )
    }

    #[test]
    fn test_dependents_wait_for_success() {
        let mut dag = DagState::new(&fan_out(false)).unwrap();
        assert_eq!(dag.promote_ready(), vec!["a"]);
        dag.mark_running("a");
        assert!(dag.promote_ready().is_empty());
        assert_eq!(dag.running(), vec!["a"]);

        dag.mark_succeeded("a");
        assert!(dag.running().is_empty());
        assert_eq!(dag.promote_ready(), vec!["b", "c"]);
    }

    #[test]
    fn test_failure_skips_dependents_and_fails_request_when_required() {
        let mut dag = DagState::new(&fan_out(false)).unwrap();
        dag.mark_running("a");
        assert_eq!(dag.mark_failed("a"), vec!["b", "c"]);

        assert!(dag.is_done());
        assert_eq!(dag.status("b"), Some(TaskStatus::Skipped));
        assert_eq!(dag.outcome(false), RequestStatus::Failed);
    }

    #[test]
    fn test_optional_failure_is_partial() {
        let mut dag = DagState::new(&fan_out(true)).unwrap();
        dag.mark_running("a");
        dag.mark_failed("a");
        assert_eq!(dag.outcome(false), RequestStatus::Partial);
    }

    #[test]
    fn test_all_succeeded_is_completed_unless_timed_out() {
        let mut dag = DagState::new(&fan_out(false)).unwrap();
        for id in ["a", "b", "c"] {
            dag.mark_succeeded(id);
        }
        assert_eq!(dag.outcome(false), RequestStatus::Completed);
        assert_eq!(dag.outcome(true), RequestStatus::Failed);
    }

    #[test]
    fn test_running_node_with_only_skipped_consumers_is_orphaned() {
        let graph = TaskGraph::new(
            Uuid::new_v4(),
            vec![
                TaskNode::new("ar", "fetch_receivables", json!({})),
                TaskNode::new("sales", "fetch_sales", json!({})),
                TaskNode::new("dso", "dso", json!({})).depends_on(["ar", "sales"]),
            ],
        );
        let mut dag = DagState::new(&graph).unwrap();
        dag.mark_running("ar");
        dag.mark_running("sales");
        dag.mark_failed("sales");

        assert_eq!(dag.orphaned_running(), vec!["ar"]);
    }

    #[test]
    fn test_cycle_is_rejected_up_front() {
        let graph = TaskGraph::new(
            Uuid::new_v4(),
            vec![
                TaskNode::new("a", "x", json!({})).depends_on(["b"]),
                TaskNode::new("b", "x", json!({})).depends_on(["a"]),
            ],
        );
        assert!(DagState::new(&graph).is_err());
    }
}
