//! Task graph produced by the planner for one request
//!
//! The dependency relation must be a DAG. `topological_order` is the single
//! place cycles are detected; it runs before anything is dispatched.

use crate::error::OrchestrationError;
use crate::models::TaskStatus;
use crate::period::Period;
use crate::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeSet, HashMap, HashSet};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskNode {
    pub id: String,
    pub capability_name: String,
    pub parameters: Value,
    pub dependency_ids: BTreeSet<String>,
    /// Optional nodes degrade the request to `partial` instead of failing it
    #[serde(default)]
    pub optional: bool,
    pub status: TaskStatus,
}

impl TaskNode {
    pub fn new(id: impl Into<String>, capability_name: impl Into<String>, parameters: Value) -> Self {
        Self {
            id: id.into(),
            capability_name: capability_name.into(),
            parameters,
            dependency_ids: BTreeSet::new(),
            optional: false,
            status: TaskStatus::Pending,
        }
    }

    pub fn depends_on<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependency_ids.extend(ids.into_iter().map(Into::into));
        self
    }

    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskGraph {
    pub request_id: Uuid,
    pub nodes: Vec<TaskNode>,
    #[serde(default)]
    pub rationale: Option<String>,
    /// Reporting period the connector parameters were resolved against
    #[serde(default)]
    pub period: Option<Period>,
}

impl TaskGraph {
    pub fn new(request_id: Uuid, nodes: Vec<TaskNode>) -> Self {
        Self {
            request_id,
            nodes,
            rationale: None,
            period: None,
        }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&TaskNode> {
        self.nodes.iter().find(|n| n.id == id)
    }

    /// Direct dependents of `id`, in declaration order
    pub fn dependents_of(&self, id: &str) -> Vec<&str> {
        self.nodes
            .iter()
            .filter(|n| n.dependency_ids.contains(id))
            .map(|n| n.id.as_str())
            .collect()
    }

    /// Kahn's algorithm, ties broken by declaration order so the result is
    /// stable. Fails on unknown dependency ids, duplicate ids, and cycles.
    pub fn topological_order(&self) -> Result<Vec<String>> {
        let mut position: HashMap<&str, usize> = HashMap::with_capacity(self.nodes.len());
        for (idx, node) in self.nodes.iter().enumerate() {
            if position.insert(node.id.as_str(), idx).is_some() {
                return Err(OrchestrationError::PlanningError(format!(
                    "duplicate task id '{}'",
                    node.id
                )));
            }
        }

        let mut in_degree = vec![0usize; self.nodes.len()];
        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); self.nodes.len()];

        for (idx, node) in self.nodes.iter().enumerate() {
            for dep in &node.dependency_ids {
                let dep_idx = *position.get(dep.as_str()).ok_or_else(|| {
                    OrchestrationError::PlanningError(format!(
                        "task '{}' depends on unknown task '{}'",
                        node.id, dep
                    ))
                })?;
                if dep_idx == idx {
                    return Err(OrchestrationError::PlanningError(format!(
                        "task '{}' depends on itself",
                        node.id
                    )));
                }
                in_degree[idx] += 1;
                dependents[dep_idx].push(idx);
            }
        }

        let mut ready: BTreeSet<usize> = in_degree
            .iter()
            .enumerate()
            .filter(|(_, d)| **d == 0)
            .map(|(i, _)| i)
            .collect();
        let mut order = Vec::with_capacity(self.nodes.len());

        while let Some(idx) = ready.pop_first() {
            order.push(self.nodes[idx].id.clone());
            for &next in &dependents[idx] {
                in_degree[next] -= 1;
                if in_degree[next] == 0 {
                    ready.insert(next);
                }
            }
        }

        if order.len() != self.nodes.len() {
            let placed: HashSet<&str> = order.iter().map(String::as_str).collect();
            let mut stuck: Vec<&str> = self
                .nodes
                .iter()
                .map(|n| n.id.as_str())
                .filter(|id| !placed.contains(id))
                .collect();
            stuck.sort_unstable();
            return Err(OrchestrationError::PlanningError(format!(
                "dependency cycle among tasks [{}]",
                stuck.join(", ")
            )));
        }

        Ok(order)
    }
}
