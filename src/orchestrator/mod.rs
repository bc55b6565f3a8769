//! Orchestrator: runs a validated task graph
//!
//! Ready nodes are dispatched concurrently up to `max_in_flight`. A node only
//! becomes ready once every dependency has succeeded; a failure skips its
//! transitive dependents and leaves sibling branches running. Aggregation is
//! keyed by task id, so completion order never changes the result set.
//!
//! No language model is involved here.

pub mod dag;
pub mod retry;

pub use dag::DagState;
pub use retry::RetryPolicy;

use crate::connectors::ConnectorRegistry;
use crate::engine::{ComputationEngine, ComputationSnapshot};
use crate::error::OrchestrationError;
use crate::graph::{TaskGraph, TaskNode};
use crate::models::{Provenance, RequestStatus, ResultSet, TaskResult, TaskStatus, TaskValue};
use crate::snapshot::{SnapshotSet, SnapshotToken};
use crate::Result;
use chrono::Utc;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

pub const DEFAULT_MAX_IN_FLIGHT: usize = 4;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionPolicy {
    pub max_in_flight: usize,
    pub retry: RetryPolicy,
}

impl Default for ExecutionPolicy {
    fn default() -> Self {
        Self {
            max_in_flight: DEFAULT_MAX_IN_FLIGHT,
            retry: RetryPolicy::default(),
        }
    }
}

/// Everything scoped to one request. Nothing here is shared across requests.
#[derive(Clone)]
pub struct RequestContext {
    pub request_id: Uuid,
    pub snapshot_token: SnapshotToken,
    pub snapshots: Arc<SnapshotSet>,
    pub cancel: CancellationToken,
    pub deadline: Instant,
}

impl RequestContext {
    pub fn new(request_id: Uuid, budget: Duration) -> Self {
        Self {
            request_id,
            snapshot_token: SnapshotToken::new(request_id),
            snapshots: Arc::new(SnapshotSet::new()),
            cancel: CancellationToken::new(),
            deadline: Instant::now() + budget,
        }
    }
}

enum Event {
    Joined(Option<std::result::Result<(String, TaskResult), tokio::task::JoinError>>),
    DeadlineReached,
    Cancelled,
}

pub struct Orchestrator {
    registry: Arc<ConnectorRegistry>,
    engine: Arc<ComputationEngine>,
    policy: ExecutionPolicy,
}

impl Orchestrator {
    pub fn new(registry: Arc<ConnectorRegistry>, engine: Arc<ComputationEngine>, policy: ExecutionPolicy) -> Self {
        Self {
            registry,
            engine,
            policy,
        }
    }

    pub fn policy(&self) -> &ExecutionPolicy {
        &self.policy
    }

    /// Execute `graph` and aggregate a result set.
    ///
    /// A cyclic or dangling graph fails with `PlanningError` before any
    /// connector is invoked. Node failures never surface as `Err`; they are
    /// recorded in the result set. Final node statuses are written back to
    /// `graph`.
    pub async fn execute(&self, graph: &mut TaskGraph, ctx: &RequestContext) -> Result<ResultSet> {
        let mut dag = DagState::new(graph)?;
        let nodes: HashMap<String, TaskNode> = graph
            .nodes
            .iter()
            .map(|n| (n.id.clone(), n.clone()))
            .collect();

        info!(
            request_id = %ctx.request_id,
            tasks = nodes.len(),
            max_in_flight = self.policy.max_in_flight,
            "Starting graph execution"
        );

        let mut results: BTreeMap<String, TaskResult> = BTreeMap::new();
        let mut tokens: HashMap<String, CancellationToken> = HashMap::new();
        let mut in_flight: JoinSet<(String, TaskResult)> = JoinSet::new();
        let mut timed_out = false;
        let mut cancelled = false;
        let limit = self.policy.max_in_flight.max(1);

        loop {
            while in_flight.len() < limit {
                let Some(id) = dag.next_ready() else {
                    break;
                };
                let Some(node) = nodes.get(&id) else {
                    dag.mark_skipped(&id);
                    continue;
                };
                dag.mark_running(&id);

                let token = ctx.cancel.child_token();
                tokens.insert(id.clone(), token.clone());

                let inputs = gather_inputs(node, &results);
                debug!(request_id = %ctx.request_id, task = %id, capability = %node.capability_name, "Dispatching task");
                let work = tokio::spawn(run_node(
                    self.registry.clone(),
                    self.engine.clone(),
                    self.policy.retry.clone(),
                    node.clone(),
                    inputs,
                    ctx.clone(),
                    token,
                ));
                let fallback = provenance(node, 0, None);
                in_flight.spawn(async move {
                    match work.await {
                        Ok(finished) => finished,
                        Err(e) => {
                            let err = OrchestrationError::ComputationError(format!("task aborted: {}", e));
                            (fallback.task_id.clone(), TaskResult::failed(fallback, &err))
                        }
                    }
                });
            }

            if in_flight.is_empty() {
                break;
            }

            let event = tokio::select! {
                biased;
                _ = ctx.cancel.cancelled() => Event::Cancelled,
                _ = tokio::time::sleep_until(ctx.deadline) => Event::DeadlineReached,
                joined = in_flight.join_next() => Event::Joined(joined),
            };

            match event {
                Event::Joined(Some(Ok((id, result)))) => {
                    tokens.remove(&id);
                    if dag.status(&id) != Some(TaskStatus::Running) {
                        // cancelled earlier, the late result is ignored
                        debug!(request_id = %ctx.request_id, task = %id, "Ignoring late result");
                        continue;
                    }
                    self.record(&mut dag, &nodes, &mut results, &mut tokens, id, result);
                }
                Event::Joined(Some(Err(e))) => {
                    error!(request_id = %ctx.request_id, error = %e, "Task supervisor failed");
                }
                Event::Joined(None) => {}
                Event::DeadlineReached => {
                    warn!(
                        request_id = %ctx.request_id,
                        running = ?dag.running(),
                        "Request deadline reached, cancelling outstanding tasks"
                    );
                    timed_out = true;
                    break;
                }
                Event::Cancelled => {
                    warn!(request_id = %ctx.request_id, "Request cancelled");
                    cancelled = true;
                    break;
                }
            }
        }

        // anything still open was cut off by the deadline or cancellation
        if !dag.is_done() {
            for token in tokens.values() {
                token.cancel();
            }
            in_flight.abort_all();
            let reason = if timed_out { "request deadline reached" } else { "request cancelled" };
            for id in dag.outstanding() {
                if let Some(node) = nodes.get(&id) {
                    results.insert(id.clone(), TaskResult::skipped(provenance(node, 0, None), reason));
                }
                dag.mark_skipped(&id);
            }
        }

        let status = dag.outcome(timed_out || cancelled);
        for node in graph.nodes.iter_mut() {
            if let Some(s) = dag.status(&node.id) {
                node.status = s;
            }
        }

        let result_set = ResultSet {
            request_id: ctx.request_id,
            status,
            results,
            snapshot_digest: ctx.snapshots.digest().await,
            timed_out,
        };

        match status {
            RequestStatus::Completed => info!(request_id = %ctx.request_id, "Graph execution completed"),
            RequestStatus::Partial => warn!(
                request_id = %ctx.request_id,
                unsuccessful = result_set.unsuccessful().count(),
                "Graph execution partially completed"
            ),
            RequestStatus::Failed => warn!(request_id = %ctx.request_id, timed_out, "Graph execution failed"),
        }

        Ok(result_set)
    }

    /// Store a finished node's result and propagate its outcome
    fn record(
        &self,
        dag: &mut DagState,
        nodes: &HashMap<String, TaskNode>,
        results: &mut BTreeMap<String, TaskResult>,
        tokens: &mut HashMap<String, CancellationToken>,
        id: String,
        result: TaskResult,
    ) {
        match result.status {
            TaskStatus::Succeeded => {
                dag.mark_succeeded(&id);
                results.insert(id, result);
            }
            _ => {
                let required = !dag.is_optional(&id);
                warn!(
                    task = %id,
                    required,
                    error = result.error.as_deref().unwrap_or_default(),
                    "Task did not succeed"
                );
                let skipped = if result.status == TaskStatus::Skipped {
                    dag.mark_skipped(&id)
                } else {
                    dag.mark_failed(&id)
                };
                results.insert(id.clone(), result);

                for dependent in skipped {
                    if let Some(node) = nodes.get(&dependent) {
                        let reason = format!("dependency '{}' did not succeed", id);
                        results.insert(dependent.clone(), TaskResult::skipped(provenance(node, 0, None), reason));
                    }
                }

                if required {
                    for orphan in dag.orphaned_running() {
                        if let Some(token) = tokens.remove(&orphan) {
                            token.cancel();
                        }
                        debug!(task = %orphan, "Cancelling task whose consumers were all skipped");
                        if let Some(node) = nodes.get(&orphan) {
                            results.insert(
                                orphan.clone(),
                                TaskResult::skipped(provenance(node, 0, None), "cancelled: every consumer was skipped"),
                            );
                        }
                        dag.mark_skipped(&orphan);
                    }
                }
            }
        }
    }
}

fn provenance(node: &TaskNode, attempts: u32, note: Option<String>) -> Provenance {
    Provenance {
        task_id: node.id.clone(),
        capability_name: node.capability_name.clone(),
        parameters: node.parameters.clone(),
        timestamp: Utc::now(),
        inputs: node.dependency_ids.iter().cloned().collect(),
        snapshot_id: None,
        attempts,
        note,
    }
}

/// Values of the node's dependencies, all of which have succeeded
fn gather_inputs(node: &TaskNode, results: &BTreeMap<String, TaskResult>) -> ComputationSnapshot {
    let mut inputs = ComputationSnapshot::new();
    for dep in &node.dependency_ids {
        if let Some(value) = results.get(dep).and_then(|r| r.value.clone()) {
            inputs.insert(dep.clone(), value);
        }
    }
    inputs
}

async fn run_node(
    registry: Arc<ConnectorRegistry>,
    engine: Arc<ComputationEngine>,
    retry: RetryPolicy,
    node: TaskNode,
    inputs: ComputationSnapshot,
    ctx: RequestContext,
    cancel: CancellationToken,
) -> (String, TaskResult) {
    let id = node.id.clone();
    let work = async {
        if registry.descriptor(&node.capability_name).is_some() {
            let (registry, task, ctx) = (&*registry, &node, &ctx);
            let (outcome, attempts) = retry
                .run(&node.id, &cancel, move |_| {
                    registry.invoke(
                        &task.id,
                        &task.capability_name,
                        &task.parameters,
                        &ctx.snapshot_token,
                        &ctx.snapshots,
                    )
                })
                .await;
            match outcome {
                Ok(mut result) => {
                    result.provenance.attempts = attempts;
                    result
                }
                Err(e) => TaskResult::failed(provenance(&node, attempts, None), &e),
            }
        } else {
            // computations are pure and never retried
            match engine.evaluate(&node.capability_name, &inputs, &node.parameters) {
                Ok(computed) => {
                    let note = computed.evaluation.note.clone();
                    let figure = computed.into_figure(&node.id);
                    TaskResult::succeeded(TaskValue::Figure(figure), provenance(&node, 1, note))
                }
                Err(e) => TaskResult::failed(provenance(&node, 1, None), &e),
            }
        }
    };

    let result = tokio::select! {
        _ = cancel.cancelled() => TaskResult::skipped(provenance(&node, 0, None), "cancelled"),
        result = work => result,
    };
    (id, result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connectors::{ledger_descriptors, ConnectorRegistry};
    use crate::testing::{invoices, sales, CountingConnector, FlakyConnector, MalformedConnector, SlowConnector};
    use rust_decimal::Decimal;
    use serde_json::json;
    use std::str::FromStr;
    use std::sync::atomic::Ordering;

    const PERIOD: (&str, &str) = ("2025-01-01", "2025-01-30");

    fn params() -> serde_json::Value {
        json!({"start": PERIOD.0, "end": PERIOD.1})
    }

    fn descriptor(name: &str) -> crate::models::CapabilityDescriptor {
        ledger_descriptors()
            .into_iter()
            .find(|d| d.name == name)
            .unwrap()
    }

    fn fast_policy() -> ExecutionPolicy {
        ExecutionPolicy {
            max_in_flight: 4,
            retry: RetryPolicy::new(3, Duration::from_millis(1), Duration::from_millis(5)),
        }
    }

    fn orchestrator(registry: ConnectorRegistry) -> Orchestrator {
        Orchestrator::new(
            Arc::new(registry),
            Arc::new(ComputationEngine::with_builtin_formulas()),
            fast_policy(),
        )
    }

    fn dso_graph() -> TaskGraph {
        TaskGraph::new(
            Uuid::new_v4(),
            vec![
                TaskNode::new("ar", "fetch_receivables", params()),
                TaskNode::new("sales", "fetch_sales", params()),
                TaskNode::new("dso", "dso", json!({"receivables": "ar", "sales": "sales"}))
                    .depends_on(["ar", "sales"]),
            ],
        )
    }

    fn context(graph: &TaskGraph) -> RequestContext {
        RequestContext::new(graph.request_id, Duration::from_secs(5))
    }

    #[tokio::test]
    async fn test_dso_graph_produces_one_traceable_figure() {
        let ar = Arc::new(CountingConnector::new(invoices()));
        let mut registry = ConnectorRegistry::new(Duration::from_secs(1));
        registry.register(descriptor("fetch_receivables"), ar.clone());
        registry.register(descriptor("fetch_sales"), Arc::new(CountingConnector::new(sales())));

        let mut graph = dso_graph();
        let ctx = context(&graph);
        let results = orchestrator(registry).execute(&mut graph, &ctx).await.unwrap();

        assert_eq!(results.status, RequestStatus::Completed);
        let figures: Vec<_> = results.figures().collect();
        assert_eq!(figures.len(), 1);
        let (result, figure) = figures[0];
        assert_eq!(figure.source_task_id, "dso");
        assert_eq!(figure.value.amount(), Some(Decimal::from_str("31.00").unwrap()));
        assert_eq!(result.provenance.inputs, vec!["ar", "sales"]);
        assert!(results.get("ar").unwrap().provenance.snapshot_id.is_some());
        assert_eq!(ar.calls.load(Ordering::SeqCst), 1);
        assert!(graph.nodes.iter().all(|n| n.status == TaskStatus::Succeeded));
    }

    #[tokio::test]
    async fn test_required_failure_skips_dependents_and_fails_request() {
        let mut registry = ConnectorRegistry::new(Duration::from_secs(1));
        registry.register(descriptor("fetch_sales"), Arc::new(MalformedConnector));

        let mut graph = TaskGraph::new(
            Uuid::new_v4(),
            vec![
                TaskNode::new("a", "fetch_sales", params()),
                TaskNode::new("b", "period_total", json!({"ledger": "a"})).depends_on(["a"]),
                TaskNode::new("c", "outstanding_balance", json!({"ledger": "a"})).depends_on(["a"]),
            ],
        );
        let ctx = context(&graph);
        let results = orchestrator(registry).execute(&mut graph, &ctx).await.unwrap();

        assert_eq!(results.status, RequestStatus::Failed);
        assert_eq!(results.get("a").unwrap().status, TaskStatus::Failed);
        assert_eq!(results.get("a").unwrap().error_kind.as_deref(), Some("schema_violation"));
        assert_eq!(results.get("a").unwrap().provenance.attempts, 1);
        assert_eq!(results.get("b").unwrap().status, TaskStatus::Skipped);
        assert_eq!(results.get("c").unwrap().status, TaskStatus::Skipped);
    }

    #[tokio::test]
    async fn test_optional_failure_leaves_siblings_and_is_partial() {
        let mut registry = ConnectorRegistry::new(Duration::from_secs(1));
        registry.register(descriptor("fetch_sales"), Arc::new(CountingConnector::new(sales())));
        registry.register(descriptor("fetch_purchases"), Arc::new(MalformedConnector));

        let mut graph = TaskGraph::new(
            Uuid::new_v4(),
            vec![
                TaskNode::new("sales", "fetch_sales", params()),
                TaskNode::new("total", "period_total", json!({"ledger": "sales"})).depends_on(["sales"]),
                TaskNode::new("purchases", "fetch_purchases", params()).optional(),
            ],
        );
        let ctx = context(&graph);
        let results = orchestrator(registry).execute(&mut graph, &ctx).await.unwrap();

        assert_eq!(results.status, RequestStatus::Partial);
        assert_eq!(results.get("total").unwrap().status, TaskStatus::Succeeded);
        assert_eq!(results.get("purchases").unwrap().status, TaskStatus::Failed);
    }

    #[tokio::test]
    async fn test_timeouts_are_retried_then_succeed() {
        let flaky = Arc::new(FlakyConnector::new(2, sales()));
        let mut registry = ConnectorRegistry::new(Duration::from_millis(50));
        registry.register(descriptor("fetch_sales"), flaky.clone());

        let mut graph = TaskGraph::new(Uuid::new_v4(), vec![TaskNode::new("s", "fetch_sales", params())]);
        let ctx = context(&graph);
        let results = orchestrator(registry).execute(&mut graph, &ctx).await.unwrap();

        assert_eq!(results.status, RequestStatus::Completed);
        assert_eq!(results.get("s").unwrap().provenance.attempts, 3);
        assert_eq!(flaky.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_timeouts_exhaust_the_retry_ceiling() {
        let flaky = Arc::new(FlakyConnector::new(10, sales()));
        let mut registry = ConnectorRegistry::new(Duration::from_millis(50));
        registry.register(descriptor("fetch_sales"), flaky.clone());

        let mut graph = TaskGraph::new(Uuid::new_v4(), vec![TaskNode::new("s", "fetch_sales", params())]);
        let ctx = context(&graph);
        let results = orchestrator(registry).execute(&mut graph, &ctx).await.unwrap();

        assert_eq!(results.status, RequestStatus::Failed);
        assert_eq!(results.get("s").unwrap().error_kind.as_deref(), Some("timeout"));
        assert_eq!(flaky.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_cycle_fails_before_any_connector_call() {
        let counting = Arc::new(CountingConnector::new(sales()));
        let mut registry = ConnectorRegistry::new(Duration::from_secs(1));
        registry.register(descriptor("fetch_sales"), counting.clone());

        let mut graph = TaskGraph::new(
            Uuid::new_v4(),
            vec![
                TaskNode::new("s", "fetch_sales", params()),
                TaskNode::new("x", "period_total", json!({"ledger": "y"})).depends_on(["s", "y"]),
                TaskNode::new("y", "period_total", json!({"ledger": "x"})).depends_on(["x"]),
            ],
        );
        let ctx = context(&graph);
        let err = orchestrator(registry).execute(&mut graph, &ctx).await.unwrap_err();

        assert_eq!(err.kind(), "planning_error");
        assert_eq!(counting.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_deadline_fails_request_and_skips_outstanding_nodes() {
        let mut registry = ConnectorRegistry::new(Duration::from_secs(10));
        registry.register(descriptor("fetch_sales"), Arc::new(SlowConnector::new(Duration::from_secs(5))));

        let mut graph = TaskGraph::new(
            Uuid::new_v4(),
            vec![
                TaskNode::new("s", "fetch_sales", params()),
                TaskNode::new("t", "period_total", json!({"ledger": "s"})).depends_on(["s"]),
            ],
        );
        let ctx = RequestContext::new(graph.request_id, Duration::from_millis(50));
        let results = orchestrator(registry).execute(&mut graph, &ctx).await.unwrap();

        assert!(results.timed_out);
        assert_eq!(results.status, RequestStatus::Failed);
        assert_eq!(results.get("s").unwrap().status, TaskStatus::Skipped);
        assert_eq!(results.get("t").unwrap().status, TaskStatus::Skipped);
    }

    #[tokio::test]
    async fn test_failed_branch_cancels_running_sibling_input() {
        let mut registry = ConnectorRegistry::new(Duration::from_secs(10));
        registry.register(descriptor("fetch_receivables"), Arc::new(SlowConnector::new(Duration::from_secs(5))));
        registry.register(descriptor("fetch_sales"), Arc::new(MalformedConnector));

        let mut graph = dso_graph();
        let ctx = context(&graph);
        let started = std::time::Instant::now();
        let results = orchestrator(registry).execute(&mut graph, &ctx).await.unwrap();

        assert!(started.elapsed() < Duration::from_secs(4));
        assert_eq!(results.status, RequestStatus::Failed);
        assert!(!results.timed_out);
        assert_eq!(results.get("ar").unwrap().status, TaskStatus::Skipped);
        assert_eq!(results.get("dso").unwrap().status, TaskStatus::Skipped);
    }

    #[tokio::test]
    async fn test_in_flight_limit_is_respected() {
        let slow = Arc::new(SlowConnector::new(Duration::from_millis(20)));
        let mut registry = ConnectorRegistry::new(Duration::from_secs(1));
        for name in ["fetch_receivables", "fetch_sales", "fetch_payables", "fetch_purchases"] {
            registry.register(descriptor(name), slow.clone());
        }
        let graph_nodes = ["fetch_receivables", "fetch_sales", "fetch_payables", "fetch_purchases"]
            .iter()
            .map(|name| TaskNode::new(*name, *name, params()))
            .collect();
        let mut graph = TaskGraph::new(Uuid::new_v4(), graph_nodes);
        let ctx = context(&graph);

        let orchestrator = Orchestrator::new(
            Arc::new(registry),
            Arc::new(ComputationEngine::with_builtin_formulas()),
            ExecutionPolicy {
                max_in_flight: 2,
                ..fast_policy()
            },
        );
        let results = orchestrator.execute(&mut graph, &ctx).await.unwrap();

        assert_eq!(results.status, RequestStatus::Completed);
        assert_eq!(slow.peak_concurrency(), 2);
    }
}
