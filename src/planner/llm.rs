//! Model-backed planner
//!
//! Requests the keyword router recognises never reach the model. Anything else
//! is decomposed by one completion call whose output goes through the same
//! validation gate as routed plans.

use super::keyword::{request_period, KeywordPlanner};
use super::{apply_period, validate_plan, Planner, MAX_NODES};
use crate::catalog::CapabilityCatalog;
use crate::error::OrchestrationError;
use crate::graph::TaskGraph;
use crate::llm::CompletionService;
use crate::models::Request;
use crate::period::Period;
use crate::schema::task_graph_schema;
use crate::Result;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{info, warn};

pub struct LlmPlanner {
    completion: Arc<dyn CompletionService>,
    routing: KeywordPlanner,
}

impl LlmPlanner {
    pub fn new(completion: Arc<dyn CompletionService>) -> Self {
        Self {
            completion,
            routing: KeywordPlanner::new(),
        }
    }

    fn build_prompt(request: &Request, catalog: &CapabilityCatalog, period: &Period) -> String {
        format!(
            r#"Decompose the finance question into a task graph.

Question: {question}
Reporting period: {start} to {end} ({days} days)

Capabilities (use these names only):
{capabilities}

Rules:
- Every node needs a unique "id" and a "capability" from the list above.
- Connector parameters "start" and "end" default to the reporting period when omitted.
- A computation parameter that names an input (for example "receivables") holds the id of the task producing it, and that id must appear in the node's "depends_on".
- Bind ledger inputs to connector tasks and figure inputs (dso, dpo, dio) to computation tasks.
- To ask about one customer or supplier, pass "counterparty" to fetch_receivables or fetch_payables.
- Mark a node "optional": true when the answer is still useful without it.
- No cycles. At most {max_nodes} nodes.
- Put a one-sentence "rationale" next to "nodes"."#,
            question = request.raw_text,
            start = period.start,
            end = period.end,
            days = period.days(),
            capabilities = catalog.describe_for_prompt(),
            max_nodes = MAX_NODES,
        )
    }
}

#[async_trait]
impl Planner for LlmPlanner {
    async fn plan(&self, request: &Request, catalog: &CapabilityCatalog) -> Result<TaskGraph> {
        if let Some(graph) = self.routing.try_plan(request, catalog)? {
            return Ok(graph);
        }

        let period = request_period(request);
        let prompt = Self::build_prompt(request, catalog, &period);
        info!(request_id = %request.id, "Asking the model for a plan");

        let mut raw = self
            .completion
            .complete(&prompt, &task_graph_schema())
            .await
            .map_err(|e| {
                warn!(request_id = %request.id, error = %e, "Model planning call failed");
                OrchestrationError::PlanningError(format!("model could not plan the request: {}", e))
            })?;

        apply_period(&mut raw, catalog, &period);
        let mut graph = validate_plan(raw, request, catalog)?;
        graph.period = Some(period);
        Ok(graph)
    }
}
