//! Planner trait and the plan validation gate
//!
//! Planners turn a request into a task graph drawn only from the capability
//! catalog. Whatever produced the raw plan (keyword routing or a language
//! model), it goes through `validate_plan` before the orchestrator sees it.

use crate::catalog::CapabilityCatalog;
use crate::error::OrchestrationError;
use crate::graph::{TaskGraph, TaskNode};
use crate::models::{CapabilityCategory, Request};
use crate::period::Period;
use crate::schema::{task_graph_schema, validate, validate_ref};
use crate::Result;
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::HashSet;

pub mod keyword;
pub mod llm;

pub use keyword::KeywordPlanner;
pub use llm::LlmPlanner;

/// Upper bound on tasks in one plan
pub const MAX_NODES: usize = 50;

#[async_trait]
pub trait Planner: Send + Sync {
    /// Build a validated task graph for `request`. No side effects.
    async fn plan(&self, request: &Request, catalog: &CapabilityCatalog) -> Result<TaskGraph>;
}

fn planning(message: impl Into<String>) -> OrchestrationError {
    OrchestrationError::PlanningError(message.into())
}

/// Fill `start`/`end` into connector nodes that did not set them
pub fn apply_period(raw: &mut Value, catalog: &CapabilityCatalog, period: &Period) {
    let Some(nodes) = raw.get_mut("nodes").and_then(Value::as_array_mut) else {
        return;
    };
    let bounds = period.as_parameters();

    for node in nodes.iter_mut() {
        let is_connector = node
            .get("capability")
            .and_then(Value::as_str)
            .and_then(|name| catalog.get(name))
            .map_or(false, |d| d.category == CapabilityCategory::Connector);
        if !is_connector {
            continue;
        }
        let Some(obj) = node.as_object_mut() else {
            continue;
        };
        let params = obj
            .entry("parameters")
            .or_insert_with(|| Value::Object(Map::new()));
        if let (Some(params), Some(bounds)) = (params.as_object_mut(), bounds.as_object()) {
            for (key, value) in bounds {
                params.entry(key.clone()).or_insert_with(|| value.clone());
            }
        }
    }
}

/// Parse, don't trust: turn a raw plan payload into a task graph or reject it.
pub fn validate_plan(raw: Value, request: &Request, catalog: &CapabilityCatalog) -> Result<TaskGraph> {
    let raw = validate(raw, &task_graph_schema(), "planner")
        .map_err(|v| planning(format!("plan does not match contract: {}", v)))?;

    let raw_nodes = raw
        .get("nodes")
        .and_then(Value::as_array)
        .ok_or_else(|| planning("plan has no nodes array"))?;

    if raw_nodes.is_empty() {
        return Err(planning("plan has no tasks"));
    }
    if raw_nodes.len() > MAX_NODES {
        return Err(planning(format!(
            "plan has {} tasks, the limit is {}",
            raw_nodes.len(),
            MAX_NODES
        )));
    }

    let mut seen = HashSet::new();
    let mut nodes = Vec::with_capacity(raw_nodes.len());

    for raw_node in raw_nodes {
        let id = raw_node
            .get("id")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| planning("task with an empty id"))?;
        if !seen.insert(id.to_string()) {
            return Err(planning(format!("duplicate task id '{}'", id)));
        }

        let capability = raw_node
            .get("capability")
            .and_then(Value::as_str)
            .unwrap_or_default();
        let descriptor = catalog.get(capability).ok_or_else(|| {
            planning(format!("task '{}' uses unknown capability '{}'", id, capability))
        })?;

        let parameters = raw_node
            .get("parameters")
            .cloned()
            .unwrap_or_else(|| Value::Object(Map::new()));
        validate_ref(
            &parameters,
            &descriptor.input_schema,
            &format!("planner:{}", id),
        )
        .map_err(|v| planning(format!("task '{}' has invalid parameters: {}", id, v)))?;

        let depends_on: Vec<String> = raw_node
            .get("depends_on")
            .and_then(Value::as_array)
            .map(|deps| {
                deps.iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        let mut node = TaskNode::new(id, capability, parameters).depends_on(depends_on);
        node.optional = raw_node
            .get("optional")
            .and_then(Value::as_bool)
            .unwrap_or(false);

        // a computation input must come from a task it declares it waits for
        for role in &descriptor.input_roles {
            match node.parameters.get(&role.name).and_then(Value::as_str) {
                Some(bound) if !node.dependency_ids.contains(bound) => {
                    return Err(planning(format!(
                        "task '{}' binds input '{}' to '{}' which is not in its dependencies",
                        id, role.name, bound
                    )));
                }
                None if role.required => {
                    return Err(planning(format!(
                        "task '{}' leaves required input '{}' unbound",
                        id, role.name
                    )));
                }
                _ => {}
            }
        }

        nodes.push(node);
    }

    let mut graph = TaskGraph::new(request.id, nodes);
    graph.rationale = raw
        .get("rationale")
        .and_then(Value::as_str)
        .map(str::to_string);

    // unknown dependency ids and cycles are both caught here
    graph.topological_order()?;
    check_input_kinds(&graph, catalog)?;

    Ok(graph)
}

/// Each bound input must be fed by a task producing what the role reads:
/// a figure role needs a computation, a documents role needs a document ledger.
fn check_input_kinds(graph: &TaskGraph, catalog: &CapabilityCatalog) -> Result<()> {
    for node in &graph.nodes {
        let Some(descriptor) = catalog.get(&node.capability_name) else {
            continue;
        };
        for role in &descriptor.input_roles {
            let Some(bound) = node.parameters.get(&role.name).and_then(Value::as_str) else {
                continue;
            };
            let produces = graph
                .get(bound)
                .and_then(|upstream| catalog.get(&upstream.capability_name))
                .map(|d| d.output_kind);
            if let Some(output) = produces {
                if !role.kind.accepts(output) {
                    return Err(planning(format!(
                        "task '{}' input '{}' expects {:?} but '{}' produces {:?}",
                        node.id, role.name, role.kind, bound, output
                    )));
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::OutputShape;
    use crate::testing::catalog;
    use serde_json::json;

    fn request() -> Request {
        Request::new("DSO for January 2025", OutputShape::Summary)
    }

    fn dso_plan() -> Value {
        json!({
            "nodes": [
                {"id": "ar", "capability": "fetch_receivables", "parameters": {"start": "2025-01-01", "end": "2025-01-31"}},
                {"id": "sales", "capability": "fetch_sales", "parameters": {"start": "2025-01-01", "end": "2025-01-31"}},
                {"id": "dso", "capability": "dso", "parameters": {"receivables": "ar", "sales": "sales"}, "depends_on": ["ar", "sales"]}
            ],
            "rationale": "DSO needs receivables and sales"
        })
    }

    #[test]
    fn test_valid_plan_becomes_graph() {
        let graph = validate_plan(dso_plan(), &request(), &catalog()).unwrap();
        assert_eq!(graph.len(), 3);
        assert_eq!(graph.get("dso").unwrap().dependency_ids.len(), 2);
        assert_eq!(graph.rationale.as_deref(), Some("DSO needs receivables and sales"));
        assert!(graph.nodes.iter().all(|n| !n.optional));
    }

    #[test]
    fn test_unknown_capability_is_rejected() {
        let mut plan = dso_plan();
        plan["nodes"][0]["capability"] = json!("fetch_weather");
        let err = validate_plan(plan, &request(), &catalog()).unwrap_err();
        assert!(err.to_string().contains("fetch_weather"));
    }

    #[test]
    fn test_missing_parameter_is_rejected() {
        let mut plan = dso_plan();
        plan["nodes"][1]["parameters"] = json!({"start": "2025-01-01"});
        let err = validate_plan(plan, &request(), &catalog()).unwrap_err();
        assert_eq!(err.kind(), "planning_error");
        assert!(err.to_string().contains("end"));
    }

    #[test]
    fn test_empty_and_cyclic_plans_are_rejected() {
        assert!(validate_plan(json!({"nodes": []}), &request(), &catalog()).is_err());

        let cyclic = json!({"nodes": [
            {"id": "a", "capability": "ccc", "parameters": {"dso": "b", "dpo": "b"}, "depends_on": ["b"]},
            {"id": "b", "capability": "ccc", "parameters": {"dso": "a", "dpo": "a"}, "depends_on": ["a"]}
        ]});
        let err = validate_plan(cyclic, &request(), &catalog()).unwrap_err();
        assert!(err.to_string().contains("cycle"));
    }

    #[test]
    fn test_role_must_reference_a_dependency() {
        let mut plan = dso_plan();
        plan["nodes"][2]["depends_on"] = json!(["ar"]);
        let err = validate_plan(plan, &request(), &catalog()).unwrap_err();
        assert!(err.to_string().contains("'sales'"));
    }

    #[test]
    fn test_input_kind_must_match_the_bound_task() {
        // sales lines cannot stand in for receivable documents
        let mut plan = dso_plan();
        plan["nodes"][2]["parameters"] = json!({"receivables": "sales", "sales": "sales"});
        let err = validate_plan(plan, &request(), &catalog()).unwrap_err();
        assert!(err.to_string().contains("'receivables'"));

        // ccc reads day figures, not ledgers
        let plan = json!({"nodes": [
            {"id": "ar", "capability": "fetch_receivables", "parameters": {"start": "2025-01-01", "end": "2025-01-31"}},
            {"id": "c", "capability": "ccc", "parameters": {"dso": "ar", "dpo": "ar"}, "depends_on": ["ar"]}
        ]});
        assert!(validate_plan(plan, &request(), &catalog()).is_err());
    }

    #[test]
    fn test_required_input_must_be_bound() {
        let mut plan = dso_plan();
        plan["nodes"][2]["parameters"] = json!({"receivables": "ar"});
        let err = validate_plan(plan, &request(), &catalog()).unwrap_err();
        assert!(err.to_string().contains("required input 'sales'"));
    }

    #[test]
    fn test_extra_node_keys_are_rejected() {
        let mut plan = dso_plan();
        plan["nodes"][0]["tool_input"] = json!({});
        assert!(validate_plan(plan, &request(), &catalog()).is_err());
    }

    #[test]
    fn test_apply_period_fills_only_missing_connector_bounds() {
        let period = crate::period::resolve_period(
            "March 2025",
            chrono::NaiveDate::from_ymd_opt(2025, 6, 1).unwrap(),
        );
        let mut plan = json!({"nodes": [
            {"id": "a", "capability": "fetch_sales"},
            {"id": "b", "capability": "fetch_receivables", "parameters": {"start": "2025-01-01"}},
            {"id": "c", "capability": "period_total", "parameters": {"ledger": "a"}, "depends_on": ["a"]}
        ]});
        apply_period(&mut plan, &catalog(), &period);

        assert_eq!(plan["nodes"][0]["parameters"], json!({"start": "2025-03-01", "end": "2025-03-31"}));
        assert_eq!(plan["nodes"][1]["parameters"]["start"], json!("2025-01-01"));
        assert_eq!(plan["nodes"][1]["parameters"]["end"], json!("2025-03-31"));
        assert_eq!(plan["nodes"][2]["parameters"], json!({"ledger": "a"}));
        assert!(validate_plan(plan, &request(), &catalog()).is_ok());
    }
}
