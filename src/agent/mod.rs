//! Request entry point
//!
//! INPUT → PLAN → EXECUTE → NARRATE → AUDIT

use crate::audit::{compute_record_hash, AuditLog};
use crate::catalog::CapabilityCatalog;
use crate::config::AgentConfig;
use crate::connectors::{create_default_registry, ConnectorRegistry};
use crate::engine::ComputationEngine;
use crate::error::{ConnectorError, OrchestrationError, SchemaViolation};
use crate::llm::{CompletionService, GeminiClient};
use crate::models::{ExecutionRecord, OutputShape, Report, Request, RequestStatus, ResultSet, TaskStatus};
use crate::narrator::{render_or_degrade, LlmNarrator, Narrator, TemplateNarrator};
use crate::orchestrator::{ExecutionPolicy, Orchestrator, RequestContext};
use crate::planner::{KeywordPlanner, LlmPlanner, Planner};
use crate::Result;
use chrono::Utc;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};
use uuid::Uuid;

/// What one request produced, including its audit id
#[derive(Debug, Clone)]
pub struct Outcome {
    pub audit_id: Uuid,
    pub report: Report,
    pub reasoning_trace: Vec<String>,
    pub execution_time_ms: u64,
}

pub struct Agent {
    planner: Box<dyn Planner>,
    narrator: Box<dyn Narrator>,
    catalog: CapabilityCatalog,
    orchestrator: Orchestrator,
    audit_log: AuditLog,
    request_timeout: Duration,
}

impl Agent {
    /// The catalog is every registered connector plus every engine formula.
    pub fn new(
        planner: Box<dyn Planner>,
        narrator: Box<dyn Narrator>,
        registry: ConnectorRegistry,
        engine: ComputationEngine,
        policy: ExecutionPolicy,
        audit_log: AuditLog,
        request_timeout: Duration,
    ) -> Self {
        let catalog = CapabilityCatalog::from_descriptors(
            registry.descriptors().into_iter().chain(engine.descriptors()),
        );
        Self {
            planner,
            narrator,
            catalog,
            orchestrator: Orchestrator::new(Arc::new(registry), Arc::new(engine), policy),
            audit_log,
            request_timeout,
        }
    }

    /// Wire the default components. Without a Gemini key, planning falls back
    /// to keyword routing and narration to templates.
    pub fn from_config(config: &AgentConfig) -> Result<Self> {
        let registry = create_default_registry(config)?;

        let (planner, narrator): (Box<dyn Planner>, Box<dyn Narrator>) = match &config.gemini_api_key {
            Some(key) => {
                let client: Arc<dyn CompletionService> =
                    Arc::new(GeminiClient::new(key.clone(), config.gemini_model.clone(), config.connector_timeout)?);
                info!(model = %config.gemini_model, "Planner: model-backed with keyword routing");
                (
                    Box::new(LlmPlanner::new(client.clone())),
                    Box::new(LlmNarrator::new(client)),
                )
            }
            None => {
                warn!("GEMINI_API_KEY not set, using keyword routing and template narration only");
                (Box::new(KeywordPlanner::new()), Box::new(TemplateNarrator::new()))
            }
        };

        Ok(Self::new(
            planner,
            narrator,
            registry,
            ComputationEngine::with_builtin_formulas(),
            config.execution_policy(),
            AuditLog::new(),
            config.request_timeout,
        ))
    }

    pub fn catalog(&self) -> &CapabilityCatalog {
        &self.catalog
    }

    pub fn audit_log(&self) -> &AuditLog {
        &self.audit_log
    }

    /// Answer `raw_text` in `shape`.
    ///
    /// Completed and partial requests return their report. A failed request
    /// returns the error of the branch that failed it, or `Timeout`.
    pub async fn submit(&self, raw_text: &str, shape: OutputShape) -> Result<Report> {
        let outcome = self.run(Request::new(raw_text, shape)).await?;
        if outcome.report.status == RequestStatus::Failed {
            let raw = outcome.report.raw.as_ref();
            return Err(match raw {
                Some(results) => failure_error(results, self.request_timeout),
                None => OrchestrationError::ComputationError(format!(
                    "request failed, see audit record {}",
                    outcome.audit_id
                )),
            });
        }
        Ok(outcome.report)
    }

    /// Plan, execute, narrate and audit one request. Execution failures are
    /// reported in the outcome; only planning and audit problems are `Err`.
    pub async fn run(&self, request: Request) -> Result<Outcome> {
        let started = Instant::now();
        let mut trace = Vec::new();

        info!(request_id = %request.id, text = %request.raw_text, shape = %request.requested_output_shape, "Request received");
        trace.push("INPUT: Request received".to_string());

        // === PLAN ===
        let mut graph = match self.planner.plan(&request, &self.catalog).await {
            Ok(graph) => graph,
            Err(e) => {
                warn!(request_id = %request.id, error = %e, "Planning failed");
                return Err(e);
            }
        };
        trace.push(format!(
            "PLAN: {} tasks{}",
            graph.len(),
            graph
                .rationale
                .as_deref()
                .map(|r| format!(" ({})", r))
                .unwrap_or_default()
        ));
        if let Some(period) = &graph.period {
            trace.push(format!("PERIOD: {} to {} ({:?})", period.start, period.end, period.granularity));
            if let Some(warning) = &period.warning {
                trace.push(format!("PERIOD: warning {}", warning));
            }
        }

        // === EXECUTE ===
        let ctx = RequestContext::new(request.id, self.request_timeout);
        let results = self.orchestrator.execute(&mut graph, &ctx).await?;
        let count = |status: TaskStatus| graph.nodes.iter().filter(|n| n.status == status).count();
        trace.push(format!(
            "EXECUTE: {} ({} succeeded, {} failed, {} skipped)",
            results.status,
            count(TaskStatus::Succeeded),
            count(TaskStatus::Failed),
            count(TaskStatus::Skipped)
        ));

        // === NARRATE ===
        let mut report = render_or_degrade(self.narrator.as_ref(), &results, &request.requested_output_shape).await;
        if report.status == RequestStatus::Failed && report.raw.is_none() {
            report.raw = Some(results.clone());
        }
        trace.push(format!(
            "NARRATE: {} figures as {}{}",
            report.figures.len(),
            report.shape,
            if report.degraded { " (degraded)" } else { "" }
        ));

        // === AUDIT ===
        let execution_time_ms = started.elapsed().as_millis() as u64;
        let mut record = ExecutionRecord {
            audit_id: Uuid::new_v4(),
            snapshot_digest: results.snapshot_digest.clone(),
            request: Arc::new(request),
            graph: Arc::new(graph),
            results: Arc::new(results),
            report: Arc::new(report.clone()),
            record_hash: String::new(),
            reasoning_trace: Arc::new(trace.clone()),
            created_at: Utc::now(),
            execution_time_ms,
        };
        record.record_hash = compute_record_hash(&record);
        let audit_id = self.audit_log.record(record).await?;

        info!(
            %audit_id,
            status = %report.status,
            figures = report.figures.len(),
            execution_time_ms,
            "Request finished"
        );

        Ok(Outcome {
            audit_id,
            report,
            reasoning_trace: trace,
            execution_time_ms,
        })
    }
}

/// Error for a failed result set: the deadline, else the first required
/// task that failed
fn failure_error(results: &ResultSet, budget: Duration) -> OrchestrationError {
    if results.timed_out {
        return OrchestrationError::Timeout(format!(
            "request exceeded its {}s budget",
            budget.as_secs_f64()
        ));
    }

    let Some(failed) = results
        .results
        .values()
        .find(|r| r.status == TaskStatus::Failed)
    else {
        return OrchestrationError::ComputationError("request failed".to_string());
    };

    let message = format!(
        "task '{}': {}",
        failed.task_id,
        failed.error.as_deref().unwrap_or("no error recorded")
    );
    match failed.error_kind.as_deref() {
        Some("timeout") => ConnectorError::Timeout(message).into(),
        Some("not_found") => ConnectorError::NotFound(message).into(),
        Some("auth_failure") => ConnectorError::AuthFailure(message).into(),
        Some("connector_error") => ConnectorError::Source(message).into(),
        Some("schema_violation") => {
            SchemaViolation::new(format!("task:{}", failed.task_id), "$", message).into()
        }
        _ => OrchestrationError::ComputationError(message),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connectors::ledger_descriptors;
    use crate::orchestrator::RetryPolicy;
    use crate::testing::{invoices, sales, CountingConnector, FlakyConnector, MalformedConnector, ScriptedCompletion};
    use rust_decimal::Decimal;
    use serde_json::json;
    use std::str::FromStr;
    use std::sync::atomic::Ordering;

    fn descriptor(name: &str) -> crate::models::CapabilityDescriptor {
        ledger_descriptors()
            .into_iter()
            .find(|d| d.name == name)
            .unwrap()
    }

    fn policy() -> ExecutionPolicy {
        ExecutionPolicy {
            max_in_flight: 4,
            retry: RetryPolicy::new(3, Duration::from_millis(1), Duration::from_millis(5)),
        }
    }

    fn agent(planner: Box<dyn Planner>, registry: ConnectorRegistry) -> Agent {
        Agent::new(
            planner,
            Box::new(TemplateNarrator::new()),
            registry,
            ComputationEngine::with_builtin_formulas(),
            policy(),
            AuditLog::new(),
            Duration::from_secs(5),
        )
    }

    fn dso_registry() -> (ConnectorRegistry, Arc<CountingConnector>, Arc<CountingConnector>) {
        let ar = Arc::new(CountingConnector::new(invoices()));
        let sales = Arc::new(CountingConnector::new(sales()));
        let mut registry = ConnectorRegistry::new(Duration::from_secs(1));
        registry.register(descriptor("fetch_receivables"), ar.clone());
        registry.register(descriptor("fetch_sales"), sales.clone());
        (registry, ar, sales)
    }

    #[tokio::test]
    async fn test_dso_question_end_to_end() {
        let (registry, ar, sales) = dso_registry();
        let agent = agent(Box::new(KeywordPlanner::new()), registry);

        let outcome = agent
            .run(Request::new("What was our DSO for January 2025?", OutputShape::Summary))
            .await
            .unwrap();
        let report = &outcome.report;

        assert_eq!(report.status, RequestStatus::Completed);
        assert_eq!(report.figures.len(), 1);
        let figure = &report.figures[0];
        // 31,000 outstanding over 30,000 of sales in a 31-day month
        assert_eq!(figure.figure.value.amount(), Some(Decimal::from_str("32.03").unwrap()));
        assert_eq!(figure.provenance.task_id, "compute_dso");
        assert_eq!(figure.provenance.inputs, vec!["fetch_receivables", "fetch_sales"]);
        assert_eq!(ar.calls.load(Ordering::SeqCst), 1);
        assert_eq!(sales.calls.load(Ordering::SeqCst), 1);

        let log = agent.audit_log();
        assert!(log.verify_integrity(outcome.audit_id).await.unwrap());
        assert!(log.verify_provenance(outcome.audit_id).await.unwrap());
        let behind = log
            .resolve_provenance(outcome.audit_id, &figure.provenance.task_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(behind.figure(), Some(&figure.figure));
        assert!(outcome.reasoning_trace.iter().any(|t| t.starts_with("PLAN: 3 tasks")));
    }

    #[tokio::test]
    async fn test_aging_question_reports_buckets() {
        let (registry, _, sales) = dso_registry();
        let agent = agent(Box::new(KeywordPlanner::new()), registry);

        let report = agent.submit("AR aging for January 2025", OutputShape::Summary).await.unwrap();

        assert_eq!(report.status, RequestStatus::Completed);
        let figure = &report.figures[0].figure;
        // invoice A is 31 days past due at the end of January, B is not yet due
        assert_eq!(figure.value.amount(), Some(Decimal::from_str("16000.00").unwrap()));
        let line = |label: &str| figure.breakdown.iter().find(|l| l.label == label).unwrap().amount;
        assert_eq!(line("31-60 days"), Decimal::from_str("16000.00").unwrap());
        assert_eq!(line("not yet due"), Decimal::from_str("15000.00").unwrap());
        assert!(report.narrative.contains("31-60 days"));
        assert_eq!(sales.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_submit_is_deterministic_across_runs() {
        let (registry, _, _) = dso_registry();
        let agent = agent(Box::new(KeywordPlanner::new()), registry);

        let first = agent.submit("DSO January 2025", OutputShape::Json).await.unwrap();
        let second = agent.submit("DSO January 2025", OutputShape::Json).await.unwrap();
        assert_eq!(first.figures[0].figure, second.figures[0].figure);
        assert_eq!(first.body.unwrap()["figures"], second.body.unwrap()["figures"]);
    }

    #[tokio::test]
    async fn test_failed_required_branch_is_an_error_from_submit() {
        let mut registry = ConnectorRegistry::new(Duration::from_secs(1));
        registry.register(descriptor("fetch_receivables"), Arc::new(CountingConnector::new(invoices())));
        registry.register(descriptor("fetch_sales"), Arc::new(MalformedConnector));
        let agent = agent(Box::new(KeywordPlanner::new()), registry);

        let err = agent.submit("DSO for January 2025", OutputShape::Summary).await.unwrap_err();
        assert_eq!(err.kind(), "schema_violation");

        let outcome = agent
            .run(Request::new("DSO for January 2025", OutputShape::Summary))
            .await
            .unwrap();
        assert_eq!(outcome.report.status, RequestStatus::Failed);
        assert!(outcome.report.markers.iter().any(|m| m.task_id == "compute_dso"));
    }

    #[tokio::test]
    async fn test_connector_timeouts_exhaust_retries() {
        let flaky = Arc::new(FlakyConnector::new(10, sales()));
        let mut registry = ConnectorRegistry::new(Duration::from_millis(50));
        registry.register(descriptor("fetch_receivables"), Arc::new(CountingConnector::new(invoices())));
        registry.register(descriptor("fetch_sales"), flaky.clone());
        let agent = agent(Box::new(KeywordPlanner::new()), registry);

        let err = agent.submit("DSO for January 2025", OutputShape::Summary).await.unwrap_err();
        assert_eq!(err.kind(), "timeout");
        assert_eq!(flaky.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_cyclic_model_plan_never_reaches_a_connector() {
        let (registry, ar, sales) = dso_registry();
        let completion = Arc::new(ScriptedCompletion::new(vec![Ok(json!({"nodes": [
            {"id": "ar", "capability": "fetch_receivables"},
            {"id": "x", "capability": "ccc", "parameters": {"dso": "y", "dpo": "y"}, "depends_on": ["ar", "y"]},
            {"id": "y", "capability": "ccc", "parameters": {"dso": "x", "dpo": "x"}, "depends_on": ["x"]}
        ]}))]));
        let agent = agent(Box::new(LlmPlanner::new(completion)), registry);

        let err = agent.submit("explain our liquidity", OutputShape::Summary).await.unwrap_err();
        assert_eq!(err.kind(), "planning_error");
        assert_eq!(ar.calls.load(Ordering::SeqCst), 0);
        assert_eq!(sales.calls.load(Ordering::SeqCst), 0);
        assert!(agent.audit_log().list_recent(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unsupported_shape_returns_raw_results() {
        let (registry, _, _) = dso_registry();
        let agent = agent(Box::new(KeywordPlanner::new()), registry);

        let report = agent.submit("DSO for January 2025", OutputShape::from("pie_chart")).await.unwrap();
        assert!(report.degraded);
        let raw = report.raw.unwrap();
        assert!(raw.get("compute_dso").unwrap().figure().is_some());
    }

    #[test]
    fn test_default_config_builds_an_agent() {
        let agent = Agent::from_config(&AgentConfig::default()).unwrap();
        assert!(agent.catalog().contains("fetch_sales"));
        assert!(agent.catalog().contains("dso"));
    }
}
