//! Core data models for the finance query orchestrator

use crate::schema::Schema;
use crate::snapshot::DataSnapshot;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

pub use crate::graph::{TaskGraph, TaskNode};

/// One row pulled from a data source
pub type Record = serde_json::Map<String, Value>;

//
// ================= Request =================
//

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum OutputShape {
    Summary,
    Table,
    Json,
    Unsupported(String),
}

impl From<String> for OutputShape {
    fn from(value: String) -> Self {
        OutputShape::from(value.as_str())
    }
}

impl From<&str> for OutputShape {
    fn from(value: &str) -> Self {
        match value.trim().to_lowercase().as_str() {
            "" | "summary" | "text" | "narrative" => OutputShape::Summary,
            "table" | "markdown" => OutputShape::Table,
            "json" | "structured" => OutputShape::Json,
            other => OutputShape::Unsupported(other.to_string()),
        }
    }
}

impl From<OutputShape> for String {
    fn from(value: OutputShape) -> Self {
        value.to_string()
    }
}

impl fmt::Display for OutputShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutputShape::Summary => write!(f, "summary"),
            OutputShape::Table => write!(f, "table"),
            OutputShape::Json => write!(f, "json"),
            OutputShape::Unsupported(name) => write!(f, "{}", name),
        }
    }
}

/// A natural-language analytical request. Immutable once created.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub id: Uuid,
    pub raw_text: String,
    pub requested_output_shape: OutputShape,
    pub received_at: DateTime<Utc>,
}

impl Request {
    pub fn new(raw_text: impl Into<String>, requested_output_shape: OutputShape) -> Self {
        Self {
            id: Uuid::new_v4(),
            raw_text: raw_text.into(),
            requested_output_shape,
            received_at: Utc::now(),
        }
    }
}

//
// ================= Capabilities =================
//

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CapabilityCategory {
    Connector,
    Computation,
}

/// What a capability hands to the tasks bound to it
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OutputKind {
    /// Receivable or payable documents
    Documents,
    /// Sale or purchase lines
    Transactions,
    Figure,
}

/// What a computation input expects behind its bound task
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum InputKind {
    /// Open documents, aggregated as outstanding balance, or a figure
    Balance,
    /// Transactions, aggregated as a period total, or a figure
    Flow,
    /// A figure computed upstream
    Figure,
    /// Open documents read one by one
    Documents,
}

impl InputKind {
    pub fn accepts(self, output: OutputKind) -> bool {
        matches!(
            (self, output),
            (InputKind::Balance, OutputKind::Documents | OutputKind::Figure)
                | (InputKind::Flow, OutputKind::Transactions | OutputKind::Figure)
                | (InputKind::Figure, OutputKind::Figure)
                | (InputKind::Documents, OutputKind::Documents)
        )
    }
}

/// A parameter of a computation that binds an upstream task id
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RoleSpec {
    pub name: String,
    pub kind: InputKind,
    pub required: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapabilityDescriptor {
    pub name: String,
    pub category: CapabilityCategory,
    pub description: String,
    pub input_schema: Schema,
    pub output_schema: Schema,
    /// Computations only
    #[serde(default)]
    pub input_roles: Vec<RoleSpec>,
    pub output_kind: OutputKind,
    /// Relative cost, lower is cheaper
    pub cost_hint: u32,
}

//
// ================= Task state =================
//

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Ready,
    Running,
    Succeeded,
    Failed,
    Skipped,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Succeeded | TaskStatus::Failed | TaskStatus::Skipped
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Ready => "ready",
            TaskStatus::Running => "running",
            TaskStatus::Succeeded => "succeeded",
            TaskStatus::Failed => "failed",
            TaskStatus::Skipped => "skipped",
        };
        write!(f, "{}", s)
    }
}

//
// ================= Results =================
//

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Provenance {
    pub task_id: String,
    pub capability_name: String,
    pub parameters: Value,
    pub timestamp: DateTime<Utc>,
    /// Upstream task ids whose results fed this one
    #[serde(default)]
    pub inputs: Vec<String>,
    #[serde(default)]
    pub snapshot_id: Option<Uuid>,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default)]
    pub note: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TaskValue {
    Records(DataSnapshot),
    Figure(FinancialFigure),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResult {
    pub task_id: String,
    pub status: TaskStatus,
    pub value: Option<TaskValue>,
    pub provenance: Provenance,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub error_kind: Option<String>,
}

impl TaskResult {
    pub fn succeeded(value: TaskValue, provenance: Provenance) -> Self {
        Self {
            task_id: provenance.task_id.clone(),
            status: TaskStatus::Succeeded,
            value: Some(value),
            provenance,
            error: None,
            error_kind: None,
        }
    }

    pub fn failed(provenance: Provenance, error: &crate::error::OrchestrationError) -> Self {
        Self {
            task_id: provenance.task_id.clone(),
            status: TaskStatus::Failed,
            value: None,
            provenance,
            error: Some(error.to_string()),
            error_kind: Some(error.kind().to_string()),
        }
    }

    pub fn skipped(provenance: Provenance, reason: impl Into<String>) -> Self {
        Self {
            task_id: provenance.task_id.clone(),
            status: TaskStatus::Skipped,
            value: None,
            provenance,
            error: Some(reason.into()),
            error_kind: Some("skipped".to_string()),
        }
    }

    pub fn figure(&self) -> Option<&FinancialFigure> {
        match &self.value {
            Some(TaskValue::Figure(figure)) => Some(figure),
            _ => None,
        }
    }

    pub fn snapshot(&self) -> Option<&DataSnapshot> {
        match &self.value {
            Some(TaskValue::Records(snapshot)) => Some(snapshot),
            _ => None,
        }
    }
}

//
// ================= Financial Figure =================
//

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FigureValue {
    Exact { amount: Decimal },
    /// Sentinel for a KPI whose denominator was zero
    Undefined { reason: String },
}

impl FigureValue {
    pub fn amount(&self) -> Option<Decimal> {
        match self {
            FigureValue::Exact { amount } => Some(*amount),
            FigureValue::Undefined { .. } => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Unit {
    Currency,
    Days,
    Ratio,
    Count,
}

/// One line behind a figure: an aging bucket, a counterparty or a document.
/// Amounts are in the currency of the figure.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BreakdownLine {
    pub label: String,
    pub amount: Decimal,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub counterparty: Option<String>,
    /// Days past due, or days left to the due date when `status` is `due`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub days: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub documents: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
}

impl BreakdownLine {
    pub fn new(label: impl Into<String>, amount: Decimal) -> Self {
        Self {
            label: label.into(),
            amount,
            counterparty: None,
            days: None,
            documents: None,
            status: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FinancialFigure {
    pub label: String,
    pub value: FigureValue,
    pub currency: Option<String>,
    pub unit: Unit,
    pub source_task_id: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub breakdown: Vec<BreakdownLine>,
}

//
// ================= Result set =================
//

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RequestStatus {
    Completed,
    Partial,
    Failed,
}

impl fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RequestStatus::Completed => "completed",
            RequestStatus::Partial => "partial",
            RequestStatus::Failed => "failed",
        };
        write!(f, "{}", s)
    }
}

/// Everything the orchestrator produced for one request, keyed by task id
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultSet {
    pub request_id: Uuid,
    pub status: RequestStatus,
    pub results: BTreeMap<String, TaskResult>,
    pub snapshot_digest: String,
    #[serde(default)]
    pub timed_out: bool,
}

impl ResultSet {
    pub fn get(&self, task_id: &str) -> Option<&TaskResult> {
        self.results.get(task_id)
    }

    /// Successful figures in task-id order
    pub fn figures(&self) -> impl Iterator<Item = (&TaskResult, &FinancialFigure)> {
        self.results
            .values()
            .filter(|r| r.status == TaskStatus::Succeeded)
            .filter_map(|r| r.figure().map(|f| (r, f)))
    }

    pub fn unsuccessful(&self) -> impl Iterator<Item = &TaskResult> {
        self.results
            .values()
            .filter(|r| r.status != TaskStatus::Succeeded)
    }
}

//
// ================= Report =================
//

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum NarrativeSource {
    Template,
    Llm,
    None,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportedFigure {
    pub figure: FinancialFigure,
    pub formatted: String,
    pub provenance: Provenance,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BranchMarker {
    pub task_id: String,
    pub capability_name: String,
    pub status: TaskStatus,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Recommendation {
    pub title: String,
    pub owner: String,
    pub priority: String,
    pub kpi: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Report {
    pub request_id: Uuid,
    pub status: RequestStatus,
    pub shape: OutputShape,
    pub narrative: String,
    pub narrative_source: NarrativeSource,
    pub figures: Vec<ReportedFigure>,
    pub markers: Vec<BranchMarker>,
    #[serde(default)]
    pub table: Option<String>,
    #[serde(default)]
    pub body: Option<Value>,
    #[serde(default)]
    pub recommendations: Vec<Recommendation>,
    /// Set when rendering failed and the raw result set is returned instead
    #[serde(default)]
    pub degraded: bool,
    #[serde(default)]
    pub raw: Option<ResultSet>,
}

//
// ================= Execution Record =================
//

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub audit_id: Uuid,
    pub request: Arc<Request>,
    pub graph: Arc<TaskGraph>,
    pub results: Arc<ResultSet>,
    pub report: Arc<Report>,
    pub snapshot_digest: String,
    pub record_hash: String,
    pub reasoning_trace: Arc<Vec<String>>,
    pub created_at: DateTime<Utc>,
    pub execution_time_ms: u64,
}
