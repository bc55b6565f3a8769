//! Audit trail
//!
//! Every submitted request leaves an `ExecutionRecord`: the plan, the result
//! set, the report and the snapshot digest. Reported figures can be traced
//! back to the task result that produced them.

use crate::error::OrchestrationError;
use crate::models::{ExecutionRecord, TaskResult, TaskStatus};
use crate::snapshot::digest_json;
use crate::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

/// In-memory audit storage
pub struct AuditLog {
    records: Arc<RwLock<HashMap<Uuid, ExecutionRecord>>>,
}

impl AuditLog {
    pub fn new() -> Self {
        Self {
            records: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Store an execution record. The hash must already be sealed.
    pub async fn record(&self, record: ExecutionRecord) -> Result<Uuid> {
        if record.record_hash != compute_record_hash(&record) {
            return Err(OrchestrationError::AuditError(format!(
                "record {} does not match its hash",
                record.audit_id
            )));
        }
        let audit_id = record.audit_id;
        let mut records = self.records.write().await;
        records.insert(audit_id, record);
        Ok(audit_id)
    }

    pub async fn get(&self, audit_id: Uuid) -> Result<Option<ExecutionRecord>> {
        let records = self.records.read().await;
        Ok(records.get(&audit_id).cloned())
    }

    /// Most recent records first
    pub async fn list_recent(&self, limit: usize) -> Result<Vec<ExecutionRecord>> {
        let records = self.records.read().await;
        let mut items: Vec<&ExecutionRecord> = records.values().collect();
        items.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(items.into_iter().take(limit).cloned().collect())
    }

    /// Recompute the record hash. Unknown ids are not intact.
    pub async fn verify_integrity(&self, audit_id: Uuid) -> Result<bool> {
        let records = self.records.read().await;
        Ok(records
            .get(&audit_id)
            .map_or(false, |record| compute_record_hash(record) == record.record_hash))
    }

    /// The task result behind a reported figure
    pub async fn resolve_provenance(&self, audit_id: Uuid, task_id: &str) -> Result<Option<TaskResult>> {
        let records = self.records.read().await;
        Ok(records
            .get(&audit_id)
            .and_then(|record| record.results.get(task_id).cloned()))
    }

    /// True when every figure in the report resolves to a succeeded task
    /// result holding the same figure
    pub async fn verify_provenance(&self, audit_id: Uuid) -> Result<bool> {
        let records = self.records.read().await;
        let Some(record) = records.get(&audit_id) else {
            return Ok(false);
        };
        Ok(record.report.figures.iter().all(|reported| {
            record
                .results
                .get(&reported.provenance.task_id)
                .map_or(false, |result| {
                    result.status == TaskStatus::Succeeded && result.figure() == Some(&reported.figure)
                })
        }))
    }
}

impl Default for AuditLog {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Serialize)]
struct HashedContent<'a> {
    audit_id: &'a Uuid,
    request: &'a crate::models::Request,
    graph: &'a crate::models::TaskGraph,
    results: &'a crate::models::ResultSet,
    report: &'a crate::models::Report,
    snapshot_digest: &'a str,
    reasoning_trace: &'a [String],
    created_at: &'a DateTime<Utc>,
}

/// SHA-256 over everything in the record except the hash itself
pub fn compute_record_hash(record: &ExecutionRecord) -> String {
    digest_json(&HashedContent {
        audit_id: &record.audit_id,
        request: &record.request,
        graph: &record.graph,
        results: &record.results,
        report: &record.report,
        snapshot_digest: &record.snapshot_digest,
        reasoning_trace: &record.reasoning_trace,
        created_at: &record.created_at,
    })
}
