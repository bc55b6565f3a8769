//! Fixtures shared by the unit tests

use crate::catalog::CapabilityCatalog;
use crate::connectors::{ledger_descriptors, Connector, ConnectorQuery};
use crate::engine::ComputationEngine;
use crate::error::{ConnectorError, OrchestrationError};
use crate::llm::CompletionService;
use crate::models::Record;
use crate::schema::Schema;
use crate::Result;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

pub fn record(value: Value) -> Record {
    match value {
        Value::Object(map) => map,
        other => panic!("record fixture must be an object, got {}", other),
    }
}

/// Receivables with USD 31,000.00 outstanding
pub fn invoices() -> Vec<Record> {
    vec![
        record(json!({"invoice_id": "A", "counterparty": "Acme", "issue_date": "2024-12-01", "due_date": "2024-12-31", "amount": "20000.00", "paid": "4000.00", "currency": "USD"})),
        record(json!({"invoice_id": "B", "counterparty": "Globex", "issue_date": "2025-01-10", "due_date": "2025-02-09", "amount": "15000.00", "currency": "USD"})),
    ]
}

/// January 2025 sales totalling USD 30,000.00
pub fn sales() -> Vec<Record> {
    vec![
        record(json!({"date": "2025-01-08", "amount": "10000.00", "currency": "USD"})),
        record(json!({"date": "2025-01-22", "amount": "20000.00", "currency": "USD"})),
    ]
}

pub fn catalog() -> CapabilityCatalog {
    CapabilityCatalog::from_descriptors(
        ledger_descriptors()
            .into_iter()
            .chain(ComputationEngine::with_builtin_formulas().descriptors()),
    )
}

pub struct CountingConnector {
    pub calls: AtomicUsize,
    records: Vec<Record>,
}

impl CountingConnector {
    pub fn new(records: Vec<Record>) -> Self {
        Self {
            calls: AtomicUsize::new(0),
            records,
        }
    }
}

#[async_trait]
impl Connector for CountingConnector {
    async fn fetch(&self, _query: &ConnectorQuery) -> std::result::Result<Vec<Record>, ConnectorError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.records.clone())
    }
}

/// Answers with rows that match no ledger schema
pub struct MalformedConnector;

#[async_trait]
impl Connector for MalformedConnector {
    async fn fetch(&self, _query: &ConnectorQuery) -> std::result::Result<Vec<Record>, ConnectorError> {
        Ok(vec![record(json!({"amount": "lots", "note": "no date"}))])
    }
}

/// Times out on the first `failures` calls
pub struct FlakyConnector {
    pub calls: AtomicUsize,
    failures: usize,
    records: Vec<Record>,
}

impl FlakyConnector {
    pub fn new(failures: usize, records: Vec<Record>) -> Self {
        Self {
            calls: AtomicUsize::new(0),
            failures,
            records,
        }
    }
}

#[async_trait]
impl Connector for FlakyConnector {
    async fn fetch(&self, query: &ConnectorQuery) -> std::result::Result<Vec<Record>, ConnectorError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call < self.failures {
            return Err(ConnectorError::Timeout(format!("{} attempt {}", query.capability, call + 1)));
        }
        Ok(self.records.clone())
    }
}

/// Sleeps before answering with no rows, tracking how many calls overlap
pub struct SlowConnector {
    delay: Duration,
    active: AtomicUsize,
    peak: AtomicUsize,
}

impl SlowConnector {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            active: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        }
    }

    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for SlowConnector {
    async fn fetch(&self, _query: &ConnectorQuery) -> std::result::Result<Vec<Record>, ConnectorError> {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        self.active.fetch_sub(1, Ordering::SeqCst);
        Ok(Vec::new())
    }
}

/// Replays canned model answers in order and keeps every prompt it saw
pub struct ScriptedCompletion {
    responses: Mutex<VecDeque<Result<Value>>>,
    prompts: Mutex<Vec<String>>,
}

impl ScriptedCompletion {
    pub fn new(responses: Vec<Result<Value>>) -> Self {
        Self {
            responses: Mutex::new(responses.into()),
            prompts: Mutex::new(Vec::new()),
        }
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }
}

#[async_trait]
impl CompletionService for ScriptedCompletion {
    async fn complete(&self, prompt: &str, _response_schema: &Schema) -> Result<Value> {
        self.prompts.lock().unwrap().push(prompt.to_string());
        self.responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(OrchestrationError::LlmError("script exhausted".to_string())))
    }
}
