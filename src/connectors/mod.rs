//! Data connector trait and registry
//!
//! Connectors are read-only views over ledgers and sales systems. The
//! registry owns the boundary: parameters are validated before a connector
//! runs, records are validated before anyone else sees them, and each read is
//! captured once per request in the request's `SnapshotSet`.

use crate::config::AgentConfig;
use crate::error::{ConnectorError, OrchestrationError};
use crate::models::{
    CapabilityCategory, CapabilityDescriptor, OutputKind, Provenance, Record, TaskResult, TaskValue,
};
use crate::schema::{
    invoice_record_schema, transaction_record_schema, validate, validate_ref, Field, Schema,
};
use crate::snapshot::{DataSnapshot, SnapshotSet, SnapshotToken};
use crate::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

pub mod file;
pub mod http;
pub mod memory;
pub mod postgres;
pub mod sample;

pub use file::JsonFileConnector;
pub use http::HttpConnector;
pub use memory::{InMemoryConnector, PeriodFilter};
pub use postgres::PostgresConnector;

/// What a connector is asked for
#[derive(Debug, Clone)]
pub struct ConnectorQuery {
    pub capability: String,
    pub parameters: Value,
    /// Point in time the request reads at
    pub as_of: DateTime<Utc>,
}

impl ConnectorQuery {
    pub fn param_str(&self, key: &str) -> Option<&str> {
        self.parameters.get(key).and_then(Value::as_str)
    }
}

/// A data source. Must return the same records for the same query and `as_of`.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn fetch(&self, query: &ConnectorQuery) -> std::result::Result<Vec<Record>, ConnectorError>;
}

struct RegisteredConnector {
    descriptor: CapabilityDescriptor,
    executor: Arc<dyn Connector>,
}

pub struct ConnectorRegistry {
    connectors: HashMap<String, RegisteredConnector>,
    call_timeout: Duration,
}

impl ConnectorRegistry {
    pub fn new(call_timeout: Duration) -> Self {
        Self {
            connectors: HashMap::new(),
            call_timeout,
        }
    }

    pub fn register(&mut self, descriptor: CapabilityDescriptor, executor: Arc<dyn Connector>) {
        if self.connectors.contains_key(&descriptor.name) {
            warn!(capability = %descriptor.name, "Replacing registered connector");
        }
        self.connectors.insert(
            descriptor.name.clone(),
            RegisteredConnector {
                descriptor,
                executor,
            },
        );
    }

    pub fn descriptor(&self, name: &str) -> Option<&CapabilityDescriptor> {
        self.connectors.get(name).map(|c| &c.descriptor)
    }

    pub fn descriptors(&self) -> Vec<CapabilityDescriptor> {
        let mut all: Vec<_> = self.connectors.values().map(|c| c.descriptor.clone()).collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }

    pub fn list(&self) -> Vec<&str> {
        self.connectors.keys().map(|s| s.as_str()).collect()
    }

    /// Run one connector capability for `task_id`.
    ///
    /// Identical `(name, parameters)` pairs within one request are served from
    /// `snapshots` without touching the source again.
    pub async fn invoke(
        &self,
        task_id: &str,
        name: &str,
        parameters: &Value,
        token: &SnapshotToken,
        snapshots: &SnapshotSet,
    ) -> Result<TaskResult> {
        let entry = self
            .connectors
            .get(name)
            .ok_or_else(|| ConnectorError::NotFound(name.to_string()))?;

        validate_ref(
            parameters,
            &entry.descriptor.input_schema,
            &format!("connector:{}:parameters", name),
        )?;

        let query = ConnectorQuery {
            capability: name.to_string(),
            parameters: parameters.clone(),
            as_of: token.as_of,
        };

        let (snapshot, reused) = snapshots
            .get_or_fetch(name, parameters, || self.read(entry, query))
            .await?;

        if reused {
            debug!(task_id, capability = name, "Reusing snapshot taken earlier in this request");
        }

        let provenance = Provenance {
            task_id: task_id.to_string(),
            capability_name: name.to_string(),
            parameters: parameters.clone(),
            timestamp: Utc::now(),
            inputs: Vec::new(),
            snapshot_id: Some(snapshot.snapshot_id),
            attempts: 1,
            note: reused.then(|| format!("reused snapshot {}", snapshot.snapshot_id)),
        };

        Ok(TaskResult::succeeded(TaskValue::Records(snapshot), provenance))
    }

    async fn read(&self, entry: &RegisteredConnector, query: ConnectorQuery) -> Result<DataSnapshot> {
        let name = entry.descriptor.name.as_str();
        let started = std::time::Instant::now();

        let records = tokio::time::timeout(self.call_timeout, entry.executor.fetch(&query))
            .await
            .map_err(|_| {
                ConnectorError::Timeout(format!(
                    "{} did not answer within {}ms",
                    name,
                    self.call_timeout.as_millis()
                ))
            })??;

        let payload = Value::Array(records.into_iter().map(Value::Object).collect());
        let payload = validate(payload, &entry.descriptor.output_schema, &format!("connector:{}", name))?;

        let records: Vec<Record> = match payload {
            Value::Array(items) => items
                .into_iter()
                .filter_map(|item| match item {
                    Value::Object(map) => Some(map),
                    _ => None,
                })
                .collect(),
            _ => Vec::new(),
        };

        info!(
            capability = name,
            records = records.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Connector read complete"
        );

        Ok(DataSnapshot::new(name, query.parameters, records))
    }
}

/// Parameters a ledger capability accepts. Only document ledgers carry a
/// counterparty, so only they can be filtered by one.
pub fn ledger_parameters_schema(by_counterparty: bool) -> Schema {
    let mut fields = vec![
        Field::required("start", Schema::Date),
        Field::required("end", Schema::Date),
        Field::optional("currency", Schema::String),
    ];
    if by_counterparty {
        fields.push(Field::optional("counterparty", Schema::String));
    }
    Schema::object(fields)
}

/// The four ledger capabilities every deployment exposes
pub fn ledger_descriptors() -> Vec<CapabilityDescriptor> {
    let describe = |name: &str, description: &str, documents: bool, cost_hint: u32| CapabilityDescriptor {
        name: name.to_string(),
        category: CapabilityCategory::Connector,
        description: description.to_string(),
        input_schema: ledger_parameters_schema(documents),
        output_schema: Schema::array(if documents {
            invoice_record_schema()
        } else {
            transaction_record_schema()
        }),
        input_roles: Vec::new(),
        output_kind: if documents {
            OutputKind::Documents
        } else {
            OutputKind::Transactions
        },
        cost_hint,
    };

    vec![
        describe(
            "fetch_receivables",
            "Customer invoices issued up to the period end, with amounts paid so far",
            true,
            2,
        ),
        describe(
            "fetch_sales",
            "Credit sales booked within the period",
            false,
            1,
        ),
        describe(
            "fetch_payables",
            "Supplier invoices received up to the period end, with amounts paid so far",
            true,
            2,
        ),
        describe(
            "fetch_purchases",
            "Purchases booked within the period",
            false,
            1,
        ),
    ]
}

/// Ledger registry backed by whichever source the configuration names:
/// Postgres, then the financial HTTP API, then JSON files, then sample data.
pub fn create_default_registry(config: &AgentConfig) -> Result<ConnectorRegistry> {
    let mut registry = ConnectorRegistry::new(config.connector_timeout);

    if let Some(url) = &config.database_url {
        let pool = sqlx::postgres::PgPoolOptions::new()
            .max_connections(5)
            .connect_lazy(url)
            .map_err(|e| OrchestrationError::DatabaseError(format!("Invalid DATABASE_URL: {}", e)))?;
        info!("Connector backend: postgres");
        for descriptor in ledger_descriptors() {
            let connector = PostgresConnector::for_ledger(pool.clone(), &descriptor.name);
            registry.register(descriptor, Arc::new(connector));
        }
        return Ok(registry);
    }

    if let Some(base_url) = &config.financial_api_base_url {
        info!("Connector backend: financial API at {}", base_url);
        for descriptor in ledger_descriptors() {
            let connector = HttpConnector::new(base_url, format!("/ledger/{}", descriptor.name), config.connector_timeout)?;
            registry.register(descriptor, Arc::new(connector));
        }
        return Ok(registry);
    }

    if let Some(dir) = &config.ledger_data_dir {
        info!("Connector backend: JSON files in {}", dir.display());
        for descriptor in ledger_descriptors() {
            let filter = PeriodFilter::for_ledger(&descriptor.name);
            let path = dir.join(format!("{}.json", descriptor.name.trim_start_matches("fetch_")));
            registry.register(descriptor, Arc::new(JsonFileConnector::new(path, filter)));
        }
        return Ok(registry);
    }

    info!("Connector backend: built-in sample data");
    let today = Utc::now().date_naive();
    for descriptor in ledger_descriptors() {
        let records = sample::ledger(&descriptor.name, today);
        let filter = PeriodFilter::for_ledger(&descriptor.name);
        registry.register(descriptor, Arc::new(InMemoryConnector::new(records, filter)));
    }
    Ok(registry)
}
