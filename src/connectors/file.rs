//! Connector over a JSON export on disk

use super::http::records_from_body;
use super::memory::PeriodFilter;
use super::{Connector, ConnectorQuery};
use crate::error::ConnectorError;
use crate::models::Record;
use async_trait::async_trait;
use serde_json::Value;
use std::path::PathBuf;

/// Reads the file on every fetch; the per-request snapshot keeps reads consistent.
pub struct JsonFileConnector {
    path: PathBuf,
    filter: PeriodFilter,
}

impl JsonFileConnector {
    pub fn new(path: impl Into<PathBuf>, filter: PeriodFilter) -> Self {
        Self {
            path: path.into(),
            filter,
        }
    }
}

#[async_trait]
impl Connector for JsonFileConnector {
    async fn fetch(&self, query: &ConnectorQuery) -> Result<Vec<Record>, ConnectorError> {
        let raw = tokio::fs::read_to_string(&self.path).await.map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => ConnectorError::NotFound(self.path.display().to_string()),
            std::io::ErrorKind::PermissionDenied => {
                ConnectorError::AuthFailure(self.path.display().to_string())
            }
            _ => ConnectorError::Source(format!("{}: {}", self.path.display(), e)),
        })?;

        let body: Value = serde_json::from_str(&raw)
            .map_err(|e| ConnectorError::Source(format!("{}: {}", self.path.display(), e)))?;

        let records = records_from_body(body)?;
        Ok(self.filter.apply(&records, query))
    }
}
