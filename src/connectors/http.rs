//! Connector backed by the financial HTTP API

use super::memory::PeriodFilter;
use super::{Connector, ConnectorQuery};
use crate::error::ConnectorError;
use crate::models::Record;
use crate::Result;
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde_json::{json, Value};
use std::time::Duration;
use tracing::warn;

/// POSTs the query to `{base_url}{path}` and expects either a JSON array of
/// records or an object with a `records` array.
pub struct HttpConnector {
    client: Client,
    base_url: String,
    path: String,
}

impl HttpConnector {
    pub fn new(base_url: &str, path: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .pool_idle_timeout(Duration::from_secs(60))
            .pool_max_idle_per_host(8)
            .timeout(timeout)
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            path: path.into(),
        })
    }

    async fn post_json(&self, body: &Value) -> std::result::Result<Value, ConnectorError> {
        let url = format!("{}{}", self.base_url, self.path);

        let response = self
            .client
            .post(&url)
            .header("Content-Type", "application/json")
            .json(body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ConnectorError::Timeout(format!("{}: {}", self.path, e))
                } else {
                    ConnectorError::Source(format!("request to {} failed: {}", self.path, e))
                }
            })?;

        let status = response.status();
        match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                return Err(ConnectorError::AuthFailure(format!("{} returned {}", self.path, status)))
            }
            StatusCode::NOT_FOUND => return Err(ConnectorError::NotFound(self.path.clone())),
            StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => {
                return Err(ConnectorError::Timeout(format!("{} returned {}", self.path, status)))
            }
            _ => {}
        }

        let body = response.json::<Value>().await.map_err(|e| {
            if e.is_timeout() {
                ConnectorError::Timeout(format!("{}: {}", self.path, e))
            } else {
                ConnectorError::Source(format!("invalid JSON from {}: {}", self.path, e))
            }
        })?;

        if !status.is_success() {
            warn!(path = %self.path, %status, "Financial API error response");
            return Err(ConnectorError::Source(format!(
                "{} returned {}: {}",
                self.path, status, body
            )));
        }

        Ok(body)
    }
}

/// Pull the record rows out of an API response body
pub(crate) fn records_from_body(body: Value) -> std::result::Result<Vec<Record>, ConnectorError> {
    let rows = match body {
        Value::Array(rows) => rows,
        Value::Object(mut map) => match map.remove("records") {
            Some(Value::Array(rows)) => rows,
            _ => {
                return Err(ConnectorError::Source(
                    "response object has no 'records' array".to_string(),
                ))
            }
        },
        other => {
            return Err(ConnectorError::Source(format!(
                "expected records, found {}",
                other
            )))
        }
    };

    rows.into_iter()
        .enumerate()
        .map(|(i, row)| match row {
            Value::Object(map) => Ok(map),
            _ => Err(ConnectorError::Source(format!("record {} is not an object", i))),
        })
        .collect()
}

#[async_trait]
impl Connector for HttpConnector {
    async fn fetch(&self, query: &ConnectorQuery) -> std::result::Result<Vec<Record>, ConnectorError> {
        let body = json!({
            "capability": query.capability,
            "parameters": query.parameters,
            "as_of": query.as_of.to_rfc3339(),
        });
        let records = records_from_body(self.post_json(&body).await?)?;
        // the API is asked to filter; rows it did not filter are dropped here
        Ok(PeriodFilter::None.apply(&records, query))
    }
}
