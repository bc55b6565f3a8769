//! Static tabular records held in memory

use super::{Connector, ConnectorQuery};
use crate::error::ConnectorError;
use crate::models::Record;
use async_trait::async_trait;
use chrono::NaiveDate;
use serde_json::Value;

/// How a query's `start`/`end` narrows a table
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeriodFilter {
    None,
    /// Rows whose date column falls inside `[start, end]`
    Within(String),
    /// Rows whose date column is on or before `end`, i.e. balances as of period end
    UpTo(String),
}

impl PeriodFilter {
    /// Flow ledgers (sales, purchases) are filtered to the period; balance
    /// ledgers (receivables, payables) to everything open at its end.
    pub fn for_ledger(capability: &str) -> Self {
        match capability {
            "fetch_sales" | "fetch_purchases" => PeriodFilter::Within("date".to_string()),
            "fetch_receivables" | "fetch_payables" => PeriodFilter::UpTo("issue_date".to_string()),
            _ => PeriodFilter::None,
        }
    }

    pub fn apply(&self, records: &[Record], query: &ConnectorQuery) -> Vec<Record> {
        let bound = |key: &str| {
            query
                .param_str(key)
                .and_then(|s| NaiveDate::parse_from_str(s, "%Y-%m-%d").ok())
        };
        let row_date = |row: &Record, column: &str| {
            row.get(column)
                .and_then(Value::as_str)
                .and_then(|s| NaiveDate::parse_from_str(s, "%Y-%m-%d").ok())
        };

        let keep = |row: &&Record| match self {
            PeriodFilter::None => true,
            PeriodFilter::Within(column) => match row_date(*row, column) {
                Some(date) => {
                    bound("start").map_or(true, |s| date >= s) && bound("end").map_or(true, |e| date <= e)
                }
                // undated rows are left for the schema check to reject
                None => true,
            },
            PeriodFilter::UpTo(column) => match row_date(*row, column) {
                Some(date) => bound("end").map_or(true, |e| date <= e),
                None => true,
            },
        };

        let counterparty = query.param_str("counterparty").map(str::to_lowercase);
        let currency = query.param_str("currency").map(str::to_uppercase);
        let field_is = |row: &Record, column: &str, wanted: &Option<String>, fold: fn(&str) -> String| match wanted {
            Some(wanted) => row
                .get(column)
                .and_then(Value::as_str)
                .map_or(false, |v| fold(v) == *wanted),
            None => true,
        };

        records
            .iter()
            .filter(keep)
            .filter(|row| field_is(*row, "counterparty", &counterparty, str::to_lowercase))
            .filter(|row| field_is(*row, "currency", &currency, str::to_uppercase))
            .cloned()
            .collect()
    }
}

pub struct InMemoryConnector {
    records: Vec<Record>,
    filter: PeriodFilter,
}

impl InMemoryConnector {
    pub fn new(records: Vec<Record>, filter: PeriodFilter) -> Self {
        Self { records, filter }
    }
}

#[async_trait]
impl Connector for InMemoryConnector {
    async fn fetch(&self, query: &ConnectorQuery) -> Result<Vec<Record>, ConnectorError> {
        Ok(self.filter.apply(&self.records, query))
    }
}
