//! Relational ledger connector
//!
//! Runs a configured SQL statement with the period bound as `$1` (start) and
//! `$2` (end) and returns each row as a JSON record. `counterparty` and
//! `currency` parameters become predicates on the statement's output columns.

use super::{Connector, ConnectorQuery};
use crate::error::ConnectorError;
use crate::models::Record;
use async_trait::async_trait;
use chrono::NaiveDate;
use serde_json::Value;
use sqlx::PgPool;

pub struct PostgresConnector {
    pool: PgPool,
    sql: String,
}

impl PostgresConnector {
    pub fn new(pool: PgPool, sql: impl Into<String>) -> Self {
        Self {
            pool,
            sql: sql.into(),
        }
    }

    /// Default statement for one of the ledger capabilities
    pub fn for_ledger(pool: PgPool, capability: &str) -> Self {
        Self::new(pool, ledger_sql(capability))
    }

    /// Rows are folded to JSON in the database so column types need no mapping here.
    /// Filters bind from `$3` in the order counterparty, currency.
    fn wrapped_sql(&self, by_counterparty: bool, by_currency: bool) -> String {
        let mut sql = format!("SELECT row_to_json(q) FROM ({}) AS q", self.sql.trim_end_matches(';'));
        let mut predicates = Vec::new();
        let mut next = 3;
        if by_counterparty {
            predicates.push(format!("lower(q.counterparty) = lower(${})", next));
            next += 1;
        }
        if by_currency {
            predicates.push(format!("upper(q.currency) = upper(${})", next));
        }
        if !predicates.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&predicates.join(" AND "));
        }
        sql
    }
}

pub fn ledger_sql(capability: &str) -> &'static str {
    match capability {
        "fetch_receivables" => {
            "SELECT invoice_id, customer AS counterparty, issue_date, due_date, amount, paid, currency \
             FROM ar_invoices WHERE issue_date <= $2::date AND (COALESCE(paid, 0) < amount OR issue_date >= $1::date) \
             ORDER BY issue_date, invoice_id"
        }
        "fetch_payables" => {
            "SELECT invoice_id, supplier AS counterparty, issue_date, due_date, amount, paid, currency \
             FROM ap_invoices WHERE issue_date <= $2::date AND (COALESCE(paid, 0) < amount OR issue_date >= $1::date) \
             ORDER BY issue_date, invoice_id"
        }
        "fetch_sales" => {
            "SELECT sale_date AS date, amount, currency FROM sales \
             WHERE sale_date BETWEEN $1::date AND $2::date ORDER BY sale_date"
        }
        "fetch_purchases" => {
            "SELECT purchase_date AS date, amount, currency FROM purchases \
             WHERE purchase_date BETWEEN $1::date AND $2::date ORDER BY purchase_date"
        }
        _ => "SELECT NULL WHERE $1::date IS NULL AND $2::date IS NULL",
    }
}

fn bound(query: &ConnectorQuery, key: &str) -> Result<NaiveDate, ConnectorError> {
    let raw = query
        .param_str(key)
        .ok_or_else(|| ConnectorError::Source(format!("missing '{}' parameter", key)))?;
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .map_err(|e| ConnectorError::Source(format!("bad '{}' date '{}': {}", key, raw, e)))
}

fn map_sqlx_error(e: sqlx::Error) -> ConnectorError {
    match e {
        sqlx::Error::PoolTimedOut => ConnectorError::Timeout("database pool timed out".to_string()),
        sqlx::Error::Io(io) if io.kind() == std::io::ErrorKind::TimedOut => {
            ConnectorError::Timeout(format!("database I/O timed out: {}", io))
        }
        sqlx::Error::Database(db) if db.code().as_deref() == Some("28P01") => {
            ConnectorError::AuthFailure(db.message().to_string())
        }
        sqlx::Error::Database(db) if db.code().as_deref() == Some("42P01") => {
            ConnectorError::NotFound(db.message().to_string())
        }
        other => ConnectorError::Source(other.to_string()),
    }
}

#[async_trait]
impl Connector for PostgresConnector {
    async fn fetch(&self, query: &ConnectorQuery) -> Result<Vec<Record>, ConnectorError> {
        let start = bound(query, "start")?;
        let end = bound(query, "end")?;
        let counterparty = query.param_str("counterparty");
        let currency = query.param_str("currency");

        let sql = self.wrapped_sql(counterparty.is_some(), currency.is_some());
        let mut statement = sqlx::query_scalar(&sql).bind(start).bind(end);
        if let Some(counterparty) = counterparty {
            statement = statement.bind(counterparty);
        }
        if let Some(currency) = currency {
            statement = statement.bind(currency);
        }

        let rows: Vec<Value> = statement
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx_error)?;

        Ok(rows
            .into_iter()
            .filter_map(|row| match row {
                Value::Object(map) => Some(map),
                _ => None,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ledger_sql_binds_both_period_bounds() {
        for cap in ["fetch_receivables", "fetch_payables", "fetch_sales", "fetch_purchases"] {
            let sql = ledger_sql(cap);
            assert!(sql.contains("$1"), "{} lacks $1", cap);
            assert!(sql.contains("$2"), "{} lacks $2", cap);
        }
    }

    fn connector(sql: &str) -> PostgresConnector {
        let pool = sqlx::postgres::PgPoolOptions::new()
            .connect_lazy("postgres://localhost/ledger")
            .unwrap();
        PostgresConnector::new(pool, sql)
    }

    #[tokio::test]
    async fn test_wrapped_sql_strips_trailing_semicolon() {
        assert_eq!(
            connector("SELECT 1 AS one;").wrapped_sql(false, false),
            "SELECT row_to_json(q) FROM (SELECT 1 AS one) AS q"
        );
    }

    #[tokio::test]
    async fn test_filters_become_numbered_predicates() {
        let c = connector(ledger_sql("fetch_receivables"));
        let both = c.wrapped_sql(true, true);
        assert!(both.ends_with("WHERE lower(q.counterparty) = lower($3) AND upper(q.currency) = upper($4)"));

        let currency_only = c.wrapped_sql(false, true);
        assert!(currency_only.ends_with("WHERE upper(q.currency) = upper($3)"));
        assert!(!currency_only.contains("counterparty) ="));
    }
}
