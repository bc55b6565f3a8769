//! Built-in demo ledgers, dated relative to `today` so the default period
//! always has data.

use crate::models::Record;
use chrono::{Duration, NaiveDate};
use serde_json::{json, Value};

const CUSTOMERS: &[&str] = &["Acme Retail", "Globex", "Initech", "Umbrella Foods", "Stark Supplies"];
const SUPPLIERS: &[&str] = &["Northwind", "Contoso Metals", "Fabrikam Logistics"];
const HISTORY_DAYS: i64 = 120;

fn as_record(value: Value) -> Option<Record> {
    match value {
        Value::Object(map) => Some(map),
        _ => None,
    }
}

fn date(d: NaiveDate) -> String {
    d.format("%Y-%m-%d").to_string()
}

fn invoices(today: NaiveDate, prefix: &str, parties: &[&str], every: i64, base: i64, terms: i64) -> Vec<Record> {
    (0..HISTORY_DAYS / every)
        .filter_map(|i| {
            let issued = today - Duration::days(HISTORY_DAYS - i * every);
            let amount = base + (i % 5) * 350;
            let age = (today - issued).num_days();
            // older documents are mostly settled
            let paid = if age > 75 {
                amount
            } else if age > 40 {
                amount / 2
            } else {
                0
            };
            as_record(json!({
                "invoice_id": format!("{}-{:04}", prefix, i + 1),
                "counterparty": parties[(i as usize) % parties.len()],
                "issue_date": date(issued),
                "due_date": date(issued + Duration::days(terms)),
                "amount": format!("{}.00", amount),
                "paid": format!("{}.00", paid),
                "currency": "USD",
            }))
        })
        .collect()
}

fn transactions(today: NaiveDate, every: i64, base: i64) -> Vec<Record> {
    (0..=HISTORY_DAYS / every)
        .filter_map(|i| {
            let day = today - Duration::days(HISTORY_DAYS - i * every);
            as_record(json!({
                "date": date(day),
                "amount": format!("{}.{:02}", base + (i % 7) * 120, (i * 37) % 100),
                "currency": "USD",
            }))
        })
        .collect()
}

pub fn ledger(capability: &str, today: NaiveDate) -> Vec<Record> {
    match capability {
        "fetch_receivables" => invoices(today, "AR", CUSTOMERS, 4, 2400, 30),
        "fetch_payables" => invoices(today, "AP", SUPPLIERS, 6, 1800, 45),
        "fetch_sales" => transactions(today, 1, 950),
        "fetch_purchases" => transactions(today, 2, 1100),
        _ => Vec::new(),
    }
}
