//! Built-in contracts for the payloads that cross component boundaries

use super::{Field, Schema};

const TASK_STATUSES: &[&str] = &["pending", "ready", "running", "succeeded", "failed", "skipped"];
const UNITS: &[&str] = &["currency", "days", "ratio", "count"];
const LINE_STATUSES: &[&str] = &["overdue", "current", "open", "due", "no_due_date"];

/// Planner output. Nodes are closed objects so a hallucinated key is caught
/// instead of silently dropped.
pub fn task_graph_schema() -> Schema {
    let node = Schema::object(vec![
        Field::required("id", Schema::String),
        Field::required("capability", Schema::String),
        Field::optional("parameters", Schema::any_object()),
        Field::optional("depends_on", Schema::array(Schema::String)),
        Field::optional("optional", Schema::Bool),
        Field::optional("description", Schema::String),
    ]);

    Schema::open_object(vec![
        Field::required("nodes", Schema::array(node)),
        Field::optional("rationale", Schema::nullable(Schema::String)),
    ])
}

/// One receivable or payable document
pub fn invoice_record_schema() -> Schema {
    Schema::open_object(vec![
        Field::required("invoice_id", Schema::String),
        Field::required("counterparty", Schema::String),
        Field::required("issue_date", Schema::Date),
        Field::optional("due_date", Schema::nullable(Schema::Date)),
        Field::required("amount", Schema::Decimal),
        Field::optional("paid", Schema::nullable(Schema::Decimal)),
        Field::optional("currency", Schema::nullable(Schema::String)),
    ])
}

/// One sale or purchase line
pub fn transaction_record_schema() -> Schema {
    Schema::open_object(vec![
        Field::required("date", Schema::Date),
        Field::required("amount", Schema::Decimal),
        Field::optional("currency", Schema::nullable(Schema::String)),
    ])
}

fn figure_fields() -> Vec<Field> {
    let value = Schema::tagged(
        "kind",
        vec![
            (
                "exact",
                Schema::object(vec![
                    Field::required("kind", Schema::String),
                    Field::required("amount", Schema::Decimal),
                ]),
            ),
            (
                "undefined",
                Schema::object(vec![
                    Field::required("kind", Schema::String),
                    Field::required("reason", Schema::String),
                ]),
            ),
        ],
    );

    let line = Schema::object(vec![
        Field::required("label", Schema::String),
        Field::required("amount", Schema::Decimal),
        Field::optional("counterparty", Schema::String),
        Field::optional("days", Schema::Integer),
        Field::optional("documents", Schema::Integer),
        Field::optional("status", Schema::enumeration(LINE_STATUSES)),
    ]);

    vec![
        Field::required("label", Schema::String),
        Field::required("value", value),
        Field::required("currency", Schema::nullable(Schema::String)),
        Field::required("unit", Schema::enumeration(UNITS)),
        Field::required("source_task_id", Schema::String),
        Field::optional("breakdown", Schema::array(line)),
    ]
}

pub fn figure_schema() -> Schema {
    Schema::object(figure_fields())
}

/// Orchestrator output as handed to the narrator
pub fn result_set_schema() -> Schema {
    let mut figure_variant = figure_fields();
    figure_variant.push(Field::required("kind", Schema::String));

    let records_variant = Schema::open_object(vec![
        Field::required("kind", Schema::String),
        Field::required("snapshot_id", Schema::String),
        Field::required("source", Schema::String),
        Field::required("records", Schema::array(Schema::any_object())),
        Field::required("digest", Schema::String),
    ]);

    let value = Schema::tagged(
        "kind",
        vec![
            ("records", records_variant),
            ("figure", Schema::object(figure_variant)),
        ],
    );

    let provenance = Schema::open_object(vec![
        Field::required("task_id", Schema::String),
        Field::required("capability_name", Schema::String),
        Field::required("timestamp", Schema::String),
        Field::optional("inputs", Schema::array(Schema::String)),
    ]);

    let task_result = Schema::object(vec![
        Field::required("task_id", Schema::String),
        Field::required("status", Schema::enumeration(TASK_STATUSES)),
        Field::required("value", Schema::nullable(value)),
        Field::required("provenance", provenance),
        Field::optional("error", Schema::nullable(Schema::String)),
        Field::optional("error_kind", Schema::nullable(Schema::String)),
    ]);

    Schema::object(vec![
        Field::required("request_id", Schema::String),
        Field::required("status", Schema::enumeration(&["completed", "partial", "failed"])),
        Field::required("results", Schema::map(task_result)),
        Field::required("snapshot_digest", Schema::String),
        Field::optional("timed_out", Schema::Bool),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::validate_ref;
    use serde_json::json;

    #[test]
    fn test_task_graph_contract() {
        let plan = json!({
            "nodes": [
                {"id": "t1", "capability": "fetch_receivables", "parameters": {"start": "2025-01-01"}},
                {"id": "t2", "capability": "dso", "depends_on": ["t1"], "optional": false}
            ],
            "rationale": "compute DSO"
        });
        assert!(validate_ref(&plan, &task_graph_schema(), "planner").is_ok());

        let bad = json!({"nodes": [{"id": "t1", "capability": "x", "params": {}}]});
        let err = validate_ref(&bad, &task_graph_schema(), "planner").unwrap_err();
        assert!(err.message.contains("params"));
    }

    #[test]
    fn test_invoice_contract_accepts_extra_source_columns() {
        let row = json!({
            "invoice_id": "F-001",
            "counterparty": "ACME",
            "issue_date": "2025-03-01",
            "due_date": null,
            "amount": "1500.00",
            "branch": "north"
        });
        assert!(validate_ref(&row, &invoice_record_schema(), "connector").is_ok());

        let row = json!({"invoice_id": "F-002", "counterparty": "ACME", "issue_date": "03/01/2025", "amount": 1});
        assert!(validate_ref(&row, &invoice_record_schema(), "connector").is_err());
    }

    #[test]
    fn test_figure_contract() {
        let fig = json!({
            "label": "DSO",
            "value": {"kind": "exact", "amount": "31.00"},
            "currency": null,
            "unit": "days",
            "source_task_id": "t3"
        });
        assert!(validate_ref(&fig, &figure_schema(), "narrator").is_ok());

        let aging = json!({
            "label": "Overdue by age",
            "value": {"kind": "exact", "amount": "16000.00"},
            "currency": "USD",
            "unit": "currency",
            "source_task_id": "t2",
            "breakdown": [
                {"label": "1-30 days", "amount": "16000.00", "documents": 1, "status": "overdue"},
                {"label": "A", "amount": "1.00", "status": "late"}
            ]
        });
        let err = validate_ref(&aging, &figure_schema(), "narrator").unwrap_err();
        assert!(err.message.contains("late"));
    }
}
