//! Built-in working-capital formulas

use super::{checked_sum, open_amount, single_currency, Evaluation, Formula, FormulaInputs, InputKind, InputRole, Measure};
use crate::error::OrchestrationError;
use crate::models::{BreakdownLine, Unit};
use crate::schema::{Field, Schema};
use crate::Result;
use chrono::NaiveDate;
use rust_decimal::{Decimal, RoundingStrategy};
use serde_json::Value;
use std::cmp::Reverse;
use std::collections::BTreeMap;
use std::sync::Arc;

pub fn builtin() -> Vec<Arc<dyn Formula>> {
    vec![
        Arc::new(OutstandingBalance),
        Arc::new(PeriodTotal),
        Arc::new(OverdueBalance),
        Arc::new(DaysOutstanding::sales()),
        Arc::new(DaysOutstanding::payables()),
        Arc::new(CashConversionCycle),
        Arc::new(ReceivablesPayablesRatio),
        Arc::new(AgingBuckets),
        Arc::new(TopCounterparties),
        Arc::new(DueWindowBalance),
        Arc::new(OpenDocuments),
    ]
}

const DOCUMENTS: &[InputRole] = &[InputRole::required("ledger", InputKind::Documents)];

fn round_days(value: Decimal) -> Decimal {
    value.round_dp_with_strategy(2, RoundingStrategy::MidpointNearestEven)
}

fn overflow(formula: &str) -> OrchestrationError {
    OrchestrationError::ComputationError(format!("{}: arithmetic overflow", formula))
}

/// Both sides must be in the same currency when both declare one
fn same_currency(formula: &str, a: &Measure, b: &Measure) -> Result<Option<String>> {
    match (&a.currency, &b.currency) {
        (Some(x), Some(y)) if x != y => Err(OrchestrationError::ComputationError(format!(
            "{}: inputs are in {} and {}; no conversion is applied",
            formula, x, y
        ))),
        (Some(x), _) | (None, Some(x)) => Ok(Some(x.clone())),
        (None, None) => Ok(None),
    }
}

fn exact_or_undefined(measure: Measure) -> Evaluation {
    match measure.amount {
        Some(amount) => Evaluation::exact(amount, measure.currency),
        None => Evaluation::undefined(
            measure
                .undefined_reason
                .unwrap_or_else(|| "input is undefined".to_string()),
        ),
    }
}

pub struct OutstandingBalance;

impl Formula for OutstandingBalance {
    fn id(&self) -> &'static str {
        "outstanding_balance"
    }

    fn label(&self) -> &'static str {
        "Outstanding balance"
    }

    fn description(&self) -> &'static str {
        "Sum of unpaid amounts, max(amount - paid, 0), over receivable or payable documents."
    }

    fn inputs(&self) -> &'static [InputRole] {
        const ROLES: &[InputRole] = &[InputRole::required("ledger", InputKind::Balance)];
        ROLES
    }

    fn unit(&self) -> Unit {
        Unit::Currency
    }

    fn evaluate(&self, inputs: &FormulaInputs<'_>) -> Result<Evaluation> {
        Ok(exact_or_undefined(inputs.balance("ledger")?))
    }
}

pub struct PeriodTotal;

impl Formula for PeriodTotal {
    fn id(&self) -> &'static str {
        "period_total"
    }

    fn label(&self) -> &'static str {
        "Period total"
    }

    fn description(&self) -> &'static str {
        "Sum of transaction amounts in the period (sales or purchases)."
    }

    fn inputs(&self) -> &'static [InputRole] {
        const ROLES: &[InputRole] = &[InputRole::required("ledger", InputKind::Flow)];
        ROLES
    }

    fn unit(&self) -> Unit {
        Unit::Currency
    }

    fn evaluate(&self, inputs: &FormulaInputs<'_>) -> Result<Evaluation> {
        Ok(exact_or_undefined(inputs.flow("ledger")?))
    }
}

/// Open balance of documents at least `min_days` past due at `as_of`
pub struct OverdueBalance;

impl Formula for OverdueBalance {
    fn id(&self) -> &'static str {
        "overdue_balance"
    }

    fn label(&self) -> &'static str {
        "Overdue balance"
    }

    fn description(&self) -> &'static str {
        "Unpaid amount of documents at least min_days (default 1) past due at as_of (default period end)."
    }

    fn inputs(&self) -> &'static [InputRole] {
        DOCUMENTS
    }

    fn unit(&self) -> Unit {
        Unit::Currency
    }

    fn extra_parameters(&self) -> Vec<Field> {
        vec![
            Field::optional("min_days", Schema::Integer),
            Field::optional("as_of", Schema::Date),
        ]
    }

    fn evaluate(&self, inputs: &FormulaInputs<'_>) -> Result<Evaluation> {
        let min_days = i64::from(inputs.param_u32("min_days")?.unwrap_or(1));
        let as_of = inputs.as_of("ledger")?;
        let (documents, currency) = open_documents(inputs)?;

        let overdue = documents
            .iter()
            .filter(|d| d.days_overdue(as_of).map_or(false, |days| days >= min_days));
        let sum = sum_open(inputs, overdue)?;

        Ok(Evaluation::exact(sum, currency))
    }
}

//
// ================= Document-level formulas =================
//

/// A document with something still owed on it
struct OpenDocument<'a> {
    id: &'a str,
    counterparty: &'a str,
    open: Decimal,
    due: Option<NaiveDate>,
}

impl OpenDocument<'_> {
    /// Positive once past due; `None` without a due date
    fn days_overdue(&self, as_of: NaiveDate) -> Option<i64> {
        self.due.map(|due| (as_of - due).num_days())
    }

    fn line(&self) -> BreakdownLine {
        BreakdownLine {
            counterparty: Some(self.counterparty.to_string()),
            ..BreakdownLine::new(self.id, self.open)
        }
    }
}

/// Open documents behind the `ledger` input, with the ledger currency.
/// Partial payments are already netted out; settled documents are dropped.
fn open_documents<'a>(inputs: &FormulaInputs<'a>) -> Result<(Vec<OpenDocument<'a>>, Option<String>)> {
    let snapshot = inputs.records("ledger")?;
    let currency = single_currency(snapshot).map_err(|e| inputs.error(e))?;

    let mut documents = Vec::new();
    for row in snapshot.records.iter() {
        let open = open_amount(row).map_err(|e| inputs.error(e))?;
        if open <= Decimal::ZERO {
            continue;
        }
        let text = |key: &str| row.get(key).and_then(Value::as_str).unwrap_or_default();
        documents.push(OpenDocument {
            id: text("invoice_id"),
            counterparty: text("counterparty"),
            open,
            due: row
                .get("due_date")
                .and_then(Value::as_str)
                .and_then(|s| NaiveDate::parse_from_str(s, "%Y-%m-%d").ok()),
        });
    }
    Ok((documents, currency))
}

fn sum_open<'d, 'a: 'd>(
    inputs: &FormulaInputs<'_>,
    mut documents: impl Iterator<Item = &'d OpenDocument<'a>>,
) -> Result<Decimal> {
    documents.try_fold(Decimal::ZERO, |sum, d| {
        checked_sum(sum, d.open).map_err(|e| inputs.error(e))
    })
}

/// Past-due buckets used by the aging breakdown: label, first and last day
const AGING_BUCKETS: &[(&str, i64, Option<i64>)] = &[
    ("1-30 days", 1, Some(30)),
    ("31-60 days", 31, Some(60)),
    ("61-90 days", 61, Some(90)),
    ("90+ days", 91, None),
];

/// Overdue balance split by days past due, plus what is not yet due and
/// what carries no due date
pub struct AgingBuckets;

impl Formula for AgingBuckets {
    fn id(&self) -> &'static str {
        "aging_buckets"
    }

    fn label(&self) -> &'static str {
        "Overdue by age"
    }

    fn description(&self) -> &'static str {
        "Aging of open documents at as_of (default period end): overdue 1-30, 31-60, 61-90 and 90+ days, not yet due, no due date. The figure is the overdue total."
    }

    fn inputs(&self) -> &'static [InputRole] {
        DOCUMENTS
    }

    fn unit(&self) -> Unit {
        Unit::Currency
    }

    fn extra_parameters(&self) -> Vec<Field> {
        vec![Field::optional("as_of", Schema::Date)]
    }

    fn evaluate(&self, inputs: &FormulaInputs<'_>) -> Result<Evaluation> {
        let as_of = inputs.as_of("ledger")?;
        let (documents, currency) = open_documents(inputs)?;

        let bucket_line = |label: &str, status: &str| BreakdownLine {
            documents: Some(0),
            status: Some(status.to_string()),
            ..BreakdownLine::new(label, Decimal::ZERO)
        };
        let mut lines: Vec<BreakdownLine> = AGING_BUCKETS
            .iter()
            .map(|(label, _, _)| bucket_line(label, "overdue"))
            .collect();
        lines.push(bucket_line("not yet due", "current"));
        lines.push(bucket_line("no due date", "no_due_date"));
        let current = AGING_BUCKETS.len();

        for document in &documents {
            let slot = match document.days_overdue(as_of) {
                None => current + 1,
                Some(days) if days < 1 => current,
                Some(days) => AGING_BUCKETS
                    .iter()
                    .position(|(_, first, last)| days >= *first && last.map_or(true, |l| days <= l))
                    .unwrap_or(AGING_BUCKETS.len() - 1),
            };
            let line = &mut lines[slot];
            line.amount = checked_sum(line.amount, document.open).map_err(|e| inputs.error(e))?;
            line.documents = line.documents.map(|n| n + 1);
        }

        let overdue = lines[..current]
            .iter()
            .try_fold(Decimal::ZERO, |sum, l| checked_sum(sum, l.amount))
            .map_err(|e| inputs.error(e))?;

        Ok(Evaluation::exact(overdue, currency).with_breakdown(lines))
    }
}

/// Counterparties ranked by what they owe (or are owed), largest first
pub struct TopCounterparties;

impl Formula for TopCounterparties {
    fn id(&self) -> &'static str {
        "top_counterparties"
    }

    fn label(&self) -> &'static str {
        "Top counterparties"
    }

    fn description(&self) -> &'static str {
        "Customers or suppliers ranked by open balance; overdue_only (default true) counts only past-due documents. Keeps the first limit (default 5). The figure is the total of the listed counterparties."
    }

    fn inputs(&self) -> &'static [InputRole] {
        DOCUMENTS
    }

    fn unit(&self) -> Unit {
        Unit::Currency
    }

    fn extra_parameters(&self) -> Vec<Field> {
        vec![
            Field::optional("limit", Schema::Integer),
            Field::optional("overdue_only", Schema::Bool),
            Field::optional("as_of", Schema::Date),
        ]
    }

    fn evaluate(&self, inputs: &FormulaInputs<'_>) -> Result<Evaluation> {
        let limit = inputs.param_u32("limit")?.unwrap_or(5).max(1) as usize;
        let overdue_only = inputs.param_bool("overdue_only")?.unwrap_or(true);
        let as_of = inputs.as_of("ledger")?;
        let (documents, currency) = open_documents(inputs)?;

        let mut by_counterparty: BTreeMap<&str, BreakdownLine> = BTreeMap::new();
        for document in &documents {
            let days = document.days_overdue(as_of).filter(|d| *d > 0);
            if overdue_only && days.is_none() {
                continue;
            }
            let line = by_counterparty
                .entry(document.counterparty)
                .or_insert_with(|| BreakdownLine {
                    documents: Some(0),
                    ..BreakdownLine::new(document.counterparty, Decimal::ZERO)
                });
            line.amount = checked_sum(line.amount, document.open).map_err(|e| inputs.error(e))?;
            line.documents = line.documents.map(|n| n + 1);
            if let Some(days) = days {
                line.days = Some(line.days.map_or(days, |d| d.max(days)));
                line.status = Some("overdue".to_string());
            }
        }

        let mut lines: Vec<BreakdownLine> = by_counterparty.into_values().collect();
        // BTreeMap order breaks ties by name
        lines.sort_by_key(|l| Reverse(l.amount));
        lines.truncate(limit);

        let listed = lines
            .iter()
            .try_fold(Decimal::ZERO, |sum, l| checked_sum(sum, l.amount))
            .map_err(|e| inputs.error(e))?;
        Ok(Evaluation::exact(listed, currency).with_breakdown(lines))
    }
}

/// Open documents falling due between `as_of` and `within_days` later
pub struct DueWindowBalance;

impl Formula for DueWindowBalance {
    fn id(&self) -> &'static str {
        "due_window_balance"
    }

    fn label(&self) -> &'static str {
        "Due soon"
    }

    fn description(&self) -> &'static str {
        "Unpaid amount of documents due from as_of (default period end) through within_days later (default 7; 0 means due that day), listed by due date."
    }

    fn inputs(&self) -> &'static [InputRole] {
        DOCUMENTS
    }

    fn unit(&self) -> Unit {
        Unit::Currency
    }

    fn extra_parameters(&self) -> Vec<Field> {
        vec![
            Field::optional("within_days", Schema::Integer),
            Field::optional("as_of", Schema::Date),
        ]
    }

    fn evaluate(&self, inputs: &FormulaInputs<'_>) -> Result<Evaluation> {
        let within = i64::from(inputs.param_u32("within_days")?.unwrap_or(7));
        let as_of = inputs.as_of("ledger")?;
        let (documents, currency) = open_documents(inputs)?;

        let mut due: Vec<(i64, &OpenDocument<'_>)> = documents
            .iter()
            .filter_map(|d| {
                let days_left = -d.days_overdue(as_of)?;
                (0..=within).contains(&days_left).then_some((days_left, d))
            })
            .collect();
        due.sort_by(|(a_days, a), (b_days, b)| {
            a_days
                .cmp(b_days)
                .then(b.open.cmp(&a.open))
                .then(a.id.cmp(b.id))
        });

        let sum = sum_open(inputs, due.iter().map(|(_, d)| *d))?;
        let lines = due
            .into_iter()
            .map(|(days_left, d)| BreakdownLine {
                days: Some(days_left),
                status: Some("due".to_string()),
                ..d.line()
            })
            .collect();
        Ok(Evaluation::exact(sum, currency).with_breakdown(lines))
    }
}

/// Every open document, overdue first
pub struct OpenDocuments;

impl Formula for OpenDocuments {
    fn id(&self) -> &'static str {
        "open_documents"
    }

    fn label(&self) -> &'static str {
        "Open documents"
    }

    fn description(&self) -> &'static str {
        "Lists unpaid documents at as_of (default period end): overdue first by days past due, then on time, then without due date. overdue_only limits the list to past-due documents; limit caps the lines shown. The figure is the open total."
    }

    fn inputs(&self) -> &'static [InputRole] {
        DOCUMENTS
    }

    fn unit(&self) -> Unit {
        Unit::Currency
    }

    fn extra_parameters(&self) -> Vec<Field> {
        vec![
            Field::optional("overdue_only", Schema::Bool),
            Field::optional("limit", Schema::Integer),
            Field::optional("as_of", Schema::Date),
        ]
    }

    fn evaluate(&self, inputs: &FormulaInputs<'_>) -> Result<Evaluation> {
        let overdue_only = inputs.param_bool("overdue_only")?.unwrap_or(false);
        let limit = inputs.param_u32("limit")?.map(|n| n as usize);
        let as_of = inputs.as_of("ledger")?;
        let (documents, currency) = open_documents(inputs)?;

        let mut lines: Vec<(u8, BreakdownLine)> = documents
            .iter()
            .filter_map(|d| {
                let (rank, status, days) = match d.days_overdue(as_of) {
                    Some(days) if days > 0 => (0, "overdue", Some(days)),
                    Some(_) => (1, "open", None),
                    None => (2, "no_due_date", None),
                };
                if overdue_only && rank > 0 {
                    return None;
                }
                let line = BreakdownLine {
                    days,
                    status: Some(status.to_string()),
                    ..d.line()
                };
                Some((rank, line))
            })
            .collect();
        lines.sort_by(|(a_rank, a), (b_rank, b)| {
            a_rank
                .cmp(b_rank)
                .then(b.days.cmp(&a.days))
                .then(b.amount.cmp(&a.amount))
                .then(a.label.cmp(&b.label))
        });

        let total = lines
            .iter()
            .try_fold(Decimal::ZERO, |sum, (_, l)| checked_sum(sum, l.amount))
            .map_err(|e| inputs.error(e))?;
        let mut lines: Vec<BreakdownLine> = lines.into_iter().map(|(_, l)| l).collect();
        if let Some(limit) = limit {
            lines.truncate(limit);
        }
        Ok(Evaluation::exact(total, currency).with_breakdown(lines))
    }
}

/// Balance ÷ flow × days. DSO over receivables and sales, DPO over payables
/// and purchases.
pub struct DaysOutstanding {
    id: &'static str,
    label: &'static str,
    description: &'static str,
    roles: &'static [InputRole],
}

impl DaysOutstanding {
    pub fn sales() -> Self {
        const ROLES: &[InputRole] = &[
            InputRole::required("receivables", InputKind::Balance),
            InputRole::required("sales", InputKind::Flow),
        ];
        Self {
            id: "dso",
            label: "DSO",
            description: "Days sales outstanding: receivables outstanding / sales x days.",
            roles: ROLES,
        }
    }

    pub fn payables() -> Self {
        const ROLES: &[InputRole] = &[
            InputRole::required("payables", InputKind::Balance),
            InputRole::required("purchases", InputKind::Flow),
        ];
        Self {
            id: "dpo",
            label: "DPO",
            description: "Days payables outstanding: payables outstanding / purchases x days.",
            roles: ROLES,
        }
    }
}

impl Formula for DaysOutstanding {
    fn id(&self) -> &'static str {
        self.id
    }

    fn label(&self) -> &'static str {
        self.label
    }

    fn description(&self) -> &'static str {
        self.description
    }

    fn inputs(&self) -> &'static [InputRole] {
        self.roles
    }

    fn unit(&self) -> Unit {
        Unit::Days
    }

    fn extra_parameters(&self) -> Vec<Field> {
        vec![Field::optional("days", Schema::Integer)]
    }

    fn evaluate(&self, inputs: &FormulaInputs<'_>) -> Result<Evaluation> {
        let balance_role = self.roles[0].name;
        let flow_role = self.roles[1].name;

        let balance = inputs.balance(balance_role)?;
        let flow = inputs.flow(flow_role)?;
        same_currency(self.id, &balance, &flow)?;

        let (Some(numerator), Some(denominator)) = (balance.amount, flow.amount) else {
            return Ok(Evaluation::undefined(
                balance
                    .undefined_reason
                    .or(flow.undefined_reason)
                    .unwrap_or_else(|| "input is undefined".to_string()),
            ));
        };

        if denominator.is_zero() {
            return Ok(Evaluation::undefined(format!(
                "{} for the period are zero",
                flow_role
            )));
        }

        let days = Decimal::from(inputs.period_days(flow_role)?);
        let value = numerator
            .checked_mul(days)
            .and_then(|v| v.checked_div(denominator))
            .ok_or_else(|| overflow(self.id))?;

        Ok(Evaluation::exact(round_days(value), None))
    }
}

/// DSO + DIO − DPO, from upstream day figures
pub struct CashConversionCycle;

impl Formula for CashConversionCycle {
    fn id(&self) -> &'static str {
        "ccc"
    }

    fn label(&self) -> &'static str {
        "CCC"
    }

    fn description(&self) -> &'static str {
        "Cash conversion cycle: DSO + DIO - DPO, from upstream dso/dpo (and optional dio) figures."
    }

    fn inputs(&self) -> &'static [InputRole] {
        const ROLES: &[InputRole] = &[
            InputRole::required("dso", InputKind::Figure),
            InputRole::required("dpo", InputKind::Figure),
            InputRole::optional("dio", InputKind::Figure),
        ];
        ROLES
    }

    fn unit(&self) -> Unit {
        Unit::Days
    }

    fn evaluate(&self, inputs: &FormulaInputs<'_>) -> Result<Evaluation> {
        let dso = inputs.figure("dso")?;
        let dpo = inputs.figure("dpo")?;
        let dio = if inputs.is_bound("dio") {
            Some(inputs.figure("dio")?)
        } else {
            None
        };

        let mut parts = vec![&dso, &dpo];
        parts.extend(dio.as_ref());
        if let Some(reason) = parts.iter().find_map(|m| m.undefined_reason.clone()) {
            return Ok(Evaluation::undefined(reason));
        }

        let amount = |m: &Measure| m.amount.unwrap_or(Decimal::ZERO);
        let dio_days = dio.as_ref().map(amount).unwrap_or(Decimal::ZERO);
        let value = amount(&dso)
            .checked_add(dio_days)
            .and_then(|v| v.checked_sub(amount(&dpo)))
            .ok_or_else(|| overflow(self.id()))?;

        Ok(Evaluation::exact(round_days(value), None))
    }
}

/// Receivables outstanding over payables outstanding
pub struct ReceivablesPayablesRatio;

impl Formula for ReceivablesPayablesRatio {
    fn id(&self) -> &'static str {
        "ar_ap_ratio"
    }

    fn label(&self) -> &'static str {
        "AR/AP ratio"
    }

    fn description(&self) -> &'static str {
        "Receivables outstanding divided by payables outstanding."
    }

    fn inputs(&self) -> &'static [InputRole] {
        const ROLES: &[InputRole] = &[
            InputRole::required("receivables", InputKind::Balance),
            InputRole::required("payables", InputKind::Balance),
        ];
        ROLES
    }

    fn unit(&self) -> Unit {
        Unit::Ratio
    }

    fn evaluate(&self, inputs: &FormulaInputs<'_>) -> Result<Evaluation> {
        let ar = inputs.balance("receivables")?;
        let ap = inputs.balance("payables")?;
        same_currency(self.id(), &ar, &ap)?;

        let (Some(ar), Some(ap)) = (ar.amount, ap.amount) else {
            return Ok(Evaluation::undefined("input is undefined"));
        };
        if ap.is_zero() {
            return Ok(Evaluation::undefined("payables outstanding are zero"));
        }

        let ratio = ar.checked_div(ap).ok_or_else(|| overflow(self.id()))?;
        Ok(Evaluation::exact(
            ratio.round_dp_with_strategy(4, RoundingStrategy::MidpointNearestEven),
            None,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{ComputationEngine, ComputationSnapshot};
    use crate::models::{FigureValue, FinancialFigure, TaskValue};
    use crate::snapshot::DataSnapshot;
    use crate::testing::record;
    use serde_json::json;
    use std::str::FromStr;

    fn d(s: &str) -> Decimal {
        Decimal::from_str(s).unwrap()
    }

    fn period() -> Value {
        json!({"start": "2025-01-01", "end": "2025-01-30"})
    }

    fn receivables() -> TaskValue {
        TaskValue::Records(DataSnapshot::new(
            "fetch_receivables",
            period(),
            vec![
                record(json!({"invoice_id": "A", "counterparty": "x", "issue_date": "2024-12-01", "due_date": "2024-12-31", "amount": "20000.00", "paid": "4000.00", "currency": "USD"})),
                record(json!({"invoice_id": "B", "counterparty": "y", "issue_date": "2025-01-10", "due_date": "2025-02-09", "amount": "15000.00", "currency": "USD"})),
                // overpaid documents never count negative
                record(json!({"invoice_id": "C", "counterparty": "z", "issue_date": "2025-01-11", "due_date": null, "amount": "100.00", "paid": "150.00", "currency": "USD"})),
            ],
        ))
    }

    fn sales(amounts: &[&str]) -> TaskValue {
        TaskValue::Records(DataSnapshot::new(
            "fetch_sales",
            period(),
            amounts
                .iter()
                .map(|a| record(json!({"date": "2025-01-15", "amount": a, "currency": "USD"})))
                .collect(),
        ))
    }

    fn figure(label: &str, amount: &str) -> TaskValue {
        TaskValue::Figure(FinancialFigure {
            label: label.to_string(),
            value: FigureValue::Exact { amount: d(amount) },
            currency: None,
            unit: Unit::Days,
            source_task_id: label.to_lowercase(),
            breakdown: Vec::new(),
        })
    }

    fn snapshot(values: Vec<(&str, TaskValue)>) -> ComputationSnapshot {
        let mut snap = ComputationSnapshot::new();
        for (id, value) in values {
            snap.insert(id, value);
        }
        snap
    }

    #[test]
    fn test_dso_is_exact_and_deterministic() {
        let engine = ComputationEngine::with_builtin_formulas();
        let snap = snapshot(vec![("t1", receivables()), ("t2", sales(&["10000.00", "20000.00"]))]);
        let params = json!({"receivables": "t1", "sales": "t2"});

        let first = engine.evaluate("dso", &snap, &params).unwrap();
        let second = engine.evaluate("dso", &snap, &params).unwrap();

        // 31000 / 30000 * 30 days
        assert_eq!(first.evaluation.value, FigureValue::Exact { amount: d("31.00") });
        assert_eq!(first, second);
        assert_eq!(first.unit, Unit::Days);
        assert_eq!(first.label, "DSO");
    }

    #[test]
    fn test_explicit_days_override_period_span() {
        let engine = ComputationEngine::with_builtin_formulas();
        let snap = snapshot(vec![("t1", receivables()), ("t2", sales(&["31000"]))]);
        let computed = engine
            .evaluate("dso", &snap, &json!({"receivables": "t1", "sales": "t2", "days": 365}))
            .unwrap();
        assert_eq!(computed.evaluation.value.amount(), Some(d("365.00")));
    }

    #[test]
    fn test_zero_sales_yield_undefined_sentinel() {
        let engine = ComputationEngine::with_builtin_formulas();
        let snap = snapshot(vec![("t1", receivables()), ("t2", sales(&[]))]);
        let computed = engine
            .evaluate("dso", &snap, &json!({"receivables": "t1", "sales": "t2"}))
            .unwrap();

        assert!(matches!(computed.evaluation.value, FigureValue::Undefined { .. }));
        assert!(computed.evaluation.note.unwrap().contains("zero"));
    }

    #[test]
    fn test_unknown_formula_and_unbound_input_are_fatal() {
        let engine = ComputationEngine::with_builtin_formulas();
        let snap = ComputationSnapshot::new();

        let err = engine.evaluate("ebitda", &snap, &json!({})).unwrap_err();
        assert_eq!(err.kind(), "computation_error");

        let err = engine.evaluate("dso", &snap, &json!({"receivables": "t1"})).unwrap_err();
        assert!(err.to_string().contains("sales"));
    }

    #[test]
    fn test_mixed_currencies_are_refused() {
        let engine = ComputationEngine::with_builtin_formulas();
        let mixed = TaskValue::Records(DataSnapshot::new(
            "fetch_sales",
            period(),
            vec![
                record(json!({"date": "2025-01-02", "amount": "1", "currency": "USD"})),
                record(json!({"date": "2025-01-03", "amount": "1", "currency": "CRC"})),
            ],
        ));
        let snap = snapshot(vec![("t1", mixed)]);
        assert!(engine.evaluate("period_total", &snap, &json!({"ledger": "t1"})).is_err());
    }

    #[test]
    fn test_outstanding_and_overdue() {
        let engine = ComputationEngine::with_builtin_formulas();
        let snap = snapshot(vec![("t1", receivables())]);

        let outstanding = engine
            .evaluate("outstanding_balance", &snap, &json!({"ledger": "t1"}))
            .unwrap();
        assert_eq!(outstanding.evaluation.value.amount(), Some(d("31000.00")));
        assert_eq!(outstanding.evaluation.currency.as_deref(), Some("USD"));

        // only invoice A is past due at 2025-01-30
        let overdue = engine
            .evaluate("overdue_balance", &snap, &json!({"ledger": "t1", "min_days": 15}))
            .unwrap();
        assert_eq!(overdue.evaluation.value.amount(), Some(d("16000.00")));

        let none = engine
            .evaluate("overdue_balance", &snap, &json!({"ledger": "t1", "min_days": 60}))
            .unwrap();
        assert_eq!(none.evaluation.value.amount(), Some(Decimal::ZERO));
    }

    #[test]
    fn test_ccc_uses_upstream_figures() {
        let engine = ComputationEngine::with_builtin_formulas();
        let snap = snapshot(vec![("a", figure("DSO", "48.50")), ("b", figure("DPO", "35.25"))]);
        let computed = engine
            .evaluate("ccc", &snap, &json!({"dso": "a", "dpo": "b"}))
            .unwrap();
        assert_eq!(computed.evaluation.value.amount(), Some(d("13.25")));
    }

    #[test]
    fn test_day_kpis_use_bankers_rounding() {
        assert_eq!(round_days(d("10.125")), d("10.12"));
        assert_eq!(round_days(d("10.135")), d("10.14"));
    }

    #[test]
    fn test_every_formula_is_a_computation_capability() {
        let engine = ComputationEngine::with_builtin_formulas();
        let names: Vec<String> = engine.descriptors().into_iter().map(|d| d.name).collect();
        assert_eq!(
            names,
            vec![
                "aging_buckets",
                "ar_ap_ratio",
                "ccc",
                "dpo",
                "dso",
                "due_window_balance",
                "open_documents",
                "outstanding_balance",
                "overdue_balance",
                "period_total",
                "top_counterparties",
            ]
        );
    }

    #[test]
    fn test_sums_near_the_decimal_limit_fail_instead_of_panicking() {
        let engine = ComputationEngine::with_builtin_formulas();
        let huge = TaskValue::Records(DataSnapshot::new(
            "fetch_receivables",
            period(),
            vec![
                record(json!({"invoice_id": "A", "counterparty": "x", "issue_date": "2025-01-01", "due_date": "2025-01-02", "amount": Decimal::MAX.to_string()})),
                record(json!({"invoice_id": "B", "counterparty": "x", "issue_date": "2025-01-01", "due_date": "2025-01-02", "amount": Decimal::MAX.to_string()})),
            ],
        ));
        let snap = snapshot(vec![("t1", huge)]);

        for formula in ["outstanding_balance", "overdue_balance", "aging_buckets", "open_documents"] {
            let err = engine.evaluate(formula, &snap, &json!({"ledger": "t1"})).unwrap_err();
            assert_eq!(err.kind(), "computation_error", "{}", formula);
            assert!(err.to_string().contains("overflow"), "{}", formula);
        }

        let snap = snapshot(vec![
            ("a", figure("DSO", &Decimal::MAX.to_string())),
            ("b", figure("DPO", &Decimal::MIN.to_string())),
        ]);
        let err = engine.evaluate("ccc", &snap, &json!({"dso": "a", "dpo": "b"})).unwrap_err();
        assert!(err.to_string().contains("overflow"));
    }

    /// Four payables at 2025-01-30: one settled, one partly paid
    fn payables() -> TaskValue {
        TaskValue::Records(DataSnapshot::new(
            "fetch_payables",
            period(),
            vec![
                record(json!({"invoice_id": "P1", "counterparty": "Initech", "issue_date": "2024-09-01", "due_date": "2024-10-01", "amount": "500.00", "currency": "USD"})),
                record(json!({"invoice_id": "P2", "counterparty": "Umbrella", "issue_date": "2024-12-01", "due_date": "2025-01-10", "amount": "1000.00", "paid": "400.00", "currency": "USD"})),
                record(json!({"invoice_id": "P3", "counterparty": "Initech", "issue_date": "2025-01-05", "due_date": "2025-02-03", "amount": "300.00", "currency": "USD"})),
                record(json!({"invoice_id": "P4", "counterparty": "Umbrella", "issue_date": "2025-01-06", "due_date": "2025-01-30", "amount": "200.00", "paid": "200.00", "currency": "USD"})),
                record(json!({"invoice_id": "P5", "counterparty": "Hooli", "issue_date": "2025-01-20", "due_date": null, "amount": "50.00", "currency": "USD"})),
            ],
        ))
    }

    fn amounts(computed: &crate::engine::Computed) -> Vec<(String, Decimal)> {
        computed
            .evaluation
            .breakdown
            .iter()
            .map(|l| (l.label.clone(), l.amount))
            .collect()
    }

    #[test]
    fn test_aging_buckets_split_overdue_by_days_past_due() {
        let engine = ComputationEngine::with_builtin_formulas();
        let snap = snapshot(vec![("t1", payables())]);
        let aging = engine.evaluate("aging_buckets", &snap, &json!({"ledger": "t1"})).unwrap();

        // P1 is 121 days late, P2 20 days late with 600 still open
        assert_eq!(aging.evaluation.value.amount(), Some(d("1100.00")));
        assert_eq!(
            amounts(&aging),
            vec![
                ("1-30 days".to_string(), d("600.00")),
                ("31-60 days".to_string(), Decimal::ZERO),
                ("61-90 days".to_string(), Decimal::ZERO),
                ("90+ days".to_string(), d("500.00")),
                ("not yet due".to_string(), d("300.00")),
                ("no due date".to_string(), d("50.00")),
            ]
        );
        assert_eq!(aging.evaluation.breakdown[0].documents, Some(1));
        assert_eq!(aging.evaluation.currency.as_deref(), Some("USD"));
    }

    #[test]
    fn test_aging_boundaries() {
        let engine = ComputationEngine::with_builtin_formulas();
        let rows: Vec<_> = [("2025-01-30", "due today"), ("2024-12-31", "30"), ("2024-12-30", "31"), ("2024-11-01", "90"), ("2024-10-31", "91")]
            .iter()
            .map(|(due, id)| {
                record(json!({"invoice_id": id, "counterparty": "x", "issue_date": "2024-10-01", "due_date": due, "amount": "1"}))
            })
            .collect();
        let snap = snapshot(vec![("t1", TaskValue::Records(DataSnapshot::new("fetch_receivables", period(), rows)))]);
        let aging = engine.evaluate("aging_buckets", &snap, &json!({"ledger": "t1"})).unwrap();
        let docs: Vec<Option<u32>> = aging.evaluation.breakdown.iter().map(|l| l.documents).collect();
        assert_eq!(docs, vec![Some(1), Some(1), Some(1), Some(1), Some(1), Some(0)]);
    }

    #[test]
    fn test_top_counterparties_rank_by_overdue_balance() {
        let engine = ComputationEngine::with_builtin_formulas();
        let snap = snapshot(vec![("t1", payables())]);

        let top = engine.evaluate("top_counterparties", &snap, &json!({"ledger": "t1"})).unwrap();
        assert_eq!(
            amounts(&top),
            vec![("Umbrella".to_string(), d("600.00")), ("Initech".to_string(), d("500.00"))]
        );
        assert_eq!(top.evaluation.breakdown[1].days, Some(121));
        assert_eq!(top.evaluation.value.amount(), Some(d("1100.00")));

        let all_open = engine
            .evaluate("top_counterparties", &snap, &json!({"ledger": "t1", "overdue_only": false, "limit": 1}))
            .unwrap();
        assert_eq!(amounts(&all_open), vec![("Initech".to_string(), d("800.00"))]);
        assert_eq!(all_open.evaluation.breakdown[0].documents, Some(2));
    }

    #[test]
    fn test_due_window_lists_documents_coming_due() {
        let engine = ComputationEngine::with_builtin_formulas();
        let snap = snapshot(vec![("t1", payables())]);

        let week = engine
            .evaluate("due_window_balance", &snap, &json!({"ledger": "t1", "as_of": "2025-01-28"}))
            .unwrap();
        // P4 falls due on the 30th but is settled
        assert_eq!(amounts(&week), vec![("P3".to_string(), d("300.00"))]);
        assert_eq!(week.evaluation.breakdown[0].days, Some(6));
        assert_eq!(week.evaluation.breakdown[0].counterparty.as_deref(), Some("Initech"));

        let today = engine
            .evaluate("due_window_balance", &snap, &json!({"ledger": "t1", "as_of": "2025-02-03", "within_days": 0}))
            .unwrap();
        assert_eq!(today.evaluation.value.amount(), Some(d("300.00")));
        assert_eq!(today.evaluation.breakdown[0].days, Some(0));

        let none = engine
            .evaluate("due_window_balance", &snap, &json!({"ledger": "t1", "as_of": "2025-02-04"}))
            .unwrap();
        assert_eq!(none.evaluation.value.amount(), Some(Decimal::ZERO));
        assert!(none.evaluation.breakdown.is_empty());
    }

    #[test]
    fn test_open_documents_net_partial_payments_and_put_overdue_first() {
        let engine = ComputationEngine::with_builtin_formulas();
        let snap = snapshot(vec![("t1", payables())]);

        let open = engine.evaluate("open_documents", &snap, &json!({"ledger": "t1"})).unwrap();
        assert_eq!(open.evaluation.value.amount(), Some(d("1450.00")));
        assert_eq!(
            amounts(&open),
            vec![
                ("P1".to_string(), d("500.00")),
                ("P2".to_string(), d("600.00")),
                ("P3".to_string(), d("300.00")),
                ("P5".to_string(), d("50.00")),
            ]
        );
        let statuses: Vec<&str> = open
            .evaluation
            .breakdown
            .iter()
            .filter_map(|l| l.status.as_deref())
            .collect();
        assert_eq!(statuses, vec!["overdue", "overdue", "open", "no_due_date"]);

        let overdue = engine
            .evaluate("open_documents", &snap, &json!({"ledger": "t1", "overdue_only": true, "limit": 1}))
            .unwrap();
        // the total covers every match, the list is capped
        assert_eq!(overdue.evaluation.value.amount(), Some(d("1100.00")));
        assert_eq!(amounts(&overdue), vec![("P1".to_string(), d("500.00"))]);
    }
}
