//! Deterministic intent routing
//!
//! Common working-capital questions (DSO, DPO, cash conversion cycle,
//! overdue balances and aging, top debtors or creditors, documents coming
//! due, open document lists, one counterparty's balance, ledger totals) map
//! to fixed task graphs without a model call. English and Spanish phrasings
//! are recognised.

use super::{apply_period, validate_plan, Planner};
use crate::catalog::CapabilityCatalog;
use crate::error::OrchestrationError;
use crate::graph::TaskGraph;
use crate::models::Request;
use crate::period::{resolve_period, Period};
use crate::Result;
use async_trait::async_trait;
use chrono::NaiveDate;
use lazy_static::lazy_static;
use regex::Regex;
use serde_json::{json, Value};
use std::collections::HashSet;
use tracing::debug;

lazy_static! {
    static ref COUNTERPARTY: Regex = Regex::new(
        r#"\b(?i:(customer|client|cliente|supplier|vendor|proveedor))\s+(?:"([^"]+)"|'([^']+)'|(\p{Lu}[\w&.\-]*(?:\s+\p{Lu}[\w&.\-]*)*))"#
    )
    .unwrap();
    static ref WINDOW_DAYS: Regex =
        Regex::new(r"(?:next|within|próximos|proximos|siguientes)\s+(\d{1,3})\s+(?:days|días|dias)").unwrap();
}

/// Days ahead a "due soon" question looks when it names no window
pub const DEFAULT_DUE_WINDOW_DAYS: u32 = 7;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ledger {
    Receivables,
    Payables,
}

impl Ledger {
    fn capability(self) -> &'static str {
        match self {
            Ledger::Receivables => "fetch_receivables",
            Ledger::Payables => "fetch_payables",
        }
    }

    fn name(self) -> &'static str {
        match self {
            Ledger::Receivables => "receivables",
            Ledger::Payables => "payables",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Intent {
    Dso,
    Dpo,
    CashConversionCycle,
    OverdueReceivables,
    OverduePayables,
    ReceivablesBalance,
    PayablesBalance,
    SalesTotal,
    PurchasesTotal,
    ReceivablesPayablesRatio,
    Aging(Ledger),
    TopCounterparties(Ledger),
    DueSoon { ledger: Ledger, within_days: u32 },
    OpenDocuments { ledger: Ledger, overdue_only: bool },
    CounterpartyBalance { ledger: Ledger, name: String, overdue_only: bool },
}

/// The customer or supplier a question names, e.g. `customer Acme Corp` or
/// `proveedor "Initech"`
pub fn named_counterparty(text: &str) -> Option<(Ledger, String)> {
    let caps = COUNTERPARTY.captures(text)?;
    let ledger = match caps.get(1)?.as_str().to_lowercase().as_str() {
        "customer" | "client" | "cliente" => Ledger::Receivables,
        _ => Ledger::Payables,
    };
    let name = caps.get(2).or_else(|| caps.get(3)).or_else(|| caps.get(4))?;
    let name = name.as_str().trim();
    (!name.is_empty()).then(|| (ledger, name.to_string()))
}

struct Text {
    lowered: String,
    words: HashSet<String>,
}

impl Text {
    fn new(raw: &str) -> Self {
        let lowered = raw.to_lowercase();
        let words = lowered
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
            .map(str::to_string)
            .collect();
        Self { lowered, words }
    }

    fn word(&self, words: &[&str]) -> bool {
        words.iter().any(|w| self.words.contains(*w))
    }

    fn phrase(&self, phrases: &[&str]) -> bool {
        phrases.iter().any(|p| self.lowered.contains(p))
    }
}

/// Intents found in `text`, in plan order
pub fn detect_intents(text: &str) -> Vec<Intent> {
    let t = Text::new(text);
    let mut intents = Vec::new();

    let receivables = t.word(&["ar", "cxc", "receivables", "receivable", "cartera", "debtors", "clientes"])
        || t.phrase(&["cuentas por cobrar", "owed to us"]);
    let payables = t.word(&["ap", "cxp", "payables", "payable", "creditors", "suppliers", "proveedores"])
        || t.phrase(&["cuentas por pagar", "we owe"]);

    let ccc = t.word(&["ccc"])
        || t.phrase(&["cash conversion", "conversion cycle", "ciclo de conversión", "ciclo de conversion", "ciclo de caja"]);
    let dso = ccc
        || t.word(&["dso"])
        || t.phrase(&["days sales outstanding", "days of sales outstanding", "collection period", "días de cobro", "dias de cobro", "periodo de cobro"]);
    let dpo = ccc
        || t.word(&["dpo"])
        || t.phrase(&["days payable", "days payables", "payment period", "días de pago", "dias de pago", "periodo de pago"]);
    let overdue = t.word(&["overdue", "morosidad"]) || t.phrase(&["past due", "vencid", "atrasad"]);
    let ratio = t.phrase(&["ar/ap", "cxc/cxp", "working capital", "capital de trabajo"]);

    let ledger = if payables && !receivables {
        Ledger::Payables
    } else {
        Ledger::Receivables
    };
    let aging = t.word(&["aging", "ageing", "antigüedad", "antiguedad", "buckets"]);
    let top = t.word(&["top", "biggest", "largest", "worst", "mayores", "principales", "peores"])
        && (overdue || receivables || payables || t.word(&["customers", "deudores", "debtors"]));
    let due_today = t.phrase(&["due today", "vence hoy", "vencen hoy"]);
    let due_soon = due_today
        || t.phrase(&[
            "due soon",
            "due this week",
            "due next week",
            "due in the next",
            "due within",
            "coming due",
            "falling due",
            "por vencer",
            "próximos a vencer",
            "proximos a vencer",
            "a punto de vencer",
        ]);
    let listing = t.phrase(&[
        "open invoices",
        "unpaid invoices",
        "pending invoices",
        "outstanding invoices",
        "facturas abiertas",
        "facturas pendientes",
        "facturas sin pagar",
    ]) || (t.word(&["list", "listar", "lista", "detalle", "which", "cuáles", "cuales"])
        && t.word(&["invoices", "facturas", "documents", "documentos", "bills"]));

    if dso {
        intents.push(Intent::Dso);
    }
    if dpo {
        intents.push(Intent::Dpo);
    }
    if ccc {
        intents.push(Intent::CashConversionCycle);
    }

    if let Some((named_ledger, name)) = named_counterparty(text) {
        intents.push(Intent::CounterpartyBalance {
            ledger: named_ledger,
            name,
            overdue_only: overdue,
        });
    } else if aging {
        intents.push(Intent::Aging(ledger));
    } else if top {
        intents.push(Intent::TopCounterparties(ledger));
    } else if listing {
        intents.push(Intent::OpenDocuments {
            ledger,
            overdue_only: overdue,
        });
    } else if overdue {
        if ledger == Ledger::Payables {
            intents.push(Intent::OverduePayables);
        } else {
            intents.push(Intent::OverdueReceivables);
        }
    }

    if due_soon {
        // what is coming due is a payables question unless only customers are named
        let ledger = if receivables && !payables {
            Ledger::Receivables
        } else {
            Ledger::Payables
        };
        let within_days = if due_today {
            0
        } else {
            WINDOW_DAYS
                .captures(&t.lowered)
                .and_then(|c| c.get(1))
                .and_then(|m| m.as_str().parse().ok())
                .unwrap_or(DEFAULT_DUE_WINDOW_DAYS)
        };
        intents.push(Intent::DueSoon { ledger, within_days });
    }
    if ratio || (dso && dpo) {
        intents.push(Intent::ReceivablesPayablesRatio);
    }

    if intents.is_empty() {
        if receivables {
            intents.push(Intent::ReceivablesBalance);
        }
        if payables {
            intents.push(Intent::PayablesBalance);
        }
        if t.word(&["sales", "revenue", "ventas", "ingresos", "facturación", "facturacion"]) {
            intents.push(Intent::SalesTotal);
        }
        if t.word(&["purchases", "compras"]) {
            intents.push(Intent::PurchasesTotal);
        }
    }

    intents
}

struct PlanBuilder {
    nodes: Vec<Value>,
    ids: HashSet<String>,
}

impl PlanBuilder {
    fn new() -> Self {
        Self {
            nodes: Vec::new(),
            ids: HashSet::new(),
        }
    }

    /// Connector node, added once however many computations read it
    fn fetch(&mut self, capability: &str) -> String {
        if self.ids.insert(capability.to_string()) {
            self.nodes.push(json!({"id": capability, "capability": capability}));
        }
        capability.to_string()
    }

    /// Connector node restricted to one counterparty
    fn fetch_for(&mut self, ledger: Ledger, counterparty: &str) -> String {
        let id = format!("{}_for_counterparty", ledger.capability());
        if self.ids.insert(id.clone()) {
            self.nodes.push(json!({
                "id": id,
                "capability": ledger.capability(),
                "parameters": {"counterparty": counterparty},
            }));
        }
        id
    }

    fn compute(&mut self, id: &str, formula: &str, bindings: &[(&str, &str)], optional: bool) -> String {
        self.compute_with(id, formula, bindings, json!({}), optional)
    }

    fn compute_with(
        &mut self,
        id: &str,
        formula: &str,
        bindings: &[(&str, &str)],
        settings: Value,
        optional: bool,
    ) -> String {
        if self.ids.insert(id.to_string()) {
            let mut parameters: serde_json::Map<String, Value> = bindings
                .iter()
                .map(|(role, task)| (role.to_string(), json!(task)))
                .collect();
            if let Value::Object(settings) = settings {
                parameters.extend(settings);
            }
            let depends_on: Vec<&str> = bindings.iter().map(|(_, task)| *task).collect();
            self.nodes.push(json!({
                "id": id,
                "capability": formula,
                "parameters": parameters,
                "depends_on": depends_on,
                "optional": optional,
            }));
        }
        id.to_string()
    }

    fn dso(&mut self) -> String {
        let ar = self.fetch("fetch_receivables");
        let sales = self.fetch("fetch_sales");
        self.compute("compute_dso", "dso", &[("receivables", &ar), ("sales", &sales)], false)
    }

    fn dpo(&mut self) -> String {
        let ap = self.fetch("fetch_payables");
        let purchases = self.fetch("fetch_purchases");
        self.compute("compute_dpo", "dpo", &[("payables", &ap), ("purchases", &purchases)], false)
    }
}

/// Raw plan for the intents in `text`, or `None` when nothing is recognised
pub fn route(text: &str) -> Option<Value> {
    let intents = detect_intents(text);
    if intents.is_empty() {
        return None;
    }

    let mut plan = PlanBuilder::new();
    let mut covered = Vec::new();

    for intent in &intents {
        match intent {
            Intent::Dso => {
                plan.dso();
                covered.push("DSO");
            }
            Intent::Dpo => {
                plan.dpo();
                covered.push("DPO");
            }
            Intent::CashConversionCycle => {
                let dso = plan.dso();
                let dpo = plan.dpo();
                plan.compute("compute_ccc", "ccc", &[("dso", &dso), ("dpo", &dpo)], false);
                covered.push("cash conversion cycle");
            }
            Intent::OverdueReceivables => {
                let ar = plan.fetch("fetch_receivables");
                plan.compute("compute_overdue_receivables", "overdue_balance", &[("ledger", &ar)], false);
                covered.push("overdue receivables");
            }
            Intent::OverduePayables => {
                let ap = plan.fetch("fetch_payables");
                plan.compute("compute_overdue_payables", "overdue_balance", &[("ledger", &ap)], false);
                covered.push("overdue payables");
            }
            Intent::ReceivablesBalance => {
                let ar = plan.fetch("fetch_receivables");
                plan.compute("compute_receivables_outstanding", "outstanding_balance", &[("ledger", &ar)], false);
                covered.push("receivables outstanding");
            }
            Intent::PayablesBalance => {
                let ap = plan.fetch("fetch_payables");
                plan.compute("compute_payables_outstanding", "outstanding_balance", &[("ledger", &ap)], false);
                covered.push("payables outstanding");
            }
            Intent::SalesTotal => {
                let sales = plan.fetch("fetch_sales");
                plan.compute("compute_sales_total", "period_total", &[("ledger", &sales)], false);
                covered.push("sales total");
            }
            Intent::PurchasesTotal => {
                let purchases = plan.fetch("fetch_purchases");
                plan.compute("compute_purchases_total", "period_total", &[("ledger", &purchases)], false);
                covered.push("purchases total");
            }
            Intent::ReceivablesPayablesRatio => {
                let ar = plan.fetch("fetch_receivables");
                let ap = plan.fetch("fetch_payables");
                // asked for explicitly it is required, as an add-on to DSO/DPO it is optional
                let optional = !intents.iter().all(|i| *i == Intent::ReceivablesPayablesRatio);
                plan.compute(
                    "compute_ar_ap_ratio",
                    "ar_ap_ratio",
                    &[("receivables", &ar), ("payables", &ap)],
                    optional,
                );
                covered.push("AR/AP ratio");
            }
            Intent::Aging(ledger) => {
                let docs = plan.fetch(ledger.capability());
                let id = format!("compute_{}_aging", ledger.name());
                plan.compute(&id, "aging_buckets", &[("ledger", &docs)], false);
                covered.push("aging");
            }
            Intent::TopCounterparties(ledger) => {
                let docs = plan.fetch(ledger.capability());
                let id = format!("compute_top_{}", ledger.name());
                plan.compute(&id, "top_counterparties", &[("ledger", &docs)], false);
                covered.push("top counterparties");
            }
            Intent::DueSoon { ledger, within_days } => {
                let docs = plan.fetch(ledger.capability());
                let id = format!("compute_{}_due_soon", ledger.name());
                plan.compute_with(
                    &id,
                    "due_window_balance",
                    &[("ledger", &docs)],
                    json!({"within_days": within_days}),
                    false,
                );
                covered.push("documents coming due");
            }
            Intent::OpenDocuments { ledger, overdue_only } => {
                let docs = plan.fetch(ledger.capability());
                let id = format!("compute_open_{}", ledger.name());
                plan.compute_with(
                    &id,
                    "open_documents",
                    &[("ledger", &docs)],
                    json!({"overdue_only": overdue_only}),
                    false,
                );
                covered.push("open documents");
            }
            Intent::CounterpartyBalance {
                ledger,
                name,
                overdue_only,
            } => {
                let docs = plan.fetch_for(*ledger, name);
                plan.compute_with(
                    "compute_counterparty_balance",
                    "open_documents",
                    &[("ledger", &docs)],
                    json!({"overdue_only": overdue_only}),
                    false,
                );
                covered.push("counterparty balance");
            }
        }
    }

    Some(json!({
        "nodes": plan.nodes,
        "rationale": format!("Intent routing: {}", covered.join(", ")),
    }))
}

/// Due-window nodes look ahead from `as_of`, not from the period end
fn anchor_due_windows(raw: &mut Value, as_of: NaiveDate) {
    let Some(nodes) = raw.get_mut("nodes").and_then(Value::as_array_mut) else {
        return;
    };
    for node in nodes.iter_mut() {
        if node.get("capability").and_then(Value::as_str) != Some("due_window_balance") {
            continue;
        }
        if let Some(params) = node.get_mut("parameters").and_then(Value::as_object_mut) {
            params
                .entry("as_of")
                .or_insert_with(|| json!(as_of.format("%Y-%m-%d").to_string()));
        }
    }
}

/// Resolve the period of `request` relative to the day it was received
pub fn request_period(request: &Request) -> Period {
    resolve_period(&request.raw_text, request.received_at.date_naive())
}

#[derive(Debug, Clone, Copy, Default)]
pub struct KeywordPlanner;

impl KeywordPlanner {
    pub fn new() -> Self {
        Self
    }

    /// Routed graph, `Ok(None)` when no intent matched
    pub fn try_plan(&self, request: &Request, catalog: &CapabilityCatalog) -> Result<Option<TaskGraph>> {
        let Some(mut raw) = route(&request.raw_text) else {
            return Ok(None);
        };
        let period = request_period(request);
        apply_period(&mut raw, catalog, &period);
        anchor_due_windows(&mut raw, period.end.min(request.received_at.date_naive()));

        let mut graph = validate_plan(raw, request, catalog)?;
        debug!(request_id = %request.id, tasks = graph.len(), "Intent routing produced a plan");
        graph.period = Some(period);
        Ok(Some(graph))
    }
}

#[async_trait]
impl Planner for KeywordPlanner {
    async fn plan(&self, request: &Request, catalog: &CapabilityCatalog) -> Result<TaskGraph> {
        self.try_plan(request, catalog)?.ok_or_else(|| {
            OrchestrationError::PlanningError(format!(
                "no capability matches the request '{}'",
                request.raw_text
            ))
        })
    }
}
