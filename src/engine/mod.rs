//! Deterministic computation engine
//!
//! Every money figure is produced here, from snapshot records, with exact
//! decimal arithmetic. Nothing in this module talks to a language model or a
//! data source. The same formula over the same snapshot always yields the
//! same figure.

use crate::error::OrchestrationError;
use crate::models::{
    BreakdownLine, CapabilityCategory, CapabilityDescriptor, FigureValue, FinancialFigure, OutputKind, Record,
    RoleSpec, TaskValue, Unit,
};
use crate::schema::{decimal_from_json, figure_schema, validate_ref, Schema};
use crate::snapshot::DataSnapshot;
use crate::Result;
use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

pub mod formulas;

pub use crate::models::InputKind;

#[derive(Debug, Clone, Copy)]
pub struct InputRole {
    pub name: &'static str,
    pub kind: InputKind,
    pub required: bool,
}

impl InputRole {
    pub const fn required(name: &'static str, kind: InputKind) -> Self {
        Self {
            name,
            kind,
            required: true,
        }
    }

    pub const fn optional(name: &'static str, kind: InputKind) -> Self {
        Self {
            name,
            kind,
            required: false,
        }
    }
}

/// A named, pure financial formula
pub trait Formula: Send + Sync {
    fn id(&self) -> &'static str;

    /// Display label of the figure it produces
    fn label(&self) -> &'static str;

    fn description(&self) -> &'static str;

    fn inputs(&self) -> &'static [InputRole];

    fn unit(&self) -> Unit;

    /// Schema of the non-role parameters, merged into the capability input schema
    fn extra_parameters(&self) -> Vec<crate::schema::Field> {
        Vec::new()
    }

    fn evaluate(&self, inputs: &FormulaInputs<'_>) -> Result<Evaluation>;
}

/// Formula output before it is stamped with a task id
#[derive(Debug, Clone, PartialEq)]
pub struct Evaluation {
    pub value: FigureValue,
    pub currency: Option<String>,
    pub note: Option<String>,
    pub breakdown: Vec<BreakdownLine>,
}

impl Evaluation {
    pub fn exact(amount: Decimal, currency: Option<String>) -> Self {
        Self {
            value: FigureValue::Exact { amount },
            currency,
            note: None,
            breakdown: Vec::new(),
        }
    }

    pub fn with_breakdown(mut self, breakdown: Vec<BreakdownLine>) -> Self {
        self.breakdown = breakdown;
        self
    }

    /// Sentinel for a zero denominator or an undefined input
    pub fn undefined(reason: impl Into<String>) -> Self {
        let reason = reason.into();
        Self {
            value: FigureValue::Undefined {
                reason: reason.clone(),
            },
            currency: None,
            note: Some(reason),
            breakdown: Vec::new(),
        }
    }
}

/// Upstream results a computation may read, keyed by task id
#[derive(Debug, Clone, Default)]
pub struct ComputationSnapshot {
    values: BTreeMap<String, TaskValue>,
}

impl ComputationSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, task_id: impl Into<String>, value: TaskValue) {
        self.values.insert(task_id.into(), value);
    }

    pub fn get(&self, task_id: &str) -> Option<&TaskValue> {
        self.values.get(task_id)
    }
}

/// An amount with the currency it is denominated in. `amount` is `None`
/// when an upstream figure was undefined.
#[derive(Debug, Clone, PartialEq)]
pub struct Measure {
    pub amount: Option<Decimal>,
    pub currency: Option<String>,
    pub undefined_reason: Option<String>,
}

/// Read access for a formula to its bound inputs and parameters
pub struct FormulaInputs<'a> {
    formula: &'a str,
    snapshot: &'a ComputationSnapshot,
    parameters: &'a Value,
}

impl<'a> FormulaInputs<'a> {
    pub fn new(formula: &'a str, snapshot: &'a ComputationSnapshot, parameters: &'a Value) -> Self {
        Self {
            formula,
            snapshot,
            parameters,
        }
    }

    pub fn error(&self, message: impl std::fmt::Display) -> OrchestrationError {
        OrchestrationError::ComputationError(format!("{}: {}", self.formula, message))
    }

    pub fn is_bound(&self, role: &str) -> bool {
        self.parameters.get(role).and_then(Value::as_str).is_some()
    }

    /// The upstream value bound to `role`
    pub fn value(&self, role: &str) -> Result<&'a TaskValue> {
        let task_id = self
            .parameters
            .get(role)
            .and_then(Value::as_str)
            .ok_or_else(|| self.error(format!("input '{}' is not bound to a task", role)))?;
        self.snapshot
            .get(task_id)
            .ok_or_else(|| self.error(format!("input '{}' refers to '{}' which has no result", role, task_id)))
    }

    pub fn records(&self, role: &str) -> Result<&'a DataSnapshot> {
        match self.value(role)? {
            TaskValue::Records(snapshot) => Ok(snapshot),
            TaskValue::Figure(_) => Err(self.error(format!("input '{}' must be records, got a figure", role))),
        }
    }

    /// Outstanding balance of the documents behind `role`, or the upstream figure
    pub fn balance(&self, role: &str) -> Result<Measure> {
        match self.value(role)? {
            TaskValue::Records(snapshot) => {
                let (amount, currency) = outstanding(snapshot).map_err(|e| self.error(e))?;
                Ok(Measure {
                    amount: Some(amount),
                    currency,
                    undefined_reason: None,
                })
            }
            TaskValue::Figure(figure) => Ok(measure_of(role, figure)),
        }
    }

    /// Period total of the transactions behind `role`, or the upstream figure
    pub fn flow(&self, role: &str) -> Result<Measure> {
        match self.value(role)? {
            TaskValue::Records(snapshot) => {
                let (amount, currency) = total(snapshot).map_err(|e| self.error(e))?;
                Ok(Measure {
                    amount: Some(amount),
                    currency,
                    undefined_reason: None,
                })
            }
            TaskValue::Figure(figure) => Ok(measure_of(role, figure)),
        }
    }

    pub fn figure(&self, role: &str) -> Result<Measure> {
        match self.value(role)? {
            TaskValue::Figure(figure) => Ok(measure_of(role, figure)),
            TaskValue::Records(_) => Err(self.error(format!("input '{}' must be a figure, got records", role))),
        }
    }

    pub fn param_u32(&self, key: &str) -> Result<Option<u32>> {
        match self.parameters.get(key) {
            None | Some(Value::Null) => Ok(None),
            Some(v) => v
                .as_u64()
                .and_then(|n| u32::try_from(n).ok())
                .map(Some)
                .ok_or_else(|| self.error(format!("'{}' must be a non-negative integer", key))),
        }
    }

    pub fn param_bool(&self, key: &str) -> Result<Option<bool>> {
        match self.parameters.get(key) {
            None | Some(Value::Null) => Ok(None),
            Some(v) => v
                .as_bool()
                .map(Some)
                .ok_or_else(|| self.error(format!("'{}' must be true or false", key))),
        }
    }

    pub fn param_date(&self, key: &str) -> Result<Option<NaiveDate>> {
        match self.parameters.get(key) {
            None | Some(Value::Null) => Ok(None),
            Some(v) => v
                .as_str()
                .and_then(|s| NaiveDate::parse_from_str(s, "%Y-%m-%d").ok())
                .map(Some)
                .ok_or_else(|| self.error(format!("'{}' must be a YYYY-MM-DD date", key))),
        }
    }

    /// Days in the window: the `days` parameter, else the inclusive span of
    /// the snapshot behind `flow_role`.
    pub fn period_days(&self, flow_role: &str) -> Result<u32> {
        if let Some(days) = self.param_u32("days")? {
            return Ok(days);
        }
        if let Ok(snapshot) = self.records(flow_role) {
            if let Some(days) = snapshot_span_days(snapshot) {
                return Ok(days);
            }
        }
        Err(self.error(format!(
            "'days' not given and the '{}' input carries no period",
            flow_role
        )))
    }

    /// Period end of the snapshot behind `role`
    pub fn period_end(&self, role: &str) -> Option<NaiveDate> {
        let snapshot = self.records(role).ok()?;
        snapshot
            .parameters
            .get("end")
            .and_then(Value::as_str)
            .and_then(|s| NaiveDate::parse_from_str(s, "%Y-%m-%d").ok())
    }

    /// The `as_of` parameter, else the period end of the ledger behind `role`
    pub fn as_of(&self, role: &str) -> Result<NaiveDate> {
        match self.param_date("as_of")? {
            Some(date) => Ok(date),
            None => self.period_end(role).ok_or_else(|| {
                self.error(format!("no as_of given and the '{}' input carries no period end", role))
            }),
        }
    }
}

fn measure_of(role: &str, figure: &FinancialFigure) -> Measure {
    match &figure.value {
        FigureValue::Exact { amount } => Measure {
            amount: Some(*amount),
            currency: figure.currency.clone(),
            undefined_reason: None,
        },
        FigureValue::Undefined { reason } => Measure {
            amount: None,
            currency: figure.currency.clone(),
            undefined_reason: Some(format!("input '{}' is undefined ({})", role, reason)),
        },
    }
}

fn snapshot_span_days(snapshot: &DataSnapshot) -> Option<u32> {
    let get = |key: &str| {
        snapshot
            .parameters
            .get(key)
            .and_then(Value::as_str)
            .and_then(|s| NaiveDate::parse_from_str(s, "%Y-%m-%d").ok())
    };
    let span = (get("end")? - get("start")?).num_days() + 1;
    u32::try_from(span).ok().filter(|d| *d > 0)
}

fn field_decimal(row: &Record, key: &str) -> std::result::Result<Option<Decimal>, String> {
    match row.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(v) => decimal_from_json(v)
            .map(Some)
            .ok_or_else(|| format!("'{}' is not a decimal: {}", key, v)),
    }
}

/// The single currency of a record set. Mixed currencies are refused: there
/// is no conversion or reconciliation policy to apply.
pub fn single_currency(snapshot: &DataSnapshot) -> std::result::Result<Option<String>, String> {
    let mut found: Option<&str> = None;
    for row in snapshot.records.iter() {
        if let Some(c) = row.get("currency").and_then(Value::as_str) {
            match found {
                None => found = Some(c),
                Some(prev) if prev == c => {}
                Some(prev) => {
                    return Err(format!(
                        "{} mixes currencies {} and {}",
                        snapshot.source, prev, c
                    ))
                }
            }
        }
    }
    Ok(found.map(str::to_string))
}

/// Σ max(amount − paid, 0)
pub fn outstanding(snapshot: &DataSnapshot) -> std::result::Result<(Decimal, Option<String>), String> {
    let currency = single_currency(snapshot)?;
    let mut sum = Decimal::ZERO;
    for row in snapshot.records.iter() {
        sum = checked_sum(sum, open_amount(row)?)?;
    }
    Ok((sum, currency))
}

/// What is still owed on one document. Partial payments reduce it; an
/// overpaid document counts as zero.
pub fn open_amount(row: &Record) -> std::result::Result<Decimal, String> {
    let amount = field_decimal(row, "amount")?.unwrap_or(Decimal::ZERO);
    let paid = field_decimal(row, "paid")?.unwrap_or(Decimal::ZERO);
    let open = amount
        .checked_sub(paid)
        .ok_or_else(|| "arithmetic overflow".to_string())?;
    Ok(open.max(Decimal::ZERO))
}

pub fn checked_sum(sum: Decimal, value: Decimal) -> std::result::Result<Decimal, String> {
    sum.checked_add(value)
        .ok_or_else(|| "arithmetic overflow".to_string())
}

/// Σ amount
pub fn total(snapshot: &DataSnapshot) -> std::result::Result<(Decimal, Option<String>), String> {
    let currency = single_currency(snapshot)?;
    let mut sum = Decimal::ZERO;
    for row in snapshot.records.iter() {
        sum = checked_sum(sum, field_decimal(row, "amount")?.unwrap_or(Decimal::ZERO))?;
    }
    Ok((sum, currency))
}

/// Result of `ComputationEngine::evaluate`, stamped into a figure by the caller
#[derive(Debug, Clone, PartialEq)]
pub struct Computed {
    pub label: String,
    pub unit: Unit,
    pub evaluation: Evaluation,
}

impl Computed {
    pub fn into_figure(self, task_id: &str) -> FinancialFigure {
        FinancialFigure {
            label: self.label,
            value: self.evaluation.value,
            currency: self.evaluation.currency,
            unit: self.unit,
            source_task_id: task_id.to_string(),
            breakdown: self.evaluation.breakdown,
        }
    }
}

pub struct ComputationEngine {
    formulas: HashMap<String, Arc<dyn Formula>>,
}

impl ComputationEngine {
    pub fn new() -> Self {
        Self {
            formulas: HashMap::new(),
        }
    }

    /// Engine with the built-in KPI formulas
    pub fn with_builtin_formulas() -> Self {
        let mut engine = Self::new();
        for formula in formulas::builtin() {
            engine.register(formula);
        }
        engine
    }

    pub fn register(&mut self, formula: Arc<dyn Formula>) {
        self.formulas.insert(formula.id().to_string(), formula);
    }

    /// Evaluate `formula_id` over `snapshot`. Unknown formulas are fatal.
    pub fn evaluate(
        &self,
        formula_id: &str,
        snapshot: &ComputationSnapshot,
        parameters: &Value,
    ) -> Result<Computed> {
        let formula = self.formulas.get(formula_id).ok_or_else(|| {
            OrchestrationError::ComputationError(format!("unknown formula '{}'", formula_id))
        })?;

        let inputs = FormulaInputs::new(formula_id, snapshot, parameters);
        for role in formula.inputs().iter().filter(|r| r.required) {
            if !inputs.is_bound(role.name) {
                return Err(OrchestrationError::ComputationError(format!(
                    "{}: required input '{}' is not bound",
                    formula_id, role.name
                )));
            }
        }

        let evaluation = formula.evaluate(&inputs)?;
        let computed = Computed {
            label: formula.label().to_string(),
            unit: formula.unit(),
            evaluation,
        };

        // the figure contract is checked on the way out like any other boundary
        let figure = computed.clone().into_figure(formula_id);
        validate_ref(&serde_json::to_value(&figure)?, &figure_schema(), &format!("engine:{}", formula_id))?;

        Ok(computed)
    }

    /// Catalog entries, one computation capability per formula
    pub fn descriptors(&self) -> Vec<CapabilityDescriptor> {
        let mut all: Vec<CapabilityDescriptor> = self
            .formulas
            .values()
            .map(|f| {
                let mut fields: Vec<crate::schema::Field> = f
                    .inputs()
                    .iter()
                    .map(|role| {
                        if role.required {
                            crate::schema::Field::required(role.name, Schema::String)
                        } else {
                            crate::schema::Field::optional(role.name, Schema::String)
                        }
                    })
                    .collect();
                fields.extend(f.extra_parameters());

                let roles: Vec<String> = f
                    .inputs()
                    .iter()
                    .map(|r| format!("{}{}", r.name, if r.required { "" } else { "?" }))
                    .collect();

                CapabilityDescriptor {
                    name: f.id().to_string(),
                    category: CapabilityCategory::Computation,
                    description: format!(
                        "{} Bind inputs [{}] to upstream task ids.",
                        f.description(),
                        roles.join(", ")
                    ),
                    input_schema: Schema::object(fields),
                    output_schema: figure_schema(),
                    input_roles: f
                        .inputs()
                        .iter()
                        .map(|r| RoleSpec {
                            name: r.name.to_string(),
                            kind: r.kind,
                            required: r.required,
                        })
                        .collect(),
                    output_kind: OutputKind::Figure,
                    cost_hint: 0,
                }
            })
            .collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }
}

impl Default for ComputationEngine {
    fn default() -> Self {
        Self::with_builtin_formulas()
    }
}
