//! Narrator: turns a result set into the requested report shape
//!
//! Figures are copied into the report exactly as computed, each with the
//! provenance of the task that produced it. A model may reword the prose but
//! never supplies a number.

pub mod format;

use crate::error::OrchestrationError;
use crate::llm::CompletionService;
use crate::models::{
    BranchMarker, NarrativeSource, OutputShape, Recommendation, Report, ReportedFigure, ResultSet, Unit,
};
use crate::schema::{result_set_schema, validate, validate_ref, Field, Schema};
use crate::Result;
use async_trait::async_trait;
use format::{format_figure, format_line, format_number};
use lazy_static::lazy_static;
use regex::Regex;
use rust_decimal::Decimal;
use serde_json::{json, Value};
use std::collections::HashSet;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{info, warn};

#[async_trait]
pub trait Narrator: Send + Sync {
    /// Render `results` as `shape`. Read-only over the figures.
    async fn render(&self, results: &ResultSet, shape: &OutputShape) -> Result<Report>;
}

/// Render, falling back to the raw result set when rendering fails
pub async fn render_or_degrade(narrator: &dyn Narrator, results: &ResultSet, shape: &OutputShape) -> Report {
    match narrator.render(results, shape).await {
        Ok(report) => report,
        Err(e) => {
            warn!(request_id = %results.request_id, error = %e, "Rendering failed, returning raw results");
            degraded_report(results, shape, &e)
        }
    }
}

pub fn degraded_report(results: &ResultSet, shape: &OutputShape, error: &OrchestrationError) -> Report {
    Report {
        request_id: results.request_id,
        status: results.status,
        shape: shape.clone(),
        narrative: format!("The report could not be rendered ({}). Raw results are attached.", error),
        narrative_source: NarrativeSource::None,
        figures: Vec::new(),
        markers: Vec::new(),
        table: None,
        body: None,
        recommendations: Vec::new(),
        degraded: true,
        raw: Some(results.clone()),
    }
}

//
// ================= Advisories =================
//

fn exact(figures: &[ReportedFigure], label: &str) -> Option<Decimal> {
    figures
        .iter()
        .find(|f| f.figure.label == label)
        .and_then(|f| f.figure.value.amount())
}

fn recommendation(title: &str, owner: &str, priority: &str, kpi: &str) -> Recommendation {
    Recommendation {
        title: title.to_string(),
        owner: owner.to_string(),
        priority: priority.to_string(),
        kpi: kpi.to_string(),
    }
}

/// Fixed working-capital thresholds. Only exact figures trigger them.
pub fn advisories(figures: &[ReportedFigure]) -> Vec<Recommendation> {
    let mut out = Vec::new();
    if exact(figures, "DSO").map_or(false, |v| v > Decimal::from(45)) {
        out.push(recommendation("Collections campaign for the top-10 customers", "Accounts receivable", "P1", "DSO"));
    }
    if exact(figures, "DPO").map_or(false, |v| v < Decimal::from(40)) {
        out.push(recommendation("Renegotiate terms with 3 key suppliers", "Accounts payable", "P2", "DPO"));
    }
    if exact(figures, "CCC").map_or(false, |v| v > Decimal::from(20)) {
        out.push(recommendation("Freeze non-essential spend for 30 days", "Administration", "P1", "CCC"));
    }
    if exact(figures, "AR/AP ratio").map_or(false, |v| v > Decimal::new(130, 2)) {
        out.push(recommendation("Weekly AR/AP cash-flow sync", "Administration", "P3", "CCC"));
    }
    out
}

//
// ================= Template narrator =================
//

#[derive(Debug, Clone, Copy, Default)]
pub struct TemplateNarrator;

impl TemplateNarrator {
    pub fn new() -> Self {
        Self
    }

    /// Deterministic rendering, shared with `LlmNarrator`
    pub fn compose(&self, results: &ResultSet, shape: &OutputShape) -> Result<Report> {
        let payload = serde_json::to_value(results)?;
        validate_ref(&payload, &result_set_schema(), "narrator")?;

        if let OutputShape::Unsupported(name) = shape {
            return Err(OrchestrationError::NarrationError(format!(
                "unsupported output shape '{}'",
                name
            )));
        }

        let figures: Vec<ReportedFigure> = results
            .figures()
            .map(|(result, figure)| ReportedFigure {
                figure: figure.clone(),
                formatted: format_figure(figure),
                provenance: result.provenance.clone(),
            })
            .collect();

        let markers: Vec<BranchMarker> = results
            .unsuccessful()
            .map(|r| BranchMarker {
                task_id: r.task_id.clone(),
                capability_name: r.provenance.capability_name.clone(),
                status: r.status,
                reason: r.error.clone(),
            })
            .collect();

        let recommendations = advisories(&figures);
        let narrative = summary(results, &figures, &markers, &recommendations);

        let (table, body) = match shape {
            OutputShape::Table => (Some(markdown_table(&figures, &markers)), None),
            OutputShape::Json => (None, Some(json_body(results, &figures, &markers, &recommendations)?)),
            _ => (None, None),
        };

        Ok(Report {
            request_id: results.request_id,
            status: results.status,
            shape: shape.clone(),
            narrative,
            narrative_source: NarrativeSource::Template,
            figures,
            markers,
            table,
            body,
            recommendations,
            degraded: false,
            raw: None,
        })
    }
}

#[async_trait]
impl Narrator for TemplateNarrator {
    async fn render(&self, results: &ResultSet, shape: &OutputShape) -> Result<Report> {
        self.compose(results, shape)
    }
}

fn summary(
    results: &ResultSet,
    figures: &[ReportedFigure],
    markers: &[BranchMarker],
    recommendations: &[Recommendation],
) -> String {
    let mut out = String::new();

    if figures.is_empty() {
        out.push_str(&format!("No figures could be computed (request {}).", results.status));
    } else {
        let parts: Vec<String> = figures
            .iter()
            .map(|f| format!("{} {}", f.figure.label, f.formatted))
            .collect();
        out.push_str(&format!("{}.", parts.join("; ")));
    }

    for f in figures.iter().filter(|f| !f.figure.breakdown.is_empty()) {
        out.push_str(&format!("\n\n{}:", f.figure.label));
        for line in &f.figure.breakdown {
            out.push_str(&format!("\n- {}", format_line(line, f.figure.currency.as_deref())));
        }
    }

    if results.timed_out {
        out.push_str(" The request ran out of time before every task finished.");
    }

    if !markers.is_empty() {
        out.push_str("\n\nNot available:");
        for m in markers {
            out.push_str(&format!(
                "\n- {} ({}): {}",
                m.task_id,
                m.status,
                m.reason.as_deref().unwrap_or("no reason recorded")
            ));
        }
    }

    if !recommendations.is_empty() {
        out.push_str("\n\nRecommended actions:");
        for r in recommendations {
            out.push_str(&format!("\n- [{}] {} (owner: {}, KPI: {})", r.priority, r.title, r.owner, r.kpi));
        }
    }

    out
}

fn markdown_table(figures: &[ReportedFigure], markers: &[BranchMarker]) -> String {
    let mut out = String::from("| Figure | Value | Task |\n|--------|-------|------|\n");
    for f in figures {
        out.push_str(&format!("| {} | {} | {} |\n", f.figure.label, f.formatted, f.provenance.task_id));
        for line in &f.figure.breakdown {
            out.push_str(&format!(
                "| {} | {} | {} |\n",
                f.figure.label,
                format_line(line, f.figure.currency.as_deref()),
                f.provenance.task_id
            ));
        }
    }
    for m in markers {
        out.push_str(&format!(
            "| {} | {} ({}) | {} |\n",
            m.capability_name,
            format::NOT_AVAILABLE,
            m.status,
            m.task_id
        ));
    }
    out
}

fn json_body(
    results: &ResultSet,
    figures: &[ReportedFigure],
    markers: &[BranchMarker],
    recommendations: &[Recommendation],
) -> Result<Value> {
    let figures: Vec<Value> = figures
        .iter()
        .map(|f| {
            json!({
                "label": f.figure.label,
                "value": f.figure.value,
                "currency": f.figure.currency,
                "unit": f.figure.unit,
                "formatted": f.formatted,
                "breakdown": f.figure.breakdown,
                "task_id": f.provenance.task_id,
                "inputs": f.provenance.inputs,
            })
        })
        .collect();

    Ok(json!({
        "request_id": results.request_id,
        "status": results.status,
        "figures": figures,
        "unavailable": serde_json::to_value(markers)?,
        "recommendations": serde_json::to_value(recommendations)?,
        "snapshot_digest": results.snapshot_digest,
    }))
}

//
// ================= Model-worded narrator =================
//

lazy_static! {
    static ref NUMBER: Regex = Regex::new(r"(\(\s*)?([-−]\s?)?(\d[\d,]*(?:\.\d+)?)(\s*\))?").unwrap();
}

fn normalise(number: &str) -> Option<Decimal> {
    Decimal::from_str(&number.replace(',', "")).ok().map(|d| d.normalize())
}

/// Signed numbers in `text`, as written and as values. A minus joining two
/// words ("top-10", "0-30") or opening a list item is not a sign; `(13.25)`
/// reads as negative.
fn signed_numbers(text: &str) -> Vec<(String, Option<Decimal>)> {
    NUMBER
        .captures_iter(text)
        .filter_map(|caps| {
            let whole = caps.get(0)?;
            let digits = caps.get(3)?.as_str().trim_end_matches(',');
            let joined = text[..whole.start()]
                .chars()
                .next_back()
                .map_or(false, char::is_alphanumeric);
            let bullet = caps.get(2).map_or(false, |m| {
                m.as_str().chars().count() > 1
                    && text[..m.start()]
                        .trim_end_matches(|c: char| c == ' ' || c == '\t')
                        .chars()
                        .next_back()
                        .map_or(true, |c| c == '\n')
            });
            let minus = caps.get(2).is_some() && !joined && !bullet;
            let bracketed = caps.get(1).is_some() && caps.get(4).is_some();
            let negative = minus || bracketed;

            let value = normalise(digits).map(|d| if negative { -d } else { d });
            let shown = if negative { format!("-{}", digits) } else { digits.to_string() };
            Some((shown, value))
        })
        .collect()
}

/// Every number the prose is allowed to mention, with its sign: each figure
/// at the precisions it can be shown in, plus whatever the template text states.
fn allowed_numbers(template: &Report) -> HashSet<Decimal> {
    let mut allowed = HashSet::new();
    for f in &template.figures {
        for line in &f.figure.breakdown {
            allow_amount(&mut allowed, line.amount);
        }
        if let Some(amount) = f.figure.value.amount() {
            allow_amount(&mut allowed, amount);
            if f.figure.unit == Unit::Ratio {
                allowed.insert((amount * Decimal::from(100)).round_dp(1).normalize());
                allowed.insert((amount * Decimal::from(100)).round_dp(2).normalize());
            }
        }
    }
    for (_, value) in signed_numbers(&template.narrative) {
        if let Some(n) = value {
            allowed.insert(n);
        }
    }
    allowed
}

/// `amount` as stored and at every precision it can be shown in
fn allow_amount(allowed: &mut HashSet<Decimal>, amount: Decimal) {
    allowed.insert(amount.normalize());
    for dp in 0..=4 {
        if let Some(n) = normalise(&format_number(amount, dp)) {
            allowed.insert(n);
        }
    }
}

/// Numbers in `prose` that are not in `allowed`. Signs count: `13.2` is not
/// allowed when only `-13.2` is.
pub fn unknown_numbers(prose: &str, allowed: &HashSet<Decimal>) -> Vec<String> {
    signed_numbers(prose)
        .into_iter()
        .filter(|(_, value)| value.map_or(true, |n| !allowed.contains(&n)))
        .map(|(shown, _)| shown)
        .collect()
}

fn narrative_schema() -> Schema {
    Schema::object(vec![Field::required("narrative", Schema::String)])
}

/// Template rendering with the summary prose reworded by a model. Prose that
/// mentions a number the template does not is thrown away.
pub struct LlmNarrator {
    completion: Arc<dyn CompletionService>,
    template: TemplateNarrator,
}

impl LlmNarrator {
    pub fn new(completion: Arc<dyn CompletionService>) -> Self {
        Self {
            completion,
            template: TemplateNarrator::new(),
        }
    }

    fn build_prompt(report: &Report) -> String {
        let figures: Vec<String> = report
            .figures
            .iter()
            .map(|f| {
                let mut entry = format!("- {}: {}", f.figure.label, f.formatted);
                for line in &f.figure.breakdown {
                    entry.push_str(&format!("\n  - {}", format_line(line, f.figure.currency.as_deref())));
                }
                entry
            })
            .collect();
        format!(
            r#"Rewrite this finance summary as a short paragraph for an executive.
Use the figures exactly as written. Do not compute, estimate or introduce any other number.

Figures:
{figures}

Summary:
{summary}"#,
            figures = figures.join("\n"),
            summary = report.narrative,
        )
    }

    async fn reword(&self, report: &Report) -> Result<String> {
        let raw = self
            .completion
            .complete(&Self::build_prompt(report), &narrative_schema())
            .await?;
        let payload = validate(raw, &narrative_schema(), "narrator:llm")?;
        let prose = payload
            .get("narrative")
            .and_then(Value::as_str)
            .map(str::trim)
            .unwrap_or_default()
            .to_string();
        if prose.is_empty() {
            return Err(OrchestrationError::NarrationError("model returned empty prose".to_string()));
        }

        let unknown = unknown_numbers(&prose, &allowed_numbers(report));
        if !unknown.is_empty() {
            return Err(OrchestrationError::NarrationError(format!(
                "model prose mentions numbers not in the results: {}",
                unknown.join(", ")
            )));
        }
        Ok(prose)
    }
}

#[async_trait]
impl Narrator for LlmNarrator {
    async fn render(&self, results: &ResultSet, shape: &OutputShape) -> Result<Report> {
        let mut report = self.template.compose(results, shape)?;
        if report.figures.is_empty() {
            return Ok(report);
        }

        match self.reword(&report).await {
            Ok(prose) => {
                info!(request_id = %results.request_id, "Using model-worded narrative");
                report.narrative = prose;
                report.narrative_source = NarrativeSource::Llm;
            }
            Err(e) => {
                warn!(request_id = %results.request_id, error = %e, "Keeping template narrative");
            }
        }
        Ok(report)
    }
}
