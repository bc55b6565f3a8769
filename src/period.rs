//! Reporting-period resolution from request text
//!
//! Patterns are tried from most to least specific. When nothing matches the
//! current month is used and the period carries a `period_auto_default`
//! warning so the caller can tell the user what was assumed.

use chrono::{Datelike, Duration, NaiveDate};
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

pub const AUTO_DEFAULT_WARNING: &str = "period_auto_default";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Granularity {
    Day,
    Week,
    Month,
    Quarter,
    Range,
    Rolling30d,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PeriodSource {
    Text,
    Default,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Period {
    pub text: String,
    pub start: NaiveDate,
    pub end: NaiveDate,
    pub granularity: Granularity,
    pub source: PeriodSource,
    #[serde(default)]
    pub warning: Option<String>,
}

impl Period {
    fn new(text: impl Into<String>, start: NaiveDate, end: NaiveDate, granularity: Granularity) -> Self {
        Self {
            text: text.into(),
            start,
            end,
            granularity,
            source: PeriodSource::Text,
            warning: None,
        }
    }

    fn month(text: impl Into<String>, year: i32, month: u32) -> Option<Self> {
        let start = NaiveDate::from_ymd_opt(year, month, 1)?;
        Some(Self::new(text, start, end_of_month(start)?, Granularity::Month))
    }

    /// Inclusive length in days
    pub fn days(&self) -> i64 {
        (self.end - self.start).num_days() + 1
    }

    /// The `start`/`end` pair injected into connector parameters
    pub fn as_parameters(&self) -> Value {
        json!({
            "start": self.start.format("%Y-%m-%d").to_string(),
            "end": self.end.format("%Y-%m-%d").to_string(),
        })
    }
}

lazy_static! {
    static ref ISO_RANGE: Regex = Regex::new(
        r"(?:from|between|desde|del)?\s*(\d{4}-\d{2}-\d{2})\s*(?:to|and|until|through|al|hasta|a|-)\s*(\d{4}-\d{2}-\d{2})"
    ).unwrap();
    static ref SPANISH_DAY_RANGE: Regex = Regex::new(
        r"del?\s*(\d{1,2})\s*al?\s*(\d{1,2})\s*de?\s*([a-záéíóú]+)(?:\s*de?\s*(\d{4}))?"
    ).unwrap();
    static ref ISO_DATE: Regex = Regex::new(r"\b(\d{4})-(\d{2})-(\d{2})\b").unwrap();
    static ref YEAR_MONTH: Regex = Regex::new(r"\b(\d{4})-(\d{2})\b").unwrap();
    static ref SLASH_DATE: Regex = Regex::new(r"\b(\d{1,2})/(\d{1,2})/(\d{2,4})\b").unwrap();
    static ref SPANISH_DATE: Regex = Regex::new(
        r"\b(\d{1,2})\s+de\s+([a-záéíóú]+)(?:\s+de\s+(\d{4}))?\b"
    ).unwrap();
    static ref QUARTER: Regex = Regex::new(r"\bq([1-4])\s*(\d{4})\b").unwrap();
    static ref MONTH_YEAR: Regex = Regex::new(r"\b([a-záéíóú]+)\s+(?:de\s+|of\s+)?(\d{4})\b").unwrap();
    static ref WORD: Regex = Regex::new(r"[a-záéíóú]+").unwrap();
}

/// Month number for an English or Spanish month name
pub fn month_from_name(name: &str) -> Option<u32> {
    let month = match name {
        "january" | "jan" | "enero" => 1,
        "february" | "feb" | "febrero" => 2,
        "march" | "mar" | "marzo" => 3,
        "april" | "apr" | "abril" => 4,
        "may" | "mayo" => 5,
        "june" | "jun" | "junio" => 6,
        "july" | "jul" | "julio" => 7,
        "august" | "aug" | "agosto" => 8,
        "september" | "sep" | "sept" | "septiembre" | "setiembre" => 9,
        "october" | "oct" | "octubre" => 10,
        "november" | "nov" | "noviembre" => 11,
        "december" | "dec" | "diciembre" => 12,
        _ => return None,
    };
    Some(month)
}

/// Names that are also everyday English words are only trusted with a year
fn ambiguous_alone(name: &str) -> bool {
    matches!(name, "may" | "march" | "mar" | "jan" | "dec" | "sep" | "oct" | "nov" | "jun" | "jul" | "aug" | "apr" | "feb")
}

fn end_of_month(first: NaiveDate) -> Option<NaiveDate> {
    let (y, m) = if first.month() == 12 {
        (first.year() + 1, 1)
    } else {
        (first.year(), first.month() + 1)
    };
    NaiveDate::from_ymd_opt(y, m, 1)?.pred_opt()
}

fn parse_iso(s: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(s, "%Y-%m-%d").ok()
}

/// Resolve the period mentioned in `text`, relative to `today`.
pub fn resolve_period(text: &str, today: NaiveDate) -> Period {
    let text = text.to_lowercase();
    let text = text.trim();

    explicit_range(text, today)
        .or_else(|| single_date(text, today))
        .or_else(|| quarter(text))
        .or_else(|| month_name(text, today))
        .or_else(|| relative(text, today))
        .unwrap_or_else(|| default_period(today))
}

/// The current month, flagged as assumed
pub fn default_period(today: NaiveDate) -> Period {
    let start = today.with_day(1).unwrap_or(today);
    let end = end_of_month(start).unwrap_or(today);
    Period {
        text: "auto: current month".to_string(),
        start,
        end,
        granularity: Granularity::Month,
        source: PeriodSource::Default,
        warning: Some(AUTO_DEFAULT_WARNING.to_string()),
    }
}

fn explicit_range(text: &str, today: NaiveDate) -> Option<Period> {
    if let Some(c) = ISO_RANGE.captures(text) {
        let start = parse_iso(&c[1])?;
        let end = parse_iso(&c[2])?;
        if start <= end {
            return Some(Period::new(c[0].trim(), start, end, Granularity::Range));
        }
    }

    let c = SPANISH_DAY_RANGE.captures(text)?;
    let month = month_from_name(&c[3])?;
    let year = match c.get(4) {
        Some(y) => y.as_str().parse().ok()?,
        None => today.year(),
    };
    let start = NaiveDate::from_ymd_opt(year, month, c[1].parse().ok()?)?;
    let end = NaiveDate::from_ymd_opt(year, month, c[2].parse().ok()?)?;
    (start <= end).then(|| Period::new(c[0].trim(), start, end, Granularity::Range))
}

/// A single date selects the whole month it falls in
fn single_date(text: &str, today: NaiveDate) -> Option<Period> {
    if let Some(c) = ISO_DATE.captures(text) {
        if let Some(date) = parse_iso(&c[0]) {
            return Period::month(format!("date:{}", date), date.year(), date.month());
        }
    }

    if let Some(c) = YEAR_MONTH.captures(text) {
        let year: i32 = c[1].parse().ok()?;
        let month: u32 = c[2].parse().ok()?;
        if (1..=12).contains(&month) {
            return Period::month(format!("{:04}-{:02}", year, month), year, month);
        }
    }

    if let Some(c) = SLASH_DATE.captures(text) {
        let day: u32 = c[1].parse().ok()?;
        let month: u32 = c[2].parse().ok()?;
        let mut year: i32 = c[3].parse().ok()?;
        if year < 100 {
            year += 2000;
        }
        if let Some(date) = NaiveDate::from_ymd_opt(year, month, day) {
            return Period::month(format!("date:{}", date), year, month);
        }
    }

    let c = SPANISH_DATE.captures(text)?;
    let month = month_from_name(&c[2])?;
    let year = match c.get(3) {
        Some(y) => y.as_str().parse().ok()?,
        None => today.year(),
    };
    let date = NaiveDate::from_ymd_opt(year, month, c[1].parse().ok()?)?;
    Period::month(format!("date:{}", date), year, month)
}

fn quarter(text: &str) -> Option<Period> {
    let c = QUARTER.captures(text)?;
    let q: u32 = c[1].parse().ok()?;
    let year: i32 = c[2].parse().ok()?;
    let start = NaiveDate::from_ymd_opt(year, (q - 1) * 3 + 1, 1)?;
    let last_month_start = NaiveDate::from_ymd_opt(year, q * 3, 1)?;
    Some(Period::new(c[0].to_string(), start, end_of_month(last_month_start)?, Granularity::Quarter))
}

fn month_name(text: &str, today: NaiveDate) -> Option<Period> {
    for c in MONTH_YEAR.captures_iter(text) {
        if let Some(month) = month_from_name(&c[1]) {
            let year: i32 = c[2].parse().ok()?;
            return Period::month(c[0].to_string(), year, month);
        }
    }

    // A bare month later than next month is taken to mean last year's
    let name = WORD
        .find_iter(text)
        .map(|m| m.as_str())
        .find(|w| month_from_name(w).is_some() && !ambiguous_alone(w))?;
    let month = month_from_name(name)?;
    let year = if month > today.month() + 1 {
        today.year() - 1
    } else {
        today.year()
    };
    Period::month(name, year, month)
}

fn relative(text: &str, today: NaiveDate) -> Option<Period> {
    let has = |needles: &[&str]| needles.iter().any(|n| text.contains(n));

    if has(&["this week", "esta semana"]) {
        let start = today - Duration::days(today.weekday().num_days_from_monday() as i64);
        return Some(Period::new("this week", start, start + Duration::days(6), Granularity::Week));
    }
    if has(&["this month", "este mes"]) {
        return Period::month("this month", today.year(), today.month());
    }
    if has(&["last month", "previous month", "mes pasado"]) {
        let (y, m) = if today.month() == 1 {
            (today.year() - 1, 12)
        } else {
            (today.year(), today.month() - 1)
        };
        return Period::month("last month", y, m);
    }
    if has(&["today", "hoy"]) {
        return Some(Period::new("today", today, today, Granularity::Day));
    }
    if has(&["last 30 days", "past 30 days", "últimos 30 días", "ultimos 30 dias"]) {
        return Some(Period::new(
            "last 30 days",
            today - Duration::days(29),
            today,
            Granularity::Rolling30d,
        ));
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn day(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn today() -> NaiveDate {
        day(2025, 6, 18)
    }

    #[test]
    fn test_explicit_iso_range() {
        let p = resolve_period("DSO from 2025-01-01 to 2025-03-31", today());
        assert_eq!((p.start, p.end), (day(2025, 1, 1), day(2025, 3, 31)));
        assert_eq!(p.granularity, Granularity::Range);
        assert_eq!(p.days(), 90);
    }

    #[test]
    fn test_spanish_day_range() {
        let p = resolve_period("ventas del 5 al 20 de octubre de 2024", today());
        assert_eq!((p.start, p.end), (day(2024, 10, 5), day(2024, 10, 20)));
    }

    #[test]
    fn test_single_dates_select_their_month() {
        let p = resolve_period("receivables as of 2025-02-14", today());
        assert_eq!((p.start, p.end), (day(2025, 2, 1), day(2025, 2, 28)));

        let p = resolve_period("saldo al 29/10/25", today());
        assert_eq!((p.start, p.end), (day(2025, 10, 1), day(2025, 10, 31)));

        let p = resolve_period("sales in 2024-02", today());
        assert_eq!(p.end, day(2024, 2, 29));
    }

    #[test]
    fn test_quarter() {
        let p = resolve_period("DPO for Q4 2024", today());
        assert_eq!((p.start, p.end), (day(2024, 10, 1), day(2024, 12, 31)));
        assert_eq!(p.granularity, Granularity::Quarter);
    }

    #[test]
    fn test_month_names() {
        let p = resolve_period("DSO for March 2025", today());
        assert_eq!((p.start, p.end), (day(2025, 3, 1), day(2025, 3, 31)));

        let p = resolve_period("cuentas por cobrar de agosto 2024", today());
        assert_eq!(p.start, day(2024, 8, 1));

        // bare month far in the future rolls back a year
        let p = resolve_period("ventas de noviembre", today());
        assert_eq!(p.start, day(2024, 11, 1));

        let p = resolve_period("sales for july", today());
        assert_eq!(p.start, day(2025, 7, 1));
    }

    #[test]
    fn test_may_as_a_verb_is_not_a_month() {
        let p = resolve_period("what may our DSO be", today());
        assert_eq!(p.source, PeriodSource::Default);
    }

    #[test]
    fn test_relative_periods() {
        let p = resolve_period("payables this week", today());
        assert_eq!((p.start, p.end), (day(2025, 6, 16), day(2025, 6, 22)));

        let p = resolve_period("last month", day(2025, 1, 10));
        assert_eq!((p.start, p.end), (day(2024, 12, 1), day(2024, 12, 31)));

        let p = resolve_period("ventas de los últimos 30 días", today());
        assert_eq!(p.days(), 30);
    }

    #[test]
    fn test_default_is_current_month_with_warning() {
        let p = resolve_period("what is our DSO", today());
        assert_eq!((p.start, p.end), (day(2025, 6, 1), day(2025, 6, 30)));
        assert_eq!(p.warning.as_deref(), Some(AUTO_DEFAULT_WARNING));
        assert_eq!(p.as_parameters(), json!({"start": "2025-06-01", "end": "2025-06-30"}));
    }
}
