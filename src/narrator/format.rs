//! Display formatting for figures. Formatting never changes the stored value.

use crate::models::{BreakdownLine, FigureValue, FinancialFigure, Unit};
use rust_decimal::{Decimal, RoundingStrategy};

pub const NOT_AVAILABLE: &str = "n/a";

/// Ratios are stored and shown at 4 decimals
pub const RATIO_DECIMALS: u32 = 4;

/// `1234567.891` with 2 decimals -> `1,234,567.89`
pub fn format_number(value: Decimal, decimals: u32) -> String {
    let rounded = value.round_dp_with_strategy(decimals, RoundingStrategy::MidpointNearestEven);
    let text = format!("{:.*}", decimals as usize, rounded);

    let (sign, digits) = match text.strip_prefix('-') {
        Some(rest) => ("-", rest),
        None => ("", text.as_str()),
    };
    let (int_part, frac_part) = match digits.split_once('.') {
        Some((i, f)) => (i, Some(f)),
        None => (digits, None),
    };

    let mut grouped = String::with_capacity(int_part.len() + int_part.len() / 3);
    for (i, ch) in int_part.chars().enumerate() {
        if i > 0 && (int_part.len() - i) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(ch);
    }

    match frac_part {
        Some(f) => format!("{}{}.{}", sign, grouped, f),
        None => format!("{}{}", sign, grouped),
    }
}

pub fn format_currency(amount: Decimal, currency: Option<&str>) -> String {
    match currency {
        Some(code) => format!("{} {}", code, format_number(amount, 2)),
        None => format_number(amount, 2),
    }
}

/// Day figures are stored at 2 decimals and shown at 2.
pub fn format_days(days: Decimal) -> String {
    format!("{} days", format_number(days, 2))
}

pub fn format_figure(figure: &FinancialFigure) -> String {
    let amount = match &figure.value {
        FigureValue::Exact { amount } => *amount,
        FigureValue::Undefined { .. } => return NOT_AVAILABLE.to_string(),
    };
    match figure.unit {
        Unit::Currency => format_currency(amount, figure.currency.as_deref()),
        Unit::Days => format_days(amount),
        Unit::Ratio => format_number(amount, RATIO_DECIMALS),
        Unit::Count => format_number(amount, 0),
    }
}

/// `1-30 days: USD 16,000.00 (1 document)` or
/// `A-17 (Acme): USD 4,000.00, due in 3 days`
pub fn format_line(line: &BreakdownLine, currency: Option<&str>) -> String {
    let amount = format_currency(line.amount, currency);
    let mut out = match &line.counterparty {
        Some(counterparty) => format!("{} ({}): {}", line.label, counterparty, amount),
        None => format!("{}: {}", line.label, amount),
    };
    match (line.status.as_deref(), line.days) {
        (Some("due"), Some(0)) => out.push_str(", due today"),
        (Some("due"), Some(days)) => out.push_str(&format!(", due in {}", plural(days, "day"))),
        (Some("overdue"), Some(days)) => out.push_str(&format!(", {} overdue", plural(days, "day"))),
        _ => {}
    }
    if let Some(n) = line.documents {
        out.push_str(&format!(" ({})", plural(i64::from(n), "document")));
    }
    out
}

fn plural(n: i64, noun: &str) -> String {
    if n == 1 {
        format!("1 {}", noun)
    } else {
        format!("{} {}s", n, noun)
    }
}
