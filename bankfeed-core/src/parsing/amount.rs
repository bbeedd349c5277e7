//! Amount presets
//!
//! Parsing strips currency symbols and codes, resolves the sign, validates
//! digit grouping against the preset and converts to integer minor units via
//! `Decimal`. Floating point never touches an amount.

use std::str::FromStr;
use std::sync::OnceLock;

use regex::Regex;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};

use super::{non_empty, pick_best, FormatDetection};

/// Share of samples an amount preset must parse to be proposed
pub const AMOUNT_DETECTION_THRESHOLD: f64 = 0.7;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NegativeFormat {
    Minus,
    Parentheses,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CurrencyPosition {
    Before,
    After,
    None,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AmountFormat {
    pub id: &'static str,
    pub decimal_separator: char,
    /// Accepted grouping characters; the first one is used when formatting
    pub thousands_separators: &'static str,
    pub negative_format: NegativeFormat,
    pub currency_position: CurrencyPosition,
}

pub const AMOUNT_FORMATS: &[AmountFormat] = &[
    AmountFormat {
        id: "de",
        decimal_separator: ',',
        thousands_separators: ".",
        negative_format: NegativeFormat::Minus,
        currency_position: CurrencyPosition::After,
    },
    AmountFormat {
        id: "en",
        decimal_separator: '.',
        thousands_separators: ",",
        negative_format: NegativeFormat::Minus,
        currency_position: CurrencyPosition::Before,
    },
    AmountFormat {
        id: "ch",
        decimal_separator: '.',
        thousands_separators: "'’",
        negative_format: NegativeFormat::Minus,
        currency_position: CurrencyPosition::Before,
    },
    AmountFormat {
        id: "fr",
        decimal_separator: ',',
        thousands_separators: " \u{a0}\u{202f}",
        negative_format: NegativeFormat::Minus,
        currency_position: CurrencyPosition::After,
    },
    AmountFormat {
        id: "en-accounting",
        decimal_separator: '.',
        thousands_separators: ",",
        negative_format: NegativeFormat::Parentheses,
        currency_position: CurrencyPosition::Before,
    },
    AmountFormat {
        id: "plain",
        decimal_separator: '.',
        thousands_separators: "",
        negative_format: NegativeFormat::Minus,
        currency_position: CurrencyPosition::None,
    },
];

pub fn amount_format(format_id: &str) -> Option<&'static AmountFormat> {
    AMOUNT_FORMATS.iter().find(|f| f.id == format_id)
}

fn currency_regex() -> &'static Regex {
    static R: OnceLock<Regex> = OnceLock::new();
    R.get_or_init(|| {
        Regex::new(r"SFr\.?|Fr\.|\b[A-Z]{3}\b|[€$£¥₹]").expect("invalid currency pattern")
    })
}

fn number_regexes() -> &'static Vec<Regex> {
    static R: OnceLock<Vec<Regex>> = OnceLock::new();
    R.get_or_init(|| {
        AMOUNT_FORMATS
            .iter()
            .map(|f| {
                let dec = regex::escape(&f.decimal_separator.to_string());
                let pattern = if f.thousands_separators.is_empty() {
                    format!(r"^(\d+)(?:{dec}(\d+))?$")
                } else {
                    let group = regex::escape(f.thousands_separators);
                    format!(r"^(\d{{1,3}}(?:[{group}]\d{{3}})+|\d+)(?:{dec}(\d+))?$")
                };
                Regex::new(&pattern).expect("invalid amount pattern")
            })
            .collect()
    })
}

/// Parse `value` with one preset, returning signed minor units.
///
/// Both negative conventions are accepted regardless of the preset's
/// `negative_format`: a leading or trailing minus, or surrounding parentheses.
pub fn parse_amount(value: &str, format_id: &str) -> Option<i64> {
    let idx = AMOUNT_FORMATS.iter().position(|f| f.id == format_id)?;
    parse_with(value, idx)
}

fn parse_with(value: &str, idx: usize) -> Option<i64> {
    let stripped = currency_regex().replace_all(value, "");
    let mut s = stripped.trim();
    if s.is_empty() {
        return None;
    }

    let mut negative = false;
    if s.starts_with('(') && s.ends_with(')') {
        negative = true;
        s = s[1..s.len() - 1].trim();
    }
    if let Some(rest) = s.strip_prefix('-').or_else(|| s.strip_prefix('−')) {
        negative = true;
        s = rest.trim_start();
    } else if let Some(rest) = s.strip_prefix('+') {
        s = rest.trim_start();
    }
    if let Some(rest) = s.strip_suffix('-').or_else(|| s.strip_suffix('−')) {
        negative = true;
        s = rest.trim_end();
    }

    let caps = number_regexes()[idx].captures(s)?;
    let fmt = &AMOUNT_FORMATS[idx];
    let integer: String = caps[1]
        .chars()
        .filter(|c| !fmt.thousands_separators.contains(*c))
        .collect();
    let normalized = match caps.get(2) {
        Some(frac) => format!("{}.{}", integer, frac.as_str()),
        None => integer,
    };

    let minor = decimal_to_minor(Decimal::from_str(&normalized).ok()?)?;
    Some(if negative { -minor } else { minor })
}

/// Major-unit decimal to minor units, half away from zero
pub fn decimal_to_minor(value: Decimal) -> Option<i64> {
    value
        .checked_mul(Decimal::ONE_HUNDRED)?
        .round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero)
        .to_i64()
}

/// Render minor units in a preset's notation, without a currency marker
pub fn format_amount(minor: i64, format_id: &str) -> Option<String> {
    let fmt = amount_format(format_id)?;
    let abs = minor.unsigned_abs();
    let integer = group_digits(&(abs / 100).to_string(), fmt.thousands_separators.chars().next());
    let body = format!("{}{}{:02}", integer, fmt.decimal_separator, abs % 100);

    Some(if minor < 0 {
        match fmt.negative_format {
            NegativeFormat::Minus => format!("-{}", body),
            NegativeFormat::Parentheses => format!("({})", body),
        }
    } else {
        body
    })
}

/// Render minor units with the currency placed where the preset puts it
pub fn format_amount_with_currency(minor: i64, currency: &str, format_id: &str) -> Option<String> {
    let fmt = amount_format(format_id)?;
    let body = format_amount(minor, format_id)?;
    Some(match fmt.currency_position {
        CurrencyPosition::Before => format!("{} {}", currency, body),
        CurrencyPosition::After => format!("{} {}", body, currency),
        CurrencyPosition::None => body,
    })
}

fn group_digits(digits: &str, separator: Option<char>) -> String {
    let Some(sep) = separator else {
        return digits.to_string();
    };
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, c) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(sep);
        }
        out.push(c);
    }
    out
}

/// Score every preset against `samples` and return the best one
pub fn detect_amount_format<S: AsRef<str>>(
    samples: &[S],
    regional_default: &str,
) -> Option<FormatDetection> {
    let values = non_empty(samples);
    if values.is_empty() {
        return None;
    }

    let scores: Vec<(&'static str, f64)> = AMOUNT_FORMATS
        .iter()
        .enumerate()
        .map(|(idx, fmt)| {
            let hits = values.iter().filter(|v| parse_with(v, idx).is_some()).count();
            (fmt.id, hits as f64 / values.len() as f64)
        })
        .collect();

    pick_best(&scores, AMOUNT_DETECTION_THRESHOLD, regional_default)
}
