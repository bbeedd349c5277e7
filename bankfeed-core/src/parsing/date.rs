//! Date presets
//!
//! A value is accepted by a preset only when it matches the preset's shape,
//! chrono can build a real calendar date from it, and the year falls inside
//! [`MIN_YEAR`, `MAX_YEAR`]. The year bound throws out garbage that happens
//! to look like a date (account numbers, reference codes).

use std::sync::OnceLock;

use chrono::{Datelike, NaiveDate};
use regex::Regex;

use super::{non_empty, pick_best, FormatDetection};

pub const MIN_YEAR: i32 = 1990;
pub const MAX_YEAR: i32 = 2100;

/// Share of samples a date preset must parse to be proposed
pub const DATE_DETECTION_THRESHOLD: f64 = 0.5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DateFormat {
    pub id: &'static str,
    pub example: &'static str,
    pattern: &'static str,
    chrono_format: Option<&'static str>,
}

/// Presets in priority order. `parse_date_any` walks this list top to bottom.
pub const DATE_FORMATS: &[DateFormat] = &[
    DateFormat {
        id: "iso",
        example: "2024-03-15",
        pattern: r"^\d{4}-\d{2}-\d{2}$",
        chrono_format: Some("%Y-%m-%d"),
    },
    DateFormat {
        id: "iso-datetime",
        example: "2024-03-15T08:30:00Z",
        pattern: r"^\d{4}-\d{2}-\d{2}[T ]\d{2}:\d{2}(:\d{2}(\.\d+)?)?(Z|[+-]\d{2}:?\d{2})?$",
        chrono_format: None,
    },
    DateFormat {
        id: "de",
        example: "15.03.2024",
        pattern: r"^\d{1,2}\.\d{1,2}\.\d{4}$",
        chrono_format: Some("%d.%m.%Y"),
    },
    DateFormat {
        id: "de-short",
        example: "15.03.24",
        pattern: r"^\d{1,2}\.\d{1,2}\.\d{2}$",
        chrono_format: Some("%d.%m.%y"),
    },
    DateFormat {
        id: "us",
        example: "03/15/2024",
        pattern: r"^\d{1,2}/\d{1,2}/\d{4}$",
        chrono_format: Some("%m/%d/%Y"),
    },
    DateFormat {
        id: "eu-slash",
        example: "15/03/2024",
        pattern: r"^\d{1,2}/\d{1,2}/\d{4}$",
        chrono_format: Some("%d/%m/%Y"),
    },
    DateFormat {
        id: "dash",
        example: "15-03-2024",
        pattern: r"^\d{1,2}-\d{1,2}-\d{4}$",
        chrono_format: Some("%d-%m-%Y"),
    },
    DateFormat {
        id: "text-month",
        example: "15 Mar 2024",
        pattern: r"^(\d{1,2})[ .\-]+([A-Za-zäÄ]{3,9})\.?[ .\-]+(\d{4})$",
        chrono_format: None,
    },
];

fn compiled() -> &'static Vec<Regex> {
    static R: OnceLock<Vec<Regex>> = OnceLock::new();
    R.get_or_init(|| {
        DATE_FORMATS
            .iter()
            .map(|f| Regex::new(f.pattern).expect("invalid date pattern"))
            .collect()
    })
}

fn preset(format_id: &str) -> Option<(usize, &'static DateFormat)> {
    DATE_FORMATS.iter().enumerate().find(|(_, f)| f.id == format_id)
}

/// Parse `value` with one named preset
pub fn parse_date(value: &str, format_id: &str) -> Option<NaiveDate> {
    let (idx, fmt) = preset(format_id)?;
    parse_with(value.trim(), idx, fmt)
}

/// Parse `value` with the first preset that accepts it
pub fn parse_date_any(value: &str) -> Option<(NaiveDate, &'static str)> {
    let value = value.trim();
    DATE_FORMATS
        .iter()
        .enumerate()
        .find_map(|(idx, fmt)| parse_with(value, idx, fmt).map(|d| (d, fmt.id)))
}

/// Score every preset against `samples` and return the best one
pub fn detect_date_format<S: AsRef<str>>(
    samples: &[S],
    regional_default: &str,
) -> Option<FormatDetection> {
    let values = non_empty(samples);
    if values.is_empty() {
        return None;
    }

    let scores: Vec<(&'static str, f64)> = DATE_FORMATS
        .iter()
        .enumerate()
        .map(|(idx, fmt)| {
            let hits = values
                .iter()
                .filter(|v| parse_with(v, idx, fmt).is_some())
                .count();
            (fmt.id, hits as f64 / values.len() as f64)
        })
        .collect();

    pick_best(&scores, DATE_DETECTION_THRESHOLD, regional_default)
}

fn parse_with(value: &str, idx: usize, fmt: &DateFormat) -> Option<NaiveDate> {
    let re = &compiled()[idx];
    let date = match (fmt.id, fmt.chrono_format) {
        ("iso-datetime", _) => {
            if !re.is_match(value) {
                return None;
            }
            NaiveDate::parse_from_str(&value[..10], "%Y-%m-%d").ok()?
        }
        ("text-month", _) => {
            let caps = re.captures(value)?;
            let day: u32 = caps[1].parse().ok()?;
            let month = month_from_name(&caps[2])?;
            let year: i32 = caps[3].parse().ok()?;
            NaiveDate::from_ymd_opt(year, month, day)?
        }
        (_, Some(chrono_format)) => {
            if !re.is_match(value) {
                return None;
            }
            NaiveDate::parse_from_str(value, chrono_format).ok()?
        }
        (_, None) => return None,
    };

    if (MIN_YEAR..=MAX_YEAR).contains(&date.year()) {
        Some(date)
    } else {
        None
    }
}

/// English and German month names, full or abbreviated
fn month_from_name(name: &str) -> Option<u32> {
    let lower = name.to_lowercase();
    let key: String = lower.chars().take(3).collect();
    let month = match key.as_str() {
        "jan" | "jän" => 1,
        "feb" => 2,
        "mar" | "mär" | "mrz" => 3,
        "apr" => 4,
        "may" | "mai" => 5,
        "jun" => 6,
        "jul" => 7,
        "aug" => 8,
        "sep" => 9,
        "oct" | "okt" => 10,
        "nov" => 11,
        "dec" | "dez" => 12,
        _ => return None,
    };
    Some(month)
}
