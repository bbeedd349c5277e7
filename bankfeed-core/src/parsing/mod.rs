//! Value parsers for CSV cells
//!
//! Dates and amounts arrive in whatever format the exporting bank chose.
//! Each parser is a list of named presets; a preset id is what gets stored in
//! a field mapping so later imports can parse without re-detecting.

pub mod amount;
pub mod date;

use serde::{Deserialize, Serialize};

pub use amount::{
    decimal_to_minor, detect_amount_format, format_amount, format_amount_with_currency, parse_amount,
    AmountFormat, CurrencyPosition, NegativeFormat, AMOUNT_FORMATS,
};
pub use date::{detect_date_format, parse_date, parse_date_any, DateFormat, DATE_FORMATS};

/// Outcome of scoring every preset against a set of sample values
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FormatDetection {
    pub format_id: String,
    /// Share of non-empty samples the preset parsed, 0.0..=1.0
    pub score: f64,
}

/// Regional default used to break ties between equally scoring presets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Region {
    #[default]
    De,
    Ch,
    Fr,
    Gb,
    Us,
}

impl Region {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "de" | "at" => Some(Self::De),
            "ch" => Some(Self::Ch),
            "fr" | "be" => Some(Self::Fr),
            "gb" | "uk" | "ie" => Some(Self::Gb),
            "us" | "en" => Some(Self::Us),
            _ => None,
        }
    }

    pub fn default_date_format(&self) -> &'static str {
        match self {
            Self::De | Self::Ch => "de",
            Self::Fr | Self::Gb => "eu-slash",
            Self::Us => "us",
        }
    }

    pub fn default_amount_format(&self) -> &'static str {
        match self {
            Self::De => "de",
            Self::Ch => "ch",
            Self::Fr => "fr",
            Self::Gb | Self::Us => "en",
        }
    }
}

/// Pick the best preset from `(id, score)` pairs listed in priority order.
///
/// Returns `None` when no preset reaches `threshold`. Among presets sharing
/// the top score the regional default wins, otherwise the earliest listed.
pub(crate) fn pick_best(
    scores: &[(&'static str, f64)],
    threshold: f64,
    regional_default: &str,
) -> Option<FormatDetection> {
    let best = scores.iter().map(|(_, s)| *s).fold(0.0_f64, f64::max);
    if best < threshold || best == 0.0 {
        return None;
    }

    let tied: Vec<&'static str> = scores
        .iter()
        .filter(|(_, s)| (*s - best).abs() < f64::EPSILON)
        .map(|(id, _)| *id)
        .collect();

    let format_id = if tied.contains(&regional_default) {
        regional_default
    } else {
        tied[0]
    };

    Some(FormatDetection {
        format_id: format_id.to_string(),
        score: best,
    })
}

/// Non-empty trimmed samples, the denominator of every detection score
pub(crate) fn non_empty<'a, S: AsRef<str>>(samples: &'a [S]) -> Vec<&'a str> {
    samples
        .iter()
        .map(|s| s.as_ref().trim())
        .filter(|s| !s.is_empty())
        .collect()
}
