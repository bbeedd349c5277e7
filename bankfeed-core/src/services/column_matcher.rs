//! Column matcher - proposes CSV column to field assignments
//!
//! Passes run in order and each column takes the first hit:
//! 1. exact alias (confidence 1.0)
//! 2. fuzzy alias, similarity >= 0.70
//! 3. content detection on sample values
//!
//! A field is claimed by at most one column. Columns nothing matched stay in
//! the result as unmapped metadata.

use std::collections::{BTreeMap, HashSet};
use std::sync::OnceLock;

use regex::Regex;

use crate::domain::mapping::missing_required;
use crate::domain::{CanonicalField, FieldMapping, MatchMethod};
use crate::parsing::{detect_amount_format, detect_date_format, Region};

/// Minimum similarity for a fuzzy alias match
pub const FUZZY_THRESHOLD: f64 = 0.70;

/// Share of samples that must look like an IBAN
pub const IBAN_DETECTION_THRESHOLD: f64 = 0.5;

/// Header aliases per field, already normalized
const ALIASES: &[(CanonicalField, &[&str])] = &[
    (
        CanonicalField::Date,
        &[
            "date",
            "datum",
            "buchungsdatum",
            "buchungstag",
            "buchung",
            "valuta",
            "valutadatum",
            "wertstellung",
            "bookingdate",
            "transactiondate",
            "posteddate",
            "valuedate",
        ],
    ),
    (
        CanonicalField::Amount,
        &[
            "amount",
            "betrag",
            "betrageur",
            "umsatz",
            "summe",
            "value",
            "transactionamount",
            "amounteur",
        ],
    ),
    (
        CanonicalField::Name,
        &[
            "name",
            "description",
            "beschreibung",
            "buchungstext",
            "bezeichnung",
            "text",
            "details",
            "title",
            "umsatzart",
        ],
    ),
    (
        CanonicalField::Partner,
        &[
            "partner",
            "empfänger",
            "empfaenger",
            "auftraggeber",
            "auftraggeberempfänger",
            "begünstigter",
            "begünstigterzahlungspflichtiger",
            "zahlungspflichtiger",
            "zahlungsempfänger",
            "namezahlungsbeteiligter",
            "counterparty",
            "payee",
            "payer",
            "recipient",
            "beneficiary",
            "merchant",
        ],
    ),
    (
        CanonicalField::Reference,
        &[
            "reference",
            "referenz",
            "verwendungszweck",
            "zweck",
            "purpose",
            "memo",
            "remittanceinformation",
            "paymentreference",
        ],
    ),
    (
        CanonicalField::PartnerIban,
        &[
            "iban",
            "partneriban",
            "counterpartyiban",
            "ibanzahlungsbeteiligter",
            "kontonummeriban",
            "empfängeriban",
            "gegenkonto",
        ],
    ),
];

fn iban_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Z]{2}\d{2}[A-Z0-9]{11,30}$").expect("valid regex"))
}

/// Lowercase, keep letters and digits only
pub fn normalize_header(header: &str) -> String {
    header
        .trim()
        .trim_start_matches('\u{feff}')
        .to_lowercase()
        .chars()
        .filter(|c| c.is_alphanumeric())
        .collect()
}

/// Levenshtein edit distance over chars, two-row variant
pub fn levenshtein_distance(s1: &str, s2: &str) -> usize {
    let a: Vec<char> = s1.chars().collect();
    let b: Vec<char> = s2.chars().collect();
    let (m, n) = (a.len(), b.len());

    if m == 0 {
        return n;
    }
    if n == 0 {
        return m;
    }

    let (a, b, m, n) = if m <= n { (a, b, m, n) } else { (b, a, n, m) };

    let mut prev: Vec<usize> = (0..=n).collect();
    let mut curr = vec![0usize; n + 1];

    for i in 1..=m {
        curr[0] = i;
        for j in 1..=n {
            let cost = usize::from(a[i - 1] != b[j - 1]);
            curr[j] = (prev[j] + 1).min(curr[j - 1] + 1).min(prev[j - 1] + cost);
        }
        std::mem::swap(&mut prev, &mut curr);
    }

    prev[n]
}

/// `1 - distance / longer length`, in 0.0..=1.0
pub fn similarity(a: &str, b: &str) -> f64 {
    let longest = a.chars().count().max(b.chars().count());
    if longest == 0 {
        return 1.0;
    }
    1.0 - levenshtein_distance(a, b) as f64 / longest as f64
}

pub struct ColumnMatcher {
    region: Region,
}

impl ColumnMatcher {
    pub fn new(region: Region) -> Self {
        Self { region }
    }

    /// Propose a mapping for every header, in header order
    pub fn analyze(&self, headers: &[String], rows: &[BTreeMap<String, String>]) -> Vec<FieldMapping> {
        let normalized: Vec<String> = headers.iter().map(|h| normalize_header(h)).collect();
        let mut result: Vec<Option<FieldMapping>> = vec![None; headers.len()];
        let mut claimed: HashSet<CanonicalField> = HashSet::new();

        // Exact aliases first so they are never shadowed by an earlier fuzzy hit
        for (idx, header) in normalized.iter().enumerate() {
            if let Some(field) = exact_alias(header) {
                if claimed.insert(field) {
                    result[idx] = Some(self.proposal(&headers[idx], field, 1.0, MatchMethod::Alias, rows));
                }
            }
        }

        for (idx, header) in normalized.iter().enumerate() {
            if result[idx].is_some() {
                continue;
            }
            if let Some((field, score)) = best_fuzzy(header, &claimed) {
                claimed.insert(field);
                result[idx] = Some(self.proposal(&headers[idx], field, score, MatchMethod::Fuzzy, rows));
            }
        }

        for (idx, column) in headers.iter().enumerate() {
            if result[idx].is_some() {
                continue;
            }
            let samples = column_samples(rows, column);
            if let Some(mapping) = self.detect_by_content(column, &samples, &claimed) {
                if let Some(field) = mapping.field {
                    claimed.insert(field);
                }
                result[idx] = Some(mapping);
            }
        }

        result
            .into_iter()
            .zip(headers)
            .map(|(mapping, column)| mapping.unwrap_or_else(|| FieldMapping::unmapped(column.clone())))
            .collect()
    }

    /// Saved mappings, if they were made for exactly this header set
    pub fn reuse(&self, saved: &[FieldMapping], headers: &[String]) -> Option<Vec<FieldMapping>> {
        let saved_columns: HashSet<&str> = saved.iter().map(|m| m.column.as_str()).collect();
        let current: HashSet<&str> = headers.iter().map(String::as_str).collect();
        if saved_columns != current || saved.len() != headers.len() {
            return None;
        }

        let reused = headers
            .iter()
            .filter_map(|h| saved.iter().find(|m| &m.column == h))
            .map(|m| FieldMapping {
                method: if m.field.is_some() {
                    MatchMethod::Saved
                } else {
                    MatchMethod::Unmapped
                },
                ..m.clone()
            })
            .collect();
        Some(reused)
    }

    /// Required fields the mappings leave unconfirmed
    pub fn missing(&self, mappings: &[FieldMapping]) -> Vec<String> {
        missing_required(mappings)
    }

    fn proposal(
        &self,
        column: &str,
        field: CanonicalField,
        confidence: f64,
        method: MatchMethod,
        rows: &[BTreeMap<String, String>],
    ) -> FieldMapping {
        let samples = column_samples(rows, column);
        let format_id = match field {
            CanonicalField::Date => Some(
                detect_date_format(&samples, self.region.default_date_format())
                    .map(|d| d.format_id)
                    .unwrap_or_else(|| self.region.default_date_format().to_string()),
            ),
            CanonicalField::Amount => Some(
                detect_amount_format(&samples, self.region.default_amount_format())
                    .map(|d| d.format_id)
                    .unwrap_or_else(|| self.region.default_amount_format().to_string()),
            ),
            _ => None,
        };

        FieldMapping {
            column: column.to_string(),
            field: Some(field),
            format_id,
            confidence,
            user_confirmed: false,
            method,
        }
    }

    fn detect_by_content(
        &self,
        column: &str,
        samples: &[String],
        claimed: &HashSet<CanonicalField>,
    ) -> Option<FieldMapping> {
        if samples.iter().all(|s| s.trim().is_empty()) {
            return None;
        }

        let content = |field, format_id: Option<String>, score: f64| FieldMapping {
            column: column.to_string(),
            field: Some(field),
            format_id,
            confidence: score,
            user_confirmed: false,
            method: MatchMethod::Content,
        };

        if !claimed.contains(&CanonicalField::Date) {
            if let Some(d) = detect_date_format(samples, self.region.default_date_format()) {
                return Some(content(CanonicalField::Date, Some(d.format_id), d.score));
            }
        }

        if !claimed.contains(&CanonicalField::PartnerIban) {
            let score = iban_score(samples);
            if score >= IBAN_DETECTION_THRESHOLD {
                return Some(content(CanonicalField::PartnerIban, None, score));
            }
        }

        if !claimed.contains(&CanonicalField::Amount) {
            if let Some(d) = detect_amount_format(samples, self.region.default_amount_format()) {
                return Some(content(CanonicalField::Amount, Some(d.format_id), d.score));
            }
        }

        None
    }
}

impl Default for ColumnMatcher {
    fn default() -> Self {
        Self::new(Region::default())
    }
}

fn exact_alias(normalized: &str) -> Option<CanonicalField> {
    ALIASES
        .iter()
        .find(|(_, aliases)| aliases.contains(&normalized))
        .map(|(field, _)| *field)
}

fn best_fuzzy(normalized: &str, claimed: &HashSet<CanonicalField>) -> Option<(CanonicalField, f64)> {
    if normalized.is_empty() {
        return None;
    }

    let mut best: Option<(CanonicalField, f64)> = None;
    for (field, aliases) in ALIASES {
        if claimed.contains(field) {
            continue;
        }
        for alias in aliases.iter() {
            let score = similarity(normalized, alias);
            if score >= FUZZY_THRESHOLD && best.map_or(true, |(_, s)| score > s) {
                best = Some((*field, score));
            }
        }
    }
    best
}

fn iban_score(samples: &[String]) -> f64 {
    let values: Vec<String> = samples
        .iter()
        .map(|s| s.chars().filter(|c| !c.is_whitespace()).collect::<String>().to_uppercase())
        .filter(|s| !s.is_empty())
        .collect();
    if values.is_empty() {
        return 0.0;
    }
    let hits = values.iter().filter(|v| iban_regex().is_match(v)).count();
    hits as f64 / values.len() as f64
}

fn column_samples(rows: &[BTreeMap<String, String>], column: &str) -> Vec<String> {
    rows.iter()
        .filter_map(|row| row.get(column).cloned())
        .collect()
}
