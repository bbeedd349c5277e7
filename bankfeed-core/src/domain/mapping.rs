//! CSV field mappings

use std::fmt;

use serde::{Deserialize, Serialize};

/// Confidence at or above which a proposed mapping counts as confirmed
pub const CONFIRMATION_THRESHOLD: f64 = 0.7;

/// The fixed set of fields a CSV column can map to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CanonicalField {
    Date,
    Amount,
    Name,
    Partner,
    Reference,
    PartnerIban,
}

impl CanonicalField {
    pub const ALL: [CanonicalField; 6] = [
        CanonicalField::Date,
        CanonicalField::Amount,
        CanonicalField::Name,
        CanonicalField::Partner,
        CanonicalField::Reference,
        CanonicalField::PartnerIban,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            CanonicalField::Date => "date",
            CanonicalField::Amount => "amount",
            CanonicalField::Name => "name",
            CanonicalField::Partner => "partner",
            CanonicalField::Reference => "reference",
            CanonicalField::PartnerIban => "partnerIban",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|f| f.as_str().eq_ignore_ascii_case(s))
    }
}

impl fmt::Display for CanonicalField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a mapping was arrived at
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchMethod {
    Alias,
    Fuzzy,
    Content,
    Saved,
    Manual,
    Unmapped,
}

/// Assignment of one CSV column to a canonical field
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldMapping {
    pub column: String,
    /// `None` keeps the column as unmapped metadata
    pub field: Option<CanonicalField>,
    /// Date or amount preset id
    pub format_id: Option<String>,
    pub confidence: f64,
    pub user_confirmed: bool,
    pub method: MatchMethod,
}

impl FieldMapping {
    pub fn unmapped(column: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            field: None,
            format_id: None,
            confidence: 0.0,
            user_confirmed: false,
            method: MatchMethod::Unmapped,
        }
    }

    /// A mapping the user set by hand
    pub fn manual(column: impl Into<String>, field: CanonicalField, format_id: Option<String>) -> Self {
        Self {
            column: column.into(),
            field: Some(field),
            format_id,
            confidence: 1.0,
            user_confirmed: true,
            method: MatchMethod::Manual,
        }
    }

    pub fn is_confirmed(&self) -> bool {
        self.field.is_some() && (self.user_confirmed || self.confidence >= CONFIRMATION_THRESHOLD)
    }
}

/// Confirmed mapping for `field`, if any
pub fn confirmed_for(mappings: &[FieldMapping], field: CanonicalField) -> Option<&FieldMapping> {
    mappings
        .iter()
        .find(|m| m.field == Some(field) && m.is_confirmed())
}

/// Required fields lacking a confirmed mapping.
///
/// `date` and `amount` are required, plus at least one of `name`/`partner`.
pub fn missing_required(mappings: &[FieldMapping]) -> Vec<String> {
    let mut missing = Vec::new();
    for field in [CanonicalField::Date, CanonicalField::Amount] {
        if confirmed_for(mappings, field).is_none() {
            missing.push(field.as_str().to_string());
        }
    }
    if confirmed_for(mappings, CanonicalField::Name).is_none()
        && confirmed_for(mappings, CanonicalField::Partner).is_none()
    {
        missing.push("name|partner".to_string());
    }
    missing
}
