//! Validated primitive types shared across the consent workspace.
//!
//! Every type here is validated at construction, so code holding a `Principal`, `RecordId`,
//! `DataCategory` or `Purpose` never has to re-check it.

use std::{fmt, str::FromStr};

/// Errors that can occur when constructing validated types.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TypeError {
    /// The principal was empty, too long or contained characters outside the allowed set
    #[error("invalid principal: {0}")]
    InvalidPrincipal(String),
    /// The identifier was not a canonical record id
    #[error("invalid id: {0}")]
    InvalidId(String),
    /// The value is not a recognised data category
    #[error("unknown data category '{0}'")]
    UnknownDataCategory(String),
    /// The value is not a recognised purpose
    #[error("unknown purpose '{0}'")]
    UnknownPurpose(String),
}

/// Maximum length of a principal identifier in bytes.
pub const MAX_PRINCIPAL_LEN: usize = 128;

/// An opaque, stable identifier for a patient or provider.
///
/// The input is trimmed of leading and trailing whitespace. The remaining text must be non-empty,
/// at most [`MAX_PRINCIPAL_LEN`] bytes and restricted to ASCII alphanumerics plus `.`, `-`, `_`,
/// `:` and `@`, which admits wallet addresses (`0xabc...`) and DIDs (`did:key:...`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Principal(String);

impl Principal {
    /// Creates a new `Principal` from the given input.
    ///
    /// # Errors
    ///
    /// Returns [`TypeError::InvalidPrincipal`] if the trimmed input is empty, too long or
    /// contains a disallowed character.
    pub fn new(input: impl AsRef<str>) -> Result<Self, TypeError> {
        let trimmed = input.as_ref().trim();
        if trimmed.is_empty() {
            return Err(TypeError::InvalidPrincipal(
                "principal cannot be empty".into(),
            ));
        }

        if trimmed.len() > MAX_PRINCIPAL_LEN {
            return Err(TypeError::InvalidPrincipal(format!(
                "principal exceeds maximum length of {} characters",
                MAX_PRINCIPAL_LEN
            )));
        }

        let ok = trimmed.bytes().all(|b| {
            matches!(b, b'0'..=b'9' | b'a'..=b'z' | b'A'..=b'Z' | b'.' | b'-' | b'_' | b':' | b'@')
        });
        if !ok {
            return Err(TypeError::InvalidPrincipal(format!(
                "'{}' contains invalid characters (only alphanumeric, '.', '-', '_', ':', '@' allowed)",
                trimmed
            )));
        }

        Ok(Self(trimmed.to_owned()))
    }

    /// Returns the inner string as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Principal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for Principal {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl FromStr for Principal {
    type Err = TypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Principal::new(s)
    }
}

impl serde::Serialize for Principal {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> serde::Deserialize<'de> for Principal {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Principal::new(&s).map_err(serde::de::Error::custom)
    }
}

/// Globally unique identifier of a consent record or an access request.
///
/// Always rendered in canonical form: 32 lowercase hex characters without hyphens.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RecordId(uuid::Uuid);

impl RecordId {
    /// Generates a fresh random identifier.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4())
    }

    /// Parses an identifier that must already be in canonical form.
    ///
    /// Hyphenated or uppercase forms are rejected rather than normalised, so one record always
    /// has exactly one textual id.
    pub fn parse(input: &str) -> Result<Self, TypeError> {
        if !Self::is_canonical(input) {
            return Err(TypeError::InvalidId(format!(
                "id must be 32 lowercase hex characters without hyphens, got: '{}'",
                input
            )));
        }
        uuid::Uuid::parse_str(input)
            .map(Self)
            .map_err(|e| TypeError::InvalidId(e.to_string()))
    }

    /// Returns true if `input` is exactly 32 lowercase hex characters.
    pub fn is_canonical(input: &str) -> bool {
        input.len() == 32
            && input
                .bytes()
                .all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.simple())
    }
}

impl FromStr for RecordId {
    type Err = TypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        RecordId::parse(s)
    }
}

impl serde::Serialize for RecordId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.collect_str(self)
    }
}

impl<'de> serde::Deserialize<'de> for RecordId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        RecordId::parse(&s).map_err(serde::de::Error::custom)
    }
}

/// Category of patient data a consent covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataCategory {
    MedicalRecords,
    DiagnosticData,
    GeneticData,
    ImagingData,
    LaboratoryResults,
    PrescriptionHistory,
    VitalSigns,
    TreatmentHistory,
}

impl DataCategory {
    pub const ALL: [DataCategory; 8] = [
        DataCategory::MedicalRecords,
        DataCategory::DiagnosticData,
        DataCategory::GeneticData,
        DataCategory::ImagingData,
        DataCategory::LaboratoryResults,
        DataCategory::PrescriptionHistory,
        DataCategory::VitalSigns,
        DataCategory::TreatmentHistory,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            DataCategory::MedicalRecords => "medical_records",
            DataCategory::DiagnosticData => "diagnostic_data",
            DataCategory::GeneticData => "genetic_data",
            DataCategory::ImagingData => "imaging_data",
            DataCategory::LaboratoryResults => "laboratory_results",
            DataCategory::PrescriptionHistory => "prescription_history",
            DataCategory::VitalSigns => "vital_signs",
            DataCategory::TreatmentHistory => "treatment_history",
        }
    }
}

impl fmt::Display for DataCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DataCategory {
    type Err = TypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        DataCategory::ALL
            .into_iter()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| TypeError::UnknownDataCategory(s.to_owned()))
    }
}

/// Why the provider is allowed to read the data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Purpose {
    Treatment,
    Research,
    Billing,
    Compliance,
    Analytics,
}

impl Purpose {
    pub const ALL: [Purpose; 5] = [
        Purpose::Treatment,
        Purpose::Research,
        Purpose::Billing,
        Purpose::Compliance,
        Purpose::Analytics,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Purpose::Treatment => "treatment",
            Purpose::Research => "research",
            Purpose::Billing => "billing",
            Purpose::Compliance => "compliance",
            Purpose::Analytics => "analytics",
        }
    }
}

impl fmt::Display for Purpose {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Purpose {
    type Err = TypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        Purpose::ALL
            .into_iter()
            .find(|p| p.as_str() == s)
            .ok_or_else(|| TypeError::UnknownPurpose(s.to_owned()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_principal_trims_and_accepts_addresses_and_dids() {
        let p = Principal::new("  0xAbC123  ").unwrap();
        assert_eq!(p.as_str(), "0xAbC123");
        assert!(Principal::new("did:key:z6Mk-example_1").is_ok());
        assert!(Principal::new("dr.smith@clinic").is_ok());
    }

    #[test]
    fn test_principal_rejects_empty_long_and_odd_characters() {
        assert!(matches!(
            Principal::new("   "),
            Err(TypeError::InvalidPrincipal(_))
        ));
        assert!(Principal::new("a".repeat(MAX_PRINCIPAL_LEN + 1)).is_err());
        assert!(Principal::new("P 1").is_err());
        assert!(Principal::new("P1/../etc").is_err());
    }

    #[test]
    fn test_principal_deserialize_validates() {
        let ok: Principal = serde_json::from_str("\"P1\"").unwrap();
        assert_eq!(ok.as_str(), "P1");
        assert!(serde_json::from_str::<Principal>("\"\"").is_err());
    }

    #[test]
    fn test_record_id_requires_canonical_form() {
        let id = RecordId::generate();
        let text = id.to_string();
        assert_eq!(text.len(), 32);
        assert_eq!(RecordId::parse(&text).unwrap(), id);

        assert!(RecordId::parse("550e8400-e29b-41d4-a716-446655440000").is_err());
        assert!(RecordId::parse("550E8400E29B41D4A716446655440000").is_err());
        assert!(RecordId::parse("not-an-id").is_err());
    }

    #[test]
    fn test_enums_parse_from_snake_case_names() {
        for category in DataCategory::ALL {
            assert_eq!(category.as_str().parse::<DataCategory>().unwrap(), category);
        }
        for purpose in Purpose::ALL {
            assert_eq!(purpose.as_str().parse::<Purpose>().unwrap(), purpose);
        }
        assert_eq!(
            "x_rays".parse::<DataCategory>(),
            Err(TypeError::UnknownDataCategory("x_rays".into()))
        );
        assert_eq!(
            "marketing".parse::<Purpose>(),
            Err(TypeError::UnknownPurpose("marketing".into()))
        );
    }

    #[test]
    fn test_enum_serde_matches_display() {
        let json = serde_json::to_string(&DataCategory::VitalSigns).unwrap();
        assert_eq!(json, "\"vital_signs\"");
        let purpose: Purpose = serde_json::from_str("\"billing\"").unwrap();
        assert_eq!(purpose, Purpose::Billing);
    }
}
