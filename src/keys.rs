// 🔑 Canonical Keys - PROJECT|ACTION|UNIT|YEAR
//
// Budget-plan rows and cost-center rows are joined on this concatenated key.
// Text components are trimmed and upper-cased, the year is an integer
// (0 when the source value cannot be parsed).

use crate::error::{ReconcileError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

pub const KEY_SEPARATOR: char = '|';

/// Placeholder for a text component that is absent in the source
pub const MISSING_TEXT: &str = "N/A";

// ============================================================================
// TEXT / YEAR NORMALIZATION
// ============================================================================

/// Trim and upper-case a text component. Absent or blank values become `N/A`.
pub fn normalize_text(raw: Option<&str>) -> String {
    match raw.map(str::trim) {
        Some(value) if !value.is_empty() => value.to_uppercase(),
        _ => MISSING_TEXT.to_string(),
    }
}

/// Coerce a year cell to an integer. Never fails: unparsable input yields 0.
///
/// Accepts "2024", " 2024 " and float renderings such as "2024.0".
pub fn parse_year(raw: Option<&str>) -> i32 {
    let value = match raw.map(str::trim) {
        Some(v) if !v.is_empty() => v,
        _ => return 0,
    };

    if let Ok(year) = value.parse::<i32>() {
        return year;
    }

    match value.replace(',', ".").parse::<f64>() {
        Ok(f) if f.is_finite() && f.abs() < i32::MAX as f64 => f.trunc() as i32,
        _ => 0,
    }
}

// ============================================================================
// KEY COMPONENTS
// ============================================================================

/// The text components of a key that an operator may need to correct
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum KeyComponent {
    Project,
    Action,
    Unit,
}

impl KeyComponent {
    pub fn name(&self) -> &'static str {
        match self {
            KeyComponent::Project => "PROJETO",
            KeyComponent::Action => "ACAO",
            KeyComponent::Unit => "UNIDADE",
        }
    }

    pub fn value<'a>(&self, parts: &'a KeyParts) -> &'a str {
        match self {
            KeyComponent::Project => &parts.project,
            KeyComponent::Action => &parts.action,
            KeyComponent::Unit => &parts.unit,
        }
    }
}

/// A key split back into its four components
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct KeyParts {
    pub project: String,
    pub action: String,
    pub unit: String,
    pub year: i32,
}

impl KeyParts {
    pub fn new(project: &str, action: &str, unit: &str, year: i32) -> Self {
        KeyParts {
            project: normalize_text(Some(project)),
            action: normalize_text(Some(action)),
            unit: normalize_text(Some(unit)),
            year,
        }
    }

    pub fn key(&self) -> CanonicalKey {
        CanonicalKey::from_parts(&self.project, &self.action, &self.unit, self.year)
    }

    /// Copy of these parts with one text component replaced
    pub fn with_component(&self, component: KeyComponent, value: &str) -> KeyParts {
        let mut next = self.clone();
        let value = normalize_text(Some(value));
        match component {
            KeyComponent::Project => next.project = value,
            KeyComponent::Action => next.action = value,
            KeyComponent::Unit => next.unit = value,
        }
        next
    }
}

// ============================================================================
// CANONICAL KEY
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CanonicalKey(String);

impl CanonicalKey {
    /// Build a key from raw components, normalizing each one
    pub fn from_parts(project: &str, action: &str, unit: &str, year: i32) -> Self {
        CanonicalKey(format!(
            "{}{sep}{}{sep}{}{sep}{}",
            normalize_text(Some(project)),
            normalize_text(Some(action)),
            normalize_text(Some(unit)),
            year,
            sep = KEY_SEPARATOR
        ))
    }

    /// Wrap an already-concatenated key as stored in a correction map.
    /// No normalization is applied so stored keys round-trip byte for byte.
    pub fn from_raw(raw: impl Into<String>) -> Self {
        CanonicalKey(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Split into components. Fails unless there are exactly four parts and
    /// the last one is an integer year.
    pub fn parts(&self) -> Result<KeyParts> {
        let pieces: Vec<&str> = self.0.split(KEY_SEPARATOR).collect();
        if pieces.len() != 4 {
            return Err(ReconcileError::MalformedKey(self.0.clone()));
        }

        let year = pieces[3]
            .trim()
            .parse::<i32>()
            .map_err(|_| ReconcileError::MalformedKey(self.0.clone()))?;

        Ok(KeyParts {
            project: pieces[0].to_string(),
            action: pieces[1].to_string(),
            unit: pieces[2].to_string(),
            year,
        })
    }

    /// Re-derive the key from its own components
    pub fn normalized(&self) -> Result<CanonicalKey> {
        let parts = self.parts()?;
        Ok(CanonicalKey::from_parts(
            &parts.project,
            &parts.action,
            &parts.unit,
            parts.year,
        ))
    }
}

impl fmt::Display for CanonicalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CanonicalKey {
    fn from(value: &str) -> Self {
        CanonicalKey::from_raw(value)
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_text_trims_and_uppercases() {
        assert_eq!(normalize_text(Some("  Projeto x ")), "PROJETO X");
        assert_eq!(normalize_text(Some("ação")), "AÇÃO");
        assert_eq!(normalize_text(Some("   ")), MISSING_TEXT);
        assert_eq!(normalize_text(None), MISSING_TEXT);
    }

    #[test]
    fn test_parse_year_never_fails() {
        assert_eq!(parse_year(Some("2024")), 2024);
        assert_eq!(parse_year(Some(" 2025 ")), 2025);
        assert_eq!(parse_year(Some("2024.0")), 2024);
        assert_eq!(parse_year(Some("abc")), 0);
        assert_eq!(parse_year(Some("")), 0);
        assert_eq!(parse_year(None), 0);
    }

    #[test]
    fn test_key_from_parts() {
        let key = CanonicalKey::from_parts(" Projeto X", "Acao Y ", "SP - Unidade Z", 2024);
        assert_eq!(key.as_str(), "PROJETO X|ACAO Y|SP - UNIDADE Z|2024");
    }

    #[test]
    fn test_key_derivation_is_idempotent() {
        let key = CanonicalKey::from_parts("  projeto  ", "acao", " unidade", 2023);
        let parts = key.parts().unwrap();
        let again = CanonicalKey::from_parts(&parts.project, &parts.action, &parts.unit, parts.year);
        assert_eq!(key, again);
        assert_eq!(key.normalized().unwrap(), key);
    }

    #[test]
    fn test_parts_rejects_malformed_keys() {
        assert!(CanonicalKey::from_raw("A|B|C").parts().is_err());
        assert!(CanonicalKey::from_raw("A|B|C|D|2024").parts().is_err());
        assert!(CanonicalKey::from_raw("A|B|C|twenty").parts().is_err());

        let parts = CanonicalKey::from_raw("Projeto X|Acao Y|Unidade Z|2025").parts().unwrap();
        assert_eq!(parts.project, "Projeto X");
        assert_eq!(parts.year, 2025);
    }

    #[test]
    fn test_with_component_replaces_one_field() {
        let parts = KeyParts::new("p", "a", "u", 2024);
        let patched = parts.with_component(KeyComponent::Unit, "outra unidade");
        assert_eq!(patched.key().as_str(), "P|A|OUTRA UNIDADE|2024");
        assert_eq!(KeyComponent::Action.value(&patched), "A");
    }

    #[test]
    fn test_key_serializes_as_plain_string() {
        let key = CanonicalKey::from_raw("P|A|U|2024");
        assert_eq!(serde_json::to_string(&key).unwrap(), "\"P|A|U|2024\"");
    }
}
