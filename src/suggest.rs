// 🔍 Candidate Suggester - proposes a reference key for a broken budget key
//
// Order of attempts:
// 1. Exact fields: Project/Action equal, Unit equal modulo the "SP - " prefix
// 2. Most recent year among those (ties: smallest key)
// 3. Fuzzy ranking of the first component that does not exist in the reference
//
// Read-only over the reference snapshot it was built from.

use crate::entities::CostCenterRow;
use crate::keys::{CanonicalKey, KeyComponent, KeyParts};
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use tracing::debug;

pub const DEFAULT_UNIT_PREFIX: &str = "SP - ";
pub const DEFAULT_FUZZY_LIMIT: usize = 5;

#[derive(Debug, Clone, PartialEq)]
pub struct RankedCandidate {
    pub component: KeyComponent,
    /// Reference value proposed for `component`
    pub value: String,
    pub score: f64,
    /// Concrete reference key carrying `value`
    pub key: CanonicalKey,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Suggestion {
    Exact(CanonicalKey),
    Ranked(Vec<RankedCandidate>),
    None,
}

pub struct CandidateSuggester {
    /// Distinct reference keys, sorted
    reference: Vec<KeyParts>,
    keys: HashSet<CanonicalKey>,
    unit_prefix: String,
    fuzzy_limit: usize,
}

impl CandidateSuggester {
    pub fn new(reference: &[CostCenterRow]) -> Self {
        let distinct: BTreeMap<CanonicalKey, KeyParts> =
            reference.iter().map(|row| (row.key(), row.parts())).collect();

        let keys = distinct.keys().cloned().collect();
        CandidateSuggester {
            reference: distinct.into_values().collect(),
            keys,
            unit_prefix: DEFAULT_UNIT_PREFIX.to_string(),
            fuzzy_limit: DEFAULT_FUZZY_LIMIT,
        }
    }

    pub fn with_unit_prefix(mut self, prefix: &str) -> Self {
        self.unit_prefix = prefix.to_uppercase();
        self
    }

    pub fn with_fuzzy_limit(mut self, limit: usize) -> Self {
        self.fuzzy_limit = limit.max(1);
        self
    }

    pub fn contains(&self, key: &CanonicalKey) -> bool {
        self.keys.contains(key)
    }

    pub fn len(&self) -> usize {
        self.reference.len()
    }

    pub fn is_empty(&self) -> bool {
        self.reference.is_empty()
    }

    // ========================================================================
    // MATCHING PRIMITIVES
    // ========================================================================

    /// Unit without the configured prefix, upper-cased
    fn unit_stem(&self, unit: &str) -> String {
        let unit = unit.trim().to_uppercase();
        match unit.strip_prefix(self.unit_prefix.as_str()) {
            Some(rest) => rest.trim().to_string(),
            None => unit,
        }
    }

    fn same_text(a: &str, b: &str) -> bool {
        a.trim().to_uppercase() == b.trim().to_uppercase()
    }

    fn same_unit(&self, a: &str, b: &str) -> bool {
        self.unit_stem(a) == self.unit_stem(b)
    }

    fn exact_matches<'a>(&'a self, parts: &'a KeyParts) -> impl Iterator<Item = &'a KeyParts> + 'a {
        self.reference.iter().filter(move |r| {
            Self::same_text(&r.project, &parts.project)
                && Self::same_text(&r.action, &parts.action)
                && self.same_unit(&r.unit, &parts.unit)
        })
    }

    /// Most recent year wins; equal years resolve to the smallest key
    pub fn best_by_year<'a, I>(candidates: I) -> Option<CanonicalKey>
    where
        I: IntoIterator<Item = &'a KeyParts>,
    {
        candidates
            .into_iter()
            .map(|parts| (parts.year, parts.key()))
            .max_by(|(year_a, key_a), (year_b, key_b)| {
                year_a.cmp(year_b).then_with(|| key_b.cmp(key_a))
            })
            .map(|(_, key)| key)
    }

    // ========================================================================
    // SUGGEST
    // ========================================================================

    pub fn suggest(&self, parts: &KeyParts) -> Suggestion {
        if let Some(key) = Self::best_by_year(self.exact_matches(parts)) {
            debug!("Exact candidate for '{}': {}", parts.key(), key);
            return Suggestion::Exact(key);
        }

        let component = match self.missing_component(parts) {
            Some(component) => component,
            None => return Suggestion::None,
        };

        let ranked = self.rank_component(component, parts);
        if ranked.is_empty() {
            debug!("No candidate for '{}' ({} unknown)", parts.key(), component.name());
            Suggestion::None
        } else {
            Suggestion::Ranked(ranked)
        }
    }

    /// First of Project, Action, Unit whose value has no reference row
    /// (Action under the same Project, Unit under the same Project/Action)
    fn missing_component(&self, parts: &KeyParts) -> Option<KeyComponent> {
        let same_project: Vec<&KeyParts> = self
            .reference
            .iter()
            .filter(|r| Self::same_text(&r.project, &parts.project))
            .collect();
        if same_project.is_empty() {
            return Some(KeyComponent::Project);
        }

        let same_action: Vec<&KeyParts> = same_project
            .into_iter()
            .filter(|r| Self::same_text(&r.action, &parts.action))
            .collect();
        if same_action.is_empty() {
            return Some(KeyComponent::Action);
        }

        if !same_action.iter().any(|r| self.same_unit(&r.unit, &parts.unit)) {
            return Some(KeyComponent::Unit);
        }

        None
    }

    /// Reference rows the value pool of `component` is drawn from
    fn scope_for<'a>(&'a self, component: KeyComponent, parts: &'a KeyParts) -> Vec<&'a KeyParts> {
        self.reference
            .iter()
            .filter(|r| match component {
                KeyComponent::Project => true,
                KeyComponent::Action => Self::same_text(&r.project, &parts.project),
                KeyComponent::Unit => {
                    Self::same_text(&r.project, &parts.project)
                        && Self::same_text(&r.action, &parts.action)
                }
            })
            .collect()
    }

    /// Top-N reference values for one component by Jaro-Winkler similarity,
    /// each resolved to a concrete reference key
    pub fn rank_component(&self, component: KeyComponent, parts: &KeyParts) -> Vec<RankedCandidate> {
        let scope = self.scope_for(component, parts);
        let target = component.value(parts).to_uppercase();

        let values: BTreeSet<&str> = scope.iter().map(|r| component.value(r)).collect();
        let mut scored: Vec<(f64, &str)> = values
            .into_iter()
            .map(|value| (strsim::jaro_winkler(&target, &value.to_uppercase()), value))
            .collect();
        scored.sort_by(|(score_a, value_a), (score_b, value_b)| {
            score_b
                .partial_cmp(score_a)
                .unwrap_or(Ordering::Equal)
                .then_with(|| value_a.cmp(value_b))
        });

        scored
            .into_iter()
            .take(self.fuzzy_limit)
            .filter_map(|(score, value)| {
                let patched = parts.with_component(component, value);
                let key = Self::best_by_year(self.exact_matches(&patched)).or_else(|| {
                    Self::best_by_year(scope.iter().copied().filter(|r| component.value(r) == value))
                })?;

                Some(RankedCandidate {
                    component,
                    value: value.to_string(),
                    score,
                    key,
                })
            })
            .collect()
    }

    // ========================================================================
    // OPERATOR SEARCH
    // ========================================================================

    /// Reference keys whose Project or Action contains `term`
    /// (case-insensitive), distinct and sorted
    pub fn search(&self, term: &str) -> Vec<CanonicalKey> {
        let term = term.trim().to_uppercase();
        if term.is_empty() {
            return Vec::new();
        }

        let hits: BTreeSet<CanonicalKey> = self
            .reference
            .iter()
            .filter(|r| r.project.to_uppercase().contains(&term) || r.action.to_uppercase().contains(&term))
            .map(KeyParts::key)
            .collect();

        hits.into_iter().collect()
    }

    /// Top-N reference keys by similarity of `term` to Project or Action
    pub fn fuzzy_search(&self, term: &str) -> Vec<CanonicalKey> {
        let term = term.trim().to_uppercase();
        if term.is_empty() {
            return Vec::new();
        }

        let mut scored: Vec<(f64, CanonicalKey)> = self
            .reference
            .iter()
            .map(|r| {
                let project = strsim::jaro_winkler(&term, &r.project.to_uppercase());
                let action = strsim::jaro_winkler(&term, &r.action.to_uppercase());
                (project.max(action), r.key())
            })
            .collect();
        scored.sort_by(|(score_a, key_a), (score_b, key_b)| {
            score_b
                .partial_cmp(score_a)
                .unwrap_or(Ordering::Equal)
                .then_with(|| key_a.cmp(key_b))
        });

        scored.into_iter().take(self.fuzzy_limit).map(|(_, key)| key).collect()
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn reference() -> Vec<CostCenterRow> {
        vec![
            CostCenterRow::new("Projeto X", "Acao Y", "Unidade Z", 2024, "100"),
            CostCenterRow::new("Projeto X", "Acao Y", "Unidade Z", 2025, "101"),
            CostCenterRow::new("Projeto X", "Acao W", "Unidade Z", 2025, "102"),
            CostCenterRow::new("Projeto Saude", "Vacinacao", "SP - Centro", 2025, "200"),
            CostCenterRow::new("Projeto Saude", "Vacinacao", "SP - Norte", 2025, "201"),
            CostCenterRow::new("Educacao Basica", "Merenda", "Sul", 2023, "300"),
        ]
    }

    fn parts_of(key: &str) -> KeyParts {
        CanonicalKey::from_raw(key).parts().unwrap()
    }

    #[test]
    fn test_prefix_tolerant_exact_match_prefers_latest_year() {
        let suggester = CandidateSuggester::new(&reference());
        let broken = CanonicalKey::from_parts("Projeto X", "Acao Y", "SP - Unidade Z", 2024);

        let suggestion = suggester.suggest(&broken.parts().unwrap());

        assert_eq!(
            suggestion,
            Suggestion::Exact(CanonicalKey::from_raw("PROJETO X|ACAO Y|UNIDADE Z|2025"))
        );
    }

    #[test]
    fn test_prefix_added_on_reference_side() {
        let suggester = CandidateSuggester::new(&reference());
        let suggestion = suggester.suggest(&parts_of("PROJETO SAUDE|VACINACAO|CENTRO|2024"));

        assert_eq!(
            suggestion,
            Suggestion::Exact(CanonicalKey::from_raw("PROJETO SAUDE|VACINACAO|SP - CENTRO|2025"))
        );
    }

    #[test]
    fn test_configured_unit_prefix() {
        let config = crate::config::AppConfig::from_toml_str("[matching]\nunit_prefix = \"rj - \"\n").unwrap();
        let suggester = CandidateSuggester::new(&reference()).with_unit_prefix(&config.matching.unit_prefix);

        let suggestion = suggester.suggest(&parts_of("PROJETO X|ACAO Y|RJ - UNIDADE Z|2024"));
        assert_eq!(
            suggestion,
            Suggestion::Exact(CanonicalKey::from_raw("PROJETO X|ACAO Y|UNIDADE Z|2025"))
        );

        // "SP - " is no longer stripped
        let suggestion = suggester.suggest(&parts_of("PROJETO SAUDE|VACINACAO|CENTRO|2024"));
        assert!(!matches!(suggestion, Suggestion::Exact(_)));
    }

    #[test]
    fn test_tie_on_year_picks_smallest_key() {
        let rows = vec![
            CostCenterRow::new("P", "A", "SP - U", 2025, "2"),
            CostCenterRow::new("P", "A", "U", 2025, "1"),
        ];
        let suggester = CandidateSuggester::new(&rows);

        for _ in 0..3 {
            assert_eq!(
                suggester.suggest(&parts_of("P|A|U|2020")),
                Suggestion::Exact(CanonicalKey::from_raw("P|A|SP - U|2025"))
            );
        }
    }

    #[test]
    fn test_empty_reference_yields_no_candidate() {
        let suggester = CandidateSuggester::new(&[]);
        assert!(suggester.is_empty());
        assert_eq!(suggester.suggest(&parts_of("P|A|U|2024")), Suggestion::None);
        assert!(suggester.search("P").is_empty());
        assert!(suggester.fuzzy_search("P").is_empty());
    }

    #[test]
    fn test_unknown_unit_is_ranked_within_project_and_action() {
        let suggester = CandidateSuggester::new(&reference());

        let suggestion = suggester.suggest(&parts_of("PROJETO SAUDE|VACINACAO|SP - NORTH|2025"));

        let ranked = match suggestion {
            Suggestion::Ranked(ranked) => ranked,
            other => panic!("expected ranked candidates, got {:?}", other),
        };
        assert_eq!(ranked.len(), 2);
        assert_eq!(ranked[0].component, KeyComponent::Unit);
        assert_eq!(ranked[0].value, "SP - NORTE");
        assert_eq!(ranked[0].key.as_str(), "PROJETO SAUDE|VACINACAO|SP - NORTE|2025");
        assert!(ranked[0].score >= ranked[1].score);
    }

    #[test]
    fn test_unknown_project_is_ranked_first() {
        let suggester = CandidateSuggester::new(&reference()).with_fuzzy_limit(1);

        let suggestion = suggester.suggest(&parts_of("PROJETO XX|ACAO Y|UNIDADE Z|2024"));

        match suggestion {
            Suggestion::Ranked(ranked) => {
                assert_eq!(ranked.len(), 1);
                assert_eq!(ranked[0].component, KeyComponent::Project);
                assert_eq!(ranked[0].value, "PROJETO X");
                assert_eq!(ranked[0].key.as_str(), "PROJETO X|ACAO Y|UNIDADE Z|2025");
            }
            other => panic!("expected ranked candidates, got {:?}", other),
        }
    }

    #[test]
    fn test_search_is_case_insensitive_distinct_and_sorted() {
        let suggester = CandidateSuggester::new(&reference());

        let hits = suggester.search(" projeto x");

        let keys: Vec<&str> = hits.iter().map(CanonicalKey::as_str).collect();
        assert_eq!(
            keys,
            vec![
                "PROJETO X|ACAO W|UNIDADE Z|2025",
                "PROJETO X|ACAO Y|UNIDADE Z|2024",
                "PROJETO X|ACAO Y|UNIDADE Z|2025",
            ]
        );
        assert_eq!(suggester.search("vacina").len(), 2);
        assert!(suggester.search("   ").is_empty());
    }

    #[test]
    fn test_fuzzy_search_caps_results() {
        let suggester = CandidateSuggester::new(&reference()).with_fuzzy_limit(2);

        let hits = suggester.fuzzy_search("merendaa");

        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].as_str(), "EDUCACAO BASICA|MERENDA|SUL|2023");
    }
}
