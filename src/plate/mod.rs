//! License plate resolution.
//!
//! - `reader`: plate OCR capability (`PlateReader`)
//! - `registry`: external vehicle registry lookups and payload parsing
//! - `cache`: shared TTL cache with in-flight de-duplication
//! - `resolver`: crop → plate → registry attribution

pub mod cache;
pub mod reader;
pub mod registry;
pub mod resolver;

use std::sync::OnceLock;

use serde::{Deserialize, Serialize};

use crate::{Category, Origin};

pub use cache::PlateCache;
pub use reader::{HttpPlateReader, NullPlateReader, PlateCandidate, PlateReader};
pub use registry::{
    extract_vehicle_info, normalize_category, HttpRegistryClient, NullRegistryClient,
    RegistryClient, RegistryLookup, VehicleInfo,
};
pub use resolver::PlateResolver;

/// OCR candidates below this score are ignored.
pub const MIN_PLATE_SCORE: f64 = 0.5;

/// Outcome of resolving one vehicle crop.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PlateMatch {
    pub plate: String,
    pub found: bool,
    pub brand: Option<String>,
    pub model: Option<String>,
    pub category: Option<Category>,
    /// `Etecnic` when the registry knew the plate, `PlateOcr` otherwise.
    pub source: Origin,
    pub score: f64,
}

/// Canonical plate form: separators removed, uppercased.
pub fn normalize_plate(text: &str) -> String {
    text.chars()
        .filter(|c| *c != '-' && *c != ' ')
        .flat_map(char::to_uppercase)
        .collect()
}

/// Three letters, optional dash, three digits.
pub fn matches_plate_grammar(text: &str) -> bool {
    static PLATE_RE: OnceLock<regex::Regex> = OnceLock::new();
    let re = PLATE_RE.get_or_init(|| regex::Regex::new(r"^[A-Z]{3}-?\d{3}$").unwrap());
    let cleaned: String = text.replace(' ', "").to_uppercase();
    re.is_match(&cleaned)
}

/// Best acceptable candidate as `(normalized plate, score)`.
///
/// A candidate is acceptable when its score reaches `min_score`, its
/// normalized length is 6 or 7 and it matches the plate grammar. Ties keep
/// the earlier candidate.
pub fn best_plate(candidates: &[PlateCandidate], min_score: f64) -> Option<(String, f64)> {
    let mut best: Option<(String, f64)> = None;
    for candidate in candidates {
        if candidate.score < min_score {
            continue;
        }
        let normalized = normalize_plate(&candidate.text);
        if !matches!(normalized.chars().count(), 6 | 7) {
            continue;
        }
        if !matches_plate_grammar(&candidate.text) {
            continue;
        }
        if best.as_ref().map_or(true, |(_, s)| candidate.score > *s) {
            best = Some((normalized, candidate.score));
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;

    fn c(text: &str, score: f64) -> PlateCandidate {
        PlateCandidate {
            text: text.to_string(),
            score,
        }
    }

    #[test]
    fn normalization_strips_separators() {
        assert_eq!(normalize_plate("abc-123"), "ABC123");
        assert_eq!(normalize_plate(" xyz 789 "), "XYZ789");
    }

    #[test]
    fn grammar_allows_optional_dash_and_spaces() {
        assert!(matches_plate_grammar("ABC123"));
        assert!(matches_plate_grammar("abc-123"));
        assert!(matches_plate_grammar("AB C123"));
        assert!(!matches_plate_grammar("AB1234"));
        assert!(!matches_plate_grammar("ABCD123"));
        assert!(!matches_plate_grammar("ABC--123"));
    }

    #[test]
    fn best_candidate_filters_and_ranks() {
        let candidates = [
            c("ABC-123", 0.45),
            c("HELLO", 0.99),
            c("XYZ 789", 0.81),
            c("QWE123", 0.81),
            c("ZZZ999", 0.7),
        ];
        assert_eq!(
            best_plate(&candidates, MIN_PLATE_SCORE),
            Some(("XYZ789".to_string(), 0.81))
        );
    }

    #[test]
    fn score_threshold_is_inclusive() {
        assert_eq!(
            best_plate(&[c("ABC123", 0.5)], MIN_PLATE_SCORE),
            Some(("ABC123".to_string(), 0.5))
        );
        assert_eq!(best_plate(&[c("ABC123", 0.49)], MIN_PLATE_SCORE), None);
        assert_eq!(best_plate(&[], MIN_PLATE_SCORE), None);
    }
}
