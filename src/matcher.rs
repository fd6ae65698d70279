//! Fuzzy athlete matching.
//!
//! Candidates are shortlisted by normalised-name substring, then scored
//! with a character-level similarity where 0 means identical. A result is
//! auto-linked only when exactly one candidate clears the confidence bar.

use anyhow::Result;
use strsim::jaro_winkler;
use tracing::{debug, info};

use crate::names::normalize_name;
use crate::storage::models::{Athlete, RaceResult};
use crate::storage::Store;

/// Default score threshold; candidates scoring at or above it are discarded.
pub const DEFAULT_THRESHOLD: f64 = 0.6;

/// Stricter generation threshold used by auto-matching.
pub const AUTO_MATCH_THRESHOLD: f64 = 0.3;

/// Confidence required to auto-link.
pub const AUTO_LINK_CONFIDENCE: u8 = 90;

/// Shortlist size for candidate generation.
const SHORTLIST_LIMIT: u32 = 50;

/// Queries shorter than this never match.
const MIN_MATCH_LEN: usize = 2;

/// A candidate athlete with its match confidence (0-100, higher is closer).
#[derive(Debug, Clone)]
pub struct MatchCandidate {
    pub athlete: Athlete,
    pub confidence: u8,
}

/// Distance between two normalised names: 0 identical, 1 disjoint.
fn name_distance(a: &str, b: &str) -> f64 {
    1.0 - jaro_winkler(a, b)
}

fn confidence_from(distance: f64) -> u8 {
    ((1.0 - distance) * 100.0).round().clamp(0.0, 100.0) as u8
}

/// Rank candidate athletes for a result's normalised name.
///
/// Shortlists up to 50 athletes whose normalised name contains the query,
/// scores each, and drops candidates at or above the threshold.
pub fn find_candidates(
    store: &Store,
    normalized_name: &str,
    threshold: f64,
) -> Result<Vec<MatchCandidate>> {
    if normalized_name.len() < MIN_MATCH_LEN {
        return Ok(Vec::new());
    }

    let shortlist = store.find_athletes_by_fragment(normalized_name, SHORTLIST_LIMIT)?;

    let mut candidates: Vec<MatchCandidate> = shortlist
        .into_iter()
        .filter_map(|athlete| {
            let distance = name_distance(normalized_name, &athlete.normalized_name);
            if distance >= threshold {
                return None;
            }
            Some(MatchCandidate {
                confidence: confidence_from(distance),
                athlete,
            })
        })
        .collect();

    candidates.sort_by(|a, b| b.confidence.cmp(&a.confidence));
    Ok(candidates)
}

/// Outcome of one auto-match attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AutoMatchOutcome {
    /// The result was linked to the athlete at the given confidence.
    Linked { athlete_id: String, confidence: u8 },
    /// Left for manual review.
    Skipped { reason: String },
}

/// Try to auto-link one result.
///
/// Generation runs at the stricter threshold; the link is applied only
/// when exactly one candidate reaches the confidence bar. Two qualifying
/// candidates always block the link.
pub fn auto_match(store: &Store, result: &RaceResult) -> Result<AutoMatchOutcome> {
    let candidates = find_candidates(store, &result.normalized_name, AUTO_MATCH_THRESHOLD)?;

    let qualifying: Vec<&MatchCandidate> = candidates
        .iter()
        .filter(|c| c.confidence >= AUTO_LINK_CONFIDENCE)
        .collect();

    match qualifying.as_slice() {
        [only] => {
            store.link_athlete(&result.id, &only.athlete.id)?;
            info!(
                "linked result {} to athlete {} at confidence {}",
                result.id, only.athlete.id, only.confidence
            );
            Ok(AutoMatchOutcome::Linked {
                athlete_id: only.athlete.id.clone(),
                confidence: only.confidence,
            })
        }
        [] => Ok(AutoMatchOutcome::Skipped {
            reason: "no candidate at auto-link confidence".to_string(),
        }),
        many => Ok(AutoMatchOutcome::Skipped {
            reason: format!("{} candidates at auto-link confidence", many.len()),
        }),
    }
}

/// Auto-match every unlinked result. Returns (linked, skipped) counts.
pub fn auto_match_all(store: &Store, batch: u32) -> Result<(u32, u32)> {
    let mut linked = 0;
    let mut skipped = 0;

    for result in store.unlinked_results(batch)? {
        match auto_match(store, &result)? {
            AutoMatchOutcome::Linked { .. } => linked += 1,
            AutoMatchOutcome::Skipped { reason } => {
                debug!("result {} skipped: {}", result.id, reason);
                skipped += 1;
            }
        }
    }
    Ok((linked, skipped))
}

/// Inverse direction: unlinked results that plausibly belong to an athlete.
///
/// A result qualifies when its normalised name contains, or is contained
/// by, the athlete's normalised name; qualifying results are fuzzy-scored.
pub fn suggest_matches_for_athlete(
    store: &Store,
    athlete_id: &str,
    batch: u32,
) -> Result<Vec<(RaceResult, u8)>> {
    let Some(athlete) = store.get_athlete(athlete_id)? else {
        anyhow::bail!("athlete {} not found", athlete_id);
    };
    let needle = normalize_name(&athlete.name);

    let mut suggestions = Vec::new();
    for result in store.unlinked_results(batch)? {
        let hay = &result.normalized_name;
        if !(hay.contains(&needle) || needle.contains(hay.as_str())) {
            continue;
        }
        let distance = name_distance(&needle, hay);
        if distance >= DEFAULT_THRESHOLD {
            continue;
        }
        suggestions.push((result, confidence_from(distance)));
    }

    suggestions.sort_by(|a, b| b.1.cmp(&a.1));
    Ok(suggestions)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::models::ResultStatus;
    use crate::storage::new_id;
    use chrono::NaiveDate;

    fn seed_event(store: &Store) -> String {
        store
            .insert_event(&crate::storage::models::Event {
                id: new_id(),
                url: "https://results.hopasports.com/events/spring".to_string(),
                organiser: "hopasports".to_string(),
                name: "Spring Races".to_string(),
                event_date: NaiveDate::from_ymd_opt(2025, 4, 12).unwrap(),
                location: None,
                metadata: None,
                scraped_at: None,
            })
            .unwrap()
    }

    fn seed_athlete(store: &Store, name: &str) -> Athlete {
        let athlete = Athlete {
            id: new_id(),
            name: name.to_string(),
            normalized_name: normalize_name(name),
            gender: None,
            birth_date: None,
            country: None,
            external_user_id: None,
        };
        store.insert_athlete(&athlete).unwrap();
        athlete
    }

    fn seed_result(store: &Store, event_id: &str, position: u32, name: &str) -> RaceResult {
        let result = RaceResult {
            id: new_id(),
            event_id: event_id.to_string(),
            distance_id: None,
            athlete_id: None,
            position: Some(position),
            bib: Some(format!("{}", position)),
            name: name.to_string(),
            normalized_name: normalize_name(name),
            gender: None,
            category: None,
            finish_time: None,
            gun_time: None,
            chip_time: None,
            pace: None,
            gender_position: None,
            category_position: None,
            country: None,
            club: None,
            age: None,
            status: ResultStatus::Finished,
            time_behind: None,
            validation: None,
        };
        store.insert_result(&result).unwrap();
        result
    }

    #[test]
    fn test_identical_name_full_confidence() {
        let store = Store::in_memory().unwrap();
        seed_athlete(&store, "Jose Garcia");

        let candidates = find_candidates(&store, "jose garcia", DEFAULT_THRESHOLD).unwrap();
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].confidence, 100);
    }

    #[test]
    fn test_accented_variant_links() {
        let store = Store::in_memory().unwrap();
        let event_id = seed_event(&store);
        let athlete = seed_athlete(&store, "Jose Garcia");
        let result = seed_result(&store, &event_id, 1, "José García");

        // Normalisation makes the accented form identical
        let outcome = auto_match(&store, &result).unwrap();
        assert_eq!(
            outcome,
            AutoMatchOutcome::Linked {
                athlete_id: athlete.id.clone(),
                confidence: 100
            }
        );

        let results = store.get_results_for_event(&event_id).unwrap();
        assert_eq!(results[0].athlete_id.as_deref(), Some(athlete.id.as_str()));
    }

    #[test]
    fn test_two_qualifying_candidates_block_link() {
        let store = Store::in_memory().unwrap();
        let event_id = seed_event(&store);
        seed_athlete(&store, "Jose Garcia");
        seed_athlete(&store, "Jose Garcias");
        let result = seed_result(&store, &event_id, 1, "Jose Garcia");

        let outcome = auto_match(&store, &result).unwrap();
        assert!(matches!(outcome, AutoMatchOutcome::Skipped { .. }));

        let results = store.get_results_for_event(&event_id).unwrap();
        assert!(results[0].athlete_id.is_none());
    }

    #[test]
    fn test_no_candidates_skips() {
        let store = Store::in_memory().unwrap();
        let event_id = seed_event(&store);
        let result = seed_result(&store, &event_id, 1, "Jane Doe");

        let outcome = auto_match(&store, &result).unwrap();
        assert!(matches!(outcome, AutoMatchOutcome::Skipped { .. }));
    }

    #[test]
    fn test_short_query_never_matches() {
        let store = Store::in_memory().unwrap();
        seed_athlete(&store, "A");
        let candidates = find_candidates(&store, "a", DEFAULT_THRESHOLD).unwrap();
        assert!(candidates.is_empty());
    }

    #[test]
    fn test_auto_match_all_counts() {
        let store = Store::in_memory().unwrap();
        let event_id = seed_event(&store);
        seed_athlete(&store, "Jane Doe");
        seed_result(&store, &event_id, 1, "Jane Doe");
        seed_result(&store, &event_id, 2, "Someone Unrelated");

        let (linked, skipped) = auto_match_all(&store, 100).unwrap();
        assert_eq!(linked, 1);
        assert_eq!(skipped, 1);
    }

    #[test]
    fn test_suggest_matches_for_athlete() {
        let store = Store::in_memory().unwrap();
        let event_id = seed_event(&store);
        let athlete = seed_athlete(&store, "Jane Doe");
        seed_result(&store, &event_id, 1, "Jane Doe");
        seed_result(&store, &event_id, 2, "John Roe");

        let suggestions = suggest_matches_for_athlete(&store, &athlete.id, 100).unwrap();
        assert_eq!(suggestions.len(), 1);
        assert_eq!(suggestions[0].0.name, "Jane Doe");
        assert_eq!(suggestions[0].1, 100);
    }
}
