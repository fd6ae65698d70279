//! Completeness scoring and consistency checks for a scraped payload.

use std::collections::{HashMap, HashSet};

use super::checkpoints::parse_time_seconds;
use super::{ScrapedResult, ScrapedResults};

/// Core fields every organiser is expected to populate.
const CORE_FIELDS: &[&str] = &["position", "bib", "name", "finish_time"];

/// Aggregate statistics over a payload.
#[derive(Debug, Clone)]
pub struct ValidationStats {
    pub total: u32,
    pub rows_with_all_fields: u32,
    pub rows_with_checkpoints: u32,
    pub avg_checkpoints_per_result: f64,
    /// Population percentage per field, 0-100.
    pub field_population: HashMap<String, f64>,
}

/// Validation outcome: critical errors, warnings, score and stats.
#[derive(Debug, Clone)]
pub struct ValidationReport {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    /// Mean field-population percentage, 0-100.
    pub completeness_score: f64,
    pub stats: ValidationStats,
}

impl ValidationReport {
    pub fn has_critical_errors(&self) -> bool {
        !self.errors.is_empty()
    }
}

fn field_present(result: &ScrapedResult, field: &str) -> bool {
    match field {
        "position" => result.position.is_some(),
        "bib" => result.bib.is_some(),
        "name" => !result.name.trim().is_empty(),
        "finish_time" => result.finish_time.is_some(),
        // anything else is an expected checkpoint name
        checkpoint => result.checkpoints.iter().any(|cp| cp.name == checkpoint),
    }
}

/// Validate a scraped payload.
///
/// Errors: rows with a missing name. Warnings: a field populated in fewer
/// than `floor_pct` percent of rows, non-monotonic checkpoint cumulatives,
/// and repeated bibs or positions. The completeness score is the mean
/// population over the core fields plus the declared expected checkpoints.
pub fn validate_results(scraped: &ScrapedResults, floor_pct: f64) -> ValidationReport {
    let results = &scraped.results;
    let total = results.len() as u32;

    let mut fields: Vec<String> = CORE_FIELDS.iter().map(|s| s.to_string()).collect();
    for distance in &scraped.event.distances {
        for cp in &distance.expected_checkpoints {
            if !fields.contains(cp) {
                fields.push(cp.clone());
            }
        }
    }

    let mut errors = Vec::new();
    let mut warnings = Vec::new();

    for (idx, result) in results.iter().enumerate() {
        if result.name.trim().is_empty() {
            errors.push(format!("row {}: missing name", idx + 1));
        }

        let mut prev: Option<u64> = None;
        let mut ordered: Vec<_> = result.checkpoints.iter().collect();
        ordered.sort_by_key(|cp| cp.order);
        for cp in ordered {
            let Some(secs) = cp.cumulative_time.as_deref().and_then(parse_time_seconds) else {
                continue;
            };
            if let Some(p) = prev {
                if secs < p {
                    warnings.push(format!(
                        "row {}: checkpoint {} cumulative time regresses",
                        idx + 1,
                        cp.name
                    ));
                }
            }
            prev = Some(secs);
        }
    }

    // Duplicate bibs and positions
    let mut seen_bibs: HashMap<&str, u32> = HashMap::new();
    let mut seen_positions: HashMap<u32, u32> = HashMap::new();
    for result in results {
        if let Some(bib) = result.bib.as_deref() {
            *seen_bibs.entry(bib).or_default() += 1;
        }
        if let Some(pos) = result.position {
            *seen_positions.entry(pos).or_default() += 1;
        }
    }
    for (bib, count) in seen_bibs {
        if count > 1 {
            warnings.push(format!("bib {} appears {} times", bib, count));
        }
    }
    for (pos, count) in seen_positions {
        if count > 1 {
            warnings.push(format!("position {} appears {} times", pos, count));
        }
    }

    // Field population
    let mut field_population = HashMap::new();
    for field in &fields {
        let populated = results.iter().filter(|r| field_present(r, field)).count();
        let pct = if total == 0 {
            0.0
        } else {
            populated as f64 * 100.0 / total as f64
        };
        field_population.insert(field.clone(), pct);

        let is_checkpoint = !CORE_FIELDS.contains(&field.as_str());
        if total > 0 && pct < floor_pct && !is_checkpoint {
            warnings.push(format!("field {} populated in {:.0}% of rows", field, pct));
        }
    }

    let completeness_score = if field_population.is_empty() {
        0.0
    } else {
        field_population.values().sum::<f64>() / field_population.len() as f64
    };

    let rows_with_all_fields = results
        .iter()
        .filter(|r| CORE_FIELDS.iter().all(|f| field_present(r, f)))
        .count() as u32;
    let rows_with_checkpoints = results.iter().filter(|r| !r.checkpoints.is_empty()).count() as u32;
    let checkpoint_total: usize = results.iter().map(|r| r.checkpoints.len()).sum();
    let avg_checkpoints_per_result = if total == 0 {
        0.0
    } else {
        checkpoint_total as f64 / total as f64
    };

    // A payload with zero distinct rows is unusable
    let distinct: HashSet<(&Option<u32>, &str)> = results
        .iter()
        .map(|r| (&r.position, r.name.as_str()))
        .collect();
    if total > 0 && distinct.len() < results.len() {
        warnings.push(format!(
            "{} duplicate rows by position and name",
            results.len() - distinct.len()
        ));
    }

    ValidationReport {
        errors,
        warnings,
        completeness_score,
        stats: ValidationStats {
            total,
            rows_with_all_fields,
            rows_with_checkpoints,
            avg_checkpoints_per_result,
            field_population,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scraper::{ScrapedCheckpoint, ScrapedDistance, ScrapedEvent, ScrapeMetadata};
    use crate::storage::models::{CheckpointType, RaceType};
    use chrono::{NaiveDate, Utc};

    fn payload(results: Vec<ScrapedResult>) -> ScrapedResults {
        ScrapedResults {
            event: ScrapedEvent {
                url: "https://results.hopasports.com/events/spring".to_string(),
                organiser: "hopasports".to_string(),
                name: "Spring Races".to_string(),
                date: NaiveDate::from_ymd_opt(2025, 4, 12).unwrap(),
                location: None,
                distances: vec![ScrapedDistance {
                    name: "10K".to_string(),
                    distance_meters: 10_000,
                    race_type: RaceType::Running,
                    expected_checkpoints: vec!["5km".to_string()],
                    participant_count: None,
                }],
            },
            results,
            metadata: ScrapeMetadata {
                started_at: Utc::now(),
                completed_at: Utc::now(),
                total_pages: 1,
                total_results: 0,
                used_headless_browser: false,
                errors: vec![],
                warnings: vec![],
            },
        }
    }

    fn full_row(position: u32, name: &str) -> ScrapedResult {
        ScrapedResult {
            position: Some(position),
            bib: Some(format!("{}", 100 + position)),
            name: name.to_string(),
            finish_time: Some("45:00".to_string()),
            checkpoints: vec![ScrapedCheckpoint {
                name: "5km".to_string(),
                checkpoint_type: CheckpointType::Distance,
                order: 1,
                split_time: None,
                cumulative_time: Some("22:10".to_string()),
                pace: None,
                segment_distance_meters: Some(5000),
            }],
            ..Default::default()
        }
    }

    #[test]
    fn test_complete_payload_scores_high() {
        let report = validate_results(&payload(vec![full_row(1, "Jane"), full_row(2, "John")]), 50.0);
        assert!(report.errors.is_empty());
        assert!(report.warnings.is_empty());
        assert!((report.completeness_score - 100.0).abs() < f64::EPSILON);
        assert_eq!(report.stats.rows_with_all_fields, 2);
        assert_eq!(report.stats.rows_with_checkpoints, 2);
        assert!((report.stats.avg_checkpoints_per_result - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_missing_name_is_critical() {
        let mut row = full_row(1, "");
        row.name = String::new();
        let report = validate_results(&payload(vec![row]), 50.0);
        assert!(report.has_critical_errors());
        assert!(report.errors[0].contains("missing name"));
    }

    #[test]
    fn test_sparse_field_warns() {
        let mut rows = vec![full_row(1, "Jane"), full_row(2, "John"), full_row(3, "Ann")];
        rows[0].bib = None;
        rows[1].bib = None;
        let report = validate_results(&payload(rows), 50.0);
        assert!(report
            .warnings
            .iter()
            .any(|w| w.starts_with("field bib populated")));
    }

    #[test]
    fn test_duplicate_bib_and_position_warn() {
        let mut rows = vec![full_row(1, "Jane"), full_row(1, "John")];
        rows[1].bib = rows[0].bib.clone();
        let report = validate_results(&payload(rows), 50.0);
        assert!(report.warnings.iter().any(|w| w.contains("bib")));
        assert!(report.warnings.iter().any(|w| w.contains("position 1")));
    }

    #[test]
    fn test_non_monotonic_checkpoints_warn() {
        let mut row = full_row(1, "Jane");
        row.checkpoints.push(ScrapedCheckpoint {
            name: "8km".to_string(),
            checkpoint_type: CheckpointType::Distance,
            order: 2,
            split_time: None,
            cumulative_time: Some("20:00".to_string()),
            pace: None,
            segment_distance_meters: None,
        });
        let report = validate_results(&payload(vec![row]), 50.0);
        assert!(report.warnings.iter().any(|w| w.contains("regresses")));
    }

    #[test]
    fn test_empty_payload() {
        let report = validate_results(&payload(vec![]), 50.0);
        assert_eq!(report.stats.total, 0);
        assert!(report.errors.is_empty());
    }
}
