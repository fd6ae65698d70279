//! Checkpoint taxonomy and timing validation helpers.
//!
//! The canonical checkpoint vocabulary used across all organisers:
//! distance markers ("5km", "10mi"), transitions ("T1", "T2") and
//! discipline boundaries ("swim", "bike", "run", "finish").

use regex::Regex;
use std::sync::OnceLock;

use crate::storage::models::{CheckpointType, RaceType, TimingCheckpoint};

/// Named distances in metres.
pub const DISTANCE_CATALOGUE: &[(&str, u32)] = &[
    ("5K", 5_000),
    ("10K", 10_000),
    ("15K", 15_000),
    ("Half Marathon", 21_097),
    ("Marathon", 42_195),
    ("Ultra 50K", 50_000),
    ("Ultra 100K", 100_000),
    ("Sprint Swim", 750),
    ("Sprint Bike", 20_000),
    ("Sprint Run", 5_000),
    ("Olympic Swim", 1_500),
    ("Olympic Bike", 40_000),
    ("Olympic Run", 10_000),
    ("Duathlon Run 1", 10_000),
    ("Duathlon Bike", 40_000),
    ("Duathlon Run 2", 5_000),
];

/// Look up a catalogue distance in metres by name.
pub fn catalogue_meters(name: &str) -> Option<u32> {
    DISTANCE_CATALOGUE
        .iter()
        .find(|(n, _)| n.eq_ignore_ascii_case(name))
        .map(|(_, m)| *m)
}

/// Expected checkpoints for a race type at a given distance.
pub fn expected_checkpoints(race_type: RaceType, distance_meters: u32) -> Vec<String> {
    match race_type {
        RaceType::Running | RaceType::Ultra => {
            let mut names: Vec<String> = (1..=(distance_meters / 5_000))
                .map(|k| format!("{}km", k * 5))
                .collect();
            names.push("finish".to_string());
            names
        }
        RaceType::Triathlon => ["swim", "T1", "bike", "T2", "run", "finish"]
            .iter()
            .map(|s| s.to_string())
            .collect(),
        RaceType::Duathlon => ["run1", "T1", "bike", "T2", "run2", "finish"]
            .iter()
            .map(|s| s.to_string())
            .collect(),
        RaceType::Relay => {
            let mut names: Vec<String> = (1..=4).map(|n| format!("leg{}", n)).collect();
            names.push("finish".to_string());
            names
        }
    }
}

/// Normalise a raw checkpoint label to its canonical token.
pub fn normalize_checkpoint_name(raw: &str) -> String {
    static KM_RE: OnceLock<Regex> = OnceLock::new();
    static MI_RE: OnceLock<Regex> = OnceLock::new();

    let lower = raw.trim().to_lowercase();

    let km_re = KM_RE.get_or_init(|| Regex::new(r"^(\d+(?:\.\d+)?)\s*k(?:m)?$").unwrap());
    if let Some(caps) = km_re.captures(&lower) {
        return format!("{}km", &caps[1]);
    }

    let mi_re = MI_RE.get_or_init(|| Regex::new(r"^(\d+(?:\.\d+)?)\s*mi(?:le)?s?$").unwrap());
    if let Some(caps) = mi_re.captures(&lower) {
        return format!("{}mi", &caps[1]);
    }

    match lower.as_str() {
        "t1" | "transition 1" | "transition1" => "T1".to_string(),
        "t2" | "transition 2" | "transition2" => "T2".to_string(),
        "swim" => "swim".to_string(),
        "bike" | "cycle" | "cycling" => "bike".to_string(),
        "run" => "run".to_string(),
        "finish" | "final" | "end" => "finish".to_string(),
        _ => lower,
    }
}

/// Checkpoint category for a canonical name.
pub fn checkpoint_type_for(name: &str) -> CheckpointType {
    match name {
        "T1" | "T2" => CheckpointType::Transition,
        "swim" | "bike" | "run" | "run1" | "run2" | "finish" => CheckpointType::Discipline,
        _ => CheckpointType::Distance,
    }
}

/// Detect the race type from a free-form distance name.
pub fn detect_race_type(distance_name: &str) -> RaceType {
    let lower = distance_name.to_lowercase();
    if lower.contains("triathlon") || lower.contains("ironman") || lower.contains("tri") {
        RaceType::Triathlon
    } else if lower.contains("duathlon") {
        RaceType::Duathlon
    } else if lower.contains("relay") || lower.contains("ekiden") {
        RaceType::Relay
    } else if lower.contains("ultra") || lower.contains("50k") || lower.contains("100k") {
        RaceType::Ultra
    } else {
        RaceType::Running
    }
}

/// Parse a clock time into seconds. Two tokens are MM:SS, three are
/// HH:MM:SS; anything non-numeric invalidates the parse.
pub fn parse_time_seconds(time: &str) -> Option<u64> {
    let parts: Vec<&str> = time.trim().split(':').collect();
    let nums: Option<Vec<u64>> = parts.iter().map(|p| p.trim().parse().ok()).collect();
    let nums = nums?;

    match nums.as_slice() {
        [m, s] => Some(m * 60 + s),
        [h, m, s] => Some(h * 3600 + m * 60 + s),
        _ => None,
    }
}

/// Reasonable finish-time cutoffs per distance in seconds; times beyond
/// these are flagged implausible.
const CUTOFFS: &[(u32, u64)] = &[
    (5_000, 2 * 3600),
    (10_000, 4 * 3600),
    (21_097, 8 * 3600),
    (42_195, 12 * 3600),
    (50_000, 18 * 3600),
    (100_000, 36 * 3600),
];

/// World records in seconds, per distance and sex ("M"/"F").
const WORLD_RECORDS: &[(u32, &str, u64)] = &[
    (5_000, "M", 755),
    (5_000, "F", 851),
    (10_000, "M", 1_571),
    (10_000, "F", 1_743),
    (21_097, "M", 3_365),
    (21_097, "F", 3_722),
    (42_195, "M", 7_235),
    (42_195, "F", 8_125),
];

/// Cutoff for a distance: exact match, or the nearest catalogue distance at
/// or above it.
pub fn cutoff_seconds(distance_meters: u32) -> Option<u64> {
    CUTOFFS
        .iter()
        .find(|(d, _)| *d >= distance_meters)
        .map(|(_, s)| *s)
}

pub fn world_record_seconds(distance_meters: u32, sex: &str) -> Option<u64> {
    WORLD_RECORDS
        .iter()
        .find(|(d, s, _)| *d == distance_meters && s.eq_ignore_ascii_case(sex))
        .map(|(_, _, t)| *t)
}

/// Outcome of validating one result's timing data.
#[derive(Debug, Default)]
pub struct TimingValidation {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl TimingValidation {
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty() && self.warnings.is_empty()
    }
}

/// Validate a result's checkpoints and finish time.
///
/// Checkpoints are taken in `checkpoint_order`; cumulative times must be
/// monotonically non-decreasing. A finish beyond the distance cutoff is
/// flagged implausible; a finish faster than the world record is a warning
/// only.
pub fn validate_timing(
    checkpoints: &[TimingCheckpoint],
    finish_time: Option<&str>,
    distance_meters: Option<u32>,
    sex: Option<&str>,
) -> TimingValidation {
    let mut v = TimingValidation::default();

    let mut ordered: Vec<&TimingCheckpoint> = checkpoints.iter().collect();
    ordered.sort_by_key(|cp| cp.checkpoint_order);

    let mut prev: Option<(u64, &str)> = None;
    for cp in ordered {
        let Some(cumulative) = cp.cumulative_time.as_deref().and_then(parse_time_seconds) else {
            continue;
        };
        if let Some((prev_secs, prev_name)) = prev {
            if cumulative < prev_secs {
                v.warnings.push(format!(
                    "checkpoint {} cumulative time regresses below {}",
                    cp.checkpoint_name, prev_name
                ));
            }
        }
        prev = Some((cumulative, &cp.checkpoint_name));
    }

    if let (Some(finish), Some(distance)) = (finish_time.and_then(parse_time_seconds), distance_meters) {
        if let Some(cutoff) = cutoff_seconds(distance) {
            if finish > cutoff {
                v.warnings
                    .push(format!("finish time {}s beyond cutoff for {}m", finish, distance));
            }
        }
        if let Some(sex) = sex {
            if let Some(record) = world_record_seconds(distance, sex) {
                if finish < record {
                    v.warnings.push(format!(
                        "finish time {}s faster than the {}m world record",
                        finish, distance
                    ));
                }
            }
        }
    }

    v
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::new_id;

    fn cp(name: &str, order: u32, cumulative: &str) -> TimingCheckpoint {
        TimingCheckpoint {
            id: new_id(),
            result_id: "r1".to_string(),
            checkpoint_type: checkpoint_type_for(name),
            checkpoint_name: name.to_string(),
            checkpoint_order: order,
            split_time: None,
            cumulative_time: Some(cumulative.to_string()),
            pace: None,
            segment_distance_meters: None,
        }
    }

    #[test]
    fn test_normalize_distance_markers() {
        assert_eq!(normalize_checkpoint_name("5 km"), "5km");
        assert_eq!(normalize_checkpoint_name("5km"), "5km");
        assert_eq!(normalize_checkpoint_name("5 K"), "5km");
        assert_eq!(normalize_checkpoint_name("13 miles"), "13mi");
        assert_eq!(normalize_checkpoint_name("10 mi"), "10mi");
    }

    #[test]
    fn test_normalize_transitions_and_disciplines() {
        assert_eq!(normalize_checkpoint_name("transition 1"), "T1");
        assert_eq!(normalize_checkpoint_name("T1"), "T1");
        assert_eq!(normalize_checkpoint_name("Transition 2"), "T2");
        assert_eq!(normalize_checkpoint_name("Cycle"), "bike");
        assert_eq!(normalize_checkpoint_name("SWIM"), "swim");
        assert_eq!(normalize_checkpoint_name("Final"), "finish");
        assert_eq!(normalize_checkpoint_name("end"), "finish");
    }

    #[test]
    fn test_checkpoint_types() {
        assert_eq!(checkpoint_type_for("T1"), CheckpointType::Transition);
        assert_eq!(checkpoint_type_for("swim"), CheckpointType::Discipline);
        assert_eq!(checkpoint_type_for("5km"), CheckpointType::Distance);
    }

    #[test]
    fn test_detect_race_type() {
        assert_eq!(detect_race_type("Sprint Triathlon"), RaceType::Triathlon);
        assert_eq!(detect_race_type("Ironman 70.3"), RaceType::Triathlon);
        assert_eq!(detect_race_type("City Duathlon"), RaceType::Duathlon);
        assert_eq!(detect_race_type("Corporate Relay"), RaceType::Relay);
        assert_eq!(detect_race_type("Trail Ultra"), RaceType::Ultra);
        assert_eq!(detect_race_type("50K Challenge"), RaceType::Ultra);
        assert_eq!(detect_race_type("Half Marathon"), RaceType::Running);
    }

    #[test]
    fn test_parse_time() {
        assert_eq!(parse_time_seconds("22:10"), Some(1330));
        assert_eq!(parse_time_seconds("1:32:05"), Some(5525));
        assert_eq!(parse_time_seconds("DNF"), None);
        assert_eq!(parse_time_seconds("1:2x:05"), None);
        assert_eq!(parse_time_seconds(""), None);
    }

    #[test]
    fn test_expected_checkpoints_running() {
        let names = expected_checkpoints(RaceType::Running, 21_097);
        assert_eq!(names, vec!["5km", "10km", "15km", "20km", "finish"]);
    }

    #[test]
    fn test_expected_checkpoints_triathlon() {
        let names = expected_checkpoints(RaceType::Triathlon, 51_500);
        assert_eq!(names, vec!["swim", "T1", "bike", "T2", "run", "finish"]);
    }

    #[test]
    fn test_catalogue() {
        assert_eq!(catalogue_meters("Half Marathon"), Some(21_097));
        assert_eq!(catalogue_meters("marathon"), Some(42_195));
        assert_eq!(catalogue_meters("Vertical Mile"), None);
    }

    #[test]
    fn test_monotonic_checkpoints_clean() {
        let cps = vec![cp("5km", 1, "22:10"), cp("10km", 2, "44:31"), cp("finish", 3, "1:32:05")];
        let v = validate_timing(&cps, Some("1:32:05"), Some(21_097), Some("F"));
        assert!(v.is_clean(), "unexpected findings: {:?}", v);
    }

    #[test]
    fn test_regressing_cumulative_flagged() {
        let cps = vec![cp("5km", 1, "25:00"), cp("10km", 2, "24:00")];
        let v = validate_timing(&cps, None, None, None);
        assert_eq!(v.warnings.len(), 1);
        assert!(v.warnings[0].contains("10km"));
    }

    #[test]
    fn test_cutoff_and_record_flags() {
        let v = validate_timing(&[], Some("13:00:00"), Some(42_195), None);
        assert!(v.warnings.iter().any(|w| w.contains("beyond cutoff")));

        let v = validate_timing(&[], Some("1:55:00"), Some(42_195), Some("M"));
        assert!(v.warnings.iter().any(|w| w.contains("world record")));
    }
}
