//! Hopasports scraper: results API embedded in the event page.
//!
//! The event page carries a component attribute wrapping a quoted
//! `loadRaces(base, [...])` call: a base API URL plus one descriptor per
//! race. Each descriptor is fetched as JSON and mapped through the field
//! alias tables; payloads that come back as HTML fall through to table
//! parsing.

use chrono::NaiveDate;
use regex::Regex;
use scraper::{Html, Selector};
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;

use super::checkpoints::{checkpoint_type_for, detect_race_type, expected_checkpoints, normalize_checkpoint_name};
use super::evochip::{parse_distance_meters, parse_results_page};
use super::{
    parse_positive, Capabilities, Progress, ProgressSender, ProgressStage, ScrapeContext,
    ScrapeError, ScrapeMetadata, ScrapeOptions, ScrapedCheckpoint, ScrapedDistance, ScrapedEvent,
    ScrapedResult, ScrapedResults, UrlAnalysis,
};
use crate::storage::models::ResultStatus;

/// Logical result field -> accepted source keys, in priority order.
const FIELD_ALIASES: &[(&str, &[&str])] = &[
    ("position", &["position", "pos", "rank", "place", "overall_position"]),
    ("bib", &["bib", "bib_number", "bibno", "start_number"]),
    ("name", &["name", "full_name", "athlete_name", "participant"]),
    ("gender", &["gender", "sex"]),
    ("category", &["category", "age_group", "division", "cat"]),
    ("finish_time", &["finish", "finish_time", "official_time", "time", "result"]),
    ("gun_time", &["gun_time", "gross_time"]),
    ("chip_time", &["chip_time", "net_time"]),
    ("pace", &["pace", "avg_pace"]),
    ("gender_position", &["gender_position", "gender_rank", "sex_position"]),
    ("category_position", &["category_position", "category_rank", "cat_position"]),
    ("country", &["country", "nation", "nationality"]),
    ("club", &["club", "team"]),
    ("age", &["age"]),
    ("status", &["status"]),
    ("time_behind", &["time_behind", "behind", "gap"]),
];

/// Keys tried for the row array when the payload is a JSON object.
const PAYLOAD_KEYS: &[&str] = &["results", "data", "items", "athletes"];

/// Keys tried for a row's checkpoint list.
const CHECKPOINT_KEYS: &[&str] = &["checkpoints", "splits", "laps"];

pub fn matches_url(url: &str) -> bool {
    url.contains("hopasports.")
}

pub fn capabilities() -> Capabilities {
    let mut expected = HashMap::new();
    for name in ["5K", "10K", "Half Marathon", "Marathon"] {
        let meters = parse_distance_meters(name).unwrap_or(0);
        expected.insert(
            name.to_string(),
            expected_checkpoints(detect_race_type(name), meters),
        );
    }
    Capabilities {
        supports_headless: false,
        supports_pagination: false,
        supports_multiple_distances: true,
        supports_checkpoints: true,
        expected_checkpoints: expected,
    }
}

/// One race entry from the embedded configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct RaceDescriptor {
    pub race_id: Value,
    pub pt: String,
    #[serde(default)]
    pub title: String,
}

/// The embedded API configuration of an event page.
#[derive(Debug, Clone)]
pub struct RaceConfig {
    pub base_url: String,
    pub races: Vec<RaceDescriptor>,
}

/// API URL for one race descriptor.
pub fn race_api_url(config: &RaceConfig, race: &RaceDescriptor) -> String {
    let race_id = match &race.race_id {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    let separator = if config.base_url.contains('?') { '&' } else { '?' };
    format!(
        "{}{}race_id={}&pt={}",
        config.base_url, separator, race_id, race.pt
    )
}

fn unescape_attribute(raw: &str) -> String {
    raw.replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&amp;", "&")
}

/// Extract the embedded race configuration from an event page.
pub fn extract_race_config(html: &str) -> Option<RaceConfig> {
    let unescaped = unescape_attribute(html);
    let call_re = Regex::new(r#"(?s)loadRaces\(\s*["']([^"']+)["']\s*,\s*(\[.*?\])\s*\)"#).ok()?;
    let caps = call_re.captures(&unescaped)?;

    let base_url = caps[1].to_string();
    let races: Vec<RaceDescriptor> = serde_json::from_str(&caps[2]).ok()?;
    if races.is_empty() {
        return None;
    }

    Some(RaceConfig { base_url, races })
}

fn alias_lookup<'a>(row: &'a Value, aliases: &[&str]) -> Option<(&'a Value, String)> {
    let obj = row.as_object()?;
    for key in aliases {
        if let Some(value) = obj.get(*key) {
            if !value.is_null() {
                return Some((value, key.to_string()));
            }
        }
    }
    None
}

fn value_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => {
            let trimmed = s.trim();
            if trimmed.is_empty() || trimmed == "-" {
                None
            } else {
                Some(trimmed.to_string())
            }
        }
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn value_positive(value: &Value) -> Option<u32> {
    match value {
        Value::Number(n) => n.as_u64().map(|v| v as u32).filter(|v| *v > 0),
        Value::String(s) => parse_positive(s),
        _ => None,
    }
}

fn parse_checkpoints(row: &Value) -> Vec<ScrapedCheckpoint> {
    let mut checkpoints = Vec::new();
    let Some(list) = CHECKPOINT_KEYS
        .iter()
        .find_map(|key| row.get(key).and_then(Value::as_array))
    else {
        return checkpoints;
    };

    for (idx, entry) in list.iter().enumerate() {
        let Some(raw_name) = ["name", "label", "checkpoint"]
            .iter()
            .find_map(|k| entry.get(k).and_then(Value::as_str))
        else {
            continue;
        };
        let name = normalize_checkpoint_name(raw_name);
        let cumulative = ["cumulative", "total", "time"]
            .iter()
            .find_map(|k| entry.get(k))
            .and_then(value_string);
        let split = ["split", "lap_time"]
            .iter()
            .find_map(|k| entry.get(k))
            .and_then(value_string);

        checkpoints.push(ScrapedCheckpoint {
            checkpoint_type: checkpoint_type_for(&name),
            order: entry
                .get("order")
                .and_then(value_positive)
                .unwrap_or(idx as u32 + 1),
            segment_distance_meters: name
                .strip_suffix("km")
                .and_then(|n| n.parse::<f64>().ok())
                .map(|km| (km * 1000.0) as u32),
            name,
            split_time: split,
            cumulative_time: cumulative,
            pace: entry.get("pace").and_then(value_string),
        });
    }
    checkpoints
}

/// Map one JSON row through the alias tables.
///
/// Returns `None` for rows with no usable name. The returned result's
/// `fields_provided` lists the logical fields whose source keys were
/// present.
pub fn parse_result_object(row: &Value) -> Option<ScrapedResult> {
    let mut result = ScrapedResult::default();
    let mut provided = Vec::new();

    for (field, aliases) in FIELD_ALIASES {
        let Some((value, _key)) = alias_lookup(row, aliases) else {
            continue;
        };

        let stored = match *field {
            "position" => {
                result.position = value_positive(value);
                result.position.is_some()
            }
            "bib" => {
                result.bib = value_string(value);
                result.bib.is_some()
            }
            "name" => {
                if let Some(name) = value_string(value) {
                    result.name = name;
                    true
                } else {
                    false
                }
            }
            "gender" => {
                result.gender = value_string(value);
                result.gender.is_some()
            }
            "category" => {
                result.category = value_string(value);
                result.category.is_some()
            }
            "finish_time" => {
                result.finish_time = value_string(value);
                result.finish_time.is_some()
            }
            "gun_time" => {
                result.gun_time = value_string(value);
                result.gun_time.is_some()
            }
            "chip_time" => {
                result.chip_time = value_string(value);
                result.chip_time.is_some()
            }
            "pace" => {
                result.pace = value_string(value);
                result.pace.is_some()
            }
            "gender_position" => {
                result.gender_position = value_positive(value);
                result.gender_position.is_some()
            }
            "category_position" => {
                result.category_position = value_positive(value);
                result.category_position.is_some()
            }
            "country" => {
                result.country = value_string(value);
                result.country.is_some()
            }
            "club" => {
                result.club = value_string(value);
                result.club.is_some()
            }
            "age" => {
                result.age = value_positive(value);
                result.age.is_some()
            }
            "status" => {
                result.status = value_string(value).and_then(|s| match s.to_lowercase().as_str() {
                    "finished" | "ok" => Some(ResultStatus::Finished),
                    "dnf" => Some(ResultStatus::Dnf),
                    "dns" => Some(ResultStatus::Dns),
                    "dq" | "dsq" => Some(ResultStatus::Dq),
                    _ => None,
                });
                result.status.is_some()
            }
            "time_behind" => {
                result.time_behind = value_string(value);
                result.time_behind.is_some()
            }
            _ => false,
        };

        if stored {
            provided.push(field.to_string());
        }
    }

    if result.name.trim().is_empty() {
        return None;
    }

    result.checkpoints = parse_checkpoints(row);
    if !result.checkpoints.is_empty() {
        provided.push("checkpoints".to_string());
    }
    result.fields_provided = provided;
    Some(result)
}

/// Pull the row array out of an API payload.
fn payload_rows(payload: &Value) -> Option<&Vec<Value>> {
    match payload {
        Value::Array(rows) => Some(rows),
        Value::Object(obj) => PAYLOAD_KEYS
            .iter()
            .find_map(|key| obj.get(*key).and_then(Value::as_array)),
        _ => None,
    }
}

/// Parse an API body: JSON rows, or an HTML table when the endpoint
/// answers with markup.
fn parse_race_payload(body: &str) -> Result<(Vec<ScrapedResult>, Vec<String>), ScrapeError> {
    let mut warnings = Vec::new();

    if let Ok(payload) = serde_json::from_str::<Value>(body) {
        let Some(raw_rows) = payload_rows(&payload) else {
            return Err(ScrapeError::Parse(
                "payload has no recognisable row array".to_string(),
            ));
        };
        let mut rows = Vec::new();
        for (idx, raw) in raw_rows.iter().enumerate() {
            match parse_result_object(raw) {
                Some(row) => rows.push(row),
                None => warnings.push(format!("row {}: skipped, no name", idx + 1)),
            }
        }
        return Ok((rows, warnings));
    }

    // HTML fallback
    let page = parse_results_page(body)?;
    Ok((page.rows, warnings))
}

fn extract_event_header(html: &str) -> (Option<String>, Option<NaiveDate>) {
    let document = Html::parse_document(html);

    let mut name = None;
    for sel in ["h1", ".event-header h2", "title"] {
        if let Ok(selector) = Selector::parse(sel) {
            if let Some(elem) = document.select(&selector).next() {
                let text = elem.text().collect::<String>().trim().to_string();
                if text.len() > 2 {
                    name = Some(text);
                    break;
                }
            }
        }
    }

    let text = document.root_element().text().collect::<String>();
    let date_re = Regex::new(r"(\d{4})-(\d{2})-(\d{2})").unwrap();
    let date = date_re.captures(&text).and_then(|caps| {
        NaiveDate::from_ymd_opt(
            caps[1].parse().ok()?,
            caps[2].parse().ok()?,
            caps[3].parse().ok()?,
        )
    });

    (name, date)
}

pub async fn analyze_url(ctx: &ScrapeContext, url: &str) -> Result<UrlAnalysis, ScrapeError> {
    if !matches_url(url) {
        return Ok(UrlAnalysis::invalid());
    }

    let page = ctx.fetcher.get(url).await?;
    let Some(config) = extract_race_config(&page.body) else {
        return Ok(UrlAnalysis::invalid());
    };

    let (name, date) = extract_event_header(&page.body);
    Ok(UrlAnalysis {
        valid: true,
        organiser: Some("hopasports".to_string()),
        event_name: name,
        event_date: date,
        estimated_distances: config.races.iter().map(|r| r.title.clone()).collect(),
        estimated_results: None,
        requires_headless: false,
    })
}

pub async fn scrape_event(
    ctx: &ScrapeContext,
    url: &str,
    _options: &ScrapeOptions,
    progress: &ProgressSender,
) -> Result<ScrapedResults, ScrapeError> {
    let started_at = chrono::Utc::now();
    progress.update(Progress::stage(ProgressStage::Initializing));

    ctx.cancel.check()?;
    progress.update(Progress::stage(ProgressStage::Connecting));
    ctx.politeness.pace().await;
    let page = ctx.fetcher.get(url).await?;

    let Some(config) = extract_race_config(&page.body) else {
        return Err(ScrapeError::Parse(
            "no embedded race configuration found".to_string(),
        ));
    };
    let (event_name, event_date) = extract_event_header(&page.body);

    progress.update(Progress::stage(ProgressStage::DetectingPages));
    let total_races = config.races.len() as u32;

    let mut results = Vec::new();
    let mut distances = Vec::new();
    let mut errors = Vec::new();
    let mut warnings = Vec::new();

    for (idx, race) in config.races.iter().enumerate() {
        ctx.cancel.check()?;
        ctx.politeness.pace().await;

        let mut p = Progress::stage(ProgressStage::Scraping);
        p.current_page = idx as u32 + 1;
        p.total_pages = total_races;
        p.results_scraped = results.len() as u32;
        p.percent_complete = (idx as u32 * 100 / total_races) as u8;
        progress.update(p);

        let api_url = race_api_url(&config, race);
        let body = match ctx.fetcher.get(&api_url).await {
            Ok(page) => page.body,
            Err(e) => {
                errors.push(format!("race {}: {}", race.title, e));
                continue;
            }
        };

        let distance_name = if race.title.is_empty() {
            format!("Race {}", idx + 1)
        } else {
            race.title.clone()
        };

        match parse_race_payload(&body) {
            Ok((mut rows, mut row_warnings)) => {
                warnings.append(&mut row_warnings);
                for row in &mut rows {
                    row.distance_name = Some(distance_name.clone());
                }
                let race_type = detect_race_type(&distance_name);
                let distance_meters = parse_distance_meters(&distance_name).unwrap_or(0);
                distances.push(ScrapedDistance {
                    name: distance_name,
                    distance_meters,
                    race_type,
                    expected_checkpoints: expected_checkpoints(race_type, distance_meters),
                    participant_count: Some(rows.len() as u32),
                });
                results.append(&mut rows);
            }
            Err(e) => errors.push(format!("race {}: {}", distance_name, e)),
        }
    }

    if results.is_empty() {
        return Err(ScrapeError::Parse("zero rows parsed".to_string()));
    }

    progress.update(Progress::stage(ProgressStage::Validating));

    let total_results = results.len() as u32;
    Ok(ScrapedResults {
        event: ScrapedEvent {
            url: url.to_string(),
            organiser: "hopasports".to_string(),
            name: event_name.unwrap_or_else(|| "Hopasports Event".to_string()),
            date: event_date.unwrap_or_else(|| chrono::Utc::now().date_naive()),
            location: None,
            distances,
        },
        results,
        metadata: ScrapeMetadata {
            started_at,
            completed_at: chrono::Utc::now(),
            total_pages: total_races,
            total_results,
            used_headless_browser: false,
            errors,
            warnings,
        },
    })
}
