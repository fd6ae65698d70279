//! EvoChip scraper: paginated HTML result tables.
//!
//! The organiser publishes one table per distance page, headed by bib and
//! name columns, with km splits as extra columns. Page count comes from
//! pagination anchors; sites that render rows with JavaScript fall back to
//! the headless renderer when the static page looks truncated.

use chrono::NaiveDate;
use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use std::collections::HashMap;

use super::browser::detect_pagination;
use super::checkpoints::{
    catalogue_meters, checkpoint_type_for, detect_race_type, expected_checkpoints,
    normalize_checkpoint_name,
};
use super::{
    parse_positive, AthleteHistoryRow, Capabilities, Progress, ProgressSender, ProgressStage,
    ScrapeContext, ScrapeError, ScrapeMetadata, ScrapeOptions, ScrapedCheckpoint, ScrapedDistance,
    ScrapedEvent, ScrapedResult, ScrapedResults, UrlAnalysis,
};
use crate::storage::models::ResultStatus;

/// Static row counts at an exact multiple of this trigger the headless
/// fallback when pagination claims a single page.
const TRUNCATION_BLOCK: u32 = 100;

pub fn matches_url(url: &str) -> bool {
    url.contains("evochip.")
}

pub fn capabilities() -> Capabilities {
    let mut expected = HashMap::new();
    expected.insert(
        "10K".to_string(),
        vec!["5km".to_string(), "finish".to_string()],
    );
    expected.insert(
        "Half Marathon".to_string(),
        vec![
            "5km".to_string(),
            "10km".to_string(),
            "15km".to_string(),
            "finish".to_string(),
        ],
    );
    Capabilities {
        supports_headless: true,
        supports_pagination: true,
        supports_multiple_distances: false,
        supports_checkpoints: true,
        expected_checkpoints: expected,
    }
}

/// Column layout of a located results table.
#[derive(Debug, Default)]
struct ColumnMap {
    position: Option<usize>,
    bib: Option<usize>,
    name: Option<usize>,
    country: Option<usize>,
    finish: Option<usize>,
    gender_rank: Option<usize>,
    category_rank: Option<usize>,
    /// (canonical checkpoint name, column index), in column order.
    splits: Vec<(String, usize)>,
}

impl ColumnMap {
    fn from_headers(headers: &[String]) -> Self {
        let mut map = ColumnMap::default();
        let split_re = Regex::new(r"^\d+(?:\.\d+)?\s*k(?:m)?$").unwrap();

        for (idx, raw) in headers.iter().enumerate() {
            let label = raw.trim().to_lowercase();
            if label.contains("gender") {
                map.gender_rank.get_or_insert(idx);
            } else if label.contains("cat") {
                map.category_rank.get_or_insert(idx);
            } else if label.contains("bib") {
                map.bib.get_or_insert(idx);
            } else if label.contains("name") {
                map.name.get_or_insert(idx);
            } else if label.contains("country") || label.contains("nat") {
                map.country.get_or_insert(idx);
            } else if label.contains("finish") || label == "time" || label == "result" {
                map.finish.get_or_insert(idx);
            } else if split_re.is_match(&label) {
                map.splits.push((normalize_checkpoint_name(&label), idx));
            } else if label.contains("pos") || label.contains("rank") || label.contains("place") {
                map.position.get_or_insert(idx);
            }
        }
        map
    }

    fn usable(&self) -> bool {
        self.bib.is_some() && self.name.is_some()
    }
}

/// One parsed results page.
#[derive(Debug)]
pub(crate) struct ParsedPage {
    pub event_name: Option<String>,
    pub event_date: Option<NaiveDate>,
    pub distance_name: Option<String>,
    pub rows: Vec<ScrapedResult>,
}

fn cell_texts(row: ElementRef) -> Vec<String> {
    let td = Selector::parse("td").unwrap();
    row.select(&td)
        .map(|cell| cell.text().collect::<String>().trim().to_string())
        .collect()
}

fn header_texts(table: ElementRef) -> Vec<String> {
    let th = Selector::parse("th").unwrap();
    table
        .select(&th)
        .map(|cell| cell.text().collect::<String>().trim().to_string())
        .collect()
}

/// Locate the results table: the first table whose headers mention both
/// bib and name.
fn locate_table(document: &Html) -> Option<(Vec<String>, Vec<Vec<String>>)> {
    let table_sel = Selector::parse("table").unwrap();
    let tr_sel = Selector::parse("tr").unwrap();
    let th_sel = Selector::parse("th").unwrap();

    for table in document.select(&table_sel) {
        let headers = header_texts(table);
        let joined = headers.join(" ").to_lowercase();
        if !(joined.contains("bib") && joined.contains("name")) {
            continue;
        }

        let mut rows = Vec::new();
        for tr in table.select(&tr_sel) {
            if tr.select(&th_sel).next().is_some() {
                continue;
            }
            let cells = cell_texts(tr);
            if !cells.is_empty() {
                rows.push(cells);
            }
        }
        return Some((headers, rows));
    }
    None
}

fn parse_row(map: &ColumnMap, cells: &[String]) -> Option<ScrapedResult> {
    let get = |idx: Option<usize>| idx.and_then(|i| cells.get(i)).map(|s| s.trim());
    let non_empty = |v: Option<&str>| v.filter(|s| !s.is_empty() && *s != "-").map(String::from);

    let name = non_empty(get(map.name))?;

    let finish_raw = get(map.finish).unwrap_or("");
    let status = match finish_raw.to_uppercase().as_str() {
        "DNF" => Some(ResultStatus::Dnf),
        "DNS" => Some(ResultStatus::Dns),
        "DQ" | "DSQ" => Some(ResultStatus::Dq),
        _ => None,
    };
    let finish_time = if status.is_none() {
        non_empty(Some(finish_raw))
    } else {
        None
    };

    let mut checkpoints = Vec::new();
    for (order, (cp_name, idx)) in map.splits.iter().enumerate() {
        let Some(value) = non_empty(get(Some(*idx))) else {
            continue;
        };
        let segment = cp_name
            .strip_suffix("km")
            .and_then(|n| n.parse::<f64>().ok())
            .map(|km| (km * 1000.0) as u32);
        checkpoints.push(ScrapedCheckpoint {
            name: cp_name.clone(),
            checkpoint_type: checkpoint_type_for(cp_name),
            order: order as u32 + 1,
            split_time: None,
            cumulative_time: Some(value),
            pace: None,
            segment_distance_meters: segment,
        });
    }

    let mut result = ScrapedResult {
        position: get(map.position).and_then(parse_positive),
        bib: non_empty(get(map.bib)),
        name,
        country: non_empty(get(map.country)),
        finish_time,
        gender_position: get(map.gender_rank).and_then(parse_positive),
        category_position: get(map.category_rank).and_then(parse_positive),
        status,
        checkpoints,
        ..Default::default()
    };
    result.fields_provided = result.populated_fields();
    Some(result)
}

fn extract_event_name(document: &Html) -> Option<String> {
    for sel in ["h1.event-title", "h1", ".event-name", "title"] {
        if let Ok(selector) = Selector::parse(sel) {
            if let Some(elem) = document.select(&selector).next() {
                let text = elem.text().collect::<String>().trim().to_string();
                if text.len() > 2 {
                    return Some(text);
                }
            }
        }
    }
    None
}

fn extract_event_date(text: &str) -> Option<NaiveDate> {
    let iso_re = Regex::new(r"(\d{4})-(\d{2})-(\d{2})").unwrap();
    if let Some(caps) = iso_re.captures(text) {
        if let Some(date) = NaiveDate::from_ymd_opt(
            caps[1].parse().ok()?,
            caps[2].parse().ok()?,
            caps[3].parse().ok()?,
        ) {
            return Some(date);
        }
    }

    let dmy_re = Regex::new(r"(\d{1,2})/(\d{1,2})/(\d{4})").unwrap();
    if let Some(caps) = dmy_re.captures(text) {
        return NaiveDate::from_ymd_opt(
            caps[3].parse().ok()?,
            caps[2].parse().ok()?,
            caps[1].parse().ok()?,
        );
    }
    None
}

fn extract_distance_name(document: &Html) -> Option<String> {
    for sel in ["h2.distance", "h2", ".race-distance"] {
        if let Ok(selector) = Selector::parse(sel) {
            if let Some(elem) = document.select(&selector).next() {
                let text = elem.text().collect::<String>().trim().to_string();
                if !text.is_empty() {
                    return Some(text);
                }
            }
        }
    }
    None
}

/// Distance in metres from a free-form distance name.
pub(crate) fn parse_distance_meters(name: &str) -> Option<u32> {
    if let Some(meters) = catalogue_meters(name) {
        return Some(meters);
    }
    let lower = name.to_lowercase();
    if lower.contains("half") {
        return Some(21_097);
    }
    if lower.contains("marathon") {
        return Some(42_195);
    }
    let km_re = Regex::new(r"(\d+(?:\.\d+)?)\s*k").unwrap();
    if let Some(caps) = km_re.captures(&lower) {
        let km: f64 = caps[1].parse().ok()?;
        return Some((km * 1000.0) as u32);
    }
    let mi_re = Regex::new(r"(\d+(?:\.\d+)?)\s*mi").unwrap();
    if let Some(caps) = mi_re.captures(&lower) {
        let mi: f64 = caps[1].parse().ok()?;
        return Some((mi * 1609.344) as u32);
    }
    None
}

/// Parse one results page of HTML.
pub(crate) fn parse_results_page(html: &str) -> Result<ParsedPage, ScrapeError> {
    let document = Html::parse_document(html);

    let Some((headers, raw_rows)) = locate_table(&document) else {
        return Err(ScrapeError::Parse("no results table found".to_string()));
    };

    let map = ColumnMap::from_headers(&headers);
    if !map.usable() {
        return Err(ScrapeError::Parse(
            "results table lacks bib and name columns".to_string(),
        ));
    }

    let rows: Vec<ScrapedResult> = raw_rows
        .iter()
        .filter_map(|cells| parse_row(&map, cells))
        .collect();

    let full_text = document
        .root_element()
        .text()
        .collect::<String>();

    Ok(ParsedPage {
        event_name: extract_event_name(&document),
        event_date: extract_event_date(&full_text),
        distance_name: extract_distance_name(&document),
        rows,
    })
}

fn page_url(base: &str, page: u32) -> String {
    if page <= 1 {
        return base.to_string();
    }
    if base.contains('?') {
        format!("{}&page={}", base, page)
    } else {
        format!("{}?page={}", base, page)
    }
}

pub async fn analyze_url(ctx: &ScrapeContext, url: &str) -> Result<UrlAnalysis, ScrapeError> {
    if !matches_url(url) {
        return Ok(UrlAnalysis::invalid());
    }

    let page = ctx.fetcher.get(url).await?;
    let parsed = match parse_results_page(&page.body) {
        Ok(parsed) => parsed,
        Err(_) => return Ok(UrlAnalysis::invalid()),
    };

    let pagination = detect_pagination(&page.body);
    let first_page_rows = parsed.rows.len() as u32;
    let requires_headless = looks_truncated(first_page_rows, pagination.total_pages);

    Ok(UrlAnalysis {
        valid: true,
        organiser: Some("evochip".to_string()),
        event_name: parsed.event_name,
        event_date: parsed.event_date,
        estimated_distances: parsed.distance_name.into_iter().collect(),
        estimated_results: Some(first_page_rows * pagination.total_pages),
        requires_headless,
    })
}

fn looks_truncated(first_page_rows: u32, total_pages: u32) -> bool {
    first_page_rows > 0 && first_page_rows % TRUNCATION_BLOCK == 0 && total_pages == 1
}

pub async fn scrape_event(
    ctx: &ScrapeContext,
    url: &str,
    options: &ScrapeOptions,
    progress: &ProgressSender,
) -> Result<ScrapedResults, ScrapeError> {
    let started_at = chrono::Utc::now();
    progress.update(Progress::stage(ProgressStage::Initializing));

    ctx.cancel.check()?;
    progress.update(Progress::stage(ProgressStage::Connecting));
    ctx.politeness.pace().await;
    let first = ctx.fetcher.get(url).await?;

    progress.update(Progress::stage(ProgressStage::DetectingPages));
    let parsed = parse_results_page(&first.body)?;
    let pagination = detect_pagination(&first.body);
    let mut total_pages = pagination.total_pages;
    if let Some(cap) = options.max_pages {
        total_pages = total_pages.min(cap);
    }

    let mut warnings = Vec::new();
    let mut errors = Vec::new();
    let mut used_headless = false;
    let mut rows = parsed.rows;

    if looks_truncated(rows.len() as u32, pagination.total_pages) && options.allow_headless {
        // An exact block of rows with no pagination anchors usually means
        // the rest is rendered client-side.
        match scrape_rendered(ctx, url).await {
            Ok(rendered_rows) if rendered_rows.len() > rows.len() => {
                used_headless = true;
                rows = rendered_rows;
            }
            Ok(_) => {
                warnings.push("headless pass found no additional rows".to_string());
            }
            Err(e) => {
                // Keep the static result when the renderer fails
                warnings.push(format!("headless fallback failed: {}", e));
            }
        }
    } else if total_pages > 1 {
        for page_no in 2..=total_pages {
            ctx.cancel.check()?;
            ctx.politeness.pace().await;

            let mut p = Progress::stage(ProgressStage::Scraping);
            p.current_page = page_no;
            p.total_pages = total_pages;
            p.results_scraped = rows.len() as u32;
            p.percent_complete = ((page_no - 1) * 100 / total_pages) as u8;
            progress.update(p);

            match ctx.fetcher.get(&page_url(url, page_no)).await {
                Ok(page) => match parse_results_page(&page.body) {
                    Ok(parsed) => rows.extend(parsed.rows),
                    Err(e) => warnings.push(format!("page {}: {}", page_no, e)),
                },
                Err(e) => errors.push(format!("page {}: {}", page_no, e)),
            }
        }
    }

    if rows.is_empty() {
        return Err(ScrapeError::Parse("zero rows parsed".to_string()));
    }

    progress.update(Progress::stage(ProgressStage::Validating));

    let distance_name = parsed.distance_name.unwrap_or_else(|| "Results".to_string());
    let race_type = detect_race_type(&distance_name);
    let distance_meters = parse_distance_meters(&distance_name).unwrap_or(0);
    for row in &mut rows {
        row.distance_name = Some(distance_name.clone());
    }

    let event = ScrapedEvent {
        url: url.to_string(),
        organiser: "evochip".to_string(),
        name: parsed.event_name.unwrap_or_else(|| distance_name.clone()),
        date: parsed
            .event_date
            .unwrap_or_else(|| chrono::Utc::now().date_naive()),
        location: None,
        distances: vec![ScrapedDistance {
            name: distance_name,
            distance_meters,
            race_type,
            expected_checkpoints: expected_checkpoints(race_type, distance_meters),
            participant_count: Some(rows.len() as u32),
        }],
    };

    let total_results = rows.len() as u32;
    Ok(ScrapedResults {
        event,
        results: rows,
        metadata: ScrapeMetadata {
            started_at,
            completed_at: chrono::Utc::now(),
            total_pages,
            total_results,
            used_headless_browser: used_headless,
            errors,
            warnings,
        },
    })
}

/// Render the page, let lazy rows load, and re-parse the table.
async fn scrape_rendered(ctx: &ScrapeContext, url: &str) -> Result<Vec<ScrapedResult>, ScrapeError> {
    let page = ctx
        .renderer
        .acquire_page(url)
        .await
        .map_err(|e| ScrapeError::Browser(e.to_string()))?;

    let result = async {
        let _ = page.block_resources().await;
        page.wait_for_selector("table")
            .await
            .map_err(|e| ScrapeError::Browser(e.to_string()))?;
        page.scroll_to_load()
            .await
            .map_err(|e| ScrapeError::Browser(e.to_string()))?;
        let html = page
            .content()
            .await
            .map_err(|e| ScrapeError::Browser(e.to_string()))?;
        Ok(parse_results_page(&html)?.rows)
    }
    .await;

    page.release().await;
    result
}

/// Scrape an athlete's paginated result history.
pub async fn scrape_athlete_profile(
    ctx: &ScrapeContext,
    url: &str,
) -> Result<Vec<AthleteHistoryRow>, ScrapeError> {
    let mut rows = Vec::new();
    let mut page_no = 1;
    let mut total_pages = 1;

    loop {
        ctx.cancel.check()?;
        ctx.politeness.pace().await;
        let page = ctx.fetcher.get(&page_url(url, page_no)).await?;

        if page_no == 1 {
            total_pages = detect_pagination(&page.body).total_pages;
        }
        rows.extend(parse_history_page(&page.body));

        page_no += 1;
        if page_no > total_pages {
            break;
        }
    }

    Ok(rows)
}

fn parse_history_page(html: &str) -> Vec<AthleteHistoryRow> {
    let document = Html::parse_document(html);
    let table_sel = Selector::parse("table").unwrap();
    let tr_sel = Selector::parse("tr").unwrap();
    let th_sel = Selector::parse("th").unwrap();

    let mut rows = Vec::new();
    for table in document.select(&table_sel) {
        let headers = header_texts(table).join(" ").to_lowercase();
        if !(headers.contains("event") && headers.contains("time")) {
            continue;
        }
        for tr in table.select(&tr_sel) {
            if tr.select(&th_sel).next().is_some() {
                continue;
            }
            let cells = cell_texts(tr);
            if cells.len() < 2 || cells[0].is_empty() {
                continue;
            }
            rows.push(AthleteHistoryRow {
                event_name: cells[0].clone(),
                event_date: extract_event_date(&cells.join(" ")),
                distance_name: cells.get(2).filter(|s| !s.is_empty()).cloned(),
                position: cells.get(3).and_then(|s| parse_positive(s)),
                finish_time: cells.get(4).filter(|s| !s.is_empty()).cloned(),
            });
        }
        break;
    }
    rows
}
