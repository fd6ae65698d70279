//! SQLite repository for CRUD operations on events, results and jobs.
//!
//! All writes honour the unique constraints from the schema; duplicate
//! inserts are treated as success so every ingestion step is idempotent.
//! The connection is guarded by a mutex so the store can be shared across
//! tasks.

use anyhow::{bail, Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::Mutex;
use uuid::Uuid;

use super::models::{
    Athlete, EndpointProbe, EndpointStatus, EndpointStatusCurrent, Event, EventDistance,
    EventLinkType, JobStatus, MonitoredEndpoint, RaceResult, ResultSource, ResultStatus,
    ScrapeJob, TimingCheckpoint,
};
use super::schema::create_tables;

/// Maximum length of a persisted job error message.
const MAX_ERROR_LEN: usize = 100;

/// Shared persistence adapter for the pipeline.
pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    /// Open (or create) the database at the given path.
    pub fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).context("Failed to create database directory")?;
        }

        let conn = Connection::open(db_path).context("Failed to open database")?;
        conn.execute("PRAGMA foreign_keys = ON", [])?;
        create_tables(&conn)?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Create an in-memory store (for testing)
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute("PRAGMA foreign_keys = ON", [])?;
        create_tables(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().expect("store mutex poisoned")
    }

    // ==================== Events ====================

    /// Insert an event, returning its id. If an event already exists for the
    /// URL, the existing id is returned and the row is left untouched.
    pub fn insert_event(&self, event: &Event) -> Result<String> {
        let conn = self.lock();
        conn.execute(
            r#"
            INSERT INTO events (id, url, organiser, name, event_date, location, metadata, scraped_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            ON CONFLICT(url) DO NOTHING
            "#,
            params![
                event.id,
                event.url,
                event.organiser,
                event.name,
                event.event_date.to_string(),
                event.location,
                event.metadata,
                event.scraped_at.map(|t| t.to_rfc3339()),
            ],
        )?;

        let id: String = conn.query_row(
            "SELECT id FROM events WHERE url = ?1",
            [&event.url],
            |row| row.get(0),
        )?;
        Ok(id)
    }

    pub fn get_event_by_url(&self, url: &str) -> Result<Option<Event>> {
        let conn = self.lock();
        conn.query_row(
            r#"
            SELECT id, url, organiser, name, event_date, location, metadata, scraped_at
            FROM events WHERE url = ?1
            "#,
            [url],
            map_event,
        )
        .optional()
        .context("Failed to query event by url")
    }

    pub fn set_event_scraped_at(&self, event_id: &str, at: DateTime<Utc>) -> Result<()> {
        self.lock().execute(
            "UPDATE events SET scraped_at = ?1 WHERE id = ?2",
            params![at.to_rfc3339(), event_id],
        )?;
        Ok(())
    }

    pub fn update_event_metadata(&self, event_id: &str, metadata: &str) -> Result<()> {
        self.lock().execute(
            "UPDATE events SET metadata = ?1 WHERE id = ?2",
            params![metadata, event_id],
        )?;
        Ok(())
    }

    // ==================== Event distances ====================

    /// Insert a distance, returning its id. Unique by (event, name); a
    /// repeat insert refreshes the participant count and returns the
    /// existing id.
    pub fn insert_distance(&self, distance: &EventDistance) -> Result<String> {
        let conn = self.lock();
        conn.execute(
            r#"
            INSERT INTO event_distances
            (id, event_id, distance_name, distance_meters, race_type, expected_checkpoints, participant_count)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            ON CONFLICT(event_id, distance_name)
            DO UPDATE SET participant_count = excluded.participant_count
            "#,
            params![
                distance.id,
                distance.event_id,
                distance.distance_name,
                distance.distance_meters,
                distance.race_type.as_str(),
                serde_json::to_string(&distance.expected_checkpoints)?,
                distance.participant_count,
            ],
        )?;

        let id: String = conn.query_row(
            "SELECT id FROM event_distances WHERE event_id = ?1 AND distance_name = ?2",
            params![distance.event_id, distance.distance_name],
            |row| row.get(0),
        )?;
        Ok(id)
    }

    pub fn get_distances(&self, event_id: &str) -> Result<Vec<EventDistance>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            r#"
            SELECT id, event_id, distance_name, distance_meters, race_type,
                   expected_checkpoints, participant_count
            FROM event_distances WHERE event_id = ?1 ORDER BY rowid
            "#,
        )?;

        let distances = stmt
            .query_map([event_id], map_distance)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(distances)
    }

    // ==================== Race results ====================

    /// Insert a result. Returns the stored id, or `None` when the row was a
    /// duplicate of an existing (event, position, name, bib) tuple.
    pub fn insert_result(&self, result: &RaceResult) -> Result<Option<String>> {
        if result.name.trim().is_empty() {
            bail!("race result name must be non-empty");
        }

        let conn = self.lock();
        let inserted = conn.execute(
            r#"
            INSERT INTO race_results
            (id, event_id, distance_id, athlete_id, position, bib, name, normalized_name,
             gender, category, finish_time, gun_time, chip_time, pace, gender_position,
             category_position, country, club, age, status, time_behind, validation)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16,
                    ?17, ?18, ?19, ?20, ?21, ?22)
            ON CONFLICT(event_id, position, name, bib) DO NOTHING
            "#,
            params![
                result.id,
                result.event_id,
                result.distance_id,
                result.athlete_id,
                result.position,
                result.bib,
                result.name,
                result.normalized_name,
                result.gender,
                result.category,
                result.finish_time,
                result.gun_time,
                result.chip_time,
                result.pace,
                result.gender_position,
                result.category_position,
                result.country,
                result.club,
                result.age,
                result.status.as_str(),
                result.time_behind,
                result.validation,
            ],
        )?;

        Ok(if inserted > 0 {
            Some(result.id.clone())
        } else {
            None
        })
    }

    /// Insert a batch of results in one transaction. Returns, per input
    /// row, the stored id (`None` for duplicates).
    pub fn insert_results(&self, results: &[RaceResult]) -> Result<Vec<Option<String>>> {
        for result in results {
            if result.name.trim().is_empty() {
                bail!("race result name must be non-empty");
            }
        }

        let mut conn = self.lock();
        let tx = conn.transaction()?;
        let mut outcomes = Vec::with_capacity(results.len());
        for result in results {
            // SQLite unique constraints treat NULLs as distinct, so rows
            // missing position or bib need an explicit dedup probe
            if result.position.is_none() || result.bib.is_none() {
                let existing: Option<String> = tx
                    .query_row(
                        r#"
                        SELECT id FROM race_results
                        WHERE event_id = ?1 AND position IS ?2 AND name = ?3 AND bib IS ?4
                        "#,
                        params![result.event_id, result.position, result.name, result.bib],
                        |row| row.get(0),
                    )
                    .optional()?;
                if existing.is_some() {
                    outcomes.push(None);
                    continue;
                }
            }

            let inserted = tx.execute(
                r#"
                INSERT INTO race_results
                (id, event_id, distance_id, athlete_id, position, bib, name, normalized_name,
                 gender, category, finish_time, gun_time, chip_time, pace, gender_position,
                 category_position, country, club, age, status, time_behind, validation)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16,
                        ?17, ?18, ?19, ?20, ?21, ?22)
                ON CONFLICT(event_id, position, name, bib) DO NOTHING
                "#,
                params![
                    result.id,
                    result.event_id,
                    result.distance_id,
                    result.athlete_id,
                    result.position,
                    result.bib,
                    result.name,
                    result.normalized_name,
                    result.gender,
                    result.category,
                    result.finish_time,
                    result.gun_time,
                    result.chip_time,
                    result.pace,
                    result.gender_position,
                    result.category_position,
                    result.country,
                    result.club,
                    result.age,
                    result.status.as_str(),
                    result.time_behind,
                    result.validation,
                ],
            )?;
            outcomes.push(if inserted > 0 {
                Some(result.id.clone())
            } else {
                None
            });
        }
        tx.commit()?;
        Ok(outcomes)
    }

    /// Id of the stored result matching the dedup tuple, if any.
    pub fn find_result_id(
        &self,
        event_id: &str,
        position: Option<u32>,
        name: &str,
        bib: Option<&str>,
    ) -> Result<Option<String>> {
        self.lock()
            .query_row(
                r#"
                SELECT id FROM race_results
                WHERE event_id = ?1 AND position IS ?2 AND name = ?3 AND bib IS ?4
                "#,
                params![event_id, position, name, bib],
                |row| row.get(0),
            )
            .optional()
            .context("Failed to look up result")
    }

    pub fn get_results_for_event(&self, event_id: &str) -> Result<Vec<RaceResult>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {RESULT_COLUMNS} FROM race_results WHERE event_id = ?1 ORDER BY position"
        ))?;
        let results = stmt
            .query_map([event_id], map_result)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(results)
    }

    /// Results with no athlete link yet.
    pub fn unlinked_results(&self, limit: u32) -> Result<Vec<RaceResult>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {RESULT_COLUMNS} FROM race_results WHERE athlete_id IS NULL LIMIT ?1"
        ))?;
        let results = stmt
            .query_map([limit], map_result)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(results)
    }

    pub fn link_athlete(&self, result_id: &str, athlete_id: &str) -> Result<()> {
        self.lock().execute(
            "UPDATE race_results SET athlete_id = ?1 WHERE id = ?2",
            params![athlete_id, result_id],
        )?;
        Ok(())
    }

    pub fn result_count(&self, event_id: &str) -> Result<u32> {
        let count: u32 = self.lock().query_row(
            "SELECT COUNT(*) FROM race_results WHERE event_id = ?1",
            [event_id],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    // ==================== Timing checkpoints ====================

    /// Insert a checkpoint. Duplicate (result, name) pairs are ignored.
    pub fn insert_checkpoint(&self, cp: &TimingCheckpoint) -> Result<()> {
        self.lock().execute(
            r#"
            INSERT INTO timing_checkpoints
            (id, result_id, checkpoint_type, checkpoint_name, checkpoint_order,
             split_time, cumulative_time, pace, segment_distance_meters)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            ON CONFLICT(result_id, checkpoint_name) DO NOTHING
            "#,
            params![
                cp.id,
                cp.result_id,
                cp.checkpoint_type.as_str(),
                cp.checkpoint_name,
                cp.checkpoint_order,
                cp.split_time,
                cp.cumulative_time,
                cp.pace,
                cp.segment_distance_meters,
            ],
        )?;
        Ok(())
    }

    pub fn get_checkpoints(&self, result_id: &str) -> Result<Vec<TimingCheckpoint>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            r#"
            SELECT id, result_id, checkpoint_type, checkpoint_name, checkpoint_order,
                   split_time, cumulative_time, pace, segment_distance_meters
            FROM timing_checkpoints WHERE result_id = ?1 ORDER BY checkpoint_order
            "#,
        )?;
        let checkpoints = stmt
            .query_map([result_id], map_checkpoint)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(checkpoints)
    }

    // ==================== Result sources ====================

    /// Insert a provenance record. The first source for a result becomes
    /// primary; later ones are secondary unless promoted.
    pub fn insert_source(&self, source: &ResultSource) -> Result<()> {
        let conn = self.lock();
        let has_primary: bool = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM result_sources WHERE result_id = ?1 AND is_primary = 1)",
            [&source.result_id],
            |row| row.get(0),
        )?;

        conn.execute(
            r#"
            INSERT INTO result_sources
            (id, result_id, organiser, source_url, scraped_at, fields_provided, confidence, is_primary)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            "#,
            params![
                source.id,
                source.result_id,
                source.organiser,
                source.source_url,
                source.scraped_at.to_rfc3339(),
                serde_json::to_string(&source.fields_provided)?,
                source.confidence,
                !has_primary,
            ],
        )?;
        Ok(())
    }

    /// Promote a source to primary, demoting any other source of the result.
    pub fn set_primary_source(&self, source_id: &str) -> Result<()> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        let result_id: String = tx.query_row(
            "SELECT result_id FROM result_sources WHERE id = ?1",
            [source_id],
            |row| row.get(0),
        )?;
        tx.execute(
            "UPDATE result_sources SET is_primary = 0 WHERE result_id = ?1",
            [&result_id],
        )?;
        tx.execute(
            "UPDATE result_sources SET is_primary = 1 WHERE id = ?1",
            [source_id],
        )?;
        tx.commit()?;
        Ok(())
    }

    pub fn get_sources(&self, result_id: &str) -> Result<Vec<ResultSource>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            r#"
            SELECT id, result_id, organiser, source_url, scraped_at, fields_provided,
                   confidence, is_primary
            FROM result_sources WHERE result_id = ?1 ORDER BY scraped_at
            "#,
        )?;
        let sources = stmt
            .query_map([result_id], map_source)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(sources)
    }

    // ==================== Event source links ====================

    /// Assert two events are the same real-world race. The pair is stored
    /// undirected (ids ordered) so repeats in either direction are no-ops.
    pub fn insert_event_link(
        &self,
        event_a: &str,
        event_b: &str,
        link_type: EventLinkType,
        confidence: u8,
    ) -> Result<()> {
        if event_a == event_b {
            bail!("an event cannot be linked to itself");
        }
        let (lo, hi) = if event_a < event_b {
            (event_a, event_b)
        } else {
            (event_b, event_a)
        };

        self.lock().execute(
            r#"
            INSERT INTO event_source_links (id, event_a, event_b, link_type, confidence)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT(event_a, event_b) DO NOTHING
            "#,
            params![new_id(), lo, hi, link_type.as_str(), confidence],
        )?;
        Ok(())
    }

    // ==================== Athletes ====================

    pub fn insert_athlete(&self, athlete: &Athlete) -> Result<()> {
        self.lock().execute(
            r#"
            INSERT INTO athletes (id, name, normalized_name, gender, birth_date, country, external_user_id)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
            params![
                athlete.id,
                athlete.name,
                athlete.normalized_name,
                athlete.gender,
                athlete.birth_date.map(|d| d.to_string()),
                athlete.country,
                athlete.external_user_id,
            ],
        )?;
        Ok(())
    }

    pub fn get_athlete(&self, id: &str) -> Result<Option<Athlete>> {
        self.lock()
            .query_row(
                r#"
                SELECT id, name, normalized_name, gender, birth_date, country, external_user_id
                FROM athletes WHERE id = ?1
                "#,
                [id],
                map_athlete,
            )
            .optional()
            .context("Failed to query athlete")
    }

    /// Athletes whose normalised name contains the fragment, capped.
    pub fn find_athletes_by_fragment(&self, fragment: &str, limit: u32) -> Result<Vec<Athlete>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            r#"
            SELECT id, name, normalized_name, gender, birth_date, country, external_user_id
            FROM athletes WHERE normalized_name LIKE ?1 LIMIT ?2
            "#,
        )?;
        let pattern = format!("%{}%", fragment.replace('%', "").replace('_', ""));
        let athletes = stmt
            .query_map(params![pattern, limit], map_athlete)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(athletes)
    }

    /// Delete an athlete. Results linked to them keep their rows; the link
    /// is nulled by the foreign key.
    pub fn delete_athlete(&self, id: &str) -> Result<()> {
        self.lock()
            .execute("DELETE FROM athletes WHERE id = ?1", [id])?;
        Ok(())
    }

    // ==================== Athlete follows ====================

    pub fn insert_follow(&self, follower_id: &str, following_id: &str) -> Result<()> {
        if follower_id == following_id {
            bail!("an athlete cannot follow themselves");
        }
        self.lock().execute(
            r#"
            INSERT INTO athlete_follows (id, follower_id, following_id)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(follower_id, following_id) DO NOTHING
            "#,
            params![new_id(), follower_id, following_id],
        )?;
        Ok(())
    }

    // ==================== Scrape jobs ====================

    pub fn create_job(
        &self,
        organiser: Option<&str>,
        event_url: &str,
        max_retries: u32,
    ) -> Result<ScrapeJob> {
        let now = Utc::now();
        let job = ScrapeJob {
            id: new_id(),
            organiser: organiser.map(String::from),
            event_url: event_url.to_string(),
            status: JobStatus::Pending,
            results_count: None,
            error_message: None,
            retry_count: 0,
            max_retries,
            next_retry_at: None,
            notification_sent: false,
            created_at: now,
            updated_at: now,
        };

        self.lock().execute(
            r#"
            INSERT INTO scrape_jobs
            (id, organiser, event_url, status, retry_count, max_retries, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            "#,
            params![
                job.id,
                job.organiser,
                job.event_url,
                job.status.as_str(),
                job.retry_count,
                job.max_retries,
                job.created_at.to_rfc3339(),
                job.updated_at.to_rfc3339(),
            ],
        )?;
        Ok(job)
    }

    pub fn get_job(&self, id: &str) -> Result<Option<ScrapeJob>> {
        self.lock()
            .query_row(
                &format!("SELECT {JOB_COLUMNS} FROM scrape_jobs WHERE id = ?1"),
                [id],
                map_job,
            )
            .optional()
            .context("Failed to query job")
    }

    pub fn list_jobs(&self, limit: u32) -> Result<Vec<ScrapeJob>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {JOB_COLUMNS} FROM scrape_jobs ORDER BY created_at DESC LIMIT ?1"
        ))?;
        let jobs = stmt
            .query_map([limit], map_job)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(jobs)
    }

    pub fn mark_job_running(&self, id: &str) -> Result<()> {
        self.lock().execute(
            "UPDATE scrape_jobs SET status = 'running', updated_at = ?1 WHERE id = ?2",
            params![Utc::now().to_rfc3339(), id],
        )?;
        Ok(())
    }

    pub fn mark_job_completed(&self, id: &str, results_count: u32) -> Result<()> {
        self.lock().execute(
            r#"
            UPDATE scrape_jobs
            SET status = 'completed', results_count = ?1, error_message = NULL,
                next_retry_at = NULL, updated_at = ?2
            WHERE id = ?3
            "#,
            params![results_count, Utc::now().to_rfc3339(), id],
        )?;
        Ok(())
    }

    /// Mark a job failed. `next_retry_at = None` leaves it permanently
    /// failed; otherwise the job re-enters the retry queue.
    pub fn mark_job_failed(
        &self,
        id: &str,
        error: &str,
        next_retry_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let truncated: String = error.chars().take(MAX_ERROR_LEN).collect();
        self.lock().execute(
            r#"
            UPDATE scrape_jobs
            SET status = 'failed', error_message = ?1, next_retry_at = ?2, updated_at = ?3
            WHERE id = ?4
            "#,
            params![
                truncated,
                next_retry_at.map(|t| t.to_rfc3339()),
                Utc::now().to_rfc3339(),
                id
            ],
        )?;
        Ok(())
    }

    pub fn set_notification_sent(&self, id: &str) -> Result<()> {
        self.lock().execute(
            "UPDATE scrape_jobs SET notification_sent = 1, updated_at = ?1 WHERE id = ?2",
            params![Utc::now().to_rfc3339(), id],
        )?;
        Ok(())
    }

    /// Jobs due for retry, ordered by `next_retry_at` ascending.
    pub fn due_jobs(&self, now: DateTime<Utc>) -> Result<Vec<ScrapeJob>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(&format!(
            r#"
            SELECT {JOB_COLUMNS} FROM scrape_jobs
            WHERE status = 'failed' AND next_retry_at IS NOT NULL AND next_retry_at <= ?1
            ORDER BY next_retry_at ASC
            "#
        ))?;
        let jobs = stmt
            .query_map([now.to_rfc3339()], map_job)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(jobs)
    }

    /// Claim a due job for this drainer. The conditional update is the
    /// race guard: a second drainer sees zero affected rows and skips.
    /// Claiming bumps the retry counter and flips the job to running.
    pub fn claim_job(&self, id: &str, now: DateTime<Utc>) -> Result<bool> {
        let affected = self.lock().execute(
            r#"
            UPDATE scrape_jobs
            SET status = 'running', next_retry_at = NULL,
                retry_count = retry_count + 1, updated_at = ?1
            WHERE id = ?2 AND status = 'failed'
              AND next_retry_at IS NOT NULL AND next_retry_at <= ?1
            "#,
            params![now.to_rfc3339(), id],
        )?;
        Ok(affected == 1)
    }

    // ==================== Monitored endpoints ====================

    pub fn insert_endpoint(&self, endpoint: &MonitoredEndpoint) -> Result<()> {
        self.lock().execute(
            r#"
            INSERT INTO monitored_endpoints (id, organiser, name, url, enabled, check_interval_minutes)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ON CONFLICT(url) DO UPDATE SET
                enabled = excluded.enabled,
                check_interval_minutes = excluded.check_interval_minutes
            "#,
            params![
                endpoint.id,
                endpoint.organiser,
                endpoint.name,
                endpoint.url,
                endpoint.enabled,
                endpoint.check_interval_minutes,
            ],
        )?;
        Ok(())
    }

    pub fn enabled_endpoints(&self) -> Result<Vec<MonitoredEndpoint>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            r#"
            SELECT id, organiser, name, url, enabled, check_interval_minutes
            FROM monitored_endpoints WHERE enabled = 1
            "#,
        )?;
        let endpoints = stmt
            .query_map([], map_endpoint)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(endpoints)
    }

    // ==================== Endpoint status ====================

    pub fn current_status(&self, endpoint_id: &str) -> Result<Option<EndpointStatusCurrent>> {
        self.lock()
            .query_row(
                r#"
                SELECT endpoint_id, status, http_code, response_time_ms, has_results,
                       last_checked, last_status_change, consecutive_failures
                FROM endpoint_status_current WHERE endpoint_id = ?1
                "#,
                [endpoint_id],
                map_status_current,
            )
            .optional()
            .context("Failed to query endpoint status")
    }

    /// Persist a probe: append to history, upsert the current row.
    /// `last_status_change` advances only when the token differs from the
    /// previously persisted one. Returns the prior token (if any) and the
    /// new current row.
    pub fn record_probe(
        &self,
        probe: &EndpointProbe,
    ) -> Result<(Option<EndpointStatus>, EndpointStatusCurrent)> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;

        let prior: Option<(String, Option<String>, u32)> = tx
            .query_row(
                r#"
                SELECT status, last_status_change, consecutive_failures
                FROM endpoint_status_current WHERE endpoint_id = ?1
                "#,
                [&probe.endpoint_id],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;

        let prior_status = prior
            .as_ref()
            .and_then(|(s, _, _)| EndpointStatus::parse(s));

        let changed = prior_status != Some(probe.status);
        let last_status_change = if changed {
            Some(probe.checked_at.to_rfc3339())
        } else {
            prior.as_ref().and_then(|(_, lsc, _)| lsc.clone())
        };

        let consecutive_failures = match probe.status {
            EndpointStatus::Down => prior.as_ref().map(|(_, _, cf)| cf + 1).unwrap_or(1),
            _ => 0,
        };

        tx.execute(
            r#"
            INSERT INTO endpoint_status_history
            (id, endpoint_id, status, http_code, response_time_ms, has_results, error_message, checked_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            "#,
            params![
                new_id(),
                probe.endpoint_id,
                probe.status.as_str(),
                probe.http_code,
                probe.response_time_ms.map(|v| v as i64),
                probe.has_results,
                probe.error_message,
                probe.checked_at.to_rfc3339(),
            ],
        )?;

        tx.execute(
            r#"
            INSERT INTO endpoint_status_current
            (endpoint_id, status, http_code, response_time_ms, has_results,
             last_checked, last_status_change, consecutive_failures)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            ON CONFLICT(endpoint_id) DO UPDATE SET
                status = excluded.status,
                http_code = excluded.http_code,
                response_time_ms = excluded.response_time_ms,
                has_results = excluded.has_results,
                last_checked = excluded.last_checked,
                last_status_change = excluded.last_status_change,
                consecutive_failures = excluded.consecutive_failures
            "#,
            params![
                probe.endpoint_id,
                probe.status.as_str(),
                probe.http_code,
                probe.response_time_ms.map(|v| v as i64),
                probe.has_results,
                probe.checked_at.to_rfc3339(),
                last_status_change,
                consecutive_failures,
            ],
        )?;

        tx.commit()?;

        let current = EndpointStatusCurrent {
            endpoint_id: probe.endpoint_id.clone(),
            status: probe.status,
            http_code: probe.http_code,
            response_time_ms: probe.response_time_ms,
            has_results: probe.has_results,
            last_checked: Some(probe.checked_at),
            last_status_change: last_status_change
                .as_deref()
                .and_then(parse_timestamp),
            consecutive_failures,
        };

        Ok((prior_status, current))
    }

    pub fn history_count(&self, endpoint_id: &str) -> Result<u32> {
        let count: u32 = self.lock().query_row(
            "SELECT COUNT(*) FROM endpoint_status_history WHERE endpoint_id = ?1",
            [endpoint_id],
            |row| row.get(0),
        )?;
        Ok(count)
    }
}

/// Fresh opaque id for a new row.
pub fn new_id() -> String {
    Uuid::new_v4().to_string()
}

const RESULT_COLUMNS: &str = "id, event_id, distance_id, athlete_id, position, bib, name, \
     normalized_name, gender, category, finish_time, gun_time, chip_time, pace, \
     gender_position, category_position, country, club, age, status, time_behind, validation";

const JOB_COLUMNS: &str = "id, organiser, event_url, status, results_count, error_message, \
     retry_count, max_retries, next_retry_at, notification_sent, created_at, updated_at";

fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

fn map_event(row: &Row) -> rusqlite::Result<Event> {
    let date_str: String = row.get(4)?;
    let scraped_at: Option<String> = row.get(7)?;
    Ok(Event {
        id: row.get(0)?,
        url: row.get(1)?,
        organiser: row.get(2)?,
        name: row.get(3)?,
        event_date: NaiveDate::parse_from_str(&date_str, "%Y-%m-%d")
            .unwrap_or_else(|_| NaiveDate::from_ymd_opt(2000, 1, 1).unwrap()),
        location: row.get(5)?,
        metadata: row.get(6)?,
        scraped_at: scraped_at.as_deref().and_then(parse_timestamp),
    })
}

fn map_distance(row: &Row) -> rusqlite::Result<EventDistance> {
    let race_type: String = row.get(4)?;
    let expected: Option<String> = row.get(5)?;
    Ok(EventDistance {
        id: row.get(0)?,
        event_id: row.get(1)?,
        distance_name: row.get(2)?,
        distance_meters: row.get(3)?,
        race_type: super::models::RaceType::parse(&race_type)
            .unwrap_or(super::models::RaceType::Running),
        expected_checkpoints: expected
            .and_then(|s| serde_json::from_str(&s).ok())
            .unwrap_or_default(),
        participant_count: row.get(6)?,
    })
}

fn map_result(row: &Row) -> rusqlite::Result<RaceResult> {
    let status: String = row.get(19)?;
    Ok(RaceResult {
        id: row.get(0)?,
        event_id: row.get(1)?,
        distance_id: row.get(2)?,
        athlete_id: row.get(3)?,
        position: row.get(4)?,
        bib: row.get(5)?,
        name: row.get(6)?,
        normalized_name: row.get(7)?,
        gender: row.get(8)?,
        category: row.get(9)?,
        finish_time: row.get(10)?,
        gun_time: row.get(11)?,
        chip_time: row.get(12)?,
        pace: row.get(13)?,
        gender_position: row.get(14)?,
        category_position: row.get(15)?,
        country: row.get(16)?,
        club: row.get(17)?,
        age: row.get(18)?,
        status: ResultStatus::parse(&status).unwrap_or_default(),
        time_behind: row.get(20)?,
        validation: row.get(21)?,
    })
}

fn map_checkpoint(row: &Row) -> rusqlite::Result<TimingCheckpoint> {
    let kind: String = row.get(2)?;
    Ok(TimingCheckpoint {
        id: row.get(0)?,
        result_id: row.get(1)?,
        checkpoint_type: super::models::CheckpointType::parse(&kind)
            .unwrap_or(super::models::CheckpointType::Distance),
        checkpoint_name: row.get(3)?,
        checkpoint_order: row.get(4)?,
        split_time: row.get(5)?,
        cumulative_time: row.get(6)?,
        pace: row.get(7)?,
        segment_distance_meters: row.get(8)?,
    })
}

fn map_source(row: &Row) -> rusqlite::Result<ResultSource> {
    let scraped_at: String = row.get(4)?;
    let fields: String = row.get(5)?;
    Ok(ResultSource {
        id: row.get(0)?,
        result_id: row.get(1)?,
        organiser: row.get(2)?,
        source_url: row.get(3)?,
        scraped_at: parse_timestamp(&scraped_at).unwrap_or_else(Utc::now),
        fields_provided: serde_json::from_str(&fields).unwrap_or_default(),
        confidence: row.get(6)?,
        is_primary: row.get(7)?,
    })
}

fn map_athlete(row: &Row) -> rusqlite::Result<Athlete> {
    let birth_date: Option<String> = row.get(4)?;
    Ok(Athlete {
        id: row.get(0)?,
        name: row.get(1)?,
        normalized_name: row.get(2)?,
        gender: row.get(3)?,
        birth_date: birth_date
            .as_deref()
            .and_then(|s| NaiveDate::parse_from_str(s, "%Y-%m-%d").ok()),
        country: row.get(5)?,
        external_user_id: row.get(6)?,
    })
}

fn map_job(row: &Row) -> rusqlite::Result<ScrapeJob> {
    let status: String = row.get(3)?;
    let next_retry_at: Option<String> = row.get(8)?;
    let created_at: String = row.get(10)?;
    let updated_at: String = row.get(11)?;
    Ok(ScrapeJob {
        id: row.get(0)?,
        organiser: row.get(1)?,
        event_url: row.get(2)?,
        status: JobStatus::parse(&status).unwrap_or(JobStatus::Pending),
        results_count: row.get(4)?,
        error_message: row.get(5)?,
        retry_count: row.get(6)?,
        max_retries: row.get(7)?,
        next_retry_at: next_retry_at.as_deref().and_then(parse_timestamp),
        notification_sent: row.get(9)?,
        created_at: parse_timestamp(&created_at).unwrap_or_else(Utc::now),
        updated_at: parse_timestamp(&updated_at).unwrap_or_else(Utc::now),
    })
}

fn map_endpoint(row: &Row) -> rusqlite::Result<MonitoredEndpoint> {
    Ok(MonitoredEndpoint {
        id: row.get(0)?,
        organiser: row.get(1)?,
        name: row.get(2)?,
        url: row.get(3)?,
        enabled: row.get(4)?,
        check_interval_minutes: row.get(5)?,
    })
}

fn map_status_current(row: &Row) -> rusqlite::Result<EndpointStatusCurrent> {
    let status: String = row.get(1)?;
    let last_checked: Option<String> = row.get(5)?;
    let last_status_change: Option<String> = row.get(6)?;
    Ok(EndpointStatusCurrent {
        endpoint_id: row.get(0)?,
        status: EndpointStatus::parse(&status).unwrap_or(EndpointStatus::Unknown),
        http_code: row.get(2)?,
        response_time_ms: row.get::<_, Option<i64>>(3)?.map(|v| v as u64),
        has_results: row.get(4)?,
        last_checked: last_checked.as_deref().and_then(parse_timestamp),
        last_status_change: last_status_change.as_deref().and_then(parse_timestamp),
        consecutive_failures: row.get(7)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::names::normalize_name;
    use chrono::Duration;

    fn test_event() -> Event {
        Event {
            id: new_id(),
            url: "https://results.example.com/races/spring-half".to_string(),
            organiser: "hopasports".to_string(),
            name: "Spring Half Marathon".to_string(),
            event_date: NaiveDate::from_ymd_opt(2025, 4, 12).unwrap(),
            location: Some("Valencia".to_string()),
            metadata: None,
            scraped_at: None,
        }
    }

    fn test_result(event_id: &str, position: u32, name: &str) -> RaceResult {
        RaceResult {
            id: new_id(),
            event_id: event_id.to_string(),
            distance_id: None,
            athlete_id: None,
            position: Some(position),
            bib: Some(format!("{}", position + 100)),
            name: name.to_string(),
            normalized_name: normalize_name(name),
            gender: Some("F".to_string()),
            category: None,
            finish_time: Some("1:32:05".to_string()),
            gun_time: None,
            chip_time: None,
            pace: None,
            gender_position: None,
            category_position: None,
            country: Some("ESP".to_string()),
            club: None,
            age: None,
            status: ResultStatus::Finished,
            time_behind: None,
            validation: None,
        }
    }

    #[test]
    fn test_event_insert_idempotent_by_url() {
        let store = Store::in_memory().unwrap();
        let event = test_event();
        let id1 = store.insert_event(&event).unwrap();

        let mut again = test_event();
        again.name = "Renamed".to_string();
        let id2 = store.insert_event(&again).unwrap();

        assert_eq!(id1, id2);
        let stored = store.get_event_by_url(&event.url).unwrap().unwrap();
        assert_eq!(stored.name, "Spring Half Marathon");
    }

    #[test]
    fn test_result_dedup() {
        let store = Store::in_memory().unwrap();
        let event_id = store.insert_event(&test_event()).unwrap();

        let r = test_result(&event_id, 1, "Jane Doe");
        assert!(store.insert_result(&r).unwrap().is_some());

        let mut dup = test_result(&event_id, 1, "Jane Doe");
        dup.bib = r.bib.clone();
        assert!(store.insert_result(&dup).unwrap().is_none());
        assert_eq!(store.result_count(&event_id).unwrap(), 1);
    }

    #[test]
    fn test_result_empty_name_rejected() {
        let store = Store::in_memory().unwrap();
        let event_id = store.insert_event(&test_event()).unwrap();
        let mut r = test_result(&event_id, 1, "  ");
        r.name = "  ".to_string();
        assert!(store.insert_result(&r).is_err());
    }

    #[test]
    fn test_checkpoint_unique_per_result() {
        let store = Store::in_memory().unwrap();
        let event_id = store.insert_event(&test_event()).unwrap();
        let result = test_result(&event_id, 1, "Jane Doe");
        store.insert_result(&result).unwrap();

        let cp = TimingCheckpoint {
            id: new_id(),
            result_id: result.id.clone(),
            checkpoint_type: super::super::models::CheckpointType::Distance,
            checkpoint_name: "5km".to_string(),
            checkpoint_order: 1,
            split_time: Some("22:10".to_string()),
            cumulative_time: Some("22:10".to_string()),
            pace: None,
            segment_distance_meters: Some(5000),
        };
        store.insert_checkpoint(&cp).unwrap();

        let mut dup = cp.clone();
        dup.id = new_id();
        store.insert_checkpoint(&dup).unwrap();

        assert_eq!(store.get_checkpoints(&result.id).unwrap().len(), 1);
    }

    #[test]
    fn test_first_source_becomes_primary() {
        let store = Store::in_memory().unwrap();
        let event_id = store.insert_event(&test_event()).unwrap();
        let result = test_result(&event_id, 1, "Jane Doe");
        store.insert_result(&result).unwrap();

        let mk = |conf| ResultSource {
            id: new_id(),
            result_id: result.id.clone(),
            organiser: "hopasports".to_string(),
            source_url: "https://results.example.com/races/spring-half".to_string(),
            scraped_at: Utc::now(),
            fields_provided: vec!["position".to_string(), "name".to_string()],
            confidence: conf,
            is_primary: false,
        };
        store.insert_source(&mk(95)).unwrap();
        store.insert_source(&mk(80)).unwrap();

        let sources = store.get_sources(&result.id).unwrap();
        assert_eq!(sources.len(), 2);
        assert_eq!(sources.iter().filter(|s| s.is_primary).count(), 1);
        assert!(sources[0].is_primary);
    }

    #[test]
    fn test_set_primary_source_is_exclusive() {
        let store = Store::in_memory().unwrap();
        let event_id = store.insert_event(&test_event()).unwrap();
        let result = test_result(&event_id, 1, "Jane Doe");
        store.insert_result(&result).unwrap();

        for _ in 0..2 {
            store
                .insert_source(&ResultSource {
                    id: new_id(),
                    result_id: result.id.clone(),
                    organiser: "evochip".to_string(),
                    source_url: "https://live.example.org/e/1".to_string(),
                    scraped_at: Utc::now(),
                    fields_provided: vec!["name".to_string()],
                    confidence: 70,
                    is_primary: false,
                })
                .unwrap();
        }

        let sources = store.get_sources(&result.id).unwrap();
        let secondary = sources.iter().find(|s| !s.is_primary).unwrap();
        store.set_primary_source(&secondary.id).unwrap();

        let sources = store.get_sources(&result.id).unwrap();
        assert_eq!(sources.iter().filter(|s| s.is_primary).count(), 1);
        assert!(sources.iter().any(|s| s.id == secondary.id && s.is_primary));
    }

    #[test]
    fn test_event_link_undirected_unique() {
        let store = Store::in_memory().unwrap();
        let a = store.insert_event(&test_event()).unwrap();
        let mut other = test_event();
        other.url = "https://other.example.com/races/1".to_string();
        let b = store.insert_event(&other).unwrap();

        store
            .insert_event_link(&a, &b, EventLinkType::SameEvent, 90)
            .unwrap();
        // Reversed direction is the same undirected pair
        store
            .insert_event_link(&b, &a, EventLinkType::SameEvent, 90)
            .unwrap();

        let count: u32 = store
            .lock()
            .query_row("SELECT COUNT(*) FROM event_source_links", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 1);

        assert!(store
            .insert_event_link(&a, &a, EventLinkType::SameEvent, 90)
            .is_err());
    }

    #[test]
    fn test_follow_non_self() {
        let store = Store::in_memory().unwrap();
        let athlete = |name: &str| Athlete {
            id: new_id(),
            name: name.to_string(),
            normalized_name: normalize_name(name),
            gender: None,
            birth_date: None,
            country: None,
            external_user_id: None,
        };
        let a = athlete("Jane Doe");
        let b = athlete("John Roe");
        store.insert_athlete(&a).unwrap();
        store.insert_athlete(&b).unwrap();

        store.insert_follow(&a.id, &b.id).unwrap();
        store.insert_follow(&a.id, &b.id).unwrap(); // duplicate is a no-op
        assert!(store.insert_follow(&a.id, &a.id).is_err());
    }

    #[test]
    fn test_delete_athlete_nulls_result_link() {
        let store = Store::in_memory().unwrap();
        let event_id = store.insert_event(&test_event()).unwrap();
        let result = test_result(&event_id, 1, "Jane Doe");
        store.insert_result(&result).unwrap();

        let athlete = Athlete {
            id: new_id(),
            name: "Jane Doe".to_string(),
            normalized_name: "jane doe".to_string(),
            gender: None,
            birth_date: None,
            country: None,
            external_user_id: None,
        };
        store.insert_athlete(&athlete).unwrap();
        store.link_athlete(&result.id, &athlete.id).unwrap();

        store.delete_athlete(&athlete.id).unwrap();

        let results = store.get_results_for_event(&event_id).unwrap();
        assert_eq!(results.len(), 1);
        assert!(results[0].athlete_id.is_none());
    }

    #[test]
    fn test_job_lifecycle() {
        let store = Store::in_memory().unwrap();
        let job = store
            .create_job(Some("hopasports"), "https://results.example.com/r/1", 3)
            .unwrap();
        assert_eq!(job.status, JobStatus::Pending);

        store.mark_job_running(&job.id).unwrap();
        let next = Utc::now() + Duration::minutes(5);
        store
            .mark_job_failed(&job.id, &"x".repeat(300), Some(next))
            .unwrap();

        let stored = store.get_job(&job.id).unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Failed);
        assert_eq!(stored.error_message.unwrap().len(), 100);
        assert!(stored.next_retry_at.is_some());

        store.mark_job_completed(&job.id, 250).unwrap();
        let stored = store.get_job(&job.id).unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Completed);
        assert_eq!(stored.results_count, Some(250));
        assert!(stored.next_retry_at.is_none());
    }

    #[test]
    fn test_claim_job_single_winner() {
        let store = Store::in_memory().unwrap();
        let job = store
            .create_job(None, "https://results.example.com/r/2", 3)
            .unwrap();
        let past = Utc::now() - Duration::minutes(1);
        store.mark_job_failed(&job.id, "boom", Some(past)).unwrap();

        let now = Utc::now();
        assert!(store.claim_job(&job.id, now).unwrap());
        // Second drainer loses the race
        assert!(!store.claim_job(&job.id, now).unwrap());

        let stored = store.get_job(&job.id).unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Running);
        assert_eq!(stored.retry_count, 1);
        assert!(stored.next_retry_at.is_none());
    }

    #[test]
    fn test_due_jobs_ordering() {
        let store = Store::in_memory().unwrap();
        let now = Utc::now();
        let j1 = store.create_job(None, "https://a.example.com", 3).unwrap();
        let j2 = store.create_job(None, "https://b.example.com", 3).unwrap();
        store
            .mark_job_failed(&j1.id, "e", Some(now - Duration::minutes(1)))
            .unwrap();
        store
            .mark_job_failed(&j2.id, "e", Some(now - Duration::minutes(10)))
            .unwrap();

        let due = store.due_jobs(now).unwrap();
        assert_eq!(due.len(), 2);
        assert_eq!(due[0].id, j2.id);

        // Permanently failed jobs never come due
        store.mark_job_failed(&j1.id, "e", None).unwrap();
        let due = store.due_jobs(now).unwrap();
        assert_eq!(due.len(), 1);
    }

    #[test]
    fn test_record_probe_tracks_transitions() {
        let store = Store::in_memory().unwrap();
        let endpoint = MonitoredEndpoint {
            id: new_id(),
            organiser: "hopasports".to_string(),
            name: "results portal".to_string(),
            url: "https://results.example.com".to_string(),
            enabled: true,
            check_interval_minutes: 15,
        };
        store.insert_endpoint(&endpoint).unwrap();

        let t0 = Utc::now();
        let probe = |status, at| EndpointProbe {
            endpoint_id: endpoint.id.clone(),
            status,
            http_code: Some(200),
            response_time_ms: Some(120),
            has_results: status == EndpointStatus::Up,
            error_message: None,
            checked_at: at,
        };

        let (prior, current) = store.record_probe(&probe(EndpointStatus::Down, t0)).unwrap();
        assert!(prior.is_none());
        assert_eq!(current.consecutive_failures, 1);
        let first_change = current.last_status_change.unwrap();

        // Same token: change timestamp carried over, failures accumulate
        let t1 = t0 + Duration::minutes(5);
        let (prior, current) = store.record_probe(&probe(EndpointStatus::Down, t1)).unwrap();
        assert_eq!(prior, Some(EndpointStatus::Down));
        assert_eq!(current.consecutive_failures, 2);
        assert_eq!(current.last_status_change.unwrap(), first_change);

        // Different token: change advances, failures reset
        let t2 = t0 + Duration::minutes(10);
        let (prior, current) = store.record_probe(&probe(EndpointStatus::Up, t2)).unwrap();
        assert_eq!(prior, Some(EndpointStatus::Down));
        assert_eq!(current.consecutive_failures, 0);
        assert!(current.last_status_change.unwrap() > first_change);

        assert_eq!(store.history_count(&endpoint.id).unwrap(), 3);
    }

    #[test]
    fn test_find_athletes_by_fragment_capped() {
        let store = Store::in_memory().unwrap();
        for i in 0..60 {
            store
                .insert_athlete(&Athlete {
                    id: new_id(),
                    name: format!("Jane Doe {}", i),
                    normalized_name: format!("jane doe {}", i),
                    gender: None,
                    birth_date: None,
                    country: None,
                    external_user_id: None,
                })
                .unwrap();
        }
        let found = store.find_athletes_by_fragment("jane doe", 50).unwrap();
        assert_eq!(found.len(), 50);
    }
}
