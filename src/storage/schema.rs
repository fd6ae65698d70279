//! SQLite schema for the ingestion and monitoring pipeline
//!
//! Tables:
//! - athletes: identity records
//! - events: one race instance per URL
//! - event_distances: named distances within an event
//! - race_results: one athlete's finish in one event
//! - timing_checkpoints: timing points attached to a result
//! - result_sources: per-result provenance
//! - event_source_links: same-event assertions between events
//! - athlete_follows: follower -> following relations
//! - scrape_jobs: ingestion attempt lifecycle
//! - monitored_endpoints: URLs under liveness watch
//! - endpoint_status_current: latest probe per endpoint
//! - endpoint_status_history: append-only probe log

use rusqlite::{Connection, Result};

/// Create all tables in the database
pub fn create_tables(conn: &Connection) -> Result<()> {
    conn.execute(
        r#"
        CREATE TABLE IF NOT EXISTS athletes (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            normalized_name TEXT NOT NULL,
            gender TEXT,
            birth_date TEXT,
            country TEXT,
            external_user_id TEXT,
            created_at TEXT DEFAULT (datetime('now'))
        )
        "#,
        [],
    )?;

    conn.execute(
        r#"
        CREATE TABLE IF NOT EXISTS events (
            id TEXT PRIMARY KEY,
            url TEXT NOT NULL UNIQUE,
            organiser TEXT NOT NULL,
            name TEXT NOT NULL,
            event_date TEXT NOT NULL,
            location TEXT,
            metadata TEXT,
            scraped_at TEXT,
            created_at TEXT DEFAULT (datetime('now'))
        )
        "#,
        [],
    )?;

    conn.execute(
        r#"
        CREATE TABLE IF NOT EXISTS event_distances (
            id TEXT PRIMARY KEY,
            event_id TEXT NOT NULL REFERENCES events(id) ON DELETE CASCADE,
            distance_name TEXT NOT NULL,
            distance_meters INTEGER NOT NULL,
            race_type TEXT NOT NULL,
            expected_checkpoints TEXT,
            participant_count INTEGER,
            UNIQUE(event_id, distance_name)
        )
        "#,
        [],
    )?;

    conn.execute(
        r#"
        CREATE TABLE IF NOT EXISTS race_results (
            id TEXT PRIMARY KEY,
            event_id TEXT NOT NULL REFERENCES events(id) ON DELETE CASCADE,
            distance_id TEXT REFERENCES event_distances(id) ON DELETE SET NULL,
            athlete_id TEXT REFERENCES athletes(id) ON DELETE SET NULL,
            position INTEGER,
            bib TEXT,
            name TEXT NOT NULL,
            normalized_name TEXT NOT NULL,
            gender TEXT,
            category TEXT,
            finish_time TEXT,
            gun_time TEXT,
            chip_time TEXT,
            pace TEXT,
            gender_position INTEGER,
            category_position INTEGER,
            country TEXT,
            club TEXT,
            age INTEGER,
            status TEXT NOT NULL DEFAULT 'finished',
            time_behind TEXT,
            validation TEXT,
            metadata TEXT,
            UNIQUE(event_id, position, name, bib)
        )
        "#,
        [],
    )?;

    conn.execute(
        r#"
        CREATE TABLE IF NOT EXISTS timing_checkpoints (
            id TEXT PRIMARY KEY,
            result_id TEXT NOT NULL REFERENCES race_results(id) ON DELETE CASCADE,
            checkpoint_type TEXT NOT NULL,
            checkpoint_name TEXT NOT NULL,
            checkpoint_order INTEGER NOT NULL,
            split_time TEXT,
            cumulative_time TEXT,
            pace TEXT,
            segment_distance_meters INTEGER,
            UNIQUE(result_id, checkpoint_name)
        )
        "#,
        [],
    )?;

    conn.execute(
        r#"
        CREATE TABLE IF NOT EXISTS result_sources (
            id TEXT PRIMARY KEY,
            result_id TEXT NOT NULL REFERENCES race_results(id) ON DELETE CASCADE,
            organiser TEXT NOT NULL,
            source_url TEXT NOT NULL,
            scraped_at TEXT NOT NULL,
            fields_provided TEXT NOT NULL,
            confidence INTEGER NOT NULL DEFAULT 100,
            is_primary INTEGER NOT NULL DEFAULT 0
        )
        "#,
        [],
    )?;

    conn.execute(
        r#"
        CREATE TABLE IF NOT EXISTS event_source_links (
            id TEXT PRIMARY KEY,
            event_a TEXT NOT NULL REFERENCES events(id) ON DELETE CASCADE,
            event_b TEXT NOT NULL REFERENCES events(id) ON DELETE CASCADE,
            link_type TEXT NOT NULL,
            confidence INTEGER NOT NULL,
            CHECK(event_a <> event_b),
            UNIQUE(event_a, event_b)
        )
        "#,
        [],
    )?;

    conn.execute(
        r#"
        CREATE TABLE IF NOT EXISTS athlete_follows (
            id TEXT PRIMARY KEY,
            follower_id TEXT NOT NULL REFERENCES athletes(id) ON DELETE CASCADE,
            following_id TEXT NOT NULL REFERENCES athletes(id) ON DELETE CASCADE,
            created_at TEXT DEFAULT (datetime('now')),
            CHECK(follower_id <> following_id),
            UNIQUE(follower_id, following_id)
        )
        "#,
        [],
    )?;

    conn.execute(
        r#"
        CREATE TABLE IF NOT EXISTS scrape_jobs (
            id TEXT PRIMARY KEY,
            organiser TEXT,
            event_url TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'pending',
            results_count INTEGER,
            error_message TEXT,
            retry_count INTEGER NOT NULL DEFAULT 0,
            max_retries INTEGER NOT NULL DEFAULT 3,
            next_retry_at TEXT,
            notification_sent INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )
        "#,
        [],
    )?;

    conn.execute(
        r#"
        CREATE TABLE IF NOT EXISTS monitored_endpoints (
            id TEXT PRIMARY KEY,
            organiser TEXT NOT NULL,
            name TEXT NOT NULL,
            url TEXT NOT NULL UNIQUE,
            enabled INTEGER NOT NULL DEFAULT 1,
            check_interval_minutes INTEGER NOT NULL DEFAULT 15
        )
        "#,
        [],
    )?;

    conn.execute(
        r#"
        CREATE TABLE IF NOT EXISTS endpoint_status_current (
            endpoint_id TEXT PRIMARY KEY REFERENCES monitored_endpoints(id) ON DELETE CASCADE,
            status TEXT NOT NULL DEFAULT 'unknown',
            http_code INTEGER,
            response_time_ms INTEGER,
            has_results INTEGER NOT NULL DEFAULT 0,
            last_checked TEXT,
            last_status_change TEXT,
            consecutive_failures INTEGER NOT NULL DEFAULT 0
        )
        "#,
        [],
    )?;

    conn.execute(
        r#"
        CREATE TABLE IF NOT EXISTS endpoint_status_history (
            id TEXT PRIMARY KEY,
            endpoint_id TEXT NOT NULL REFERENCES monitored_endpoints(id) ON DELETE CASCADE,
            status TEXT NOT NULL,
            http_code INTEGER,
            response_time_ms INTEGER,
            has_results INTEGER NOT NULL DEFAULT 0,
            error_message TEXT,
            checked_at TEXT NOT NULL
        )
        "#,
        [],
    )?;

    // Indexes for common queries
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_results_event ON race_results(event_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_results_normalized ON race_results(normalized_name)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_results_athlete ON race_results(athlete_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_checkpoints_result ON timing_checkpoints(result_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_sources_result ON result_sources(result_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_athletes_normalized ON athletes(normalized_name)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_jobs_status ON scrape_jobs(status, next_retry_at)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_history_endpoint ON endpoint_status_history(endpoint_id, checked_at)",
        [],
    )?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rusqlite::Connection;

    #[test]
    fn test_create_tables() {
        let conn = Connection::open_in_memory().unwrap();
        create_tables(&conn).unwrap();

        let count: i32 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name IN
                 ('athletes', 'events', 'event_distances', 'race_results',
                  'timing_checkpoints', 'result_sources', 'event_source_links',
                  'athlete_follows', 'scrape_jobs', 'monitored_endpoints',
                  'endpoint_status_current', 'endpoint_status_history')",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(count, 12);
    }

    #[test]
    fn test_create_tables_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        create_tables(&conn).unwrap();
        // Should not fail on second call
        create_tables(&conn).unwrap();
    }

    #[test]
    fn test_self_link_rejected() {
        let conn = Connection::open_in_memory().unwrap();
        create_tables(&conn).unwrap();

        conn.execute(
            "INSERT INTO events (id, url, organiser, name, event_date) VALUES ('e1', 'http://a', 'x', 'A', '2025-01-01')",
            [],
        )
        .unwrap();

        let res = conn.execute(
            "INSERT INTO event_source_links (id, event_a, event_b, link_type, confidence)
             VALUES ('l1', 'e1', 'e1', 'same_event', 90)",
            [],
        );
        assert!(res.is_err());
    }
}
