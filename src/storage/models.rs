//! Row types and enum columns for the relational schema.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// Race type of an event distance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RaceType {
    Running,
    Triathlon,
    Duathlon,
    Ultra,
    Relay,
}

impl RaceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RaceType::Running => "running",
            RaceType::Triathlon => "triathlon",
            RaceType::Duathlon => "duathlon",
            RaceType::Ultra => "ultra",
            RaceType::Relay => "relay",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "running" => Some(RaceType::Running),
            "triathlon" => Some(RaceType::Triathlon),
            "duathlon" => Some(RaceType::Duathlon),
            "ultra" => Some(RaceType::Ultra),
            "relay" => Some(RaceType::Relay),
            _ => None,
        }
    }
}

/// Finish status of a race result
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResultStatus {
    Finished,
    Dnf,
    Dns,
    Dq,
}

impl ResultStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResultStatus::Finished => "finished",
            ResultStatus::Dnf => "dnf",
            ResultStatus::Dns => "dns",
            ResultStatus::Dq => "dq",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "finished" => Some(ResultStatus::Finished),
            "dnf" => Some(ResultStatus::Dnf),
            "dns" => Some(ResultStatus::Dns),
            "dq" => Some(ResultStatus::Dq),
            _ => None,
        }
    }
}

impl Default for ResultStatus {
    fn default() -> Self {
        ResultStatus::Finished
    }
}

/// Checkpoint category
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckpointType {
    Distance,
    Transition,
    Discipline,
}

impl CheckpointType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CheckpointType::Distance => "distance",
            CheckpointType::Transition => "transition",
            CheckpointType::Discipline => "discipline",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "distance" => Some(CheckpointType::Distance),
            "transition" => Some(CheckpointType::Transition),
            "discipline" => Some(CheckpointType::Discipline),
            _ => None,
        }
    }
}

/// Scrape job lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(JobStatus::Pending),
            "running" => Some(JobStatus::Running),
            "completed" => Some(JobStatus::Completed),
            "failed" => Some(JobStatus::Failed),
            _ => None,
        }
    }
}

/// Endpoint liveness token
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EndpointStatus {
    Up,
    Down,
    Unknown,
}

impl EndpointStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EndpointStatus::Up => "up",
            EndpointStatus::Down => "down",
            EndpointStatus::Unknown => "unknown",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "up" => Some(EndpointStatus::Up),
            "down" => Some(EndpointStatus::Down),
            "unknown" => Some(EndpointStatus::Unknown),
            _ => None,
        }
    }
}

/// Relation between two events pointing at the same real-world race
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventLinkType {
    SameEvent,
    Related,
    Series,
}

impl EventLinkType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventLinkType::SameEvent => "same_event",
            EventLinkType::Related => "related",
            EventLinkType::Series => "series",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "same_event" => Some(EventLinkType::SameEvent),
            "related" => Some(EventLinkType::Related),
            "series" => Some(EventLinkType::Series),
            _ => None,
        }
    }
}

/// One race instance, identified by URL
#[derive(Debug, Clone)]
pub struct Event {
    pub id: String,
    pub url: String,
    pub organiser: String,
    pub name: String,
    pub event_date: NaiveDate,
    pub location: Option<String>,
    pub metadata: Option<String>,
    pub scraped_at: Option<DateTime<Utc>>,
}

/// A named distance within an event
#[derive(Debug, Clone)]
pub struct EventDistance {
    pub id: String,
    pub event_id: String,
    pub distance_name: String,
    pub distance_meters: u32,
    pub race_type: RaceType,
    pub expected_checkpoints: Vec<String>,
    pub participant_count: Option<u32>,
}

/// One athlete's finish in one event
#[derive(Debug, Clone)]
pub struct RaceResult {
    pub id: String,
    pub event_id: String,
    pub distance_id: Option<String>,
    pub athlete_id: Option<String>,
    pub position: Option<u32>,
    pub bib: Option<String>,
    pub name: String,
    pub normalized_name: String,
    pub gender: Option<String>,
    pub category: Option<String>,
    pub finish_time: Option<String>,
    pub gun_time: Option<String>,
    pub chip_time: Option<String>,
    pub pace: Option<String>,
    pub gender_position: Option<u32>,
    pub category_position: Option<u32>,
    pub country: Option<String>,
    pub club: Option<String>,
    pub age: Option<u32>,
    pub status: ResultStatus,
    pub time_behind: Option<String>,
    pub validation: Option<String>,
}

/// A timing point attached to a race result
#[derive(Debug, Clone)]
pub struct TimingCheckpoint {
    pub id: String,
    pub result_id: String,
    pub checkpoint_type: CheckpointType,
    pub checkpoint_name: String,
    pub checkpoint_order: u32,
    pub split_time: Option<String>,
    pub cumulative_time: Option<String>,
    pub pace: Option<String>,
    pub segment_distance_meters: Option<u32>,
}

/// Provenance record for a race result
#[derive(Debug, Clone)]
pub struct ResultSource {
    pub id: String,
    pub result_id: String,
    pub organiser: String,
    pub source_url: String,
    pub scraped_at: DateTime<Utc>,
    pub fields_provided: Vec<String>,
    pub confidence: u8,
    pub is_primary: bool,
}

/// Athlete identity record
#[derive(Debug, Clone)]
pub struct Athlete {
    pub id: String,
    pub name: String,
    pub normalized_name: String,
    pub gender: Option<String>,
    pub birth_date: Option<NaiveDate>,
    pub country: Option<String>,
    pub external_user_id: Option<String>,
}

/// One ingestion attempt
#[derive(Debug, Clone, Serialize)]
pub struct ScrapeJob {
    pub id: String,
    pub organiser: Option<String>,
    pub event_url: String,
    pub status: JobStatus,
    pub results_count: Option<u32>,
    pub error_message: Option<String>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub notification_sent: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ScrapeJob {
    /// First 8 characters of the job id, used in notification payloads.
    pub fn short_id(&self) -> &str {
        &self.id[..self.id.len().min(8)]
    }
}

/// A URL whose liveness is probed periodically
#[derive(Debug, Clone)]
pub struct MonitoredEndpoint {
    pub id: String,
    pub organiser: String,
    pub name: String,
    pub url: String,
    pub enabled: bool,
    pub check_interval_minutes: u32,
}

/// Latest known status of a monitored endpoint
#[derive(Debug, Clone)]
pub struct EndpointStatusCurrent {
    pub endpoint_id: String,
    pub status: EndpointStatus,
    pub http_code: Option<u16>,
    pub response_time_ms: Option<u64>,
    pub has_results: bool,
    pub last_checked: Option<DateTime<Utc>>,
    pub last_status_change: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
}

/// One probe outcome, appended to the history log
#[derive(Debug, Clone)]
pub struct EndpointProbe {
    pub endpoint_id: String,
    pub status: EndpointStatus,
    pub http_code: Option<u16>,
    pub response_time_ms: Option<u64>,
    pub has_results: bool,
    pub error_message: Option<String>,
    pub checked_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_enum_round_trip() {
        for s in ["running", "triathlon", "duathlon", "ultra", "relay"] {
            assert_eq!(RaceType::parse(s).unwrap().as_str(), s);
        }
        for s in ["finished", "dnf", "dns", "dq"] {
            assert_eq!(ResultStatus::parse(s).unwrap().as_str(), s);
        }
        for s in ["pending", "running", "completed", "failed"] {
            assert_eq!(JobStatus::parse(s).unwrap().as_str(), s);
        }
        for s in ["up", "down", "unknown"] {
            assert_eq!(EndpointStatus::parse(s).unwrap().as_str(), s);
        }
        for s in ["same_event", "related", "series"] {
            assert_eq!(EventLinkType::parse(s).unwrap().as_str(), s);
        }
    }

    #[test]
    fn test_status_default() {
        assert_eq!(ResultStatus::default(), ResultStatus::Finished);
    }

    #[test]
    fn test_job_short_id() {
        let job = ScrapeJob {
            id: "6f9619ff-8b86-d011-b42d-00c04fc964ff".to_string(),
            organiser: None,
            event_url: "https://example.com".to_string(),
            status: JobStatus::Pending,
            results_count: None,
            error_message: None,
            retry_count: 0,
            max_retries: 3,
            next_retry_at: None,
            notification_sent: false,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        assert_eq!(job.short_id(), "6f9619ff");
    }
}
