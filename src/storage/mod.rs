//! SQLite storage module for the ingestion pipeline
//!
//! Provides persistent storage for events, distances, results, checkpoints,
//! provenance records, athletes, scrape jobs and endpoint status.

pub mod models;
pub mod repository;
pub mod schema;

pub use repository::{new_id, Store};
pub use schema::create_tables;
