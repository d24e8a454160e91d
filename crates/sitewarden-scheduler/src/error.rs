use thiserror::Error;

use crate::types::JobId;

/// Errors that can occur within the scheduler subsystem.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Underlying SQLite / rusqlite error.
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// The cron expression could not be parsed.
    #[error("Invalid cron expression '{expr}': {reason}")]
    InvalidCron { expr: String, reason: String },

    /// The configured timezone is not a known IANA zone.
    #[error("Invalid timezone: {0}")]
    InvalidTimezone(String),

    /// The cron expression never fires again after the reference instant.
    #[error("Cron expression '{0}' has no upcoming run")]
    NoUpcomingRun(String),

    /// No job with the given ID exists in the store.
    #[error("Job not found: {id}")]
    JobNotFound { id: JobId },

    /// The job row no longer carries this run's claim: it was reaped and
    /// possibly claimed again by another runner.
    #[error("Job {id} is no longer claimed by this run")]
    ClaimLost { id: JobId },

    /// A JSON column could not be encoded or decoded.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A shared connection mutex was poisoned by a panicking holder.
    #[error("Connection poisoned: {0}")]
    Poisoned(String),
}

pub type Result<T> = std::result::Result<T, SchedulerError>;
