//! Persisted scheduler-wide settings: the global pause flag and the
//! runner heartbeat.

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};
use tracing::info;

use crate::{
    db::{self, parse_ts, ts, Db},
    error::Result,
};

pub const PAUSED_KEY: &str = "tasks.paused";
pub const LAST_RUN_KEY: &str = "tasks.last_run";

/// A persisted switch that halts all job processing while set.
pub trait PauseFlag: Send + Sync {
    fn is_paused(&self) -> Result<bool>;

    fn set_paused(&self, paused: bool) -> Result<()>;

    /// Called once per runner invocation.
    fn record_heartbeat(&self, _now: DateTime<Utc>) -> Result<()> {
        Ok(())
    }
}

/// [`PauseFlag`] over the `settings` table.
#[derive(Clone)]
pub struct SettingsStore {
    db: Db,
}

impl SettingsStore {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    pub fn get(&self, key: &str) -> Result<Option<String>> {
        let conn = db::lock(&self.db)?;
        Ok(conn
            .query_row("SELECT value FROM settings WHERE key = ?1", params![key], |r| r.get(0))
            .optional()?)
    }

    pub fn set(&self, key: &str, value: &str) -> Result<()> {
        let conn = db::lock(&self.db)?;
        conn.execute(
            "INSERT INTO settings (key, value, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
            params![key, value, ts(Utc::now())],
        )?;
        Ok(())
    }

    /// When a runner last started, if ever.
    pub fn last_heartbeat(&self) -> Result<Option<DateTime<Utc>>> {
        Ok(self.get(LAST_RUN_KEY)?.as_deref().and_then(parse_ts))
    }
}

impl PauseFlag for SettingsStore {
    fn is_paused(&self) -> Result<bool> {
        Ok(matches!(self.get(PAUSED_KEY)?.as_deref(), Some("1")))
    }

    fn set_paused(&self, paused: bool) -> Result<()> {
        self.set(PAUSED_KEY, if paused { "1" } else { "0" })?;
        info!(paused, "task processing pause flag updated");
        Ok(())
    }

    fn record_heartbeat(&self, now: DateTime<Utc>) -> Result<()> {
        self.set(LAST_RUN_KEY, &ts(now))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> SettingsStore {
        SettingsStore::new(db::open_in_memory().unwrap())
    }

    #[test]
    fn pause_defaults_to_off_and_toggles() {
        let s = settings();
        assert!(!s.is_paused().unwrap());
        s.set_paused(true).unwrap();
        assert!(s.is_paused().unwrap());
        s.set_paused(false).unwrap();
        assert!(!s.is_paused().unwrap());
    }

    #[test]
    fn heartbeat_round_trips() {
        let s = settings();
        assert!(s.last_heartbeat().unwrap().is_none());
        let now = Utc::now();
        s.record_heartbeat(now).unwrap();
        assert_eq!(s.last_heartbeat().unwrap().map(ts), Some(ts(now)));
    }
}
