//! LifetimeStore: a durable key -> float map backed by
//! `rusqlite` with the `bundled` feature, an embedded, synchronous local
//! datastore. Every write is a synchronous row upsert.

use std::path::Path;
use std::sync::Mutex;

use rusqlite::{params, Connection, OptionalExtension};

use crate::error::{ControllerError, Result};

/// Keys initialized to zero on first start.
pub const DEFAULT_KEYS: &[&str] = &[
    "tokens_total",
    "prompt_tokens_total",
    "completion_tokens_total",
    "requests_total",
    "energy_wh",
    "uptime_seconds",
    "first_started_at",
];

pub struct LifetimeStore {
    conn: Mutex<Connection>,
}

impl LifetimeStore {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)
            .map_err(|e| ControllerError::Other(anyhow::anyhow!("opening lifetime store: {e}")))?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS counters (name TEXT PRIMARY KEY, value REAL NOT NULL)",
            [],
        )
        .map_err(|e| ControllerError::Other(anyhow::anyhow!("creating counters table: {e}")))?;
        let store = LifetimeStore {
            conn: Mutex::new(conn),
        };
        store.init_defaults()?;
        Ok(store)
    }

    fn init_defaults(&self) -> Result<()> {
        for key in DEFAULT_KEYS {
            if self.get(key)?.is_none() {
                self.set(key, 0.0)?;
            }
        }
        // first_started_at is stamped with wall-clock on first start only.
        if self.get("first_started_at")? == Some(0.0) {
            let now = std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.as_secs_f64())
                .unwrap_or(0.0);
            self.set("first_started_at", now)?;
        }
        Ok(())
    }

    pub fn get(&self, key: &str) -> Result<Option<f64>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT value FROM counters WHERE name = ?1",
            params![key],
            |row| row.get(0),
        )
        .optional()
        .map_err(|e| ControllerError::Other(anyhow::anyhow!("reading counter {key}: {e}")))
    }

    pub fn set(&self, key: &str, value: f64) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO counters (name, value) VALUES (?1, ?2)
             ON CONFLICT(name) DO UPDATE SET value = excluded.value",
            params![key, value],
        )
        .map_err(|e| ControllerError::Other(anyhow::anyhow!("writing counter {key}: {e}")))?;
        Ok(())
    }

    /// Increment(key, delta) -> newValue. Negative deltas are accepted (the
    /// caller is responsible for ignoring negative deltas on a counter
    /// backend restart" rule; the store itself just adds what it's given).
    pub fn increment(&self, key: &str, delta: f64) -> Result<f64> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO counters (name, value) VALUES (?1, ?2)
             ON CONFLICT(name) DO UPDATE SET value = value + excluded.value",
            params![key, delta],
        )
        .map_err(|e| ControllerError::Other(anyhow::anyhow!("incrementing counter {key}: {e}")))?;
        conn.query_row(
            "SELECT value FROM counters WHERE name = ?1",
            params![key],
            |row| row.get(0),
        )
        .map_err(|e| ControllerError::Other(anyhow::anyhow!("reading counter {key}: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_populates_default_keys_with_zero() {
        let dir = tempfile::tempdir().unwrap();
        let store = LifetimeStore::open(&dir.path().join("lifetime.db")).unwrap();
        assert_eq!(store.get("tokens_total").unwrap(), Some(0.0));
        assert_eq!(store.get("requests_total").unwrap(), Some(0.0));
    }

    #[test]
    fn first_started_at_is_stamped_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lifetime.db");
        let store = LifetimeStore::open(&path).unwrap();
        let first = store.get("first_started_at").unwrap().unwrap();
        assert!(first > 0.0);
        drop(store);

        let reopened = LifetimeStore::open(&path).unwrap();
        let second = reopened.get("first_started_at").unwrap().unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn increment_accumulates_and_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lifetime.db");
        let store = LifetimeStore::open(&path).unwrap();
        assert_eq!(store.increment("tokens_total", 100.0).unwrap(), 100.0);
        assert_eq!(store.increment("tokens_total", 50.0).unwrap(), 150.0);
        drop(store);

        let reopened = LifetimeStore::open(&path).unwrap();
        assert_eq!(reopened.get("tokens_total").unwrap(), Some(150.0));
    }
}
