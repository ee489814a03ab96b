use chrono::Utc;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::info;

use super::ReputationStore;
use crate::error::WafResult;
use crate::models::event::ThreatIntelligence;

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS reputation (
        ip          TEXT PRIMARY KEY,
        record_json TEXT NOT NULL,
        expires_at  INTEGER NOT NULL,
        updated_at  TEXT DEFAULT (datetime('now'))
    );

    CREATE INDEX IF NOT EXISTS idx_reputation_expires ON reputation(expires_at);

    CREATE TABLE IF NOT EXISTS blocked_ips (
        ip          TEXT PRIMARY KEY,
        created_at  TEXT DEFAULT (datetime('now'))
    );
";

/// SQLite-backed reputation store; survives restarts.
pub struct SqliteReputationStore {
    conn: Mutex<Connection>,
}

impl SqliteReputationStore {
    pub fn open(path: &str) -> WafResult<Self> {
        if let Some(parent) = std::path::Path::new(path).parent() {
            if !parent.as_os_str().is_empty() {
                let _ = std::fs::create_dir_all(parent);
            }
        }
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        let store = Self::with_connection(conn)?;
        info!(path = %path, "SQLite reputation store opened");
        Ok(store)
    }

    pub fn open_in_memory() -> WafResult<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> WafResult<Self> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

impl ReputationStore for SqliteReputationStore {
    fn get(&self, ip: &str) -> WafResult<Option<ThreatIntelligence>> {
        let conn = self.conn.lock();
        let json: Option<String> = conn
            .query_row(
                "SELECT record_json FROM reputation WHERE ip = ?1 AND expires_at > ?2",
                params![ip, Utc::now().timestamp()],
                |row| row.get(0),
            )
            .optional()?;
        match json {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    fn set(&self, ip: &str, record: &ThreatIntelligence, ttl_secs: u64) -> WafResult<()> {
        let json = serde_json::to_string(record)?;
        let ttl = i64::try_from(ttl_secs).unwrap_or(i64::MAX / 2);
        let expires_at = Utc::now().timestamp().saturating_add(ttl);
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO reputation (ip, record_json, expires_at, updated_at)
             VALUES (?1, ?2, ?3, datetime('now'))
             ON CONFLICT(ip) DO UPDATE SET
                record_json = excluded.record_json,
                expires_at = excluded.expires_at,
                updated_at = datetime('now')",
            params![ip, json, expires_at],
        )?;
        Ok(())
    }

    fn add_to_blocked_set(&self, ip: &str) -> WafResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR IGNORE INTO blocked_ips (ip) VALUES (?1)",
            params![ip],
        )?;
        Ok(())
    }

    fn remove_from_blocked_set(&self, ip: &str) -> WafResult<()> {
        let conn = self.conn.lock();
        conn.execute("DELETE FROM blocked_ips WHERE ip = ?1", params![ip])?;
        Ok(())
    }

    fn is_in_blocked_set(&self, ip: &str) -> WafResult<bool> {
        let conn = self.conn.lock();
        let found: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM blocked_ips WHERE ip = ?1",
                params![ip],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    fn purge_expired(&self) -> WafResult<usize> {
        let conn = self.conn.lock();
        let removed = conn.execute(
            "DELETE FROM reputation WHERE expires_at <= ?1",
            params![Utc::now().timestamp()],
        )?;
        Ok(removed)
    }

    fn blocked_count(&self) -> WafResult<usize> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM blocked_ips", [], |row| row.get(0))?;
        Ok(usize::try_from(count).unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_round_trip_and_expiry() {
        let store = SqliteReputationStore::open_in_memory().unwrap();
        let mut record = ThreatIntelligence::empty("203.0.113.7");
        record.set_reputation(90);
        record.categories.insert("bot_detected".into());
        record.sources.insert("internal".into());

        store.set("203.0.113.7", &record, 3600).unwrap();
        let loaded = store.get("203.0.113.7").unwrap().unwrap();
        assert_eq!(loaded.reputation(), 90);
        assert!(loaded.categories.contains("bot_detected"));

        store.set("203.0.113.8", &record, 0).unwrap();
        assert!(store.get("203.0.113.8").unwrap().is_none());
        assert_eq!(store.purge_expired().unwrap(), 1);
    }

    #[test]
    fn test_blocked_set() {
        let store = SqliteReputationStore::open_in_memory().unwrap();
        store.add_to_blocked_set("198.51.100.1").unwrap();
        store.add_to_blocked_set("198.51.100.1").unwrap();
        assert!(store.is_in_blocked_set("198.51.100.1").unwrap());
        assert_eq!(store.blocked_count().unwrap(), 1);

        store.remove_from_blocked_set("198.51.100.1").unwrap();
        assert!(!store.is_in_blocked_set("198.51.100.1").unwrap());
    }
}
