use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};

// State keys. Booleans are stored as "1"/"0" at this boundary only; the Rust
// API is typed.
const KEY_LAST_CHECK_AT: &str = "last_check_at";
const KEY_LAST_CHECK_IPS: &str = "last_check_ips";
const KEY_LAST_BLOCKED: &str = "last_blocked";
const KEY_ACTIVE_WINDOW: &str = "active_match_window";
const KEY_PROXY_PAUSED: &str = "proxy_paused";
const KEY_LAST_TOGGLE_ERROR: &str = "last_toggle_error";
const KEY_PINGER_REGISTERED: &str = "pinger_registered";
const KEY_PINGER_ERROR: &str = "pinger_last_error";
const KEY_PING_TOKEN: &str = "ping_token";

/// Result of one completed check cycle. Overwrites the previous one; no
/// history is retained.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckResult {
    pub checked_at: DateTime<Utc>,
    pub resolved_ips: Vec<String>,
    pub blocked: bool,
    pub active_match_window: bool,
}

/// Persisted key-value state consumed by the check loop and the monitoring
/// surface.
pub trait StateStore: Send + Sync {
    fn record_check(&self, result: &CheckResult) -> Result<()>;
    fn last_check(&self) -> Result<Option<CheckResult>>;

    /// True while the proxy is disabled by this system.
    fn paused(&self) -> Result<bool>;
    fn set_paused(&self, paused: bool) -> Result<()>;

    /// Upstream detail of the most recent failed toggle; cleared by the next
    /// successful one.
    fn last_error(&self) -> Result<Option<String>>;
    fn set_last_error(&self, error: Option<&str>) -> Result<()>;

    /// Whether the pinger handshake has been confirmed.
    fn registered(&self) -> Result<bool>;
    fn set_registered(&self, registered: bool) -> Result<()>;

    fn pinger_error(&self) -> Result<Option<String>>;
    fn set_pinger_error(&self, error: Option<&str>) -> Result<()>;

    fn ping_token(&self) -> Result<Option<String>>;
    fn set_ping_token(&self, token: &str) -> Result<()>;
}

/// Named mutual exclusion with expiry. `try_acquire` is non-blocking: failure
/// means "skip, don't wait". Expired holders are reaped on the next attempt,
/// so a crashed process cannot wedge the lock for longer than the TTL.
pub trait ToggleLock: Send + Sync {
    fn try_acquire(&self, name: &str, ttl: Duration) -> Result<bool>;
    fn release(&self, name: &str) -> Result<()>;
}

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.busy_timeout(Duration::from_secs(5))?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS state (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            )",
            [],
        )?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS locks (
                name TEXT PRIMARY KEY,
                expires_at INTEGER NOT NULL
            )",
            [],
        )?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn get(&self, key: &str) -> Result<Option<String>> {
        let conn = self.conn.lock().unwrap();
        let value = conn
            .query_row("SELECT value FROM state WHERE key = ?1", params![key], |row| {
                row.get(0)
            })
            .optional()?;
        Ok(value)
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO state(key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, value],
        )?;
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute("DELETE FROM state WHERE key = ?1", params![key])?;
        Ok(())
    }

    fn get_bool(&self, key: &str) -> Result<bool> {
        Ok(self.get(key)?.as_deref() == Some("1"))
    }

    fn set_bool(&self, key: &str, value: bool) -> Result<()> {
        self.set(key, if value { "1" } else { "0" })
    }
}

impl StateStore for SqliteStore {
    fn record_check(&self, result: &CheckResult) -> Result<()> {
        self.set(KEY_LAST_CHECK_AT, &result.checked_at.to_rfc3339())?;
        self.set(KEY_LAST_CHECK_IPS, &result.resolved_ips.join(", "))?;
        self.set_bool(KEY_LAST_BLOCKED, result.blocked)?;
        self.set_bool(KEY_ACTIVE_WINDOW, result.active_match_window)?;
        Ok(())
    }

    fn last_check(&self) -> Result<Option<CheckResult>> {
        let Some(at) = self.get(KEY_LAST_CHECK_AT)? else {
            return Ok(None);
        };
        let Ok(checked_at) = DateTime::parse_from_rfc3339(&at) else {
            return Ok(None);
        };

        let resolved_ips = self
            .get(KEY_LAST_CHECK_IPS)?
            .map(|ips| {
                ips.split(", ")
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        Ok(Some(CheckResult {
            checked_at: checked_at.with_timezone(&Utc),
            resolved_ips,
            blocked: self.get_bool(KEY_LAST_BLOCKED)?,
            active_match_window: self.get_bool(KEY_ACTIVE_WINDOW)?,
        }))
    }

    fn paused(&self) -> Result<bool> {
        self.get_bool(KEY_PROXY_PAUSED)
    }

    fn set_paused(&self, paused: bool) -> Result<()> {
        self.set_bool(KEY_PROXY_PAUSED, paused)
    }

    fn last_error(&self) -> Result<Option<String>> {
        self.get(KEY_LAST_TOGGLE_ERROR)
    }

    fn set_last_error(&self, error: Option<&str>) -> Result<()> {
        match error {
            Some(detail) => self.set(KEY_LAST_TOGGLE_ERROR, detail),
            None => self.delete(KEY_LAST_TOGGLE_ERROR),
        }
    }

    fn registered(&self) -> Result<bool> {
        self.get_bool(KEY_PINGER_REGISTERED)
    }

    fn set_registered(&self, registered: bool) -> Result<()> {
        self.set_bool(KEY_PINGER_REGISTERED, registered)
    }

    fn pinger_error(&self) -> Result<Option<String>> {
        self.get(KEY_PINGER_ERROR)
    }

    fn set_pinger_error(&self, error: Option<&str>) -> Result<()> {
        match error {
            Some(detail) => self.set(KEY_PINGER_ERROR, detail),
            None => self.delete(KEY_PINGER_ERROR),
        }
    }

    fn ping_token(&self) -> Result<Option<String>> {
        self.get(KEY_PING_TOKEN)
    }

    fn set_ping_token(&self, token: &str) -> Result<()> {
        self.set(KEY_PING_TOKEN, token)
    }
}

impl ToggleLock for SqliteStore {
    fn try_acquire(&self, name: &str, ttl: Duration) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let now = Utc::now().timestamp();

        conn.execute("DELETE FROM locks WHERE expires_at <= ?1", params![now])?;

        let inserted = conn.execute(
            "INSERT OR IGNORE INTO locks(name, expires_at) VALUES (?1, ?2)",
            params![name, now + ttl.as_secs() as i64],
        )?;
        Ok(inserted == 1)
    }

    fn release(&self, name: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute("DELETE FROM locks WHERE name = ?1", params![name])?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_store() -> (tempfile::TempDir, SqliteStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStore::open(dir.path().join("state.db")).unwrap();
        (dir, store)
    }

    #[test]
    fn check_result_round_trips() {
        let (_dir, store) = open_store();
        assert!(store.last_check().unwrap().is_none());

        let result = CheckResult {
            checked_at: "2024-01-01T10:05:00Z".parse().unwrap(),
            resolved_ips: vec!["203.0.113.5".to_string(), "198.51.100.7".to_string()],
            blocked: true,
            active_match_window: false,
        };
        store.record_check(&result).unwrap();

        assert_eq!(store.last_check().unwrap(), Some(result));
    }

    #[test]
    fn newer_check_overwrites_older() {
        let (_dir, store) = open_store();

        let first = CheckResult {
            checked_at: "2024-01-01T10:00:00Z".parse().unwrap(),
            resolved_ips: vec!["203.0.113.5".to_string()],
            blocked: true,
            active_match_window: true,
        };
        let second = CheckResult {
            checked_at: "2024-01-01T10:05:00Z".parse().unwrap(),
            resolved_ips: vec![],
            blocked: false,
            active_match_window: false,
        };

        store.record_check(&first).unwrap();
        store.record_check(&second).unwrap();
        assert_eq!(store.last_check().unwrap(), Some(second));
    }

    #[test]
    fn paused_defaults_to_false() {
        let (_dir, store) = open_store();
        assert!(!store.paused().unwrap());

        store.set_paused(true).unwrap();
        assert!(store.paused().unwrap());

        store.set_paused(false).unwrap();
        assert!(!store.paused().unwrap());
    }

    #[test]
    fn last_error_sets_and_clears() {
        let (_dir, store) = open_store();
        assert!(store.last_error().unwrap().is_none());

        store
            .set_last_error(Some(r#"[{"code":9109}]"#))
            .unwrap();
        assert_eq!(
            store.last_error().unwrap().as_deref(),
            Some(r#"[{"code":9109}]"#)
        );

        store.set_last_error(None).unwrap();
        assert!(store.last_error().unwrap().is_none());
    }

    #[test]
    fn registration_and_token_round_trip() {
        let (_dir, store) = open_store();
        assert!(!store.registered().unwrap());
        assert!(store.ping_token().unwrap().is_none());

        store.set_ping_token("s3cret-token").unwrap();
        store.set_registered(true).unwrap();
        store.set_pinger_error(None).unwrap();

        assert!(store.registered().unwrap());
        assert_eq!(store.ping_token().unwrap().as_deref(), Some("s3cret-token"));
        assert!(store.pinger_error().unwrap().is_none());
    }

    #[test]
    fn lock_is_exclusive_until_released() {
        let (_dir, store) = open_store();
        let ttl = Duration::from_secs(30);

        assert!(store.try_acquire("toggle", ttl).unwrap());
        assert!(!store.try_acquire("toggle", ttl).unwrap());

        store.release("toggle").unwrap();
        assert!(store.try_acquire("toggle", ttl).unwrap());
    }

    #[test]
    fn expired_lock_is_reaped_on_next_attempt() {
        let (_dir, store) = open_store();

        assert!(store.try_acquire("toggle", Duration::from_secs(0)).unwrap());
        // TTL of zero expires immediately; the next attempt reaps it.
        assert!(store.try_acquire("toggle", Duration::from_secs(30)).unwrap());
    }

    #[test]
    fn locks_are_independent_by_name() {
        let (_dir, store) = open_store();
        let ttl = Duration::from_secs(30);

        assert!(store.try_acquire("toggle", ttl).unwrap());
        assert!(store.try_acquire("other", ttl).unwrap());
    }
}
