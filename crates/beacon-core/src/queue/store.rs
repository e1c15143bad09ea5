//! SQLite-backed persistence for the request queue.
//!
//! One table, five columns. A row lives from submit until a terminal
//! outcome; process death in between leaves it for the next drain.

use std::path::Path;
use std::sync::Mutex;

use chrono::DateTime;
use rusqlite::{params, Connection};

use crate::error::StoreError;
use crate::queue::QueuedRequest;

/// Persistent store for queued requests.
///
/// The connection is mutex-guarded so submits and the drain worker cannot
/// interleave row updates.
pub struct RequestStore {
    conn: Mutex<Connection>,
}

impl RequestStore {
    /// Open (and migrate) the store at `path`.
    ///
    /// # Errors
    /// Returns an error if the database cannot be opened or migrated.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open(path).map_err(|source| StoreError::OpenFailed {
            path: path.to_path_buf(),
            source,
        })?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.migrate()?;
        Ok(store)
    }

    /// Open an ephemeral in-memory store. Nothing survives drop; useful
    /// for tests and dry runs.
    ///
    /// # Errors
    /// Returns an error if the database cannot be opened or migrated.
    pub fn open_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory().map_err(|source| StoreError::OpenFailed {
            path: ":memory:".into(),
            source,
        })?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.migrate()?;
        Ok(store)
    }

    fn migrate(&self) -> Result<(), StoreError> {
        self.conn
            .lock()
            .expect("request store poisoned")
            .execute_batch(
                "CREATE TABLE IF NOT EXISTS cache (
                    request_endpoint TEXT NOT NULL,
                    request_payload  TEXT NOT NULL,
                    request_id       TEXT NOT NULL PRIMARY KEY,
                    request_date     INTEGER NOT NULL,
                    retry_count      INTEGER NOT NULL DEFAULT 0
                );

                CREATE INDEX IF NOT EXISTS idx_cache_retry_count ON cache(retry_count);",
            )
            .map_err(|e| StoreError::MigrationFailed(e.to_string()))?;
        Ok(())
    }

    /// Persist one request.
    ///
    /// # Errors
    /// Returns an error if the insert fails.
    pub fn insert(&self, request: &QueuedRequest) -> Result<(), StoreError> {
        let payload_json = serde_json::to_string(&request.payload)
            .map_err(|e| StoreError::QueryFailed(e.to_string()))?;
        self.conn.lock().expect("request store poisoned").execute(
            "INSERT OR REPLACE INTO cache
             (request_endpoint, request_payload, request_id, request_date, retry_count)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                request.endpoint,
                payload_json,
                request.request_id,
                request.date.timestamp_millis(),
                request.retry_count,
            ],
        )?;
        Ok(())
    }

    /// Remove a request after a terminal outcome. Returns whether a row
    /// was actually removed.
    ///
    /// # Errors
    /// Returns an error if the delete fails.
    pub fn delete(&self, request_id: &str) -> Result<bool, StoreError> {
        let n = self
            .conn
            .lock()
            .expect("request store poisoned")
            .execute("DELETE FROM cache WHERE request_id = ?1", params![request_id])?;
        Ok(n > 0)
    }

    /// Record a failed attempt; the row stays for the next drain.
    ///
    /// # Errors
    /// Returns an error if the update fails.
    pub fn bump_retry(&self, request_id: &str) -> Result<(), StoreError> {
        self.conn.lock().expect("request store poisoned").execute(
            "UPDATE cache SET retry_count = retry_count + 1 WHERE request_id = ?1",
            params![request_id],
        )?;
        Ok(())
    }

    /// All persisted requests, chronic failures last.
    ///
    /// Rows whose payload no longer parses are skipped with a warning; they
    /// stay in place rather than being silently destroyed.
    ///
    /// # Errors
    /// Returns an error if the query fails.
    pub fn pending(&self) -> Result<Vec<QueuedRequest>, StoreError> {
        let conn = self.conn.lock().expect("request store poisoned");
        let mut stmt = conn.prepare(
            "SELECT request_endpoint, request_payload, request_id, request_date, retry_count
             FROM cache
             ORDER BY retry_count ASC, request_date ASC",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, i64>(3)?,
                row.get::<_, u32>(4)?,
            ))
        })?;

        let mut requests = Vec::new();
        for row in rows {
            let (endpoint, payload_json, request_id, date_ms, retry_count) = row?;
            let payload = match serde_json::from_str(&payload_json) {
                Ok(p) => p,
                Err(e) => {
                    tracing::warn!(%request_id, error = %e, "request.cache.unreadable");
                    continue;
                }
            };
            requests.push(QueuedRequest {
                endpoint,
                payload,
                request_id,
                date: DateTime::from_timestamp_millis(date_ms).unwrap_or(DateTime::UNIX_EPOCH),
                retry_count,
                transient: false,
            });
        }
        Ok(requests)
    }

    /// Number of persisted requests.
    ///
    /// # Errors
    /// Returns an error if the query fails.
    pub fn len(&self) -> Result<usize, StoreError> {
        let n: i64 = self
            .conn
            .lock()
            .expect("request store poisoned")
            .query_row("SELECT COUNT(*) FROM cache", [], |row| row.get(0))?;
        Ok(n as usize)
    }

    /// # Errors
    /// Returns an error if the query fails.
    pub fn is_empty(&self) -> Result<bool, StoreError> {
        Ok(self.len()? == 0)
    }

    /// Drop every persisted request. Returns how many rows were removed.
    ///
    /// # Errors
    /// Returns an error if the delete fails.
    pub fn purge(&self) -> Result<usize, StoreError> {
        let n = self
            .conn
            .lock()
            .expect("request store poisoned")
            .execute("DELETE FROM cache", [])?;
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn request(endpoint: &str) -> QueuedRequest {
        let mut payload = serde_json::Map::new();
        payload.insert("k".into(), json!("v"));
        QueuedRequest::new(endpoint, payload)
    }

    #[test]
    fn insert_and_enumerate() {
        let store = RequestStore::open_memory().unwrap();
        let req = request("/me/events");
        store.insert(&req).unwrap();

        let pending = store.pending().unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].endpoint, "/me/events");
        assert_eq!(pending[0].request_id, req.request_id);
        assert_eq!(pending[0].payload["k"], "v");
        assert_eq!(pending[0].retry_count, 0);
    }

    #[test]
    fn delete_removes_row() {
        let store = RequestStore::open_memory().unwrap();
        let req = request("/me/events");
        store.insert(&req).unwrap();

        assert!(store.delete(&req.request_id).unwrap());
        assert!(!store.delete(&req.request_id).unwrap());
        assert!(store.is_empty().unwrap());
    }

    #[test]
    fn bump_retry_increments_exactly_once() {
        let store = RequestStore::open_memory().unwrap();
        let req = request("/me/events");
        store.insert(&req).unwrap();

        store.bump_retry(&req.request_id).unwrap();
        let pending = store.pending().unwrap();
        assert_eq!(pending[0].retry_count, 1);
    }

    #[test]
    fn pending_orders_by_retry_count() {
        let store = RequestStore::open_memory().unwrap();
        let chronic = request("/chronic");
        let fresh = request("/fresh");
        store.insert(&chronic).unwrap();
        store.insert(&fresh).unwrap();
        store.bump_retry(&chronic.request_id).unwrap();
        store.bump_retry(&chronic.request_id).unwrap();

        let pending = store.pending().unwrap();
        assert_eq!(pending[0].endpoint, "/fresh");
        assert_eq!(pending[1].endpoint, "/chronic");
        assert_eq!(pending[1].retry_count, 2);
    }

    #[test]
    fn unreadable_payload_is_skipped_not_destroyed() {
        let store = RequestStore::open_memory().unwrap();
        store
            .conn
            .lock()
            .unwrap()
            .execute(
                "INSERT INTO cache VALUES ('/e', 'not json', 'rid', 0, 0)",
                [],
            )
            .unwrap();

        assert!(store.pending().unwrap().is_empty());
        assert_eq!(store.len().unwrap(), 1);
    }

    #[test]
    fn survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.db");
        let req = request("/me/events");
        {
            let store = RequestStore::open(&path).unwrap();
            store.insert(&req).unwrap();
        }
        let store = RequestStore::open(&path).unwrap();
        let pending = store.pending().unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].request_id, req.request_id);
    }
}
