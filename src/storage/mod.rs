//! Persistence stores: a SQLite table and a directory of JSON files.
//!
//! Both are keyed by `(kind, key)`, last writer wins, and wrap every
//! operation in the storage retry policy.

pub mod file;
pub mod schema;

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::Utc;
use r2d2::Pool as R2D2Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::OptionalExtension;
use serde_json::Value;
use tokio::sync::OnceCell;
use tracing::{debug, info};

pub use self::file::FileStore;

use crate::collect::retry::RetryPolicy;
use crate::error::Result;
use crate::plugins::{PersistenceStore, Plugin, PluginKind, PluginMeta};

/// Connection Pool type
pub type Pool = R2D2Pool<SqliteConnectionManager>;

/// Open (or create) the SQLite database and return a connection pool.
pub fn open_pool(path: &Path) -> Result<Pool> {
    let manager = SqliteConnectionManager::file(path).with_init(|c| {
        c.execute_batch(
            "PRAGMA journal_mode = WAL;
                 PRAGMA synchronous = NORMAL;
                 PRAGMA temp_store = MEMORY;
                 PRAGMA busy_timeout = 5000;",
        )
    });

    let pool = R2D2Pool::new(manager)?;

    let conn = pool.get()?;
    schema::migrate(&conn)?;

    info!(path = %path.display(), "opened item store");
    Ok(pool)
}

/// `items` table behind an r2d2 pool. The database is opened on first use.
pub struct SqliteStore {
    meta: PluginMeta,
    path: PathBuf,
    pool: OnceCell<Pool>,
    retry: RetryPolicy,
}

impl SqliteStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            meta: PluginMeta::new(
                PluginKind::Persistence,
                "sqlite",
                "sqlite-persistence",
                "Store results in a local SQLite database.",
            ),
            path: path.into(),
            pool: OnceCell::new(),
            retry: RetryPolicy::storage(),
        }
    }

    /// Store over an already-open pool.
    pub fn with_pool(pool: Pool) -> Self {
        let store = Self::new(PathBuf::new());
        let _ = store.pool.set(pool);
        store
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    async fn pool(&self) -> Result<Pool> {
        let pool = self
            .pool
            .get_or_try_init(|| async {
                let path = self.path.clone();
                tokio::task::spawn_blocking(move || open_pool(&path)).await?
            })
            .await?;
        Ok(pool.clone())
    }

    /// Run `op` on a pooled connection off the async runtime, with retries.
    async fn with_conn<T, F>(&self, label: &str, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: Fn(&rusqlite::Connection) -> Result<T> + Clone + Send + 'static,
    {
        let pool = self.pool().await?;
        self.retry
            .run(label, || {
                let pool = pool.clone();
                let op = op.clone();
                async move {
                    tokio::task::spawn_blocking(move || {
                        let conn = pool.get()?;
                        op(&conn)
                    })
                    .await?
                }
            })
            .await
    }
}

impl Plugin for SqliteStore {
    fn meta(&self) -> &PluginMeta {
        &self.meta
    }
}

#[async_trait]
impl PersistenceStore for SqliteStore {
    async fn get(&self, kind: &str, key: &str) -> Result<Option<Value>> {
        debug!(kind, key, "reading persistent data");
        let (kind, key) = (kind.to_string(), key.to_string());
        let raw: Option<String> = self
            .with_conn("sqlite get", move |conn| {
                Ok(conn
                    .query_row(
                        "SELECT item_json FROM items WHERE kind = ?1 AND key = ?2",
                        rusqlite::params![kind, key],
                        |row| row.get(0),
                    )
                    .optional()?)
            })
            .await?;
        Ok(raw.map(|s| serde_json::from_str(&s)).transpose()?)
    }

    async fn get_all(&self, kind: &str) -> Result<Vec<Value>> {
        let kind = kind.to_string();
        let rows: Vec<String> = self
            .with_conn("sqlite get_all", move |conn| {
                let mut stmt =
                    conn.prepare("SELECT item_json FROM items WHERE kind = ?1 ORDER BY key")?;
                let rows = stmt
                    .query_map([&kind], |row| row.get(0))?
                    .collect::<rusqlite::Result<Vec<String>>>()?;
                Ok(rows)
            })
            .await?;
        rows.iter()
            .map(|s| serde_json::from_str(s).map_err(Into::into))
            .collect()
    }

    async fn save(&self, kind: &str, key: &str, item: &Value) -> Result<()> {
        debug!(kind, key, "writing persistent data");
        let (kind, key) = (kind.to_string(), key.to_string());
        let json = serde_json::to_string(item)?;
        self.with_conn("sqlite save", move |conn| {
            conn.execute(
                "INSERT INTO items (kind, key, item_json, saved_at) VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(kind, key) DO UPDATE SET
                    item_json = excluded.item_json,
                    saved_at = excluded.saved_at",
                rusqlite::params![kind, key, json, Utc::now().to_rfc3339()],
            )?;
            Ok(())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn store() -> (tempfile::TempDir, SqliteStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStore::new(dir.path().join("hostdiff.db"));
        (dir, store)
    }

    #[tokio::test]
    async fn test_save_and_get() {
        let (_dir, store) = store();
        assert_eq!(store.get("baseline", "web").await.unwrap(), None);

        store.save("baseline", "web", &json!({"a": 1})).await.unwrap();
        assert_eq!(store.get("baseline", "web").await.unwrap(), Some(json!({"a": 1})));
        assert_eq!(store.get("analysis", "web").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_last_writer_wins() {
        let (_dir, store) = store();
        store.save("baseline", "web", &json!(1)).await.unwrap();
        store.save("baseline", "web", &json!(2)).await.unwrap();
        assert_eq!(store.get("baseline", "web").await.unwrap(), Some(json!(2)));
        assert_eq!(store.get_all("baseline").await.unwrap(), vec![json!(2)]);
    }

    #[tokio::test]
    async fn test_get_all_filters_by_kind() {
        let (_dir, store) = store();
        store.save("instance", "web-i-2", &json!({"id": 2})).await.unwrap();
        store.save("instance", "web-i-1", &json!({"id": 1})).await.unwrap();
        store.save("baseline", "web", &json!({"id": 0})).await.unwrap();

        let all = store.get_all("instance").await.unwrap();
        assert_eq!(all, vec![json!({"id": 1}), json!({"id": 2})]);
    }

    #[tokio::test]
    async fn test_shared_pool() {
        let dir = tempfile::tempdir().unwrap();
        let pool = open_pool(&dir.path().join("shared.db")).unwrap();
        let a = SqliteStore::with_pool(pool.clone());
        let b = SqliteStore::with_pool(pool);
        a.save("analysis", "web", &json!([1, 2])).await.unwrap();
        assert_eq!(b.get("analysis", "web").await.unwrap(), Some(json!([1, 2])));
    }
}
