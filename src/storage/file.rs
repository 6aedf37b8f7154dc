//! One JSON file per item under a directory.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use crate::collect::retry::RetryPolicy;
use crate::error::{Error, Result};
use crate::plugins::{PersistenceStore, Plugin, PluginKind, PluginMeta};

pub struct FileStore {
    meta: PluginMeta,
    directory: PathBuf,
    retry: RetryPolicy,
}

impl FileStore {
    pub fn new(directory: impl AsRef<Path>) -> Self {
        Self {
            meta: PluginMeta::new(
                PluginKind::Persistence,
                "file",
                "local-file",
                "Store results locally for further analysis.",
            ),
            directory: directory.as_ref().to_path_buf(),
            retry: RetryPolicy::storage(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// `{kind}-{key}.json`, or `{key}.json` when `kind` is empty.
    pub fn path_for(&self, kind: &str, key: &str) -> PathBuf {
        let name = if kind.is_empty() {
            format!("{key}.json")
        } else {
            format!("{kind}-{key}.json")
        };
        self.directory.join(name)
    }
}

impl Plugin for FileStore {
    fn meta(&self) -> &PluginMeta {
        &self.meta
    }
}

#[async_trait]
impl PersistenceStore for FileStore {
    async fn get(&self, kind: &str, key: &str) -> Result<Option<Value>> {
        let path = self.path_for(kind, key);
        debug!(path = %path.display(), "reading persistent data");
        let content = self
            .retry
            .run("file get", || async {
                match tokio::fs::read(&path).await {
                    Ok(bytes) => Ok(Some(bytes)),
                    Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
                    Err(e) => Err(Error::from(e)),
                }
            })
            .await?;
        Ok(content.map(|b| serde_json::from_slice(&b)).transpose()?)
    }

    async fn get_all(&self, kind: &str) -> Result<Vec<Value>> {
        let prefix = format!("{kind}-");
        let mut names = Vec::new();
        let mut entries = match tokio::fs::read_dir(&self.directory).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with(&prefix) && name.ends_with(".json") {
                names.push(name);
            }
        }
        names.sort();

        let mut items = Vec::with_capacity(names.len());
        for name in names {
            let path = self.directory.join(name);
            let bytes = self
                .retry
                .run("file get_all", || async {
                    tokio::fs::read(&path).await.map_err(Error::from)
                })
                .await?;
            items.push(serde_json::from_slice(&bytes)?);
        }
        Ok(items)
    }

    async fn save(&self, kind: &str, key: &str, item: &Value) -> Result<()> {
        let path = self.path_for(kind, key);
        debug!(path = %path.display(), "writing persistent data");
        let bytes = serde_json::to_vec(item)?;
        self.retry
            .run("file save", || async {
                tokio::fs::create_dir_all(&self.directory)
                    .await
                    .map_err(Error::from)?;
                tokio::fs::write(&path, &bytes).await.map_err(Error::from)
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_file_naming() {
        let store = FileStore::new("/tmp/hd");
        assert_eq!(store.path_for("baseline", "web"), PathBuf::from("/tmp/hd/baseline-web.json"));
        assert_eq!(store.path_for("", "web-i-1"), PathBuf::from("/tmp/hd/web-i-1.json"));
    }

    #[tokio::test]
    async fn test_roundtrip_and_missing() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path().join("nested"));
        assert_eq!(store.get("baseline", "web").await.unwrap(), None);
        assert!(store.get_all("baseline").await.unwrap().is_empty());

        store.save("baseline", "web", &json!({"stdout": [1]})).await.unwrap();
        assert_eq!(
            store.get("baseline", "web").await.unwrap(),
            Some(json!({"stdout": [1]}))
        );

        store.save("baseline", "web", &json!({"stdout": [2]})).await.unwrap();
        assert_eq!(
            store.get("baseline", "web").await.unwrap(),
            Some(json!({"stdout": [2]}))
        );
    }

    #[tokio::test]
    async fn test_get_all_matches_kind_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path());
        store.save("instance", "web-b", &json!("b")).await.unwrap();
        store.save("instance", "web-a", &json!("a")).await.unwrap();
        store.save("analysis", "web", &json!("x")).await.unwrap();
        std::fs::write(dir.path().join("instance-notes.txt"), "ignored").unwrap();

        assert_eq!(store.get_all("instance").await.unwrap(), vec![json!("a"), json!("b")]);
        assert_eq!(store.get_all("analysis").await.unwrap(), vec![json!("x")]);
    }

    #[tokio::test]
    async fn test_corrupt_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path());
        std::fs::write(store.path_for("baseline", "web"), "{not json").unwrap();
        assert!(store.get("baseline", "web").await.is_err());
    }
}
