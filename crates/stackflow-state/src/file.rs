//! File-based state store
//!
//! Layout: `<root>/<app>/<stage>/<type>/<id>.json`, one record per file.
//! Writes go to a hidden temp file in the same directory and are renamed
//! into place, so readers never observe a half-written record and writers
//! of different paths never contend.

use crate::error::{Result, StateError};
use crate::path::ScopeId;
use crate::record::StateRecord;
use crate::store::StateStore;
use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::fs;

const BACKEND: &str = "FileStateStore";
const RECORD_EXT: &str = ".json";

static TMP_COUNTER: AtomicU64 = AtomicU64::new(0);

pub struct FileStateStore {
    root: PathBuf,
    scope: ScopeId,
    initialized: AtomicBool,
}

impl FileStateStore {
    pub fn new(root: impl AsRef<Path>, scope: ScopeId) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            scope,
            initialized: AtomicBool::new(false),
        }
    }

    /// Directory holding this scope's records
    pub fn scope_dir(&self) -> PathBuf {
        self.root.join(self.scope.app()).join(self.scope.stage())
    }

    fn record_file(&self, path: &str) -> Result<PathBuf> {
        let (resource_type, id) = self.scope.split(path)?;
        Ok(self
            .scope_dir()
            .join(encode_segment(resource_type))
            .join(format!("{}{}", encode_segment(id), RECORD_EXT)))
    }

    async fn read_dir_entries(&self, dir: &Path) -> Result<Vec<(String, bool)>> {
        let mut entries = match fs::read_dir(dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(store_io(dir, e)),
        };
        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(|e| store_io(dir, e))? {
            let is_dir = entry
                .file_type()
                .await
                .map_err(|e| store_io(&entry.path(), e))?
                .is_dir();
            if let Some(name) = entry.file_name().to_str() {
                names.push((name.to_string(), is_dir));
            }
        }
        Ok(names)
    }
}

#[async_trait]
impl StateStore for FileStateStore {
    fn backend_name(&self) -> &'static str {
        BACKEND
    }

    fn scope(&self) -> &ScopeId {
        &self.scope
    }

    async fn init(&self) -> Result<()> {
        if self.initialized.load(Ordering::Acquire) {
            return Ok(());
        }
        let dir = self.scope_dir();
        fs::create_dir_all(&dir)
            .await
            .map_err(|e| store_io(&dir, e))?;
        self.initialized.store(true, Ordering::Release);
        tracing::debug!("Opened state directory: {}", dir.display());
        Ok(())
    }

    async fn deinit(&self) -> Result<()> {
        if self.initialized.swap(false, Ordering::AcqRel) {
            tracing::debug!("Closed state directory: {}", self.scope_dir().display());
        }
        Ok(())
    }

    async fn get(&self, path: &str) -> Result<Option<StateRecord>> {
        let file = self.record_file(path)?;
        match fs::read_to_string(&file).await {
            Ok(content) => Ok(Some(StateRecord::from_json(&content)?)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(store_io(&file, e)),
        }
    }

    async fn set(&self, path: &str, record: &StateRecord) -> Result<()> {
        let file = self.record_file(path)?;
        let dir = file
            .parent()
            .ok_or_else(|| StateError::InvalidPath(path.to_string()))?;
        fs::create_dir_all(dir)
            .await
            .map_err(|e| store_io(dir, e))?;

        let content = serde_json::to_string_pretty(record)?;
        let tmp = dir.join(format!(
            ".{}.{}.{}.tmp",
            file.file_name().and_then(|n| n.to_str()).unwrap_or("record"),
            std::process::id(),
            TMP_COUNTER.fetch_add(1, Ordering::Relaxed)
        ));
        fs::write(&tmp, content)
            .await
            .map_err(|e| store_io(&tmp, e))?;
        if let Err(e) = fs::rename(&tmp, &file).await {
            let _ = fs::remove_file(&tmp).await;
            return Err(store_io(&file, e));
        }

        tracing::debug!("Saved record {}", path);
        Ok(())
    }

    async fn delete(&self, path: &str) -> Result<()> {
        let file = self.record_file(path)?;
        match fs::remove_file(&file).await {
            Ok(()) => {
                tracing::debug!("Removed record {}", path);
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(store_io(&file, e)),
        }
    }

    async fn list(&self) -> Result<Vec<String>> {
        let scope_dir = self.scope_dir();
        let mut paths = Vec::new();
        for (type_dir, is_dir) in self.read_dir_entries(&scope_dir).await? {
            if !is_dir || type_dir.starts_with('.') {
                continue;
            }
            let resource_type = decode_segment(&type_dir);
            for (file_name, is_dir) in self.read_dir_entries(&scope_dir.join(&type_dir)).await? {
                if is_dir || file_name.starts_with('.') {
                    continue;
                }
                let Some(id) = file_name.strip_suffix(RECORD_EXT) else {
                    continue;
                };
                paths.push(
                    self.scope
                        .resource_path(&resource_type, &decode_segment(id))?,
                );
            }
        }
        paths.sort();
        Ok(paths)
    }
}

fn store_io(path: &Path, e: std::io::Error) -> StateError {
    StateError::StoreIo {
        backend: BACKEND,
        message: format!("{}: {}", path.display(), e),
    }
}

/// Escape characters that are unsafe in file names on some platforms.
/// A leading `.` is escaped so records never look like temp files.
fn encode_segment(segment: &str) -> String {
    let mut out = String::with_capacity(segment.len());
    for (i, c) in segment.chars().enumerate() {
        match c {
            '%' => out.push_str("%25"),
            ':' => out.push_str("%3A"),
            '\\' => out.push_str("%5C"),
            '.' if i == 0 => out.push_str("%2E"),
            c => out.push(c),
        }
    }
    out
}

fn decode_segment(segment: &str) -> String {
    let mut out = String::with_capacity(segment.len());
    let mut rest = segment;
    while let Some(pos) = rest.find('%') {
        out.push_str(&rest[..pos]);
        let escaped = rest.get(pos..pos + 3).unwrap_or("");
        match escaped {
            "%25" => out.push('%'),
            "%3A" => out.push(':'),
            "%5C" => out.push('\\'),
            "%2E" => out.push('.'),
            _ => {
                out.push('%');
                rest = &rest[pos + 1..];
                continue;
            }
        }
        rest = &rest[pos + 3..];
    }
    out.push_str(rest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::RecordStatus;
    use serde_json::json;
    use tempfile::tempdir;

    fn scope() -> ScopeId {
        ScopeId::new("shop", "prod").unwrap()
    }

    #[tokio::test]
    async fn test_record_save_load() {
        let temp_dir = tempdir().unwrap();
        let store = FileStateStore::new(temp_dir.path(), scope());
        store.init().await.unwrap();

        let record = StateRecord::new("Queue", "orders", "h1")
            .with_status(RecordStatus::Committed)
            .with_output(json!({"arn": "arn:queue:orders"}));
        store.set("shop/prod/Queue/orders", &record).await.unwrap();

        let loaded = store.get("shop/prod/Queue/orders").await.unwrap();
        assert_eq!(loaded, Some(record));
        assert!(temp_dir.path().join("shop/prod/Queue/orders.json").exists());
    }

    #[tokio::test]
    async fn test_empty_state() {
        let temp_dir = tempdir().unwrap();
        let store = FileStateStore::new(temp_dir.path(), scope());

        // init 前でも読み取りはできる
        assert!(store.list().await.unwrap().is_empty());
        assert_eq!(store.count().await.unwrap(), 0);
        assert!(store.get("shop/prod/Queue/none").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_init_deinit_idempotent() {
        let temp_dir = tempdir().unwrap();
        let store = FileStateStore::new(temp_dir.path(), scope());

        store.deinit().await.unwrap();
        store.init().await.unwrap();
        store.init().await.unwrap();
        assert!(store.scope_dir().is_dir());
        store.deinit().await.unwrap();
        store.deinit().await.unwrap();
    }

    #[tokio::test]
    async fn test_list_decodes_names() {
        let temp_dir = tempdir().unwrap();
        let store = FileStateStore::new(temp_dir.path(), scope());

        for (ty, id) in [("cloudflare::Worker", "api"), ("Queue", ".hidden%id"), ("Queue", "b")] {
            let path = scope().resource_path(ty, id).unwrap();
            store.set(&path, &StateRecord::new(ty, id, "h")).await.unwrap();
        }
        // 書き込み途中の一時ファイルは無視される
        std::fs::write(store.scope_dir().join("Queue").join(".b.json.1.0.tmp"), "{").unwrap();

        assert_eq!(
            store.list().await.unwrap(),
            vec![
                "shop/prod/Queue/.hidden%id",
                "shop/prod/Queue/b",
                "shop/prod/cloudflare::Worker/api",
            ]
        );
        assert_eq!(store.all().await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_delete() {
        let temp_dir = tempdir().unwrap();
        let store = FileStateStore::new(temp_dir.path(), scope());
        let path = "shop/prod/Queue/orders";

        store.set(path, &StateRecord::new("Queue", "orders", "h")).await.unwrap();
        store.delete(path).await.unwrap();
        assert!(store.get(path).await.unwrap().is_none());
        store.delete(path).await.unwrap();
    }

    #[tokio::test]
    async fn test_concurrent_writes_to_different_paths() {
        let temp_dir = tempdir().unwrap();
        let store = std::sync::Arc::new(FileStateStore::new(temp_dir.path(), scope()));

        let writes = (0..16).map(|i| {
            let store = store.clone();
            async move {
                let id = format!("q{}", i);
                let path = format!("shop/prod/Queue/{}", id);
                store.set(&path, &StateRecord::new("Queue", id, "h")).await
            }
        });
        for result in futures_util::future::join_all(writes).await {
            result.unwrap();
        }

        assert_eq!(store.count().await.unwrap(), 16);
    }

    #[tokio::test]
    async fn test_corrupt_record_is_error() {
        let temp_dir = tempdir().unwrap();
        let store = FileStateStore::new(temp_dir.path(), scope());
        let dir = store.scope_dir().join("Queue");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("broken.json"), "not json").unwrap();

        let result = store.get("shop/prod/Queue/broken").await;
        assert!(matches!(result, Err(StateError::Json(_))));
    }

    #[test]
    fn test_segment_encoding() {
        for s in ["plain", "a:b", "50%", ".dot", "x.y", "%3A"] {
            assert_eq!(decode_segment(&encode_segment(s)), s);
        }
        assert_eq!(encode_segment("aws::Queue"), "aws%3A%3AQueue");
    }
}
