//! In-memory state store
//!
//! Clones share the same map, so a test can open several runs against one
//! store and observe what the previous run committed.

use crate::error::Result;
use crate::path::ScopeId;
use crate::record::StateRecord;
use crate::store::StateStore;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::RwLock;

#[derive(Debug, Clone)]
pub struct MemoryStateStore {
    scope: ScopeId,
    records: Arc<RwLock<BTreeMap<String, StateRecord>>>,
}

impl MemoryStateStore {
    pub fn new(scope: ScopeId) -> Self {
        Self {
            scope,
            records: Arc::new(RwLock::new(BTreeMap::new())),
        }
    }

    /// A store for another scope backed by the same map
    pub fn for_scope(&self, scope: ScopeId) -> Self {
        Self {
            scope,
            records: Arc::clone(&self.records),
        }
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    fn backend_name(&self) -> &'static str {
        "MemoryStateStore"
    }

    fn scope(&self) -> &ScopeId {
        &self.scope
    }

    async fn get(&self, path: &str) -> Result<Option<StateRecord>> {
        self.scope.split(path)?;
        Ok(self.records.read().await.get(path).cloned())
    }

    async fn set(&self, path: &str, record: &StateRecord) -> Result<()> {
        self.scope.split(path)?;
        self.records
            .write()
            .await
            .insert(path.to_string(), record.clone());
        Ok(())
    }

    async fn delete(&self, path: &str) -> Result<()> {
        self.scope.split(path)?;
        self.records.write().await.remove(path);
        Ok(())
    }

    async fn list(&self) -> Result<Vec<String>> {
        Ok(self
            .records
            .read()
            .await
            .keys()
            .filter(|path| self.scope.contains(path))
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::RecordStatus;

    fn scope(stage: &str) -> ScopeId {
        ScopeId::new("shop", stage).unwrap()
    }

    #[tokio::test]
    async fn test_set_get_delete() {
        let store = MemoryStateStore::new(scope("prod"));
        let path = "shop/prod/Queue/orders";

        assert!(store.get(path).await.unwrap().is_none());

        let record = StateRecord::new("Queue", "orders", "h").with_status(RecordStatus::Committed);
        store.set(path, &record).await.unwrap();
        assert_eq!(store.get(path).await.unwrap(), Some(record));
        assert_eq!(store.count().await.unwrap(), 1);

        store.delete(path).await.unwrap();
        assert!(store.get(path).await.unwrap().is_none());
        // 二重削除はエラーにならない
        store.delete(path).await.unwrap();
    }

    #[tokio::test]
    async fn test_scopes_are_isolated() {
        let prod = MemoryStateStore::new(scope("prod"));
        let dev = prod.for_scope(scope("dev"));

        prod.set("shop/prod/Queue/a", &StateRecord::new("Queue", "a", "h"))
            .await
            .unwrap();
        dev.set("shop/dev/Queue/b", &StateRecord::new("Queue", "b", "h"))
            .await
            .unwrap();

        assert_eq!(prod.list().await.unwrap(), vec!["shop/prod/Queue/a"]);
        assert_eq!(dev.list().await.unwrap(), vec!["shop/dev/Queue/b"]);
        assert!(prod.set("shop/dev/Queue/c", &StateRecord::new("Queue", "c", "h")).await.is_err());
    }

    #[tokio::test]
    async fn test_clones_share_records() {
        let store = MemoryStateStore::new(scope("prod"));
        let other = store.clone();
        store
            .set("shop/prod/Queue/a", &StateRecord::new("Queue", "a", "h"))
            .await
            .unwrap();

        let all = other.all().await.unwrap();
        assert_eq!(all.len(), 1);
        assert!(all.contains_key("shop/prod/Queue/a"));
    }
}
