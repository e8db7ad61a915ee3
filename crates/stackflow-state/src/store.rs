//! State store contract
//!
//! A store is bound to one scope and maps resource paths to records.
//! Operations are atomic per record; there are no cross-record transactions.
//! Implementations must allow concurrent writes to different paths.

use crate::error::Result;
use crate::path::ScopeId;
use crate::record::StateRecord;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;

#[async_trait]
pub trait StateStore: Send + Sync {
    /// Short type name of the concrete backend (e.g. "FileStateStore")
    fn backend_name(&self) -> &'static str;

    /// Scope the store is bound to
    fn scope(&self) -> &ScopeId;

    /// Acquire underlying connections. Must be idempotent.
    async fn init(&self) -> Result<()> {
        Ok(())
    }

    /// Release underlying connections. Safe without a prior `init`.
    async fn deinit(&self) -> Result<()> {
        Ok(())
    }

    async fn get(&self, path: &str) -> Result<Option<StateRecord>>;

    async fn get_batch(&self, paths: &[String]) -> Result<BTreeMap<String, Option<StateRecord>>> {
        let mut records = BTreeMap::new();
        for path in paths {
            records.insert(path.clone(), self.get(path).await?);
        }
        Ok(records)
    }

    async fn set(&self, path: &str, record: &StateRecord) -> Result<()>;

    /// Remove a record. Deleting an absent path is not an error.
    async fn delete(&self, path: &str) -> Result<()>;

    /// Paths of all records in this scope, sorted
    async fn list(&self) -> Result<Vec<String>>;

    async fn count(&self) -> Result<usize> {
        Ok(self.list().await?.len())
    }

    async fn all(&self) -> Result<BTreeMap<String, StateRecord>> {
        let paths = self.list().await?;
        Ok(self
            .get_batch(&paths)
            .await?
            .into_iter()
            .filter_map(|(path, record)| record.map(|r| (path, r)))
            .collect())
    }
}

macro_rules! forward_state_store {
    ($ptr:ty) => {
        #[async_trait]
        impl<S: StateStore + ?Sized> StateStore for $ptr {
            fn backend_name(&self) -> &'static str {
                (**self).backend_name()
            }

            fn scope(&self) -> &ScopeId {
                (**self).scope()
            }

            async fn init(&self) -> Result<()> {
                (**self).init().await
            }

            async fn deinit(&self) -> Result<()> {
                (**self).deinit().await
            }

            async fn get(&self, path: &str) -> Result<Option<StateRecord>> {
                (**self).get(path).await
            }

            async fn get_batch(
                &self,
                paths: &[String],
            ) -> Result<BTreeMap<String, Option<StateRecord>>> {
                (**self).get_batch(paths).await
            }

            async fn set(&self, path: &str, record: &StateRecord) -> Result<()> {
                (**self).set(path, record).await
            }

            async fn delete(&self, path: &str) -> Result<()> {
                (**self).delete(path).await
            }

            async fn list(&self) -> Result<Vec<String>> {
                (**self).list().await
            }

            async fn count(&self) -> Result<usize> {
                (**self).count().await
            }

            async fn all(&self) -> Result<BTreeMap<String, StateRecord>> {
                (**self).all().await
            }
        }
    };
}

forward_state_store!(Arc<S>);
forward_state_store!(Box<S>);
