//! Store instrumentation
//!
//! [`InstrumentedStore`] wraps any [`StateStore`] and reports one
//! [`StoreEvent`] per operation to a [`TelemetrySink`]. Return values and
//! errors pass through untouched.

use crate::error::Result;
use crate::path::ScopeId;
use crate::record::StateRecord;
use crate::store::StateStore;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Store operation names as reported
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreOperation {
    Init,
    Deinit,
    Get,
    GetBatch,
    Set,
    Delete,
    List,
    Count,
    All,
}

impl StoreOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            StoreOperation::Init => "init",
            StoreOperation::Deinit => "deinit",
            StoreOperation::Get => "get",
            StoreOperation::GetBatch => "get_batch",
            StoreOperation::Set => "set",
            StoreOperation::Delete => "delete",
            StoreOperation::List => "list",
            StoreOperation::Count => "count",
            StoreOperation::All => "all",
        }
    }
}

impl std::fmt::Display for StoreOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One timed store operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreEvent {
    pub operation: StoreOperation,
    pub backend: &'static str,
    pub elapsed: Duration,
    pub error: Option<String>,
}

impl StoreEvent {
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

pub trait TelemetrySink: Send + Sync {
    fn record(&self, event: StoreEvent);
}

/// Emits store events as `tracing` events
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl TelemetrySink for TracingSink {
    fn record(&self, event: StoreEvent) {
        let elapsed_ms = event.elapsed.as_secs_f64() * 1000.0;
        match &event.error {
            None => tracing::debug!(
                target: "stackflow::telemetry",
                operation = event.operation.as_str(),
                backend = event.backend,
                elapsed_ms,
                "store operation"
            ),
            Some(error) => tracing::warn!(
                target: "stackflow::telemetry",
                operation = event.operation.as_str(),
                backend = event.backend,
                elapsed_ms,
                error = %error,
                "store operation failed"
            ),
        }
    }
}

/// Keeps events in memory, for inspection
#[derive(Debug, Clone, Default)]
pub struct RecordingSink {
    events: Arc<Mutex<Vec<StoreEvent>>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<StoreEvent> {
        self.events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn operations(&self) -> Vec<StoreOperation> {
        self.events().iter().map(|e| e.operation).collect()
    }
}

impl TelemetrySink for RecordingSink {
    fn record(&self, event: StoreEvent) {
        self.events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(event);
    }
}

/// A store that times and reports every call to the store it wraps
pub struct InstrumentedStore<S> {
    inner: S,
    sink: Arc<dyn TelemetrySink>,
}

impl<S: StateStore> InstrumentedStore<S> {
    pub fn with_sink(inner: S, sink: Arc<dyn TelemetrySink>) -> Self {
        Self { inner, sink }
    }

    async fn instrument<T, F>(&self, operation: StoreOperation, call: F) -> Result<T>
    where
        F: Future<Output = Result<T>> + Send,
    {
        let start = Instant::now();
        let result = call.await;
        self.sink.record(StoreEvent {
            operation,
            backend: self.inner.backend_name(),
            elapsed: start.elapsed(),
            error: result.as_ref().err().map(|e| e.to_string()),
        });
        result
    }
}

#[async_trait]
impl<S: StateStore> StateStore for InstrumentedStore<S> {
    fn backend_name(&self) -> &'static str {
        self.inner.backend_name()
    }

    fn scope(&self) -> &ScopeId {
        self.inner.scope()
    }

    async fn init(&self) -> Result<()> {
        self.instrument(StoreOperation::Init, self.inner.init()).await
    }

    async fn deinit(&self) -> Result<()> {
        self.instrument(StoreOperation::Deinit, self.inner.deinit())
            .await
    }

    async fn get(&self, path: &str) -> Result<Option<StateRecord>> {
        self.instrument(StoreOperation::Get, self.inner.get(path)).await
    }

    async fn get_batch(&self, paths: &[String]) -> Result<BTreeMap<String, Option<StateRecord>>> {
        self.instrument(StoreOperation::GetBatch, self.inner.get_batch(paths))
            .await
    }

    async fn set(&self, path: &str, record: &StateRecord) -> Result<()> {
        self.instrument(StoreOperation::Set, self.inner.set(path, record))
            .await
    }

    async fn delete(&self, path: &str) -> Result<()> {
        self.instrument(StoreOperation::Delete, self.inner.delete(path))
            .await
    }

    async fn list(&self) -> Result<Vec<String>> {
        self.instrument(StoreOperation::List, self.inner.list()).await
    }

    async fn count(&self) -> Result<usize> {
        self.instrument(StoreOperation::Count, self.inner.count()).await
    }

    async fn all(&self) -> Result<BTreeMap<String, StateRecord>> {
        self.instrument(StoreOperation::All, self.inner.all()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StateError;
    use crate::memory::MemoryStateStore;
    use crate::record::RecordStatus;

    /// Store without init/deinit that fails every write
    struct ReadOnlyStore {
        scope: ScopeId,
    }

    #[async_trait]
    impl StateStore for ReadOnlyStore {
        fn backend_name(&self) -> &'static str {
            "ReadOnlyStore"
        }

        fn scope(&self) -> &ScopeId {
            &self.scope
        }

        async fn get(&self, _path: &str) -> Result<Option<StateRecord>> {
            Ok(None)
        }

        async fn set(&self, path: &str, _record: &StateRecord) -> Result<()> {
            Err(StateError::StoreIo {
                backend: "ReadOnlyStore",
                message: format!("read-only: {}", path),
            })
        }

        async fn delete(&self, _path: &str) -> Result<()> {
            Ok(())
        }

        async fn list(&self) -> Result<Vec<String>> {
            Ok(Vec::new())
        }
    }

    fn scope() -> ScopeId {
        ScopeId::new("shop", "prod").unwrap()
    }

    #[tokio::test]
    async fn test_results_match_unwrapped_store() {
        let plain = MemoryStateStore::new(scope());
        let sink = RecordingSink::new();
        let wrapped = InstrumentedStore::with_sink(
            MemoryStateStore::new(scope()),
            Arc::new(sink.clone()),
        );

        let record = StateRecord::new("Queue", "a", "h").with_status(RecordStatus::Committed);
        for store in [&plain as &dyn StateStore, &wrapped as &dyn StateStore] {
            store.set("shop/prod/Queue/a", &record).await.unwrap();
            store.set("shop/prod/Queue/b", &record).await.unwrap();
            store.delete("shop/prod/Queue/b").await.unwrap();
        }

        assert_eq!(
            plain.get("shop/prod/Queue/a").await.unwrap(),
            wrapped.get("shop/prod/Queue/a").await.unwrap()
        );
        assert_eq!(plain.list().await.unwrap(), wrapped.list().await.unwrap());
        assert_eq!(
            sink.operations(),
            vec![
                StoreOperation::Set,
                StoreOperation::Set,
                StoreOperation::Delete,
                StoreOperation::Get,
                StoreOperation::List,
            ]
        );
        assert!(sink.events().iter().all(|e| e.backend == "MemoryStateStore"));
        assert!(sink.events().iter().all(StoreEvent::is_success));
    }

    #[tokio::test]
    async fn test_failure_reported_and_propagated() {
        let sink = RecordingSink::new();
        let store =
            InstrumentedStore::with_sink(ReadOnlyStore { scope: scope() }, Arc::new(sink.clone()));

        let err = store
            .set("shop/prod/Queue/a", &StateRecord::new("Queue", "a", "h"))
            .await
            .unwrap_err();
        assert!(matches!(err, StateError::StoreIo { backend: "ReadOnlyStore", .. }));

        let events = sink.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].operation, StoreOperation::Set);
        assert!(events[0].error.as_deref().unwrap().contains("read-only"));
    }

    #[tokio::test]
    async fn test_missing_init_deinit_are_noops() {
        let sink = RecordingSink::new();
        let store =
            InstrumentedStore::with_sink(ReadOnlyStore { scope: scope() }, Arc::new(sink.clone()));

        store.init().await.unwrap();
        store.deinit().await.unwrap();
        assert_eq!(
            sink.operations(),
            vec![StoreOperation::Init, StoreOperation::Deinit]
        );
    }
}
