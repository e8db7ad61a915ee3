//! Scope / run context
//!
//! A [`Scope`] is one run against one `app/stage`. It owns the
//! instrumented store handle, the secret codec and the set of paths touched
//! during the run. Resources are declared in program order with
//! [`Scope::declare`], or as an explicit batch with [`Scope::declare_group`].
//! [`Scope::finalize`] sweeps orphans and closes the store.
//!
//! Two runs against the same scope at the same time are not guarded against.

use crate::action::{Action, ActionType, Plan, SweepReport};
use crate::declaration::{Declaration, Output};
use crate::error::{EngineError, Result};
use crate::finalize;
use crate::provider::ProviderRegistry;
use crate::runtime::ResourceRuntime;
use futures_util::future::join_all;
use serde_json::Value;
use stackflow_config::{EngineConfig, StoreConfig};
use stackflow_state::{
    FileStateStore, InstrumentedStore, MemoryStateStore, ScopeId, SecretCodec, StateRecord,
    StateStore, TelemetrySink, TracingSink,
};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard};

/// What a run does with its declarations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Phase {
    /// Reconcile declarations and delete orphans
    #[default]
    Up,
    /// Return stored outputs only; nothing is created, updated or deleted
    Read,
    /// Declarations are ignored and every record in the scope is deleted
    Destroy,
}

/// Open a scope with a backend built from `store_config`
pub async fn open_scope(
    app: &str,
    stage: &str,
    store_config: &StoreConfig,
    key_material: Option<&str>,
    providers: ProviderRegistry,
) -> Result<Scope> {
    Scope::builder(app, stage)
        .store_config(store_config.clone())
        .key_material(key_material)
        .providers(providers)
        .open()
        .await
}

pub struct ScopeBuilder {
    app: String,
    stage: String,
    store: Option<Arc<dyn StateStore>>,
    store_config: StoreConfig,
    key_material: Option<String>,
    providers: ProviderRegistry,
    sink: Arc<dyn TelemetrySink>,
    phase: Phase,
}

impl ScopeBuilder {
    /// Use an already constructed store instead of `store_config`
    pub fn store(mut self, store: impl StateStore + 'static) -> Self {
        self.store = Some(Arc::new(store));
        self
    }

    pub fn store_config(mut self, store_config: StoreConfig) -> Self {
        self.store_config = store_config;
        self
    }

    pub fn key_material(mut self, key_material: Option<&str>) -> Self {
        self.key_material = key_material.map(str::to_string);
        self
    }

    pub fn providers(mut self, providers: ProviderRegistry) -> Self {
        self.providers = providers;
        self
    }

    pub fn telemetry(mut self, sink: Arc<dyn TelemetrySink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn phase(mut self, phase: Phase) -> Self {
        self.phase = phase;
        self
    }

    pub async fn open(self) -> Result<Scope> {
        let id = ScopeId::new(self.app, self.stage)?;
        let backend: Arc<dyn StateStore> = match (self.store, &self.store_config) {
            (Some(store), _) => store,
            (None, StoreConfig::File { root }) => Arc::new(FileStateStore::new(root, id.clone())),
            (None, StoreConfig::Memory) => Arc::new(MemoryStateStore::new(id.clone())),
        };
        if backend.scope() != &id {
            return Err(EngineError::InvalidDeclaration(format!(
                "store is bound to {} but the scope is {}",
                backend.scope(),
                id
            )));
        }

        let store: Arc<dyn StateStore> = Arc::new(InstrumentedStore::with_sink(backend, self.sink));
        store.init().await?;
        tracing::info!(
            "Opened scope {} ({:?}, backend {})",
            id,
            self.phase,
            store.backend_name()
        );

        Ok(Scope {
            id,
            store,
            codec: SecretCodec::from_password(self.key_material.as_deref()),
            providers: self.providers,
            phase: self.phase,
            touched: Mutex::new(BTreeSet::new()),
            failed: Mutex::new(Vec::new()),
        })
    }
}

pub struct Scope {
    id: ScopeId,
    store: Arc<dyn StateStore>,
    codec: SecretCodec,
    providers: ProviderRegistry,
    phase: Phase,
    touched: Mutex<BTreeSet<String>>,
    failed: Mutex<Vec<String>>,
}

impl Scope {
    pub fn builder(app: impl Into<String>, stage: impl Into<String>) -> ScopeBuilder {
        ScopeBuilder {
            app: app.into(),
            stage: stage.into(),
            store: None,
            store_config: StoreConfig::default(),
            key_material: None,
            providers: ProviderRegistry::new(),
            sink: Arc::new(TracingSink),
            phase: Phase::Up,
        }
    }

    /// Open a scope from a loaded [`EngineConfig`]
    pub async fn from_config(config: &EngineConfig, providers: ProviderRegistry) -> Result<Self> {
        let key_material = config.key_material();
        open_scope(
            &config.app_name()?,
            &config.stage_name(),
            &config.store,
            key_material.as_deref(),
            providers,
        )
        .await
    }

    pub fn id(&self) -> &ScopeId {
        &self.id
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn store(&self) -> &dyn StateStore {
        self.store.as_ref()
    }

    /// Paths successfully applied so far in this run
    pub fn touched(&self) -> Vec<String> {
        lock(&self.touched).iter().cloned().collect()
    }

    fn runtime(&self) -> ResourceRuntime<'_> {
        ResourceRuntime::new(&self.id, self.store.as_ref(), &self.codec, &self.providers)
    }

    /// Apply one declaration and return its committed output
    pub async fn declare(&self, declaration: Declaration) -> Result<Output> {
        let path = self
            .id
            .resource_path(declaration.resource_type(), declaration.id())?;
        match self.phase {
            Phase::Up => {}
            Phase::Read => {
                let record = self
                    .store
                    .get(&path)
                    .await?
                    .ok_or_else(|| EngineError::NotFound(path.clone()))?;
                return self.runtime().output_of(&path, &record);
            }
            Phase::Destroy => {
                return match self.store.get(&path).await? {
                    Some(record) => self.runtime().output_of(&path, &record),
                    None => Ok(Output {
                        path,
                        resource_type: declaration.resource_type().to_string(),
                        id: declaration.id().to_string(),
                        value: Value::Null,
                        seq: 0,
                    }),
                };
            }
        }

        // 不正な宣言も失敗として記録する (finalize で既存レコードを消さないため)
        let result = match self.check_declaration(&path, &declaration) {
            Ok(()) => self.runtime().apply(&declaration).await,
            Err(e) => Err(e),
        };
        match result {
            Ok(applied) => {
                lock(&self.touched).insert(path);
                Ok(applied.output)
            }
            Err(e) => {
                tracing::error!("Failed to apply {}: {}", path, e);
                lock(&self.failed).push(path);
                Err(e)
            }
        }
    }

    /// Apply independent declarations concurrently.
    ///
    /// All members settle before this returns. If any failed, the error lists
    /// every failure; the successful members stay committed and touched.
    pub async fn declare_group(&self, declarations: Vec<Declaration>) -> Result<Vec<Output>> {
        if let Err(e) = self.check_group(&declarations) {
            let mut failed = lock(&self.failed);
            for declaration in &declarations {
                if let Ok(path) = self
                    .id
                    .resource_path(declaration.resource_type(), declaration.id())
                {
                    failed.push(path);
                }
            }
            return Err(e);
        }

        let results = join_all(declarations.into_iter().map(|d| self.declare(d))).await;
        let mut outputs = Vec::with_capacity(results.len());
        let mut errors = Vec::new();
        for result in results {
            match result {
                Ok(output) => outputs.push(output),
                Err(e) => errors.push(e),
            }
        }
        if errors.is_empty() {
            Ok(outputs)
        } else {
            Err(EngineError::GroupFailed(errors))
        }
    }

    fn check_group(&self, declarations: &[Declaration]) -> Result<()> {
        let mut paths = BTreeSet::new();
        for declaration in declarations {
            let path = self
                .id
                .resource_path(declaration.resource_type(), declaration.id())?;
            if !paths.insert(path.clone()) {
                return Err(EngineError::InvalidDeclaration(format!(
                    "{} is declared twice in one parallel group",
                    path
                )));
            }
        }
        for declaration in declarations {
            if let Some(dep) = declaration.dependencies().iter().find(|d| paths.contains(*d)) {
                return Err(EngineError::InvalidDeclaration(format!(
                    "{}/{} depends on {} in the same parallel group",
                    declaration.resource_type(),
                    declaration.id(),
                    dep
                )));
            }
        }
        Ok(())
    }

    fn check_declaration(&self, path: &str, declaration: &Declaration) -> Result<()> {
        let touched = lock(&self.touched);
        if touched.contains(path) {
            return Err(EngineError::InvalidDeclaration(format!(
                "{} is declared more than once in this run",
                path
            )));
        }
        for dep in declaration.dependencies() {
            if dep == path {
                return Err(EngineError::InvalidDeclaration(format!(
                    "{} depends on itself",
                    path
                )));
            }
            if !touched.contains(dep) {
                return Err(EngineError::InvalidDeclaration(format!(
                    "{} depends on {}, which has not been applied in this run",
                    path, dep
                )));
            }
        }
        Ok(())
    }

    /// Compute the action for a declaration without applying it
    pub async fn plan(&self, declaration: &Declaration) -> Result<Action> {
        self.runtime().plan(declaration).await
    }

    /// Delete actions [`Scope::finalize`] would perform now, in order
    pub async fn plan_sweep(&self) -> Result<Plan> {
        let orphans = self.orphans().await?;
        let actions = finalize::deletion_order(&orphans)
            .into_iter()
            .filter_map(|path| {
                let record = orphans.get(&path)?;
                Some(Action::new(
                    path.clone(),
                    ActionType::Delete,
                    record.resource_type.clone(),
                    record.id.clone(),
                ))
            })
            .collect();
        Ok(Plan::new(actions))
    }

    async fn orphans(&self) -> Result<BTreeMap<String, StateRecord>> {
        let mut records = match self.phase {
            Phase::Read => return Ok(BTreeMap::new()),
            Phase::Up | Phase::Destroy => self.store.all().await?,
        };
        let touched = lock(&self.touched).clone();
        records.retain(|path, _| !touched.contains(path));
        Ok(records)
    }

    /// Sweep orphans and close the scope.
    ///
    /// If any declaration failed during this run nothing is swept.
    pub async fn finalize(self) -> Result<SweepReport> {
        let failed = lock(&self.failed).clone();
        if !failed.is_empty() {
            tracing::warn!(
                "Skipping finalize for {}: {} resource(s) failed",
                self.id,
                failed.len()
            );
            self.close().await?;
            return Err(EngineError::RunIncomplete(failed));
        }

        let swept = match self.orphans().await {
            Ok(orphans) => {
                finalize::sweep(
                    &self.id,
                    self.store.as_ref(),
                    &self.codec,
                    &self.providers,
                    orphans,
                )
                .await
            }
            Err(e) => Err(e),
        };
        self.close().await?;
        let report = swept?;
        tracing::info!(
            "Finalized {}: {} deleted, {} failed, {} blocked",
            self.id,
            report.deleted.len(),
            report.failed.len(),
            report.blocked.len()
        );
        Ok(report)
    }

    /// Release the store without sweeping
    pub async fn close(&self) -> Result<()> {
        self.store.deinit().await?;
        tracing::debug!("Closed scope {}", self.id);
        Ok(())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockCloud;
    use serde_json::json;

    async fn scope_with(store: MemoryStateStore, cloud: &MockCloud) -> Scope {
        Scope::builder("shop", "prod")
            .store(store)
            .providers(ProviderRegistry::new().with(cloud.clone()))
            .open()
            .await
            .unwrap()
    }

    fn memory() -> MemoryStateStore {
        MemoryStateStore::new(ScopeId::new("shop", "prod").unwrap())
    }

    #[tokio::test]
    async fn test_dependency_must_be_applied_first() {
        let cloud = MockCloud::new("Queue");
        let scope = scope_with(memory(), &cloud).await;

        let decl = Declaration::new("Queue", "consumer", json!({}))
            .depends_on_path("shop/prod/Queue/producer");
        let err = scope.declare(decl).await.unwrap_err();
        assert!(matches!(err, EngineError::InvalidDeclaration(_)));
        assert!(cloud.calls().is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_declaration_rejected() {
        let cloud = MockCloud::new("Queue");
        let scope = scope_with(memory(), &cloud).await;

        scope
            .declare(Declaration::new("Queue", "q", json!({})))
            .await
            .unwrap();
        let err = scope
            .declare(Declaration::new("Queue", "q", json!({"changed": true})))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidDeclaration(_)));
    }

    #[tokio::test]
    async fn test_group_rejects_internal_references() {
        let cloud = MockCloud::new("Queue");
        let scope = scope_with(memory(), &cloud).await;

        let group = vec![
            Declaration::new("Queue", "a", json!({})),
            Declaration::new("Queue", "b", json!({})).depends_on_path("shop/prod/Queue/a"),
        ];
        let err = scope.declare_group(group).await.unwrap_err();
        assert!(matches!(err, EngineError::InvalidDeclaration(_)));
        assert!(cloud.calls().is_empty());
    }

    #[tokio::test]
    async fn test_store_for_other_scope_rejected() {
        let store = MemoryStateStore::new(ScopeId::new("shop", "dev").unwrap());
        let result = Scope::builder("shop", "prod").store(store).open().await;
        assert!(matches!(result, Err(EngineError::InvalidDeclaration(_))));
    }

    #[tokio::test]
    async fn test_unknown_type_fails_without_store_write() {
        let cloud = MockCloud::new("Queue");
        let store = memory();
        let scope = scope_with(store.clone(), &cloud).await;

        let err = scope
            .declare(Declaration::new("Tunnel", "t", json!({})))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::ProviderNotFound(_)));
        assert_eq!(store.count().await.unwrap(), 0);
    }
}
