//! Resource provider contract
//!
//! Each resource type (queue, bucket, worker, ...) is implemented outside
//! the engine as a [`ResourceProvider`]. The engine decides *which*
//! operation to run; the provider only performs it.

use crate::error::{EngineError, Result};
use async_trait::async_trait;
use serde_json::Value;
use stackflow_state::ScopeId;
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;

/// Errors a provider reports back to the engine
#[derive(Error, Debug)]
pub enum ProviderError {
    /// No physical resource matches (adopt lookup, delete of a vanished resource)
    #[error("physical resource not found: {0}")]
    NotFound(String),

    /// Create collided with a physical resource the engine does not manage
    #[error("physical resource already exists: {0}")]
    AlreadyExists(String),

    #[error(transparent)]
    Failed(#[from] anyhow::Error),
}

pub type ProviderResult<T> = std::result::Result<T, ProviderError>;

/// Identity of the resource a provider call is about
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderContext {
    pub scope: ScopeId,
    pub resource_type: String,
    pub id: String,
    pub path: String,
}

impl ProviderContext {
    /// Default physical name: `{app}-{stage}-{id}`
    pub fn physical_name(&self) -> String {
        format!("{}-{}-{}", self.scope.app(), self.scope.stage(), self.id)
    }
}

/// Provider abstraction trait
///
/// `props` and outputs are plaintext: secrets arrive and may be returned as
/// `{"@secret": ...}` markers. The engine seals them before storage.
#[async_trait]
pub trait ResourceProvider: Send + Sync {
    /// Type tag this provider handles (e.g. "cloudflare::Worker")
    fn resource_type(&self) -> &str;

    /// Create a new physical resource
    async fn create(&self, ctx: &ProviderContext, props: &Value) -> ProviderResult<Value>;

    /// Bring an existing physical resource in line with `props`
    async fn update(
        &self,
        ctx: &ProviderContext,
        props: &Value,
        prior_output: &Value,
    ) -> ProviderResult<Value>;

    /// Delete the physical resource described by `prior_output`
    async fn delete(&self, ctx: &ProviderContext, prior_output: &Value) -> ProviderResult<()>;

    /// Look up a pre-existing physical resource and return its output.
    ///
    /// Providers without lookup support report every resource as not found.
    async fn adopt(&self, ctx: &ProviderContext, _props: &Value) -> ProviderResult<Value> {
        Err(ProviderError::NotFound(ctx.physical_name()))
    }
}

/// Handler table keyed by resource type tag
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    providers: BTreeMap<String, Arc<dyn ResourceProvider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a provider, replacing any previous one for the same type
    pub fn register(&mut self, provider: Arc<dyn ResourceProvider>) {
        let resource_type = provider.resource_type().to_string();
        if self
            .providers
            .insert(resource_type.clone(), provider)
            .is_some()
        {
            tracing::warn!("Replaced provider for resource type {}", resource_type);
        }
    }

    pub fn with(mut self, provider: impl ResourceProvider + 'static) -> Self {
        self.register(Arc::new(provider));
        self
    }

    pub fn get(&self, resource_type: &str) -> Result<Arc<dyn ResourceProvider>> {
        self.providers
            .get(resource_type)
            .cloned()
            .ok_or_else(|| EngineError::ProviderNotFound(resource_type.to_string()))
    }

    pub fn resource_types(&self) -> impl Iterator<Item = &str> {
        self.providers.keys().map(String::as_str)
    }
}

impl std::fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderRegistry")
            .field("resource_types", &self.providers.keys().collect::<Vec<_>>())
            .finish()
    }
}
