//! In-memory provider for tests
//!
//! [`MockCloud`] keeps a fake "physical" resource table and a call log.
//! Clones and [`MockCloud::sibling`]s share both, so one handle can be
//! registered with the engine while the test keeps another for inspection.

use crate::provider::{ProviderContext, ProviderError, ProviderResult, ResourceProvider};
use async_trait::async_trait;
use serde_json::{Value, json};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum MockOp {
    Create,
    Update,
    Delete,
    Adopt,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockCall {
    pub op: MockOp,
    pub resource_type: String,
    pub id: String,
}

#[derive(Debug, Default)]
struct MockState {
    /// `type/id` -> (props, generation)
    resources: BTreeMap<String, (Value, u64)>,
    calls: Vec<MockCall>,
    failures: BTreeSet<(MockOp, String)>,
}

#[derive(Debug, Clone)]
pub struct MockCloud {
    resource_type: String,
    state: Arc<Mutex<MockState>>,
}

impl MockCloud {
    pub fn new(resource_type: impl Into<String>) -> Self {
        Self {
            resource_type: resource_type.into(),
            state: Arc::default(),
        }
    }

    /// Provider for another type sharing this cloud's resources and call log
    pub fn sibling(&self, resource_type: impl Into<String>) -> Self {
        Self {
            resource_type: resource_type.into(),
            state: Arc::clone(&self.state),
        }
    }

    pub fn calls(&self) -> Vec<MockCall> {
        self.lock().calls.clone()
    }

    pub fn count(&self, op: MockOp) -> usize {
        self.lock().calls.iter().filter(|c| c.op == op).count()
    }

    /// Make `op` on resource `id` fail until [`MockCloud::heal`]
    pub fn fail_on(&self, op: MockOp, id: &str) {
        self.lock().failures.insert((op, id.to_string()));
    }

    pub fn heal(&self, op: MockOp, id: &str) {
        self.lock().failures.remove(&(op, id.to_string()));
    }

    /// Put a physical resource in place without going through the engine
    pub fn seed(&self, id: &str, props: Value) {
        self.lock().resources.insert(self.key(id), (props, 1));
    }

    pub fn exists(&self, id: &str) -> bool {
        self.lock().resources.contains_key(&self.key(id))
    }

    fn key(&self, id: &str) -> String {
        format!("{}/{}", self.resource_type, id)
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Log the call and return the injected failure, if any
    fn begin(
        &self,
        op: MockOp,
        ctx: &ProviderContext,
    ) -> ProviderResult<MutexGuard<'_, MockState>> {
        let mut state = self.lock();
        state.calls.push(MockCall {
            op,
            resource_type: ctx.resource_type.clone(),
            id: ctx.id.clone(),
        });
        if state.failures.contains(&(op, ctx.id.clone())) {
            return Err(ProviderError::Failed(anyhow::anyhow!(
                "injected {:?} failure for {}",
                op,
                ctx.path
            )));
        }
        Ok(state)
    }

    fn output(ctx: &ProviderContext, props: &Value, generation: u64) -> Value {
        json!({
            "arn": format!("arn:mock:{}:{}", ctx.resource_type, ctx.physical_name()),
            "generation": generation,
            "props": props,
        })
    }
}

#[async_trait]
impl ResourceProvider for MockCloud {
    fn resource_type(&self) -> &str {
        &self.resource_type
    }

    async fn create(&self, ctx: &ProviderContext, props: &Value) -> ProviderResult<Value> {
        let mut state = self.begin(MockOp::Create, ctx)?;
        let key = self.key(&ctx.id);
        if state.resources.contains_key(&key) {
            return Err(ProviderError::AlreadyExists(ctx.physical_name()));
        }
        state.resources.insert(key, (props.clone(), 1));
        Ok(Self::output(ctx, props, 1))
    }

    async fn update(
        &self,
        ctx: &ProviderContext,
        props: &Value,
        _prior_output: &Value,
    ) -> ProviderResult<Value> {
        let mut state = self.begin(MockOp::Update, ctx)?;
        let entry = state
            .resources
            .entry(self.key(&ctx.id))
            .or_insert_with(|| (Value::Null, 0));
        entry.0 = props.clone();
        entry.1 += 1;
        let generation = entry.1;
        Ok(Self::output(ctx, props, generation))
    }

    async fn delete(&self, ctx: &ProviderContext, _prior_output: &Value) -> ProviderResult<()> {
        let mut state = self.begin(MockOp::Delete, ctx)?;
        match state.resources.remove(&self.key(&ctx.id)) {
            Some(_) => Ok(()),
            None => Err(ProviderError::NotFound(ctx.physical_name())),
        }
    }

    async fn adopt(&self, ctx: &ProviderContext, _props: &Value) -> ProviderResult<Value> {
        let state = self.begin(MockOp::Adopt, ctx)?;
        match state.resources.get(&self.key(&ctx.id)) {
            Some((props, generation)) => Ok(Self::output(ctx, props, *generation)),
            None => Err(ProviderError::NotFound(ctx.physical_name())),
        }
    }
}
