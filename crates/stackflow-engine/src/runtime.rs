//! Resource runtime: decide, dispatch, commit
//!
//! For one declaration the runtime reads the prior record, hashes the new
//! props, picks create/adopt/update/no-op, calls the provider and commits a
//! new record on success. On failure the committed fields of the prior record
//! stay as they were, so the next run retries from the same starting point.

use crate::action::{Action, ActionType};
use crate::declaration::{Declaration, Output};
use crate::error::{EngineError, Result};
use crate::hash::input_hash;
use crate::provider::{ProviderContext, ProviderError, ProviderRegistry, ResourceProvider};
use serde_json::Value;
use stackflow_state::{RecordStatus, ScopeId, SecretCodec, StateRecord, StateStore};

/// What the runtime will do for a declaration
#[derive(Debug, Clone)]
pub(crate) struct Decision {
    pub path: String,
    pub action: ActionType,
    pub input_hash: String,
    pub prior: Option<StateRecord>,
}

/// Result of applying one declaration
#[derive(Debug, Clone)]
pub struct Applied {
    pub action: ActionType,
    pub output: Output,
}

pub struct ResourceRuntime<'a> {
    scope: &'a ScopeId,
    store: &'a dyn StateStore,
    codec: &'a SecretCodec,
    providers: &'a ProviderRegistry,
}

impl<'a> ResourceRuntime<'a> {
    pub fn new(
        scope: &'a ScopeId,
        store: &'a dyn StateStore,
        codec: &'a SecretCodec,
        providers: &'a ProviderRegistry,
    ) -> Self {
        Self {
            scope,
            store,
            codec,
            providers,
        }
    }

    pub(crate) async fn decide(&self, declaration: &Declaration) -> Result<Decision> {
        let path = self
            .scope
            .resource_path(declaration.resource_type(), declaration.id())?;
        let prior = self.store.get(&path).await?;
        let input_hash = input_hash(declaration.props(), self.codec)?;

        let action = match &prior {
            None if declaration.is_adopt() => ActionType::Adopt,
            None => ActionType::Create,
            // 前回の操作が完了していない記録は no-op にしない
            Some(record)
                if record.is_committed()
                    && record.input_hash == input_hash
                    && !declaration.is_force() =>
            {
                ActionType::NoOp
            }
            Some(_) => ActionType::Update,
        };

        Ok(Decision {
            path,
            action,
            input_hash,
            prior,
        })
    }

    /// Compute the action without dispatching anything
    pub async fn plan(&self, declaration: &Declaration) -> Result<Action> {
        self.providers.get(declaration.resource_type())?;
        let decision = self.decide(declaration).await?;
        Ok(Action::new(
            decision.path,
            decision.action,
            declaration.resource_type(),
            declaration.id(),
        ))
    }

    pub async fn apply(&self, declaration: &Declaration) -> Result<Applied> {
        let provider = self.providers.get(declaration.resource_type())?;
        let decision = self.decide(declaration).await?;
        let ctx = ProviderContext {
            scope: self.scope.clone(),
            resource_type: declaration.resource_type().to_string(),
            id: declaration.id().to_string(),
            path: decision.path.clone(),
        };

        if decision.action == ActionType::NoOp {
            let record = decision
                .prior
                .ok_or_else(|| EngineError::NotFound(decision.path.clone()))?;
            tracing::debug!("No changes for {}", decision.path);
            return Ok(Applied {
                action: ActionType::NoOp,
                output: self.output_of(&decision.path, &record)?,
            });
        }

        // 鍵が無ければプロバイダを呼ぶ前に失敗させる
        let sealed_props = self.codec.seal(declaration.props())?;

        tracing::info!("{} {}", decision.action, decision.path);
        let output = match decision.action {
            ActionType::Create => self.dispatch_create(provider.as_ref(), &ctx, declaration).await?,
            ActionType::Adopt => self.dispatch_adopt(provider.as_ref(), &ctx, declaration).await?,
            _ => {
                let prior = decision
                    .prior
                    .as_ref()
                    .ok_or_else(|| EngineError::NotFound(decision.path.clone()))?;
                self.dispatch_update(provider.as_ref(), &ctx, declaration, prior)
                    .await?
            }
        };

        let sealed_output = self.codec.seal(&output)?;
        let secret_fields = sealed_props
            .secret_fields
            .iter()
            .map(|f| format!("/props{}", f))
            .chain(
                sealed_output
                    .secret_fields
                    .iter()
                    .map(|f| format!("/output{}", f)),
            )
            .collect();
        let seq = decision.prior.as_ref().map_or(0, |r| r.seq) + 1;
        let record = StateRecord::new(
            declaration.resource_type(),
            declaration.id(),
            decision.input_hash,
        )
        .with_status(RecordStatus::Committed)
        .with_props(sealed_props.value)
        .with_output(sealed_output.value)
        .with_secret_fields(secret_fields)
        .with_depends_on(declaration.dependencies().to_vec())
        .with_seq(seq);

        self.store.set(&decision.path, &record).await?;
        tracing::debug!("Committed {} (seq {})", decision.path, seq);

        Ok(Applied {
            action: decision.action,
            output: Output {
                path: decision.path,
                resource_type: declaration.resource_type().to_string(),
                id: declaration.id().to_string(),
                value: output,
                seq,
            },
        })
    }

    async fn dispatch_create(
        &self,
        provider: &dyn ResourceProvider,
        ctx: &ProviderContext,
        declaration: &Declaration,
    ) -> Result<Value> {
        provider
            .create(ctx, declaration.props())
            .await
            .map_err(|e| match e {
                ProviderError::AlreadyExists(what) => EngineError::Conflict {
                    path: ctx.path.clone(),
                    reason: format!(
                        "{} already exists and is not managed by this scope; declare it with adopt to take it over",
                        what
                    ),
                },
                source => EngineError::Provider {
                    path: ctx.path.clone(),
                    source,
                },
            })
    }

    async fn dispatch_adopt(
        &self,
        provider: &dyn ResourceProvider,
        ctx: &ProviderContext,
        declaration: &Declaration,
    ) -> Result<Value> {
        provider
            .adopt(ctx, declaration.props())
            .await
            .map_err(|e| match e {
                ProviderError::NotFound(what) => EngineError::Conflict {
                    path: ctx.path.clone(),
                    reason: format!("adopt requested but no physical resource found: {}", what),
                },
                source => EngineError::Provider {
                    path: ctx.path.clone(),
                    source,
                },
            })
    }

    async fn dispatch_update(
        &self,
        provider: &dyn ResourceProvider,
        ctx: &ProviderContext,
        declaration: &Declaration,
        prior: &StateRecord,
    ) -> Result<Value> {
        let prior_output = self.codec.unseal(&prior.output)?;

        let mut pending = prior.clone().with_status(RecordStatus::Pending);
        pending.last_error = None;
        self.store.set(&ctx.path, &pending).await?;

        match provider
            .update(ctx, declaration.props(), &prior_output)
            .await
        {
            Ok(output) => Ok(output),
            Err(source) => {
                let mut failed = prior.clone();
                failed.mark_failed(source.to_string());
                if let Err(e) = self.store.set(&ctx.path, &failed).await {
                    tracing::warn!("Could not record failed update of {}: {}", ctx.path, e);
                }
                Err(EngineError::Provider {
                    path: ctx.path.clone(),
                    source,
                })
            }
        }
    }

    /// Unsealed output of a stored record
    pub fn output_of(&self, path: &str, record: &StateRecord) -> Result<Output> {
        Ok(Output {
            path: path.to_string(),
            resource_type: record.resource_type.clone(),
            id: record.id.clone(),
            value: self.codec.unseal(&record.output)?,
            seq: record.seq,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MockCloud, MockOp};
    use serde_json::json;
    use stackflow_state::{MemoryStateStore, SEALED_TAG, Secret};

    struct Fixture {
        scope: ScopeId,
        store: MemoryStateStore,
        codec: SecretCodec,
        providers: ProviderRegistry,
        cloud: MockCloud,
    }

    impl Fixture {
        fn new() -> Self {
            let scope = ScopeId::new("shop", "prod").unwrap();
            let cloud = MockCloud::new("Queue");
            Self {
                store: MemoryStateStore::new(scope.clone()),
                scope,
                codec: SecretCodec::from_password(Some("pw")),
                providers: ProviderRegistry::new().with(cloud.clone()),
                cloud,
            }
        }

        fn runtime(&self) -> ResourceRuntime<'_> {
            ResourceRuntime::new(&self.scope, &self.store, &self.codec, &self.providers)
        }
    }

    #[tokio::test]
    async fn test_create_then_noop() {
        let fx = Fixture::new();
        let decl = Declaration::new("Queue", "orders", json!({"fifo": true}));

        let first = fx.runtime().apply(&decl).await.unwrap();
        assert_eq!(first.action, ActionType::Create);
        assert_eq!(first.output.seq, 1);

        let second = fx.runtime().apply(&decl).await.unwrap();
        assert_eq!(second.action, ActionType::NoOp);
        assert_eq!(second.output, first.output);
        assert_eq!(fx.cloud.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_force_updates_unchanged_props() {
        let fx = Fixture::new();
        let decl = Declaration::new("Queue", "orders", json!({"fifo": true}));
        fx.runtime().apply(&decl).await.unwrap();

        let forced = fx.runtime().apply(&decl.clone().force()).await.unwrap();
        assert_eq!(forced.action, ActionType::Update);
        assert_eq!(forced.output.seq, 2);
        assert_eq!(fx.cloud.count(MockOp::Update), 1);
    }

    #[tokio::test]
    async fn test_failed_update_keeps_committed_fields() {
        let fx = Fixture::new();
        let v1 = Declaration::new("Queue", "orders", json!({"fifo": true}));
        fx.runtime().apply(&v1).await.unwrap();
        let before = fx.store.get("shop/prod/Queue/orders").await.unwrap().unwrap();

        fx.cloud.fail_on(MockOp::Update, "orders");
        let v2 = Declaration::new("Queue", "orders", json!({"fifo": false}));
        let err = fx.runtime().apply(&v2).await.unwrap_err();
        assert_eq!(err.path(), Some("shop/prod/Queue/orders"));

        let after = fx.store.get("shop/prod/Queue/orders").await.unwrap().unwrap();
        assert_eq!(after.status, RecordStatus::Error);
        assert_eq!(after.input_hash, before.input_hash);
        assert_eq!(after.output, before.output);
        assert_eq!(after.seq, before.seq);

        // 元の props に戻しても更新が再実行される
        fx.cloud.heal(MockOp::Update, "orders");
        let retried = fx.runtime().apply(&v1).await.unwrap();
        assert_eq!(retried.action, ActionType::Update);
        let healed = fx.store.get("shop/prod/Queue/orders").await.unwrap().unwrap();
        assert!(healed.is_committed());
        assert!(healed.last_error.is_none());
    }

    #[tokio::test]
    async fn test_secrets_sealed_in_record() {
        let fx = Fixture::new();
        let decl = Declaration::new(
            "Queue",
            "orders",
            json!({"fifo": true, "token": Secret::new("tok-123")}),
        );
        let applied = fx.runtime().apply(&decl).await.unwrap();
        assert_eq!(applied.output.value["props"]["token"], json!(Secret::new("tok-123")));

        let record = fx.store.get("shop/prod/Queue/orders").await.unwrap().unwrap();
        let stored = serde_json::to_string(&record).unwrap();
        assert!(!stored.contains("tok-123"));
        assert_eq!(record.secret_fields, vec!["/props/token", "/output/props/token"]);
    }

    #[tokio::test]
    async fn test_structured_secret_sealed_in_record() {
        let fx = Fixture::new();
        let creds = json!({"user": "admin", "port": 5432});
        let decl = Declaration::new(
            "Queue",
            "orders",
            json!({"creds": Secret::new(creds.clone()), "retries": Secret::new(3)}),
        );
        let applied = fx.runtime().apply(&decl).await.unwrap();
        assert_eq!(applied.output.value["props"]["creds"], json!(Secret::new(creds)));

        let record = fx.store.get("shop/prod/Queue/orders").await.unwrap().unwrap();
        assert!(!serde_json::to_string(&record).unwrap().contains("admin"));
        assert_eq!(record.props["retries"][SEALED_TAG]["scheme"], "aes-256-gcm");
        assert_eq!(
            record.secret_fields,
            vec![
                "/props/creds",
                "/props/retries",
                "/output/props/creds",
                "/output/props/retries",
            ]
        );

        let again = fx.runtime().apply(&decl).await.unwrap();
        assert_eq!(again.action, ActionType::NoOp);
        assert_eq!(again.output.value, applied.output.value);
    }

    #[tokio::test]
    async fn test_malformed_sealed_marker_is_invalid_declaration() {
        let fx = Fixture::new();
        let decl = Declaration::new("Queue", "orders", json!({"token": {"@sealed": 42}}));

        let err = fx.runtime().apply(&decl).await.unwrap_err();
        assert!(matches!(err, EngineError::InvalidDeclaration(_)));
        assert!(!err.is_fatal());
        assert!(fx.cloud.calls().is_empty());
        assert_eq!(fx.store.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_plan_does_not_dispatch() {
        let fx = Fixture::new();
        let decl = Declaration::new("Queue", "orders", json!({"fifo": true}));

        let action = fx.runtime().plan(&decl).await.unwrap();
        assert_eq!(action.action_type, ActionType::Create);
        assert_eq!(action.path, "shop/prod/Queue/orders");

        let adopt = fx.runtime().plan(&decl.clone().adopt()).await.unwrap();
        assert_eq!(adopt.action_type, ActionType::Adopt);
        assert!(fx.cloud.calls().is_empty());
        assert_eq!(fx.store.count().await.unwrap(), 0);
    }
}
