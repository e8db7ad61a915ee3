//! stackflow reconciliation engine
//!
//! Declarations are applied in program order inside a [`Scope`]. Each one
//! is diffed against its stored record and turned into a create, adopt,
//! update or no-op on a [`ResourceProvider`]. When the run ends,
//! [`Scope::finalize`] deletes every resource the run no longer declares.
//!
//! ```text
//! Declaration ──► ResourceRuntime ──► ResourceProvider
//!                     │    ▲
//!                     ▼    │
//!                  StateStore (sealed records)
//! ```
//!
//! ```no_run
//! use serde_json::json;
//! use stackflow_engine::{Declaration, ProviderRegistry, Scope};
//!
//! # async fn run(providers: ProviderRegistry) -> stackflow_engine::Result<()> {
//! let scope = Scope::builder("shop", "prod").providers(providers).open().await?;
//! let queue = scope
//!     .declare(Declaration::new("Queue", "orders", json!({"fifo": true})))
//!     .await?;
//! scope
//!     .declare(
//!         Declaration::new("Worker", "api", json!({"queue": queue.get("arn")}))
//!             .depends_on(&queue),
//!     )
//!     .await?;
//! let report = scope.finalize().await?;
//! println!("{} orphan(s) deleted", report.deleted.len());
//! # Ok(())
//! # }
//! ```

pub mod action;
pub mod declaration;
pub mod error;
mod finalize;
pub mod hash;
pub mod provider;
pub mod runtime;
pub mod scope;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

// Re-exports
pub use action::{Action, ActionType, Plan, PlanSummary, SweepFailure, SweepReport};
pub use declaration::{Declaration, Output};
pub use error::{EngineError, Result};
pub use finalize::deletion_order;
pub use provider::{
    ProviderContext, ProviderError, ProviderRegistry, ProviderResult, ResourceProvider,
};
pub use runtime::{Applied, ResourceRuntime};
pub use scope::{Phase, Scope, ScopeBuilder, open_scope};
pub use stackflow_state::{Secret, StateStore};
