//! stackflow state persistence
//!
//! This crate holds everything that crosses the state boundary:
//!
//! - **StateRecord**: the persisted fact about one resource
//! - **StateStore**: the backend contract (file and in-memory backends included)
//! - **SecretCodec**: seals secrets before they reach a store and opens them after
//! - **InstrumentedStore**: a telemetry decorator over any store
//!
//! ```text
//! ┌──────────────────────────────────────────┐
//! │             stackflow-engine             │
//! └──────────┬───────────────────┬───────────┘
//!            │                   │
//! ┌──────────▼─────────┐ ┌───────▼────────┐
//! │ InstrumentedStore  │ │  SecretCodec   │
//! └──────────┬─────────┘ └────────────────┘
//!            │
//! ┌──────────▼─────────┐
//! │ FileStateStore /   │
//! │ MemoryStateStore   │
//! └────────────────────┘
//! ```

pub mod error;
pub mod file;
pub mod memory;
pub mod path;
pub mod record;
pub mod secret;
pub mod store;
pub mod telemetry;

// Re-exports
pub use error::{Result, StateError};
pub use file::FileStateStore;
pub use memory::MemoryStateStore;
pub use path::ScopeId;
pub use record::{RECORD_VERSION, RecordStatus, StateRecord};
pub use secret::{
    Envelope, SEALED_TAG, SECRET_TAG, Sealed, Secret, SecretCodec, SecretKey, decrypt, encrypt,
};
pub use store::StateStore;
pub use telemetry::{
    InstrumentedStore, RecordingSink, StoreEvent, StoreOperation, TelemetrySink, TracingSink,
};
