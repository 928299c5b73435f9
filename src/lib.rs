// ============================================================================
// tenantdoc Library
// ============================================================================
//
// Multi-tenant versioned document engine:
//   storage   -> row backend and object storage abstractions
//   cache     -> bounded row cache and tenant directory
//   document  -> typed documents, Document Manager, write cascade
//   operation -> operation lifecycle (auth, transaction, post-commit)
//   sync      -> incremental client synchronization
//   gc        -> tombstone garbage collection
//   engine    -> wiring and transport entry point
// ============================================================================

pub mod cache;
pub mod config;
pub mod core;
pub mod document;
pub mod engine;
pub mod gc;
pub mod operation;
pub mod storage;
pub mod sync;

// Re-export main types for convenience
pub use config::EngineConfig;
pub use core::{EngineError, ErrorCategory, Id, Result, codes};
pub use document::{Document, DocumentManager};
pub use engine::{Engine, EngineBuilder};
pub use gc::{Checkpoint, GcWorker, spawn_gc_worker};
pub use operation::{AccessMode, FrozenPolicy, OpContext, Operation};
pub use sync::{SyncReply, SyncRequest};

/// Builds an engine over in-memory storage with default collaborators.
///
/// # Examples
///
/// ```
/// use tenantdoc::{codes, engine};
///
/// # #[tokio::main]
/// # async fn main() {
/// let engine = engine().unwrap();
/// let err = engine
///     .execute("NoSuchOperation", serde_json::Value::Null, None)
///     .await
///     .unwrap_err();
/// assert_eq!(err.code(), codes::UNKNOWN_OPERATION);
/// # }
/// ```
pub fn engine() -> Result<Engine> {
    Engine::builder().build()
}
