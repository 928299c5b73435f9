// ============================================================================
// Storage layer
// ============================================================================
//
// The engine reaches storage only through `StorageBackend` / `StorageTxn`
// (rows) and `ObjectStorage` (file bytes). Adapters implement those traits;
// the rest of the crate never depends on a concrete backend.
// ============================================================================

pub mod backend;
pub mod memory;
pub mod objects;
pub mod persistence;
pub mod row;

pub use backend::{CommitReport, RowSource, StorageBackend, StorageTxn};
pub use memory::InMemoryBackend;
pub use objects::{LocalObjectStorage, MemoryObjectStorage, ObjectStorage};
pub use row::{Collection, RowFilter, RowKey, StoredRow};
