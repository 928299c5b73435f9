pub mod directory;
pub mod row_cache;

pub use directory::TenantDirectory;
pub use row_cache::{CacheStats, CachedRow, RowCache};
