// ============================================================================
// Documents, working set and write cascade
// ============================================================================

pub mod cascade;
pub mod manager;
pub mod types;

pub use cascade::CommitOutcome;
pub use manager::{DocKey, DocumentManager};
pub use types::{
    Account, Avatar, Chat, Document, FilePurge, Group, GroupAccess, Member, Note, Partition,
    Sponsorship, Synthesis, Tenant, Ticket, Transfer, Usage, VersionRecord,
};
