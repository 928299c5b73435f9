pub mod counters;
pub mod days;
pub mod error;
pub mod ids;

pub use counters::{AdmissionFlags, Counters, UsageSummary};
pub use days::Day;
pub use error::{EngineError, ErrorCategory, Result, codes};
pub use ids::{Id, IdKind};
