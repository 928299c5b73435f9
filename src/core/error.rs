use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Numeric category attached to every error surfaced to the transport layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum ErrorCategory {
    /// Expected rejection, safe to show to the caller.
    Functional = 1,
    /// Internal invariant violated: data inconsistency or a bug.
    Assertion = 2,
    /// Anything not raised deliberately by the engine.
    Unexpected = 3,
}

impl ErrorCategory {
    pub fn code(self) -> u8 {
        self as u8
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    #[error("Functional error {code}: {message}")]
    Functional { code: u32, message: String },

    #[error("Assertion failed {code}: {message}")]
    Assertion { code: u32, message: String },

    #[error("Unexpected failure: {message}")]
    Unexpected {
        message: String,
        /// Populated only in debug builds.
        context: Option<String>,
    },

    /// Raised by a backend when another transaction committed a conflicting
    /// write first. Retried by the lifecycle, surfaced as unexpected.
    #[error("Transaction conflict: {0}")]
    Conflict(String),
}

pub type Result<T> = std::result::Result<T, EngineError>;

impl EngineError {
    pub fn functional(code: u32, message: impl Into<String>) -> Self {
        Self::Functional {
            code,
            message: message.into(),
        }
    }

    pub fn assertion(code: u32, message: impl Into<String>) -> Self {
        Self::Assertion {
            code,
            message: message.into(),
        }
    }

    pub fn unexpected(message: impl Into<String>) -> Self {
        Self::Unexpected {
            message: message.into(),
            context: None,
        }
    }

    /// Attaches diagnostic context to an unexpected error. No-op in release
    /// builds and for deliberate (functional / assertion) errors.
    pub fn with_context(self, context: impl FnOnce() -> String) -> Self {
        match self {
            Self::Unexpected { message, context: None } if cfg!(debug_assertions) => {
                Self::Unexpected {
                    message,
                    context: Some(context()),
                }
            }
            other => other,
        }
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Functional { .. } => ErrorCategory::Functional,
            Self::Assertion { .. } => ErrorCategory::Assertion,
            Self::Unexpected { .. } | Self::Conflict(_) => ErrorCategory::Unexpected,
        }
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }

    pub fn code(&self) -> u32 {
        match self {
            Self::Functional { code, .. } | Self::Assertion { code, .. } => *code,
            Self::Unexpected { .. } | Self::Conflict(_) => 0,
        }
    }
}

/// Functional error codes.
pub mod codes {
    pub const TENANT_UNKNOWN: u32 = 101;
    pub const TENANT_CLOSED: u32 = 102;
    pub const TENANT_FROZEN: u32 = 103;
    pub const TOKEN_MISSING: u32 = 104;
    pub const TOKEN_INVALID: u32 = 105;
    pub const ACCOUNT_UNKNOWN: u32 = 106;
    pub const NOT_PRIVILEGED: u32 = 107;
    pub const NOT_ADMIN: u32 = 108;
    pub const READ_ONLY: u32 = 109;
    pub const MINIMAL_ACCESS: u32 = 110;
    pub const ENTITY_DELETED: u32 = 111;
    pub const UNKNOWN_OPERATION: u32 = 112;
    pub const BAD_ARGUMENTS: u32 = 113;
    pub const BAD_PERIMETER: u32 = 114;
    pub const OVER_QUOTA: u32 = 115;

    // Assertions
    pub const MISSING_VERSION: u32 = 501;
    pub const MISSING_ENTITY: u32 = 502;
    pub const WRONG_DOCUMENT_TYPE: u32 = 503;
    pub const DUPLICATE_ENTITY: u32 = 504;
    pub const WRITE_IN_READ_ONLY: u32 = 505;
}

impl From<std::io::Error> for EngineError {
    fn from(err: std::io::Error) -> Self {
        Self::unexpected(format!("I/O error: {}", err))
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        Self::unexpected(format!("JSON error: {}", err))
    }
}

impl From<rmp_serde::encode::Error> for EngineError {
    fn from(err: rmp_serde::encode::Error) -> Self {
        Self::unexpected(format!("encode error: {}", err))
    }
}

impl From<rmp_serde::decode::Error> for EngineError {
    fn from(err: rmp_serde::decode::Error) -> Self {
        Self::unexpected(format!("decode error: {}", err))
    }
}

impl<T> From<std::sync::PoisonError<T>> for EngineError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Self::unexpected(format!("Lock error: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn categories_are_numeric() {
        assert_eq!(EngineError::functional(1, "x").category().code(), 1);
        assert_eq!(EngineError::assertion(1, "x").category().code(), 2);
        assert_eq!(EngineError::unexpected("x").category().code(), 3);
        assert_eq!(EngineError::Conflict("x".into()).category(), ErrorCategory::Unexpected);
    }

    #[test]
    fn context_only_on_unexpected() {
        let err = EngineError::functional(7, "nope").with_context(|| "ctx".into());
        assert_eq!(err, EngineError::functional(7, "nope"));

        let err = EngineError::unexpected("boom").with_context(|| "ctx".into());
        match err {
            EngineError::Unexpected { context, .. } => {
                assert_eq!(context.is_some(), cfg!(debug_assertions));
            }
            _ => panic!("expected unexpected error"),
        }
    }
}
