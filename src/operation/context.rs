use crate::core::{AdmissionFlags, Day, EngineError, Result, codes};
use crate::document::Tenant;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use uuid::Uuid;

/// Resolved identity of the caller.
#[derive(Debug, Clone)]
pub struct AuthContext {
    pub tenant: Arc<Tenant>,
    pub account: Option<i64>,
    pub session: Option<String>,
    pub admin: bool,
    /// Tenant frozen and the operation allows read-only access.
    pub read_only: bool,
    pub flags: AdmissionFlags,
}

impl AuthContext {
    pub fn ns(&self) -> i64 {
        self.tenant.ns
    }
}

/// Per-run context handed to every phase.
#[derive(Debug, Clone)]
pub struct OpContext {
    pub op_id: Uuid,
    pub name: String,
    pub now: DateTime<Utc>,
    pub today: Day,
    /// `None` for public calls without a token and for internal runs.
    pub auth: Option<AuthContext>,
}

impl OpContext {
    pub fn new(name: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            op_id: Uuid::new_v4(),
            name: name.into(),
            now,
            today: now.date_naive(),
            auth: None,
        }
    }

    pub fn ns(&self) -> Option<i64> {
        self.auth.as_ref().map(AuthContext::ns)
    }

    pub fn account(&self) -> Option<i64> {
        self.auth.as_ref().and_then(|auth| auth.account)
    }

    pub fn require_account(&self) -> Result<i64> {
        self.account().ok_or_else(|| {
            EngineError::functional(codes::TOKEN_MISSING, "operation requires an authenticated account")
        })
    }

    pub fn session(&self) -> Option<&str> {
        self.auth.as_ref().and_then(|auth| auth.session.as_deref())
    }

    pub fn flags(&self) -> AdmissionFlags {
        self.auth.as_ref().map(|auth| auth.flags).unwrap_or_default()
    }

    pub fn is_read_only(&self) -> bool {
        self.auth.as_ref().is_some_and(|auth| auth.read_only)
    }

    pub fn is_admin(&self) -> bool {
        self.auth.as_ref().is_some_and(|auth| auth.admin)
    }
}
