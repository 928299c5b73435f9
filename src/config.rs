// ============================================================================
// Engine configuration
// ============================================================================

use crate::core::Result;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Bounded read cache.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CachePolicy {
    /// Entry count above which the least-recently-accessed half is evicted.
    pub capacity: usize,
}

impl Default for CachePolicy {
    fn default() -> Self {
        Self { capacity: 1_000 }
    }
}

/// Tenant directory refresh policy.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct DirectoryPolicy {
    pub heartbeat_secs: u64,
    /// Directory is reloaded when older than `heartbeat_secs * ttl_heartbeats`.
    pub ttl_heartbeats: u32,
    /// Minimum age of the directory before an unknown org may force a reload.
    pub min_reload_secs: u64,
}

impl Default for DirectoryPolicy {
    fn default() -> Self {
        Self {
            heartbeat_secs: 60,
            ttl_heartbeats: 5,
            min_reload_secs: 60,
        }
    }
}

impl DirectoryPolicy {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.heartbeat_secs.saturating_mul(self.ttl_heartbeats as u64))
    }

    pub fn min_reload(&self) -> Duration {
        Duration::from_secs(self.min_reload_secs)
    }
}

/// Retry of phase2 on backend write-write conflicts.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ConflictRetryPolicy {
    pub max_attempts: u32,
    pub base_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for ConflictRetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_backoff_ms: 5,
            max_backoff_ms: 250,
        }
    }
}

impl ConflictRetryPolicy {
    /// Exponential backoff for the given 1-based attempt.
    pub fn backoff_ms(&self, attempt: u32) -> u64 {
        let base = self.base_backoff_ms.max(1);
        let max = self.max_backoff_ms.max(base);
        let factor = 2u64.saturating_pow(attempt.saturating_sub(1));
        base.saturating_mul(factor).min(max)
    }
}

/// Delay applied after an operation run by a rate-limited account.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ThrottlePolicy {
    pub delay_ms: u64,
}

impl Default for ThrottlePolicy {
    fn default() -> Self {
        Self { delay_ms: 3_000 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SyncPolicy {
    /// Major entities whose content may be sent in one round.
    pub budget: usize,
}

impl Default for SyncPolicy {
    fn default() -> Self {
        Self { budget: 50 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct GcPolicy {
    pub interval_secs: u64,
    /// Delay before each attempt of a step; its length is the attempt limit.
    pub step_backoffs_ms: Vec<u64>,
    /// Days between tombstoning and purge eligibility.
    pub purge_grace_days: u64,
    /// Tombstones whose purge date is older than this are not scanned anymore.
    pub purge_window_days: u64,
    /// Days a purged version record is kept before being removed.
    pub version_retention_days: u64,
    pub far_future_offset_days: u64,
}

impl Default for GcPolicy {
    fn default() -> Self {
        Self {
            interval_secs: 86_400,
            step_backoffs_ms: vec![0, 2_000, 5_000],
            purge_grace_days: 2,
            purge_window_days: 800,
            version_retention_days: 400,
            far_future_offset_days: 1_000_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct QuotaThresholds {
    pub near_quota_pct: u32,
    pub rate_limit_pct: u32,
    pub minimal_access_pct: u32,
}

impl Default for QuotaThresholds {
    fn default() -> Self {
        Self {
            near_quota_pct: 90,
            rate_limit_pct: 100,
            minimal_access_pct: 200,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct EngineConfig {
    pub cache: CachePolicy,
    pub directory: DirectoryPolicy,
    pub retry: ConflictRetryPolicy,
    pub throttle: ThrottlePolicy,
    pub sync: SyncPolicy,
    pub gc: GcPolicy,
    pub quotas: QuotaThresholds,
    /// Keys accepted for system-admin operations.
    pub admin_keys: Vec<String>,
}

impl EngineConfig {
    pub fn from_json_str(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = tokio::fs::read_to_string(path.as_ref()).await?;
        Self::from_json_str(&text)
    }

    pub fn to_json_pretty(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}
