//! External collaborator interfaces
//!
//! The core never blocks on these: sink delivery failures are the sink's
//! problem to log, and cache invalidation is a synchronous hint to an
//! external cache, not a store.

use serde_json::Value;

/// Push-notification sink for finalize/error events.
///
/// Implementations must not block; delivery failures are logged, never
/// propagated into vote processing.
pub trait NotificationSink: Send + Sync {
    fn notify(&self, topic: &str, payload: Value);
}

/// Invalidation hook for externally cached vote-status and election-stats
/// entries.
pub trait CacheInvalidator: Send + Sync {
    fn invalidate(&self, key: &str);
}

/// Broadcast channel for admin/observer dashboards.
pub const ADMIN_TOPIC: &str = "admin";

/// Per-vote status channel.
pub fn vote_topic(vote_id: &str) -> String {
    format!("vote:{}", vote_id)
}

pub fn vote_status_key(vote_id: &str) -> String {
    format!("vote_status:{}", vote_id)
}

pub fn election_stats_key(election_id: &str) -> String {
    format!("election_stats:{}", election_id)
}

/// Default sink: writes events to the log.
pub struct LogSink;

impl NotificationSink for LogSink {
    fn notify(&self, topic: &str, payload: Value) {
        log::info!("notify [{}]: {}", topic, payload);
    }
}

/// Default invalidator for deployments without an external cache.
pub struct NoopCache;

impl CacheInvalidator for NoopCache {
    fn invalidate(&self, key: &str) {
        log::debug!("cache invalidate: {}", key);
    }
}
