use std::time::Duration;

use ulid::Ulid;

use crate::store::StoreError;
use crate::tickets::ServiceError;

/// Failure of a reconciliation or feedback step.
///
/// Per-ticket [`ResolveError`](crate::module::ResolveError)s never reach this type; the reconciler counts
/// them as skips.
#[derive(Debug)]
pub enum SyncError {
    /// Malformed rule. Not retried until the rule changes.
    Config { rule_id: Ulid, reason: String },
    /// Search, ticket or appointment storage call failed. Retried next tick.
    TransientStore(String),
    /// The rule's pass exceeded the configured ceiling and was abandoned.
    Timeout { rule_id: Ulid, after: Duration },
    NotFound(String),
}

impl SyncError {
    /// Short label for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            SyncError::Config { .. } => "config",
            SyncError::TransientStore(_) => "transient",
            SyncError::Timeout { .. } => "timeout",
            SyncError::NotFound(_) => "not_found",
        }
    }

    pub fn is_config(&self) -> bool {
        matches!(self, SyncError::Config { .. })
    }
}

impl std::fmt::Display for SyncError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncError::Config { rule_id, reason } => write!(f, "rule {rule_id} is misconfigured: {reason}"),
            SyncError::TransientStore(e) => write!(f, "store unavailable: {e}"),
            SyncError::Timeout { rule_id, after } => {
                write!(f, "rule {rule_id} abandoned after {}s", after.as_secs())
            }
            SyncError::NotFound(what) => write!(f, "not found: {what}"),
        }
    }
}

impl std::error::Error for SyncError {}

impl From<StoreError> for SyncError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(id) => SyncError::NotFound(id.to_string()),
            other => SyncError::TransientStore(other.to_string()),
        }
    }
}

impl From<ServiceError> for SyncError {
    fn from(e: ServiceError) -> Self {
        match e {
            ServiceError::TicketNotFound(id) => SyncError::NotFound(format!("ticket {id}")),
            other => SyncError::TransientStore(other.to_string()),
        }
    }
}
