use std::sync::Arc;

use tracing::debug;

use crate::error::SyncError;
use crate::model::{Rule, TicketId};
use crate::tickets::SearchService;

/// Runs a rule's search against the ticket index.
#[derive(Clone)]
pub struct TicketMatcher {
    search: Arc<dyn SearchService>,
}

impl TicketMatcher {
    pub fn new(search: Arc<dyn SearchService>) -> Self {
        Self { search }
    }

    /// Matching ticket ids, ascending and free of duplicates whatever order the
    /// search backend returns. Search params and the queue filter combine
    /// conjunctively. No match is an empty list, not an error.
    pub async fn match_rule(&self, rule: &Rule) -> Result<Vec<TicketId>, SyncError> {
        let mut ids = self.search.search(&rule.search, rule.queue_id).await?;
        ids.sort_unstable();
        ids.dedup();
        debug!(rule_id = %rule.id, matched = ids.len(), "rule search finished");
        Ok(ids)
    }

    /// Whether one ticket currently matches the rule.
    pub async fn matches(&self, rule: &Rule, ticket_id: TicketId) -> Result<bool, SyncError> {
        let ids = self.match_rule(rule).await?;
        Ok(ids.binary_search(&ticket_id).is_ok())
    }
}
