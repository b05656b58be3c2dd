//! Ticket system ports and an in-memory implementation.
//!
//! The ticket system owns tickets; this crate reads them, searches them and,
//! for feedback, writes dynamic fields and pending times.

use std::collections::BTreeMap;
use std::path::Path;

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::debug;

use crate::model::{FieldValue, Ms, QueueId, Ticket, TicketId};

#[derive(Debug)]
pub enum ServiceError {
    TicketNotFound(TicketId),
    Unavailable(String),
    Rejected(String),
}

impl std::fmt::Display for ServiceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServiceError::TicketNotFound(id) => write!(f, "ticket {id} not found"),
            ServiceError::Unavailable(e) => write!(f, "ticket service unavailable: {e}"),
            ServiceError::Rejected(e) => write!(f, "ticket service rejected the change: {e}"),
        }
    }
}

impl std::error::Error for ServiceError {}

#[async_trait]
pub trait TicketService: Send + Sync {
    /// `Ok(None)` when the ticket no longer exists.
    async fn get_ticket(&self, id: TicketId) -> Result<Option<Ticket>, ServiceError>;
    async fn set_dynamic_field_value(&self, id: TicketId, field: &str, value: FieldValue) -> Result<(), ServiceError>;
    async fn set_pending_time(&self, id: TicketId, until: Ms) -> Result<(), ServiceError>;
}

#[async_trait]
pub trait SearchService: Send + Sync {
    /// Ids of tickets matching every parameter (and the queue, if given).
    async fn search(&self, params: &BTreeMap<String, String>, queue_id: Option<QueueId>)
    -> Result<Vec<TicketId>, ServiceError>;
}

/// Case-insensitive match where `*` stands for any run of characters.
pub fn glob_match(pattern: &str, text: &str) -> bool {
    let pattern: Vec<char> = pattern.to_lowercase().chars().collect();
    let text: Vec<char> = text.to_lowercase().chars().collect();
    let (mut p, mut t) = (0, 0);
    let mut backtrack: Option<(usize, usize)> = None;
    while t < text.len() {
        if p < pattern.len() && pattern[p] == '*' {
            backtrack = Some((p, t));
            p += 1;
        } else if p < pattern.len() && pattern[p] == text[t] {
            p += 1;
            t += 1;
        } else if let Some((star, matched)) = backtrack {
            p = star + 1;
            t = matched + 1;
            backtrack = Some((star, matched + 1));
        } else {
            return false;
        }
    }
    pattern[p..].iter().all(|c| *c == '*')
}

fn ticket_matches(ticket: &Ticket, params: &BTreeMap<String, String>, queue_id: Option<QueueId>) -> bool {
    if queue_id.is_some_and(|q| q != ticket.queue_id) {
        return false;
    }
    params.iter().all(|(name, pattern)| {
        ticket
            .attribute(name)
            .is_some_and(|value| glob_match(pattern, &value))
    })
}

/// Ticket and search service over an in-memory ticket table.
#[derive(Default)]
pub struct MemoryTickets {
    tickets: DashMap<TicketId, Ticket>,
}

impl MemoryTickets {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a JSON array of tickets.
    pub fn load_json(path: &Path) -> std::io::Result<Self> {
        let bytes = std::fs::read(path)?;
        let tickets: Vec<Ticket> = serde_json::from_slice(&bytes)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        let store = Self::new();
        for ticket in tickets {
            store.upsert(ticket);
        }
        Ok(store)
    }

    pub fn upsert(&self, ticket: Ticket) {
        self.tickets.insert(ticket.id, ticket);
    }

    pub fn remove(&self, id: TicketId) -> Option<Ticket> {
        self.tickets.remove(&id).map(|(_, t)| t)
    }

    pub fn get(&self, id: TicketId) -> Option<Ticket> {
        self.tickets.get(&id).map(|t| t.value().clone())
    }

    /// Apply `f` to a stored ticket. Returns false if it doesn't exist.
    pub fn modify(&self, id: TicketId, f: impl FnOnce(&mut Ticket)) -> bool {
        match self.tickets.get_mut(&id) {
            Some(mut ticket) => {
                f(&mut ticket);
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.tickets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tickets.is_empty()
    }
}

#[async_trait]
impl TicketService for MemoryTickets {
    async fn get_ticket(&self, id: TicketId) -> Result<Option<Ticket>, ServiceError> {
        Ok(self.get(id))
    }

    async fn set_dynamic_field_value(&self, id: TicketId, field: &str, value: FieldValue) -> Result<(), ServiceError> {
        let written = self.modify(id, |t| {
            t.dynamic_fields.insert(field.to_string(), value);
        });
        if !written {
            return Err(ServiceError::TicketNotFound(id));
        }
        debug!(ticket_id = id, field, "dynamic field written");
        Ok(())
    }

    async fn set_pending_time(&self, id: TicketId, until: Ms) -> Result<(), ServiceError> {
        if !self.modify(id, |t| t.pending_until = Some(until)) {
            return Err(ServiceError::TicketNotFound(id));
        }
        Ok(())
    }
}

#[async_trait]
impl SearchService for MemoryTickets {
    async fn search(
        &self,
        params: &BTreeMap<String, String>,
        queue_id: Option<QueueId>,
    ) -> Result<Vec<TicketId>, ServiceError> {
        let mut ids: Vec<TicketId> = self
            .tickets
            .iter()
            .filter(|t| ticket_matches(t.value(), params, queue_id))
            .map(|t| *t.key())
            .collect();
        ids.sort_unstable();
        Ok(ids)
    }
}
