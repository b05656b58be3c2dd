use ulid::Ulid;

use crate::model::Ms;

#[derive(Debug)]
pub enum StoreError {
    NotFound(Ulid),
    AlreadyExists(Ulid),
    /// Calendar still has rules pointing at it.
    HasRules(Ulid),
    /// A rule update tried to move the rule to another calendar.
    CalendarMismatch { rule_id: Ulid, calendar_id: Ulid },
    InvalidSpan { start: Ms, end: Ms },
    LimitExceeded(&'static str),
    WalError(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::NotFound(id) => write!(f, "not found: {id}"),
            StoreError::AlreadyExists(id) => write!(f, "already exists: {id}"),
            StoreError::HasRules(id) => write!(f, "cannot delete calendar {id}: rules still target it"),
            StoreError::CalendarMismatch { rule_id, calendar_id } => {
                write!(f, "rule {rule_id} belongs to another calendar than {calendar_id}")
            }
            StoreError::InvalidSpan { start, end } => {
                write!(f, "appointment ends before it starts: [{start}, {end}]")
            }
            StoreError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            StoreError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl StoreError {
    /// The store refused this one record (bad times, size limits); retrying
    /// it unchanged fails the same way.
    pub fn is_rejection(&self) -> bool {
        matches!(self, StoreError::LimitExceeded(_) | StoreError::InvalidSpan { .. })
    }
}

impl std::error::Error for StoreError {}
