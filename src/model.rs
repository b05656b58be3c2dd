use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDateTime};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds. The only time type.
pub type Ms = i64;

pub const SECOND_MS: Ms = 1_000;
pub const MINUTE_MS: Ms = 60_000;

pub type TicketId = u64;
pub type QueueId = u64;

/// Wall-clock format used by ticket date fields and appointment editors.
pub const DATETIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

pub fn now_ms() -> Ms {
    chrono::Utc::now().timestamp_millis()
}

/// Parse `YYYY-MM-DD HH:MM:SS` (UTC) into unix milliseconds.
pub fn parse_datetime(s: &str) -> Option<Ms> {
    NaiveDateTime::parse_from_str(s.trim(), DATETIME_FORMAT)
        .ok()
        .map(|dt| dt.and_utc().timestamp_millis())
}

pub fn format_datetime(ms: Ms) -> String {
    match DateTime::from_timestamp_millis(ms) {
        Some(dt) => dt.format(DATETIME_FORMAT).to_string(),
        None => ms.to_string(),
    }
}

// ── Calendars & rules ────────────────────────────────────────────

/// Binds a ticket search plus a start/end time module pair to a calendar.
///
/// Module names are kept as authored; [`Rule::modules`](crate::module) parses them
/// into typed [`TimeModule`](crate::module::TimeModule)s at reconciliation time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rule {
    pub id: Ulid,
    pub calendar_id: Ulid,
    pub queue_id: Option<QueueId>,
    pub search: BTreeMap<String, String>,
    pub start_module: String,
    pub end_module: String,
    pub active: bool,
    /// Bumped by the store on every update. Lets the driver tell a corrected
    /// rule apart from the one it already rejected.
    pub revision: u64,
}

impl Rule {
    pub fn new(calendar_id: Ulid, start_module: &str, end_module: &str) -> Self {
        Self {
            id: Ulid::new(),
            calendar_id,
            queue_id: None,
            search: BTreeMap::new(),
            start_module: start_module.to_string(),
            end_module: end_module.to_string(),
            active: true,
            revision: 0,
        }
    }

    pub fn with_queue(mut self, queue_id: QueueId) -> Self {
        self.queue_id = Some(queue_id);
        self
    }

    pub fn with_search(mut self, field: &str, value: &str) -> Self {
        self.search.insert(field.to_string(), value.to_string());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CalendarInfo {
    pub id: Ulid,
    pub name: String,
    pub rule_count: usize,
    pub appointment_count: usize,
}

// ── Appointments ────────────────────────────────────────────────

/// Back-reference from a ticket-derived appointment to what produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TicketSource {
    pub rule_id: Ulid,
    pub ticket_id: TicketId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Appointment {
    pub id: Ulid,
    pub calendar_id: Ulid,
    pub title: String,
    pub start: Ms,
    pub end: Ms,
    /// `None` for appointments a user created by hand.
    pub source: Option<TicketSource>,
}

impl Appointment {
    pub fn rule_id(&self) -> Option<Ulid> {
        self.source.map(|s| s.rule_id)
    }

    pub fn ticket_id(&self) -> Option<TicketId> {
        self.source.map(|s| s.ticket_id)
    }
}

/// Who changed an appointment. Only `External` edits are fed back into tickets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EditOrigin {
    Reconciler,
    External,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppointmentPatch {
    pub title: Option<String>,
    pub start: Ms,
    pub end: Ms,
}

/// In-memory state of one calendar: its ordered rules and its appointments.
#[derive(Debug, Clone)]
pub struct CalendarState {
    pub id: Ulid,
    pub name: String,
    /// Insertion order is the authoring order.
    pub rules: Vec<Rule>,
    /// Sorted by `start`.
    pub appointments: Vec<Appointment>,
}

impl CalendarState {
    pub fn new(id: Ulid, name: String) -> Self {
        Self {
            id,
            name,
            rules: Vec::new(),
            appointments: Vec::new(),
        }
    }

    /// Insert appointment maintaining sort order by start.
    pub fn insert_appointment(&mut self, appointment: Appointment) {
        let pos = self
            .appointments
            .partition_point(|a| a.start <= appointment.start);
        self.appointments.insert(pos, appointment);
    }

    pub fn remove_appointment(&mut self, id: Ulid) -> Option<Appointment> {
        let pos = self.appointments.iter().position(|a| a.id == id)?;
        Some(self.appointments.remove(pos))
    }

    pub fn appointment(&self, id: Ulid) -> Option<&Appointment> {
        self.appointments.iter().find(|a| a.id == id)
    }

    pub fn upsert_rule(&mut self, rule: Rule) {
        match self.rules.iter_mut().find(|r| r.id == rule.id) {
            Some(slot) => *slot = rule,
            None => self.rules.push(rule),
        }
    }

    pub fn remove_rule(&mut self, id: Ulid) -> Option<Rule> {
        let pos = self.rules.iter().position(|r| r.id == id)?;
        Some(self.rules.remove(pos))
    }
}

/// The journal record format: flat, one variant per mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    CalendarCreated { id: Ulid, name: String },
    CalendarDeleted { id: Ulid },
    RuleAdded { rule: Rule },
    RuleUpdated { rule: Rule },
    RuleRemoved { id: Ulid, calendar_id: Ulid },
    AppointmentCreated { appointment: Appointment },
    AppointmentUpdated { appointment: Appointment, origin: EditOrigin },
    AppointmentDeleted { id: Ulid, calendar_id: Ulid },
}

impl Event {
    pub fn calendar_id(&self) -> Ulid {
        match self {
            Event::CalendarCreated { id, .. } | Event::CalendarDeleted { id } => *id,
            Event::RuleAdded { rule } | Event::RuleUpdated { rule } => rule.calendar_id,
            Event::RuleRemoved { calendar_id, .. } | Event::AppointmentDeleted { calendar_id, .. } => {
                *calendar_id
            }
            Event::AppointmentCreated { appointment }
            | Event::AppointmentUpdated { appointment, .. } => appointment.calendar_id,
        }
    }
}

// ── Tickets (owned by the external ticket system) ───────────────

/// A dynamic field value as the ticket system reports it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FieldValue {
    Text(String),
    Integer(i64),
    Date(Ms),
    DateTime(Ms),
}

impl FieldValue {
    pub fn as_timestamp(&self) -> Option<Ms> {
        match self {
            FieldValue::Date(ms) | FieldValue::DateTime(ms) => Some(*ms),
            FieldValue::Text(_) | FieldValue::Integer(_) => None,
        }
    }

    /// Text form used by ticket search.
    pub fn display(&self) -> String {
        match self {
            FieldValue::Text(s) => s.clone(),
            FieldValue::Integer(i) => i.to_string(),
            FieldValue::Date(ms) | FieldValue::DateTime(ms) => format_datetime(*ms),
        }
    }
}

/// Deadlines computed by the escalation index builder.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Escalations {
    pub first_response: Option<Ms>,
    pub update: Option<Ms>,
    pub solution: Option<Ms>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Ticket {
    pub id: TicketId,
    pub number: String,
    pub title: String,
    pub queue_id: QueueId,
    pub state: String,
    pub state_type: String,
    pub priority: String,
    #[serde(rename = "type")]
    pub ticket_type: String,
    pub customer_id: String,
    pub owner: String,
    pub escalations: Escalations,
    pub dynamic_fields: BTreeMap<String, FieldValue>,
    pub pending_until: Option<Ms>,
}

impl Ticket {
    /// Seconds left until the pending time; negative once it has passed.
    pub fn until_time(&self, now: Ms) -> Option<i64> {
        self.pending_until.map(|p| (p - now).div_euclid(SECOND_MS))
    }

    /// Searchable attribute by its search-parameter name.
    pub fn attribute(&self, name: &str) -> Option<String> {
        if let Some(field) = name.strip_prefix("DynamicField_") {
            return self.dynamic_fields.get(field).map(FieldValue::display);
        }
        let value = match name {
            "Title" => &self.title,
            "TicketNumber" => &self.number,
            "CustomerID" => &self.customer_id,
            "State" => &self.state,
            "StateType" => &self.state_type,
            "Priority" => &self.priority,
            "Type" => &self.ticket_type,
            "Owner" => &self.owner,
            _ => return None,
        };
        Some(value.clone())
    }
}
