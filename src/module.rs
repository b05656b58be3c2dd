//! Time modules: named strategies that derive a timestamp from a ticket.
//!
//! Rules carry module names as authored (`FirstResponseTime`, `Plus_30`,
//! `DynamicField_Due`, `PendingTime`). They are parsed once per pass into the
//! closed [`TimeModule`] type and resolved against a ticket snapshot with
//! [`resolve`], which never reads the clock.

use std::fmt;
use std::str::FromStr;

use crate::error::SyncError;
use crate::limits::MAX_OFFSET_MINUTES;
use crate::model::{MINUTE_MS, Ms, Rule, Ticket};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Escalation {
    FirstResponse,
    Update,
    Solution,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TimeModule {
    Escalation(Escalation),
    /// `Plus_<minutes>`: end only, offset from the resolved start.
    RelativeOffset { minutes: u32 },
    DynamicField(String),
    PendingTime,
}

impl TimeModule {
    /// Whether an edited appointment time can be written back into the ticket.
    pub fn is_reversible(&self) -> bool {
        matches!(self, TimeModule::DynamicField(_) | TimeModule::PendingTime)
    }
}

impl FromStr for TimeModule {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "FirstResponseTime" => return Ok(TimeModule::Escalation(Escalation::FirstResponse)),
            "UpdateTime" => return Ok(TimeModule::Escalation(Escalation::Update)),
            "SolutionTime" => return Ok(TimeModule::Escalation(Escalation::Solution)),
            "PendingTime" => return Ok(TimeModule::PendingTime),
            _ => {}
        }
        if let Some(minutes) = s.strip_prefix("Plus_") {
            let minutes: u32 = minutes
                .parse()
                .map_err(|_| format!("invalid offset in time module {s:?}"))?;
            if minutes == 0 || minutes > MAX_OFFSET_MINUTES {
                return Err(format!("offset out of range in time module {s:?}"));
            }
            return Ok(TimeModule::RelativeOffset { minutes });
        }
        if let Some(name) = s.strip_prefix("DynamicField_") {
            if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric()) {
                return Err(format!("invalid dynamic field name in time module {s:?}"));
            }
            return Ok(TimeModule::DynamicField(name.to_string()));
        }
        Err(format!("unknown time module {s:?}"))
    }
}

impl fmt::Display for TimeModule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimeModule::Escalation(Escalation::FirstResponse) => f.write_str("FirstResponseTime"),
            TimeModule::Escalation(Escalation::Update) => f.write_str("UpdateTime"),
            TimeModule::Escalation(Escalation::Solution) => f.write_str("SolutionTime"),
            TimeModule::RelativeOffset { minutes } => write!(f, "Plus_{minutes}"),
            TimeModule::DynamicField(name) => write!(f, "DynamicField_{name}"),
            TimeModule::PendingTime => f.write_str("PendingTime"),
        }
    }
}

/// A validated start/end pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModulePair {
    pub start: TimeModule,
    pub end: TimeModule,
}

impl ModulePair {
    pub fn parse(start: &str, end: &str) -> Result<Self, String> {
        let start: TimeModule = start.parse()?;
        let end: TimeModule = end.parse()?;
        match (&start, &end) {
            (TimeModule::RelativeOffset { .. }, _) => {
                return Err(format!("{start} can only be used as an end module"));
            }
            (_, TimeModule::RelativeOffset { .. }) => {}
            (TimeModule::Escalation(_), TimeModule::Escalation(_)) => {}
            (TimeModule::DynamicField(_), TimeModule::DynamicField(_)) => {}
            (TimeModule::PendingTime, _) => {
                return Err(format!("PendingTime needs a Plus_<minutes> end, got {end}"));
            }
            _ => return Err(format!("end module {end} does not fit start module {start}")),
        }
        Ok(Self { start, end })
    }
}

impl Rule {
    /// Parse and validate the rule's module names.
    pub fn modules(&self) -> Result<ModulePair, SyncError> {
        ModulePair::parse(&self.start_module, &self.end_module).map_err(|reason| SyncError::Config {
            rule_id: self.id,
            reason,
        })
    }
}

/// A module had no value for this ticket. Expected; the ticket is skipped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolveError {
    pub module: String,
    pub reason: &'static str,
}

impl fmt::Display for ResolveError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} not available: {}", self.module, self.reason)
    }
}

impl std::error::Error for ResolveError {}

fn not_available(module: &TimeModule, reason: &'static str) -> ResolveError {
    ResolveError {
        module: module.to_string(),
        reason,
    }
}

/// Resolve `module` for `ticket`. `counterpart` is the already resolved start
/// time and is only consulted by relative offsets.
pub fn resolve(module: &TimeModule, ticket: &Ticket, counterpart: Option<Ms>) -> Result<Ms, ResolveError> {
    match module {
        TimeModule::Escalation(kind) => {
            let deadline = match kind {
                Escalation::FirstResponse => ticket.escalations.first_response,
                Escalation::Update => ticket.escalations.update,
                Escalation::Solution => ticket.escalations.solution,
            };
            deadline.ok_or_else(|| not_available(module, "ticket has no such escalation deadline"))
        }
        TimeModule::RelativeOffset { minutes } => counterpart
            .map(|start| start + Ms::from(*minutes) * MINUTE_MS)
            .ok_or_else(|| not_available(module, "no start time to offset from")),
        TimeModule::DynamicField(name) => match ticket.dynamic_fields.get(name) {
            Some(value) => value
                .as_timestamp()
                .ok_or_else(|| not_available(module, "field does not hold a date")),
            None => Err(not_available(module, "field is not set")),
        },
        TimeModule::PendingTime => ticket
            .pending_until
            .ok_or_else(|| not_available(module, "ticket has no pending time")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Escalations, FieldValue, parse_datetime};

    fn ticket() -> Ticket {
        let mut t = Ticket {
            id: 1,
            escalations: Escalations {
                first_response: Some(1_000_000),
                update: None,
                solution: Some(3_000_000),
            },
            pending_until: Some(5_000_000),
            ..Default::default()
        };
        t.dynamic_fields
            .insert("Start".into(), FieldValue::DateTime(parse_datetime("2016-01-01 00:00:00").unwrap()));
        t.dynamic_fields
            .insert("Day".into(), FieldValue::Date(parse_datetime("2016-01-02 00:00:00").unwrap()));
        t.dynamic_fields.insert("Note".into(), FieldValue::Text("hello".into()));
        t
    }

    #[test]
    fn parse_and_display_roundtrip() {
        for name in [
            "FirstResponseTime",
            "UpdateTime",
            "SolutionTime",
            "PendingTime",
            "Plus_5",
            "Plus_2880",
            "DynamicField_Due",
        ] {
            let module: TimeModule = name.parse().unwrap();
            assert_eq!(module.to_string(), name);
        }
    }

    #[test]
    fn parse_rejects_unknown_and_malformed() {
        assert!("EscalationTime".parse::<TimeModule>().is_err());
        assert!("Plus_".parse::<TimeModule>().is_err());
        assert!("Plus_0".parse::<TimeModule>().is_err());
        assert!("Plus_-5".parse::<TimeModule>().is_err());
        assert!("Plus_999999999".parse::<TimeModule>().is_err());
        assert!("DynamicField_".parse::<TimeModule>().is_err());
        assert!("DynamicField_a b".parse::<TimeModule>().is_err());
    }

    #[test]
    fn pair_validation() {
        assert!(ModulePair::parse("FirstResponseTime", "Plus_5").is_ok());
        assert!(ModulePair::parse("UpdateTime", "SolutionTime").is_ok());
        assert!(ModulePair::parse("DynamicField_A", "DynamicField_B").is_ok());
        assert!(ModulePair::parse("DynamicField_A", "Plus_60").is_ok());
        assert!(ModulePair::parse("PendingTime", "Plus_60").is_ok());

        assert!(ModulePair::parse("Plus_5", "Plus_5").is_err());
        assert!(ModulePair::parse("PendingTime", "PendingTime").is_err());
        assert!(ModulePair::parse("PendingTime", "DynamicField_A").is_err());
        assert!(ModulePair::parse("FirstResponseTime", "DynamicField_A").is_err());
        assert!(ModulePair::parse("DynamicField_A", "SolutionTime").is_err());
        assert!(ModulePair::parse("FirstResponseTime", "PendingTime").is_err());
    }

    #[test]
    fn rule_modules_surface_config_errors() {
        let rule = Rule::new(ulid::Ulid::new(), "Tomorrow", "Plus_5");
        let err = rule.modules().unwrap_err();
        assert!(err.is_config());
        assert!(err.to_string().contains("unknown time module"));
    }

    #[test]
    fn escalation_reads_deadline() {
        let t = ticket();
        let first = TimeModule::Escalation(Escalation::FirstResponse);
        assert_eq!(resolve(&first, &t, None), Ok(1_000_000));
        let update = TimeModule::Escalation(Escalation::Update);
        assert!(resolve(&update, &t, None).is_err());
    }

    #[test]
    fn relative_offset_needs_counterpart() {
        let t = ticket();
        let plus = TimeModule::RelativeOffset { minutes: 15 };
        assert_eq!(resolve(&plus, &t, Some(60_000)), Ok(60_000 + 15 * MINUTE_MS));
        assert!(resolve(&plus, &t, None).is_err());
    }

    #[test]
    fn dynamic_field_requires_date_value() {
        let t = ticket();
        let start = TimeModule::DynamicField("Start".into());
        assert_eq!(resolve(&start, &t, None), Ok(parse_datetime("2016-01-01 00:00:00").unwrap()));
        let day = TimeModule::DynamicField("Day".into());
        assert!(resolve(&day, &t, None).is_ok());
        let note = TimeModule::DynamicField("Note".into());
        assert_eq!(resolve(&note, &t, None).unwrap_err().reason, "field does not hold a date");
        let missing = TimeModule::DynamicField("Missing".into());
        assert_eq!(resolve(&missing, &t, None).unwrap_err().reason, "field is not set");
    }

    #[test]
    fn pending_time() {
        let mut t = ticket();
        assert_eq!(resolve(&TimeModule::PendingTime, &t, None), Ok(5_000_000));
        t.pending_until = None;
        let err = resolve(&TimeModule::PendingTime, &t, None).unwrap_err();
        assert_eq!(err.module, "PendingTime");
    }

    #[test]
    fn reversibility() {
        assert!(TimeModule::DynamicField("X".into()).is_reversible());
        assert!(TimeModule::PendingTime.is_reversible());
        assert!(!TimeModule::Escalation(Escalation::Solution).is_reversible());
        assert!(!TimeModule::RelativeOffset { minutes: 5 }.is_reversible());
    }
}
