//! Daemon configuration from `TICKETSYNC_*` environment variables, and the
//! JSON rule definitions a deployment can seed the rule store with.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;
use tracing::{info, warn};
use ulid::Ulid;

use crate::driver::SchedulerConfig;
use crate::model::{QueueId, Rule};
use crate::reconcile::TitleFormat;
use crate::store::{CalendarStore, StoreError};

const JOURNAL_FILE: &str = "calendars.wal";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub data_dir: PathBuf,
    pub interval: Duration,
    pub workers: usize,
    pub rule_timeout: Duration,
    pub compact_threshold: u64,
    pub ticket_hook: String,
    pub ticket_hook_divider: String,
    pub tickets_file: Option<PathBuf>,
    pub rules_file: Option<PathBuf>,
    pub metrics_port: Option<u16>,
}

impl Default for Config {
    fn default() -> Self {
        let title = TitleFormat::default();
        let scheduler = SchedulerConfig::default();
        Self {
            data_dir: PathBuf::from("./data"),
            interval: scheduler.interval,
            workers: scheduler.workers,
            rule_timeout: scheduler.rule_timeout,
            compact_threshold: 1000,
            ticket_hook: title.hook,
            ticket_hook_divider: title.divider,
            tickets_file: None,
            rules_file: None,
            metrics_port: None,
        }
    }
}

fn parsed<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, name: &str, default: T) -> T {
    match lookup(name) {
        Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
            warn!("ignoring unparseable {name}={raw:?}");
            default
        }),
        None => default,
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from any variable source. Unset or unparseable values fall back
    /// to the defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        Self {
            data_dir: lookup("TICKETSYNC_DATA_DIR").map_or(defaults.data_dir, PathBuf::from),
            interval: Duration::from_secs(
                parsed(&lookup, "TICKETSYNC_INTERVAL_SECS", defaults.interval.as_secs()).max(1),
            ),
            workers: parsed(&lookup, "TICKETSYNC_WORKERS", defaults.workers).max(1),
            rule_timeout: Duration::from_secs(parsed(
                &lookup,
                "TICKETSYNC_RULE_TIMEOUT_SECS",
                defaults.rule_timeout.as_secs(),
            )),
            compact_threshold: parsed(&lookup, "TICKETSYNC_COMPACT_THRESHOLD", defaults.compact_threshold),
            ticket_hook: lookup("TICKETSYNC_TICKET_HOOK").unwrap_or(defaults.ticket_hook),
            ticket_hook_divider: lookup("TICKETSYNC_TICKET_HOOK_DIVIDER").unwrap_or(defaults.ticket_hook_divider),
            tickets_file: lookup("TICKETSYNC_TICKETS_FILE").map(PathBuf::from),
            rules_file: lookup("TICKETSYNC_RULES_FILE").map(PathBuf::from),
            metrics_port: lookup("TICKETSYNC_METRICS_PORT").and_then(|s| s.trim().parse().ok()),
        }
    }

    pub fn journal_path(&self) -> PathBuf {
        self.data_dir.join(JOURNAL_FILE)
    }

    pub fn scheduler(&self) -> SchedulerConfig {
        SchedulerConfig {
            interval: self.interval,
            workers: self.workers,
            rule_timeout: self.rule_timeout,
            ..SchedulerConfig::default()
        }
    }

    pub fn title_format(&self) -> TitleFormat {
        TitleFormat {
            hook: self.ticket_hook.clone(),
            divider: self.ticket_hook_divider.clone(),
        }
    }
}

/// A rule as written in a rules file. The target calendar is named and is
/// created on first use.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RuleDefinition {
    pub id: Ulid,
    pub calendar: String,
    #[serde(default)]
    pub queue_id: Option<QueueId>,
    #[serde(default)]
    pub search: BTreeMap<String, String>,
    pub start_module: String,
    pub end_module: String,
    #[serde(default = "enabled")]
    pub active: bool,
}

fn enabled() -> bool {
    true
}

impl RuleDefinition {
    fn to_rule(&self, calendar_id: Ulid) -> Rule {
        Rule {
            id: self.id,
            calendar_id,
            queue_id: self.queue_id,
            search: self.search.clone(),
            start_module: self.start_module.clone(),
            end_module: self.end_module.clone(),
            active: self.active,
            revision: 0,
        }
    }
}

pub fn load_rule_definitions(path: &Path) -> std::io::Result<Vec<RuleDefinition>> {
    let bytes = std::fs::read(path)?;
    serde_json::from_slice(&bytes).map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
}

/// Upsert `definitions` into `store`, creating named calendars as needed.
/// Definitions identical to the stored rule are left alone so their revision
/// doesn't move. Returns how many rules were written.
pub async fn apply_rule_definitions(store: &CalendarStore, definitions: &[RuleDefinition]) -> Result<usize, StoreError> {
    let mut calendars: BTreeMap<String, Ulid> = store
        .list_calendars()
        .await
        .into_iter()
        .map(|c| (c.name, c.id))
        .collect();
    let mut written = 0;
    for definition in definitions {
        let calendar_id = match calendars.get(&definition.calendar) {
            Some(id) => *id,
            None => {
                let id = Ulid::new();
                store.create_calendar(id, definition.calendar.clone()).await?;
                info!(calendar_id = %id, name = %definition.calendar, "created calendar");
                calendars.insert(definition.calendar.clone(), id);
                id
            }
        };
        let mut rule = definition.to_rule(calendar_id);
        if let Some(current) = store.rule(rule.id).await {
            rule.revision = current.revision;
            if current == rule {
                continue;
            }
        }
        store.upsert_rule(rule).await?;
        written += 1;
    }
    Ok(written)
}
