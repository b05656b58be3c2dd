//! Rule and appointment storage.
//!
//! Calendars, their ordered rules and their appointments live in memory behind
//! per-calendar `RwLock`s and are persisted as an event journal. Every
//! mutation is journaled (group commit) before it is applied and broadcast.

mod appointments;
mod error;
mod rules;

pub use error::StoreError;

use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock, mpsc, oneshot, watch};
use tracing::{info, warn};
use ulid::Ulid;

use crate::model::*;
use crate::notify::NotifyHub;
use crate::wal::Wal;

pub type SharedCalendarState = Arc<RwLock<CalendarState>>;

/// Shared hold on the maintenance lock for the length of one mutation.
pub(super) type MutationGate = OwnedRwLockReadGuard<()>;

/// Appointment side of the calendar store, as the reconciler sees it.
#[async_trait]
pub trait AppointmentStore: Send + Sync {
    /// Appointments of a calendar, optionally only those derived from `rule_id`.
    async fn list_appointments(&self, calendar_id: Ulid, rule_id: Option<Ulid>)
    -> Result<Vec<Appointment>, StoreError>;
    async fn ticket_appointments(&self, ticket_id: TicketId) -> Result<Vec<Appointment>, StoreError>;
    async fn create_appointment(&self, appointment: Appointment) -> Result<(), StoreError>;
    async fn update_appointment(
        &self,
        id: Ulid,
        patch: AppointmentPatch,
        origin: EditOrigin,
    ) -> Result<Appointment, StoreError>;
    async fn delete_appointment(&self, id: Ulid) -> Result<(), StoreError>;
}

#[async_trait]
pub trait RuleStore: Send + Sync {
    async fn list_active_rules(&self) -> Result<Vec<Rule>, StoreError>;
    async fn get_rule(&self, id: Ulid) -> Result<Option<Rule>, StoreError>;
    async fn calendar_ids(&self) -> Result<Vec<Ulid>, StoreError>;
}

// ── Group-commit journal writer ──────────────────────────────────

enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

type PendingAppend = (Event, oneshot::Sender<io::Result<()>>);

/// Owns the journal. Takes the first append, drains whatever else is already
/// queued, and commits the lot with a single fsync.
async fn wal_writer_loop(mut wal: Wal<Event>, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let (event, response) = match cmd {
            WalCommand::Append { event, response } => (event, response),
            other => {
                handle_control(&mut wal, other);
                continue;
            }
        };
        let mut batch: Vec<PendingAppend> = vec![(event, response)];
        let mut deferred = None;
        while let Ok(next) = rx.try_recv() {
            match next {
                WalCommand::Append { event, response } => batch.push((event, response)),
                other => {
                    deferred = Some(other);
                    break;
                }
            }
        }
        commit_batch(&mut wal, batch);
        if let Some(cmd) = deferred {
            handle_control(&mut wal, cmd);
        }
    }
}

fn commit_batch(wal: &mut Wal<Event>, batch: Vec<PendingAppend>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let started = std::time::Instant::now();
    let appended = batch.iter().try_for_each(|(event, _)| wal.append_buffered(event));
    // Flush even after a failed append so half-written bytes don't bleed into
    // the next batch.
    let flushed = wal.flush_sync();
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS).record(started.elapsed().as_secs_f64());
    let outcome = appended.and(flushed);
    for (_, tx) in batch {
        let reply = match &outcome {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(reply);
    }
}

fn handle_control(wal: &mut Wal<Event>, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let _ = response.send(wal.compact(&events));
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!("appends are batched by the writer loop"),
    }
}

// ── Store ────────────────────────────────────────────────────────

pub struct CalendarStore {
    calendars: Arc<DashMap<Ulid, SharedCalendarState>>,
    wal_tx: mpsc::Sender<WalCommand>,
    pub notify: Arc<NotifyHub>,
    /// rule id → calendar id
    rule_index: Arc<DashMap<Ulid, Ulid>>,
    /// appointment id → calendar id
    appointment_index: Arc<DashMap<Ulid, Ulid>>,
    /// Mutations hold this shared for their whole run (taken before any
    /// calendar lock, released when their commit finishes); compaction holds
    /// it exclusively.
    maintenance: Arc<RwLock<()>>,
}

/// Apply an event to a calendar (caller holds the write lock).
fn apply_to_calendar(
    cal: &mut CalendarState,
    event: &Event,
    rule_index: &DashMap<Ulid, Ulid>,
    appointment_index: &DashMap<Ulid, Ulid>,
) {
    match event {
        Event::RuleAdded { rule } | Event::RuleUpdated { rule } => {
            rule_index.insert(rule.id, rule.calendar_id);
            cal.upsert_rule(rule.clone());
        }
        Event::RuleRemoved { id, .. } => {
            cal.remove_rule(*id);
            rule_index.remove(id);
        }
        Event::AppointmentCreated { appointment } => {
            appointment_index.insert(appointment.id, appointment.calendar_id);
            cal.insert_appointment(appointment.clone());
        }
        Event::AppointmentUpdated { appointment, .. } => {
            // Start may have moved; reinsert to keep the start order.
            appointment_index.insert(appointment.id, appointment.calendar_id);
            cal.remove_appointment(appointment.id);
            cal.insert_appointment(appointment.clone());
        }
        Event::AppointmentDeleted { id, .. } => {
            cal.remove_appointment(*id);
            appointment_index.remove(id);
        }
        // Calendar lifecycle is handled at the map level.
        Event::CalendarCreated { .. } | Event::CalendarDeleted { .. } => {}
    }
}

fn forget_calendar_entities(
    cal: &CalendarState,
    rule_index: &DashMap<Ulid, Ulid>,
    appointment_index: &DashMap<Ulid, Ulid>,
) {
    for rule in &cal.rules {
        rule_index.remove(&rule.id);
    }
    for appointment in &cal.appointments {
        appointment_index.remove(&appointment.id);
    }
}

/// Handles to everything a commit touches. Commits run on their own task so
/// that an event handed to the journal is always applied to memory, even when
/// the caller's future is dropped midway (e.g. by a timeout).
#[derive(Clone)]
struct Committer {
    wal_tx: mpsc::Sender<WalCommand>,
    calendars: Arc<DashMap<Ulid, SharedCalendarState>>,
    rule_index: Arc<DashMap<Ulid, Ulid>>,
    appointment_index: Arc<DashMap<Ulid, Ulid>>,
    notify: Arc<NotifyHub>,
}

impl Committer {
    async fn wal_append(&self, event: &Event) -> Result<(), StoreError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| StoreError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| StoreError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| StoreError::WalError(e.to_string()))
    }

    /// `cal` is the write-locked calendar the event belongs to; calendar
    /// creation has none.
    fn apply(&self, cal: Option<&mut CalendarState>, event: &Event) {
        match (event, cal) {
            (Event::CalendarCreated { id, name }, _) => {
                self.calendars
                    .insert(*id, Arc::new(RwLock::new(CalendarState::new(*id, name.clone()))));
            }
            (Event::CalendarDeleted { id }, cal) => {
                self.calendars.remove(id);
                if let Some(cal) = cal {
                    forget_calendar_entities(cal, &self.rule_index, &self.appointment_index);
                }
            }
            (other, Some(cal)) => apply_to_calendar(cal, other, &self.rule_index, &self.appointment_index),
            (other, None) => warn!(calendar_id = %other.calendar_id(), "event committed without its calendar lock"),
        }
    }
}

impl CalendarStore {
    /// Replay the journal at `wal_path` and start its writer task.
    /// Must be called from within a Tokio runtime.
    pub fn open(wal_path: PathBuf, notify: Arc<NotifyHub>) -> io::Result<Self> {
        let events = Wal::<Event>::replay(&wal_path)?;
        let wal = Wal::<Event>::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let store = Self {
            calendars: Arc::new(DashMap::new()),
            wal_tx,
            notify,
            rule_index: Arc::new(DashMap::new()),
            appointment_index: Arc::new(DashMap::new()),
            maintenance: Arc::new(RwLock::new(())),
        };
        for event in &events {
            store.replay_event(event);
        }
        info!(
            events = events.len(),
            calendars = store.calendars.len(),
            rules = store.rule_index.len(),
            appointments = store.appointment_index.len(),
            "calendar store replayed"
        );
        Ok(store)
    }

    // Sole owner of every Arc during replay, so try_write never contends.
    // blocking_write would panic inside the runtime.
    fn replay_event(&self, event: &Event) {
        match event {
            Event::CalendarCreated { id, name } => {
                self.calendars
                    .insert(*id, Arc::new(RwLock::new(CalendarState::new(*id, name.clone()))));
            }
            Event::CalendarDeleted { id } => {
                if let Some((_, cal)) = self.calendars.remove(id) {
                    let guard = cal.try_read().expect("replay: uncontended read");
                    forget_calendar_entities(&guard, &self.rule_index, &self.appointment_index);
                }
            }
            other => {
                if let Some(entry) = self.calendars.get(&other.calendar_id()) {
                    let cal = entry.value().clone();
                    let mut guard = cal.try_write().expect("replay: uncontended write");
                    apply_to_calendar(&mut guard, other, &self.rule_index, &self.appointment_index);
                }
            }
        }
    }

    fn committer(&self) -> Committer {
        Committer {
            wal_tx: self.wal_tx.clone(),
            calendars: self.calendars.clone(),
            rule_index: self.rule_index.clone(),
            appointment_index: self.appointment_index.clone(),
            notify: self.notify.clone(),
        }
    }

    pub fn get_calendar(&self, id: &Ulid) -> Option<SharedCalendarState> {
        self.calendars.get(id).map(|e| e.value().clone())
    }

    fn calendar_or_not_found(&self, id: Ulid) -> Result<SharedCalendarState, StoreError> {
        self.get_calendar(&id).ok_or(StoreError::NotFound(id))
    }

    pub(super) async fn begin_mutation(&self) -> MutationGate {
        self.maintenance.clone().read_owned().await
    }

    /// Journal, apply, broadcast. The mutation gate and the calendar lock move
    /// into the commit task and are released once the event is applied.
    pub(super) async fn persist_and_apply(
        &self,
        gate: MutationGate,
        cal: Option<OwnedRwLockWriteGuard<CalendarState>>,
        event: Event,
    ) -> Result<(), StoreError> {
        let committer = self.committer();
        let commit = tokio::spawn(async move {
            let _gate = gate;
            let mut cal = cal;
            committer.wal_append(&event).await?;
            committer.apply(cal.as_deref_mut(), &event);
            committer.notify.send(&event);
            Ok::<(), StoreError>(())
        });
        commit
            .await
            .map_err(|e| StoreError::WalError(format!("commit task failed: {e}")))?
    }

    /// Look up which calendar owns `entity_id` in `index` and write-lock it.
    pub(super) async fn lock_owner(
        &self,
        index: &DashMap<Ulid, Ulid>,
        entity_id: Ulid,
    ) -> Result<OwnedRwLockWriteGuard<CalendarState>, StoreError> {
        let calendar_id = index
            .get(&entity_id)
            .map(|e| *e.value())
            .ok_or(StoreError::NotFound(entity_id))?;
        let cal = self.calendar_or_not_found(calendar_id)?;
        Ok(cal.write_owned().await)
    }

    /// Rewrite the journal with just the events that recreate current state.
    pub async fn compact_wal(&self) -> Result<(), StoreError> {
        let _exclusive = self.maintenance.write().await;
        let mut events = Vec::new();
        let calendars: Vec<SharedCalendarState> = self.calendars.iter().map(|e| e.value().clone()).collect();
        for cal in calendars {
            let guard = cal.read().await;
            events.push(Event::CalendarCreated {
                id: guard.id,
                name: guard.name.clone(),
            });
            events.extend(guard.rules.iter().map(|rule| Event::RuleAdded { rule: rule.clone() }));
            events.extend(guard.appointments.iter().map(|a| Event::AppointmentCreated {
                appointment: a.clone(),
            }));
        }

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| StoreError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| StoreError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| StoreError::WalError(e.to_string()))
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}

/// Background task that compacts the journal once enough appends pile up.
pub async fn run_compactor(store: Arc<CalendarStore>, threshold: u64, mut shutdown: watch::Receiver<bool>) {
    let mut interval = tokio::time::interval(Duration::from_secs(30));
    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            _ = interval.tick() => {
                let appends = store.wal_appends_since_compact().await;
                if appends < threshold {
                    continue;
                }
                match store.compact_wal().await {
                    Ok(()) => info!(appends, "compacted journal"),
                    Err(e) => warn!("journal compaction failed: {e}"),
                }
            }
        }
    }
}
