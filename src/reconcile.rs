//! Converges a calendar's ticket-derived appointments onto a rule's matches.
//!
//! One pass per rule: search, resolve start/end for every match, then create,
//! move or delete appointments tagged with the rule until there is exactly one
//! per resolvable matching ticket. Tickets are only read here.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, info, warn};
use ulid::Ulid;

use crate::cache::{CacheKey, CacheService};
use crate::error::SyncError;
use crate::limits::{MAX_TITLE_LEN, MAX_VALID_TIMESTAMP_MS, MIN_VALID_TIMESTAMP_MS};
use crate::matcher::TicketMatcher;
use crate::model::*;
use crate::module::{ModulePair, resolve};
use crate::store::{AppointmentStore, StoreError};
use crate::tickets::TicketService;

/// How ticket-derived appointment titles are rendered:
/// `<hook><divider><number>: <title>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TitleFormat {
    pub hook: String,
    pub divider: String,
}

impl Default for TitleFormat {
    fn default() -> Self {
        Self {
            hook: "Ticket#".into(),
            divider: String::new(),
        }
    }
}

impl TitleFormat {
    pub fn render(&self, ticket: &Ticket) -> String {
        let mut title = format!("{}{}{}: {}", self.hook, self.divider, ticket.number, ticket.title);
        if title.len() > MAX_TITLE_LEN {
            let mut cut = MAX_TITLE_LEN;
            while !title.is_char_boundary(cut) {
                cut -= 1;
            }
            title.truncate(cut);
        }
        title
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReconcileStats {
    pub created: usize,
    pub updated: usize,
    pub deleted: usize,
    /// Matched tickets whose start or end could not be resolved, or whose
    /// appointment the store refused.
    pub skipped: usize,
}

impl ReconcileStats {
    pub fn changed(&self) -> usize {
        self.created + self.updated + self.deleted
    }

    pub fn absorb(&mut self, other: ReconcileStats) {
        self.created += other.created;
        self.updated += other.updated;
        self.deleted += other.deleted;
        self.skipped += other.skipped;
    }
}

/// What one matched ticket should look like on the calendar.
struct Desired {
    title: String,
    start: Ms,
    end: Ms,
}

pub struct Reconciler {
    tickets: Arc<dyn TicketService>,
    matcher: TicketMatcher,
    appointments: Arc<dyn AppointmentStore>,
    cache: Arc<dyn CacheService>,
    title: TitleFormat,
}

impl Reconciler {
    pub fn new(
        tickets: Arc<dyn TicketService>,
        matcher: TicketMatcher,
        appointments: Arc<dyn AppointmentStore>,
        cache: Arc<dyn CacheService>,
        title: TitleFormat,
    ) -> Self {
        Self {
            tickets,
            matcher,
            appointments,
            cache,
            title,
        }
    }

    /// One full pass for `rule`. Changes made before a failure still
    /// invalidate the calendar's cached list.
    pub async fn reconcile(&self, rule: &Rule) -> Result<ReconcileStats, SyncError> {
        let started = Instant::now();
        let mut stats = ReconcileStats::default();
        let outcome = self.full_pass(rule, &mut stats).await;
        self.finish(rule.calendar_id, &stats);
        metrics::histogram!(crate::observability::RECONCILE_DURATION_SECONDS)
            .record(started.elapsed().as_secs_f64());
        let matched = outcome?;
        if stats.changed() > 0 {
            info!(
                rule_id = %rule.id,
                calendar_id = %rule.calendar_id,
                matched,
                created = stats.created,
                updated = stats.updated,
                deleted = stats.deleted,
                skipped = stats.skipped,
                "rule reconciled"
            );
        } else {
            debug!(rule_id = %rule.id, matched, skipped = stats.skipped, "rule already in sync");
        }
        Ok(stats)
    }

    async fn full_pass(&self, rule: &Rule, stats: &mut ReconcileStats) -> Result<usize, SyncError> {
        let modules = rule.modules()?;
        let matched = self.matcher.match_rule(rule).await?;
        let mut existing = self.existing_by_ticket(rule, stats).await?;

        for &ticket_id in &matched {
            let current = existing.remove(&ticket_id);
            self.converge_ticket(rule, &modules, ticket_id, current, stats)
                .await?;
        }
        // Whatever is left dropped out of the match set.
        let mut leftovers: Vec<Appointment> = existing.into_values().collect();
        leftovers.sort_by_key(|a| a.ticket_id());
        for appointment in leftovers {
            self.appointments.delete_appointment(appointment.id).await?;
            stats.deleted += 1;
        }
        Ok(matched.len())
    }

    /// Converge only `ticket_id`'s appointment for `rule`, e.g. after the
    /// ticket changed.
    ///
    /// A hook for embedders that receive ticket-update events. The daemon has
    /// no such event source and relies on the scheduled full passes.
    pub async fn reconcile_ticket(&self, rule: &Rule, ticket_id: TicketId) -> Result<ReconcileStats, SyncError> {
        let mut stats = ReconcileStats::default();
        let outcome = self.ticket_pass(rule, ticket_id, &mut stats).await;
        self.finish(rule.calendar_id, &stats);
        outcome.map(|()| stats)
    }

    async fn ticket_pass(&self, rule: &Rule, ticket_id: TicketId, stats: &mut ReconcileStats) -> Result<(), SyncError> {
        let modules = rule.modules()?;
        let mut existing = self.existing_by_ticket(rule, stats).await?;
        let current = existing.remove(&ticket_id);
        if self.matcher.matches(rule, ticket_id).await? {
            self.converge_ticket(rule, &modules, ticket_id, current, stats)
                .await
        } else {
            if let Some(appointment) = current {
                self.appointments.delete_appointment(appointment.id).await?;
                stats.deleted += 1;
            }
            Ok(())
        }
    }

    /// Drop the cached appointment list of a calendar, for callers that
    /// abandoned a pass midway.
    pub fn invalidate_calendar(&self, calendar_id: Ulid) {
        self.cache.invalidate(&CacheKey::AppointmentList(calendar_id));
    }

    /// Delete ticket-derived appointments in `calendar_id` whose rule is not
    /// in `live_rules`.
    pub async fn sweep_orphans(&self, calendar_id: Ulid, live_rules: &HashSet<Ulid>) -> Result<usize, SyncError> {
        let appointments = self.appointments.list_appointments(calendar_id, None).await?;
        let mut deleted = 0;
        for appointment in appointments {
            let Some(rule_id) = appointment.rule_id() else { continue };
            if live_rules.contains(&rule_id) {
                continue;
            }
            self.appointments.delete_appointment(appointment.id).await?;
            deleted += 1;
        }
        if deleted > 0 {
            self.cache.invalidate(&CacheKey::AppointmentList(calendar_id));
            metrics::counter!(crate::observability::APPOINTMENTS_DELETED_TOTAL).increment(deleted as u64);
            info!(calendar_id = %calendar_id, deleted, "swept appointments of removed or inactive rules");
        }
        Ok(deleted)
    }

    /// Delete every ticket-derived appointment of a deleted ticket.
    ///
    /// A hook for embedders that receive ticket-deleted events. Without one,
    /// the next full pass of each rule deletes these appointments too.
    pub async fn purge_ticket(&self, ticket_id: TicketId) -> Result<usize, SyncError> {
        let appointments = self.appointments.ticket_appointments(ticket_id).await?;
        let mut calendars = HashSet::new();
        for appointment in &appointments {
            self.appointments.delete_appointment(appointment.id).await?;
            calendars.insert(appointment.calendar_id);
        }
        for calendar_id in calendars {
            self.cache.invalidate(&CacheKey::AppointmentList(calendar_id));
        }
        if !appointments.is_empty() {
            metrics::counter!(crate::observability::APPOINTMENTS_DELETED_TOTAL)
                .increment(appointments.len() as u64);
            info!(ticket_id, deleted = appointments.len(), "purged appointments of deleted ticket");
        }
        Ok(appointments.len())
    }

    /// The rule's appointments keyed by ticket. Duplicates for the same ticket
    /// are deleted here so the pair stays unique.
    async fn existing_by_ticket(
        &self,
        rule: &Rule,
        stats: &mut ReconcileStats,
    ) -> Result<HashMap<TicketId, Appointment>, SyncError> {
        let mut by_ticket: HashMap<TicketId, Appointment> = HashMap::new();
        let listed = self
            .appointments
            .list_appointments(rule.calendar_id, Some(rule.id))
            .await?;
        for appointment in listed {
            let Some(ticket_id) = appointment.ticket_id() else { continue };
            if by_ticket.contains_key(&ticket_id) {
                warn!(rule_id = %rule.id, ticket_id, appointment_id = %appointment.id, "deleting duplicate ticket appointment");
                self.appointments.delete_appointment(appointment.id).await?;
                stats.deleted += 1;
                continue;
            }
            by_ticket.insert(ticket_id, appointment);
        }
        Ok(by_ticket)
    }

    /// Resolve one matched ticket and create or move its appointment. An
    /// unresolvable or vanished ticket leaves `current` alone, except that a
    /// vanished ticket's appointment is deleted.
    async fn converge_ticket(
        &self,
        rule: &Rule,
        modules: &ModulePair,
        ticket_id: TicketId,
        current: Option<Appointment>,
        stats: &mut ReconcileStats,
    ) -> Result<(), SyncError> {
        let Some(ticket) = self.tickets.get_ticket(ticket_id).await? else {
            if let Some(appointment) = current {
                self.appointments.delete_appointment(appointment.id).await?;
                stats.deleted += 1;
            }
            return Ok(());
        };
        let Some(desired) = self.desired(rule, modules, &ticket) else {
            stats.skipped += 1;
            return Ok(());
        };

        match current {
            None => {
                let appointment = Appointment {
                    id: Ulid::new(),
                    calendar_id: rule.calendar_id,
                    title: desired.title,
                    start: desired.start,
                    end: desired.end,
                    source: Some(TicketSource {
                        rule_id: rule.id,
                        ticket_id,
                    }),
                };
                match self.appointments.create_appointment(appointment).await {
                    Ok(()) => stats.created += 1,
                    Err(e) => refused(rule, ticket_id, e, stats)?,
                }
            }
            Some(appointment)
                if appointment.start != desired.start
                    || appointment.end != desired.end
                    || appointment.title != desired.title =>
            {
                let patch = AppointmentPatch {
                    title: Some(desired.title),
                    start: desired.start,
                    end: desired.end,
                };
                match self
                    .appointments
                    .update_appointment(appointment.id, patch, EditOrigin::Reconciler)
                    .await
                {
                    Ok(_) => stats.updated += 1,
                    Err(e) => refused(rule, ticket_id, e, stats)?,
                }
            }
            Some(_) => {}
        }
        Ok(())
    }

    fn desired(&self, rule: &Rule, modules: &ModulePair, ticket: &Ticket) -> Option<Desired> {
        let resolved = resolve(&modules.start, ticket, None)
            .and_then(|start| resolve(&modules.end, ticket, Some(start)).map(|end| (start, end)));
        let (start, end) = match resolved {
            Ok(times) => times,
            Err(e) => {
                debug!(rule_id = %rule.id, ticket_id = ticket.id, "skipping ticket: {e}");
                return None;
            }
        };
        if end < start {
            debug!(rule_id = %rule.id, ticket_id = ticket.id, "skipping ticket: end resolves before start");
            return None;
        }
        if start < MIN_VALID_TIMESTAMP_MS || end > MAX_VALID_TIMESTAMP_MS {
            debug!(rule_id = %rule.id, ticket_id = ticket.id, "skipping ticket: times out of range");
            return None;
        }
        Some(Desired {
            title: self.title.render(ticket),
            start,
            end,
        })
    }

    fn finish(&self, calendar_id: Ulid, stats: &ReconcileStats) {
        if stats.changed() > 0 {
            self.cache.invalidate(&CacheKey::AppointmentList(calendar_id));
        }
        metrics::counter!(crate::observability::APPOINTMENTS_CREATED_TOTAL).increment(stats.created as u64);
        metrics::counter!(crate::observability::APPOINTMENTS_UPDATED_TOTAL).increment(stats.updated as u64);
        metrics::counter!(crate::observability::APPOINTMENTS_DELETED_TOTAL).increment(stats.deleted as u64);
        metrics::counter!(crate::observability::TICKETS_SKIPPED_TOTAL).increment(stats.skipped as u64);
    }
}

/// A write the store refused for this ticket alone is a skip; anything else
/// fails the pass.
fn refused(rule: &Rule, ticket_id: TicketId, e: StoreError, stats: &mut ReconcileStats) -> Result<(), SyncError> {
    if !e.is_rejection() {
        return Err(e.into());
    }
    warn!(rule_id = %rule.id, ticket_id, "skipping ticket: store refused its appointment: {e}");
    stats.skipped += 1;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::cache::MemoryCache;
    use crate::notify::NotifyHub;
    use crate::store::CalendarStore;
    use crate::tickets::MemoryTickets;

    struct Fixture {
        store: Arc<CalendarStore>,
        tickets: Arc<MemoryTickets>,
        cache: Arc<MemoryCache>,
        reconciler: Reconciler,
        calendar_id: Ulid,
    }

    fn wal_path(name: &str) -> std::path::PathBuf {
        let dir = std::env::temp_dir().join("ticketsync_test_reconcile");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    async fn fixture(name: &str) -> Fixture {
        let store = Arc::new(CalendarStore::open(wal_path(name), Arc::new(NotifyHub::new())).unwrap());
        let tickets = Arc::new(MemoryTickets::new());
        let cache = Arc::new(MemoryCache::new());
        let reconciler = Reconciler::new(
            tickets.clone(),
            TicketMatcher::new(tickets.clone()),
            store.clone(),
            cache.clone(),
            TitleFormat::default(),
        );
        let calendar_id = Ulid::new();
        store.create_calendar(calendar_id, "Support".into()).await.unwrap();
        Fixture {
            store,
            tickets,
            cache,
            reconciler,
            calendar_id,
        }
    }

    fn escalated(id: TicketId, title: &str, first_response: Ms) -> Ticket {
        Ticket {
            id,
            number: format!("201601011000{id:04}"),
            title: title.into(),
            queue_id: 1,
            escalations: Escalations {
                first_response: Some(first_response),
                update: Some(first_response + 10 * MINUTE_MS),
                solution: None,
            },
            ..Default::default()
        }
    }

    async fn rule(f: &Fixture, start: &str, end: &str) -> Rule {
        f.store
            .add_rule(Rule::new(f.calendar_id, start, end).with_search("Title", "Sync*"))
            .await
            .unwrap()
    }

    #[test]
    fn title_rendering() {
        let ticket = escalated(7, "Sync me", 0);
        assert_eq!(TitleFormat::default().render(&ticket), "Ticket#2016010110000007: Sync me");
        let custom = TitleFormat {
            hook: "Req".into(),
            divider: "-".into(),
        };
        assert_eq!(custom.render(&ticket), "Req-2016010110000007: Sync me");

        let long = escalated(8, &"é".repeat(400), 0);
        let rendered = TitleFormat::default().render(&long);
        assert!(rendered.len() <= MAX_TITLE_LEN);
    }

    #[tokio::test]
    async fn creates_one_appointment_per_match() {
        let f = fixture("creates.wal").await;
        f.tickets.upsert(escalated(1, "Sync one", 1_000 * MINUTE_MS));
        f.tickets.upsert(escalated(2, "Sync two", 2_000 * MINUTE_MS));
        f.tickets.upsert(escalated(3, "Unrelated", 3_000 * MINUTE_MS));
        let rule = rule(&f, "FirstResponseTime", "Plus_5").await;

        let stats = f.reconciler.reconcile(&rule).await.unwrap();
        assert_eq!(stats, ReconcileStats { created: 2, ..Default::default() });

        let appointments = f.store.appointments(f.calendar_id, Some(rule.id)).await.unwrap();
        assert_eq!(appointments.len(), 2);
        assert_eq!(appointments[0].ticket_id(), Some(1));
        assert_eq!(appointments[0].start, 1_000 * MINUTE_MS);
        assert_eq!(appointments[0].end, 1_005 * MINUTE_MS);
        assert_eq!(appointments[0].title, "Ticket#2016010110000001: Sync one");
    }

    #[tokio::test]
    async fn second_pass_is_a_no_op() {
        let f = fixture("idempotent.wal").await;
        f.tickets.upsert(escalated(1, "Sync one", 1_000 * MINUTE_MS));
        let rule = rule(&f, "FirstResponseTime", "Plus_5").await;
        f.reconciler.reconcile(&rule).await.unwrap();
        let generation = f.cache.generation(&CacheKey::AppointmentList(f.calendar_id));

        let stats = f.reconciler.reconcile(&rule).await.unwrap();
        assert_eq!(stats.changed(), 0);
        assert_eq!(f.cache.generation(&CacheKey::AppointmentList(f.calendar_id)), generation);
    }

    #[tokio::test]
    async fn moved_deadline_updates_in_place() {
        let f = fixture("moves.wal").await;
        f.tickets.upsert(escalated(1, "Sync one", 1_000 * MINUTE_MS));
        let rule = rule(&f, "FirstResponseTime", "Plus_5").await;
        f.reconciler.reconcile(&rule).await.unwrap();
        let before = f.store.appointments(f.calendar_id, None).await.unwrap();

        f.tickets.modify(1, |t| t.escalations.first_response = Some(4_000 * MINUTE_MS));
        let stats = f.reconciler.reconcile(&rule).await.unwrap();
        assert_eq!(stats, ReconcileStats { updated: 1, ..Default::default() });

        let after = f.store.appointments(f.calendar_id, None).await.unwrap();
        assert_eq!(after[0].id, before[0].id);
        assert_eq!(after[0].start, 4_000 * MINUTE_MS);
        assert_eq!(after[0].end, 4_005 * MINUTE_MS);
    }

    #[tokio::test]
    async fn renamed_ticket_updates_title() {
        let f = fixture("rename.wal").await;
        f.tickets.upsert(escalated(1, "Sync one", 1_000 * MINUTE_MS));
        let rule = rule(&f, "FirstResponseTime", "Plus_5").await;
        f.reconciler.reconcile(&rule).await.unwrap();

        f.tickets.modify(1, |t| t.title = "Sync renamed".into());
        let stats = f.reconciler.reconcile(&rule).await.unwrap();
        assert_eq!(stats.updated, 1);
        let after = f.store.appointments(f.calendar_id, None).await.unwrap();
        assert!(after[0].title.ends_with("Sync renamed"));
    }

    #[tokio::test]
    async fn unresolvable_ticket_keeps_its_appointment() {
        let f = fixture("unresolvable.wal").await;
        f.tickets.upsert(escalated(1, "Sync one", 1_000 * MINUTE_MS));
        f.tickets.upsert(escalated(2, "Sync two", 2_000 * MINUTE_MS));
        let rule = rule(&f, "FirstResponseTime", "Plus_5").await;
        f.reconciler.reconcile(&rule).await.unwrap();

        f.tickets.modify(1, |t| t.escalations.first_response = None);
        let stats = f.reconciler.reconcile(&rule).await.unwrap();
        assert_eq!(stats, ReconcileStats { skipped: 1, ..Default::default() });
        assert_eq!(f.store.appointments(f.calendar_id, None).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn unresolvable_new_ticket_is_not_created() {
        let f = fixture("never_resolved.wal").await;
        let mut t = escalated(1, "Sync one", 0);
        t.escalations = Escalations::default();
        f.tickets.upsert(t);
        let rule = rule(&f, "FirstResponseTime", "Plus_5").await;
        let stats = f.reconciler.reconcile(&rule).await.unwrap();
        assert_eq!(stats, ReconcileStats { skipped: 1, ..Default::default() });
        assert!(f.store.appointments(f.calendar_id, None).await.unwrap().is_empty());
    }

    fn dated(id: TicketId, begin: &str, end: &str) -> Ticket {
        let mut ticket = escalated(id, "Sync dated", 0);
        for (field, at) in [("Begin", begin), ("End", end)] {
            ticket
                .dynamic_fields
                .insert(field.into(), FieldValue::DateTime(parse_datetime(at).unwrap()));
        }
        ticket
    }

    #[tokio::test]
    async fn out_of_range_ticket_does_not_block_later_ones() {
        let f = fixture("out_of_range.wal").await;
        f.tickets.upsert(dated(1, "1850-01-01 00:00:00", "1850-01-01 12:00:00"));
        f.tickets.upsert(dated(2, "2016-01-01 00:00:00", "2016-01-01 12:00:00"));
        let rule = rule(&f, "DynamicField_Begin", "DynamicField_End").await;

        let stats = f.reconciler.reconcile(&rule).await.unwrap();
        assert_eq!(stats, ReconcileStats { created: 1, skipped: 1, ..Default::default() });
        let appointments = f.store.appointments(f.calendar_id, None).await.unwrap();
        assert_eq!(appointments.len(), 1);
        assert_eq!(appointments[0].ticket_id(), Some(2));
        assert_eq!(appointments[0].start, parse_datetime("2016-01-01 00:00:00").unwrap());
    }

    /// Delegates to the real store but fails every write for one ticket.
    struct RefusingStore {
        inner: Arc<CalendarStore>,
        ticket_id: TicketId,
        refusal: fn() -> StoreError,
    }

    #[async_trait::async_trait]
    impl AppointmentStore for RefusingStore {
        async fn list_appointments(&self, calendar_id: Ulid, rule_id: Option<Ulid>) -> Result<Vec<Appointment>, StoreError> {
            AppointmentStore::list_appointments(&*self.inner, calendar_id, rule_id).await
        }

        async fn ticket_appointments(&self, ticket_id: TicketId) -> Result<Vec<Appointment>, StoreError> {
            AppointmentStore::ticket_appointments(&*self.inner, ticket_id).await
        }

        async fn create_appointment(&self, appointment: Appointment) -> Result<(), StoreError> {
            if appointment.ticket_id() == Some(self.ticket_id) {
                return Err((self.refusal)());
            }
            AppointmentStore::create_appointment(&*self.inner, appointment).await
        }

        async fn update_appointment(
            &self,
            id: Ulid,
            patch: AppointmentPatch,
            origin: EditOrigin,
        ) -> Result<Appointment, StoreError> {
            AppointmentStore::update_appointment(&*self.inner, id, patch, origin).await
        }

        async fn delete_appointment(&self, id: Ulid) -> Result<(), StoreError> {
            AppointmentStore::delete_appointment(&*self.inner, id).await
        }
    }

    fn refusing(f: &Fixture, ticket_id: TicketId, refusal: fn() -> StoreError) -> Reconciler {
        let store = RefusingStore {
            inner: f.store.clone(),
            ticket_id,
            refusal,
        };
        Reconciler::new(
            f.tickets.clone(),
            TicketMatcher::new(f.tickets.clone()),
            Arc::new(store),
            f.cache.clone(),
            TitleFormat::default(),
        )
    }

    #[tokio::test]
    async fn refused_appointment_is_skipped() {
        let f = fixture("refused.wal").await;
        f.tickets.upsert(escalated(1, "Sync one", 1_000 * MINUTE_MS));
        f.tickets.upsert(escalated(2, "Sync two", 2_000 * MINUTE_MS));
        let rule = rule(&f, "FirstResponseTime", "Plus_5").await;
        let reconciler = refusing(&f, 1, || StoreError::LimitExceeded("too many appointments on calendar"));

        let stats = reconciler.reconcile(&rule).await.unwrap();
        assert_eq!(stats, ReconcileStats { created: 1, skipped: 1, ..Default::default() });
        let appointments = f.store.appointments(f.calendar_id, None).await.unwrap();
        assert_eq!(appointments.len(), 1);
        assert_eq!(appointments[0].ticket_id(), Some(2));
    }

    #[tokio::test]
    async fn journal_failure_still_fails_the_pass() {
        let f = fixture("journal_failure.wal").await;
        f.tickets.upsert(escalated(1, "Sync one", 1_000 * MINUTE_MS));
        let rule = rule(&f, "FirstResponseTime", "Plus_5").await;
        let reconciler = refusing(&f, 1, || StoreError::WalError("disk full".into()));

        let err = reconciler.reconcile(&rule).await.unwrap_err();
        assert_eq!(err.kind(), "transient");
    }

    #[tokio::test]
    async fn dropped_match_is_deleted_and_restored() {
        let f = fixture("roundtrip.wal").await;
        f.tickets.upsert(escalated(1, "Sync one", 1_000 * MINUTE_MS));
        let rule = rule(&f, "FirstResponseTime", "Plus_5").await;
        f.reconciler.reconcile(&rule).await.unwrap();
        let original = f.store.appointments(f.calendar_id, None).await.unwrap();

        f.tickets.modify(1, |t| t.title = "Renamed away".into());
        let stats = f.reconciler.reconcile(&rule).await.unwrap();
        assert_eq!(stats, ReconcileStats { deleted: 1, ..Default::default() });
        assert!(f.store.appointments(f.calendar_id, None).await.unwrap().is_empty());

        f.tickets.modify(1, |t| t.title = "Sync one".into());
        let stats = f.reconciler.reconcile(&rule).await.unwrap();
        assert_eq!(stats.created, 1);
        let restored = f.store.appointments(f.calendar_id, None).await.unwrap();
        assert_eq!((restored[0].start, restored[0].end), (original[0].start, original[0].end));
    }

    #[tokio::test]
    async fn vanished_ticket_is_deleted() {
        let f = fixture("vanished.wal").await;
        f.tickets.upsert(escalated(1, "Sync one", 1_000 * MINUTE_MS));
        let rule = rule(&f, "FirstResponseTime", "Plus_5").await;
        f.reconciler.reconcile(&rule).await.unwrap();
        f.tickets.remove(1);
        let stats = f.reconciler.reconcile(&rule).await.unwrap();
        assert_eq!(stats.deleted, 1);
    }

    #[tokio::test]
    async fn two_rules_on_one_ticket_coexist() {
        let f = fixture("two_rules.wal").await;
        f.tickets.upsert(escalated(1, "Sync one", 1_000 * MINUTE_MS));
        let first = rule(&f, "FirstResponseTime", "Plus_5").await;
        let update = rule(&f, "UpdateTime", "Plus_15").await;
        f.reconciler.reconcile(&first).await.unwrap();
        f.reconciler.reconcile(&update).await.unwrap();

        assert_eq!(f.store.appointments(f.calendar_id, Some(first.id)).await.unwrap().len(), 1);
        assert_eq!(f.store.appointments(f.calendar_id, Some(update.id)).await.unwrap().len(), 1);
        assert_eq!(f.store.appointments(f.calendar_id, None).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn duplicate_pair_is_collapsed() {
        let f = fixture("duplicates.wal").await;
        f.tickets.upsert(escalated(1, "Sync one", 1_000 * MINUTE_MS));
        let rule = rule(&f, "FirstResponseTime", "Plus_5").await;
        f.reconciler.reconcile(&rule).await.unwrap();
        let mut copy = f.store.appointments(f.calendar_id, None).await.unwrap().remove(0);
        copy.id = Ulid::new();
        f.store.create_appointment(copy).await.unwrap();

        let stats = f.reconciler.reconcile(&rule).await.unwrap();
        assert_eq!(stats.deleted, 1);
        assert_eq!(f.store.appointments(f.calendar_id, Some(rule.id)).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn invalid_modules_are_config_errors() {
        let f = fixture("bad_modules.wal").await;
        let rule = rule(&f, "PendingTime", "SolutionTime").await;
        let err = f.reconciler.reconcile(&rule).await.unwrap_err();
        assert!(err.is_config());
    }

    #[tokio::test]
    async fn user_appointments_are_left_alone() {
        let f = fixture("user_appointments.wal").await;
        let manual = Appointment {
            id: Ulid::new(),
            calendar_id: f.calendar_id,
            title: "Team lunch".into(),
            start: 0,
            end: 60 * MINUTE_MS,
            source: None,
        };
        f.store.create_appointment(manual.clone()).await.unwrap();
        let rule = rule(&f, "FirstResponseTime", "Plus_5").await;
        f.reconciler.reconcile(&rule).await.unwrap();
        f.reconciler.sweep_orphans(f.calendar_id, &HashSet::new()).await.unwrap();
        assert_eq!(f.store.appointments(f.calendar_id, None).await.unwrap(), vec![manual]);
    }

    #[tokio::test]
    async fn sweep_removes_appointments_of_dead_rules() {
        let f = fixture("sweep.wal").await;
        f.tickets.upsert(escalated(1, "Sync one", 1_000 * MINUTE_MS));
        let keep = rule(&f, "FirstResponseTime", "Plus_5").await;
        let stale = rule(&f, "UpdateTime", "Plus_15").await;
        f.reconciler.reconcile(&keep).await.unwrap();
        f.reconciler.reconcile(&stale).await.unwrap();

        let live: HashSet<Ulid> = [keep.id].into_iter().collect();
        assert_eq!(f.reconciler.sweep_orphans(f.calendar_id, &live).await.unwrap(), 1);
        let left = f.store.appointments(f.calendar_id, None).await.unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].rule_id(), Some(keep.id));
    }

    #[tokio::test]
    async fn reconcile_single_ticket() {
        let f = fixture("single_ticket.wal").await;
        f.tickets.upsert(escalated(1, "Sync one", 1_000 * MINUTE_MS));
        f.tickets.upsert(escalated(2, "Sync two", 2_000 * MINUTE_MS));
        let rule = rule(&f, "FirstResponseTime", "Plus_5").await;

        let stats = f.reconciler.reconcile_ticket(&rule, 2).await.unwrap();
        assert_eq!(stats.created, 1);
        let listed = f.store.appointments(f.calendar_id, None).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].ticket_id(), Some(2));

        f.tickets.modify(2, |t| t.title = "gone".into());
        let stats = f.reconciler.reconcile_ticket(&rule, 2).await.unwrap();
        assert_eq!(stats.deleted, 1);
    }

    #[tokio::test]
    async fn purge_ticket_across_calendars() {
        let f = fixture("purge.wal").await;
        let other = Ulid::new();
        f.store.create_calendar(other, "Other".into()).await.unwrap();
        f.tickets.upsert(escalated(1, "Sync one", 1_000 * MINUTE_MS));
        let here = rule(&f, "FirstResponseTime", "Plus_5").await;
        let there = f
            .store
            .add_rule(Rule::new(other, "FirstResponseTime", "Plus_30"))
            .await
            .unwrap();
        f.reconciler.reconcile(&here).await.unwrap();
        f.reconciler.reconcile(&there).await.unwrap();

        assert_eq!(f.reconciler.purge_ticket(1).await.unwrap(), 2);
        assert!(f.store.appointments_for_ticket(1).await.is_empty());
    }

    #[tokio::test]
    async fn changes_invalidate_the_calendar_list() {
        let f = fixture("invalidate.wal").await;
        let key = CacheKey::AppointmentList(f.calendar_id);
        assert!(f.cache.appointment_list(f.store.as_ref(), f.calendar_id).await.unwrap().is_empty());
        assert!(f.cache.is_cached(&key));

        f.tickets.upsert(escalated(1, "Sync one", 1_000 * MINUTE_MS));
        let rule = rule(&f, "FirstResponseTime", "Plus_5").await;
        f.reconciler.reconcile(&rule).await.unwrap();

        assert!(!f.cache.is_cached(&key));
        let listed = f.cache.appointment_list(f.store.as_ref(), f.calendar_id).await.unwrap();
        assert_eq!(listed.len(), 1);
    }
}
