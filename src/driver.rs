//! Scheduler driver: reconciles every active rule on a fixed interval.
//!
//! Each tick snapshots the active rules, runs one reconciliation per rule on a
//! bounded worker pool and then sweeps appointments left behind by removed or
//! deactivated rules. A rule whose previous pass is still running is skipped,
//! never queued. Ticks themselves may overlap.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::{DashMap, DashSet};
use tokio::sync::{Semaphore, watch};
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};
use ulid::Ulid;

use crate::error::SyncError;
use crate::model::{Ms, Rule, now_ms};
use crate::reconcile::{ReconcileStats, Reconciler};
use crate::store::RuleStore;

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Time between tick starts.
    pub interval: Duration,
    /// Rules reconciled concurrently.
    pub workers: usize,
    /// A rule's pass is abandoned after this long.
    pub rule_timeout: Duration,
    /// How long shutdown waits for running ticks.
    pub shutdown_grace: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            workers: 4,
            rule_timeout: Duration::from_secs(300),
            shutdown_grace: Duration::from_secs(10),
        }
    }
}

/// Per-rule state: `Idle -> Running -> Idle`, or `Running -> Failed` until the
/// next tick retries. `Invalid` rules are not retried until their revision
/// changes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuleHealth {
    Idle,
    Running,
    Failed { reason: String },
    Invalid { reason: String, revision: u64 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleStatus {
    pub health: RuleHealth,
    /// Outcome of the last successful pass.
    pub last_stats: Option<ReconcileStats>,
    pub last_finished: Option<Ms>,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TickReport {
    pub rules_run: usize,
    pub rules_failed: usize,
    pub rules_skipped_in_flight: usize,
    pub rules_skipped_invalid: usize,
    pub orphans_deleted: usize,
    pub stats: ReconcileStats,
}

/// Marks a rule as running until dropped.
struct InFlightGuard {
    in_flight: Arc<DashSet<Ulid>>,
    rule_id: Ulid,
}

impl InFlightGuard {
    fn acquire(in_flight: &Arc<DashSet<Ulid>>, rule_id: Ulid) -> Option<Self> {
        in_flight.insert(rule_id).then(|| Self {
            in_flight: in_flight.clone(),
            rule_id,
        })
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.in_flight.remove(&self.rule_id);
    }
}

pub struct Driver {
    rules: Arc<dyn RuleStore>,
    reconciler: Arc<Reconciler>,
    config: SchedulerConfig,
    in_flight: Arc<DashSet<Ulid>>,
    health: DashMap<Ulid, RuleStatus>,
    pool: Semaphore,
}

impl Driver {
    pub fn new(rules: Arc<dyn RuleStore>, reconciler: Arc<Reconciler>, config: SchedulerConfig) -> Self {
        let pool = Semaphore::new(config.workers.max(1));
        Self {
            rules,
            reconciler,
            config,
            in_flight: Arc::new(DashSet::new()),
            health: DashMap::new(),
            pool,
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Health of a rule the driver has seen, `None` otherwise.
    pub fn health(&self, rule_id: Ulid) -> Option<RuleStatus> {
        self.health.get(&rule_id).map(|s| s.value().clone())
    }

    pub fn is_running(&self, rule_id: Ulid) -> bool {
        self.in_flight.contains(&rule_id)
    }

    /// Run one tick to completion.
    pub async fn tick(self: &Arc<Self>) -> TickReport {
        let started = Instant::now();
        let mut report = TickReport::default();
        let rules = match self.rules.list_active_rules().await {
            Ok(rules) => rules,
            Err(e) => {
                warn!("tick skipped, rules unavailable: {e}");
                return report;
            }
        };
        let mut by_calendar: BTreeMap<Ulid, Vec<Rule>> = BTreeMap::new();
        for rule in rules {
            by_calendar.entry(rule.calendar_id).or_default().push(rule);
        }

        let mut passes = JoinSet::new();
        for rule in by_calendar.into_values().flatten() {
            if self.rejected_revision(&rule) {
                report.rules_skipped_invalid += 1;
                continue;
            }
            let Some(guard) = InFlightGuard::acquire(&self.in_flight, rule.id) else {
                warn!(rule_id = %rule.id, "previous pass still running, skipping rule this tick");
                metrics::counter!(crate::observability::RULES_SKIPPED_IN_FLIGHT_TOTAL).increment(1);
                report.rules_skipped_in_flight += 1;
                continue;
            };
            let driver = self.clone();
            passes.spawn(async move { driver.run_rule(rule, guard).await });
        }

        while let Some(joined) = passes.join_next().await {
            report.rules_run += 1;
            match joined {
                Ok(Ok(stats)) => report.stats.absorb(stats),
                Ok(Err(_)) => report.rules_failed += 1,
                Err(e) => {
                    error!("rule pass panicked: {e}");
                    report.rules_failed += 1;
                }
            }
        }

        report.orphans_deleted = self.sweep_orphans().await;
        metrics::histogram!(crate::observability::TICK_DURATION_SECONDS).record(started.elapsed().as_secs_f64());
        if report.stats.changed() > 0 || report.orphans_deleted > 0 || report.rules_failed > 0 {
            info!(
                rules = report.rules_run,
                failed = report.rules_failed,
                created = report.stats.created,
                updated = report.stats.updated,
                deleted = report.stats.deleted,
                orphans = report.orphans_deleted,
                "tick finished"
            );
        } else {
            debug!(rules = report.rules_run, "tick finished, nothing changed");
        }
        report
    }

    fn rejected_revision(&self, rule: &Rule) -> bool {
        self.health.get(&rule.id).is_some_and(|s| {
            matches!(&s.health, RuleHealth::Invalid { revision, .. } if *revision == rule.revision)
        })
    }

    fn set_health(&self, rule_id: Ulid, health: RuleHealth, stats: Option<ReconcileStats>) {
        let mut entry = self.health.entry(rule_id).or_insert_with(|| RuleStatus {
            health: RuleHealth::Idle,
            last_stats: None,
            last_finished: None,
        });
        if stats.is_some() {
            entry.last_stats = stats;
            entry.last_finished = Some(now_ms());
        }
        entry.health = health;
    }

    async fn run_rule(self: Arc<Self>, rule: Rule, _guard: InFlightGuard) -> Result<ReconcileStats, SyncError> {
        let _permit = self
            .pool
            .acquire()
            .await
            .map_err(|_| SyncError::TransientStore("worker pool closed".into()))?;
        self.set_health(rule.id, RuleHealth::Running, None);

        let after = self.config.rule_timeout;
        let outcome = match tokio::time::timeout(after, self.reconciler.reconcile(&rule)).await {
            Ok(outcome) => outcome,
            Err(_) => {
                // The abandoned pass may have written before it stopped.
                self.reconciler.invalidate_calendar(rule.calendar_id);
                Err(SyncError::Timeout { rule_id: rule.id, after })
            }
        };

        match &outcome {
            Ok(stats) => self.set_health(rule.id, RuleHealth::Idle, Some(*stats)),
            Err(e) => {
                metrics::counter!(crate::observability::RULE_FAILURES_TOTAL, "kind" => e.kind()).increment(1);
                if e.is_config() {
                    error!(rule_id = %rule.id, revision = rule.revision, "rule disabled until corrected: {e}");
                    let health = RuleHealth::Invalid {
                        reason: e.to_string(),
                        revision: rule.revision,
                    };
                    self.set_health(rule.id, health, None);
                } else {
                    warn!(rule_id = %rule.id, "rule pass failed, retrying next tick: {e}");
                    self.set_health(rule.id, RuleHealth::Failed { reason: e.to_string() }, None);
                }
            }
        }
        outcome
    }

    /// Delete appointments of rules that are no longer active, on every
    /// calendar. Uses a fresh rule list so rules added during the tick survive.
    async fn sweep_orphans(&self) -> usize {
        let (rules, calendars) = match (self.rules.list_active_rules().await, self.rules.calendar_ids().await) {
            (Ok(rules), Ok(calendars)) => (rules, calendars),
            (Err(e), _) | (_, Err(e)) => {
                warn!("orphan sweep skipped: {e}");
                return 0;
            }
        };
        let live: HashSet<Ulid> = rules.iter().map(|r| r.id).collect();
        self.health.retain(|id, _| live.contains(id));

        let mut deleted = 0;
        for calendar_id in calendars {
            match self.reconciler.sweep_orphans(calendar_id, &live).await {
                Ok(n) => deleted += n,
                Err(e) => warn!(calendar_id = %calendar_id, "orphan sweep failed: {e}"),
            }
        }
        deleted
    }

    /// Tick on the configured interval until `shutdown` flips, then wait for
    /// running ticks up to the shutdown grace period.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_secs = self.config.interval.as_secs_f64(),
            workers = self.config.workers,
            rule_timeout_secs = self.config.rule_timeout.as_secs(),
            "scheduler started"
        );
        let mut interval = tokio::time::interval(self.config.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut ticks: JoinSet<TickReport> = JoinSet::new();

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = interval.tick() => {
                    while let Some(done) = ticks.try_join_next() {
                        if let Err(e) = done {
                            error!("tick panicked: {e}");
                        }
                    }
                    let driver = self.clone();
                    ticks.spawn(async move { driver.tick().await });
                }
            }
        }

        info!(running = ticks.len(), "scheduler stopping, draining ticks");
        let drained = tokio::time::timeout(self.config.shutdown_grace, async {
            while ticks.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!(abandoned = ticks.len(), "drain timeout, abandoning running ticks");
            ticks.abort_all();
        }
        info!("scheduler stopped");
    }
}
