//! Writes human appointment edits back into the originating ticket.
//!
//! Only reversible modules are written: a `DynamicField_<Name>` start or end
//! becomes that field's new value, a `PendingTime` start becomes the ticket's
//! pending time. Escalation deadlines and relative offsets are derived values;
//! edits to them are accepted and left for the next reconciliation to undo.

use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::cache::{CacheKey, CacheService};
use crate::error::SyncError;
use crate::model::*;
use crate::module::TimeModule;
use crate::store::RuleStore;
use crate::tickets::TicketService;

const DAY_MS: Ms = 86_400_000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedbackOutcome {
    /// Ticket fields that were written, in the order written.
    Written { fields: Vec<String> },
    /// Neither module of the rule can take a value back.
    NotReversible,
    /// Hand-made appointment, or its rule is gone.
    NotTicketDerived,
}

impl FeedbackOutcome {
    fn label(&self) -> &'static str {
        match self {
            FeedbackOutcome::Written { .. } => "written",
            FeedbackOutcome::NotReversible => "not_reversible",
            FeedbackOutcome::NotTicketDerived => "not_ticket_derived",
        }
    }
}

pub struct FeedbackWriter {
    tickets: Arc<dyn TicketService>,
    rules: Arc<dyn RuleStore>,
    cache: Arc<dyn CacheService>,
}

impl FeedbackWriter {
    pub fn new(tickets: Arc<dyn TicketService>, rules: Arc<dyn RuleStore>, cache: Arc<dyn CacheService>) -> Self {
        Self { tickets, rules, cache }
    }

    /// Propagate the edited times of `appointment` into its ticket.
    pub async fn on_appointment_edited(&self, appointment: &Appointment) -> Result<FeedbackOutcome, SyncError> {
        let outcome = self.write_back(appointment).await;
        let status = match &outcome {
            Ok(o) => o.label(),
            Err(_) => "failed",
        };
        metrics::counter!(crate::observability::FEEDBACK_WRITES_TOTAL, "status" => status).increment(1);
        outcome
    }

    async fn write_back(&self, appointment: &Appointment) -> Result<FeedbackOutcome, SyncError> {
        let Some(source) = appointment.source else {
            return Ok(FeedbackOutcome::NotTicketDerived);
        };
        let Some(rule) = self.rules.get_rule(source.rule_id).await? else {
            debug!(appointment_id = %appointment.id, rule_id = %source.rule_id, "edited appointment's rule is gone");
            return Ok(FeedbackOutcome::NotTicketDerived);
        };
        let modules = rule.modules()?;
        if !modules.start.is_reversible() && !modules.end.is_reversible() {
            debug!(appointment_id = %appointment.id, rule_id = %rule.id, "appointment edit not propagated");
            return Ok(FeedbackOutcome::NotReversible);
        }

        let ticket = self
            .tickets
            .get_ticket(source.ticket_id)
            .await?
            .ok_or_else(|| SyncError::NotFound(format!("ticket {}", source.ticket_id)))?;

        // Every reversible side is attempted even when the other one fails.
        let mut fields = Vec::new();
        let mut failed = None;
        for (module, at) in [(&modules.start, appointment.start), (&modules.end, appointment.end)] {
            let written = match module {
                TimeModule::DynamicField(name) => {
                    let value = field_value(&ticket, name, at);
                    self.tickets.set_dynamic_field_value(ticket.id, name, value).await
                }
                // Only ever a start; its Plus_<minutes> end is recomputed.
                TimeModule::PendingTime => self.tickets.set_pending_time(ticket.id, at).await,
                _ => continue,
            };
            match written {
                Ok(()) => fields.push(module.to_string()),
                Err(e) => {
                    if failed.is_none() {
                        failed = Some((module.to_string(), SyncError::from(e)));
                    }
                }
            }
        }

        if !fields.is_empty() {
            self.cache.invalidate(&CacheKey::Ticket);
        }
        if let Some((field, e)) = failed {
            if fields.is_empty() {
                return Err(e);
            }
            warn!(
                ticket_id = ticket.id,
                appointment_id = %appointment.id,
                written = ?fields,
                failed = %field,
                "ticket only partly updated from appointment edit: {e}"
            );
            return Err(SyncError::TransientStore(format!(
                "writing {field} failed after {} was written: {e}",
                fields.join(", ")
            )));
        }
        if fields.is_empty() {
            return Ok(FeedbackOutcome::NotReversible);
        }
        info!(
            ticket_id = ticket.id,
            appointment_id = %appointment.id,
            start = %format_datetime(appointment.start),
            end = %format_datetime(appointment.end),
            "wrote appointment edit back to ticket"
        );
        Ok(FeedbackOutcome::Written { fields })
    }
}

/// Keep the field's existing kind. Date fields hold midnight UTC.
fn field_value(ticket: &Ticket, name: &str, at: Ms) -> FieldValue {
    match ticket.dynamic_fields.get(name) {
        Some(FieldValue::Date(_)) => FieldValue::Date(at.div_euclid(DAY_MS) * DAY_MS),
        _ => FieldValue::DateTime(at),
    }
}

/// Background task feeding external appointment edits to `writer` until
/// shutdown. `edits` comes from
/// [`NotifyHub::subscribe_edits`](crate::notify::NotifyHub::subscribe_edits),
/// which never carries reconciler moves.
pub async fn run_listener(
    writer: Arc<FeedbackWriter>,
    mut edits: mpsc::UnboundedReceiver<Appointment>,
    mut shutdown: watch::Receiver<bool>,
) {
    info!("feedback listener started");
    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            received = edits.recv() => {
                let Some(appointment) = received else { break };
                if let Err(e) = writer.on_appointment_edited(&appointment).await {
                    if e.is_config() {
                        error!(appointment_id = %appointment.id, "feedback failed: {e}");
                    } else {
                        warn!(appointment_id = %appointment.id, "feedback failed: {e}");
                    }
                }
            }
        }
    }
    info!("feedback listener stopped");
}
