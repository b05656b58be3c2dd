use async_trait::async_trait;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::{AppointmentStore, CalendarStore, StoreError};

fn validate_times(start: Ms, end: Ms) -> Result<(), StoreError> {
    if start < MIN_VALID_TIMESTAMP_MS || end > MAX_VALID_TIMESTAMP_MS {
        return Err(StoreError::LimitExceeded("timestamp out of range"));
    }
    if end < start {
        return Err(StoreError::InvalidSpan { start, end });
    }
    Ok(())
}

fn validate_title(title: &str) -> Result<(), StoreError> {
    if title.len() > MAX_TITLE_LEN {
        return Err(StoreError::LimitExceeded("appointment title too long"));
    }
    Ok(())
}

impl CalendarStore {
    pub async fn create_appointment(&self, appointment: Appointment) -> Result<(), StoreError> {
        let gate = self.begin_mutation().await;
        validate_times(appointment.start, appointment.end)?;
        validate_title(&appointment.title)?;
        if self.appointment_index.contains_key(&appointment.id) {
            return Err(StoreError::AlreadyExists(appointment.id));
        }
        let cal = self.calendar_or_not_found(appointment.calendar_id)?;
        let guard = cal.write_owned().await;
        if guard.appointments.len() >= MAX_APPOINTMENTS_PER_CALENDAR {
            return Err(StoreError::LimitExceeded("too many appointments on calendar"));
        }
        let event = Event::AppointmentCreated { appointment };
        self.persist_and_apply(gate, Some(guard), event).await
    }

    /// Move an appointment in place, keeping its id. `origin` travels with the
    /// broadcast so listeners can tell reconciliation from human edits.
    pub async fn update_appointment(
        &self,
        id: Ulid,
        patch: AppointmentPatch,
        origin: EditOrigin,
    ) -> Result<Appointment, StoreError> {
        let gate = self.begin_mutation().await;
        validate_times(patch.start, patch.end)?;
        if let Some(title) = &patch.title {
            validate_title(title)?;
        }
        let guard = self.lock_owner(&self.appointment_index, id).await?;
        let mut appointment = guard.appointment(id).cloned().ok_or(StoreError::NotFound(id))?;
        if let Some(title) = patch.title {
            appointment.title = title;
        }
        appointment.start = patch.start;
        appointment.end = patch.end;
        let event = Event::AppointmentUpdated {
            appointment: appointment.clone(),
            origin,
        };
        self.persist_and_apply(gate, Some(guard), event).await?;
        Ok(appointment)
    }

    pub async fn delete_appointment(&self, id: Ulid) -> Result<Ulid, StoreError> {
        let gate = self.begin_mutation().await;
        let guard = self.lock_owner(&self.appointment_index, id).await?;
        let calendar_id = guard.id;
        let event = Event::AppointmentDeleted { id, calendar_id };
        self.persist_and_apply(gate, Some(guard), event).await?;
        Ok(calendar_id)
    }

    pub async fn appointment(&self, id: Ulid) -> Option<Appointment> {
        let calendar_id = self.appointment_index.get(&id).map(|e| *e.value())?;
        let cal = self.get_calendar(&calendar_id)?;
        let guard = cal.read().await;
        guard.appointment(id).cloned()
    }

    /// Appointments of a calendar ordered by start, optionally filtered to
    /// those derived from one rule.
    pub async fn appointments(&self, calendar_id: Ulid, rule_id: Option<Ulid>) -> Result<Vec<Appointment>, StoreError> {
        let cal = self.calendar_or_not_found(calendar_id)?;
        let guard = cal.read().await;
        Ok(guard
            .appointments
            .iter()
            .filter(|a| rule_id.is_none() || a.rule_id() == rule_id)
            .cloned()
            .collect())
    }

    /// Ticket-derived appointments for one ticket across all calendars.
    pub async fn appointments_for_ticket(&self, ticket_id: TicketId) -> Vec<Appointment> {
        let calendars: Vec<_> = self.calendars.iter().map(|e| e.value().clone()).collect();
        let mut found = Vec::new();
        for cal in calendars {
            let guard = cal.read().await;
            found.extend(
                guard
                    .appointments
                    .iter()
                    .filter(|a| a.ticket_id() == Some(ticket_id))
                    .cloned(),
            );
        }
        found
    }
}

#[async_trait]
impl AppointmentStore for CalendarStore {
    async fn list_appointments(&self, calendar_id: Ulid, rule_id: Option<Ulid>) -> Result<Vec<Appointment>, StoreError> {
        self.appointments(calendar_id, rule_id).await
    }

    async fn ticket_appointments(&self, ticket_id: TicketId) -> Result<Vec<Appointment>, StoreError> {
        Ok(self.appointments_for_ticket(ticket_id).await)
    }

    async fn create_appointment(&self, appointment: Appointment) -> Result<(), StoreError> {
        CalendarStore::create_appointment(self, appointment).await
    }

    async fn update_appointment(
        &self,
        id: Ulid,
        patch: AppointmentPatch,
        origin: EditOrigin,
    ) -> Result<Appointment, StoreError> {
        CalendarStore::update_appointment(self, id, patch, origin).await
    }

    async fn delete_appointment(&self, id: Ulid) -> Result<(), StoreError> {
        CalendarStore::delete_appointment(self, id).await.map(|_| ())
    }
}
