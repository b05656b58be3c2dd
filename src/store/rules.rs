use async_trait::async_trait;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::{CalendarStore, RuleStore, StoreError};

fn validate_rule(rule: &Rule) -> Result<(), StoreError> {
    if rule.search.len() > MAX_SEARCH_PARAMS {
        return Err(StoreError::LimitExceeded("too many search parameters"));
    }
    if rule
        .search
        .iter()
        .any(|(k, v)| k.len() > MAX_NAME_LEN || v.len() > MAX_SEARCH_VALUE_LEN)
    {
        return Err(StoreError::LimitExceeded("search parameter too long"));
    }
    if rule.start_module.len() > MAX_NAME_LEN || rule.end_module.len() > MAX_NAME_LEN {
        return Err(StoreError::LimitExceeded("time module name too long"));
    }
    Ok(())
}

impl CalendarStore {
    pub async fn create_calendar(&self, id: Ulid, name: String) -> Result<(), StoreError> {
        let gate = self.begin_mutation().await;
        if name.len() > MAX_NAME_LEN {
            return Err(StoreError::LimitExceeded("calendar name too long"));
        }
        if self.calendars.len() >= MAX_CALENDARS {
            return Err(StoreError::LimitExceeded("too many calendars"));
        }
        if self.calendars.contains_key(&id) {
            return Err(StoreError::AlreadyExists(id));
        }
        self.persist_and_apply(gate, None, Event::CalendarCreated { id, name }).await
    }

    /// Delete a calendar and its appointments. Rules must be removed first.
    pub async fn delete_calendar(&self, id: Ulid) -> Result<(), StoreError> {
        let gate = self.begin_mutation().await;
        let cal = self.calendar_or_not_found(id)?;
        let guard = cal.write_owned().await;
        if !guard.rules.is_empty() {
            return Err(StoreError::HasRules(id));
        }
        self.persist_and_apply(gate, Some(guard), Event::CalendarDeleted { id }).await
    }

    pub async fn list_calendars(&self) -> Vec<CalendarInfo> {
        let calendars: Vec<_> = self.calendars.iter().map(|e| e.value().clone()).collect();
        let mut infos = Vec::with_capacity(calendars.len());
        for cal in calendars {
            let guard = cal.read().await;
            infos.push(CalendarInfo {
                id: guard.id,
                name: guard.name.clone(),
                rule_count: guard.rules.len(),
                appointment_count: guard.appointments.len(),
            });
        }
        infos.sort_by_key(|c| c.id);
        infos
    }

    /// Store a new rule. The stored copy (revision 1) is returned.
    pub async fn add_rule(&self, mut rule: Rule) -> Result<Rule, StoreError> {
        let gate = self.begin_mutation().await;
        validate_rule(&rule)?;
        if self.rule_index.contains_key(&rule.id) {
            return Err(StoreError::AlreadyExists(rule.id));
        }
        let cal = self.calendar_or_not_found(rule.calendar_id)?;
        let guard = cal.write_owned().await;
        if guard.rules.len() >= MAX_RULES_PER_CALENDAR {
            return Err(StoreError::LimitExceeded("too many rules on calendar"));
        }
        rule.revision = 1;
        let event = Event::RuleAdded { rule: rule.clone() };
        self.persist_and_apply(gate, Some(guard), event).await?;
        Ok(rule)
    }

    /// Replace a rule's definition, bumping its revision. Rules cannot move
    /// between calendars.
    pub async fn update_rule(&self, mut rule: Rule) -> Result<Rule, StoreError> {
        let gate = self.begin_mutation().await;
        validate_rule(&rule)?;
        let guard = self.lock_owner(&self.rule_index, rule.id).await?;
        if guard.id != rule.calendar_id {
            return Err(StoreError::CalendarMismatch {
                rule_id: rule.id,
                calendar_id: rule.calendar_id,
            });
        }
        let current = guard
            .rules
            .iter()
            .find(|r| r.id == rule.id)
            .ok_or(StoreError::NotFound(rule.id))?;
        rule.revision = current.revision + 1;
        let event = Event::RuleUpdated { rule: rule.clone() };
        self.persist_and_apply(gate, Some(guard), event).await?;
        Ok(rule)
    }

    /// Add the rule, or update it if its id is already known.
    pub async fn upsert_rule(&self, rule: Rule) -> Result<Rule, StoreError> {
        if self.rule_index.contains_key(&rule.id) {
            self.update_rule(rule).await
        } else {
            self.add_rule(rule).await
        }
    }

    pub async fn set_rule_active(&self, id: Ulid, active: bool) -> Result<Rule, StoreError> {
        let mut rule = self.rule(id).await.ok_or(StoreError::NotFound(id))?;
        rule.active = active;
        self.update_rule(rule).await
    }

    /// Remove a rule. Its appointments are swept on the next scheduler tick.
    pub async fn remove_rule(&self, id: Ulid) -> Result<Ulid, StoreError> {
        let gate = self.begin_mutation().await;
        let guard = self.lock_owner(&self.rule_index, id).await?;
        let calendar_id = guard.id;
        let event = Event::RuleRemoved { id, calendar_id };
        self.persist_and_apply(gate, Some(guard), event).await?;
        Ok(calendar_id)
    }

    pub async fn rule(&self, id: Ulid) -> Option<Rule> {
        let calendar_id = self.rule_index.get(&id).map(|e| *e.value())?;
        let cal = self.get_calendar(&calendar_id)?;
        let guard = cal.read().await;
        guard.rules.iter().find(|r| r.id == id).cloned()
    }

    /// Rules of one calendar in authoring order.
    pub async fn list_rules(&self, calendar_id: Ulid) -> Result<Vec<Rule>, StoreError> {
        let cal = self.calendar_or_not_found(calendar_id)?;
        let guard = cal.read().await;
        Ok(guard.rules.clone())
    }

    /// Active rules of every calendar, grouped by calendar id, each group in
    /// authoring order.
    pub async fn active_rules(&self) -> Vec<Rule> {
        let mut calendars: Vec<_> = self
            .calendars
            .iter()
            .map(|e| (*e.key(), e.value().clone()))
            .collect();
        calendars.sort_by_key(|(id, _)| *id);
        let mut rules = Vec::new();
        for (_, cal) in calendars {
            let guard = cal.read().await;
            rules.extend(guard.rules.iter().filter(|r| r.active).cloned());
        }
        rules
    }
}

#[async_trait]
impl RuleStore for CalendarStore {
    async fn list_active_rules(&self) -> Result<Vec<Rule>, StoreError> {
        Ok(self.active_rules().await)
    }

    async fn get_rule(&self, id: Ulid) -> Result<Option<Rule>, StoreError> {
        Ok(self.rule(id).await)
    }

    async fn calendar_ids(&self) -> Result<Vec<Ulid>, StoreError> {
        let mut ids: Vec<Ulid> = self.calendars.iter().map(|e| *e.key()).collect();
        ids.sort();
        Ok(ids)
    }
}
