//! Invalidate-on-write cache layer.
//!
//! Writers (reconciler, feedback writer) invalidate; readers go through
//! [`MemoryCache::appointment_list`], which reads through to the store on a
//! miss. Every key carries a generation counter bumped by invalidation; a
//! loader only publishes its result if the generation it started under is
//! still current, so no reader sees a list older than the last invalidation.

use std::fmt;

use dashmap::DashMap;
use ulid::Ulid;

use crate::model::Appointment;
use crate::store::{AppointmentStore, StoreError};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CacheKey {
    AppointmentList(Ulid),
    Ticket,
    Calendar,
    Queue,
    Group,
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CacheKey::AppointmentList(calendar_id) => write!(f, "AppointmentList{calendar_id}"),
            CacheKey::Ticket => f.write_str("Ticket"),
            CacheKey::Calendar => f.write_str("Calendar"),
            CacheKey::Queue => f.write_str("Queue"),
            CacheKey::Group => f.write_str("Group"),
        }
    }
}

pub trait CacheService: Send + Sync {
    fn invalidate(&self, key: &CacheKey);
}

#[derive(Default)]
struct Slot {
    generation: u64,
    appointments: Option<Vec<Appointment>>,
}

#[derive(Default)]
pub struct MemoryCache {
    slots: DashMap<CacheKey, Slot>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn generation(&self, key: &CacheKey) -> u64 {
        self.slots.get(key).map_or(0, |s| s.generation)
    }

    /// Cached appointment list of a calendar, loading it from `store` on a miss.
    pub async fn appointment_list(
        &self,
        store: &dyn AppointmentStore,
        calendar_id: Ulid,
    ) -> Result<Vec<Appointment>, StoreError> {
        let key = CacheKey::AppointmentList(calendar_id);
        let started_at = match self.slots.get(&key) {
            Some(slot) => {
                if let Some(list) = &slot.appointments {
                    return Ok(list.clone());
                }
                slot.generation
            }
            None => 0,
        };
        let loaded = store.list_appointments(calendar_id, None).await?;
        let mut slot = self.slots.entry(key).or_default();
        if slot.generation == started_at {
            slot.appointments = Some(loaded.clone());
        }
        Ok(loaded)
    }

    pub fn is_cached(&self, key: &CacheKey) -> bool {
        self.slots.get(key).is_some_and(|s| s.appointments.is_some())
    }
}

impl CacheService for MemoryCache {
    fn invalidate(&self, key: &CacheKey) {
        let mut slot = self.slots.entry(key.clone()).or_default();
        slot.generation += 1;
        slot.appointments = None;
        tracing::trace!(key = %key, generation = slot.generation, "cache invalidated");
    }
}
