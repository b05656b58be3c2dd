use dashmap::DashMap;
use tokio::sync::{broadcast, mpsc};
use ulid::Ulid;

use crate::model::{Appointment, EditOrigin, Event};

const CHANNEL_CAPACITY: usize = 256;
const FIREHOSE_CAPACITY: usize = 4096;

/// Broadcast hub for store events: one channel per calendar plus a firehose
/// carrying every event.
///
/// External edits of ticket-derived appointments additionally go to edit
/// subscribers over unbounded channels. Those must not be lost to lag, and
/// their volume is bounded by what people do by hand.
pub struct NotifyHub {
    channels: DashMap<Ulid, broadcast::Sender<Event>>,
    firehose: broadcast::Sender<Event>,
    edits: DashMap<Ulid, mpsc::UnboundedSender<Appointment>>,
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
            firehose: broadcast::channel(FIREHOSE_CAPACITY).0,
            edits: DashMap::new(),
        }
    }

    /// Subscribe to one calendar's events. Creates the channel if needed.
    pub fn subscribe(&self, calendar_id: Ulid) -> broadcast::Receiver<Event> {
        self.channels
            .entry(calendar_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }

    pub fn subscribe_all(&self) -> broadcast::Receiver<Event> {
        self.firehose.subscribe()
    }

    /// Every later external edit of a ticket-derived appointment, in commit
    /// order. Dropping the receiver unsubscribes.
    pub fn subscribe_edits(&self) -> mpsc::UnboundedReceiver<Appointment> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.edits.insert(Ulid::new(), tx);
        rx
    }

    /// No-op for receivers that don't exist.
    pub fn send(&self, event: &Event) {
        let calendar_id = event.calendar_id();
        if let Some(sender) = self.channels.get(&calendar_id) {
            let _ = sender.send(event.clone());
        }
        let _ = self.firehose.send(event.clone());
        if let Event::AppointmentUpdated {
            appointment,
            origin: EditOrigin::External,
        } = event
        {
            if appointment.source.is_some() {
                self.edits.retain(|_, tx| tx.send(appointment.clone()).is_ok());
            }
        }
        if matches!(event, Event::CalendarDeleted { .. }) {
            self.channels.remove(&calendar_id);
        }
    }
}
