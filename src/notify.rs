use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::broadcast;
use ulid::Ulid;

use crate::model::{Booking, Host, MeetingTemplate, Ms};

const CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BookingChange {
    Created,
    Approved,
    Rejected,
    Cancelled,
    Rescheduled,
}

impl BookingChange {
    pub fn as_str(&self) -> &'static str {
        match self {
            BookingChange::Created => "created",
            BookingChange::Approved => "approved",
            BookingChange::Rejected => "rejected",
            BookingChange::Cancelled => "cancelled",
            BookingChange::Rescheduled => "rescheduled",
        }
    }
}

/// Everything a mail/notification collaborator needs to describe a committed change.
#[derive(Debug, Clone, PartialEq)]
pub struct BookingNotice {
    pub change: BookingChange,
    pub booking: Booking,
    pub host: Host,
    pub template: Arc<MeetingTemplate>,
    /// Start before a reschedule.
    pub previous_start: Option<Ms>,
}

/// Broadcast hub for booking notices, one channel per host.
pub struct NotifyHub {
    channels: DashMap<Ulid, broadcast::Sender<BookingNotice>>,
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
        }
    }

    /// Subscribe to notices for a host. Creates the channel if needed.
    pub fn subscribe(&self, host_id: Ulid) -> broadcast::Receiver<BookingNotice> {
        let sender = self
            .channels
            .entry(host_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        sender.subscribe()
    }

    /// No-op if nobody is listening.
    pub fn send(&self, host_id: Ulid, notice: &BookingNotice) {
        if let Some(sender) = self.channels.get(&host_id) {
            let _ = sender.send(notice.clone());
        }
    }

    /// Drop channels whose subscribers have all gone away.
    pub fn prune(&self) {
        self.channels.retain(|_, sender| sender.receiver_count() > 0);
    }
}
