use dashmap::DashMap;
use tokio::sync::broadcast;
use ulid::Ulid;

use crate::model::VisitInfo;

const CHANNEL_CAPACITY: usize = 256;

/// A new visit the restaurant's on-duty hall staff should see.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaffNotice {
    pub restaurant_id: Ulid,
    pub target_user_ids: Vec<Ulid>,
    pub visit: VisitInfo,
}

/// Broadcast hub for staff notices, one channel per restaurant.
pub struct NotifyHub {
    channels: DashMap<Ulid, broadcast::Sender<StaffNotice>>,
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

    /// Subscribe to notices for a restaurant. Creates the channel if needed.
    pub fn subscribe(&self, restaurant_id: Ulid) -> broadcast::Receiver<StaffNotice> {
        let sender = self
            .channels
            .entry(restaurant_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        sender.subscribe()
    }

    /// Fire-and-forget. Returns how many receivers got the notice; 0 if nobody
    /// is listening.
    pub fn send(&self, restaurant_id: Ulid, notice: StaffNotice) -> usize {
        match self.channels.get(&restaurant_id) {
            Some(sender) => sender.send(notice).unwrap_or(0),
            None => 0,
        }
    }

    /// Drop a restaurant's channel, e.g. once it is archived.
    pub fn remove(&self, restaurant_id: &Ulid) {
        self.channels.remove(restaurant_id);
    }
}
