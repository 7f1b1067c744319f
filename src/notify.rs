use dashmap::DashMap;
use tokio::sync::broadcast;
use ulid::Ulid;

use crate::model::Commit;

const CHANNEL_CAPACITY: usize = 256;

/// Broadcast hub delivering every committed transaction of an event to its subscribers.
pub struct NotifyHub {
    channels: DashMap<Ulid, broadcast::Sender<Commit>>,
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

    /// Subscribe to commits on an event. Creates the channel if needed.
    pub fn subscribe(&self, event_id: Ulid) -> broadcast::Receiver<Commit> {
        let sender = self
            .channels
            .entry(event_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        sender.subscribe()
    }

    /// Send a commit. No-op if nobody is listening.
    pub fn send(&self, event_id: Ulid, commit: &Commit) {
        if let Some(sender) = self.channels.get(&event_id) {
            let _ = sender.send(commit.clone());
        }
    }

    /// Drop the channel of a deleted event. Receivers see `Closed`.
    pub fn remove(&self, event_id: &Ulid) {
        self.channels.remove(event_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Change, EventDetails};

    #[tokio::test]
    async fn subscribe_and_receive() {
        let hub = NotifyHub::new();
        let eid = Ulid::new();
        let mut rx = hub.subscribe(eid);

        let commit = Commit {
            event_id: eid,
            changes: vec![Change::EventUpdated { id: eid, details: EventDetails::titled("Choir") }],
        };
        hub.send(eid, &commit);

        assert_eq!(rx.recv().await.unwrap(), commit);
    }

    #[tokio::test]
    async fn send_without_subscribers_is_noop() {
        let hub = NotifyHub::new();
        let eid = Ulid::new();
        hub.send(eid, &Commit { event_id: eid, changes: vec![Change::EventDeleted { id: eid }] });
    }

    #[tokio::test]
    async fn remove_closes_receivers() {
        let hub = NotifyHub::new();
        let eid = Ulid::new();
        let mut rx = hub.subscribe(eid);
        hub.remove(&eid);
        assert!(matches!(rx.recv().await, Err(broadcast::error::RecvError::Closed)));
    }
}
