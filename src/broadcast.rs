use dashmap::DashMap;
use tokio::sync::broadcast;

const GROUP_CAPACITY: usize = 256;

/// Room-keyed fan-out. Each group is a broadcast channel created on first
/// join and pruned when its last subscriber leaves; within a group, events
/// arrive in publish order.
#[derive(Default)]
pub struct RoomGroups {
    groups: DashMap<String, broadcast::Sender<String>>,
}

impl RoomGroups {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to a group, creating it if needed. The subscription happens
    /// while the map entry is held, so a concurrent prune can never observe
    /// the channel without its receiver.
    pub fn join(&self, group: &str) -> broadcast::Receiver<String> {
        self.groups
            .entry(group.to_owned())
            .or_insert_with(|| broadcast::channel(GROUP_CAPACITY).0)
            .subscribe()
    }

    /// Publish to a group. Returns how many subscribers will see the event.
    pub fn send(&self, group: &str, payload: String) -> usize {
        match self.groups.get(group) {
            Some(tx) => tx.send(payload).unwrap_or(0),
            None => 0,
        }
    }

    /// Drop the group once nobody is subscribed. Callers release their
    /// receiver first.
    pub fn leave(&self, group: &str) {
        self.groups.remove_if(group, |_, tx| tx.receiver_count() == 0);
    }

    pub fn receiver_count(&self, group: &str) -> usize {
        self.groups.get(group).map_or(0, |tx| tx.receiver_count())
    }

    pub fn group_count(&self) -> usize {
        self.groups.len()
    }
}
