//! Non-master cluster membership: the registry of filer (and other
//! non-master) processes that a master tracks, per §4.4 of the storage
//! core design. Distinct from the `topology` crate, which tracks volume
//! *servers*; this crate tracks everything else that wants a short, stable
//! peer list — today that's only the filer group.
//!
//! Adds and removes are reference-counted so that duplicate notifications
//! from multiple masters (a filer registers with every master it knows
//! about) are idempotent: the multiset of add/remove events for one
//! address always nets out correctly regardless of arrival order or
//! duplication.

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, info};

/// Up to three members of a group are elected "leaders" so that clients
/// of that group have a short, stable list of peers to contact without
/// needing to know the whole membership.
pub const MAX_LEADERS: usize = 3;

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// One registered non-master process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterNode {
    pub address: String,
    pub version: String,
    pub data_center: String,
    pub rack: String,
    pub created_at_secs: u64,
}

/// Caller-supplied identity for an `add_member` call; `created_at_secs` is
/// filled in by the registry on first registration and never updated by
/// subsequent idempotent re-adds.
#[derive(Debug, Clone)]
pub struct ClusterNodeInfo {
    pub address: String,
    pub version: String,
    pub data_center: String,
    pub rack: String,
}

struct Entry {
    node: ClusterNode,
    ref_count: u32,
}

#[derive(Default)]
struct GroupState {
    members: HashMap<String, Entry>,
    leaders: [Option<String>; MAX_LEADERS],
}

impl GroupState {
    fn is_leader(&self, address: &str) -> bool {
        self.leaders.iter().any(|l| l.as_deref() == Some(address))
    }

    /// Fills the first empty leader slot with `address`, if `address` is
    /// not already a leader and a slot is free. Returns true if a slot was
    /// filled.
    fn add_leader_if_vacant(&mut self, address: &str) -> bool {
        if self.is_leader(address) {
            return false;
        }
        for slot in self.leaders.iter_mut() {
            if slot.is_none() {
                *slot = Some(address.to_string());
                return true;
            }
        }
        false
    }

    /// Promotes the newest remaining non-leader member (smallest
    /// `now - created_at`) into `slot`, biasing the leader set toward
    /// recently-started members — per §4.4, these are less likely to be
    /// the next to disappear (a process restart-looping would otherwise
    /// cycle through old, stable leaders first).
    fn promote_into(&mut self, slot: usize) {
        let newest = self
            .members
            .values()
            .filter(|e| !self.is_leader(&e.node.address))
            .max_by_key(|e| e.node.created_at_secs)
            .map(|e| e.node.address.clone());
        self.leaders[slot] = newest;
    }

    fn remove_leader_slot(&mut self, address: &str) -> bool {
        for slot in self.leaders.iter_mut() {
            if slot.as_deref() == Some(address) {
                *slot = None;
                return true;
            }
        }
        false
    }
}

/// Event published on every membership change, consumed by the master's
/// `KeepConnected` fan-out to relay `ClusterNodeUpdate` to clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClusterNodeEvent {
    Added {
        group: String,
        node: ClusterNode,
        is_leader: bool,
    },
    Removed {
        group: String,
        address: String,
        is_leader: bool,
    },
}

/// Registry of non-master cluster members, grouped by a caller-chosen
/// group name (e.g. `"filer"`). One instance is owned by the master
/// process and shared (via `Arc`) between the gRPC handlers that mutate
/// it and the `KeepConnected` streams that subscribe to its events.
pub struct ClusterRegistry {
    groups: RwLock<HashMap<String, GroupState>>,
    events: broadcast::Sender<ClusterNodeEvent>,
}

impl Default for ClusterRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ClusterRegistry {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(1024);
        Self {
            groups: RwLock::new(HashMap::new()),
            events,
        }
    }

    /// Subscribes to the membership event stream; each `KeepConnected`
    /// client holds its own receiver so a slow client never blocks
    /// another's delivery (dropped events surface as `Lagged` on that
    /// receiver alone).
    pub fn subscribe(&self) -> broadcast::Receiver<ClusterNodeEvent> {
        self.events.subscribe()
    }

    /// Registers `node` as a member of `group`, incrementing its reference
    /// count if already present (rather than overwriting `created_at`,
    /// which must stay stable for leader promotion to make sense). Fills
    /// a vacant leader slot if one exists. Returns whether this was the
    /// first registration (ref count 0 -> 1).
    pub fn add_member(&self, group: &str, info: ClusterNodeInfo) -> bool {
        let mut groups = self.groups.write();
        let state = groups.entry(group.to_string()).or_default();

        let is_new = match state.members.get_mut(&info.address) {
            Some(entry) => {
                entry.ref_count += 1;
                false
            }
            None => {
                state.members.insert(
                    info.address.clone(),
                    Entry {
                        node: ClusterNode {
                            address: info.address.clone(),
                            version: info.version.clone(),
                            data_center: info.data_center.clone(),
                            rack: info.rack.clone(),
                            created_at_secs: now_secs(),
                        },
                        ref_count: 1,
                    },
                );
                true
            }
        };

        let became_leader = state.add_leader_if_vacant(&info.address);
        let node = state.members[&info.address].node.clone();

        if is_new {
            info!(group, address = %info.address, became_leader, "cluster member added");
        } else {
            debug!(group, address = %info.address, "cluster member re-registered");
        }

        let _ = self.events.send(ClusterNodeEvent::Added {
            group: group.to_string(),
            node,
            is_leader: became_leader || state.is_leader(&info.address),
        });
        is_new
    }

    /// Decrements the reference count for `address` in `group`, removing
    /// it entirely once the count reaches zero. If the removed member held
    /// a leader slot, promotes the newest remaining non-leader into it.
    /// Returns whether the member was actually removed (ref count hit
    /// zero) — a plain decrement is not reported as a removal event.
    pub fn remove_member(&self, group: &str, address: &str) -> bool {
        let mut groups = self.groups.write();
        let Some(state) = groups.get_mut(group) else {
            return false;
        };

        let Some(entry) = state.members.get_mut(address) else {
            return false;
        };
        entry.ref_count = entry.ref_count.saturating_sub(1);
        if entry.ref_count > 0 {
            return false;
        }

        state.members.remove(address);
        let was_leader = state.remove_leader_slot(address);
        if was_leader {
            if let Some(slot) = state.leaders.iter().position(|l| l.is_none()) {
                state.promote_into(slot);
            }
        }

        info!(group, address, was_leader, "cluster member removed");
        let _ = self.events.send(ClusterNodeEvent::Removed {
            group: group.to_string(),
            address: address.to_string(),
            is_leader: was_leader,
        });
        true
    }

    pub fn members(&self, group: &str) -> Vec<ClusterNode> {
        self.groups
            .read()
            .get(group)
            .map(|s| s.members.values().map(|e| e.node.clone()).collect())
            .unwrap_or_default()
    }

    /// Current (non-empty) leader addresses for `group`, in slot order.
    pub fn leaders(&self, group: &str) -> Vec<String> {
        self.groups
            .read()
            .get(group)
            .map(|s| s.leaders.iter().flatten().cloned().collect())
            .unwrap_or_default()
    }

    pub fn is_member(&self, group: &str, address: &str) -> bool {
        self.groups
            .read()
            .get(group)
            .map(|s| s.members.contains_key(address))
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(addr: &str) -> ClusterNodeInfo {
        ClusterNodeInfo {
            address: addr.to_string(),
            version: "1.0".to_string(),
            data_center: "dc1".to_string(),
            rack: "rack1".to_string(),
        }
    }

    #[test]
    fn first_three_distinct_members_become_leaders() {
        let reg = ClusterRegistry::new();
        reg.add_member("filer", info("a:1"));
        reg.add_member("filer", info("b:1"));
        reg.add_member("filer", info("c:1"));
        reg.add_member("filer", info("d:1"));

        let leaders = reg.leaders("filer");
        assert_eq!(leaders.len(), MAX_LEADERS);
        assert!(leaders.contains(&"a:1".to_string()));
        assert!(!leaders.contains(&"d:1".to_string()));
    }

    #[test]
    fn removing_a_leader_promotes_newest_non_leader() {
        let reg = ClusterRegistry::new();
        reg.add_member("filer", info("a:1"));
        reg.add_member("filer", info("b:1"));
        reg.add_member("filer", info("c:1"));
        reg.add_member("filer", info("d:1")); // not a leader, newest

        assert!(reg.remove_member("filer", "a:1"));
        let leaders = reg.leaders("filer");
        assert_eq!(leaders.len(), MAX_LEADERS);
        assert!(leaders.contains(&"d:1".to_string()));
        assert!(!leaders.contains(&"a:1".to_string()));
    }

    #[test]
    fn add_remove_is_reference_counted() {
        let reg = ClusterRegistry::new();
        reg.add_member("filer", info("a:1"));
        assert!(!reg.add_member("filer", info("a:1"))); // second add: not new
        assert!(reg.is_member("filer", "a:1"));

        assert!(!reg.remove_member("filer", "a:1")); // first remove: ref count 1
        assert!(reg.is_member("filer", "a:1"));
        assert!(reg.remove_member("filer", "a:1")); // second remove: gone
        assert!(!reg.is_member("filer", "a:1"));
    }

    #[test]
    fn multiset_of_add_remove_events_summing_to_zero_leaves_no_trace() {
        let reg = ClusterRegistry::new();
        for _ in 0..5 {
            reg.add_member("filer", info("a:1"));
        }
        for _ in 0..5 {
            reg.remove_member("filer", "a:1");
        }
        assert!(!reg.is_member("filer", "a:1"));
        assert!(!reg.leaders("filer").contains(&"a:1".to_string()));
    }

    #[test]
    fn leader_slots_never_contain_duplicates() {
        let reg = ClusterRegistry::new();
        for addr in ["a:1", "b:1", "c:1"] {
            reg.add_member("filer", info(addr));
        }
        // Re-registering an existing leader must not consume another slot.
        reg.add_member("filer", info("a:1"));
        let leaders = reg.leaders("filer");
        let mut unique = leaders.clone();
        unique.sort();
        unique.dedup();
        assert_eq!(leaders.len(), unique.len());
    }

    #[tokio::test]
    async fn subscribers_observe_add_and_remove_events() {
        let reg = ClusterRegistry::new();
        let mut rx = reg.subscribe();
        reg.add_member("filer", info("a:1"));
        let evt = rx.recv().await.unwrap();
        assert!(matches!(evt, ClusterNodeEvent::Added { .. }));

        reg.remove_member("filer", "a:1");
        let evt = rx.recv().await.unwrap();
        assert!(matches!(evt, ClusterNodeEvent::Removed { .. }));
    }
}
