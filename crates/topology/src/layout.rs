use std::collections::{HashMap, HashSet};

use common::{Collection, DiskType, ReplicaPlacement, Ttl, VolumeId};
use parking_lot::RwLock;
use rand::Rng;

/// Key a [`VolumeLayout`] is grouped under: every volume in a layout shares
/// collection, replication, TTL and disk type, per §3's data model.
pub type LayoutKey = (Collection, ReplicaPlacement, Ttl, DiskType);

struct LayoutState {
    writable: HashMap<VolumeId, u64>, // volume id -> free bytes, refreshed by heartbeats
    oversized: HashSet<VolumeId>,
    size_limit_bytes: u64,
}

/// Tracks the writable-volume set for one `(collection, replication, ttl,
/// disk_type)` tuple. The master keeps one of these per tuple it has ever
/// seen; `Assign` picks a volume here by weighted random choice over free
/// bytes.
pub struct VolumeLayout {
    state: RwLock<LayoutState>,
}

impl VolumeLayout {
    pub fn new(size_limit_bytes: u64) -> Self {
        Self {
            state: RwLock::new(LayoutState {
                writable: HashMap::new(),
                oversized: HashSet::new(),
                size_limit_bytes,
            }),
        }
    }

    /// Refreshes what this layout believes about one volume's free space,
    /// called from the heartbeat merge path. A volume reporting `size >=
    /// size_limit_bytes` (or flagged read-only) leaves the writable set.
    pub fn report_volume(&self, id: VolumeId, size_bytes: u64, read_only: bool) {
        let mut state = self.state.write();
        if read_only || size_bytes >= state.size_limit_bytes {
            state.writable.remove(&id);
            state.oversized.insert(id);
        } else {
            state.oversized.remove(&id);
            state.writable.insert(id, state.size_limit_bytes - size_bytes);
        }
    }

    pub fn remove_volume(&self, id: VolumeId) {
        let mut state = self.state.write();
        state.writable.remove(&id);
        state.oversized.remove(&id);
    }

    pub fn has_writable(&self) -> bool {
        !self.state.read().writable.is_empty()
    }

    pub fn writable_count(&self) -> usize {
        self.state.read().writable.len()
    }

    /// Low-free-space threshold check: true when every writable volume's
    /// free space is below `fraction` of the size limit, signaling the
    /// grower should be asked for another volume.
    pub fn below_free_fraction(&self, fraction: f64) -> bool {
        let state = self.state.read();
        if state.writable.is_empty() {
            return true;
        }
        let threshold = (state.size_limit_bytes as f64 * fraction) as u64;
        state.writable.values().all(|free| *free < threshold)
    }

    /// Picks a writable volume weighted by free bytes (ties broken by the
    /// `rand` crate's own selection order, which is effectively
    /// node-level random since callers iterate a `HashMap`).
    pub fn pick_writable(&self) -> Option<VolumeId> {
        let state = self.state.read();
        if state.writable.is_empty() {
            return None;
        }
        let total: u64 = state.writable.values().sum::<u64>() + state.writable.len() as u64;
        let mut target = rand::thread_rng().gen_range(0..total);
        for (id, free) in state.writable.iter() {
            let weight = free + 1;
            if target < weight {
                return Some(*id);
            }
            target -= weight;
        }
        state.writable.keys().next().copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn report_volume_moves_between_writable_and_oversized() {
        let layout = VolumeLayout::new(1000);
        layout.report_volume(VolumeId(1), 100, false);
        assert!(layout.has_writable());
        layout.report_volume(VolumeId(1), 1000, false);
        assert!(!layout.has_writable());
    }

    #[test]
    fn below_free_fraction_true_when_empty() {
        let layout = VolumeLayout::new(1000);
        assert!(layout.below_free_fraction(0.1));
    }

    #[test]
    fn pick_writable_returns_a_tracked_volume() {
        let layout = VolumeLayout::new(1000);
        layout.report_volume(VolumeId(3), 100, false);
        assert_eq!(layout.pick_writable(), Some(VolumeId(3)));
    }
}
