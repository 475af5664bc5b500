use std::collections::HashMap;

use common::VolumeId;
use parking_lot::RwLock;
use rand::Rng;

/// Opaque arena index for a data center entry. The tree is naturally
/// cyclic (parent ↔ children); representing nodes as arena-indexed records
/// instead of `Rc`/`Weak` pointer graphs keeps every level's lock target
/// stable and sidesteps recursive-lock hazards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DcId(pub usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RackId(pub usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DataNodeId(pub usize);

/// Summed capacity counters. Every interior node's `Capacity` must equal
/// the sum of its children's; that invariant is maintained by
/// `Topology::recompute_ancestors` after every leaf mutation.
#[derive(Debug, Clone, Copy, Default)]
pub struct Capacity {
    pub max_bytes: u64,
    pub used_bytes: u64,
    pub volume_count: u32,
    pub ec_shard_count: u32,
}

impl Capacity {
    pub fn free_bytes(&self) -> u64 {
        self.max_bytes.saturating_sub(self.used_bytes)
    }
}

pub struct DataCenterEntry {
    pub name: String,
    pub racks: Vec<RackId>,
    pub capacity: Capacity,
}

pub struct RackEntry {
    pub name: String,
    pub dc: DcId,
    pub nodes: Vec<DataNodeId>,
    pub capacity: Capacity,
}

/// Data nodes are keyed by server address; a volume server's heartbeat
/// reports land here keyed by the `ip:port` it identified itself with.
pub struct DataNodeEntry {
    pub address: String,
    pub public_url: String,
    pub rack: RackId,
    pub max_volume_counts: HashMap<common::DiskType, u32>,
    pub volumes: HashMap<VolumeId, u64>,
    pub capacity: Capacity,
}

/// One replica location for a volume, resolved with its data center so
/// `KeepConnected`/`LookupVolume` callers can build a wire `Location`
/// without reaching back into the tree themselves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeLocation {
    pub address: String,
    pub public_url: String,
    pub data_center: String,
}

#[derive(Default)]
struct Inner {
    dcs: Vec<DataCenterEntry>,
    racks: Vec<RackEntry>,
    nodes: Vec<DataNodeEntry>,
    dc_by_name: HashMap<String, DcId>,
    rack_by_key: HashMap<(DcId, String), RackId>,
    node_by_addr: HashMap<String, DataNodeId>,
}

/// The in-memory DC → rack → data-node → volume tree. Rebuilt from
/// heartbeats: after a master election the new leader starts with an
/// empty tree and repopulates it within one heartbeat pulse — there is no
/// persisted topology state.
#[derive(Default)]
pub struct Topology {
    inner: RwLock<Inner>,
}

impl Topology {
    pub fn new() -> Self {
        Self::default()
    }

    fn get_or_create_dc(inner: &mut Inner, name: &str) -> DcId {
        if let Some(id) = inner.dc_by_name.get(name) {
            return *id;
        }
        let id = DcId(inner.dcs.len());
        inner.dcs.push(DataCenterEntry {
            name: name.to_string(),
            racks: Vec::new(),
            capacity: Capacity::default(),
        });
        inner.dc_by_name.insert(name.to_string(), id);
        id
    }

    fn get_or_create_rack(inner: &mut Inner, dc: DcId, name: &str) -> RackId {
        let key = (dc, name.to_string());
        if let Some(id) = inner.rack_by_key.get(&key) {
            return *id;
        }
        let id = RackId(inner.racks.len());
        inner.racks.push(RackEntry {
            name: name.to_string(),
            dc,
            nodes: Vec::new(),
            capacity: Capacity::default(),
        });
        inner.rack_by_key.insert(key, id);
        inner.dcs[dc.0].racks.push(id);
        id
    }

    fn get_or_create_node(inner: &mut Inner, rack: RackId, address: &str) -> DataNodeId {
        if let Some(id) = inner.node_by_addr.get(address) {
            return *id;
        }
        let id = DataNodeId(inner.nodes.len());
        inner.nodes.push(DataNodeEntry {
            address: address.to_string(),
            public_url: address.to_string(),
            rack,
            max_volume_counts: HashMap::new(),
            volumes: HashMap::new(),
            capacity: Capacity::default(),
        });
        inner.node_by_addr.insert(address.to_string(), id);
        inner.racks[rack.0].nodes.push(id);
        id
    }

    /// Merges one heartbeat snapshot/delta into the tree: finds-or-creates
    /// the dc/rack/node path, replaces this node's reported volume set,
    /// then recomputes every ancestor's summed capacity.
    pub fn merge_heartbeat(
        &self,
        dc: &str,
        rack: &str,
        address: &str,
        public_url: &str,
        max_bytes: u64,
        volumes: impl IntoIterator<Item = (VolumeId, u64)>,
    ) {
        let mut inner = self.inner.write();
        let dc_id = Self::get_or_create_dc(&mut inner, dc);
        let rack_id = Self::get_or_create_rack(&mut inner, dc_id, rack);
        let node_id = Self::get_or_create_node(&mut inner, rack_id, address);

        {
            let node = &mut inner.nodes[node_id.0];
            node.public_url = public_url.to_string();
            node.volumes = volumes.into_iter().collect();
            node.capacity = Capacity {
                max_bytes,
                used_bytes: node.volumes.values().sum(),
                volume_count: node.volumes.len() as u32,
                ec_shard_count: node.capacity.ec_shard_count,
            };
        }

        self.recompute_ancestors(&mut inner, rack_id, dc_id);
    }

    pub fn remove_node(&self, address: &str) {
        let mut inner = self.inner.write();
        let Some(node_id) = inner.node_by_addr.remove(address) else {
            return;
        };
        let rack_id = inner.nodes[node_id.0].rack;
        inner.racks[rack_id.0].nodes.retain(|n| *n != node_id);
        inner.nodes[node_id.0].capacity = Capacity::default();
        inner.nodes[node_id.0].volumes.clear();
        let dc_id = inner.racks[rack_id.0].dc;
        self.recompute_ancestors(&mut inner, rack_id, dc_id);
    }

    fn recompute_ancestors(&self, inner: &mut Inner, rack: RackId, dc: DcId) {
        let rack_capacity = sum_capacity(inner.racks[rack.0].nodes.iter().map(|n| inner.nodes[n.0].capacity));
        inner.racks[rack.0].capacity = rack_capacity;

        let dc_capacity = sum_capacity(inner.dcs[dc.0].racks.iter().map(|r| inner.racks[r.0].capacity));
        inner.dcs[dc.0].capacity = dc_capacity;
    }

    pub fn dc_count(&self) -> usize {
        self.inner.read().dcs.len()
    }

    pub fn locate_volume(&self, volume_id: VolumeId) -> Vec<String> {
        let inner = self.inner.read();
        inner
            .nodes
            .iter()
            .filter(|n| n.volumes.contains_key(&volume_id))
            .map(|n| n.address.clone())
            .collect()
    }

    /// Same as [`Topology::locate_volume`] but resolved with each hosting
    /// node's public URL and data center name, for `LookupVolume` and
    /// `KeepConnected` responses.
    pub fn locate_volume_nodes(&self, volume_id: VolumeId) -> Vec<NodeLocation> {
        let inner = self.inner.read();
        inner
            .nodes
            .iter()
            .filter(|n| n.volumes.contains_key(&volume_id))
            .map(|n| NodeLocation {
                address: n.address.clone(),
                public_url: n.public_url.clone(),
                data_center: inner.dcs[inner.racks[n.rack.0].dc.0].name.clone(),
            })
            .collect()
    }

    /// Every `(volume_id, locations)` pair currently known, for a
    /// `KeepConnected` full snapshot.
    pub fn all_volume_locations(&self) -> Vec<(VolumeId, Vec<NodeLocation>)> {
        self.all_volume_ids()
            .into_iter()
            .map(|vid| (vid, self.locate_volume_nodes(vid)))
            .collect()
    }

    /// Every distinct volume id known from current heartbeats, for the
    /// vacuum loop to walk. Cheap to call periodically: built fresh from
    /// the node table rather than maintained incrementally, since vacuum
    /// runs on the order of once an hour.
    pub fn all_volume_ids(&self) -> Vec<VolumeId> {
        let inner = self.inner.read();
        let mut ids: Vec<VolumeId> = inner
            .nodes
            .iter()
            .flat_map(|n| n.volumes.keys().copied())
            .collect();
        ids.sort();
        ids.dedup();
        ids
    }

    /// Picks `count` distinct data centers weighted by free bytes, for the
    /// first step of the volume-growth algorithm.
    pub fn pick_data_centers(&self, count: usize) -> Vec<DcId> {
        let inner = self.inner.read();
        let candidates: Vec<(DcId, u64)> = inner
            .dcs
            .iter()
            .enumerate()
            .map(|(i, dc)| (DcId(i), dc.capacity.free_bytes()))
            .collect();
        weighted_sample_without_replacement(&candidates, count)
    }

    pub fn pick_racks(&self, dc: DcId, count: usize) -> Vec<RackId> {
        let inner = self.inner.read();
        let candidates: Vec<(RackId, u64)> = inner.dcs[dc.0]
            .racks
            .iter()
            .map(|r| (*r, inner.racks[r.0].capacity.free_bytes()))
            .collect();
        weighted_sample_without_replacement(&candidates, count)
    }

    pub fn pick_nodes(&self, rack: RackId, count: usize) -> Vec<DataNodeId> {
        let inner = self.inner.read();
        let candidates: Vec<(DataNodeId, u64)> = inner.racks[rack.0]
            .nodes
            .iter()
            .map(|n| (*n, inner.nodes[n.0].capacity.free_bytes()))
            .collect();
        weighted_sample_without_replacement(&candidates, count)
    }

    pub fn node_address(&self, node: DataNodeId) -> String {
        self.inner.read().nodes[node.0].address.clone()
    }

    /// Resolves a freshly-picked node id to its address/public URL/data
    /// center, without requiring the node to have already reported a
    /// volume for it — used right after growth, before the next
    /// heartbeat has folded the new volume into [`Topology::locate_volume_nodes`].
    pub fn node_location(&self, node: DataNodeId) -> NodeLocation {
        let inner = self.inner.read();
        let n = &inner.nodes[node.0];
        NodeLocation {
            address: n.address.clone(),
            public_url: n.public_url.clone(),
            data_center: inner.dcs[inner.racks[n.rack.0].dc.0].name.clone(),
        }
    }

    /// One row per known data node, for `VolumeList`.
    pub fn all_nodes(&self) -> Vec<DataNodeSummary> {
        let inner = self.inner.read();
        inner
            .nodes
            .iter()
            .map(|n| {
                let dc = &inner.dcs[inner.racks[n.rack.0].dc.0];
                let max_volume_count: u32 = n.max_volume_counts.values().sum();
                DataNodeSummary {
                    address: n.address.clone(),
                    public_url: n.public_url.clone(),
                    data_center: dc.name.clone(),
                    rack: inner.racks[n.rack.0].name.clone(),
                    max_volume_count,
                    free_volume_count: max_volume_count.saturating_sub(n.capacity.volume_count),
                }
            })
            .collect()
    }

    /// Summed `(max_bytes, used_bytes)` across the whole tree, for
    /// `Statistics`.
    pub fn total_capacity(&self) -> (u64, u64) {
        let inner = self.inner.read();
        let total = sum_capacity(inner.dcs.iter().map(|dc| dc.capacity));
        (total.max_bytes, total.used_bytes)
    }
}

/// Flat summary of one data node, for `VolumeList` responses.
#[derive(Debug, Clone)]
pub struct DataNodeSummary {
    pub address: String,
    pub public_url: String,
    pub data_center: String,
    pub rack: String,
    pub max_volume_count: u32,
    pub free_volume_count: u32,
}

fn sum_capacity(items: impl Iterator<Item = Capacity>) -> Capacity {
    let mut total = Capacity::default();
    for c in items {
        total.max_bytes += c.max_bytes;
        total.used_bytes += c.used_bytes;
        total.volume_count += c.volume_count;
        total.ec_shard_count += c.ec_shard_count;
    }
    total
}

/// Weighted-random sampling without replacement: repeatedly draws one
/// index with probability proportional to its remaining weight and
/// removes it from the pool. Zero-weight candidates are still eligible
/// (uniformly, among themselves) so an empty-but-present node isn't
/// starved forever.
fn weighted_sample_without_replacement<T: Copy>(candidates: &[(T, u64)], count: usize) -> Vec<T> {
    let mut pool: Vec<(T, u64)> = candidates.to_vec();
    let mut chosen = Vec::with_capacity(count.min(pool.len()));
    let mut rng = rand::thread_rng();

    while chosen.len() < count && !pool.is_empty() {
        let total_weight: u64 = pool.iter().map(|(_, w)| w + 1).sum();
        let mut target = rng.gen_range(0..total_weight);
        let mut idx = 0;
        for (i, (_, w)) in pool.iter().enumerate() {
            let weight = w + 1;
            if target < weight {
                idx = i;
                break;
            }
            target -= weight;
        }
        chosen.push(pool.remove(idx).0);
    }
    chosen
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_heartbeat_recomputes_ancestor_capacity() {
        let topo = Topology::new();
        topo.merge_heartbeat("dc1", "rack1", "10.0.0.1:8080", "10.0.0.1:8080", 1000, [(VolumeId(1), 100)]);
        topo.merge_heartbeat("dc1", "rack1", "10.0.0.2:8080", "10.0.0.2:8080", 1000, [(VolumeId(2), 200)]);

        let inner = topo.inner.read();
        assert_eq!(inner.dcs[0].capacity.used_bytes, 300);
        assert_eq!(inner.dcs[0].capacity.volume_count, 2);
        assert_eq!(inner.racks[0].capacity.max_bytes, 2000);
    }

    #[test]
    fn locate_volume_finds_all_hosting_nodes() {
        let topo = Topology::new();
        topo.merge_heartbeat("dc1", "rack1", "a:1", "a:1", 1000, [(VolumeId(7), 10)]);
        topo.merge_heartbeat("dc1", "rack2", "b:1", "b:1", 1000, [(VolumeId(7), 10)]);
        let mut locs = topo.locate_volume(VolumeId(7));
        locs.sort();
        assert_eq!(locs, vec!["a:1".to_string(), "b:1".to_string()]);
    }

    #[test]
    fn pick_data_centers_never_duplicates() {
        let topo = Topology::new();
        for i in 0..5 {
            topo.merge_heartbeat(&format!("dc{i}"), "rack1", &format!("n{i}:1"), &format!("n{i}:1"), 1000, []);
        }
        let picked = topo.pick_data_centers(3);
        assert_eq!(picked.len(), 3);
        let mut unique = picked.clone();
        unique.sort_by_key(|d| d.0);
        unique.dedup();
        assert_eq!(unique.len(), 3);
    }

    #[test]
    fn remove_node_clears_capacity_and_membership() {
        let topo = Topology::new();
        topo.merge_heartbeat("dc1", "rack1", "a:1", "a:1", 1000, [(VolumeId(1), 500)]);
        topo.remove_node("a:1");
        assert!(topo.locate_volume(VolumeId(1)).is_empty());
    }

    #[test]
    fn all_volume_ids_dedupes_across_replicas() {
        let topo = Topology::new();
        topo.merge_heartbeat("dc1", "rack1", "a:1", "a:1", 1000, [(VolumeId(1), 100), (VolumeId(2), 50)]);
        topo.merge_heartbeat("dc1", "rack2", "b:1", "b:1", 1000, [(VolumeId(1), 100)]);
        assert_eq!(topo.all_volume_ids(), vec![VolumeId(1), VolumeId(2)]);
    }
}
