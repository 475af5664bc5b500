use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use common::{CommonError, JwtSigner, VolumeId};
use consensus::ConsensusNode;
use dashmap::DashMap;
use topology::{GrowerHandle, LayoutKey, Topology, VolumeLayout};

use crate::config::MasterConfig;

/// Everything one master process holds in memory. Built once at startup
/// and shared (via `Arc`) between the HTTP handlers, the gRPC service
/// impls, the grower loop and the vacuum loop. Per §4.5, only
/// `consensus`'s replicated `maxVolumeId` and membership outlive an
/// election; `topology` and `layouts` are rebuilt from scratch by the new
/// leader within one heartbeat pulse.
pub struct MasterState {
    pub config: MasterConfig,
    pub topology: Topology,
    pub registry: cluster_registry::ClusterRegistry,
    pub consensus: ConsensusNode,
    pub layouts: DashMap<LayoutKey, Arc<VolumeLayout>>,
    /// Reverse index from a grown volume back to the layout it belongs
    /// to, so the vacuum loop can re-admit a volume to the right
    /// writable set after a successful compact/commit without scanning
    /// every layout.
    pub volume_layout_keys: DashMap<VolumeId, LayoutKey>,
    pub grower: GrowerHandle,
    pub write_jwt: JwtSigner,
    pub read_jwt: JwtSigner,
    /// Per-volume local file-key sequencer. Not replicated: a volume's
    /// counter is seeded from the highest key any replica has ever
    /// reported in a heartbeat, so a newly elected leader never reissues
    /// a key below what's already on disk (per §4.3 step 4) even though
    /// it starts with an empty in-memory table.
    pub file_key_counters: DashMap<VolumeId, AtomicU64>,
    /// Replica locations for a volume that was just grown, kept until
    /// the hosting nodes' next heartbeat folds it into `topology` proper.
    /// `Assign` falls back to this when `locate_volume_nodes` comes back
    /// empty for a volume minted this pulse.
    pub pending_replicas: DashMap<VolumeId, Vec<topology::NodeLocation>>,
}

impl MasterState {
    /// Reserves the next strictly-increasing file key for `vid`.
    pub fn next_file_key(&self, vid: VolumeId) -> u64 {
        self.reserve_file_keys(vid, 1)
    }

    /// Reserves `count` sequential file keys for `vid`, returning the
    /// first one (per §4.3 step 4, keys within a volume are strictly
    /// increasing; the caller hands out `[start, start+count)`).
    pub fn reserve_file_keys(&self, vid: VolumeId, count: u64) -> u64 {
        let count = count.max(1);
        self.file_key_counters
            .entry(vid)
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(count, Ordering::SeqCst)
            + 1
    }

    /// Bumps `vid`'s counter up to at least `seen`, called from the
    /// heartbeat merge path with each replica's reported `max_file_key`.
    pub fn observe_file_key(&self, vid: VolumeId, seen: u64) {
        let counter = self.file_key_counters.entry(vid).or_insert_with(|| AtomicU64::new(0));
        counter.fetch_max(seen, Ordering::SeqCst);
    }

    pub fn layout_for(&self, key: &LayoutKey) -> Arc<VolumeLayout> {
        if let Some(existing) = self.layouts.get(key) {
            return existing.clone();
        }
        let layout = Arc::new(VolumeLayout::new(self.config.volume_size_limit_mb as u64 * 1024 * 1024));
        self.layouts.insert(key.clone(), layout.clone());
        layout
    }

    pub fn layout_for_volume(&self, vid: VolumeId) -> Option<Arc<VolumeLayout>> {
        let key = self.volume_layout_keys.get(&vid)?;
        self.layouts.get(&*key).map(|l| l.clone())
    }

    /// True when this node currently believes itself to be the raft
    /// leader; callers that must write (assign, grow, vacuum-commit)
    /// check this first and otherwise report `NotLeader` so the caller
    /// can retry against the real leader.
    pub fn is_leader(&self) -> bool {
        self.consensus.leader() == Some(self.consensus.id())
    }

    pub fn require_leader(&self) -> Result<(), CommonError> {
        if self.is_leader() {
            Ok(())
        } else {
            Err(CommonError::NotLeader {
                leader: self.consensus.leader().map(|id| id.to_string()),
            })
        }
    }
}
