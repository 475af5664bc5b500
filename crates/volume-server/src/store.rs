//! Owns every `DiskLocation` this process mounts. A `Store` is the single
//! place that knows which physical directory a volume id lives under;
//! everything above it (HTTP, gRPC, heartbeat) asks the store, never a
//! `DiskLocation` directly.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use common::{CommonError, DiskType, VolumeId};
use needle_store::{DiskLocation, DiskLocationOptions, Volume, VolumeOptions};

pub struct Store {
    locations: Vec<Arc<DiskLocation>>,
    /// Highest needle key this process has ever written or replicated,
    /// across every mounted volume; reported as `max_file_key` in
    /// heartbeats so the master's per-volume sequencer never reissues one.
    observed_max_file_key: AtomicU64,
}

impl Store {
    pub fn new(locations: Vec<Arc<DiskLocation>>) -> Self {
        let observed_max = locations
            .iter()
            .flat_map(|loc| loc.volume_ids().into_iter().filter_map(|id| loc.get(id)))
            .filter_map(|v| v.max_key())
            .map(|k| k.0)
            .max()
            .unwrap_or(0);
        Self {
            locations,
            observed_max_file_key: AtomicU64::new(observed_max),
        }
    }

    pub fn observe_file_key(&self, key: u64) {
        self.observed_max_file_key.fetch_max(key, Ordering::Relaxed);
    }

    pub fn max_file_key(&self) -> u64 {
        self.observed_max_file_key.load(Ordering::Relaxed)
    }

    pub fn find_volume(&self, id: VolumeId) -> Option<Arc<Volume>> {
        self.locations.iter().find_map(|loc| loc.get(id))
    }

    pub fn all_volume_ids(&self) -> Vec<VolumeId> {
        self.locations.iter().flat_map(|loc| loc.volume_ids()).collect()
    }

    pub fn locations(&self) -> &[Arc<DiskLocation>] {
        &self.locations
    }

    /// Picks the location with the most free space among those still
    /// accepting growth for `disk_type`, mirroring the master's
    /// weighted-by-free-capacity placement at the single-process level.
    pub fn pick_location_for_growth(&self, disk_type: DiskType) -> Option<&Arc<DiskLocation>> {
        self.locations
            .iter()
            .filter(|loc| loc.disk_type() == disk_type && loc.accepts_growth())
            .max_by_key(|loc| loc.free_space_bytes())
    }

    /// Mounts a brand-new empty volume on the best-fitting location for
    /// `options.disk_type`, or returns the volume already mounted under
    /// `id` if one exists on any location.
    pub fn open_or_create_volume(&self, id: VolumeId, options: VolumeOptions) -> Result<Arc<Volume>, CommonError> {
        if let Some(existing) = self.find_volume(id) {
            return Ok(existing);
        }
        let disk_type = options.disk_type;
        let location = self
            .pick_location_for_growth(disk_type)
            .ok_or(CommonError::OutOfSpace { needed: 0, available: 0 })?;
        location.open_or_create_volume(id, options)
    }

    /// Destroys a volume wherever it is mounted; a no-op if it isn't.
    pub fn destroy_volume(&self, id: VolumeId) -> Result<(), CommonError> {
        for location in &self.locations {
            if location.get(id).is_some() {
                return location.destroy_volume(id);
            }
        }
        Ok(())
    }

    /// Sweeps every location for TTL-expired volumes, returning the ids
    /// destroyed; feeds the heartbeat's `deleted_volumes` field.
    pub fn sweep_expired(&self, ttl_grace_secs: u64, now_secs: u64) -> Vec<VolumeId> {
        self.locations
            .iter()
            .flat_map(|loc| loc.sweep_expired(ttl_grace_secs, now_secs))
            .collect()
    }

    pub fn short_info(&self, volume: &Volume) -> rpc::VolumeShortInfo {
        let (live, deleted) = volume.needle_counts();
        rpc::VolumeShortInfo {
            id: volume.id.0,
            collection: volume.collection().0.clone(),
            replica_placement: volume.replica_placement().to_string(),
            ttl_minutes: volume.ttl().0 / 60,
            disk_type: volume.disk_type().to_string(),
            size: volume.size_bytes(),
            file_count: live,
            delete_count: deleted,
            deleted_byte_count: volume.deleted_byte_count(),
            read_only: volume.is_read_only(),
            is_remote: false,
            compaction_revision: volume.compaction_revision() as u64,
        }
    }

    pub fn all_short_infos(&self) -> Vec<rpc::VolumeShortInfo> {
        self.locations
            .iter()
            .flat_map(|loc| loc.volume_ids())
            .filter_map(|id| self.find_volume(id))
            .map(|v| self.short_info(&v))
            .collect()
    }
}

/// Builds one `DiskLocation` per configured directory.
pub fn build_locations(
    dirs: &[crate::config::DirSpec],
    max_volume_count: usize,
    min_free_space_bytes: u64,
    capacity_bytes: u64,
) -> Result<Vec<Arc<DiskLocation>>, CommonError> {
    dirs.iter()
        .map(|dir| {
            Ok(Arc::new(DiskLocation::new(DiskLocationOptions {
                directory: dir.path.clone(),
                disk_type: dir.disk_type,
                max_volume_count,
                min_free_space_bytes,
                capacity_bytes,
            })?))
        })
        .collect()
}
