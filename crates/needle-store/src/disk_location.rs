use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use common::{CommonError, DiskType, VolumeId};
use fs2::FileExt;
use parking_lot::RwLock;
use tracing::{info, warn};
use uuid::Uuid;

use crate::volume::{Volume, VolumeOptions};

pub struct DiskLocationOptions {
    pub directory: PathBuf,
    pub disk_type: DiskType,
    pub max_volume_count: usize,
    pub min_free_space_bytes: u64,
    /// Configured total capacity of the backing mount; used only to derive
    /// [`DiskLocation::free_space_bytes`] since this workspace does not
    /// shell out to `statvfs`.
    pub capacity_bytes: u64,
}

/// A directory holding many volumes, with a disk-type tag and capacity
/// guards the placement engine consults before assigning a new volume here.
/// Exclusively owned by one `Store` per §9's ownership rule.
pub struct DiskLocation {
    options: DiskLocationOptions,
    volumes: RwLock<HashMap<VolumeId, Arc<Volume>>>,
    // Held for the lifetime of the location: releases automatically on
    // drop, so a second mount of the same directory (e.g. a misconfigured
    // second process, or this one restarted with a stale instance still
    // running) fails fast at startup instead of silently corrupting data.
    _lock_file: File,
    uuid: Uuid,
}

impl DiskLocation {
    pub fn new(options: DiskLocationOptions) -> Result<Self, CommonError> {
        std::fs::create_dir_all(&options.directory)?;

        let lock_path = options.directory.join(".lock");
        let lock_file = OpenOptions::new().read(true).write(true).create(true).open(&lock_path)?;
        lock_file.try_lock_exclusive().map_err(|e| {
            CommonError::Internal(format!(
                "directory {} is already locked by another process: {e}",
                options.directory.display()
            ))
        })?;

        let uuid = read_or_create_uuid(&options.directory)?;

        Ok(Self {
            options,
            volumes: RwLock::new(HashMap::new()),
            _lock_file: lock_file,
            uuid,
        })
    }

    /// Stable identity of this directory, persisted in `.uuid` alongside
    /// `.lock`. Reported in heartbeats so the master can tell a genuine
    /// second mount of the same disk apart from two distinct directories
    /// that happen to share a network path, per `DuplicatedUuids`.
    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    pub fn directory(&self) -> &Path {
        &self.options.directory
    }

    pub fn disk_type(&self) -> DiskType {
        self.options.disk_type
    }

    pub fn volume_count(&self) -> usize {
        self.volumes.read().len()
    }

    pub fn has_free_volume_slot(&self) -> bool {
        self.volume_count() < self.options.max_volume_count
    }

    /// Best-effort available-space probe; real deployments would statvfs the
    /// mount, here we derive it from the configured capacity minus what's
    /// currently occupied so the placement engine can still weight by free
    /// capacity in tests.
    pub fn free_space_bytes(&self) -> u64 {
        let used: u64 = self.volumes.read().values().map(|v| v.size_bytes()).sum();
        self.options.capacity_bytes.saturating_sub(used)
    }

    /// Whether this location should still accept new volume growth: it has
    /// a free volume slot and free space above the configured guard.
    pub fn accepts_growth(&self) -> bool {
        self.has_free_volume_slot() && self.free_space_bytes() > self.options.min_free_space_bytes
    }

    pub fn get(&self, id: VolumeId) -> Option<Arc<Volume>> {
        self.volumes.read().get(&id).cloned()
    }

    pub fn volume_ids(&self) -> Vec<VolumeId> {
        self.volumes.read().keys().copied().collect()
    }

    /// Mounts an existing volume directory entry, or creates an empty one
    /// if `id` has never been seen here (the volume-growth RPC path).
    pub fn open_or_create_volume(&self, id: VolumeId, options: VolumeOptions) -> Result<Arc<Volume>, CommonError> {
        if let Some(existing) = self.get(id) {
            return Ok(existing);
        }
        if !self.has_free_volume_slot() {
            return Err(CommonError::OutOfSpace {
                needed: 0,
                available: 0,
            });
        }
        let volume = Arc::new(Volume::open(&self.options.directory, id, options)?);
        self.volumes.write().insert(id, volume.clone());
        info!(volume_id = id.0, dir = %self.options.directory.display(), "volume mounted");
        Ok(volume)
    }

    /// Deletes a volume's data, index and `.vif` files from disk and drops
    /// it from the in-memory map. Used for admin-triggered destruction and
    /// TTL-expiry sweeps.
    pub fn destroy_volume(&self, id: VolumeId) -> Result<(), CommonError> {
        self.volumes.write().remove(&id);
        for ext in ["dat", "idx", "vif"] {
            let path = self.options.directory.join(format!("{}.{}", id.0, ext));
            if path.exists() {
                std::fs::remove_file(&path)?;
            }
        }
        warn!(volume_id = id.0, "volume destroyed");
        Ok(())
    }

    /// Scans every mounted volume for TTL expiry past grace and destroys
    /// it, returning the destroyed volume IDs for the heartbeat's
    /// `DeletedVolumes` field.
    pub fn sweep_expired(&self, ttl_grace_secs: u64, now_secs: u64) -> Vec<VolumeId> {
        let candidates: Vec<VolumeId> = self
            .volumes
            .read()
            .iter()
            .filter_map(|(id, vol)| {
                if vol.is_expired(ttl_grace_secs, now_secs) {
                    Some(*id)
                } else {
                    None
                }
            })
            .collect();

        let mut destroyed = Vec::with_capacity(candidates.len());
        for id in candidates {
            if self.destroy_volume(id).is_ok() {
                destroyed.push(id);
            }
        }
        destroyed
    }
}

/// Reads this directory's persisted identity, or mints and persists a new
/// one on first mount.
fn read_or_create_uuid(directory: &Path) -> Result<Uuid, CommonError> {
    let path = directory.join(".uuid");
    if let Ok(raw) = std::fs::read_to_string(&path) {
        if let Ok(id) = raw.trim().parse() {
            return Ok(id);
        }
    }
    let id = Uuid::new_v4();
    std::fs::write(&path, id.to_string())?;
    Ok(id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::ReplicaPlacement;

    fn opts(dir: PathBuf) -> DiskLocationOptions {
        DiskLocationOptions {
            directory: dir,
            disk_type: DiskType::Hdd,
            max_volume_count: 2,
            min_free_space_bytes: 1024,
            capacity_bytes: 10 * 1024 * 1024 * 1024,
        }
    }

    #[test]
    fn enforces_max_volume_count() {
        let dir = tempfile::tempdir().unwrap();
        let loc = DiskLocation::new(opts(dir.path().to_path_buf())).unwrap();
        let vol_opts = || VolumeOptions {
            replica_placement: ReplicaPlacement::NONE,
            ..VolumeOptions::default()
        };
        loc.open_or_create_volume(VolumeId(1), vol_opts()).unwrap();
        loc.open_or_create_volume(VolumeId(2), vol_opts()).unwrap();
        assert!(loc.open_or_create_volume(VolumeId(3), vol_opts()).is_err());
    }

    #[test]
    fn uuid_survives_remount() {
        let dir = tempfile::tempdir().unwrap();
        let first = DiskLocation::new(opts(dir.path().to_path_buf())).unwrap().uuid();
        drop(DiskLocation::new(opts(dir.path().to_path_buf())).unwrap());
        let second = DiskLocation::new(opts(dir.path().to_path_buf())).unwrap().uuid();
        assert_eq!(first, second);
    }

    #[test]
    fn destroy_removes_files_and_map_entry() {
        let dir = tempfile::tempdir().unwrap();
        let loc = DiskLocation::new(opts(dir.path().to_path_buf())).unwrap();
        loc.open_or_create_volume(VolumeId(1), VolumeOptions::default()).unwrap();
        loc.destroy_volume(VolumeId(1)).unwrap();
        assert!(loc.get(VolumeId(1)).is_none());
        assert!(!dir.path().join("1.dat").exists());
    }
}
