use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use common::{Collection, CommonError, Cookie, DiskType, NeedleKey, ReplicaPlacement, Ttl, VolumeId};
use parking_lot::{Mutex, RwLock};
use tracing::{info, warn};

use crate::codec::{self, DecodedNeedle, Needle, SuperBlock, NEEDLE_ALIGNMENT, SUPER_BLOCK_SIZE};
use crate::index::{rewrite_index_file, IndexEntry, InMemoryIndex, NeedleIndex, OnDiskIndex};

/// Threshold above which a volume opens its index in the on-disk (ordered
/// KV, write-through-cached) backend instead of a plain `HashMap`. Picked
/// per the design note: the in-memory map is the default, the disk-backed
/// one exists for volumes too large to comfortably index in RAM.
pub const ON_DISK_INDEX_THRESHOLD: u64 = 2_000_000;

/// Default volume size limit: matches upstream SeaweedFS's 30 GiB default,
/// safely under the 32 GiB addressable ceiling the 32-bit offset unit caps
/// us at (`2^32 * 8` bytes).
pub const DEFAULT_SIZE_LIMIT_BYTES: u64 = 30 * 1024 * 1024 * 1024;

pub struct VolumeOptions {
    pub collection: Collection,
    pub replica_placement: ReplicaPlacement,
    pub ttl: Ttl,
    pub disk_type: DiskType,
    pub size_limit_bytes: u64,
}

impl Default for VolumeOptions {
    fn default() -> Self {
        Self {
            collection: Collection::default(),
            replica_placement: ReplicaPlacement::NONE,
            ttl: Ttl::NONE,
            disk_type: DiskType::default(),
            size_limit_bytes: DEFAULT_SIZE_LIMIT_BYTES,
        }
    }
}

#[derive(serde::Serialize, serde::Deserialize)]
struct VolumeMeta {
    created_at_secs: u64,
}

pub struct WriteResult {
    pub offset: u64,
    pub size: u32,
    pub unchanged: bool,
}

pub struct ReadResult {
    pub needle: Needle,
}

struct Inner {
    index: Box<dyn NeedleIndex>,
    next_offset: u64,
    super_block: SuperBlock,
    garbage_bytes: u64,
    live_bytes: u64,
}

/// One mounted volume: an append-only data file plus its index, guarded so
/// writers and the index update together atomically while readers never
/// observe a torn state (they either see the index before or after a
/// given write — never mid-update).
pub struct Volume {
    pub id: VolumeId,
    data_path: PathBuf,
    index_path: PathBuf,
    data_file: File,
    inner: RwLock<Inner>,
    options: VolumeOptions,
    read_only: AtomicBool,
    last_io_error: Mutex<Option<String>>,
    size: AtomicU64,
    created_at_secs: u64,
    /// Highest `append_at_ns` footer value ever written to this volume;
    /// the watermark `VolumeSyncStatus`/`VolumeIncrementalCopy` use to
    /// decide how far behind a lagging replica is.
    last_append_ns: AtomicU64,
}

fn now_ns() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

impl Volume {
    /// Mounts a volume directory entry `<dir>/<id>.dat` + `<dir>/<id>.idx`,
    /// creating both if absent, and recovering a partial tail if the data
    /// file's last record is truncated.
    pub fn open(dir: impl AsRef<Path>, id: VolumeId, options: VolumeOptions) -> Result<Self, CommonError> {
        let dir = dir.as_ref();
        let data_path = dir.join(format!("{}.dat", id.0));
        let index_path = dir.join(format!("{}.idx", id.0));
        let vif_path = dir.join(format!("{}.vif", id.0));

        let is_new = !data_path.exists();
        let created_at_secs = if is_new {
            let secs = now_secs();
            let meta = VolumeMeta { created_at_secs: secs };
            let encoded = serde_json::to_vec(&meta).map_err(|e| CommonError::Internal(e.to_string()))?;
            std::fs::write(&vif_path, encoded)?;
            secs
        } else if vif_path.exists() {
            let raw = std::fs::read(&vif_path)?;
            let meta: VolumeMeta = serde_json::from_slice(&raw).map_err(|e| CommonError::Internal(e.to_string()))?;
            meta.created_at_secs
        } else {
            now_secs()
        };
        let data_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&data_path)?;

        let super_block = if is_new {
            let sb = SuperBlock::new(options.replica_placement, ttl_to_minutes(options.ttl));
            data_file.write_all_at(&sb.encode(), 0)?;
            sb
        } else {
            let mut buf = [0u8; SUPER_BLOCK_SIZE];
            data_file.read_exact_at(&mut buf, 0)?;
            SuperBlock::decode(&buf)?
        };

        let file_len = data_file.metadata()?.len();
        let (entries, recovered_up_to, live_bytes, garbage_bytes, last_append_ns) =
            scan_and_recover(&data_file, id.0, file_len)?;

        if recovered_up_to < file_len {
            warn!(
                volume_id = id.0,
                recovered_up_to,
                original_len = file_len,
                "truncating partial tail found at mount"
            );
            data_file.set_len(recovered_up_to)?;
        }

        let index: Box<dyn NeedleIndex> = if entries.len() as u64 > ON_DISK_INDEX_THRESHOLD {
            let mut on_disk = OnDiskIndex::open(&index_path)?;
            for (key, entry) in entries {
                on_disk.put(key, entry)?;
            }
            Box::new(on_disk)
        } else {
            Box::new(InMemoryIndex::from_entries(entries))
        };
        // Persist a fresh index file either way so a future mount's on-disk
        // backend (or an operator inspecting `.idx`) sees authoritative data.
        rewrite_index_file(&index_path, &index.scan())?;

        Ok(Self {
            id,
            data_path,
            index_path,
            data_file,
            inner: RwLock::new(Inner {
                index,
                next_offset: recovered_up_to,
                super_block,
                garbage_bytes,
                live_bytes,
            }),
            options,
            read_only: AtomicBool::new(false),
            last_io_error: Mutex::new(None),
            size: AtomicU64::new(recovered_up_to),
            created_at_secs,
            last_append_ns: AtomicU64::new(last_append_ns),
        })
    }

    /// Highest `append_at_ns` footer value written so far; `0` for a
    /// never-written volume.
    pub fn last_append_ns(&self) -> u64 {
        self.last_append_ns.load(Ordering::Acquire)
    }

    fn bump_last_append_ns(&self, append_at_ns: u64) {
        self.last_append_ns.fetch_max(append_at_ns, Ordering::AcqRel);
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only.load(Ordering::Acquire)
    }

    pub fn mark_read_only(&self, reason: impl Into<String>) {
        let reason = reason.into();
        warn!(volume_id = self.id.0, %reason, "marking volume read-only");
        self.read_only.store(true, Ordering::Release);
        *self.last_io_error.lock() = Some(reason);
    }

    pub fn size_bytes(&self) -> u64 {
        self.size.load(Ordering::Acquire)
    }

    pub fn garbage_ratio(&self) -> f64 {
        let inner = self.inner.read();
        let total = inner.live_bytes + inner.garbage_bytes;
        if total == 0 {
            0.0
        } else {
            inner.garbage_bytes as f64 / total as f64
        }
    }

    pub fn compaction_revision(&self) -> u16 {
        self.inner.read().super_block.compaction_revision
    }

    pub fn deleted_byte_count(&self) -> u64 {
        self.inner.read().garbage_bytes
    }

    pub fn collection(&self) -> &Collection {
        &self.options.collection
    }

    pub fn replica_placement(&self) -> ReplicaPlacement {
        self.inner.read().super_block.replica_placement
    }

    pub fn ttl(&self) -> Ttl {
        self.options.ttl
    }

    pub fn disk_type(&self) -> DiskType {
        self.options.disk_type
    }

    /// Highest needle key currently indexed, if any; used at mount to seed
    /// a volume server's own `max_file_key` watermark.
    pub fn max_key(&self) -> Option<NeedleKey> {
        self.inner.read().index.scan().into_iter().map(|(k, _)| k).max()
    }

    /// Counts live vs tombstoned index entries. Cheap: walks the in-memory
    /// index, never touches the data file.
    pub fn needle_counts(&self) -> (u64, u64) {
        let inner = self.inner.read();
        let mut live = 0u64;
        let mut deleted = 0u64;
        for (_, entry) in inner.index.scan() {
            if entry.is_tombstone() {
                deleted += 1;
            } else {
                live += 1;
            }
        }
        (live, deleted)
    }

    /// True once `ttl + grace` has elapsed since this volume was created.
    /// The volume server's heartbeat loop destroys volumes for which this
    /// returns true; grace bounds how aggressively that happens so a
    /// restarted volume server doesn't flap a volume in and out of
    /// existence right at its TTL boundary.
    pub fn is_expired(&self, grace_secs: u64, now_secs: u64) -> bool {
        if !self.options.ttl.is_set() {
            return false;
        }
        let created_secs = self.created_at_secs;
        created_secs + self.options.ttl.0 as u64 + grace_secs <= now_secs
    }

    fn io_fail(&self, err: std::io::Error) -> CommonError {
        self.mark_read_only(err.to_string());
        CommonError::Io(err)
    }

    /// Appends `needle` to the data file and updates the in-memory index.
    /// `unchanged` is true when an identical live needle already occupied
    /// this key and no new bytes were written.
    pub fn write(&self, needle: Needle) -> Result<WriteResult, CommonError> {
        if self.is_read_only() {
            return Err(CommonError::VolumeReadOnly(self.id.0));
        }

        let mut inner = self.inner.write();

        if let Some(existing) = inner.index.get(needle.key) {
            if !existing.is_tombstone() {
                if let Ok(prior) = self.read_raw(existing) {
                    if prior.needle.payload == needle.payload
                        && prior.needle.name == needle.name
                        && prior.needle.mime == needle.mime
                        && prior.needle.gzipped == needle.gzipped
                        && prior.needle.chunk_manifest == needle.chunk_manifest
                    {
                        return Ok(WriteResult {
                            offset: existing.offset_bytes(),
                            size: existing.size(),
                            unchanged: true,
                        });
                    }
                }
            }
        }

        let append_at_ns = now_ns();
        let (bytes, record_len) = needle.encode(append_at_ns);
        let projected = inner.next_offset + record_len;
        if projected > self.options.size_limit_bytes {
            return Err(CommonError::OutOfSpace {
                needed: record_len,
                available: self.options.size_limit_bytes.saturating_sub(inner.next_offset),
            });
        }

        let offset = inner.next_offset;
        self.data_file.write_all_at(&bytes, offset).map_err(|e| self.io_fail(e))?;
        self.data_file.sync_data().map_err(|e| self.io_fail(e))?;

        let entry = IndexEntry::new(offset, record_len as u32);
        if let Some(prior) = inner.index.get(needle.key) {
            if !prior.is_tombstone() {
                inner.live_bytes = inner.live_bytes.saturating_sub(prior.size() as u64);
            } else {
                inner.garbage_bytes = inner.garbage_bytes.saturating_sub(prior.size() as u64);
            }
        }
        inner.index.put(needle.key, entry).map_err(|e| self.io_fail(e))?;
        inner.next_offset += record_len;
        inner.live_bytes += record_len;
        self.size.store(inner.next_offset, Ordering::Release);
        self.bump_last_append_ns(append_at_ns);

        info!(volume_id = self.id.0, key = %needle.key, size = record_len, "needle written");

        Ok(WriteResult {
            offset,
            size: record_len as u32,
            unchanged: false,
        })
    }

    /// Appends a tombstone for `key`. Returns the number of bytes the prior
    /// live record occupied, credited toward this volume's garbage ratio.
    pub fn delete(&self, key: NeedleKey, cookie: Cookie) -> Result<u64, CommonError> {
        if self.is_read_only() {
            return Err(CommonError::VolumeReadOnly(self.id.0));
        }
        let mut inner = self.inner.write();
        let existing = inner
            .index
            .get(key)
            .ok_or(CommonError::NeedleNotFound { volume_id: self.id.0, key: key.0 })?;
        if existing.is_tombstone() {
            return Ok(0);
        }

        let prior = self.read_raw(existing)?;
        if prior.needle.cookie != cookie {
            return Err(CommonError::CookieMismatch(key.0));
        }

        let tombstone = Needle::tombstone(key, cookie);
        let append_at_ns = now_ns();
        let (bytes, record_len) = tombstone.encode(append_at_ns);
        let offset = inner.next_offset;
        self.data_file.write_all_at(&bytes, offset).map_err(|e| self.io_fail(e))?;
        self.data_file.sync_data().map_err(|e| self.io_fail(e))?;

        inner.next_offset += record_len;
        let freed = existing.size() as u64;
        inner.live_bytes = inner.live_bytes.saturating_sub(freed);
        inner.garbage_bytes += freed;
        inner
            .index
            .put(key, IndexEntry::tombstone(existing.offset_bytes(), existing.size()))
            .map_err(|e| self.io_fail(e))?;
        self.size.store(inner.next_offset, Ordering::Release);
        self.bump_last_append_ns(append_at_ns);

        info!(volume_id = self.id.0, key = %key, freed_bytes = freed, "needle deleted");
        Ok(freed)
    }

    /// Reads a needle by key. `read_deleted` asks for the pre-delete body
    /// of a tombstoned key instead of surfacing `NeedleDeleted`.
    pub fn read(&self, key: NeedleKey, read_deleted: bool) -> Result<ReadResult, CommonError> {
        let inner = self.inner.read();
        let entry = inner
            .index
            .get(key)
            .ok_or(CommonError::NeedleNotFound { volume_id: self.id.0, key: key.0 })?;

        if entry.is_tombstone() && !read_deleted {
            return Err(CommonError::NeedleDeleted { volume_id: self.id.0, key: key.0 });
        }

        let decoded = self.read_raw(entry)?;

        if self.options.ttl.is_set() {
            let append_secs = decoded.append_at_ns / 1_000_000_000;
            if append_secs + self.options.ttl.0 as u64 <= now_secs() {
                return Err(CommonError::NeedleExpired { volume_id: self.id.0, key: key.0 });
            }
        }

        Ok(ReadResult { needle: decoded.needle })
    }

    fn read_raw(&self, entry: IndexEntry) -> Result<DecodedNeedle, CommonError> {
        let mut buf = vec![0u8; entry.size() as usize];
        self.data_file
            .read_exact_at(&mut buf, entry.offset_bytes())
            .map_err(CommonError::Io)?;
        codec::decode_needle(&buf, self.id.0, entry.offset_bytes())
    }

    /// Rewrites data + index containing only live needles, in original key
    /// order, then swaps them in under the write lock. `compaction_revision`
    /// is bumped in the resulting super block.
    pub fn compact(&self) -> Result<(), CommonError> {
        let snapshot: Vec<(NeedleKey, IndexEntry)> = {
            let inner = self.inner.read();
            inner.index.scan()
        };

        let tmp_data_path = self.data_path.with_extension("dat.compact");
        let tmp_index_path = self.index_path.with_extension("idx.compact");

        let new_super_block = {
            let mut sb = self.inner.read().super_block;
            sb.compaction_revision = sb.compaction_revision.wrapping_add(1);
            sb
        };

        let new_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp_data_path)?;
        new_file.write_all_at(&new_super_block.encode(), 0)?;

        let mut new_entries = Vec::with_capacity(snapshot.len());
        let mut offset = SUPER_BLOCK_SIZE as u64;
        let mut live_bytes = 0u64;
        for (key, entry) in &snapshot {
            if entry.is_tombstone() {
                continue;
            }
            let decoded = self.read_raw(*entry)?;
            let (bytes, record_len) = decoded.needle.encode(decoded.append_at_ns);
            new_file.write_all_at(&bytes, offset)?;
            new_entries.push((*key, IndexEntry::new(offset, record_len as u32)));
            offset += record_len;
            live_bytes += record_len;
        }
        new_file.sync_all()?;
        rewrite_index_file(&tmp_index_path, &new_entries)?;

        // Critical section: brief write-pause while we swap in the
        // freshly-compacted files and the rebuilt index.
        let mut inner = self.inner.write();
        std::fs::rename(&tmp_data_path, &self.data_path)?;
        std::fs::rename(&tmp_index_path, &self.index_path)?;

        let index: Box<dyn NeedleIndex> = if new_entries.len() as u64 > ON_DISK_INDEX_THRESHOLD {
            let mut on_disk = OnDiskIndex::open(&self.index_path)?;
            for (key, entry) in &new_entries {
                on_disk.put(*key, *entry)?;
            }
            Box::new(on_disk)
        } else {
            Box::new(InMemoryIndex::from_entries(new_entries))
        };

        inner.index = index;
        inner.next_offset = offset;
        inner.super_block = new_super_block;
        inner.garbage_bytes = 0;
        inner.live_bytes = live_bytes;
        self.size.store(offset, Ordering::Release);

        info!(
            volume_id = self.id.0,
            revision = new_super_block.compaction_revision,
            new_size = offset,
            "compaction complete"
        );
        Ok(())
    }

    /// Every needle currently indexed (including tombstones), in no
    /// particular order: backs `ReadAllNeedles` and a from-scratch
    /// incremental-copy bootstrap.
    pub fn scan_all(&self) -> Result<Vec<DecodedNeedle>, CommonError> {
        let entries = self.inner.read().index.scan();
        entries.iter().map(|(_, entry)| self.read_raw(*entry)).collect()
    }

    /// Needles appended strictly after `since_append_ns`, for
    /// `VolumeIncrementalCopy`: a replica that fell behind streams
    /// everything the primary wrote past its last known watermark.
    pub fn scan_since(&self, since_append_ns: u64) -> Result<Vec<DecodedNeedle>, CommonError> {
        let entries = self.inner.read().index.scan();
        let mut out = Vec::new();
        for (_, entry) in entries {
            let decoded = self.read_raw(entry)?;
            if decoded.append_at_ns > since_append_ns {
                out.push(decoded);
            }
        }
        out.sort_by_key(|d| d.append_at_ns);
        Ok(out)
    }

    /// Appends an already-encoded needle record produced by a peer (used by
    /// replication fan-out and incremental copy), bypassing the
    /// identical-payload short circuit in [`Volume::write`] since the
    /// sender has already decided this is new data.
    pub fn apply_replicated(&self, needle: Needle, append_at_ns: u64) -> Result<WriteResult, CommonError> {
        if self.is_read_only() {
            return Err(CommonError::VolumeReadOnly(self.id.0));
        }
        let mut inner = self.inner.write();
        let (bytes, record_len) = needle.encode(append_at_ns);
        let projected = inner.next_offset + record_len;
        if projected > self.options.size_limit_bytes {
            return Err(CommonError::OutOfSpace {
                needed: record_len,
                available: self.options.size_limit_bytes.saturating_sub(inner.next_offset),
            });
        }

        let offset = inner.next_offset;
        self.data_file.write_all_at(&bytes, offset).map_err(|e| self.io_fail(e))?;
        self.data_file.sync_data().map_err(|e| self.io_fail(e))?;

        let is_tombstone = needle.payload.is_empty() && needle.name.is_none() && needle.mime.is_none();
        let entry = if is_tombstone {
            let prior_size = inner.index.get(needle.key).map(|e| e.size()).unwrap_or(0);
            IndexEntry::tombstone(offset, prior_size)
        } else {
            IndexEntry::new(offset, record_len as u32)
        };
        if let Some(prior) = inner.index.get(needle.key) {
            if !prior.is_tombstone() {
                inner.live_bytes = inner.live_bytes.saturating_sub(prior.size() as u64);
            } else {
                inner.garbage_bytes = inner.garbage_bytes.saturating_sub(prior.size() as u64);
            }
        }
        inner.index.put(needle.key, entry).map_err(|e| self.io_fail(e))?;
        inner.next_offset += record_len;
        if is_tombstone {
            inner.garbage_bytes += record_len;
        } else {
            inner.live_bytes += record_len;
        }
        self.size.store(inner.next_offset, Ordering::Release);
        self.bump_last_append_ns(append_at_ns);

        Ok(WriteResult {
            offset,
            size: record_len as u32,
            unchanged: false,
        })
    }
}

fn ttl_to_minutes(ttl: Ttl) -> u16 {
    (ttl.0 / 60).min(u16::MAX as u32) as u16
}

/// Linear scan of a data file from just past the super block, stopping at
/// the first header whose declared body would extend past EOF. Returns the
/// recovered `(key, entry)` pairs, the byte offset recovery stopped at
/// (used to truncate a partial tail), live/garbage byte totals, and the
/// highest `append_at_ns` footer value seen.
fn scan_and_recover(
    file: &File,
    volume_id: u32,
    file_len: u64,
) -> Result<(Vec<(NeedleKey, IndexEntry)>, u64, u64, u64, u64), CommonError> {
    use std::collections::HashMap;

    let mut entries: HashMap<NeedleKey, IndexEntry> = HashMap::new();
    let mut offset = SUPER_BLOCK_SIZE as u64;
    let mut live_bytes = 0u64;
    let mut garbage_bytes = 0u64;
    let mut last_append_ns = 0u64;

    while offset < file_len {
        let remaining = file_len - offset;
        if remaining < codec::NEEDLE_HEADER_SIZE as u64 {
            break;
        }
        // Read a bounded probe; grow if the declared body is larger.
        let probe_len = remaining.min(4096) as usize;
        let mut probe = vec![0u8; probe_len];
        file.read_exact_at(&mut probe, offset).map_err(CommonError::Io)?;

        let data_size = u32::from_le_bytes([probe[12], probe[13], probe[14], probe[15]]) as u64;
        let record_len_unaligned = codec::NEEDLE_HEADER_SIZE as u64 + data_size + codec::NEEDLE_FOOTER_SIZE as u64;
        let record_len = codec::align_up(record_len_unaligned, NEEDLE_ALIGNMENT);

        if offset + record_len > file_len {
            break;
        }

        let buf = if record_len as usize <= probe_len {
            probe
        } else {
            let mut full = vec![0u8; record_len as usize];
            file.read_exact_at(&mut full, offset).map_err(CommonError::Io)?;
            full
        };

        let decoded = match codec::decode_needle(&buf, volume_id, offset) {
            Ok(d) => d,
            Err(_) => break,
        };

        if decoded.is_tombstone {
            let prior_size = if let Some(prior) = entries.get(&decoded.needle.key) {
                if !prior.is_tombstone() {
                    live_bytes = live_bytes.saturating_sub(prior.size() as u64);
                    garbage_bytes += prior.size() as u64;
                }
                prior.size()
            } else {
                0
            };
            entries.insert(decoded.needle.key, IndexEntry::tombstone(offset, prior_size));
        } else {
            if let Some(prior) = entries.get(&decoded.needle.key) {
                if prior.is_tombstone() {
                    garbage_bytes = garbage_bytes.saturating_sub(prior.size() as u64);
                } else {
                    garbage_bytes += prior.size() as u64;
                    live_bytes = live_bytes.saturating_sub(prior.size() as u64);
                }
            }
            entries.insert(decoded.needle.key, IndexEntry::new(offset, record_len as u32));
            live_bytes += record_len;
        }

        last_append_ns = last_append_ns.max(decoded.append_at_ns);
        offset += record_len;
    }

    Ok((entries.into_iter().collect(), offset, live_bytes, garbage_bytes, last_append_ns))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_test_volume(dir: &Path) -> Volume {
        Volume::open(dir, VolumeId(1), VolumeOptions::default()).unwrap()
    }

    #[test]
    fn write_then_read_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let vol = open_test_volume(dir.path());
        let needle = Needle::new(NeedleKey(1), Cookie(42), b"hello".to_vec());
        vol.write(needle).unwrap();

        let result = vol.read(NeedleKey(1), false).unwrap();
        assert_eq!(result.needle.payload, b"hello");
        assert_eq!(vol.size_bytes() % 8, 0);
    }

    #[test]
    fn delete_then_read_returns_deleted() {
        let dir = tempfile::tempdir().unwrap();
        let vol = open_test_volume(dir.path());
        let needle = Needle::new(NeedleKey(2), Cookie(7), b"payload".to_vec());
        vol.write(needle).unwrap();
        vol.delete(NeedleKey(2), Cookie(7)).unwrap();

        let err = vol.read(NeedleKey(2), false).unwrap_err();
        assert!(matches!(err, CommonError::NeedleDeleted { .. }));

        let recovered = vol.read(NeedleKey(2), true).unwrap();
        assert_eq!(recovered.needle.payload, b"payload");
    }

    #[test]
    fn write_reports_unchanged_for_identical_payload() {
        let dir = tempfile::tempdir().unwrap();
        let vol = open_test_volume(dir.path());
        let needle = Needle::new(NeedleKey(3), Cookie(1), b"same".to_vec());
        let first = vol.write(needle.clone()).unwrap();
        assert!(!first.unchanged);
        let second = vol.write(needle).unwrap();
        assert!(second.unchanged);
    }

    #[test]
    fn compact_drops_tombstones_and_keeps_live_payloads() {
        let dir = tempfile::tempdir().unwrap();
        let vol = open_test_volume(dir.path());
        for i in 0..10u64 {
            vol.write(Needle::new(NeedleKey(i), Cookie(1), vec![i as u8; 16])).unwrap();
        }
        for i in 0..6u64 {
            vol.delete(NeedleKey(i), Cookie(1)).unwrap();
        }
        let size_before = vol.size_bytes();
        vol.compact().unwrap();
        assert!(vol.size_bytes() <= size_before);
        assert_eq!(vol.compaction_revision(), 1);

        for i in 6..10u64 {
            let r = vol.read(NeedleKey(i), false).unwrap();
            assert_eq!(r.needle.payload, vec![i as u8; 16]);
        }
        for i in 0..6u64 {
            assert!(vol.read(NeedleKey(i), false).is_err());
        }
    }

    #[test]
    fn recovers_from_partial_tail_on_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let id = VolumeId(5);
        {
            let vol = Volume::open(dir.path(), id, VolumeOptions::default()).unwrap();
            for i in 0..10u64 {
                vol.write(Needle::new(NeedleKey(i), Cookie(1), vec![1, 2, 3])).unwrap();
            }
        }

        let data_path = dir.path().join("5.dat");
        let full_len = std::fs::metadata(&data_path).unwrap().len();
        let file = OpenOptions::new().write(true).open(&data_path).unwrap();
        file.set_len(full_len - 4).unwrap(); // corrupt the last record's tail

        let reopened = Volume::open(dir.path(), id, VolumeOptions::default()).unwrap();
        assert!(reopened.size_bytes() < full_len);
        for i in 0..9u64 {
            assert!(reopened.read(NeedleKey(i), false).is_ok());
        }
        assert!(reopened.read(NeedleKey(9), false).is_err());
    }
}
