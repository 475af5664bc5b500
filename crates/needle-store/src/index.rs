use std::collections::{BTreeMap, HashMap};
use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use common::{CommonError, NeedleKey};

/// High bit of the on-disk `size` field marks a tombstone; the remaining 31
/// bits keep the pre-delete record length so `ReadDeleted` can still locate
/// and decode the prior body without a second index scheme.
pub const TOMBSTONE_BIT: u32 = 0x8000_0000;

pub const INDEX_RECORD_SIZE: usize = 16;

/// In-memory shape of one index row: `key(8) | offset_in_8B_units(4) | size(4)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexEntry {
    pub offset_units: u32,
    size_raw: u32,
}

impl IndexEntry {
    pub fn new(offset_bytes: u64, size: u32) -> Self {
        debug_assert_eq!(offset_bytes % 8, 0, "needle offsets are always 8-byte aligned");
        debug_assert_eq!(size & TOMBSTONE_BIT, 0, "record size must fit in 31 bits");
        Self {
            offset_units: (offset_bytes / 8) as u32,
            size_raw: size,
        }
    }

    pub fn tombstone(offset_bytes: u64, prior_size: u32) -> Self {
        Self {
            offset_units: (offset_bytes / 8) as u32,
            size_raw: prior_size | TOMBSTONE_BIT,
        }
    }

    pub fn offset_bytes(&self) -> u64 {
        self.offset_units as u64 * 8
    }

    pub fn size(&self) -> u32 {
        self.size_raw & !TOMBSTONE_BIT
    }

    pub fn is_tombstone(&self) -> bool {
        self.size_raw & TOMBSTONE_BIT != 0
    }
}

fn encode_record(key: NeedleKey, entry: IndexEntry) -> [u8; INDEX_RECORD_SIZE] {
    let mut buf = [0u8; INDEX_RECORD_SIZE];
    (&mut buf[0..8]).write_u64::<LittleEndian>(key.0).unwrap();
    (&mut buf[8..12]).write_u32::<LittleEndian>(entry.offset_units).unwrap();
    (&mut buf[12..16]).write_u32::<LittleEndian>(entry.size_raw).unwrap();
    buf
}

fn decode_record(buf: &[u8; INDEX_RECORD_SIZE]) -> (NeedleKey, IndexEntry) {
    let key = NeedleKey((&buf[0..8]).read_u64::<LittleEndian>().unwrap());
    let offset_units = (&buf[8..12]).read_u32::<LittleEndian>().unwrap();
    let size_raw = (&buf[12..16]).read_u32::<LittleEndian>().unwrap();
    (key, IndexEntry { offset_units, size_raw })
}

/// Capability set shared by both index backends, per the "store backend"
/// design note: `{get, put, delete, scan}`. A `Volume` picks a concrete
/// realization at mount time.
pub trait NeedleIndex: Send {
    fn get(&self, key: NeedleKey) -> Option<IndexEntry>;
    fn put(&mut self, key: NeedleKey, entry: IndexEntry) -> std::io::Result<()>;
    fn remove(&mut self, key: NeedleKey) -> std::io::Result<()>;
    fn scan(&self) -> Vec<(NeedleKey, IndexEntry)>;
    fn len(&self) -> usize;
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Lowest-latency backend: the whole index lives in a `HashMap`. Used for
/// ordinary-sized volumes where the full dense index comfortably fits in
/// memory.
#[derive(Default)]
pub struct InMemoryIndex {
    map: HashMap<NeedleKey, IndexEntry>,
}

impl InMemoryIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuilds from an already-scanned `(key, entry)` sequence, e.g. a
    /// data-file linear scan after a missing/corrupt `.idx` file.
    pub fn from_entries(entries: impl IntoIterator<Item = (NeedleKey, IndexEntry)>) -> Self {
        Self {
            map: entries.into_iter().collect(),
        }
    }
}

impl NeedleIndex for InMemoryIndex {
    fn get(&self, key: NeedleKey) -> Option<IndexEntry> {
        self.map.get(&key).copied()
    }

    fn put(&mut self, key: NeedleKey, entry: IndexEntry) -> std::io::Result<()> {
        self.map.insert(key, entry);
        Ok(())
    }

    fn remove(&mut self, key: NeedleKey) -> std::io::Result<()> {
        self.map.remove(&key);
        Ok(())
    }

    fn scan(&self) -> Vec<(NeedleKey, IndexEntry)> {
        self.map.iter().map(|(k, v)| (*k, *v)).collect()
    }

    fn len(&self) -> usize {
        self.map.len()
    }
}

/// Embedded ordered-KV-on-disk backend for volumes whose index would not
/// otherwise fit in memory: every `put`/`remove` is appended to the on-disk
/// `.idx` log (later records for a key shadow earlier ones, exactly like the
/// data file itself), with an in-memory `BTreeMap` acting as a write-through
/// cache so reads never touch disk.
pub struct OnDiskIndex {
    file: BufWriter<File>,
    cache: BTreeMap<NeedleKey, IndexEntry>,
}

impl OnDiskIndex {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, CommonError> {
        let path: PathBuf = path.as_ref().to_path_buf();
        let mut read_file = OpenOptions::new().read(true).create(true).write(true).open(&path)?;

        let mut cache = BTreeMap::new();
        let mut reader = BufReader::new(&mut read_file);
        let mut record = [0u8; INDEX_RECORD_SIZE];
        loop {
            match reader.read_exact(&mut record) {
                Ok(()) => {
                    let (key, entry) = decode_record(&record);
                    cache.insert(key, entry);
                }
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(CommonError::Io(e)),
            }
        }

        let write_file = OpenOptions::new().append(true).open(&path)?;
        Ok(Self {
            file: BufWriter::new(write_file),
            cache,
        })
    }

    fn append_record(&mut self, key: NeedleKey, entry: IndexEntry) -> std::io::Result<()> {
        self.file.write_all(&encode_record(key, entry))?;
        self.file.flush()
    }
}

impl NeedleIndex for OnDiskIndex {
    fn get(&self, key: NeedleKey) -> Option<IndexEntry> {
        self.cache.get(&key).copied()
    }

    fn put(&mut self, key: NeedleKey, entry: IndexEntry) -> std::io::Result<()> {
        self.append_record(key, entry)?;
        self.cache.insert(key, entry);
        Ok(())
    }

    fn remove(&mut self, key: NeedleKey) -> std::io::Result<()> {
        self.append_record(key, IndexEntry::new(0, 0))?;
        self.cache.remove(&key);
        Ok(())
    }

    fn scan(&self) -> Vec<(NeedleKey, IndexEntry)> {
        self.cache.iter().map(|(k, v)| (*k, *v)).collect()
    }

    fn len(&self) -> usize {
        self.cache.len()
    }
}

/// Rewrites an index file from scratch given the authoritative in-memory
/// state, used after compaction and after a scan-rebuild.
pub fn rewrite_index_file(path: impl AsRef<Path>, entries: &[(NeedleKey, IndexEntry)]) -> Result<(), CommonError> {
    let mut writer = BufWriter::new(File::create(path)?);
    for (key, entry) in entries {
        writer.write_all(&encode_record(*key, *entry))?;
    }
    writer.flush()?;
    Ok(())
}

/// Reads every `(key, entry)` row out of an existing `.idx` file, last
/// write for a key winning, in file order.
pub fn load_index_file(path: impl AsRef<Path>) -> Result<Vec<(NeedleKey, IndexEntry)>, CommonError> {
    let path = path.as_ref();
    if !path.exists() {
        return Ok(Vec::new());
    }
    let mut reader = BufReader::new(File::open(path)?);
    let mut out = BTreeMap::new();
    let mut record = [0u8; INDEX_RECORD_SIZE];
    loop {
        match reader.read_exact(&mut record) {
            Ok(()) => {
                let (key, entry) = decode_record(&record);
                out.insert(key, entry);
            }
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(CommonError::Io(e)),
        }
    }
    Ok(out.into_iter().collect())
}

/// Seeks past the just-read header/footer machinery isn't needed here; this
/// just exists so tests can assert on file length without re-deriving
/// `INDEX_RECORD_SIZE` math.
pub fn index_file_len(path: impl AsRef<Path>) -> std::io::Result<u64> {
    let mut f = File::open(path)?;
    f.seek(SeekFrom::End(0))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn in_memory_index_tracks_tombstones() {
        let mut idx = InMemoryIndex::new();
        idx.put(NeedleKey(1), IndexEntry::new(64, 40)).unwrap();
        idx.put(NeedleKey(1), IndexEntry::tombstone(64, 40)).unwrap();
        let entry = idx.get(NeedleKey(1)).unwrap();
        assert!(entry.is_tombstone());
        assert_eq!(entry.offset_bytes(), 64);
        assert_eq!(entry.size(), 40);
    }

    #[test]
    fn on_disk_index_round_trips_after_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("1.idx");
        {
            let mut idx = OnDiskIndex::open(&path).unwrap();
            idx.put(NeedleKey(7), IndexEntry::new(16, 64)).unwrap();
            idx.put(NeedleKey(9), IndexEntry::new(96, 32)).unwrap();
        }
        let idx = OnDiskIndex::open(&path).unwrap();
        assert_eq!(idx.len(), 2);
        assert_eq!(idx.get(NeedleKey(7)).unwrap().offset_bytes(), 16);
    }
}
