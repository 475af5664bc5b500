use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use common::{CommonError, Cookie, NeedleKey, ReplicaPlacement};

pub const SUPER_BLOCK_SIZE: usize = 8;
pub const NEEDLE_HEADER_SIZE: usize = 16;
pub const NEEDLE_FOOTER_SIZE: usize = 16;
pub const NEEDLE_ALIGNMENT: u64 = 8;

pub const FLAG_GZIPPED: u8 = 0x01;
pub const FLAG_CHUNK_MANIFEST: u8 = 0x02;
pub const FLAG_HAS_TTL: u8 = 0x04;
pub const FLAG_HAS_NAME: u8 = 0x08;
pub const FLAG_HAS_MIME: u8 = 0x10;
pub const FLAG_HAS_LAST_MODIFIED: u8 = 0x20;

/// The 8-byte header of a volume's data file: format version, replica
/// placement (one byte, three packed digits), TTL and the current
/// compaction revision. Present once, at offset 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SuperBlock {
    pub version: u8,
    pub replica_placement: ReplicaPlacement,
    pub ttl_minutes: u16,
    pub compaction_revision: u16,
}

impl SuperBlock {
    pub const CURRENT_VERSION: u8 = 1;

    pub fn new(replica_placement: ReplicaPlacement, ttl_minutes: u16) -> Self {
        Self {
            version: Self::CURRENT_VERSION,
            replica_placement,
            ttl_minutes,
            compaction_revision: 0,
        }
    }

    pub fn encode(&self) -> [u8; SUPER_BLOCK_SIZE] {
        let mut buf = [0u8; SUPER_BLOCK_SIZE];
        buf[0] = self.version;
        buf[1] = self.replica_placement.to_byte();
        (&mut buf[2..4]).write_u16::<LittleEndian>(self.ttl_minutes).unwrap();
        (&mut buf[4..6])
            .write_u16::<LittleEndian>(self.compaction_revision)
            .unwrap();
        // buf[6..8] left zeroed: padding.
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self, CommonError> {
        if buf.len() < SUPER_BLOCK_SIZE {
            return Err(CommonError::CorruptRecord(0, 0));
        }
        Ok(Self {
            version: buf[0],
            replica_placement: ReplicaPlacement::from_byte(buf[1]),
            ttl_minutes: (&buf[2..4]).read_u16::<LittleEndian>().unwrap(),
            compaction_revision: (&buf[4..6]).read_u16::<LittleEndian>().unwrap(),
        })
    }
}

/// One stored object. `is_tombstone` needles carry no body at all — they
/// exist purely to mark a key deleted in an append-only scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Needle {
    pub key: NeedleKey,
    pub cookie: Cookie,
    pub name: Option<String>,
    pub mime: Option<String>,
    pub last_modified: Option<u64>,
    pub ttl_minutes: Option<u16>,
    pub gzipped: bool,
    pub chunk_manifest: bool,
    pub payload: Vec<u8>,
}

impl Needle {
    pub fn new(key: NeedleKey, cookie: Cookie, payload: Vec<u8>) -> Self {
        Self {
            key,
            cookie,
            name: None,
            mime: None,
            last_modified: None,
            ttl_minutes: None,
            gzipped: false,
            chunk_manifest: false,
            payload,
        }
    }

    pub fn tombstone(key: NeedleKey, cookie: Cookie) -> Self {
        Self::new(key, cookie, Vec::new())
    }

    fn flags(&self) -> u8 {
        let mut f = 0u8;
        if self.gzipped {
            f |= FLAG_GZIPPED;
        }
        if self.chunk_manifest {
            f |= FLAG_CHUNK_MANIFEST;
        }
        if self.ttl_minutes.is_some() {
            f |= FLAG_HAS_TTL;
        }
        if self.name.is_some() {
            f |= FLAG_HAS_NAME;
        }
        if self.mime.is_some() {
            f |= FLAG_HAS_MIME;
        }
        if self.last_modified.is_some() {
            f |= FLAG_HAS_LAST_MODIFIED;
        }
        f
    }

    fn crc(&self) -> u32 {
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&self.payload);
        hasher.finalize()
    }

    /// Encodes header + body + footer + alignment padding, ready to append
    /// to the data file. Returns the bytes and the total on-disk length
    /// (always a multiple of [`NEEDLE_ALIGNMENT`]).
    pub fn encode(&self, append_at_ns: u64) -> (Vec<u8>, u64) {
        let is_tombstone = self.payload.is_empty() && self.name.is_none() && self.mime.is_none();

        let mut body = Vec::new();
        let data_size: u32 = if is_tombstone {
            0
        } else {
            body.push(self.flags());
            if let Some(name) = &self.name {
                body.push(name.len() as u8);
                body.extend_from_slice(name.as_bytes());
            }
            if let Some(mime) = &self.mime {
                body.push(mime.len() as u8);
                body.extend_from_slice(mime.as_bytes());
            }
            if let Some(lm) = self.last_modified {
                body.extend_from_slice(&lm.to_le_bytes());
            }
            if let Some(ttl) = self.ttl_minutes {
                body.extend_from_slice(&ttl.to_le_bytes());
            }
            body.extend_from_slice(&self.payload);
            body.len() as u32
        };

        let mut out = Vec::with_capacity(NEEDLE_HEADER_SIZE + body.len() + NEEDLE_FOOTER_SIZE);
        out.write_u32::<LittleEndian>(self.cookie.0).unwrap();
        out.write_u64::<LittleEndian>(self.key.0).unwrap();
        out.write_u32::<LittleEndian>(data_size).unwrap();
        out.extend_from_slice(&body);

        let checksum = if is_tombstone { 0 } else { self.crc() };
        out.write_u32::<LittleEndian>(checksum).unwrap();
        out.extend_from_slice(&[0u8; 4]); // footer padding
        out.write_u64::<LittleEndian>(append_at_ns).unwrap();

        let unpadded_len = out.len() as u64;
        let padded_len = align_up(unpadded_len, NEEDLE_ALIGNMENT);
        out.resize(padded_len as usize, 0);
        (out, padded_len)
    }
}

pub fn align_up(n: u64, align: u64) -> u64 {
    (n + align - 1) / align * align
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedNeedle {
    pub needle: Needle,
    pub is_tombstone: bool,
    pub append_at_ns: u64,
    pub record_len: u64,
}

/// Decodes one needle starting at `buf[0]`. `buf` must contain at least the
/// full padded record; excess trailing bytes are ignored. Returns
/// `CorruptRecord` if the header claims a body longer than `buf`.
pub fn decode_needle(buf: &[u8], volume_id: u32, record_offset: u64) -> Result<DecodedNeedle, CommonError> {
    if buf.len() < NEEDLE_HEADER_SIZE {
        return Err(CommonError::TruncatedTail(volume_id, record_offset));
    }
    let cookie = (&buf[0..4]).read_u32::<LittleEndian>().unwrap();
    let key = (&buf[4..12]).read_u64::<LittleEndian>().unwrap();
    let data_size = (&buf[12..16]).read_u32::<LittleEndian>().unwrap() as usize;

    let body_start = NEEDLE_HEADER_SIZE;
    let body_end = body_start + data_size;
    let footer_end = body_end + NEEDLE_FOOTER_SIZE;
    if buf.len() < footer_end {
        return Err(CommonError::TruncatedTail(volume_id, record_offset));
    }

    let body = &buf[body_start..body_end];
    let footer = &buf[body_end..footer_end];
    let checksum = (&footer[0..4]).read_u32::<LittleEndian>().unwrap();
    let append_at_ns = (&footer[8..16]).read_u64::<LittleEndian>().unwrap();

    let unpadded_len = footer_end as u64;
    let record_len = align_up(unpadded_len, NEEDLE_ALIGNMENT);

    if data_size == 0 {
        return Ok(DecodedNeedle {
            needle: Needle::tombstone(NeedleKey(key), Cookie(cookie)),
            is_tombstone: true,
            append_at_ns,
            record_len,
        });
    }

    let mut pos = 0usize;
    let flags = body[pos];
    pos += 1;

    let name = if flags & FLAG_HAS_NAME != 0 {
        let len = body[pos] as usize;
        pos += 1;
        let s = String::from_utf8_lossy(&body[pos..pos + len]).into_owned();
        pos += len;
        Some(s)
    } else {
        None
    };

    let mime = if flags & FLAG_HAS_MIME != 0 {
        let len = body[pos] as usize;
        pos += 1;
        let s = String::from_utf8_lossy(&body[pos..pos + len]).into_owned();
        pos += len;
        Some(s)
    } else {
        None
    };

    let last_modified = if flags & FLAG_HAS_LAST_MODIFIED != 0 {
        let v = (&body[pos..pos + 8]).read_u64::<LittleEndian>().unwrap();
        pos += 8;
        Some(v)
    } else {
        None
    };

    let ttl_minutes = if flags & FLAG_HAS_TTL != 0 {
        let v = (&body[pos..pos + 2]).read_u16::<LittleEndian>().unwrap();
        pos += 2;
        Some(v)
    } else {
        None
    };

    let payload = body[pos..].to_vec();

    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&payload);
    let actual = hasher.finalize();
    if actual != checksum {
        return Err(CommonError::CrcMismatch {
            volume_id,
            key,
            expected: checksum,
            actual,
        });
    }

    Ok(DecodedNeedle {
        needle: Needle {
            key: NeedleKey(key),
            cookie: Cookie(cookie),
            name,
            mime,
            last_modified,
            ttl_minutes,
            gzipped: flags & FLAG_GZIPPED != 0,
            chunk_manifest: flags & FLAG_CHUNK_MANIFEST != 0,
            payload,
        },
        is_tombstone: false,
        append_at_ns,
        record_len,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn needle_round_trips_with_optional_fields() {
        let mut n = Needle::new(NeedleKey(42), Cookie(0x1234), b"hello world".to_vec());
        n.name = Some("greeting.txt".to_string());
        n.mime = Some("text/plain".to_string());
        n.last_modified = Some(1_700_000_000);
        n.ttl_minutes = Some(60);

        let (bytes, record_len) = n.encode(123_456_789);
        assert_eq!(bytes.len() as u64, record_len);
        assert_eq!(record_len % NEEDLE_ALIGNMENT, 0);

        let decoded = decode_needle(&bytes, 3, 0).unwrap();
        assert!(!decoded.is_tombstone);
        assert_eq!(decoded.needle, n);
        assert_eq!(decoded.append_at_ns, 123_456_789);
    }

    #[test]
    fn tombstone_round_trips_with_zero_data_size() {
        let n = Needle::tombstone(NeedleKey(7), Cookie(1));
        let (bytes, _) = n.encode(42);
        let decoded = decode_needle(&bytes, 1, 0).unwrap();
        assert!(decoded.is_tombstone);
    }

    #[test]
    fn decode_rejects_truncated_buffer() {
        let n = Needle::new(NeedleKey(1), Cookie(1), vec![1, 2, 3, 4, 5]);
        let (bytes, _) = n.encode(0);
        let truncated = &bytes[..bytes.len() - 4];
        assert!(decode_needle(truncated, 9, 0).is_err());
    }

    #[test]
    fn decode_detects_crc_mismatch() {
        let n = Needle::new(NeedleKey(1), Cookie(1), vec![1, 2, 3, 4, 5]);
        let (mut bytes, _) = n.encode(0);
        // Flip a payload byte without touching the stored checksum.
        let last = bytes.len() - NEEDLE_FOOTER_SIZE - 1;
        bytes[last] ^= 0xFF;
        let err = decode_needle(&bytes, 5, 0).unwrap_err();
        assert!(matches!(err, CommonError::CrcMismatch { .. }));
    }

    #[test]
    fn super_block_round_trips() {
        let sb = SuperBlock::new("001".parse().unwrap(), 60);
        let encoded = sb.encode();
        let decoded = SuperBlock::decode(&encoded).unwrap();
        assert_eq!(sb, decoded);
    }
}
