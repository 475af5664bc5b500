use std::fmt;
use std::num::ParseIntError;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Master-allocated, monotonically increasing volume identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct VolumeId(pub u32);

impl VolumeId {
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for VolumeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for VolumeId {
    type Err = ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(s.parse()?))
    }
}

/// Key of a needle within a volume. Strictly increasing per volume per the
/// primary's local sequencer; unique together with the volume id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NeedleKey(pub u64);

impl fmt::Display for NeedleKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:x}", self.0)
    }
}

/// Anti-guessing random value minted alongside a needle key. Never derivable
/// from the key; the volume server rejects a matching key with the wrong
/// cookie as if the needle did not exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Cookie(pub u32);

impl Cookie {
    pub fn random() -> Self {
        Self(rand::random())
    }
}

impl fmt::Display for Cookie {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08x}", self.0)
    }
}

/// External handle `<vid>,<key><cookie>` — the only reference a filer or
/// external client ever persists. Parsed both from the comma form and the
/// slash-separated path form accepted by the volume server HTTP surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FileId {
    pub volume_id: VolumeId,
    pub key: NeedleKey,
    pub cookie: Cookie,
}

impl FileId {
    pub fn new(volume_id: VolumeId, key: NeedleKey, cookie: Cookie) -> Self {
        Self {
            volume_id,
            key,
            cookie,
        }
    }
}

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{:x}{:08x}", self.volume_id.0, self.key.0, self.cookie.0)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FileIdParseError {
    #[error("missing ',' separator in file id")]
    MissingSeparator,
    #[error("key+cookie segment too short: {0:?}")]
    KeyCookieTooShort(String),
    #[error("invalid volume id: {0}")]
    InvalidVolumeId(ParseIntError),
    #[error("invalid key/cookie hex: {0}")]
    InvalidHex(std::num::ParseIntError),
}

impl FromStr for FileId {
    type Err = FileIdParseError;

    /// Accepts `<vid>,<keycookie>[.ext]` and `<vid>/<keycookie>[/name][.ext]`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.strip_prefix('/').unwrap_or(s);

        let (vid_part, rest) = if let Some(idx) = s.find(',') {
            (&s[..idx], &s[idx + 1..])
        } else if let Some(idx) = s.find('/') {
            (&s[..idx], &s[idx + 1..])
        } else {
            return Err(FileIdParseError::MissingSeparator);
        };

        let volume_id = VolumeId(vid_part.parse().map_err(FileIdParseError::InvalidVolumeId)?);

        // Strip any trailing `/name`, `.ext`, or query-ish suffix; the
        // key+cookie is always the first path segment of `rest`.
        let keycookie = rest
            .split(['/', '.'])
            .next()
            .unwrap_or(rest);

        if keycookie.len() < 9 {
            return Err(FileIdParseError::KeyCookieTooShort(keycookie.to_string()));
        }

        let cookie_start = keycookie.len() - 8;
        let key = u64::from_str_radix(&keycookie[..cookie_start], 16)
            .map_err(FileIdParseError::InvalidHex)?;
        let cookie = u32::from_str_radix(&keycookie[cookie_start..], 16)
            .map_err(FileIdParseError::InvalidHex)?;

        Ok(FileId {
            volume_id,
            key: NeedleKey(key),
            cookie: Cookie(cookie),
        })
    }
}

/// Logical namespace and bulk-delete unit. Stored and compared as a plain
/// string; `""` denotes the default collection.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
pub struct Collection(pub String);

impl fmt::Display for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for Collection {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for Collection {
    fn from(s: String) -> Self {
        Self(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_id_round_trips_through_display_and_parse() {
        let fid = FileId::new(VolumeId(3), NeedleKey(0x01637037d6), Cookie(0xdeadbeef));
        let rendered = fid.to_string();
        let parsed: FileId = rendered.parse().unwrap();
        assert_eq!(fid, parsed);
    }

    #[test]
    fn file_id_parses_path_form_with_extension() {
        let parsed: FileId = "3/01637037d6deadbeef/photo.jpg".parse().unwrap();
        assert_eq!(parsed.volume_id, VolumeId(3));
        assert_eq!(parsed.key, NeedleKey(0x01637037d6));
        assert_eq!(parsed.cookie, Cookie(0xdeadbeef));
    }

    #[test]
    fn file_id_rejects_missing_separator() {
        assert!("garbage".parse::<FileId>().is_err());
    }
}
