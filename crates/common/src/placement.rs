use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::CommonError;

/// Replica placement triple `(dc_copies, rack_copies, node_copies)`, encoded
/// on the wire as three decimal digits, e.g. `"001"` means one extra replica
/// in another rack of the same data center. Total copies of a volume is
/// `(dc_copies + 1) * (rack_copies + 1) * (node_copies + 1)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReplicaPlacement {
    pub dc_copies: u8,
    pub rack_copies: u8,
    pub node_copies: u8,
}

impl ReplicaPlacement {
    pub const NONE: ReplicaPlacement = ReplicaPlacement {
        dc_copies: 0,
        rack_copies: 0,
        node_copies: 0,
    };

    pub fn total_copies(&self) -> u32 {
        (self.dc_copies as u32 + 1) * (self.rack_copies as u32 + 1) * (self.node_copies as u32 + 1)
    }

    /// Single byte used in the volume super block.
    pub fn to_byte(&self) -> u8 {
        self.dc_copies * 100 + self.rack_copies * 10 + self.node_copies
    }

    pub fn from_byte(b: u8) -> Self {
        Self {
            dc_copies: b / 100,
            rack_copies: (b / 10) % 10,
            node_copies: b % 10,
        }
    }
}

impl fmt::Display for ReplicaPlacement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", self.dc_copies, self.rack_copies, self.node_copies)
    }
}

impl FromStr for ReplicaPlacement {
    type Err = CommonError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = s.as_bytes();
        if bytes.len() != 3 {
            return Err(CommonError::InvalidReplicaPlacement(s.to_string()));
        }
        let digit = |b: u8| -> Result<u8, CommonError> {
            if b.is_ascii_digit() {
                Ok(b - b'0')
            } else {
                Err(CommonError::InvalidReplicaPlacement(s.to_string()))
            }
        };
        Ok(Self {
            dc_copies: digit(bytes[0])?,
            rack_copies: digit(bytes[1])?,
            node_copies: digit(bytes[2])?,
        })
    }
}

/// Disk type tag, carried alongside a volume layout key so SSD- and
/// spinning-disk-backed volumes are never mixed in the same layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum DiskType {
    #[default]
    Hdd,
    Ssd,
}

impl fmt::Display for DiskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DiskType::Hdd => write!(f, "hdd"),
            DiskType::Ssd => write!(f, "ssd"),
        }
    }
}

impl FromStr for DiskType {
    type Err = CommonError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "" | "hdd" => Ok(DiskType::Hdd),
            "ssd" => Ok(DiskType::Ssd),
            other => Err(CommonError::InvalidDiskType(other.to_string())),
        }
    }
}

/// The tuple a `VolumeLayout` is keyed by: every volume in a layout shares
/// the same collection, replication, TTL and disk type.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VolumeLayoutKey {
    pub collection: crate::Collection,
    pub replication: ReplicaPlacement,
    pub ttl: Ttl,
    pub disk_type: DiskType,
}

/// TTL in minutes, matching the compact encoding SeaweedFS uses on the wire
/// (a count plus a unit byte); stored here already normalized to seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub struct Ttl(pub u32);

impl Ttl {
    pub const NONE: Ttl = Ttl(0);

    pub fn is_set(&self) -> bool {
        self.0 > 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replica_placement_round_trips_through_string() {
        let p: ReplicaPlacement = "021".parse().unwrap();
        assert_eq!(p.dc_copies, 0);
        assert_eq!(p.rack_copies, 2);
        assert_eq!(p.node_copies, 1);
        assert_eq!(p.total_copies(), 1 * 3 * 2);
        assert_eq!(p.to_string(), "021");
    }

    #[test]
    fn replica_placement_byte_round_trips() {
        let p = ReplicaPlacement {
            dc_copies: 1,
            rack_copies: 0,
            node_copies: 2,
        };
        assert_eq!(ReplicaPlacement::from_byte(p.to_byte()), p);
    }

    #[test]
    fn replica_placement_rejects_bad_length() {
        assert!("1".parse::<ReplicaPlacement>().is_err());
        assert!("1234".parse::<ReplicaPlacement>().is_err());
    }
}
