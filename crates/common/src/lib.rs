pub mod error;
pub mod ids;
pub mod jwt;
pub mod placement;

pub use error::CommonError;
pub use ids::{Collection, Cookie, FileId, FileIdParseError, NeedleKey, VolumeId};
pub use jwt::{FileIdClaims, JwtSigner};
pub use placement::{DiskType, ReplicaPlacement, Ttl, VolumeLayoutKey};

use serde::{Deserialize, Serialize};

/// Structured events emitted on the `tracing` bus by the needle store and
/// master; kept as a typed enum (rather than ad hoc `info!` calls scattered
/// around) so integration tests can assert on them and a future audit
/// sink can subscribe without re-deriving meaning from log text.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum StorageEvent {
    NeedleWritten {
        volume_id: VolumeId,
        key: NeedleKey,
        size: u32,
    },
    NeedleDeleted {
        volume_id: VolumeId,
        key: NeedleKey,
    },
    VolumeGrown {
        volume_id: VolumeId,
        collection: Collection,
        replication: ReplicaPlacement,
    },
    VolumeMarkedReadOnly {
        volume_id: VolumeId,
        reason: String,
    },
    VacuumCompleted {
        volume_id: VolumeId,
        garbage_ratio: f64,
        reclaimed_bytes: u64,
    },
    LeaderChanged {
        new_leader: Option<String>,
    },
}
