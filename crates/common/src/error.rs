use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

/// Shared error taxonomy for the needle store, topology, cluster registry
/// and consensus crates. Transport layers (HTTP, gRPC) map this into their
/// own wire shape at the edge; nothing below this module knows about axum
/// or tonic except the two `impl` blocks at the bottom.
#[derive(Debug, thiserror::Error)]
pub enum CommonError {
    // ===== Not found / already gone ===== //
    #[error("needle {key} not found in volume {volume_id}")]
    NeedleNotFound { volume_id: u32, key: u64 },

    #[error("needle {key} in volume {volume_id} was deleted")]
    NeedleDeleted { volume_id: u32, key: u64 },

    #[error("needle {key} in volume {volume_id} expired")]
    NeedleExpired { volume_id: u32, key: u64 },

    #[error("volume {0} not found")]
    VolumeNotFound(u32),

    #[error("collection {0:?} not found")]
    CollectionNotFound(String),

    // ===== Rejected requests ===== //
    #[error("cookie mismatch for needle {0}")]
    CookieMismatch(u64),

    #[error("volume {0} is read-only")]
    VolumeReadOnly(u32),

    #[error("volume {0} is full")]
    VolumeFull(u32),

    #[error("disk location out of free space: need {needed} bytes, have {available}")]
    OutOfSpace { needed: u64, available: u64 },

    #[error("rate limited, retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },

    #[error("no writable volume available for collection {collection:?} replication {replication}")]
    NoWritableVolume { collection: String, replication: String },

    // ===== Parsing / validation ===== //
    #[error("invalid file id {0:?}: {1}")]
    InvalidFileId(String, #[source] crate::ids::FileIdParseError),

    #[error("invalid replica placement {0:?}")]
    InvalidReplicaPlacement(String),

    #[error("invalid disk type {0:?}")]
    InvalidDiskType(String),

    // ===== Data integrity ===== //
    #[error("needle {key} in volume {volume_id} failed crc check: expected {expected:08x}, got {actual:08x}")]
    CrcMismatch {
        volume_id: u32,
        key: u64,
        expected: u32,
        actual: u32,
    },

    #[error("corrupt needle record in volume {0} at offset {1}")]
    CorruptRecord(u32, u64),

    #[error("truncated write detected in volume {0}, recovered up to offset {1}")]
    TruncatedTail(u32, u64),

    // ===== Consensus / cluster ===== //
    #[error("not the raft leader; current leader is {leader:?}")]
    NotLeader { leader: Option<String> },

    #[error("raft cluster has no elected leader yet")]
    NoLeader,

    #[error("leadership changed mid-request")]
    LeaderChanged,

    // ===== Replication / transport ===== //
    #[error("replication to {target} failed: {source}")]
    ReplicationFailed {
        target: String,
        #[source]
        source: Box<CommonError>,
    },

    #[error("transport error talking to {peer}: {message}")]
    Transport { peer: String, message: String },

    // ===== Escape hatches ===== //
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl CommonError {
    /// Broad bucket used for logging and metrics labels; kept stable across
    /// the specific variants above so dashboards don't need a case per error.
    pub fn category(&self) -> &'static str {
        match self {
            CommonError::NeedleNotFound { .. }
            | CommonError::VolumeNotFound(_)
            | CommonError::CollectionNotFound(_) => "not_found",
            CommonError::NeedleDeleted { .. } => "deleted",
            CommonError::NeedleExpired { .. } => "expired",
            CommonError::CookieMismatch(_) => "cookie_mismatch",
            CommonError::VolumeReadOnly(_) => "read_only",
            CommonError::VolumeFull(_) | CommonError::OutOfSpace { .. } | CommonError::NoWritableVolume { .. } => {
                "out_of_space"
            }
            CommonError::RateLimited { .. } => "rate_limited",
            CommonError::InvalidFileId(..)
            | CommonError::InvalidReplicaPlacement(_)
            | CommonError::InvalidDiskType(_) => "bad_request",
            CommonError::CrcMismatch { .. } | CommonError::CorruptRecord(..) | CommonError::TruncatedTail(..) => {
                "corruption"
            }
            CommonError::NotLeader { .. } | CommonError::NoLeader | CommonError::LeaderChanged => "consensus",
            CommonError::ReplicationFailed { .. } | CommonError::Transport { .. } => "transport",
            CommonError::Io(_) | CommonError::Internal(_) => "internal",
        }
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: &'static str,
    message: String,
}

impl IntoResponse for CommonError {
    fn into_response(self) -> Response {
        let status = match &self {
            CommonError::NeedleNotFound { .. }
            | CommonError::NeedleDeleted { .. }
            | CommonError::NeedleExpired { .. }
            | CommonError::VolumeNotFound(_)
            | CommonError::CollectionNotFound(_) => StatusCode::NOT_FOUND,
            CommonError::CookieMismatch(_) | CommonError::InvalidFileId(..) => StatusCode::NOT_FOUND,
            CommonError::VolumeReadOnly(_) => StatusCode::METHOD_NOT_ALLOWED,
            CommonError::VolumeFull(_) | CommonError::OutOfSpace { .. } | CommonError::NoWritableVolume { .. } => {
                StatusCode::INSUFFICIENT_STORAGE
            }
            CommonError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            CommonError::InvalidReplicaPlacement(_) | CommonError::InvalidDiskType(_) => StatusCode::BAD_REQUEST,
            CommonError::CrcMismatch { .. } | CommonError::CorruptRecord(..) | CommonError::TruncatedTail(..) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            CommonError::NotLeader { .. } | CommonError::NoLeader | CommonError::LeaderChanged => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            CommonError::ReplicationFailed { .. } | CommonError::Transport { .. } => StatusCode::BAD_GATEWAY,
            CommonError::Io(_) | CommonError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let retry_after_ms = match &self {
            CommonError::RateLimited { retry_after_ms } => Some(*retry_after_ms),
            _ => None,
        };
        let body = ErrorBody {
            error: self.category(),
            message: self.to_string(),
        };
        let mut response = (status, axum::Json(body)).into_response();
        if let Some(ms) = retry_after_ms {
            let retry_after_secs = ms.div_ceil(1000).max(1);
            if let Ok(value) = axum::http::HeaderValue::from_str(&retry_after_secs.to_string()) {
                response.headers_mut().insert(axum::http::header::RETRY_AFTER, value);
            }
        }
        response
    }
}

impl From<CommonError> for tonic::Status {
    fn from(err: CommonError) -> Self {
        let code = match &err {
            CommonError::NeedleNotFound { .. }
            | CommonError::NeedleDeleted { .. }
            | CommonError::NeedleExpired { .. }
            | CommonError::VolumeNotFound(_)
            | CommonError::CollectionNotFound(_)
            | CommonError::CookieMismatch(_) => tonic::Code::NotFound,
            CommonError::VolumeReadOnly(_) => tonic::Code::PermissionDenied,
            CommonError::VolumeFull(_) | CommonError::OutOfSpace { .. } | CommonError::NoWritableVolume { .. } => {
                tonic::Code::ResourceExhausted
            }
            CommonError::RateLimited { .. } => tonic::Code::ResourceExhausted,
            CommonError::InvalidFileId(..)
            | CommonError::InvalidReplicaPlacement(_)
            | CommonError::InvalidDiskType(_) => tonic::Code::InvalidArgument,
            CommonError::CrcMismatch { .. } | CommonError::CorruptRecord(..) | CommonError::TruncatedTail(..) => {
                tonic::Code::DataLoss
            }
            CommonError::NotLeader { .. } | CommonError::NoLeader | CommonError::LeaderChanged => {
                tonic::Code::FailedPrecondition
            }
            CommonError::ReplicationFailed { .. } | CommonError::Transport { .. } => tonic::Code::Unavailable,
            CommonError::Io(_) | CommonError::Internal(_) => tonic::Code::Internal,
        };
        tonic::Status::new(code, err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn category_is_stable_for_not_found_variants() {
        let e = CommonError::VolumeNotFound(7);
        assert_eq!(e.category(), "not_found");
    }

    #[test]
    fn http_status_maps_volume_full_to_insufficient_storage() {
        let resp = CommonError::VolumeFull(3).into_response();
        assert_eq!(resp.status(), StatusCode::INSUFFICIENT_STORAGE);
    }

    #[test]
    fn grpc_status_maps_not_leader_to_failed_precondition() {
        let status: tonic::Status = CommonError::NotLeader { leader: None }.into();
        assert_eq!(status.code(), tonic::Code::FailedPrecondition);
    }
}
