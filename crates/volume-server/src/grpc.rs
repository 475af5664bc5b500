//! The `VolumeServer` gRPC surface: volume lifecycle management (allocate,
//! vacuum) and the streaming reads the master and sibling replicas use to
//! rebuild a volume from scratch. Unlike the HTTP surface this is
//! master-to-server and server-to-server traffic only, never end-user.

use std::pin::Pin;
use std::sync::Arc;

use common::{Collection, CommonError, DiskType, ReplicaPlacement, Ttl, VolumeId};
use futures::Stream;
use needle_store::VolumeOptions;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::{Request, Response, Status};
use tracing::info;

use rpc::{
    AllocateVolumeRequest, AllocateVolumeResponse, PingRequest, PingResponse, ReadAllNeedlesRequest,
    ReadAllNeedlesResponse, VacuumVolumeCheckRequest, VacuumVolumeCheckResponse, VacuumVolumeCleanupRequest,
    VacuumVolumeCleanupResponse, VacuumVolumeCommitRequest, VacuumVolumeCommitResponse, VacuumVolumeCompactRequest,
    VacuumVolumeCompactResponse, VolumeIncrementalCopyRequest, VolumeIncrementalCopyResponse,
    VolumeSyncStatusRequest, VolumeSyncStatusResponse,
};

use crate::state::VolumeServerState;

pub struct VolumeGrpc {
    state: Arc<VolumeServerState>,
}

impl VolumeGrpc {
    pub fn new(state: Arc<VolumeServerState>) -> Self {
        Self { state }
    }
}

type Resp<T> = Result<Response<T>, Status>;

fn volume_options(collection: String, replica_placement: &str, ttl_minutes: u32, disk_type: &str) -> Result<VolumeOptions, CommonError> {
    Ok(VolumeOptions {
        collection: Collection(collection),
        replica_placement: replica_placement
            .parse::<ReplicaPlacement>()
            .map_err(|_| CommonError::InvalidReplicaPlacement(replica_placement.to_string()))?,
        ttl: Ttl(ttl_minutes * 60),
        disk_type: disk_type
            .parse::<DiskType>()
            .map_err(|_| CommonError::InvalidDiskType(disk_type.to_string()))?,
        size_limit_bytes: VolumeOptions::default().size_limit_bytes,
    })
}

fn encode_needle_bytes(decoded: &needle_store::DecodedNeedle) -> Vec<u8> {
    let (bytes, _) = decoded.needle.encode(decoded.append_at_ns);
    bytes
}

#[tonic::async_trait]
impl rpc::VolumeServerRpc for VolumeGrpc {
    type VacuumVolumeCompactStream = Pin<Box<dyn Stream<Item = Result<VacuumVolumeCompactResponse, Status>> + Send + 'static>>;
    type VolumeIncrementalCopyStream =
        Pin<Box<dyn Stream<Item = Result<VolumeIncrementalCopyResponse, Status>> + Send + 'static>>;
    type ReadAllNeedlesStream = Pin<Box<dyn Stream<Item = Result<ReadAllNeedlesResponse, Status>> + Send + 'static>>;

    async fn allocate_volume(&self, request: Request<AllocateVolumeRequest>) -> Resp<AllocateVolumeResponse> {
        let req = request.into_inner();
        let options = volume_options(req.collection, &req.replica_placement, req.ttl_minutes, &req.disk_type)?;
        self.state.store.open_or_create_volume(VolumeId(req.vid), options)?;
        info!(vid = req.vid, "volume allocated");
        Ok(Response::new(AllocateVolumeResponse {}))
    }

    async fn vacuum_volume_check(&self, request: Request<VacuumVolumeCheckRequest>) -> Resp<VacuumVolumeCheckResponse> {
        let vid = VolumeId(request.into_inner().vid);
        let volume = self.state.store.find_volume(vid).ok_or(CommonError::VolumeNotFound(vid.0))?;
        Ok(Response::new(VacuumVolumeCheckResponse {
            garbage_ratio: volume.garbage_ratio(),
        }))
    }

    async fn vacuum_volume_compact(
        &self,
        request: Request<VacuumVolumeCompactRequest>,
    ) -> Resp<Self::VacuumVolumeCompactStream> {
        let vid = VolumeId(request.into_inner().vid);
        let volume = self.state.store.find_volume(vid).ok_or(CommonError::VolumeNotFound(vid.0))?;
        let (tx, rx) = mpsc::channel(1);

        tokio::task::spawn_blocking(move || {
            let result = volume.compact();
            let response = match result {
                Ok(()) => Ok(VacuumVolumeCompactResponse {
                    processed_bytes: volume.size_bytes(),
                    done: true,
                }),
                Err(err) => Err(Status::from(err)),
            };
            let _ = tx.blocking_send(response);
        });

        Ok(Response::new(Box::pin(ReceiverStream::new(rx))))
    }

    async fn vacuum_volume_commit(&self, request: Request<VacuumVolumeCommitRequest>) -> Resp<VacuumVolumeCommitResponse> {
        let vid = VolumeId(request.into_inner().vid);
        let volume = self.state.store.find_volume(vid).ok_or(CommonError::VolumeNotFound(vid.0))?;
        Ok(Response::new(VacuumVolumeCommitResponse {
            is_read_only: volume.is_read_only(),
        }))
    }

    async fn vacuum_volume_cleanup(&self, request: Request<VacuumVolumeCleanupRequest>) -> Resp<VacuumVolumeCleanupResponse> {
        let _ = request;
        Ok(Response::new(VacuumVolumeCleanupResponse {}))
    }

    async fn volume_incremental_copy(
        &self,
        request: Request<VolumeIncrementalCopyRequest>,
    ) -> Resp<Self::VolumeIncrementalCopyStream> {
        let req = request.into_inner();
        let vid = VolumeId(req.vid);
        let volume = self.state.store.find_volume(vid).ok_or(CommonError::VolumeNotFound(vid.0))?;
        let needles = volume.scan_since(req.since_append_ns)?;
        let (tx, rx) = mpsc::channel(16);

        tokio::spawn(async move {
            for decoded in &needles {
                let response = VolumeIncrementalCopyResponse {
                    needle_bytes: encode_needle_bytes(decoded),
                };
                if tx.send(Ok(response)).await.is_err() {
                    break;
                }
            }
        });

        Ok(Response::new(Box::pin(ReceiverStream::new(rx))))
    }

    /// `tail_offset` carries the watermark a catch-up caller diffs
    /// against, not a byte offset: the primary's own `append_at_ns` clock,
    /// so `VolumeIncrementalCopy { since_append_ns: tail_offset }` resumes
    /// exactly where this replica left off.
    async fn volume_sync_status(&self, request: Request<VolumeSyncStatusRequest>) -> Resp<VolumeSyncStatusResponse> {
        let vid = VolumeId(request.into_inner().vid);
        let volume = self.state.store.find_volume(vid).ok_or(CommonError::VolumeNotFound(vid.0))?;
        Ok(Response::new(VolumeSyncStatusResponse {
            tail_offset: volume.last_append_ns(),
            compaction_revision: volume.compaction_revision() as u64,
            idx_file_size: volume.needle_counts().0 as u32,
        }))
    }

    async fn read_all_needles(&self, request: Request<ReadAllNeedlesRequest>) -> Resp<Self::ReadAllNeedlesStream> {
        let vid = VolumeId(request.into_inner().vid);
        let volume = self.state.store.find_volume(vid).ok_or(CommonError::VolumeNotFound(vid.0))?;
        let needles = volume.scan_all()?;
        let (tx, rx) = mpsc::channel(16);

        tokio::spawn(async move {
            for decoded in needles {
                let response = ReadAllNeedlesResponse {
                    key: decoded.needle.key.0,
                    cookie: decoded.needle.cookie.0,
                    data: decoded.needle.payload,
                    is_deleted: decoded.is_tombstone,
                };
                if tx.send(Ok(response)).await.is_err() {
                    break;
                }
            }
        });

        Ok(Response::new(Box::pin(ReceiverStream::new(rx))))
    }

    async fn ping(&self, _request: Request<PingRequest>) -> Resp<PingResponse> {
        Ok(Response::new(PingResponse {
            version: env!("CARGO_PKG_VERSION").to_string(),
        }))
    }
}
