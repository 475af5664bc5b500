//! gRPC surface for the master node: one `Master` impl over
//! `MasterState`. The two bidi-streaming RPCs spawn a task per connected
//! client; every unary RPC is answered directly off `state`.

use std::pin::Pin;
use std::sync::Arc;

use common::{Collection, CommonError, DiskType, ReplicaPlacement, Ttl, VolumeId};
use futures::Stream;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use tonic::{Request, Response, Status, Streaming};
use tracing::{info, warn};

use rpc::{
    keep_connected_response, AssignRequest, AssignResponse, ClusterNode as WireClusterNode, ClusterNodeUpdate,
    CollectionDeleteRequest, CollectionDeleteResponse, CollectionListRequest, CollectionListResponse,
    DataNodeInfo, GetMasterConfigurationRequest, GetMasterConfigurationResponse, HeartbeatRequest,
    HeartbeatResponse, KeepConnectedRequest, KeepConnectedResponse, ListClusterNodesRequest,
    ListClusterNodesResponse, Location, LookupVolumeRequest, LookupVolumeResponse, RaftAddServerRequest,
    RaftAddServerResponse, RaftListClusterServersRequest, RaftListClusterServersResponse, RaftRemoveServerRequest,
    RaftRemoveServerResponse, RaftStepRequest, RaftStepResponse, StatisticsRequest, StatisticsResponse,
    VolumeListRequest, VolumeListResponse, VolumeLocation,
};

use crate::raft_transport::PeerAddresses;
use crate::state::MasterState;

pub struct MasterGrpc {
    state: Arc<MasterState>,
    peers: PeerAddresses,
}

impl MasterGrpc {
    pub fn new(state: Arc<MasterState>, peers: PeerAddresses) -> Self {
        Self { state, peers }
    }
}

type Resp<T> = Result<Response<T>, Status>;

fn to_wire_location(loc: topology::NodeLocation) -> Location {
    Location::new(loc.address, loc.public_url, loc.data_center)
}

fn volume_location(vid: VolumeId, locations: Vec<topology::NodeLocation>) -> VolumeLocation {
    VolumeLocation {
        vid: vid.0,
        locations: locations.into_iter().map(to_wire_location).collect(),
    }
}

/// Merges one inbound heartbeat into the topology tree and every layout
/// it touches. This workspace's `Topology::merge_heartbeat` always
/// replaces a node's full volume set, so `HeartbeatRequest::volumes` is
/// treated as authoritative on every message rather than diffed against
/// `new_volumes`/`deleted_volumes` (which are accepted but unused here).
fn apply_heartbeat(state: &MasterState, beat: &HeartbeatRequest) {
    let address = format!("{}:{}", beat.ip, beat.port);
    let per_volume_bytes = state.config.volume_size_limit_mb as u64 * 1024 * 1024;
    let max_bytes = beat.max_volume_count * per_volume_bytes;
    let reported: Vec<(VolumeId, u64)> = beat.volumes.iter().map(|v| (VolumeId(v.id), v.size)).collect();

    state.topology.merge_heartbeat(
        &beat.data_center,
        &beat.rack,
        &address,
        &beat.public_url,
        max_bytes,
        reported,
    );

    for info in &beat.volumes {
        let (Ok(replication), Ok(disk_type)) = (
            info.replica_placement.parse::<ReplicaPlacement>(),
            info.disk_type.parse::<DiskType>(),
        ) else {
            warn!(volume_id = info.id, "heartbeat reported unparsable replication or disk type");
            continue;
        };
        let vid = VolumeId(info.id);
        let key = (Collection(info.collection.clone()), replication, Ttl(info.ttl_minutes * 60), disk_type);
        let layout = state.layout_for(&key);
        layout.report_volume(vid, info.size, info.read_only);
        state.volume_layout_keys.insert(vid, key);
        state.pending_replicas.remove(&vid);
    }

    if beat.max_file_key > 0 {
        for info in &beat.volumes {
            state.observe_file_key(VolumeId(info.id), beat.max_file_key);
        }
    }

    for deleted in &beat.deleted_volumes {
        let vid = VolumeId(deleted.id);
        if let Some(layout) = state.layout_for_volume(vid) {
            layout.remove_volume(vid);
        }
    }

    if beat.has_no_volumes {
        state.topology.remove_node(&address);
    }
}

#[tonic::async_trait]
impl rpc::Master for MasterGrpc {
    type SendHeartbeatStream = Pin<Box<dyn Stream<Item = Result<HeartbeatResponse, Status>> + Send + 'static>>;
    type KeepConnectedStream = Pin<Box<dyn Stream<Item = Result<KeepConnectedResponse, Status>> + Send + 'static>>;

    async fn send_heartbeat(&self, request: Request<Streaming<HeartbeatRequest>>) -> Resp<Self::SendHeartbeatStream> {
        let state = self.state.clone();
        let mut inbound = request.into_inner();
        let (tx, rx) = mpsc::channel(16);

        tokio::spawn(async move {
            while let Some(beat) = inbound.next().await {
                let beat = match beat {
                    Ok(beat) => beat,
                    Err(err) => {
                        warn!(error = %err, "heartbeat stream closed with error");
                        break;
                    }
                };
                apply_heartbeat(&state, &beat);

                let response = HeartbeatResponse {
                    volume_size_limit_mb: state.config.volume_size_limit_mb,
                    leader: state.consensus.leader().map(|id| id.to_string()).unwrap_or_default(),
                    deleted_vids: Vec::new(),
                };
                if tx.send(Ok(response)).await.is_err() {
                    break;
                }
            }
            info!("heartbeat stream closed");
        });

        Ok(Response::new(Box::pin(ReceiverStream::new(rx))))
    }

    async fn keep_connected(&self, request: Request<Streaming<KeepConnectedRequest>>) -> Resp<Self::KeepConnectedStream> {
        let mut inbound = request.into_inner();
        let Some(Ok(identity)) = inbound.next().await else {
            return Err(Status::invalid_argument("keep_connected requires an initial identity message"));
        };
        info!(client_type = %identity.client_type, client_host = %identity.client_host, "keep_connected client attached");

        let state = self.state.clone();
        let (tx, rx) = mpsc::channel(64);

        let snapshot = rpc::VidMapSnapshot {
            volumes: state
                .topology
                .all_volume_locations()
                .into_iter()
                .map(|(vid, locs)| volume_location(vid, locs))
                .collect(),
        };
        if tx
            .send(Ok(KeepConnectedResponse {
                kind: Some(keep_connected_response::Kind::Snapshot(snapshot)),
            }))
            .await
            .is_err()
        {
            return Ok(Response::new(Box::pin(ReceiverStream::new(rx))));
        }

        tokio::spawn(async move {
            let mut cluster_events = state.registry.subscribe();
            let mut leader_rx = state.consensus.leader_change_channel();

            loop {
                tokio::select! {
                    msg = inbound.next() => {
                        if msg.is_none() {
                            break;
                        }
                        if let Some(Err(err)) = msg {
                            warn!(error = %err, "keep_connected inbound error");
                            break;
                        }
                    }
                    event = cluster_events.recv() => {
                        let update = match event {
                            Ok(cluster_registry::ClusterNodeEvent::Added { group, node, is_leader }) => {
                                Some(ClusterNodeUpdate { filer_group: group, address: node.address, is_add: true, is_leader })
                            }
                            Ok(cluster_registry::ClusterNodeEvent::Removed { group, address, is_leader }) => {
                                Some(ClusterNodeUpdate { filer_group: group, address, is_add: false, is_leader })
                            }
                            Err(_) => None,
                        };
                        if let Some(update) = update {
                            let msg = KeepConnectedResponse { kind: Some(keep_connected_response::Kind::ClusterNodeUpdate(update)) };
                            if tx.send(Ok(msg)).await.is_err() {
                                break;
                            }
                        }
                    }
                    changed = leader_rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let leader = leader_rx.borrow().map(|id| id.to_string()).unwrap_or_default();
                        let msg = KeepConnectedResponse { kind: Some(keep_connected_response::Kind::NewLeader(leader)) };
                        if tx.send(Ok(msg)).await.is_err() {
                            break;
                        }
                    }
                }
            }
        });

        Ok(Response::new(Box::pin(ReceiverStream::new(rx))))
    }

    async fn lookup_volume(&self, request: Request<LookupVolumeRequest>) -> Resp<LookupVolumeResponse> {
        let req = request.into_inner();
        let volume_locations = req
            .vids
            .into_iter()
            .map(|vid| volume_location(VolumeId(vid), self.state.topology.locate_volume_nodes(VolumeId(vid))))
            .collect();
        Ok(Response::new(LookupVolumeResponse { volume_locations }))
    }

    async fn assign(&self, request: Request<AssignRequest>) -> Resp<AssignResponse> {
        let req = request.into_inner();
        let (vid, cookie, replicas) = crate::assign::assign_one(&self.state, &req).await?;
        let file_key = self.state.reserve_file_keys(vid, req.count.max(1) as u64);
        let public_url = replicas.first().map(|l| l.public_url.clone()).unwrap_or_default();

        Ok(Response::new(AssignResponse {
            vid: vid.0,
            file_key,
            cookie: cookie.0,
            public_url,
            replicas: replicas.into_iter().map(to_wire_location).collect(),
        }))
    }

    async fn statistics(&self, _request: Request<StatisticsRequest>) -> Resp<StatisticsResponse> {
        let (total_size, used_size) = self.state.topology.total_capacity();
        Ok(Response::new(StatisticsResponse {
            total_size,
            used_size,
            file_count: 0,
        }))
    }

    async fn collection_list(&self, _request: Request<CollectionListRequest>) -> Resp<CollectionListResponse> {
        let mut collections: Vec<String> = self
            .state
            .layouts
            .iter()
            .map(|entry| entry.key().0 .0.clone())
            .collect();
        collections.sort();
        collections.dedup();
        Ok(Response::new(CollectionListResponse { collections }))
    }

    async fn collection_delete(&self, request: Request<CollectionDeleteRequest>) -> Resp<CollectionDeleteResponse> {
        self.state.require_leader()?;
        let req = request.into_inner();
        let target = Collection(req.collection);
        let keys: Vec<_> = self
            .state
            .layouts
            .iter()
            .filter(|entry| entry.key().0 == target)
            .map(|entry| entry.key().clone())
            .collect();
        for key in keys {
            self.state.layouts.remove(&key);
        }
        Ok(Response::new(CollectionDeleteResponse {}))
    }

    async fn volume_list(&self, _request: Request<VolumeListRequest>) -> Resp<VolumeListResponse> {
        let data_nodes = self
            .state
            .topology
            .all_nodes()
            .into_iter()
            .map(|n| DataNodeInfo {
                id: n.address,
                public_url: n.public_url,
                data_center: n.data_center,
                max_volume_count: n.max_volume_count,
                free_volume_count: n.free_volume_count,
                rack: n.rack,
            })
            .collect();
        Ok(Response::new(VolumeListResponse { data_nodes }))
    }

    async fn get_master_configuration(
        &self,
        _request: Request<GetMasterConfigurationRequest>,
    ) -> Resp<GetMasterConfigurationResponse> {
        Ok(Response::new(GetMasterConfigurationResponse {
            leader: self.state.consensus.leader().map(|id| id.to_string()).unwrap_or_default(),
            peers: self.state.config.peers.clone(),
            volume_size_limit_mb: self.state.config.volume_size_limit_mb,
            default_replication: self.state.config.default_replication.clone(),
        }))
    }

    async fn list_cluster_nodes(&self, request: Request<ListClusterNodesRequest>) -> Resp<ListClusterNodesResponse> {
        let group = request.into_inner().filer_group;
        let leaders = self.state.registry.leaders(&group);
        let nodes = self
            .state
            .registry
            .members(&group)
            .into_iter()
            .map(|m| WireClusterNode {
                is_leader: leaders.contains(&m.address),
                address: m.address,
                version: m.version,
                data_center: m.data_center,
                rack: m.rack,
            })
            .collect();
        Ok(Response::new(ListClusterNodesResponse { nodes }))
    }

    async fn raft_list_cluster_servers(
        &self,
        _request: Request<RaftListClusterServersRequest>,
    ) -> Resp<RaftListClusterServersResponse> {
        Ok(Response::new(RaftListClusterServersResponse {
            servers: self.state.config.voter_ids().into_iter().map(|id| id.to_string()).collect(),
            leader: self.state.consensus.leader().map(|id| id.to_string()).unwrap_or_default(),
        }))
    }

    async fn raft_add_server(&self, request: Request<RaftAddServerRequest>) -> Resp<RaftAddServerResponse> {
        let req = request.into_inner();
        self.peers.set(req.id, req.address);
        self.state.consensus.add_voter(req.id).await?;
        Ok(Response::new(RaftAddServerResponse {}))
    }

    async fn raft_remove_server(&self, request: Request<RaftRemoveServerRequest>) -> Resp<RaftRemoveServerResponse> {
        let req = request.into_inner();
        self.state.consensus.remove_server(req.id).await?;
        self.peers.remove(req.id);
        Ok(Response::new(RaftRemoveServerResponse {}))
    }

    async fn raft_step(&self, request: Request<RaftStepRequest>) -> Resp<RaftStepResponse> {
        use prost::Message as _;
        let bytes = request.into_inner().message;
        let message = raft::prelude::Message::decode(bytes.as_slice())
            .map_err(|e| Status::invalid_argument(format!("malformed raft message: {e}")))?;
        self.state.consensus.step(message);
        Ok(Response::new(RaftStepResponse {}))
    }
}

