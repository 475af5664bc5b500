//! The volume-growth worker: the one place that ties `topology`'s grow
//! queue to `consensus`'s replicated volume-id counter and an
//! `AllocateVolume` RPC fan-out to the chosen replicas. Lives in this
//! binary (not the `topology` crate) because it is the only piece of
//! placement logic that needs both consensus and RPC.

use std::sync::Arc;

use common::CommonError;
use consensus::MaxVolumeIdCommand;
use tokio::sync::mpsc;
use topology::GrowRequest;
use tracing::{info, warn};

use crate::state::MasterState;

pub async fn run(state: Arc<MasterState>, mut requests: mpsc::Receiver<GrowRequest>) {
    while let Some(request) = requests.recv().await {
        let result = grow_one(&state, &request).await;
        if let Err(err) = &result {
            warn!(error = %err, "volume growth request failed");
        }
        let _ = request.reply.send(result);
    }
    info!("volume grower loop exiting: request channel closed");
}

async fn grow_one(state: &MasterState, request: &GrowRequest) -> Result<common::VolumeId, CommonError> {
    state.require_leader()?;

    let next_id = common::VolumeId(state.consensus.current_max_volume_id() + 1);
    state.consensus.propose(MaxVolumeIdCommand(next_id.0)).await?;

    let (_collection, replication, ttl, disk_type) = &request.key;
    let locations = pick_replica_nodes(state, replication.dc_copies, replication.rack_copies, replication.node_copies);
    if locations.is_empty() {
        return Err(CommonError::NoWritableVolume {
            collection: request.key.0.to_string(),
            replication: replication.to_string(),
        });
    }

    for location in &locations {
        allocate_on(&location.address, next_id, &request.key.0, *replication, *ttl, *disk_type, state.config.volume_size_limit_mb).await?;
    }

    let layout = state.layout_for(&request.key);
    layout.report_volume(next_id, 0, false);
    state.volume_layout_keys.insert(next_id, request.key.clone());
    state.pending_replicas.insert(next_id, locations.clone());
    info!(volume_id = %next_id, nodes = ?locations, "grew new volume");
    Ok(next_id)
}

/// Picks `(dc_copies+1) * (rack_copies+1) * (node_copies+1)` distinct
/// node locations per the weighted-random-without-replacement algorithm
/// in `topology::Topology`.
fn pick_replica_nodes(state: &MasterState, dc_copies: u8, rack_copies: u8, node_copies: u8) -> Vec<topology::NodeLocation> {
    let mut locations = Vec::new();
    for dc in state.topology.pick_data_centers(dc_copies as usize + 1) {
        for rack in state.topology.pick_racks(dc, rack_copies as usize + 1) {
            for node in state.topology.pick_nodes(rack, node_copies as usize + 1) {
                locations.push(state.topology.node_location(node));
            }
        }
    }
    locations
}

async fn allocate_on(
    address: &str,
    vid: common::VolumeId,
    collection: &common::Collection,
    replication: common::ReplicaPlacement,
    ttl: common::Ttl,
    disk_type: common::DiskType,
    size_limit_mb: u32,
) -> Result<(), CommonError> {
    let mut client =
        rpc::VolumeServiceClient::connect(format!("http://{address}"))
            .await
            .map_err(|e| CommonError::Transport {
                peer: address.to_string(),
                message: e.to_string(),
            })?;

    client
        .allocate_volume(rpc::AllocateVolumeRequest {
            vid: vid.0,
            collection: collection.0.clone(),
            replica_placement: replication.to_string(),
            ttl_minutes: ttl.0,
            disk_type: disk_type.to_string(),
            preallocate_bytes: size_limit_mb as u64 * 1024 * 1024,
        })
        .await
        .map_err(|status| CommonError::Transport {
            peer: address.to_string(),
            message: status.to_string(),
        })?;
    Ok(())
}
