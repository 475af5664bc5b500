//! Outbound heartbeat client: one `SendHeartbeat` stream kept open to a
//! master, per §4.2 — a full volume snapshot on connect, a full snapshot
//! again on every pulse, and a final `has_no_volumes` snapshot on
//! shutdown. TTL expiration is swept on the same cadence as the pulse
//! rather than as a separate task, since the spec folds it into the
//! heartbeat rebuild.

use std::sync::Arc;
use std::time::Duration;

use common::{CommonError, VolumeId};
use tokio::sync::{mpsc, watch};
use tokio_stream::wrappers::ReceiverStream;
use tonic::Request;
use tracing::{info, warn};

use rpc::{HeartbeatRequest, HeartbeatResponse, MasterServiceClient};

use crate::state::VolumeServerState;

const RECONNECT_BACKOFF: Duration = Duration::from_secs(1);

fn split_host_port(addr: &str) -> (String, u32) {
    match addr.rsplit_once(':') {
        Some((host, port)) => (host.to_string(), port.parse().unwrap_or(0)),
        None => (addr.to_string(), 0),
    }
}

fn build_request(state: &VolumeServerState, has_no_volumes: bool) -> HeartbeatRequest {
    let (ip, port) = split_host_port(&state.config.grpc_addr);
    let volumes = if has_no_volumes { Vec::new() } else { state.store.all_short_infos() };
    HeartbeatRequest {
        ip,
        port,
        public_url: state.config.public_url(),
        data_center: state.config.data_center.clone(),
        rack: state.config.rack.clone(),
        max_volume_count: state.config.max_volume_count as u64,
        volumes,
        new_volumes: Vec::new(),
        deleted_volumes: Vec::new(),
        max_file_key: state.store.max_file_key(),
        location_uuids: state.store.locations().iter().map(|loc| loc.uuid().to_string()).collect(),
        has_no_volumes,
    }
}

fn handle_response(state: &VolumeServerState, response: HeartbeatResponse) {
    for vid in response.deleted_vids {
        if let Err(err) = state.store.destroy_volume(VolumeId(vid)) {
            warn!(vid, error = %err, "failed to destroy volume per master instruction");
        }
    }
}

/// Runs the heartbeat loop until `shutdown` is set, sending a final
/// `has_no_volumes=true` heartbeat before returning.
pub async fn run(state: Arc<VolumeServerState>, mut shutdown: watch::Receiver<bool>) {
    let mut next = 0usize;
    loop {
        if *shutdown.borrow() {
            return;
        }
        let masters = &state.config.masters;
        if masters.is_empty() {
            warn!("volume server has no configured master peers");
            tokio::time::sleep(RECONNECT_BACKOFF).await;
            continue;
        }
        let addr = masters[next % masters.len()].clone();
        next = next.wrapping_add(1);

        match connect_and_heartbeat(&state, &addr, &mut shutdown).await {
            Ok(()) => return,
            Err(err) => {
                warn!(master = %addr, error = %err, "heartbeat stream failed, retrying");
                tokio::time::sleep(RECONNECT_BACKOFF).await;
            }
        }
    }
}

async fn connect_and_heartbeat(
    state: &Arc<VolumeServerState>,
    addr: &str,
    shutdown: &mut watch::Receiver<bool>,
) -> Result<(), CommonError> {
    let mut client = MasterServiceClient::connect(format!("http://{addr}"))
        .await
        .map_err(|e| CommonError::Transport { peer: addr.to_string(), message: e.to_string() })?;

    let (tx, rx) = mpsc::channel(8);
    tx.send(build_request(state, false))
        .await
        .map_err(|_| CommonError::Internal("heartbeat outbound channel closed".into()))?;

    let outbound = ReceiverStream::new(rx);
    let mut inbound = client
        .send_heartbeat(Request::new(outbound))
        .await
        .map_err(|status| CommonError::Transport { peer: addr.to_string(), message: status.to_string() })?
        .into_inner();

    info!(master = %addr, "heartbeat stream connected");

    let mut pulse = tokio::time::interval(Duration::from_secs(state.config.pulse_seconds.max(1)));
    pulse.tick().await;

    loop {
        tokio::select! {
            _ = pulse.tick() => {
                let now = std::time::SystemTime::now()
                    .duration_since(std::time::UNIX_EPOCH)
                    .unwrap_or_default()
                    .as_secs();
                let expired = state.store.sweep_expired(state.config.ttl_grace_seconds, now);
                if !expired.is_empty() {
                    info!(count = expired.len(), "swept ttl-expired volumes during heartbeat pulse");
                }
                if tx.send(build_request(state, false)).await.is_err() {
                    return Err(CommonError::Transport { peer: addr.to_string(), message: "outbound channel closed".into() });
                }
            }
            msg = inbound.message() => {
                match msg {
                    Ok(Some(response)) => handle_response(state, response),
                    Ok(None) => {
                        return Err(CommonError::Transport { peer: addr.to_string(), message: "heartbeat stream closed by master".into() });
                    }
                    Err(status) => {
                        return Err(CommonError::Transport { peer: addr.to_string(), message: status.to_string() });
                    }
                }
            }
            changed = shutdown.changed() => {
                if changed.is_ok() && *shutdown.borrow() {
                    let _ = tx.send(build_request(state, true)).await;
                    return Ok(());
                }
            }
        }
    }
}
