//! One `KeepConnected` stream kept open to the current leader, shared by
//! every non-master process in it (filer, volume server, gateway) so they
//! all see the same vid map without each opening their own stream.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::{broadcast, mpsc};
use tokio_stream::wrappers::ReceiverStream;
use tonic::Request;
use tracing::{info, warn};

use common::{CommonError, FileId};
use rpc::keep_connected_response::Kind;
use rpc::{ClusterNodeUpdate, KeepConnectedRequest, Location, LookupVolumeRequest, MasterServiceClient, VolumeLocation};

use crate::vid_map::{VidMap, VidMapHistory, DEFAULT_HISTORY_DEPTH};

const RECONNECT_BACKOFF: Duration = Duration::from_secs(1);
const OUTBOUND_BUFFER: usize = 8;

/// Identity this process presents on every `KeepConnected` connect.
#[derive(Debug, Clone)]
pub struct MasterClientIdentity {
    pub client_type: String,
    pub client_host: String,
    pub data_center: String,
    pub rack: String,
    pub filer_group: String,
    pub version: String,
}

impl From<&MasterClientIdentity> for KeepConnectedRequest {
    fn from(id: &MasterClientIdentity) -> Self {
        KeepConnectedRequest {
            client_type: id.client_type.clone(),
            client_host: id.client_host.clone(),
            data_center: id.data_center.clone(),
            rack: id.rack.clone(),
            filer_group: id.filer_group.clone(),
            version: id.version.clone(),
        }
    }
}

/// Shared client-side view of the master cluster: candidate addresses,
/// the currently connected leader, the vid map, and a small history of
/// superseded maps. One instance is created per process and shared
/// process-wide so every caller sees the same vid map.
pub struct MasterClient {
    identity: MasterClientIdentity,
    candidates: RwLock<Vec<String>>,
    current_master: RwLock<Option<String>>,
    vid_map: RwLock<VidMap>,
    history: RwLock<VidMapHistory>,
    cluster_updates: broadcast::Sender<ClusterNodeUpdate>,
}

impl MasterClient {
    pub fn new(candidates: Vec<String>, identity: MasterClientIdentity) -> Arc<Self> {
        let (cluster_updates, _) = broadcast::channel(256);
        Arc::new(Self {
            identity,
            candidates: RwLock::new(candidates),
            current_master: RwLock::new(None),
            vid_map: RwLock::new(VidMap::new()),
            history: RwLock::new(VidMapHistory::new(DEFAULT_HISTORY_DEPTH)),
            cluster_updates,
        })
    }

    pub fn current_master(&self) -> Option<String> {
        self.current_master.read().clone()
    }

    pub fn subscribe_cluster_updates(&self) -> broadcast::Receiver<ClusterNodeUpdate> {
        self.cluster_updates.subscribe()
    }

    /// Spawns the background task driving exactly one open `KeepConnected`
    /// stream, reconnecting on disconnect or on a leader-change hint.
    pub fn spawn_keep_connected(self: &Arc<Self>) {
        let this = self.clone();
        tokio::spawn(async move { this.run().await });
    }

    async fn run(self: Arc<Self>) {
        let mut next_hint: Option<String> = None;
        loop {
            let addr = match next_hint.take() {
                Some(hint) => hint,
                None => match self.pick_candidate() {
                    Some(addr) => addr,
                    None => {
                        warn!("master client has no candidate addresses configured");
                        tokio::time::sleep(RECONNECT_BACKOFF).await;
                        continue;
                    }
                },
            };

            info!(master = %addr, "connecting keep-connected stream");
            match self.connect_and_stream(&addr).await {
                Ok(hint) => {
                    *self.current_master.write() = None;
                    next_hint = hint;
                }
                Err(err) => {
                    warn!(master = %addr, error = %err, "keep-connected stream failed");
                    *self.current_master.write() = None;
                }
            }
            tokio::time::sleep(RECONNECT_BACKOFF).await;
        }
    }

    fn pick_candidate(&self) -> Option<String> {
        self.candidates.read().first().cloned()
    }

    async fn connect_and_stream(&self, addr: &str) -> Result<Option<String>, CommonError> {
        let mut client = MasterServiceClient::connect(format!("http://{addr}"))
            .await
            .map_err(|e| CommonError::Transport {
                peer: addr.to_string(),
                message: e.to_string(),
            })?;

        let (tx, rx) = mpsc::channel(OUTBOUND_BUFFER);
        tx.send(KeepConnectedRequest::from(&self.identity))
            .await
            .map_err(|_| CommonError::Internal("keep-connected outbound channel closed".into()))?;

        let outbound = ReceiverStream::new(rx);
        let mut inbound = client
            .keep_connected(Request::new(outbound))
            .await
            .map_err(|status| CommonError::Transport {
                peer: addr.to_string(),
                message: status.to_string(),
            })?
            .into_inner();

        self.reset_vid_map();
        *self.current_master.write() = Some(addr.to_string());

        loop {
            let response = inbound.message().await.map_err(|status| CommonError::Transport {
                peer: addr.to_string(),
                message: status.to_string(),
            })?;
            let Some(response) = response else {
                return Ok(None);
            };
            match response.kind {
                Some(Kind::Snapshot(snapshot)) => {
                    self.vid_map.write().replace_with_snapshot(snapshot.volumes);
                }
                Some(Kind::Delta(delta)) => {
                    let mut map = self.vid_map.write();
                    map.apply_new(delta.new_vids);
                    map.apply_deleted(delta.deleted_vids);
                }
                Some(Kind::ClusterNodeUpdate(update)) => {
                    let _ = self.cluster_updates.send(update);
                }
                Some(Kind::NewLeader(leader)) => {
                    info!(new_leader = %leader, "master reported leader change, reconnecting");
                    return Ok(Some(leader));
                }
                None => {}
            }
        }
    }

    fn reset_vid_map(&self) {
        let old = std::mem::take(&mut *self.vid_map.write());
        self.history.write().push(old);
    }

    /// Resolves replica URLs for `fid`, trying the live vid map, then the
    /// LRU of superseded maps, and finally a unary `LookupVolume` RPC
    /// against the current master. Same-datacenter replicas are sorted
    /// first so a client prefers local traffic.
    pub async fn lookup_file_id_with_fallback(&self, fid: FileId) -> Result<Vec<String>, CommonError> {
        let vid = fid.volume_id.0;

        if let Some(locations) = self.vid_map.read().get(vid) {
            return Ok(self.order_same_dc_first(locations));
        }
        if let Some(locations) = self.history.read().find(vid) {
            return Ok(self.order_same_dc_first(&locations));
        }

        let addr = self.current_master().ok_or(CommonError::NoLeader)?;
        let mut client = MasterServiceClient::connect(format!("http://{addr}"))
            .await
            .map_err(|e| CommonError::Transport {
                peer: addr.clone(),
                message: e.to_string(),
            })?;
        let response = client
            .lookup_volume(LookupVolumeRequest {
                vids: vec![vid],
                collection: String::new(),
            })
            .await
            .map_err(|status| CommonError::Transport {
                peer: addr,
                message: status.to_string(),
            })?
            .into_inner();

        let locations = response
            .volume_locations
            .into_iter()
            .find(|vl| vl.vid == vid)
            .map(|vl| vl.locations)
            .ok_or(CommonError::VolumeNotFound(vid))?;

        self.vid_map.write().apply_new([VolumeLocation {
            vid,
            locations: locations.clone(),
        }]);
        Ok(self.order_same_dc_first(&locations))
    }

    fn order_same_dc_first(&self, locations: &[Location]) -> Vec<String> {
        let (mut same_dc, mut other): (Vec<String>, Vec<String>) = (Vec::new(), Vec::new());
        for loc in locations {
            if loc.data_center == self.identity.data_center {
                same_dc.push(loc.public_url.clone());
            } else {
                other.push(loc.public_url.clone());
            }
        }
        same_dc.extend(other);
        same_dc
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity() -> MasterClientIdentity {
        MasterClientIdentity {
            client_type: "volume".into(),
            client_host: "host1:8080".into(),
            data_center: "dc1".into(),
            rack: "rack1".into(),
            filer_group: String::new(),
            version: "0.1.0".into(),
        }
    }

    #[test]
    fn same_dc_replicas_sort_first() {
        let client = MasterClient::new(vec!["master1:9333".into()], identity());
        let locations = vec![
            Location::new("other:1", "other:1", "dc2"),
            Location::new("local:1", "local:1", "dc1"),
        ];
        let ordered = client.order_same_dc_first(&locations);
        assert_eq!(ordered, vec!["local:1".to_string(), "other:1".to_string()]);
    }

    #[tokio::test]
    async fn lookup_without_any_connection_fails_with_no_leader() {
        let client = MasterClient::new(vec![], identity());
        let fid = "3,01637037d6deadbeef".parse().unwrap();
        let err = client.lookup_file_id_with_fallback(fid).await.unwrap_err();
        assert!(matches!(err, CommonError::NoLeader));
    }
}
