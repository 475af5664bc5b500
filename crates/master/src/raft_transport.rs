//! Delivers outbound raft messages to peer masters over the `RaftStep`
//! unary RPC. Connections are cached per peer and reconnected lazily;
//! per `consensus::RaftTransport`'s contract, every failure is logged
//! and swallowed rather than surfaced, since raft's own timers retry.

use std::collections::HashMap;
use std::sync::Arc;

use consensus::RaftTransport;
use dashmap::DashMap;
use parking_lot::RwLock;
use prost::Message as _;
use raft::prelude::Message;
use rpc::{MasterServiceClient, RaftStepRequest};
use tonic::transport::Channel;
use tracing::warn;

/// `raft_id -> grpc address` map, updated as peers are added or removed
/// via `RaftAddServer`/`RaftRemoveServer`.
#[derive(Clone, Default)]
pub struct PeerAddresses {
    inner: Arc<RwLock<HashMap<u64, String>>>,
}

impl PeerAddresses {
    pub fn new(initial: impl IntoIterator<Item = (u64, String)>) -> Self {
        Self {
            inner: Arc::new(RwLock::new(initial.into_iter().collect())),
        }
    }

    pub fn set(&self, id: u64, address: String) {
        self.inner.write().insert(id, address);
    }

    pub fn remove(&self, id: u64) {
        self.inner.write().remove(&id);
    }

    pub fn get(&self, id: u64) -> Option<String> {
        self.inner.read().get(&id).cloned()
    }
}

pub struct GrpcRaftTransport {
    peers: PeerAddresses,
    clients: DashMap<u64, MasterServiceClient<Channel>>,
}

impl GrpcRaftTransport {
    pub fn new(peers: PeerAddresses) -> Self {
        Self {
            peers,
            clients: DashMap::new(),
        }
    }

    async fn client_for(&self, to: u64) -> Option<MasterServiceClient<Channel>> {
        if let Some(client) = self.clients.get(&to) {
            return Some(client.clone());
        }
        let address = self.peers.get(to)?;
        match MasterServiceClient::connect(format!("http://{address}")).await {
            Ok(client) => {
                self.clients.insert(to, client.clone());
                Some(client)
            }
            Err(err) => {
                warn!(peer = to, %address, error = %err, "failed to connect raft transport");
                None
            }
        }
    }
}

#[async_trait::async_trait]
impl RaftTransport for GrpcRaftTransport {
    async fn send(&self, to: u64, message: Message) {
        let Some(mut client) = self.client_for(to).await else {
            return;
        };
        let request = RaftStepRequest {
            message: message.encode_to_vec(),
        };
        if let Err(status) = client.raft_step(request).await {
            warn!(peer = to, error = %status, "raft step delivery failed");
            self.clients.remove(&to);
        }
    }
}
