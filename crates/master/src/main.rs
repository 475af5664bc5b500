mod assign;
mod config;
mod grow;
mod grpc;
mod http;
mod raft_transport;
mod state;
mod vacuum;

use std::sync::Arc;

use clap::Parser;
use common::JwtSigner;
use consensus::ConsensusNode;
use dashmap::DashMap;
use tonic::transport::Server as TonicServer;
use topology::{GrowerHandle, Topology};
use tracing::info;
use tracing_subscriber::EnvFilter;

use config::MasterConfig;
use grpc::MasterGrpc;
use raft_transport::{GrpcRaftTransport, PeerAddresses};
use state::MasterState;

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let format = std::env::var("STORAGECORE_LOG_FORMAT").unwrap_or_else(|_| "compact".to_string());

    if format.eq_ignore_ascii_case("json") {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(true)
            .json()
            .flatten_event(true)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(env_filter).with_target(true).compact().init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let config = MasterConfig::parse();

    let peers = PeerAddresses::new(config.parsed_peers());
    let transport = Arc::new(GrpcRaftTransport::new(peers.clone()));
    let voters = config.voter_ids();
    let consensus = ConsensusNode::spawn(config.raft_id, voters, transport);

    let (grower, grow_requests) = GrowerHandle::new(config.grower_queue_capacity);

    let write_jwt = JwtSigner::new(config.jwt_secret.as_bytes(), config.write_jwt_ttl_seconds);
    let read_jwt = JwtSigner::new(config.jwt_secret.as_bytes(), config.read_jwt_ttl_seconds);

    let state = Arc::new(MasterState {
        topology: Topology::new(),
        registry: cluster_registry::ClusterRegistry::new(),
        consensus,
        layouts: DashMap::new(),
        volume_layout_keys: DashMap::new(),
        grower,
        write_jwt,
        read_jwt,
        file_key_counters: DashMap::new(),
        pending_replicas: DashMap::new(),
        config,
    });

    tokio::spawn(grow::run(state.clone(), grow_requests));
    tokio::spawn(vacuum::run(state.clone()));

    let http_addr = state.config.http_addr.parse()?;
    let grpc_addr: std::net::SocketAddr = state.config.grpc_addr.parse()?;

    let http_router = http::router(state.clone());
    let http_server = axum::serve(tokio::net::TcpListener::bind(http_addr).await?, http_router);

    let master_grpc = MasterGrpc::new(state.clone(), peers);
    let grpc_server = TonicServer::builder()
        .add_service(rpc::MasterServer::new(master_grpc))
        .serve(grpc_addr);

    info!(%http_addr, %grpc_addr, raft_id = state.config.raft_id, "master node listening");

    tokio::select! {
        res = http_server => res.map_err(anyhow::Error::from)?,
        res = grpc_server => res.map_err(anyhow::Error::from)?,
    }

    Ok(())
}
