mod config;
mod grpc;
mod heartbeat;
mod http;
mod rate_limit;
mod replication;
mod state;
mod store;

use std::sync::Arc;

use clap::Parser;
use common::JwtSigner;
use master_client::{MasterClient, MasterClientIdentity};
use tokio::sync::watch;
use tonic::transport::Server as TonicServer;
use tracing::info;
use tracing_subscriber::EnvFilter;

use config::VolumeServerConfig;
use grpc::VolumeGrpc;
use rate_limit::ByteRateLimiter;
use state::VolumeServerState;
use store::{build_locations, Store};

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
    let config = VolumeServerConfig::parse();

    let locations = build_locations(
        &config.parsed_dirs(),
        config.max_volume_count,
        config.min_free_space_bytes,
        config.capacity_bytes,
    )?;
    let store = Store::new(locations);

    let identity = MasterClientIdentity {
        client_type: "volume".to_string(),
        client_host: config.public_url(),
        data_center: config.data_center.clone(),
        rack: config.rack.clone(),
        filer_group: String::new(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    };
    let master_client = MasterClient::new(config.masters.clone(), identity);
    master_client.spawn_keep_connected();

    let jwt = JwtSigner::new(config.jwt_secret.as_bytes(), 3600);
    let upload_limiter = ByteRateLimiter::new(config.concurrent_upload_bytes, config.rate_limit_wait_ms);
    let download_limiter = ByteRateLimiter::new(config.concurrent_download_bytes, config.rate_limit_wait_ms);

    let http_addr = config.http_addr.parse()?;
    let grpc_addr: std::net::SocketAddr = config.grpc_addr.parse()?;

    let state = Arc::new(VolumeServerState {
        config,
        store,
        master_client,
        jwt,
        upload_limiter,
        download_limiter,
        http_client: reqwest::Client::new(),
    });

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let heartbeat_task = tokio::spawn(heartbeat::run(state.clone(), shutdown_rx));

    let http_router = http::router(state.clone());
    let http_server = axum::serve(tokio::net::TcpListener::bind(http_addr).await?, http_router);

    let volume_grpc = VolumeGrpc::new(state.clone());
    let grpc_server = TonicServer::builder()
        .add_service(rpc::VolumeServerServer::new(volume_grpc))
        .serve(grpc_addr);

    info!(%http_addr, %grpc_addr, "volume server listening");

    tokio::select! {
        res = http_server => res.map_err(anyhow::Error::from)?,
        res = grpc_server => res.map_err(anyhow::Error::from)?,
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown signal received, sending final heartbeat");
            let _ = shutdown_tx.send(true);
            let _ = tokio::time::timeout(std::time::Duration::from_secs(5), heartbeat_task).await;
        }
    }

    Ok(())
}
