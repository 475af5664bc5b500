//! Periodic garbage collection: checks every known volume's garbage
//! ratio across its replicas and, when all agree it's over threshold,
//! pulls it out of the writable set and compacts it in place.
//!
//! A single process-wide lock (the `tokio::sync::Mutex` this loop holds
//! for its own entire duration) ensures at most one vacuum pass runs at a
//! time; a second timer tick while one pass is still running is simply
//! skipped rather than queued.

use std::sync::Arc;
use std::time::Duration;

use common::{CommonError, VolumeId};
use tokio::sync::Mutex;
use tokio_stream::StreamExt;
use tracing::{info, warn};

use crate::state::MasterState;

pub async fn run(state: Arc<MasterState>) {
    let lock = Mutex::new(());
    let mut ticker = tokio::time::interval(Duration::from_secs(state.config.vacuum_interval_seconds));
    loop {
        ticker.tick().await;
        let Ok(_guard) = lock.try_lock() else {
            warn!("previous vacuum pass still running, skipping this tick");
            continue;
        };
        if !state.is_leader() {
            continue;
        }
        run_one_pass(&state).await;
    }
}

async fn run_one_pass(state: &MasterState) {
    for vid in state.topology.all_volume_ids() {
        if let Err(err) = vacuum_volume(state, vid).await {
            warn!(volume_id = %vid, error = %err, "vacuum skipped volume");
        }
    }
}

async fn vacuum_volume(state: &MasterState, vid: VolumeId) -> Result<(), CommonError> {
    let replicas = state.topology.locate_volume(vid);
    if replicas.is_empty() {
        return Ok(());
    }

    let mut over_threshold = true;
    for replica in &replicas {
        let ratio = check(replica, vid).await?;
        if ratio < state.config.vacuum_garbage_threshold {
            over_threshold = false;
        }
    }
    if !over_threshold {
        return Ok(());
    }

    let layout = state.layout_for_volume(vid);
    if let Some(layout) = &layout {
        layout.remove_volume(vid);
    }

    let commit_result = compact_and_commit(&replicas, vid).await;
    match commit_result {
        Ok(became_read_only) => {
            if !became_read_only {
                if let Some(layout) = &layout {
                    layout.report_volume(vid, 0, false);
                }
            }
            info!(volume_id = %vid, "vacuum compacted and committed");
            Ok(())
        }
        Err(err) => {
            for replica in &replicas {
                let _ = cleanup(replica, vid).await;
            }
            Err(err)
        }
    }
}

async fn check(address: &str, vid: VolumeId) -> Result<f64, CommonError> {
    let mut client = connect(address).await?;
    let response = client
        .vacuum_volume_check(rpc::VacuumVolumeCheckRequest { vid: vid.0 })
        .await
        .map_err(|status| transport_error(address, status))?
        .into_inner();
    Ok(response.garbage_ratio)
}

/// Compacts and commits `vid` on every replica. Returns whether any
/// replica came back read-only post-commit; per §4, such a volume does
/// not rejoin the writable set even though the vacuum itself succeeded.
async fn compact_and_commit(replicas: &[String], vid: VolumeId) -> Result<bool, CommonError> {
    for address in replicas {
        let mut client = connect(address).await?;
        let mut progress = client
            .vacuum_volume_compact(rpc::VacuumVolumeCompactRequest { vid: vid.0 })
            .await
            .map_err(|status| transport_error(address, status))?
            .into_inner();
        while let Some(update) = progress.next().await {
            let update = update.map_err(|status| transport_error(address, status))?;
            if update.done {
                break;
            }
        }
    }
    let mut became_read_only = false;
    for address in replicas {
        let mut client = connect(address).await?;
        let response = client
            .vacuum_volume_commit(rpc::VacuumVolumeCommitRequest { vid: vid.0 })
            .await
            .map_err(|status| transport_error(address, status))?
            .into_inner();
        became_read_only |= response.is_read_only;
    }
    Ok(became_read_only)
}

async fn cleanup(address: &str, vid: VolumeId) -> Result<(), CommonError> {
    let mut client = connect(address).await?;
    client
        .vacuum_volume_cleanup(rpc::VacuumVolumeCleanupRequest { vid: vid.0 })
        .await
        .map_err(|status| transport_error(address, status))?;
    Ok(())
}

async fn connect(address: &str) -> Result<rpc::VolumeServiceClient<tonic::transport::Channel>, CommonError> {
    rpc::VolumeServiceClient::connect(format!("http://{address}"))
        .await
        .map_err(|e| CommonError::Transport {
            peer: address.to_string(),
            message: e.to_string(),
        })
}

fn transport_error(address: &str, status: tonic::Status) -> CommonError {
    CommonError::Transport {
        peer: address.to_string(),
        message: status.to_string(),
    }
}
