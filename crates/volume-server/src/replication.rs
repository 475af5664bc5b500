//! Primary-side fan-out of the write protocol in §4.2: once a needle is
//! appended locally, push the same bytes to every other replica and wait
//! for all of them to acknowledge before the original request succeeds.
//! Inbound fan-out requests are tagged with `?type=replicate` so a replica
//! never re-fans-out what it just received, which would loop forever.

use common::{CommonError, FileId};
use tracing::{info, warn};

/// Query marker the primary attaches to its internal fan-out POST/DELETE so
/// the receiving volume server applies the write locally without
/// replicating it any further.
pub const REPLICATE_MARKER: &str = "type=replicate";

/// POSTs `payload` to every address in `replicas`, returning the addresses
/// that failed to acknowledge. Per §4.2 this is all-or-nothing: the caller
/// surfaces a 5xx to its own client when any replica fails, while keeping
/// the bytes it already wrote locally.
pub async fn fan_out_write(
    client: &reqwest::Client,
    replicas: &[String],
    self_address: &str,
    fid: &str,
    content_type: Option<&str>,
    payload: &[u8],
) -> Vec<String> {
    let mut failed = Vec::new();
    for replica in replicas {
        if replica == self_address {
            continue;
        }
        let url = format!("http://{replica}/{fid}?{REPLICATE_MARKER}");
        let mut req = client.post(&url).body(payload.to_vec());
        if let Some(ct) = content_type {
            req = req.header(reqwest::header::CONTENT_TYPE, ct);
        }
        match req.send().await {
            Ok(resp) if resp.status().is_success() => {}
            Ok(resp) => {
                warn!(%replica, status = %resp.status(), "replica rejected fan-out write");
                failed.push(replica.clone());
            }
            Err(err) => {
                warn!(%replica, error = %err, "replica unreachable during fan-out write");
                failed.push(replica.clone());
            }
        }
    }
    failed
}

pub async fn fan_out_delete(client: &reqwest::Client, replicas: &[String], self_address: &str, fid: &str) -> Vec<String> {
    let mut failed = Vec::new();
    for replica in replicas {
        if replica == self_address {
            continue;
        }
        let url = format!("http://{replica}/{fid}?{REPLICATE_MARKER}");
        match client.delete(&url).send().await {
            Ok(resp) if resp.status().is_success() => {}
            Ok(resp) => {
                warn!(%replica, status = %resp.status(), "replica rejected fan-out delete");
                failed.push(replica.clone());
            }
            Err(err) => {
                warn!(%replica, error = %err, "replica unreachable during fan-out delete");
                failed.push(replica.clone());
            }
        }
    }
    failed
}

/// Brings a replica that missed a fan-out write back in sync: streams
/// every needle this node holds for `volume` to it over the same
/// `?type=replicate` path a live write would use. A full resync rather
/// than an `append_at_ns`-bounded delta — simpler and still correct, since
/// the replica's index keeps only the newest offset per key regardless of
/// how many times a given key is replayed.
pub async fn catch_up_replica(
    client: &reqwest::Client,
    volume: &needle_store::Volume,
    replica_http_addr: &str,
) -> Result<u64, CommonError> {
    let needles = volume.scan_all()?;
    let mut sent = 0u64;
    for decoded in needles {
        let fid = FileId::new(volume.id, decoded.needle.key, decoded.needle.cookie).to_string();
        let url = format!("http://{replica_http_addr}/{fid}?{REPLICATE_MARKER}");
        let outcome = if decoded.is_tombstone {
            client.delete(&url).send().await
        } else {
            client.post(&url).body(decoded.needle.payload.clone()).send().await
        };
        match outcome {
            Ok(resp) if resp.status().is_success() => sent += 1,
            Ok(resp) => warn!(%replica_http_addr, status = %resp.status(), "catch-up push rejected"),
            Err(err) => {
                return Err(CommonError::Transport {
                    peer: replica_http_addr.to_string(),
                    message: err.to_string(),
                })
            }
        }
    }
    info!(volume_id = volume.id.0, %replica_http_addr, needles = sent, "incremental catch-up complete");
    Ok(sent)
}
