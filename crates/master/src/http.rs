//! Master HTTP surface: the thin REST facade every SDK and the `/submit`
//! convenience endpoint use instead of talking gRPC directly. Handlers
//! translate query params into the same `assign_one`/topology calls the
//! gRPC service uses, so the two surfaces can never disagree about
//! placement.

use std::sync::Arc;

use axum::extract::{Multipart, Query, State};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use common::{CommonError, FileId, NeedleKey};
use serde::{Deserialize, Serialize};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::state::MasterState;

pub fn router(state: Arc<MasterState>) -> Router {
    Router::new()
        .route("/dir/assign", get(assign))
        .route("/dir/lookup", get(lookup))
        .route("/cluster/status", get(cluster_status))
        .route("/cluster/healthz", get(healthz))
        .route("/raft/stats", get(raft_stats))
        .route("/submit", axum::routing::post(submit))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Debug, Deserialize)]
struct AssignQuery {
    #[serde(default = "default_count")]
    count: u32,
    #[serde(default)]
    collection: String,
    #[serde(default)]
    replication: String,
    #[serde(default)]
    ttl: String,
    #[serde(default)]
    disk: String,
    #[serde(rename = "dataCenter", default)]
    data_center: String,
    #[serde(default)]
    rack: String,
}

fn default_count() -> u32 {
    1
}

#[derive(Debug, Serialize)]
struct AssignResponseBody {
    fid: String,
    url: String,
    #[serde(rename = "publicUrl")]
    public_url: String,
    count: u32,
}

async fn assign(State(state): State<Arc<MasterState>>, Query(q): Query<AssignQuery>) -> Result<impl IntoResponse, CommonError> {
    let req = rpc::AssignRequest {
        count: q.count,
        collection: q.collection,
        replication: q.replication,
        ttl_minutes: parse_ttl_minutes(&q.ttl),
        disk_type: if q.disk.is_empty() { "hdd".to_string() } else { q.disk },
        data_center: q.data_center,
        rack: q.rack,
    };
    let (vid, cookie, replicas) = crate::assign::assign_one(&state, &req).await?;
    let file_key = state.reserve_file_keys(vid, req.count.max(1) as u64);
    let fid = FileId::new(vid, NeedleKey(file_key), cookie).to_string();
    let primary = replicas.first().ok_or_else(|| CommonError::NoWritableVolume {
        collection: req.collection.clone(),
        replication: req.replication.clone(),
    })?;

    Ok(Json(AssignResponseBody {
        fid,
        url: primary.address.clone(),
        public_url: primary.public_url.clone(),
        count: req.count.max(1),
    }))
}

/// Accepts either `5` (minutes) or a suffixed form like `5m`/`2h`/`30d`,
/// matching the shorthand the CLI and dir/assign callers expect.
fn parse_ttl_minutes(raw: &str) -> u32 {
    if raw.is_empty() {
        return 0;
    }
    let (digits, unit) = raw.split_at(raw.len() - if raw.ends_with(|c: char| c.is_ascii_digit()) { 0 } else { 1 });
    let value: u32 = digits.parse().unwrap_or(0);
    match unit {
        "m" | "" => value,
        "h" => value * 60,
        "d" => value * 60 * 24,
        "w" => value * 60 * 24 * 7,
        _ => value,
    }
}

#[derive(Debug, Deserialize)]
struct LookupQuery {
    #[serde(rename = "volumeId", default)]
    volume_id: Option<u32>,
    #[serde(rename = "fileId", default)]
    file_id: Option<String>,
    #[serde(default)]
    read: Option<String>,
}

#[derive(Debug, Serialize)]
struct LookupLocation {
    url: String,
    #[serde(rename = "publicUrl")]
    public_url: String,
    #[serde(rename = "dataCenter")]
    data_center: String,
}

#[derive(Debug, Serialize)]
struct LookupResponseBody {
    #[serde(rename = "volumeOrFileId")]
    volume_or_file_id: String,
    locations: Vec<LookupLocation>,
    jwt: String,
}

async fn lookup(State(state): State<Arc<MasterState>>, Query(q): Query<LookupQuery>) -> Result<impl IntoResponse, CommonError> {
    let (vid, key) = if let Some(fid) = &q.file_id {
        let parsed: FileId = fid.parse().map_err(|e| CommonError::InvalidFileId(fid.clone(), e))?;
        (parsed.volume_id, Some(parsed))
    } else {
        let vid = q.volume_id.ok_or_else(|| CommonError::Internal("volumeId or fileId is required".to_string()))?;
        (common::VolumeId(vid), None)
    };

    let locations = state.topology.locate_volume_nodes(vid);
    if locations.is_empty() {
        return Err(CommonError::VolumeNotFound(vid.0));
    }

    let read_only = q.read.as_deref() == Some("yes");
    let fid_for_jwt = key.map(|f| f.to_string()).unwrap_or_else(|| vid.to_string());
    let jwt = if read_only {
        state.read_jwt.issue(&fid_for_jwt)?
    } else {
        state.write_jwt.issue(&fid_for_jwt)?
    };

    Ok(Json(LookupResponseBody {
        volume_or_file_id: vid.to_string(),
        locations: locations
            .into_iter()
            .map(|loc| LookupLocation {
                url: loc.address,
                public_url: loc.public_url,
                data_center: loc.data_center,
            })
            .collect(),
        jwt,
    }))
}

#[derive(Debug, Serialize)]
struct ClusterStatusBody {
    #[serde(rename = "isLeader")]
    is_leader: bool,
    leader: Option<String>,
    peers: Vec<String>,
    #[serde(rename = "raftId")]
    raft_id: u64,
}

async fn cluster_status(State(state): State<Arc<MasterState>>) -> Json<ClusterStatusBody> {
    Json(ClusterStatusBody {
        is_leader: state.is_leader(),
        leader: state.consensus.leader().map(|id| id.to_string()),
        peers: state.config.peers.clone(),
        raft_id: state.config.raft_id,
    })
}

async fn healthz() -> &'static str {
    "ok"
}

#[derive(Debug, Serialize)]
struct RaftStatsBody {
    #[serde(rename = "raftId")]
    raft_id: u64,
    leader: Option<u64>,
    voters: Vec<u64>,
    #[serde(rename = "maxVolumeId")]
    max_volume_id: u32,
}

async fn raft_stats(State(state): State<Arc<MasterState>>) -> Json<RaftStatsBody> {
    Json(RaftStatsBody {
        raft_id: state.consensus.id(),
        leader: state.consensus.leader(),
        voters: state.config.voter_ids(),
        max_volume_id: state.consensus.current_max_volume_id(),
    })
}

#[derive(Debug, Serialize)]
struct SubmitResponseBody {
    #[serde(rename = "fileId")]
    file_id: String,
    name: String,
    size: usize,
    #[serde(rename = "eTag")]
    etag: String,
}

/// Assigns a fresh file id then forwards the uploaded bytes straight to
/// the primary replica's volume-server HTTP endpoint, returning whatever
/// metadata it reports. A convenience wrapper around `dir/assign` +
/// `POST <volume-url>/<fid>` for callers that would rather make one
/// round trip than two.
async fn submit(State(state): State<Arc<MasterState>>, mut multipart: Multipart) -> Result<impl IntoResponse, CommonError> {
    let mut name = String::new();
    let mut bytes = Vec::new();
    let mut collection = String::new();
    let mut replication = String::new();

    while let Some(field) = multipart.next_field().await.map_err(|e| CommonError::Internal(e.to_string()))? {
        match field.name().unwrap_or("") {
            "collection" => collection = field.text().await.unwrap_or_default(),
            "replication" => replication = field.text().await.unwrap_or_default(),
            _ => {
                name = field.file_name().unwrap_or("file").to_string();
                bytes = field.bytes().await.map_err(|e| CommonError::Internal(e.to_string()))?.to_vec();
            }
        }
    }

    let req = rpc::AssignRequest {
        count: 1,
        collection,
        replication,
        ttl_minutes: 0,
        disk_type: "hdd".to_string(),
        data_center: String::new(),
        rack: String::new(),
    };
    let (vid, cookie, replicas) = crate::assign::assign_one(&state, &req).await?;
    let file_key = state.reserve_file_keys(vid, 1);
    let fid = FileId::new(vid, NeedleKey(file_key), cookie);
    let primary = replicas.first().ok_or_else(|| CommonError::NoWritableVolume {
        collection: req.collection.clone(),
        replication: req.replication.clone(),
    })?;

    let size = bytes.len();
    let client = reqwest::Client::new();
    let upload_url = format!("http://{}/{}", primary.address, fid);
    let resp = client
        .post(&upload_url)
        .body(bytes)
        .send()
        .await
        .map_err(|e| CommonError::Transport {
            peer: primary.address.clone(),
            message: e.to_string(),
        })?;
    if !resp.status().is_success() {
        return Err(CommonError::Transport {
            peer: primary.address.clone(),
            message: format!("volume server responded with {}", resp.status()),
        });
    }
    let uploaded: UploadedBody = resp.json().await.map_err(|e| CommonError::Transport {
        peer: primary.address.clone(),
        message: e.to_string(),
    })?;

    Ok(Json(SubmitResponseBody {
        file_id: fid.to_string(),
        name,
        size,
        etag: uploaded.e_tag,
    }))
}

#[derive(Debug, Deserialize)]
struct UploadedBody {
    #[serde(rename = "eTag")]
    e_tag: String,
}
