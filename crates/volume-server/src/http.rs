//! Volume server HTTP surface: the `GET|HEAD|POST|DELETE /<fid>` needle
//! endpoint per §6, plus the primary-side replication fan-out and rate
//! limiting a real upload/download goes through before touching disk.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use axum::body::Bytes;
use axum::extract::{FromRequest, Path, Query, Request, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use common::{CommonError, FileId};
use needle_store::Needle;
use serde::{Deserialize, Serialize};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::replication;
use crate::state::VolumeServerState;

const LAST_MODIFIED_FMT: &str = "%a, %d %b %Y %H:%M:%S GMT";

pub fn router(state: Arc<VolumeServerState>) -> Router {
    Router::new()
        .route("/*fid", get(get_needle).post(post_needle).delete(delete_needle))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Debug, Deserialize)]
struct FidQuery {
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(default)]
    jwt: String,
    #[serde(default)]
    ttl: String,
}

impl FidQuery {
    fn is_replicate(&self) -> bool {
        self.kind == "replicate"
    }
}

fn bearer_token(headers: &HeaderMap, query: &FidQuery) -> Option<String> {
    if let Some(value) = headers.get(axum::http::header::AUTHORIZATION) {
        if let Ok(s) = value.to_str() {
            if let Some(token) = s.strip_prefix("Bearer ") {
                return Some(token.to_string());
            }
        }
    }
    if !query.jwt.is_empty() {
        return Some(query.jwt.clone());
    }
    None
}

fn require_jwt(state: &VolumeServerState, headers: &HeaderMap, query: &FidQuery, fid: &str) -> Result<(), CommonError> {
    let token = bearer_token(headers, query).ok_or_else(|| CommonError::Internal("missing jwt".into()))?;
    state.jwt.verify(&token, fid)
}

fn parse_fid(raw: &str) -> Result<FileId, CommonError> {
    raw.parse().map_err(|e| CommonError::InvalidFileId(raw.to_string(), e))
}

fn format_last_modified(secs: u64) -> String {
    let dt = chrono::DateTime::<chrono::Utc>::from_timestamp(secs as i64, 0).unwrap_or_default();
    dt.format(LAST_MODIFIED_FMT).to_string()
}

fn parse_http_date(raw: &str) -> Option<u64> {
    chrono::NaiveDateTime::parse_from_str(raw, LAST_MODIFIED_FMT)
        .ok()
        .map(|naive| naive.and_utc().timestamp() as u64)
}

fn etag_for(payload: &[u8]) -> String {
    format!("\"{:08x}\"", crc32fast::hash(payload))
}

fn self_address(state: &VolumeServerState) -> String {
    state.config.public_url()
}

// ---- GET/HEAD ----

async fn get_needle(
    State(state): State<Arc<VolumeServerState>>,
    Path(raw_fid): Path<String>,
    Query(query): Query<FidQuery>,
    headers: HeaderMap,
) -> Result<Response, CommonError> {
    let fid = parse_fid(&raw_fid)?;
    if state.config.read_requires_jwt {
        require_jwt(&state, &headers, &query, &fid.to_string())?;
    }

    let volume = state.store.find_volume(fid.volume_id).ok_or(CommonError::VolumeNotFound(fid.volume_id.0))?;
    let read_deleted = query.ttl == "readDeleted";
    let result = volume.read(fid.key, read_deleted)?;
    let needle = result.needle;
    if needle.cookie != fid.cookie {
        return Err(CommonError::CookieMismatch(fid.key.0));
    }

    let _permit = state.download_limiter.acquire(needle.payload.len()).await?;

    let etag = etag_for(&needle.payload);
    let last_modified = needle.last_modified;

    if let Some(inm) = headers.get(axum::http::header::IF_NONE_MATCH) {
        if inm.to_str().map(|v| v == etag).unwrap_or(false) {
            return Ok(StatusCode::NOT_MODIFIED.into_response());
        }
    }
    if let Some(im) = headers.get(axum::http::header::IF_MATCH) {
        if im.to_str().map(|v| v != etag && v != "*").unwrap_or(true) {
            return Ok(StatusCode::PRECONDITION_FAILED.into_response());
        }
    }
    if let (Some(lm), Some(ims)) = (last_modified, headers.get(axum::http::header::IF_MODIFIED_SINCE)) {
        if let Some(since) = ims.to_str().ok().and_then(parse_http_date) {
            if lm <= since {
                return Ok(StatusCode::NOT_MODIFIED.into_response());
            }
        }
    }
    if let (Some(lm), Some(ius)) = (last_modified, headers.get(axum::http::header::IF_UNMODIFIED_SINCE)) {
        if let Some(since) = ius.to_str().ok().and_then(parse_http_date) {
            if lm > since {
                return Ok(StatusCode::PRECONDITION_FAILED.into_response());
            }
        }
    }

    let total_len = needle.payload.len();
    let range = headers.get(axum::http::header::RANGE).and_then(|v| v.to_str().ok()).and_then(|v| parse_range(v, total_len));

    let mut response_headers = HeaderMap::new();
    response_headers.insert(axum::http::header::ETAG, HeaderValue::from_str(&etag).unwrap());
    response_headers.insert(axum::http::header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));
    if let Some(mime) = &needle.mime {
        if let Ok(v) = HeaderValue::from_str(mime) {
            response_headers.insert(axum::http::header::CONTENT_TYPE, v);
        }
    }
    if let Some(lm) = last_modified {
        response_headers.insert(axum::http::header::LAST_MODIFIED, HeaderValue::from_str(&format_last_modified(lm)).unwrap());
    }

    let (status, body) = match range {
        Some((start, end)) if start <= end && end < total_len => {
            response_headers.insert(
                axum::http::header::CONTENT_RANGE,
                HeaderValue::from_str(&format!("bytes {start}-{end}/{total_len}")).unwrap(),
            );
            (StatusCode::PARTIAL_CONTENT, needle.payload[start..=end].to_vec())
        }
        Some(_) => {
            response_headers.insert(
                axum::http::header::CONTENT_RANGE,
                HeaderValue::from_str(&format!("bytes */{total_len}")).unwrap(),
            );
            return Ok((StatusCode::RANGE_NOT_SATISFIABLE, response_headers).into_response());
        }
        None => (StatusCode::OK, needle.payload),
    };

    response_headers.insert(axum::http::header::CONTENT_LENGTH, HeaderValue::from_str(&body.len().to_string()).unwrap());
    Ok((status, response_headers, body).into_response())
}

/// Parses a single `bytes=start-end` range, the only form this server
/// serves; a multi-range request falls back to a full body, matching the
/// "single range, no multipart/byteranges" scope this expansion settles on.
fn parse_range(raw: &str, total_len: usize) -> Option<(usize, usize)> {
    let spec = raw.strip_prefix("bytes=")?;
    let spec = spec.split(',').next()?;
    let (start, end) = spec.split_once('-')?;
    if total_len == 0 {
        return None;
    }
    if start.is_empty() {
        let suffix_len: usize = end.parse().ok()?;
        let suffix_len = suffix_len.min(total_len);
        return Some((total_len - suffix_len, total_len - 1));
    }
    let start: usize = start.parse().ok()?;
    let end = if end.is_empty() { total_len - 1 } else { end.parse().ok()? };
    Some((start, end.min(total_len - 1)))
}

// ---- POST ----

#[derive(Debug, Serialize)]
struct UploadResponse {
    name: String,
    size: usize,
    #[serde(rename = "eTag")]
    etag: String,
}

async fn post_needle(
    State(state): State<Arc<VolumeServerState>>,
    Path(raw_fid): Path<String>,
    Query(query): Query<FidQuery>,
    request: Request,
) -> Result<Response, CommonError> {
    let fid = parse_fid(&raw_fid)?;
    let replicate = query.is_replicate();
    if !replicate {
        require_jwt(&state, request.headers(), &query, &fid.to_string())?;
    }

    let content_type = request
        .headers()
        .get(axum::http::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();

    let (name, mime, payload) = if content_type.starts_with("multipart/form-data") {
        let mut multipart = axum::extract::Multipart::from_request(request, &state)
            .await
            .map_err(|e| CommonError::Internal(e.to_string()))?;
        let mut name = String::new();
        let mut mime = None;
        let mut payload = Vec::new();
        while let Some(field) = multipart.next_field().await.map_err(|e| CommonError::Internal(e.to_string()))? {
            name = field.file_name().unwrap_or("file").to_string();
            mime = field.content_type().map(|s| s.to_string());
            payload = field.bytes().await.map_err(|e| CommonError::Internal(e.to_string()))?.to_vec();
        }
        (name, mime, payload)
    } else {
        let mime = if content_type.is_empty() { None } else { Some(content_type.clone()) };
        let bytes = Bytes::from_request(request, &state).await.map_err(|e| CommonError::Internal(e.to_string()))?;
        (String::new(), mime, bytes.to_vec())
    };

    let _permit = state.upload_limiter.acquire(payload.len()).await?;

    let volume = state.store.find_volume(fid.volume_id).ok_or(CommonError::VolumeNotFound(fid.volume_id.0))?;
    let now_secs = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs();
    let needle = Needle {
        name: if name.is_empty() { None } else { Some(name.clone()) },
        mime: mime.clone(),
        last_modified: Some(now_secs),
        ..Needle::new(fid.key, fid.cookie, payload.clone())
    };

    let write_result = if replicate {
        let now_ns = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_nanos() as u64;
        volume.apply_replicated(needle, now_ns)?
    } else {
        volume.write(needle)?
    };

    if !replicate {
        let replicas = state.master_client.lookup_file_id_with_fallback(fid).await.unwrap_or_default();
        let failed = replication::fan_out_write(&state.http_client, &replicas, &self_address(&state), &raw_fid, mime.as_deref(), &payload).await;
        if !failed.is_empty() {
            for target in failed.iter().cloned() {
                let client = state.http_client.clone();
                let volume = volume.clone();
                tokio::spawn(async move {
                    let _ = replication::catch_up_replica(&client, &volume, &target).await;
                });
            }
            return Err(CommonError::ReplicationFailed {
                target: failed.join(","),
                source: Box::new(CommonError::Transport {
                    peer: self_address(&state),
                    message: "replica did not acknowledge fan-out write".into(),
                }),
            });
        }
    }

    let etag = etag_for(&payload);
    let body = UploadResponse {
        name,
        size: write_result.size as usize,
        etag,
    };
    Ok((StatusCode::CREATED, Json(body)).into_response())
}

// ---- DELETE ----

#[derive(Debug, Serialize)]
struct DeleteResponse {
    size: u64,
}

async fn delete_needle(
    State(state): State<Arc<VolumeServerState>>,
    Path(raw_fid): Path<String>,
    Query(query): Query<FidQuery>,
    headers: HeaderMap,
) -> Result<Response, CommonError> {
    let fid = parse_fid(&raw_fid)?;
    let replicate = query.is_replicate();
    if !replicate {
        require_jwt(&state, &headers, &query, &fid.to_string())?;
    }

    let volume = state.store.find_volume(fid.volume_id).ok_or(CommonError::VolumeNotFound(fid.volume_id.0))?;

    let freed = if replicate {
        let now_ns = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_nanos() as u64;
        volume
            .apply_replicated(Needle::tombstone(fid.key, fid.cookie), now_ns)
            .map(|r| r.size as u64)?
    } else {
        volume.delete(fid.key, fid.cookie)?
    };

    if !replicate {
        let replicas = state.master_client.lookup_file_id_with_fallback(fid).await.unwrap_or_default();
        let failed = replication::fan_out_delete(&state.http_client, &replicas, &self_address(&state), &raw_fid).await;
        if !failed.is_empty() {
            for target in failed.iter().cloned() {
                let client = state.http_client.clone();
                let volume = volume.clone();
                tokio::spawn(async move {
                    let _ = replication::catch_up_replica(&client, &volume, &target).await;
                });
            }
            return Err(CommonError::ReplicationFailed {
                target: failed.join(","),
                source: Box::new(CommonError::Transport {
                    peer: self_address(&state),
                    message: "replica did not acknowledge fan-out write".into(),
                }),
            });
        }
    }

    Ok((StatusCode::ACCEPTED, Json(DeleteResponse { size: freed })).into_response())
}
