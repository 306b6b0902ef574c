// src/handlers/git_http.rs
// Smart HTTP, fetch only. Pushing goes through SSH.
use std::io::Read;
use std::path::PathBuf;
use std::sync::Arc;

use axum::{
    body::{Body, Bytes},
    extract::{Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use flate2::read::GzDecoder;
use serde::Deserialize;

use crate::error::Error;
use crate::protocol::{BufferedStream, Transport, UPLOAD_PACK};
use crate::utils::validation::normalize_repo_path;
use crate::AppState;

const ADVERTISEMENT_CONTENT_TYPE: &str = "application/x-git-upload-pack-advertisement";
const RESULT_CONTENT_TYPE: &str = "application/x-git-upload-pack-result";

#[derive(Debug, Deserialize)]
pub struct GitService {
    service: Option<String>,
}

/// Resolve `{repo}` to a repository the caller may read: missing, malformed
/// and (unless configured otherwise) private repositories are all 404.
fn readable_repo(state: &AppState, repo: &str) -> Result<PathBuf, StatusCode> {
    let name = repo.strip_suffix(".git").unwrap_or(repo);
    let name = normalize_repo_path(name).ok_or(StatusCode::NOT_FOUND)?;
    if !state.storage.exists(&name) {
        return Err(StatusCode::NOT_FOUND);
    }

    let repo = state.storage.open(&name).map_err(|e| match e {
        Error::NotFound(_) => StatusCode::NOT_FOUND,
        other => {
            tracing::error!(repo = %name, error = %other, "failed to open repository");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    })?;
    if repo.meta.private && !state.config.show_private {
        return Err(StatusCode::NOT_FOUND);
    }
    Ok(repo.path().to_path_buf())
}

fn git_protocol(headers: &HeaderMap) -> Option<String> {
    headers
        .get("git-protocol")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

/// Git compresses large negotiation bodies
fn decode_body(headers: &HeaderMap, body: Bytes) -> std::io::Result<Bytes> {
    match headers.get(header::CONTENT_ENCODING).and_then(|v| v.to_str().ok()) {
        Some("gzip") | Some("x-gzip") => {
            let mut out = Vec::new();
            GzDecoder::new(&body[..]).read_to_end(&mut out)?;
            Ok(Bytes::from(out))
        }
        _ => Ok(body),
    }
}

fn git_response(content_type: &str, body: Vec<u8>) -> Result<Response, StatusCode> {
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, content_type)
        .header(header::CACHE_CONTROL, "no-cache")
        .body(Body::from(body))
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)
}

/// Info/refs endpoint for git smart HTTP
pub async fn git_info_refs(
    State(state): State<Arc<AppState>>,
    Path(repo): Path<String>,
    Query(params): Query<GitService>,
    headers: HeaderMap,
) -> Result<Response, StatusCode> {
    if params.service.as_deref() != Some(UPLOAD_PACK) {
        return Ok((
            StatusCode::BAD_REQUEST,
            "pushing isn't supported via HTTP(S), use SSH\n",
        )
            .into_response());
    }

    let repo_path = readable_repo(&state, &repo)?;
    let protocol = state.backend.protocol(&repo_path);
    let mut stream = BufferedStream::new(Bytes::new(), git_protocol(&headers));
    protocol.advertise_refs(&mut stream).await.map_err(|e| {
        tracing::error!(repo = %repo, error = %e, "ref advertisement failed");
        StatusCode::INTERNAL_SERVER_ERROR
    })?;

    git_response(ADVERTISEMENT_CONTENT_TYPE, stream.into_output())
}

/// Handle git-upload-pack (for clone/fetch)
pub async fn git_upload_pack(
    State(state): State<Arc<AppState>>,
    Path(repo): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, StatusCode> {
    let repo_path = readable_repo(&state, &repo)?;
    let body = decode_body(&headers, body).map_err(|e| {
        tracing::debug!(repo = %repo, error = %e, "undecodable request body");
        StatusCode::BAD_REQUEST
    })?;

    let protocol = state.backend.protocol(&repo_path);
    let mut stream = BufferedStream::new(body, git_protocol(&headers));
    protocol
        .upload_pack(&mut stream, Transport::Http)
        .await
        .map_err(|e| {
            tracing::error!(repo = %repo, error = %e, "upload-pack failed");
            StatusCode::INTERNAL_SERVER_ERROR
        })?;

    git_response(RESULT_CONTENT_TYPE, stream.into_output())
}
