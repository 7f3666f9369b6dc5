use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{ConnectInfo, Path, Query, Request, State},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use serde::Deserialize;
use tracing::{info_span, warn};

use super::auth::{extract_git_identity, resolve_git_repository};
use super::backend::{CgiRequest, project_root, rewrite_path_info, run_http_backend};
use crate::error::TransportError;
use crate::git::GitService;
use crate::server::AppState;

#[derive(Deserialize)]
pub struct InfoRefsQuery {
    service: Option<String>,
}

#[derive(Deserialize)]
pub struct GitPathParams {
    owner: String,
    repo: String,
}

fn git_error_response(err: TransportError) -> Response {
    let mut response = (err.status_code(), err.client_message()).into_response();

    if err.requires_auth_header() {
        response.headers_mut().insert(
            header::WWW_AUTHENTICATE,
            HeaderValue::from_static("Basic realm=\"gatehouse\""),
        );
    }

    response
}

fn header_string(headers: &HeaderMap, name: impl header::AsHeaderName) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

async fn serve_git(
    state: Arc<AppState>,
    params: GitPathParams,
    service: GitService,
    advertise: bool,
    request: Request,
) -> Result<Response, TransportError> {
    let (parts, body) = request.into_parts();

    let identity = extract_git_identity(&parts.headers, &state)?;
    let repo_path = resolve_git_repository(
        &state,
        &params.owner,
        &params.repo,
        service,
        identity.as_ref(),
    )?;

    let project_root = project_root(&repo_path).ok_or(TransportError::Internal)?;
    let remote_addr = parts
        .extensions
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string());
    let remote_user = identity.as_ref().map(|i| i.username.clone());

    let span = info_span!(
        "git_http",
        operation = service.command_name(),
        repository = %format!("{}/{}", params.owner, params.repo),
        user = remote_user.as_deref().unwrap_or("anonymous"),
    );

    let cgi = CgiRequest {
        service,
        advertise,
        project_root,
        path_info: rewrite_path_info(parts.uri.path(), &params.owner, &params.repo),
        query_string: parts.uri.query().unwrap_or_default().to_string(),
        method: parts.method.to_string(),
        content_type: header_string(&parts.headers, header::CONTENT_TYPE).unwrap_or_default(),
        content_length: header_string(&parts.headers, header::CONTENT_LENGTH),
        content_encoding: header_string(&parts.headers, header::CONTENT_ENCODING),
        git_protocol: header_string(&parts.headers, "git-protocol"),
        remote_user,
        remote_addr,
    };

    run_http_backend(cgi, body, span.clone()).await.map_err(|e| {
        span.in_scope(|| warn!(error = %e, "git http-backend failed"));
        e
    })
}

pub async fn info_refs(
    State(state): State<Arc<AppState>>,
    Path(params): Path<GitPathParams>,
    Query(query): Query<InfoRefsQuery>,
    request: Request,
) -> Response {
    let service = match query.service.as_deref().and_then(GitService::from_name) {
        Some(s) => s,
        None => return (StatusCode::BAD_REQUEST, "Invalid service").into_response(),
    };

    serve_git(state, params, service, true, request)
        .await
        .unwrap_or_else(git_error_response)
}

pub async fn git_upload_pack(
    State(state): State<Arc<AppState>>,
    Path(params): Path<GitPathParams>,
    request: Request,
) -> Response {
    serve_git(state, params, GitService::UploadPack, false, request)
        .await
        .unwrap_or_else(git_error_response)
}

pub async fn git_receive_pack(
    State(state): State<Arc<AppState>>,
    Path(params): Path<GitPathParams>,
    request: Request,
) -> Response {
    serve_git(state, params, GitService::ReceivePack, false, request)
        .await
        .unwrap_or_else(git_error_response)
}
