//! Bridge between an HTTP request and `git http-backend` run as a CGI
//! process.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use axum::body::Body;
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode, header};
use axum::response::Response;
use futures::TryStreamExt;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::{ChildStdin, Command};
use tokio_util::io::{ReaderStream, StreamReader};
use tracing::{Instrument, debug, warn};

use crate::error::TransportError;
use crate::git::{GitService, repo_dir_name};

const MAX_HEADER_BYTES: usize = 64 * 1024;

/// Everything `git http-backend` learns about the request, as CGI
/// environment variables.
#[derive(Debug, Clone)]
pub struct CgiRequest {
    pub service: GitService,
    pub advertise: bool,
    pub project_root: PathBuf,
    pub path_info: String,
    pub query_string: String,
    pub method: String,
    pub content_type: String,
    pub content_length: Option<String>,
    pub content_encoding: Option<String>,
    pub git_protocol: Option<String>,
    pub remote_user: Option<String>,
    pub remote_addr: Option<String>,
}

impl CgiRequest {
    pub fn env(&self) -> Vec<(&'static str, String)> {
        let mut env = vec![
            ("GIT_PROJECT_ROOT", self.project_root.display().to_string()),
            ("GIT_HTTP_EXPORT_ALL", "true".to_string()),
            ("PATH_INFO", self.path_info.clone()),
            ("QUERY_STRING", self.query_string.clone()),
            ("REQUEST_METHOD", self.method.clone()),
            ("CONTENT_TYPE", self.content_type.clone()),
            (self.service.backend_enable_var(), "true".to_string()),
        ];

        if let Some(length) = &self.content_length {
            env.push(("CONTENT_LENGTH", length.clone()));
        }
        if let Some(encoding) = &self.content_encoding {
            env.push(("HTTP_CONTENT_ENCODING", encoding.clone()));
        }
        if let Some(protocol) = &self.git_protocol {
            env.push(("GIT_PROTOCOL", protocol.clone()));
        }
        if let Some(user) = &self.remote_user {
            env.push(("REMOTE_USER", user.clone()));
        }
        if let Some(addr) = &self.remote_addr {
            env.push(("REMOTE_ADDR", addr.clone()));
        }

        // http-backend only enables receive-pack for authenticated users by
        // default; the push has already been authorized at this point.
        if self.service.is_write() {
            env.push(("GIT_CONFIG_COUNT", "1".to_string()));
            env.push(("GIT_CONFIG_KEY_0", "http.receivepack".to_string()));
            env.push(("GIT_CONFIG_VALUE_0", "true".to_string()));
        }

        env
    }
}

/// `GIT_PROJECT_ROOT` for a repository at `{base}/{owner}/{repo}.git`.
pub fn project_root(repo_path: &Path) -> Option<PathBuf> {
    repo_path.parent()?.parent().map(Path::to_path_buf)
}

/// Rewrites the repository segment of a request path so it matches the
/// on-disk `.git` directory name. Only the segment directly following the
/// owner segment is touched.
pub fn rewrite_path_info(path: &str, owner: &str, repo: &str) -> String {
    let dir_name = repo_dir_name(repo);
    let mut segments: Vec<&str> = path.split('/').collect();

    let position = segments.windows(2).position(|pair| {
        pair[0] == owner && (pair[1] == repo || pair[1] == dir_name)
    });

    match position {
        Some(i) => {
            segments[i + 1] = &dir_name;
            segments.join("/")
        }
        None => path.to_string(),
    }
}

/// Reads CGI response headers up to the blank separator line. The reader is
/// left positioned at the first body byte.
pub async fn read_cgi_headers<R>(
    reader: &mut R,
) -> Result<Vec<(String, String)>, TransportError>
where
    R: AsyncBufRead + Unpin,
{
    let mut headers = Vec::new();
    let mut consumed = 0;
    let mut line = String::new();

    loop {
        line.clear();
        let n = reader
            .read_line(&mut line)
            .await
            .map_err(|e| TransportError::Relay(format!("reading backend headers: {e}")))?;

        if n == 0 {
            if headers.is_empty() {
                return Err(TransportError::Relay(
                    "backend exited before sending headers".to_string(),
                ));
            }
            break;
        }

        consumed += n;
        if consumed > MAX_HEADER_BYTES {
            return Err(TransportError::Relay(
                "backend header block too large".to_string(),
            ));
        }

        let trimmed = line.trim_end_matches(['\r', '\n']);
        if trimmed.is_empty() {
            break;
        }

        if let Some((key, value)) = trimmed.split_once(':') {
            headers.push((key.trim().to_string(), value.trim().to_string()));
        }
    }

    Ok(headers)
}

/// Turns CGI headers into an HTTP status and header map. A `Status` header
/// sets the status code; a missing `Content-Type` is filled in from the
/// service.
pub fn response_head(
    cgi_headers: Vec<(String, String)>,
    service: GitService,
    advertise: bool,
) -> (StatusCode, HeaderMap) {
    let mut status = StatusCode::OK;
    let mut headers = HeaderMap::new();

    for (key, value) in cgi_headers {
        if key.eq_ignore_ascii_case("status") {
            match value
                .split_whitespace()
                .next()
                .and_then(|code| code.parse::<u16>().ok())
                .and_then(|code| StatusCode::from_u16(code).ok())
            {
                Some(code) => status = code,
                None => warn!(value = %value, "ignoring malformed CGI status"),
            }
            continue;
        }

        match (
            HeaderName::from_bytes(key.as_bytes()),
            HeaderValue::from_str(&value),
        ) {
            (Ok(name), Ok(value)) => {
                headers.append(name, value);
            }
            _ => warn!(header = %key, "ignoring malformed CGI header"),
        }
    }

    if !headers.contains_key(header::CONTENT_TYPE) {
        let content_type = if advertise {
            service.advertisement_content_type()
        } else {
            service.content_type()
        };
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(content_type));
    }

    if !headers.contains_key(header::CACHE_CONTROL) {
        headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    }

    (status, headers)
}

async fn pump_body(body: Body, mut stdin: ChildStdin) -> std::io::Result<u64> {
    let stream = body.into_data_stream().map_err(std::io::Error::other);
    let mut reader = StreamReader::new(stream);
    let copied = tokio::io::copy(&mut reader, &mut stdin).await?;
    // Dropping stdin closes the pipe so the backend sees end of input.
    drop(stdin);
    Ok(copied)
}

/// Runs `git http-backend` for one request and streams its output back.
///
/// The request body is copied into the backend by its own task. Headers are
/// parsed before any body byte is forwarded; the rest of stdout is streamed
/// without buffering. A deferred task drains stderr, waits on the process and
/// logs the outcome.
pub async fn run_http_backend(
    cgi: CgiRequest,
    body: Body,
    span: tracing::Span,
) -> Result<Response, TransportError> {
    let mut child = Command::new("git")
        .arg("http-backend")
        .envs(cgi.env())
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(TransportError::Subprocess)?;

    let (Some(stdin), Some(stdout), Some(mut stderr)) =
        (child.stdin.take(), child.stdout.take(), child.stderr.take())
    else {
        return Err(TransportError::Subprocess(std::io::Error::other(
            "backend pipes were not created",
        )));
    };

    let stdin_task = tokio::spawn(pump_body(body, stdin));

    tokio::spawn(
        async move {
            let mut stderr_buf = Vec::new();
            let (stdin_result, stderr_result) =
                tokio::join!(stdin_task, stderr.read_to_end(&mut stderr_buf));

            match stdin_result {
                Ok(Ok(bytes)) => debug!(bytes, "request body delivered to backend"),
                Ok(Err(e)) => warn!(error = %e, "failed to copy request body to backend"),
                Err(e) => warn!(error = %e, "request body task failed"),
            }
            if let Err(e) = stderr_result {
                warn!(error = %e, "failed to read backend stderr");
            }

            match child.wait().await {
                Ok(status) if !status.success() => {
                    warn!(%status, "git http-backend exited with failure");
                }
                Ok(_) => {}
                Err(e) => warn!(error = %e, "failed to wait on git http-backend"),
            }

            if !stderr_buf.is_empty() {
                warn!(
                    stderr = %String::from_utf8_lossy(&stderr_buf).trim(),
                    "git http-backend stderr"
                );
            }
        }
        .instrument(span),
    );

    let mut reader = BufReader::new(stdout);
    let cgi_headers = read_cgi_headers(&mut reader).await?;
    let (status, headers) = response_head(cgi_headers, cgi.service, cgi.advertise);

    let mut response = Response::new(Body::from_stream(ReaderStream::new(reader)));
    *response.status_mut() = status;
    *response.headers_mut() = headers;

    Ok(response)
}
