// SPDX-FileCopyrightText: 2025 The superseedr Contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! HTTP streaming of a single torrent's files.

use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};
use std::sync::Arc;

use axum::{
    body::{Body, Bytes},
    extract::{Path, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    middleware,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use futures::stream;
use serde::Serialize;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tracing::{event, Level};

use crate::errors::{HostError, SwarmError};
use crate::swarm::{InfoHash, SwarmTorrent};

/// Size of each read issued against the swarm while streaming a body.
pub const STREAM_CHUNK_SIZE: usize = 256 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteRange {
    Full,
    /// Inclusive start and end.
    Partial(u64, u64),
    Unsatisfiable,
}

/// Interprets a `Range` header against a resource of `length` bytes.
///
/// Only the first range of a multi-range request is honored. Headers that do
/// not parse are ignored and the whole resource is served.
pub fn parse_range(header: Option<&str>, length: u64) -> ByteRange {
    let Some(spec) = header.and_then(|h| h.trim().strip_prefix("bytes=")) else {
        return ByteRange::Full;
    };
    let first = spec.split(',').next().unwrap_or("").trim();
    let Some((start, end)) = first.split_once('-') else {
        return ByteRange::Full;
    };

    match (start.trim(), end.trim()) {
        ("", "") => ByteRange::Full,
        ("", suffix) => match suffix.parse::<u64>() {
            Ok(0) => ByteRange::Unsatisfiable,
            Ok(_) if length == 0 => ByteRange::Unsatisfiable,
            Ok(n) => ByteRange::Partial(length.saturating_sub(n), length - 1),
            Err(_) => ByteRange::Full,
        },
        (start, end) => {
            let Ok(start) = start.parse::<u64>() else {
                return ByteRange::Full;
            };
            let end = if end.is_empty() {
                None
            } else {
                match end.parse::<u64>() {
                    Ok(end) => Some(end),
                    Err(_) => return ByteRange::Full,
                }
            };
            if end.is_some_and(|end| end < start) {
                return ByteRange::Full;
            }
            if start >= length {
                return ByteRange::Unsatisfiable;
            }
            let last = length - 1;
            ByteRange::Partial(start, end.map_or(last, |end| end.min(last)))
        }
    }
}

pub fn content_type_for(name: &str) -> String {
    mime_guess::from_path(name)
        .first_or_octet_stream()
        .to_string()
}

/// Address other machines on the LAN can reach us on.
pub fn lan_address() -> IpAddr {
    let local = UdpSocket::bind("0.0.0.0:0").ok().and_then(|socket| {
        let _ = socket.connect("8.8.8.8:53");
        socket.local_addr().ok().map(|addr| addr.ip())
    });
    match local {
        Some(ip) if !ip.is_unspecified() => ip,
        _ => IpAddr::V4(Ipv4Addr::LOCALHOST),
    }
}

#[derive(Clone)]
struct ServerState {
    torrent: Arc<dyn SwarmTorrent>,
}

#[derive(Serialize)]
struct FileListing {
    index: usize,
    name: String,
    path: String,
    length: u64,
    url: String,
}

fn router(torrent: Arc<dyn SwarmTorrent>) -> Router {
    Router::new()
        .route("/", get(list_files).options(preflight))
        .route("/:index", get(serve_index).options(preflight))
        .route("/:index/*name", get(serve_named).options(preflight))
        .fallback(not_found)
        .layer(middleware::map_response(with_cors))
        .with_state(ServerState { torrent })
}

async fn with_cors(mut response: Response) -> Response {
    let headers = response.headers_mut();
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_ORIGIN,
        HeaderValue::from_static("*"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static("GET, HEAD, OPTIONS"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_HEADERS,
        HeaderValue::from_static("Content-Type, Range"),
    );
    headers.insert(
        header::ACCESS_CONTROL_EXPOSE_HEADERS,
        HeaderValue::from_static("Content-Length, Content-Range, Accept-Ranges"),
    );
    headers.insert(
        header::ACCESS_CONTROL_MAX_AGE,
        HeaderValue::from_static("86400"),
    );
    response
}

async fn preflight() -> StatusCode {
    StatusCode::NO_CONTENT
}

async fn not_found() -> StatusCode {
    StatusCode::NOT_FOUND
}

async fn list_files(State(state): State<ServerState>) -> Json<Vec<FileListing>> {
    let listing = state
        .torrent
        .files()
        .into_iter()
        .enumerate()
        .map(|(index, file)| FileListing {
            index,
            url: format!("/{}/{}", index, urlencoding::encode(&file.name)),
            name: file.name,
            path: file.path.to_string_lossy().into_owned(),
            length: file.length,
        })
        .collect();
    Json(listing)
}

async fn serve_index(
    State(state): State<ServerState>,
    Path(index): Path<String>,
    headers: HeaderMap,
) -> Response {
    serve_file(state, &index, &headers)
}

async fn serve_named(
    State(state): State<ServerState>,
    Path((index, _name)): Path<(String, String)>,
    headers: HeaderMap,
) -> Response {
    serve_file(state, &index, &headers)
}

fn serve_file(state: ServerState, index: &str, headers: &HeaderMap) -> Response {
    let files = state.torrent.files();
    let Some((index, file)) = index
        .parse::<usize>()
        .ok()
        .and_then(|i| files.get(i).map(|f| (i, f)))
    else {
        return StatusCode::NOT_FOUND.into_response();
    };

    let length = file.length;
    let range = headers
        .get(header::RANGE)
        .and_then(|value| value.to_str().ok());
    let (status, start, end) = match parse_range(range, length) {
        ByteRange::Full => (StatusCode::OK, 0, length),
        ByteRange::Partial(start, last) => (StatusCode::PARTIAL_CONTENT, start, last + 1),
        ByteRange::Unsatisfiable => {
            return Response::builder()
                .status(StatusCode::RANGE_NOT_SATISFIABLE)
                .header(header::CONTENT_RANGE, format!("bytes */{}", length))
                .body(Body::empty())
                .unwrap_or_else(|_| StatusCode::RANGE_NOT_SATISFIABLE.into_response());
        }
    };

    let mut builder = Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, content_type_for(&file.name))
        .header(header::CONTENT_LENGTH, end - start)
        .header(header::ACCEPT_RANGES, "bytes");
    if status == StatusCode::PARTIAL_CONTENT {
        builder = builder.header(
            header::CONTENT_RANGE,
            format!("bytes {}-{}/{}", start, end - 1, length),
        );
    }

    let body = Body::from_stream(file_stream(state.torrent, index, start, end));
    builder
        .body(body)
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

/// Lazily reads `start..end` of a file in [`STREAM_CHUNK_SIZE`] chunks.
fn file_stream(
    torrent: Arc<dyn SwarmTorrent>,
    index: usize,
    start: u64,
    end: u64,
) -> impl futures::Stream<Item = Result<Bytes, SwarmError>> + Send + 'static {
    stream::try_unfold(start, move |offset| {
        let torrent = torrent.clone();
        async move {
            if offset >= end {
                return Ok(None);
            }
            let want = (end - offset).min(STREAM_CHUNK_SIZE as u64) as usize;
            let chunk = torrent.read_file(index, offset, want).await.inspect_err(|e| {
                event!(Level::DEBUG, index, offset, "Stream read failed: {}", e);
            })?;
            if chunk.is_empty() {
                return Ok(None);
            }
            let next = offset + chunk.len() as u64;
            Ok(Some((chunk, next)))
        }
    })
}

/// A running streaming server. Dropping it without [`StreamServer::stop`]
/// leaves it running until the process exits.
pub struct StreamServer {
    info_hash: InfoHash,
    addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
}

impl StreamServer {
    pub async fn start(
        info_hash: InfoHash,
        torrent: Arc<dyn SwarmTorrent>,
        bind_address: IpAddr,
    ) -> Result<Self, HostError> {
        let listener = TcpListener::bind((bind_address, 0))
            .await
            .map_err(HostError::ServerBind)?;
        let addr = listener.local_addr().map_err(HostError::ServerBind)?;
        let (shutdown, shutdown_rx) = oneshot::channel::<()>();

        let app = router(torrent);
        tokio::spawn(async move {
            let serve = axum::serve(listener, app).with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            });
            if let Err(e) = serve.await {
                tracing::error!("Streaming server failed: {}", e);
            }
        });

        event!(Level::INFO, %info_hash, %addr, "Streaming server listening");
        Ok(Self {
            info_hash,
            addr,
            shutdown: Some(shutdown),
        })
    }

    pub fn info_hash(&self) -> InfoHash {
        self.info_hash
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn stop(mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        event!(Level::INFO, info_hash = %self.info_hash, "Streaming server stopped");
    }
}
