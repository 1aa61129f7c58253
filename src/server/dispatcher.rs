//! Agent-facing HTTP/2 endpoints.
//!
//! Every request carries `AgentUUID` and `AgentUUIDSig` headers; the
//! signature must verify against the CA key before any routing happens.
//! The token path segment binds ftp/proxy requests to stream handles.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

use super::Cc;
use crate::agents::registry::AGENT_GRACE;
use crate::agents::Agent;
use crate::tunnel::{process_agent_data, EnvelopeDecoder, TunnelState};

static CONN_SEQ: AtomicU64 = AtomicU64::new(1);

fn next_conn_id() -> u64 {
    CONN_SEQ.fetch_add(1, Ordering::Relaxed)
}

/// `/{root}/{api}/{token}` for agents
pub async fn api_dispatcher(
    State(cc): State<Cc>,
    Path((api, token)): Path<(String, String)>,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
    body: Body,
) -> Response {
    if api.is_empty() || token.is_empty() {
        tracing::debug!("invalid request, missing api/token");
        return StatusCode::BAD_REQUEST.into_response();
    }

    // agent identity check on every request
    let agent_uuid = headers
        .get("AgentUUID")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    let agent_sig = headers
        .get("AgentUUIDSig")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    if let Err(e) = cc.ca.verify_agent_uuid(agent_uuid, agent_sig) {
        tracing::warn!("invalid agent uuid {agent_uuid:?} ({e}), refusing request");
        return StatusCode::BAD_REQUEST.into_response();
    }
    tracing::debug!("request: api={api}, token={token}, agent_uuid={agent_uuid}");

    match api.as_str() {
        "checkin" => handle_checkin(cc, body).await,
        "msg" => handle_msg_tunnel(cc, body).await,
        "ftp" => handle_ftp_stream(cc, &token, body).await,
        "proxy" => handle_proxy_stream(cc, &token, body).await,
        "file" => handle_static_file(cc, &token, &params).await,
        _ => StatusCode::BAD_REQUEST.into_response(),
    }
}

/// Agent announces itself with a full metadata record.
async fn handle_checkin(cc: Cc, body: Body) -> Response {
    let bytes = match axum::body::to_bytes(body, 1024 * 1024).await {
        Ok(b) => b,
        Err(e) => return (StatusCode::BAD_REQUEST, e.to_string()).into_response(),
    };
    let agent: Agent = match serde_json::from_slice(&bytes) {
        Ok(a) => a,
        Err(e) => {
            tracing::debug!("malformed check-in: {e}");
            return StatusCode::BAD_REQUEST.into_response();
        }
    };
    if agent.tag.is_empty() {
        return StatusCode::BAD_REQUEST.into_response();
    }

    let tag = agent.tag.clone();
    let from = agent.from.clone();
    let (index, is_new) = cc.registry.register(agent);
    if is_new {
        if let Err(e) = cc.registry.load_labels(&cc.workspace.agents_json) {
            tracing::warn!("labels: {e}");
        }
        tracing::info!("checked in: {tag} from {from}, assigned index {index}");
    } else {
        tracing::info!("agent {tag} checked in again, metadata refreshed");
    }
    StatusCode::OK.into_response()
}

/// Bidirectional message tunnel on one HTTP/2 request. The first envelope's
/// tag binds the connection to an agent; inbound envelopes flow through the
/// correlation table, outbound frames come from the registry sender.
async fn handle_msg_tunnel(cc: Cc, body: Body) -> Response {
    let conn_id = next_conn_id();
    let (out_tx, out_rx) = mpsc::channel::<Bytes>(64);

    tokio::spawn(async move {
        let mut state = TunnelState::Handshake;
        let mut decoder = EnvelopeDecoder::new();
        let mut inbound = body.into_data_stream();
        let mut tag: Option<String> = None;
        let mut cancel = CancellationToken::new();

        'conn: loop {
            tokio::select! {
                chunk = inbound.next() => match chunk {
                    Some(Ok(data)) => {
                        decoder.push(&data);
                        loop {
                            match decoder.next() {
                                Ok(Some(msg)) => {
                                    if state == TunnelState::Handshake {
                                        match cc.registry.attach_conn(&msg.tag, out_tx.clone(), conn_id) {
                                            Ok(token) => {
                                                tracing::info!("message tunnel up for {} (conn {conn_id})", msg.tag);
                                                tag = Some(msg.tag.clone());
                                                cancel = token;
                                                state = TunnelState::Active;
                                            }
                                            Err(e) => {
                                                tracing::warn!("tunnel from unknown agent {}: {e}", msg.tag);
                                                break 'conn;
                                            }
                                        }
                                    }
                                    process_agent_data(&cc, &msg).await;
                                }
                                Ok(None) => break,
                                Err(e) => tracing::debug!("{e}"),
                            }
                        }
                    }
                    Some(Err(e)) => {
                        tracing::debug!("tunnel read (conn {conn_id}): {e}");
                        state = TunnelState::Draining;
                        break;
                    }
                    None => {
                        state = TunnelState::Draining;
                        break;
                    }
                },
                _ = cancel.cancelled() => {
                    state = TunnelState::Closed;
                    break;
                }
            }
        }

        // drain whatever is already buffered into the correlation table
        if state == TunnelState::Draining {
            loop {
                match decoder.next() {
                    Ok(Some(msg)) => process_agent_data(&cc, &msg).await,
                    Ok(None) => break,
                    Err(e) => tracing::debug!("{e}"),
                }
            }
        }
        if let Some(tag) = tag {
            cc.registry.detach_conn(&tag, conn_id);
            tracing::info!("message tunnel for {tag} closed (conn {conn_id})");

            // the record survives a grace period in case the agent comes back
            let cc = cc.clone();
            tokio::spawn(async move {
                tokio::time::sleep(AGENT_GRACE).await;
                if let Err(e) = cc.registry.save_labels(&cc.workspace.agents_json) {
                    tracing::warn!("labels: {e}");
                }
                if cc.registry.remove_if_disconnected(&tag) {
                    tracing::info!("agent {tag} removed after grace period");
                }
            });
        }
    });

    let frames = ReceiverStream::new(out_rx).map(Ok::<_, std::io::Error>);
    Response::builder()
        .status(StatusCode::OK)
        .header("content-type", "application/json")
        .body(Body::from_stream(frames))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

/// Inbound file-transfer stream: the agent streams file bytes tied to a GET
/// token; they are pumped into the transfer's writer.
async fn handle_ftp_stream(cc: Cc, token: &str, body: Body) -> Response {
    let Some(handle) = cc.streams.ftp_by_token(token) else {
        tracing::debug!("ftp stream with unknown token {token}");
        return StatusCode::BAD_REQUEST.into_response();
    };
    let Some(feed) = handle.take_inbound_sender().await else {
        tracing::warn!("ftp stream {token} already connected");
        return StatusCode::BAD_REQUEST.into_response();
    };

    let mut inbound = body.into_data_stream();
    loop {
        tokio::select! {
            chunk = inbound.next() => match chunk {
                Some(Ok(data)) => {
                    if feed.send(data).await.is_err() {
                        break;
                    }
                }
                Some(Err(e)) => {
                    tracing::debug!("ftp stream {token}: {e}");
                    break;
                }
                None => break,
            },
            _ = handle.cancel.cancelled() => break,
        }
    }
    // dropping the sender is the writer's EOF
    StatusCode::OK.into_response()
}

/// Proxy stream: bidirectional relay bound to a port-forward (or reverse
/// port-forward) token.
async fn handle_proxy_stream(cc: Cc, token: &str, body: Body) -> Response {
    let handle = match cc.streams.proxy_by_token(token) {
        Some(h) => h,
        None => match crate::net::portfwd::accept_reverse_stream(&cc, token).await {
            Some(h) => h,
            None => {
                tracing::debug!("proxy stream with unknown token {token}");
                return StatusCode::BAD_REQUEST.into_response();
            }
        },
    };

    let (Some(feed), Some(out_rx)) = (
        handle.take_inbound_sender().await,
        handle.take_outbound_receiver().await,
    ) else {
        tracing::warn!("proxy stream {token} already connected");
        return StatusCode::BAD_REQUEST.into_response();
    };

    // request body -> local socket
    let cancel = handle.cancel.clone();
    tokio::spawn(async move {
        let mut inbound = body.into_data_stream();
        loop {
            tokio::select! {
                chunk = inbound.next() => match chunk {
                    Some(Ok(data)) => {
                        if feed.send(data).await.is_err() {
                            break;
                        }
                    }
                    Some(Err(_)) | None => break,
                },
                _ = cancel.cancelled() => break,
            }
        }
    });

    // local socket -> response body
    let frames = ReceiverStream::new(out_rx).map(Ok::<_, std::io::Error>);
    Response::builder()
        .status(StatusCode::OK)
        .header("content-type", "application/octet-stream")
        .body(Body::from_stream(frames))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

/// Static file download from the WWW directory. The token must be a known
/// agent tag; only basenames are served.
async fn handle_static_file(cc: Cc, token: &str, params: &HashMap<String, String>) -> Response {
    if !cc.registry.contains(token) {
        return StatusCode::BAD_REQUEST.into_response();
    }
    let Some(requested) = params.get("file_to_download") else {
        return StatusCode::BAD_REQUEST.into_response();
    };
    // no path traversal: basename only
    let name = std::path::Path::new(requested)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    if name.is_empty() {
        return StatusCode::BAD_REQUEST.into_response();
    }

    let local_path = cc.workspace.www_dir.join(&name);
    tracing::debug!("file request for {name} -> {}", local_path.display());
    let file = match tokio::fs::File::open(&local_path).await {
        Ok(f) => f,
        Err(_) => return StatusCode::NOT_FOUND.into_response(),
    };
    let stream = tokio_util::io::ReaderStream::new(file);
    Response::builder()
        .status(StatusCode::OK)
        .header("content-type", "application/octet-stream")
        .body(Body::from_stream(stream))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}
