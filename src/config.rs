use std::env;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::logging::LogFormat;
use crate::{C2Error, Result};

/// Name of the runtime config file inside the workspace.
pub const CONFIG_FILE: &str = "emp3r0r.json";

/// Label sidecar, keyed by agent tag.
pub const AGENTS_JSON: &str = "agents.json";

/// Scratch area shared with agents.
pub const TEMP_DIR: &str = "/tmp/emp3r0r/";

/// Outbound static files served to agents.
pub const WWW_DIR: &str = "/tmp/emp3r0r/www/";

/// Canonical helper bundle inside the WWW dir.
pub const UTILS_ARCHIVE: &str = "utils.tar.xz";

/// Runtime configuration, persisted as `emp3r0r.json` in the workspace.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Public name of the C2, must appear in the server certificate
    pub cc_host: String,

    /// HTTP/2 listener port
    pub cc_port: u16,

    /// URL root all agent-facing endpoints live under
    pub web_root: String,

    /// Per-build separator string, shared with agents. Used for envelope
    /// field separation and as associated data for the AES-GCM sealed box.
    pub magic_string: String,

    /// Pre-shared secret for the KCP transport
    pub password: String,

    /// KCP fallback listener, `IP:port` or `IP:minport-maxport`
    pub kcp_listen: String,

    /// Reserved port for on-agent sshd shells
    pub sshd_shell_port: u16,

    /// WireGuard listen port offered to operators
    pub wg_port: u16,

    pub log_level: String,
    pub log_format: LogFormat,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            cc_host: "localhost".to_string(),
            cc_port: 8000,
            web_root: "www_admin".to_string(),
            magic_string: "64781530-1475-4cf8-950c-dcdf4c619dbc".to_string(),
            password: "emp3r0r".to_string(),
            kcp_listen: "0.0.0.0:8888".to_string(),
            sshd_shell_port: 22222,
            wg_port: 51820,
            log_level: "info".to_string(),
            log_format: LogFormat::Compact,
        }
    }
}

impl RuntimeConfig {
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    pub fn save_to_file(&self, path: &Path) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }
}

/// Filesystem layout of a running server. All paths are absolute.
#[derive(Debug, Clone)]
pub struct Workspace {
    /// `$HOME/.emp3r0r`
    pub root: PathBuf,

    /// Where GetFile writes downloads, `<root>/file-get`
    pub file_get_dir: PathBuf,

    /// `<root>/emp3r0r.json`
    pub config_file: PathBuf,

    /// `<root>/agents.json`
    pub agents_json: PathBuf,

    pub ca_cert: PathBuf,
    pub ca_key: PathBuf,
    pub server_cert: PathBuf,
    pub server_key: PathBuf,

    /// Agent binary templates copied from the data dir
    pub stub_linux: PathBuf,
    pub stub_windows: PathBuf,

    /// Immutable install data, `$EMP3R0R_PREFIX/lib/emp3r0r`
    pub data_dir: PathBuf,

    /// Outbound static files
    pub www_dir: PathBuf,
}

impl Workspace {
    /// Resolve the workspace layout from `$HOME` and `$EMP3R0R_PREFIX`
    /// (default `/usr/local`). Does not touch the filesystem.
    pub fn resolve() -> Result<Self> {
        let home = dirs::home_dir()
            .ok_or_else(|| C2Error::Config("cannot determine home directory".to_string()))?;
        let prefix = env::var("EMP3R0R_PREFIX").unwrap_or_else(|_| "/usr/local".to_string());
        let root = home.join(".emp3r0r");
        Ok(Self::at(root, PathBuf::from(prefix).join("lib/emp3r0r")))
    }

    /// Build the layout under an explicit root. Used directly by tests.
    pub fn at(root: PathBuf, data_dir: PathBuf) -> Self {
        Self {
            file_get_dir: root.join("file-get"),
            config_file: root.join(CONFIG_FILE),
            agents_json: root.join(AGENTS_JSON),
            ca_cert: root.join("ca-cert.pem"),
            ca_key: root.join("ca-key.pem"),
            server_cert: root.join("emp3r0r-cert.pem"),
            server_key: root.join("emp3r0r-key.pem"),
            stub_linux: root.join("stub"),
            stub_windows: root.join("stub-win"),
            www_dir: PathBuf::from(WWW_DIR),
            data_dir,
            root,
        }
    }

    /// Create workspace directories and verify the install. Missing data dir
    /// or certificates are fatal: the server refuses to start.
    pub fn init(&self) -> Result<()> {
        if !self.data_dir.is_dir() {
            return Err(C2Error::Config(format!(
                "emp3r0r is not installed correctly: {} not found",
                self.data_dir.display()
            )));
        }
        std::fs::create_dir_all(&self.file_get_dir)?;
        std::fs::create_dir_all(&self.www_dir)?;

        for cert in [&self.ca_cert, &self.server_cert, &self.server_key] {
            if !cert.is_file() {
                return Err(C2Error::Config(format!(
                    "missing certificate: {}, generate it before starting the server",
                    cert.display()
                )));
            }
        }

        // stub binaries are refreshed from the build dir on every start
        let build_dir = self.data_dir.join("build");
        for (src, dst) in [
            (build_dir.join("stub"), &self.stub_linux),
            (build_dir.join("stub-win"), &self.stub_windows),
        ] {
            if src.is_file() {
                if let Err(e) = std::fs::copy(&src, dst) {
                    tracing::warn!("agent stub {}: {}", src.display(), e);
                }
            }
        }

        Ok(())
    }

    /// Load `emp3r0r.json`, writing defaults on first run.
    pub fn load_config(&self) -> Result<RuntimeConfig> {
        if self.config_file.is_file() {
            RuntimeConfig::from_file(&self.config_file)
        } else {
            let config = RuntimeConfig::default();
            config.save_to_file(&self.config_file)?;
            tracing::info!("wrote default config to {}", self.config_file.display());
            Ok(config)
        }
    }
}
