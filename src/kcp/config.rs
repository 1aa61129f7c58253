//! KCP tunnel configuration.
//!
//! The JSON schema matches the agent side field for field, including knobs
//! the server does not currently act on, so one config file can drive both
//! peers.

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::{C2Error, Result};

/// Highest smux protocol version we speak
pub const MAX_SMUX_VERSION: u32 = 2;

/// Scavenger check period, seconds
pub const SCAVENGE_PERIOD: u64 = 5;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KcpTunConfig {
    /// Local listen address, e.g. `127.0.0.1:12948`
    #[serde(rename = "localaddr")]
    pub local_addr: String,
    /// Server listen address, `IP:port` or `IP:minport-maxport`
    pub listen: String,
    /// Forward target, `host:port` or a unix socket path (server side)
    pub target: String,
    /// KCP server address, single port or port range (client side)
    #[serde(rename = "remoteaddr")]
    pub remote_addr: String,
    /// Pre-shared secret
    pub key: String,
    /// Cipher name, see [`crate::kcp::crypt::CryptKind`]
    pub crypt: String,
    /// Performance profile: normal, fast, fast2, fast3, manual
    pub mode: String,
    /// Number of UDP connections to the server
    pub conn: usize,
    /// Seconds before a connection is replaced; 0 disables auto-expire
    #[serde(rename = "autoexpire")]
    pub auto_expire: u64,
    /// Seconds an expired connection may linger before scavenging
    #[serde(rename = "scavengettl")]
    pub scavenge_ttl: u64,
    pub mtu: usize,
    #[serde(rename = "sndwnd")]
    pub snd_wnd: u16,
    #[serde(rename = "rcvwnd")]
    pub rcv_wnd: u16,
    #[serde(rename = "datashard")]
    pub data_shard: usize,
    #[serde(rename = "parityshard")]
    pub parity_shard: usize,
    pub dscp: u8,
    #[serde(rename = "nocomp")]
    pub no_comp: bool,
    #[serde(rename = "acknodelay")]
    pub ack_nodelay: bool,
    #[serde(rename = "nodelay")]
    pub no_delay: i32,
    pub interval: i32,
    pub resend: i32,
    #[serde(rename = "nc")]
    pub no_congestion: i32,
    #[serde(rename = "sockbuf")]
    pub sock_buf: usize,
    #[serde(rename = "smuxver")]
    pub smux_ver: u32,
    #[serde(rename = "smuxbuf")]
    pub smux_buf: usize,
    #[serde(rename = "streambuf")]
    pub stream_buf: usize,
    #[serde(rename = "keepalive")]
    pub keep_alive: u64,
    pub quiet: bool,
    /// Emulate TCP over raw sockets instead of UDP (Linux only)
    pub tcp: bool,
    /// Quantum Permutation Pads on top of the chosen cipher
    pub qpp: bool,
    #[serde(rename = "qpp-count")]
    pub qpp_count: u16,
    /// Seconds to linger before tearing a finished stream down
    #[serde(rename = "closewait")]
    pub close_wait: u64,
}

impl Default for KcpTunConfig {
    fn default() -> Self {
        Self {
            local_addr: String::new(),
            listen: String::new(),
            target: String::new(),
            remote_addr: String::new(),
            key: "it's a secret".to_string(),
            crypt: "aes".to_string(),
            mode: "fast3".to_string(),
            conn: 1,
            auto_expire: 0,
            scavenge_ttl: 600,
            mtu: 1350,
            snd_wnd: 128,
            rcv_wnd: 512,
            data_shard: 10,
            parity_shard: 3,
            dscp: 0,
            no_comp: false,
            ack_nodelay: false,
            no_delay: 0,
            interval: 50,
            resend: 0,
            no_congestion: 0,
            sock_buf: 4 * 1024 * 1024,
            smux_ver: 1,
            smux_buf: 4 * 1024 * 1024,
            stream_buf: 2 * 1024 * 1024,
            keep_alive: 10,
            quiet: true,
            tcp: false,
            qpp: false,
            qpp_count: 67,
            close_wait: 0,
        }
    }
}

impl KcpTunConfig {
    /// Client/server defaults. Empty `target` configures a client dialing
    /// `remote_addr`; otherwise a server forwarding to `target`.
    pub fn new(remote_addr: &str, target: &str, port: &str, password: &str) -> Self {
        let mut config = Self {
            local_addr: format!("127.0.0.1:{port}"),
            listen: format!(":{port}"),
            key: password.to_string(),
            ..Default::default()
        };
        if target.is_empty() {
            config.remote_addr = remote_addr.to_string();
        } else {
            config.target = target.to_string();
        }
        config.apply_mode();
        config
    }

    pub fn from_json_file(path: &std::path::Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)?;
        let mut config: Self = serde_json::from_str(&data)?;
        config.apply_mode();
        Ok(config)
    }

    /// Resolve the performance profile into nodelay parameters. `manual`
    /// leaves whatever the config carries.
    pub fn apply_mode(&mut self) {
        let preset = match self.mode.as_str() {
            "normal" => Some((0, 40, 2, 1)),
            "fast" => Some((0, 30, 2, 1)),
            "fast2" => Some((1, 20, 2, 1)),
            "fast3" => Some((1, 10, 2, 1)),
            _ => None,
        };
        if let Some((nd, intv, rs, nc)) = preset {
            self.no_delay = nd;
            self.interval = intv;
            self.resend = rs;
            self.no_congestion = nc;
        }
    }

    /// Sanity warnings that do not prevent startup
    pub fn warnings(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        if self.qpp {
            warnings.extend(check_qpp_params(self.key.as_bytes(), self.qpp_count));
        }
        if self.auto_expire != 0 && self.scavenge_ttl > self.auto_expire {
            warnings.push(
                "scavengettl is bigger than autoexpire, connections may race hard to use bandwidth"
                    .to_string(),
            );
        }
        warnings
    }

    pub fn validate(&self) -> Result<()> {
        if self.smux_ver > MAX_SMUX_VERSION {
            return Err(C2Error::Config(format!(
                "unsupported smux version: {}",
                self.smux_ver
            )));
        }
        Ok(())
    }
}

/// Minimum seed bytes for an n-qubit permutation pad
pub fn qpp_minimum_seed_length(qubits: u32) -> usize {
    (1usize << qubits) / 8
}

/// QPP parameter checks; warned, never enforced.
pub fn check_qpp_params(key: &[u8], qpp_count: u16) -> Vec<String> {
    let mut warnings = Vec::new();
    let min_seed = qpp_minimum_seed_length(8);
    if key.len() < min_seed {
        warnings.push(format!(
            "QPP: 'key' has size of {} bytes, required {min_seed} bytes at least",
            key.len()
        ));
    }
    if gcd(qpp_count as u64, 8) != 1 {
        warnings.push(format!(
            "QPP: qpp-count {qpp_count} shares a factor with 8, choose an odd (ideally prime) count"
        ));
    }
    warnings
}

fn gcd(mut a: u64, mut b: u64) -> u64 {
    while b != 0 {
        (a, b) = (b, a % b);
    }
    a
}

/// `IP:port` or `IP:minport-maxport`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MultiPort {
    pub host: String,
    pub min_port: u16,
    pub max_port: u16,
}

impl MultiPort {
    pub fn parse(addr: &str) -> Result<Self> {
        let (host, ports) = addr
            .rsplit_once(':')
            .ok_or_else(|| C2Error::Config(format!("not a host:port address: {addr}")))?;
        let (min_port, max_port) = match ports.split_once('-') {
            Some((lo, hi)) => {
                let lo: u16 = lo
                    .parse()
                    .map_err(|_| C2Error::Config(format!("bad port in {addr}")))?;
                let hi: u16 = hi
                    .parse()
                    .map_err(|_| C2Error::Config(format!("bad port in {addr}")))?;
                if lo > hi {
                    return Err(C2Error::Config(format!("inverted port range: {addr}")));
                }
                (lo, hi)
            }
            None => {
                let p: u16 = ports
                    .parse()
                    .map_err(|_| C2Error::Config(format!("bad port in {addr}")))?;
                (p, p)
            }
        };
        Ok(Self {
            host: host.to_string(),
            min_port,
            max_port,
        })
    }

    /// Uniformly random port from the range, for per-dial hopping
    pub fn random_addr(&self) -> String {
        let port = rand::thread_rng().gen_range(self.min_port..=self.max_port);
        format!("{}:{}", self.host, port)
    }

    pub fn ports(&self) -> impl Iterator<Item = u16> {
        self.min_port..=self.max_port
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_presets() {
        for (mode, expected) in [
            ("normal", (0, 40, 2, 1)),
            ("fast", (0, 30, 2, 1)),
            ("fast2", (1, 20, 2, 1)),
            ("fast3", (1, 10, 2, 1)),
        ] {
            let mut config = KcpTunConfig::default();
            config.mode = mode.to_string();
            config.apply_mode();
            assert_eq!(
                (
                    config.no_delay,
                    config.interval,
                    config.resend,
                    config.no_congestion
                ),
                expected,
                "mode {mode}"
            );
        }

        // manual leaves the values alone
        let mut config = KcpTunConfig::default();
        config.mode = "manual".to_string();
        config.no_delay = 1;
        config.interval = 7;
        config.apply_mode();
        assert_eq!((config.no_delay, config.interval), (1, 7));
    }

    #[test]
    fn client_server_roles() {
        let client = KcpTunConfig::new("vps:29900", "", "12948", "pw");
        assert_eq!(client.remote_addr, "vps:29900");
        assert_eq!(client.local_addr, "127.0.0.1:12948");
        assert!(client.target.is_empty());
        // fast3 preset applied
        assert_eq!((client.no_delay, client.interval), (1, 10));

        let server = KcpTunConfig::new("", "127.0.0.1:8000", "29900", "pw");
        assert_eq!(server.target, "127.0.0.1:8000");
        assert_eq!(server.listen, ":29900");
    }

    #[test]
    fn json_schema_field_names() {
        let config = KcpTunConfig::default();
        let json = serde_json::to_value(&config).unwrap();
        for field in [
            "localaddr", "listen", "target", "remoteaddr", "key", "crypt", "mode", "conn",
            "autoexpire", "scavengettl", "mtu", "sndwnd", "rcvwnd", "datashard", "parityshard",
            "dscp", "nocomp", "acknodelay", "nodelay", "interval", "resend", "nc", "sockbuf",
            "smuxver", "smuxbuf", "streambuf", "keepalive", "quiet", "tcp", "qpp", "qpp-count",
            "closewait",
        ] {
            assert!(json.get(field).is_some(), "missing field {field}");
        }
        assert_eq!(json["datashard"], 10);
        assert_eq!(json["parityshard"], 3);
    }

    #[test]
    fn qpp_checks_warn_only() {
        // short seed and even pad count both warn
        let warnings = check_qpp_params(b"short", 64);
        assert_eq!(warnings.len(), 2);

        let ok = check_qpp_params(&[0u8; 32], 67);
        assert!(ok.is_empty());
    }

    #[test]
    fn multiport_parse() {
        let single = MultiPort::parse("10.0.0.1:29900").unwrap();
        assert_eq!(single.min_port, 29900);
        assert_eq!(single.max_port, 29900);
        assert_eq!(single.random_addr(), "10.0.0.1:29900");

        let range = MultiPort::parse("10.0.0.1:29900-29910").unwrap();
        assert_eq!(range.host, "10.0.0.1");
        assert_eq!(range.ports().count(), 11);
        for _ in 0..32 {
            let addr = range.random_addr();
            let port: u16 = addr.rsplit(':').next().unwrap().parse().unwrap();
            assert!((29900..=29910).contains(&port));
        }

        assert!(MultiPort::parse("no-port").is_err());
        assert!(MultiPort::parse("h:9-1").is_err());
    }

    #[test]
    fn smux_version_bound() {
        let mut config = KcpTunConfig::default();
        config.smux_ver = 3;
        assert!(config.validate().is_err());
        config.smux_ver = 2;
        assert!(config.validate().is_ok());
    }
}
