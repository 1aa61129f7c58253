//! Fallback transport for agents that cannot reach us over HTTP/2: smux
//! streams over (optionally TCP-emulated) KCP, with a selectable cipher
//! keyed via PBKDF2-SHA1 from the pre-shared secret.

pub mod config;
pub mod crypt;
pub mod session;

pub use config::{KcpTunConfig, MultiPort};
pub use session::{kcp_tun_server, KcpTunClient};
