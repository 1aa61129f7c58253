//! WireGuard key exchange with operators.
//!
//! The server generates its keypair on the first handshake and answers every
//! operator with its address, public key, and endpoint. Driving the actual
//! userspace device is left to the deployment; this module owns the keys and
//! the exchanged records.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use x25519_dalek::{PublicKey, StaticSecret};

/// Server-side tunnel address
pub const WG_SERVER_IP: &str = "172.16.254.1";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WgHandshake {
    #[serde(rename = "IPAddress")]
    pub ip_address: String,
    #[serde(rename = "PublicKey")]
    pub public_key: String,
    #[serde(rename = "Endpoint", default, skip_serializing_if = "String::is_empty")]
    pub endpoint: String,
}

pub struct WgServer {
    secret: StaticSecret,
    pub ip: String,
    pub listen_port: u16,
}

impl WgServer {
    pub fn generate(listen_port: u16) -> Self {
        Self {
            secret: StaticSecret::random_from_rng(OsRng),
            ip: WG_SERVER_IP.to_string(),
            listen_port,
        }
    }

    pub fn public_key(&self) -> String {
        STANDARD.encode(PublicKey::from(&self.secret).as_bytes())
    }

    /// Reply for an operator handshake
    pub fn handshake_reply(&self, cc_host: &str) -> WgHandshake {
        WgHandshake {
            ip_address: self.ip.clone(),
            public_key: self.public_key(),
            endpoint: format!("{cc_host}:{}", self.listen_port),
        }
    }

    /// `wg` config the deployment applies to bring the device up
    pub fn device_config(&self, peers: &[WgHandshake]) -> String {
        let mut config = format!(
            "[Interface]\n# Address = {}/24\nListenPort = {}\nPrivateKey = {}\n",
            self.ip,
            self.listen_port,
            STANDARD.encode(self.secret.to_bytes())
        );
        for peer in peers {
            config.push_str(&format!(
                "\n[Peer]\nPublicKey = {}\nAllowedIPs = {}/32\n",
                peer.public_key, peer.ip_address
            ));
        }
        config
    }
}
