//! Selectable stream crypto for the KCP transport.
//!
//! The pre-shared key is stretched with PBKDF2-SHA1 (4096 rounds, 32 bytes,
//! salted with the build magic string); the chosen cipher consumes a prefix
//! of it. Ciphers run as keystreams over each KCP session, below the smux
//! framing, with per-direction IVs both peers derive independently. The
//! optional QPP layer substitutes bytes through seed-derived permutation
//! pads underneath the cipher.

use std::sync::Arc;

use cipher::{KeyIvInit, StreamCipher};
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha20Rng;
use sha2::{Digest, Sha256};

use crate::crypto::pbkdf2_sha1;

type Aes128Ctr = ctr::Ctr128BE<aes::Aes128>;
type Aes192Ctr = ctr::Ctr128BE<aes::Aes192>;
type Aes256Ctr = ctr::Ctr128BE<aes::Aes256>;
type Sm4Ctr = ctr::Ctr128BE<sm4::Sm4>;
type TwofishCtr = ctr::Ctr128BE<twofish::Twofish>;
type BlowfishCtr = ctr::Ctr64BE<blowfish::Blowfish>;
type Cast5Ctr = ctr::Ctr64BE<cast5::Cast5>;
type TdesCtr = ctr::Ctr64BE<des::TdesEde3>;

/// PBKDF2 parameters shared with the agent
pub const KEY_ROUNDS: u32 = 4096;
pub const KEY_LEN: usize = 32;

pub fn derive_key(password: &str, salt: &str) -> Vec<u8> {
    pbkdf2_sha1(password.as_bytes(), salt.as_bytes(), KEY_ROUNDS, KEY_LEN)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CryptKind {
    Null,
    Plain,
    Xor,
    Sm4,
    Aes128,
    Aes192,
    Aes256,
    Blowfish,
    Twofish,
    Cast5,
    TripleDes,
    Salsa20,
}

impl CryptKind {
    /// Resolve a cipher name. Unknown names, and the TEA family which has no
    /// maintained implementation here, fall back to the `aes` default; the
    /// returned warning says so.
    pub fn parse(name: &str) -> (Self, Option<String>) {
        match name {
            "null" => (Self::Null, None),
            "none" => (Self::Plain, None),
            "xor" => (Self::Xor, None),
            "sm4" => (Self::Sm4, None),
            "aes-128" => (Self::Aes128, None),
            "aes-192" => (Self::Aes192, None),
            "aes" => (Self::Aes256, None),
            "blowfish" => (Self::Blowfish, None),
            "twofish" => (Self::Twofish, None),
            "cast5" => (Self::Cast5, None),
            "3des" => (Self::TripleDes, None),
            "salsa20" => (Self::Salsa20, None),
            "tea" | "xtea" => (
                Self::Aes256,
                Some(format!("cipher {name:?} is not supported, using aes")),
            ),
            other => (
                Self::Aes256,
                Some(format!("unknown cipher {other:?}, using aes")),
            ),
        }
    }

    /// Key bytes this cipher consumes. Blowfish wants its full 56-byte
    /// schedule, which is stretched from the derived key.
    pub fn key_len(self) -> usize {
        match self {
            Self::Null | Self::Plain => 0,
            Self::Sm4 | Self::Aes128 | Self::Cast5 => 16,
            Self::Aes192 | Self::TripleDes => 24,
            Self::Xor | Self::Aes256 | Self::Twofish | Self::Salsa20 => 32,
            Self::Blowfish => 56,
        }
    }
}

/// In-place byte transform applied to one direction of one stream
pub trait Keystream: Send {
    fn apply(&mut self, buf: &mut [u8]);
}

struct Cs<C: StreamCipher + Send>(C);

impl<C: StreamCipher + Send> Keystream for Cs<C> {
    fn apply(&mut self, buf: &mut [u8]) {
        self.0.apply_keystream(buf);
    }
}

struct XorKeystream {
    key: Vec<u8>,
    pos: usize,
}

impl Keystream for XorKeystream {
    fn apply(&mut self, buf: &mut [u8]) {
        for b in buf.iter_mut() {
            *b ^= self.key[self.pos];
            self.pos = (self.pos + 1) % self.key.len();
        }
    }
}

/// Stacked keystreams, applied in order. Encrypt and decrypt sides stack
/// their layers in mirrored order.
pub struct Layered {
    layers: Vec<Box<dyn Keystream>>,
}

impl Layered {
    pub fn noop() -> Self {
        Self { layers: Vec::new() }
    }

    pub fn is_noop(&self) -> bool {
        self.layers.is_empty()
    }
}

impl Keystream for Layered {
    fn apply(&mut self, buf: &mut [u8]) {
        for layer in &mut self.layers {
            layer.apply(buf);
        }
    }
}

/// Per-stream, per-direction IV: both peers derive the same bytes from the
/// shared key, the smux stream id, and the direction label.
fn derive_iv(key: &[u8], stream_id: u32, direction: &str, len: usize) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(key);
    hasher.update(direction.as_bytes());
    hasher.update(stream_id.to_le_bytes());
    hasher.finalize()[..len].to_vec()
}

/// Expand the derived key to `len` bytes when a cipher wants more than we
/// derive (counter-mode SHA-256 expansion).
fn stretch_key(key: &[u8], len: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(len);
    let mut counter = 0u32;
    while out.len() < len {
        let mut hasher = Sha256::new();
        hasher.update(key);
        hasher.update(counter.to_le_bytes());
        out.extend_from_slice(&hasher.finalize());
        counter += 1;
    }
    out.truncate(len);
    out
}

fn make_cipher(kind: CryptKind, key: &[u8], stream_id: u32, direction: &str) -> Option<Box<dyn Keystream>> {
    let needed = kind.key_len();
    let k: Vec<u8> = if needed <= key.len() {
        key[..needed].to_vec()
    } else {
        stretch_key(key, needed)
    };
    let k = k.as_slice();
    let iv16 = derive_iv(key, stream_id, direction, 16);
    let iv8 = derive_iv(key, stream_id, direction, 8);
    let boxed: Box<dyn Keystream> = match kind {
        CryptKind::Null | CryptKind::Plain => return None,
        CryptKind::Xor => Box::new(XorKeystream {
            key: k.to_vec(),
            pos: 0,
        }),
        CryptKind::Aes128 => Box::new(Cs(Aes128Ctr::new_from_slices(k, &iv16).ok()?)),
        CryptKind::Aes192 => Box::new(Cs(Aes192Ctr::new_from_slices(k, &iv16).ok()?)),
        CryptKind::Aes256 => Box::new(Cs(Aes256Ctr::new_from_slices(k, &iv16).ok()?)),
        CryptKind::Sm4 => Box::new(Cs(Sm4Ctr::new_from_slices(k, &iv16).ok()?)),
        CryptKind::Twofish => Box::new(Cs(TwofishCtr::new_from_slices(k, &iv16).ok()?)),
        CryptKind::Blowfish => Box::new(Cs(BlowfishCtr::new_from_slices(k, &iv8).ok()?)),
        CryptKind::Cast5 => Box::new(Cs(Cast5Ctr::new_from_slices(k, &iv8).ok()?)),
        CryptKind::TripleDes => Box::new(Cs(TdesCtr::new_from_slices(k, &iv8).ok()?)),
        CryptKind::Salsa20 => Box::new(Cs(salsa20::Salsa20::new_from_slices(k, &iv8).ok()?)),
    };
    Some(boxed)
}

/// Seed-derived permutation pads. Both peers build identical pads and walk
/// them with identical selector streams, so substitution is symmetric.
pub struct QppPads {
    pads: Vec<[u8; 256]>,
    inverse: Vec<[u8; 256]>,
    seed: Vec<u8>,
}

impl QppPads {
    pub fn new(seed: &[u8], count: u16) -> Arc<Self> {
        let count = count.max(1);
        let mut pads = Vec::with_capacity(count as usize);
        let mut inverse = Vec::with_capacity(count as usize);
        for i in 0..count {
            let mut pad: [u8; 256] = std::array::from_fn(|b| b as u8);
            let mut rng_seed = [0u8; 32];
            let mut hasher = Sha256::new();
            hasher.update(seed);
            hasher.update(i.to_le_bytes());
            rng_seed.copy_from_slice(&hasher.finalize());
            pad.shuffle(&mut ChaCha20Rng::from_seed(rng_seed));

            let mut inv = [0u8; 256];
            for (plain, &subst) in pad.iter().enumerate() {
                inv[subst as usize] = plain as u8;
            }
            pads.push(pad);
            inverse.push(inv);
        }
        Arc::new(Self {
            pads,
            inverse,
            seed: seed.to_vec(),
        })
    }

    fn selector(&self, stream_id: u32, direction: &str) -> ChaCha20Rng {
        let mut hasher = Sha256::new();
        hasher.update(&self.seed);
        hasher.update(b"selector");
        hasher.update(direction.as_bytes());
        hasher.update(stream_id.to_le_bytes());
        let mut rng_seed = [0u8; 32];
        rng_seed.copy_from_slice(&hasher.finalize());
        ChaCha20Rng::from_seed(rng_seed)
    }

    pub fn stream(self: &Arc<Self>, stream_id: u32, direction: &str, decrypt: bool) -> QppStream {
        QppStream {
            selector: self.selector(stream_id, direction),
            pads: self.clone(),
            decrypt,
        }
    }
}

pub struct QppStream {
    pads: Arc<QppPads>,
    selector: ChaCha20Rng,
    decrypt: bool,
}

impl Keystream for QppStream {
    fn apply(&mut self, buf: &mut [u8]) {
        let count = self.pads.pads.len();
        for b in buf.iter_mut() {
            let idx = self.selector.gen_range(0..count);
            *b = if self.decrypt {
                self.pads.inverse[idx][*b as usize]
            } else {
                self.pads.pads[idx][*b as usize]
            };
        }
    }
}

/// Build the transmit/receive transforms for one smux stream.
///
/// Encryption substitutes through QPP first, then XORs the cipher keystream;
/// decryption mirrors the order. Direction labels keep the two half-streams
/// on distinct keystreams.
pub fn stream_ciphers(
    kind: CryptKind,
    key: &[u8],
    qpp: Option<&Arc<QppPads>>,
    stream_id: u32,
    is_server: bool,
) -> (Layered, Layered) {
    let (tx_dir, rx_dir) = if is_server { ("down", "up") } else { ("up", "down") };

    let mut tx_layers: Vec<Box<dyn Keystream>> = Vec::new();
    let mut rx_layers: Vec<Box<dyn Keystream>> = Vec::new();

    if let Some(pads) = qpp {
        tx_layers.push(Box::new(pads.stream(stream_id, tx_dir, false)));
    }
    if let Some(cipher) = make_cipher(kind, key, stream_id, tx_dir) {
        tx_layers.push(cipher);
    }

    if let Some(cipher) = make_cipher(kind, key, stream_id, rx_dir) {
        rx_layers.push(cipher);
    }
    if let Some(pads) = qpp {
        rx_layers.push(Box::new(pads.stream(stream_id, rx_dir, true)));
    }

    (Layered { layers: tx_layers }, Layered { layers: rx_layers })
}

/// Transparent encryption over an async byte stream: reads are decrypted
/// with the rx transform, writes encrypted with tx. Sits between the KCP
/// connection and the smux layer.
pub struct CipherStream<S> {
    inner: S,
    tx: Layered,
    rx: Layered,
    pending: Vec<u8>,
    pending_written: usize,
    /// Caller bytes already consumed into `pending` but not yet reported
    pending_claim: usize,
}

impl<S> CipherStream<S> {
    const CHUNK: usize = 16 * 1024;

    pub fn new(inner: S, tx: Layered, rx: Layered) -> Self {
        Self {
            inner,
            tx,
            rx,
            pending: Vec::new(),
            pending_written: 0,
            pending_claim: 0,
        }
    }
}

impl<S: tokio::io::AsyncRead + Unpin> tokio::io::AsyncRead for CipherStream<S> {
    fn poll_read(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &mut tokio::io::ReadBuf<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        let before = buf.filled().len();
        let me = &mut *self;
        match std::pin::Pin::new(&mut me.inner).poll_read(cx, buf) {
            std::task::Poll::Ready(Ok(())) => {
                let filled = buf.filled_mut();
                me.rx.apply(&mut filled[before..]);
                std::task::Poll::Ready(Ok(()))
            }
            other => other,
        }
    }
}

impl<S: tokio::io::AsyncWrite + Unpin> tokio::io::AsyncWrite for CipherStream<S> {
    fn poll_write(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &[u8],
    ) -> std::task::Poll<std::io::Result<usize>> {
        let me = &mut *self;
        loop {
            // flush whatever is already encrypted
            while me.pending_written < me.pending.len() {
                match std::pin::Pin::new(&mut me.inner)
                    .poll_write(cx, &me.pending[me.pending_written..])
                {
                    std::task::Poll::Ready(Ok(n)) => me.pending_written += n,
                    std::task::Poll::Ready(Err(e)) => return std::task::Poll::Ready(Err(e)),
                    std::task::Poll::Pending => return std::task::Poll::Pending,
                }
            }
            if me.pending_claim > 0 {
                let claimed = me.pending_claim;
                me.pending.clear();
                me.pending_written = 0;
                me.pending_claim = 0;
                return std::task::Poll::Ready(Ok(claimed));
            }
            if buf.is_empty() {
                return std::task::Poll::Ready(Ok(0));
            }
            let take = buf.len().min(Self::CHUNK);
            me.pending.clear();
            me.pending.extend_from_slice(&buf[..take]);
            me.tx.apply(&mut me.pending);
            me.pending_written = 0;
            me.pending_claim = take;
        }
    }

    fn poll_flush(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        let me = &mut *self;
        while me.pending_written < me.pending.len() {
            match std::pin::Pin::new(&mut me.inner).poll_write(cx, &me.pending[me.pending_written..])
            {
                std::task::Poll::Ready(Ok(n)) => me.pending_written += n,
                std::task::Poll::Ready(Err(e)) => return std::task::Poll::Ready(Err(e)),
                std::task::Poll::Pending => return std::task::Poll::Pending,
            }
        }
        std::pin::Pin::new(&mut me.inner).poll_flush(cx)
    }

    fn poll_shutdown(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        match self.as_mut().poll_flush(cx) {
            std::task::Poll::Ready(Ok(())) => {}
            other => return other,
        }
        std::pin::Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL_NAMES: &[&str] = &[
        "null", "none", "xor", "sm4", "tea", "xtea", "aes-128", "aes-192", "aes", "blowfish",
        "twofish", "cast5", "3des", "salsa20",
    ];

    #[test]
    fn every_cipher_name_parses() {
        for name in ALL_NAMES {
            let (kind, warning) = CryptKind::parse(name);
            if matches!(*name, "tea" | "xtea") {
                assert_eq!(kind, CryptKind::Aes256);
                assert!(warning.is_some());
            } else {
                assert!(warning.is_none(), "{name} should parse cleanly");
            }
        }
        let (kind, warning) = CryptKind::parse("rot13");
        assert_eq!(kind, CryptKind::Aes256);
        assert!(warning.is_some());
    }

    #[test]
    fn key_lengths_match_cipher_families() {
        assert_eq!(CryptKind::Aes128.key_len(), 16);
        assert_eq!(CryptKind::Aes192.key_len(), 24);
        assert_eq!(CryptKind::Aes256.key_len(), 32);
        assert_eq!(CryptKind::Cast5.key_len(), 16);
        assert_eq!(CryptKind::TripleDes.key_len(), 24);
        assert_eq!(CryptKind::Sm4.key_len(), 16);
    }

    #[test]
    fn derive_key_is_deterministic() {
        let a = derive_key("password", "magic");
        let b = derive_key("password", "magic");
        assert_eq!(a, b);
        assert_eq!(a.len(), KEY_LEN);
        assert_ne!(a, derive_key("password", "other-magic"));
    }

    #[test]
    fn keystreams_are_symmetric() {
        let key = derive_key("pw", "salt");
        for name in ALL_NAMES {
            let (kind, _) = CryptKind::parse(name);
            let (mut server_tx, _) = stream_ciphers(kind, &key, None, 3, true);
            let (_, mut client_rx) = stream_ciphers(kind, &key, None, 3, false);

            let plaintext = b"the quick brown fox".to_vec();
            let mut wire = plaintext.clone();
            server_tx.apply(&mut wire);
            if !matches!(kind, CryptKind::Null | CryptKind::Plain) {
                assert_ne!(wire, plaintext, "{name} must change the bytes");
            }
            client_rx.apply(&mut wire);
            assert_eq!(wire, plaintext, "{name} roundtrip");
        }
    }

    #[test]
    fn directions_use_distinct_keystreams() {
        let key = derive_key("pw", "salt");
        let (mut tx, mut rx) = stream_ciphers(CryptKind::Aes256, &key, None, 1, true);
        let mut a = vec![0u8; 32];
        let mut b = vec![0u8; 32];
        tx.apply(&mut a);
        rx.apply(&mut b);
        assert_ne!(a, b);
    }

    #[test]
    fn qpp_roundtrip_and_layering() {
        let key = derive_key("a-seed-long-enough-for-qpp-pads!", "salt");
        let pads = QppPads::new(&key, 67);

        let (mut server_tx, _) =
            stream_ciphers(CryptKind::Salsa20, &key, Some(&pads), 9, true);
        let (_, mut client_rx) =
            stream_ciphers(CryptKind::Salsa20, &key, Some(&pads), 9, false);

        let plaintext: Vec<u8> = (0..=255).collect();
        let mut wire = plaintext.clone();
        server_tx.apply(&mut wire);
        assert_ne!(wire, plaintext);
        client_rx.apply(&mut wire);
        assert_eq!(wire, plaintext);
    }

    #[tokio::test]
    async fn cipher_stream_roundtrip() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let key = derive_key("pw", "salt");
        let (client_io, server_io) = tokio::io::duplex(64 * 1024);

        let (ctx, crx) = stream_ciphers(CryptKind::Aes256, &key, None, 0, false);
        let (stx, srx) = stream_ciphers(CryptKind::Aes256, &key, None, 0, true);
        let mut client = CipherStream::new(client_io, ctx, crx);
        let mut server = CipherStream::new(server_io, stx, srx);

        let payload: Vec<u8> = (0..4096u32).map(|i| (i % 251) as u8).collect();
        client.write_all(&payload).await.unwrap();
        client.flush().await.unwrap();

        let mut received = vec![0u8; payload.len()];
        server.read_exact(&mut received).await.unwrap();
        assert_eq!(received, payload);

        // and the other direction
        server.write_all(b"reply").await.unwrap();
        server.flush().await.unwrap();
        let mut reply = [0u8; 5];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(&reply, b"reply");
    }

    #[test]
    fn qpp_pads_are_permutations() {
        let pads = QppPads::new(b"0123456789abcdef0123456789abcdef", 5);
        for (pad, inv) in pads.pads.iter().zip(&pads.inverse) {
            let mut seen = [false; 256];
            for &v in pad.iter() {
                assert!(!seen[v as usize], "pad must not repeat values");
                seen[v as usize] = true;
            }
            for b in 0..=255u8 {
                assert_eq!(inv[pad[b as usize] as usize], b);
            }
        }
    }
}
