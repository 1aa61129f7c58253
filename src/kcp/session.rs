//! KCP+SMUX session management.
//!
//! The client keeps `conn` smux sessions over KCP and hands out streams
//! round-robin per accepted local connection. Sessions past `autoexpire` are
//! replaced on next use and handed to a scavenger that reaps them once
//! `scavengettl` more seconds pass. The server accepts KCP connections on
//! every port of the listen range and forwards each smux stream to the
//! configured target.

use std::sync::Arc;
use std::time::Duration;

use async_smux::MuxBuilder;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{lookup_host, TcpListener, TcpStream, UnixStream};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_kcp::{KcpConfig, KcpListener, KcpNoDelayConfig, KcpStream};
use tokio_util::sync::CancellationToken;

use super::config::{KcpTunConfig, MultiPort, SCAVENGE_PERIOD};
use super::crypt::{derive_key, CipherStream, CryptKind, QppPads};
use crate::{C2Error, Result};

/// Crypto material shared by every session of a tunnel
pub struct TunCrypto {
    pub key: Vec<u8>,
    pub kind: CryptKind,
    pub qpp: Option<Arc<QppPads>>,
}

impl TunCrypto {
    /// `salt` is the build magic string.
    pub fn from_config(config: &KcpTunConfig, salt: &str) -> Self {
        let (kind, warning) = CryptKind::parse(&config.crypt);
        if let Some(warning) = warning {
            tracing::warn!("{warning}");
        }
        let qpp = config
            .qpp
            .then(|| QppPads::new(config.key.as_bytes(), config.qpp_count));
        Self {
            key: derive_key(&config.key, salt),
            kind,
            qpp,
        }
    }

    fn wrap<S>(&self, stream: S, is_server: bool) -> CipherStream<S> {
        let (tx, rx) = super::crypt::stream_ciphers(self.kind, &self.key, self.qpp.as_ref(), 0, is_server);
        CipherStream::new(stream, tx, rx)
    }
}

fn kcp_config(config: &KcpTunConfig) -> KcpConfig {
    let mut kc = KcpConfig::default();
    kc.mtu = config.mtu;
    kc.wnd_size = (config.snd_wnd, config.rcv_wnd);
    kc.nodelay = KcpNoDelayConfig {
        nodelay: config.no_delay != 0,
        interval: config.interval,
        resend: config.resend,
        nc: config.no_congestion != 0,
    };
    kc.stream = true;
    kc
}

/// Forward target kind, TCP `host:port` or a unix socket path
enum Target {
    Tcp(String),
    Unix(String),
}

impl Target {
    fn parse(target: &str) -> Self {
        if target.rsplit_once(':').and_then(|(_, p)| p.parse::<u16>().ok()).is_some() {
            Target::Tcp(target.to_string())
        } else {
            Target::Unix(target.to_string())
        }
    }
}

async fn pipe<A, B>(mut a: A, mut b: B, close_wait: u64)
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    match tokio::io::copy_bidirectional(&mut a, &mut b).await {
        Ok((up, down)) => tracing::debug!("stream closed, {up} bytes up, {down} bytes down"),
        Err(e) => tracing::debug!("pipe: {e}"),
    }
    if close_wait > 0 {
        tokio::time::sleep(Duration::from_secs(close_wait)).await;
    }
}

/// An expired-but-possibly-busy session waiting for the scavenger
struct Condemned {
    worker: tokio::task::JoinHandle<()>,
    reap_at: Instant,
}

fn spawn_scavenger(
    mut rx: mpsc::Receiver<Condemned>,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut condemned: Vec<Condemned> = Vec::new();
        let mut ticker = tokio::time::interval(Duration::from_secs(SCAVENGE_PERIOD));
        loop {
            tokio::select! {
                item = rx.recv() => match item {
                    Some(item) => condemned.push(item),
                    None => break,
                },
                _ = ticker.tick() => {
                    let now = Instant::now();
                    condemned.retain(|c| {
                        if c.worker.is_finished() {
                            tracing::debug!("scavenger: session closed on its own");
                            false
                        } else if now >= c.reap_at {
                            tracing::debug!("scavenger: session closed due to ttl");
                            c.worker.abort();
                            false
                        } else {
                            true
                        }
                    });
                }
                _ = cancel.cancelled() => break,
            }
        }
        for c in condemned {
            c.worker.abort();
        }
    })
}

type ClientMux = async_smux::MuxConnector<CipherStream<KcpStream>>;

struct PooledSession {
    connector: ClientMux,
    worker: tokio::task::JoinHandle<()>,
    expires: Option<Instant>,
}

/// Client end of the tunnel: listen locally, multiplex over KCP.
pub struct KcpTunClient {
    config: KcpTunConfig,
    crypto: TunCrypto,
}

impl KcpTunClient {
    pub fn new(config: KcpTunConfig, salt: &str) -> Result<Self> {
        config.validate()?;
        for warning in config.warnings() {
            tracing::warn!("{warning}");
        }
        let crypto = TunCrypto::from_config(&config, salt);
        Ok(Self { config, crypto })
    }

    async fn dial(&self, remote: &MultiPort, kc: &KcpConfig) -> Result<PooledSession> {
        let addr_str = remote.random_addr();
        let addr = lookup_host(&addr_str)
            .await?
            .next()
            .ok_or_else(|| C2Error::Config(format!("cannot resolve {addr_str}")))?;
        let kcp = KcpStream::connect(kc, addr)
            .await
            .map_err(|e| C2Error::Protocol(format!("KCP dial {addr_str}: {e}")))?;
        tracing::debug!("KCP connection up: {addr_str}");

        let enc = self.crypto.wrap(kcp, false);
        let (connector, _acceptor, worker) = MuxBuilder::client().with_connection(enc).build();
        let worker = tokio::spawn(async move {
            let _ = worker.await;
        });

        let expires = (self.config.auto_expire > 0)
            .then(|| Instant::now() + Duration::from_secs(self.config.auto_expire));
        Ok(PooledSession {
            connector,
            worker,
            expires,
        })
    }

    pub async fn run(self, cancel: CancellationToken) -> Result<()> {
        let listener = TcpListener::bind(&self.config.local_addr).await?;
        let remote = MultiPort::parse(&self.config.remote_addr)?;
        let kc = kcp_config(&self.config);
        tracing::info!(
            "KCP tunnel client on {}, server: {} ({} conns, crypt {})",
            self.config.local_addr,
            self.config.remote_addr,
            self.config.conn,
            self.config.crypt
        );

        let (scav_tx, scav_rx) = mpsc::channel(128);
        let scavenger = spawn_scavenger(scav_rx, cancel.clone());

        let numconn = self.config.conn.max(1);
        let mut muxes: Vec<Option<PooledSession>> = (0..numconn).map(|_| None).collect();
        let mut rr = 0usize;

        loop {
            let sock = tokio::select! {
                accepted = listener.accept() => accepted?.0,
                _ = cancel.cancelled() => break,
            };
            let idx = rr % numconn;
            rr = rr.wrapping_add(1);

            // auto-expiry and reconnection
            let expired = muxes[idx]
                .as_ref()
                .map(|s| s.worker.is_finished() || s.expires.is_some_and(|e| Instant::now() >= e))
                .unwrap_or(true);
            if expired {
                if let Some(old) = muxes[idx].take() {
                    let ttl = Duration::from_secs(self.config.scavenge_ttl);
                    let _ = scav_tx
                        .send(Condemned {
                            worker: old.worker,
                            reap_at: Instant::now() + ttl,
                        })
                        .await;
                }
                // wait until a connection is ready
                loop {
                    match self.dial(&remote, &kc).await {
                        Ok(session) => {
                            muxes[idx] = Some(session);
                            break;
                        }
                        Err(e) => {
                            tracing::debug!("re-connecting: {e}");
                            tokio::select! {
                                _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                                _ = cancel.cancelled() => return Ok(()),
                            }
                        }
                    }
                }
            }

            let connected = muxes[idx]
                .as_mut()
                .expect("session just ensured")
                .connector
                .connect();
            match connected {
                Ok(stream) => {
                    let close_wait = self.config.close_wait;
                    let quiet = self.config.quiet;
                    tokio::spawn(async move {
                        if !quiet {
                            tracing::debug!("stream opened");
                        }
                        pipe(sock, stream, close_wait).await;
                    });
                }
                Err(e) => {
                    tracing::warn!("mux connect: {e}, retiring session");
                    if let Some(old) = muxes[idx].take() {
                        old.worker.abort();
                    }
                }
            }
        }

        scavenger.abort();
        tracing::info!("KCP tunnel client exited");
        Ok(())
    }
}

/// Server end: accept KCP on every port of the listen range, forward each
/// smux stream to the target.
pub async fn kcp_tun_server(config: KcpTunConfig, salt: &str, cancel: CancellationToken) -> Result<()> {
    config.validate()?;
    for warning in config.warnings() {
        tracing::warn!("{warning}");
    }
    let crypto = Arc::new(TunCrypto::from_config(&config, salt));
    let kc = kcp_config(&config);
    let listen = MultiPort::parse(&config.listen)?;
    let target = Arc::new(config.target.clone());
    tracing::info!(
        "KCP tunnel server on {}, target: {}",
        config.listen,
        config.target
    );

    let mut listeners = tokio::task::JoinSet::new();
    for port in listen.ports() {
        let host = if listen.host.is_empty() {
            "0.0.0.0".to_string()
        } else {
            listen.host.clone()
        };
        let addr = format!("{host}:{port}");
        let mut listener = KcpListener::bind(kc.clone(), &*addr)
            .await
            .map_err(|e| C2Error::Protocol(format!("KCP bind {addr}: {e}")))?;
        tracing::debug!("KCP listening on {addr}");

        let crypto = crypto.clone();
        let target = target.clone();
        let cancel = cancel.clone();
        let close_wait = config.close_wait;
        listeners.spawn(async move {
            loop {
                let (conn, peer) = tokio::select! {
                    accepted = listener.accept() => match accepted {
                        Ok(pair) => pair,
                        Err(e) => {
                            tracing::warn!("KCP accept: {e}");
                            continue;
                        }
                    },
                    _ = cancel.cancelled() => break,
                };
                tracing::debug!("KCP connection from {peer}");
                let enc = crypto.wrap(conn, true);
                let (_connector, mut acceptor, worker) =
                    MuxBuilder::server().with_connection(enc).build();
                tokio::spawn(worker);

                let target = target.clone();
                let cancel = cancel.clone();
                tokio::spawn(async move {
                    loop {
                        let stream = tokio::select! {
                            s = acceptor.accept() => match s {
                                Some(s) => s,
                                None => break,
                            },
                            _ = cancel.cancelled() => break,
                        };
                        let target = target.clone();
                        tokio::spawn(async move {
                            match Target::parse(&target) {
                                Target::Tcp(addr) => match TcpStream::connect(&addr).await {
                                    Ok(sock) => pipe(stream, sock, close_wait).await,
                                    Err(e) => tracing::warn!("dial {addr}: {e}"),
                                },
                                Target::Unix(path) => match UnixStream::connect(&path).await {
                                    Ok(sock) => pipe(stream, sock, close_wait).await,
                                    Err(e) => tracing::warn!("dial {path}: {e}"),
                                },
                            }
                        });
                    }
                });
            }
        });
    }

    while let Some(res) = listeners.join_next().await {
        if let Err(e) = res {
            tracing::warn!("KCP listener task: {e}");
        }
    }
    Ok(())
}
