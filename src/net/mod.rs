pub mod cork;
pub mod portfwd;
pub mod sshd;

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

/// Reverse shell stream channel depth
pub const RSHELL_BUF_SIZE: usize = 128;

/// Port forward / SOCKS stream channel depth
pub const PROXY_BUF_SIZE: usize = 1024;

/// File transfer stream channel depth
pub const FTP_BUF_SIZE: usize = 8 * 1024;

/// Grace given to the surviving half of a relay after the other closes
pub const RELAY_DRAIN: Duration = Duration::from_secs(5);

/// A token-identified byte stream bridged over an agent's HTTP/2 body.
///
/// Each channel end is claimed exactly once: the dispatcher takes the inbound
/// sender and outbound receiver, the owning subsystem (port forward, file
/// transfer) the opposite pair. The handle itself retains nothing, so
/// dropping a claimed end closes its direction and the peer observes EOF.
pub struct StreamHandler {
    pub token: String,
    pub buf_size: usize,
    pub cancel: CancellationToken,

    inbound_tx: Mutex<Option<mpsc::Sender<Bytes>>>,
    inbound_rx: Mutex<Option<mpsc::Receiver<Bytes>>>,
    outbound_tx: Mutex<Option<mpsc::Sender<Bytes>>>,
    outbound_rx: Mutex<Option<mpsc::Receiver<Bytes>>>,
}

impl StreamHandler {
    pub fn new(token: String, buf_size: usize) -> Arc<Self> {
        let (inbound_tx, inbound_rx) = mpsc::channel(buf_size.max(1));
        let (outbound_tx, outbound_rx) = mpsc::channel(buf_size.max(1));
        Arc::new(Self {
            token,
            buf_size,
            cancel: CancellationToken::new(),
            inbound_tx: Mutex::new(Some(inbound_tx)),
            inbound_rx: Mutex::new(Some(inbound_rx)),
            outbound_tx: Mutex::new(Some(outbound_tx)),
            outbound_rx: Mutex::new(Some(outbound_rx)),
        })
    }

    /// Dispatcher side: sender for bytes arriving from the agent
    pub async fn take_inbound_sender(&self) -> Option<mpsc::Sender<Bytes>> {
        self.inbound_tx.lock().await.take()
    }

    /// Dispatcher side: bytes queued for the agent
    pub async fn take_outbound_receiver(&self) -> Option<mpsc::Receiver<Bytes>> {
        self.outbound_rx.lock().await.take()
    }

    /// Owner side: bytes the agent sent us
    pub async fn take_inbound_receiver(&self) -> Option<mpsc::Receiver<Bytes>> {
        self.inbound_rx.lock().await.take()
    }

    /// Owner side: sender for bytes headed to the agent
    pub async fn take_outbound_sender(&self) -> Option<mpsc::Sender<Bytes>> {
        self.outbound_tx.lock().await.take()
    }
}

/// Process-wide stream-handle tables. FTP streams are keyed by target path
/// (one transfer per path); proxy streams by token.
#[derive(Default)]
pub struct StreamTable {
    ftp: DashMap<String, Arc<StreamHandler>>,
    proxy: DashMap<String, Arc<StreamHandler>>,
}

impl StreamTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_ftp(&self, path: &str, handle: Arc<StreamHandler>) {
        self.ftp.insert(path.to_string(), handle);
    }

    pub fn ftp_by_token(&self, token: &str) -> Option<Arc<StreamHandler>> {
        self.ftp
            .iter()
            .find(|e| e.value().token == token)
            .map(|e| e.value().clone())
    }

    pub fn remove_ftp(&self, path: &str) {
        if let Some((_, handle)) = self.ftp.remove(path) {
            handle.cancel.cancel();
        }
    }

    pub fn register_proxy(&self, handle: Arc<StreamHandler>) {
        self.proxy.insert(handle.token.clone(), handle);
    }

    pub fn proxy_by_token(&self, token: &str) -> Option<Arc<StreamHandler>> {
        self.proxy.get(token).map(|e| e.value().clone())
    }

    pub fn remove_proxy(&self, token: &str) {
        if let Some((_, handle)) = self.proxy.remove(token) {
            handle.cancel.cancel();
        }
    }

    pub fn proxy_count(&self) -> usize {
        self.proxy.len()
    }
}

/// Pump bytes between a local socket and a stream handle until either side
/// closes or the context is cancelled. The surviving direction gets
/// [`RELAY_DRAIN`] to flush before hard-close.
pub async fn relay_socket<S>(handle: Arc<StreamHandler>, socket: S, cancel: CancellationToken)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    relay_socket_opts(handle, socket, cancel, false).await
}

/// [`relay_socket`] with an optional TCP-cork adapter on the agent-to-socket
/// direction, coalescing chatty writes into bursts.
pub async fn relay_socket_opts<S>(
    handle: Arc<StreamHandler>,
    socket: S,
    cancel: CancellationToken,
    corked: bool,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (Some(mut inbound), Some(outbound)) = (
        handle.take_inbound_receiver().await,
        handle.take_outbound_sender().await,
    ) else {
        tracing::warn!("stream {} already has a relay", handle.token);
        return;
    };
    let (mut read_half, mut write_half) = tokio::io::split(socket);

    // socket -> agent; dropping `outbound` on exit ends the agent-bound body
    let mut to_agent = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let mut buf = vec![0u8; 16 * 1024];
            loop {
                tokio::select! {
                    n = read_half.read(&mut buf) => match n {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if outbound.send(Bytes::copy_from_slice(&buf[..n])).await.is_err() {
                                break;
                            }
                        }
                    },
                    _ = cancel.cancelled() => break,
                }
            }
        })
    };

    // agent -> socket
    let mut to_socket = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if corked {
                let _ = cork::corked_relay(inbound, write_half, cancel).await;
                return;
            }
            loop {
                tokio::select! {
                    chunk = inbound.recv() => match chunk {
                        Some(data) => {
                            if write_half.write_all(&data).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    },
                    _ = cancel.cancelled() => break,
                }
            }
            let _ = write_half.shutdown().await;
        })
    };

    // one side done: give the other the drain window, then tear down
    tokio::select! {
        _ = &mut to_agent => {
            let _ = tokio::time::timeout(RELAY_DRAIN, &mut to_socket).await;
        }
        _ = &mut to_socket => {
            let _ = tokio::time::timeout(RELAY_DRAIN, &mut to_agent).await;
        }
    }
    to_agent.abort();
    to_socket.abort();
    cancel.cancel();
    handle.cancel.cancel();
}
