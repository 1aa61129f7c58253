//! Write coalescing for chatty SOCKS streams.
//!
//! Small writes are buffered until a burst of at least [`Cork::BURST`] bytes
//! accumulates or the oldest byte has waited [`Cork::MAX_DELAY`], whichever
//! comes first.

use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

#[derive(Default)]
pub struct Cork {
    buf: BytesMut,
    oldest: Option<Instant>,
}

impl Cork {
    /// Minimum burst size that triggers an immediate flush
    pub const BURST: usize = 1280;

    /// Longest a byte may sit in the buffer
    pub const MAX_DELAY: Duration = Duration::from_millis(10);

    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, data: &[u8]) {
        if self.buf.is_empty() {
            self.oldest = Some(Instant::now());
        }
        self.buf.extend_from_slice(data);
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// A full burst is ready
    pub fn burst_ready(&self) -> bool {
        self.buf.len() >= Self::BURST
    }

    /// When the time-based flush is due, if anything is buffered
    pub fn deadline(&self) -> Option<Instant> {
        self.oldest.map(|t| t + Self::MAX_DELAY)
    }

    pub fn take(&mut self) -> Bytes {
        self.oldest = None;
        self.buf.split().freeze()
    }
}

/// Drain `rx` into `writer`, coalescing small writes.
pub async fn corked_relay<W>(
    mut rx: mpsc::Receiver<Bytes>,
    mut writer: W,
    cancel: CancellationToken,
) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut cork = Cork::new();
    loop {
        let recv = async {
            match cork.deadline() {
                Some(deadline) => tokio::time::timeout_at(deadline, rx.recv()).await,
                None => Ok(rx.recv().await),
            }
        };
        tokio::select! {
            chunk = recv => match chunk {
                Ok(Some(data)) => {
                    cork.push(&data);
                    if cork.burst_ready() {
                        writer.write_all(&cork.take()).await?;
                    }
                }
                // deadline hit with bytes pending
                Err(_) => {
                    writer.write_all(&cork.take()).await?;
                }
                Ok(None) => break,
            },
            _ = cancel.cancelled() => break,
        }
    }
    if !cork.is_empty() {
        writer.write_all(&cork.take()).await?;
    }
    writer.shutdown().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn burst_threshold() {
        let mut cork = Cork::new();
        cork.push(&[0u8; Cork::BURST - 1]);
        assert!(!cork.burst_ready());
        cork.push(&[0u8; 1]);
        assert!(cork.burst_ready());
        assert_eq!(cork.take().len(), Cork::BURST);
        assert!(cork.is_empty());
        assert!(cork.deadline().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn small_writes_flush_on_deadline() {
        let (tx, rx) = mpsc::channel(8);
        let (sink_write, mut sink_read) = tokio::io::duplex(64 * 1024);
        let cancel = CancellationToken::new();
        let relay = tokio::spawn(corked_relay(rx, sink_write, cancel));

        tx.send(Bytes::from_static(b"tiny")).await.unwrap();
        // nothing close to a burst, so only the 10 ms timer can flush
        tokio::time::sleep(Cork::MAX_DELAY * 2).await;

        use tokio::io::AsyncReadExt;
        let mut buf = [0u8; 4];
        sink_read.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"tiny");

        drop(tx);
        relay.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn large_writes_flush_immediately() {
        let (tx, rx) = mpsc::channel(8);
        let (sink_write, mut sink_read) = tokio::io::duplex(64 * 1024);
        let relay = tokio::spawn(corked_relay(rx, sink_write, CancellationToken::new()));

        let payload = vec![7u8; Cork::BURST * 2];
        tx.send(Bytes::from(payload.clone())).await.unwrap();

        use tokio::io::AsyncReadExt;
        let mut buf = vec![0u8; payload.len()];
        sink_read.read_exact(&mut buf).await.unwrap();
        assert_eq!(buf, payload);

        drop(tx);
        relay.await.unwrap().unwrap();
    }
}
