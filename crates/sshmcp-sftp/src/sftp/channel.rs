// ── Transfer channel ─────────────────────────────────────────────────────────
//
// File operations over one session's SFTP sub-channel. The channel is
// unusable until `init` succeeds and again after `close`.

use crate::sftp::permissions::{format_permissions, is_dir, is_regular, is_symlink};
use crate::sftp::types::{FileContent, FileEntry, FileStat, TransferOp};
use chrono::{DateTime, Utc};
use sshmcp_ssh::ssh::{FileAttrs, FileProtocol, SshError, SshResult, TransportSession};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// Default byte budget for `read_file` previews.
pub const DEFAULT_READ_LIMIT: usize = 25_000;

/// Streaming chunk size for uploads, downloads and writes.
pub const TRANSFER_CHUNK_SIZE: usize = 32 * 1024;

#[derive(Default)]
pub struct TransferChannel {
    protocol: Mutex<Option<Arc<dyn FileProtocol>>>,
}

fn epoch_to_utc(secs: Option<u64>) -> Option<DateTime<Utc>> {
    secs.and_then(|s| DateTime::from_timestamp(i64::try_from(s).ok()?, 0))
}

fn join_remote(dir: &str, name: &str) -> String {
    if dir.ends_with('/') {
        format!("{}{}", dir, name)
    } else {
        format!("{}/{}", dir, name)
    }
}

/// Decode a byte preview as text. When the preview was cut short, an
/// incomplete trailing UTF-8 sequence is dropped instead of replaced.
fn decode_preview(mut bytes: Vec<u8>, cut: bool) -> String {
    if cut {
        if let Err(e) = std::str::from_utf8(&bytes) {
            if e.error_len().is_none() {
                bytes.truncate(e.valid_up_to());
            }
        }
    }
    match String::from_utf8(bytes) {
        Ok(text) => text,
        Err(e) => String::from_utf8_lossy(e.as_bytes()).into_owned(),
    }
}

fn local_error(op: TransferOp, local: &Path, e: std::io::Error) -> SshError {
    SshError::from(e).in_operation(op, &local.display().to_string())
}

impl TransferChannel {
    /// Uninitialised channel; every operation fails until `init`.
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a channel on a connected session.
    pub async fn open(session: &TransportSession) -> SshResult<Self> {
        let channel = Self::new();
        channel.init(session).await?;
        Ok(channel)
    }

    /// Open the file-protocol sub-channel. A second call is a no-op.
    pub async fn init(&self, session: &TransportSession) -> SshResult<()> {
        if self.is_open() {
            return Ok(());
        }
        let transport = session.transport().ok_or_else(SshError::not_connected)?;
        let protocol = transport.open_file_protocol().await?;
        *self.slot() = Some(protocol);
        tracing::debug!(host = %session.target().host, "sftp channel opened");
        Ok(())
    }

    pub fn is_open(&self) -> bool {
        self.slot().is_some()
    }

    fn slot(&self) -> MutexGuard<'_, Option<Arc<dyn FileProtocol>>> {
        match self.protocol.lock() {
            Ok(slot) => slot,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn protocol(&self) -> SshResult<Arc<dyn FileProtocol>> {
        self.slot().clone().ok_or_else(SshError::not_initialized)
    }

    // ── Listing & metadata ───────────────────────────────────────────────

    /// Immediate children of `path`, directories first, then by name.
    pub async fn list_directory(&self, path: &str) -> SshResult<Vec<FileEntry>> {
        let protocol = self.protocol()?;
        let raw = protocol
            .read_dir(path)
            .await
            .map_err(|e| e.in_operation(TransferOp::List, path))?;

        let mut entries: Vec<FileEntry> = raw
            .into_iter()
            .filter(|e| e.name != "." && e.name != "..")
            .map(|e| {
                let mode = e.attrs.perm.unwrap_or(0);
                FileEntry {
                    path: join_remote(path, &e.name),
                    name: e.name,
                    is_directory: is_dir(mode),
                    is_file: is_regular(mode),
                    is_symlink: is_symlink(mode),
                    permissions: format_permissions(mode),
                    mode,
                    size: e.attrs.size.unwrap_or(0),
                    uid: e.attrs.uid.unwrap_or(0),
                    gid: e.attrs.gid.unwrap_or(0),
                    modified: epoch_to_utc(e.attrs.mtime),
                }
            })
            .collect();

        entries.sort_by(|a, b| {
            b.is_directory
                .cmp(&a.is_directory)
                .then_with(|| a.name.cmp(&b.name))
        });
        tracing::debug!(path, count = entries.len(), "sftp list");
        Ok(entries)
    }

    pub async fn stat(&self, path: &str) -> SshResult<FileStat> {
        let protocol = self.protocol()?;
        let attrs = protocol
            .stat(path)
            .await
            .map_err(|e| e.in_operation(TransferOp::Stat, path))?;
        Ok(to_file_stat(path, &attrs))
    }

    /// `Ok(false)` only when the server reports the path as missing; other
    /// failures propagate.
    pub async fn exists(&self, path: &str) -> SshResult<bool> {
        let protocol = self.protocol()?;
        match protocol.stat(path).await {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e.in_operation(TransferOp::Stat, path)),
        }
    }

    // ── Streaming transfers ──────────────────────────────────────────────

    /// Stream a local file to `remote` in fixed-size chunks.
    pub async fn upload_file(&self, local: &Path, remote: &str) -> SshResult<u64> {
        let protocol = self.protocol()?;
        let mut file = tokio::fs::File::open(local)
            .await
            .map_err(|e| local_error(TransferOp::Upload, local, e))?;

        let op = TransferOp::Upload;
        let mut writer = protocol
            .open_write(remote)
            .await
            .map_err(|e| e.in_operation(op, remote))?;

        let mut buf = vec![0u8; TRANSFER_CHUNK_SIZE];
        let mut total: u64 = 0;
        loop {
            let n = file
                .read(&mut buf)
                .await
                .map_err(|e| local_error(op, local, e))?;
            if n == 0 {
                break;
            }
            writer
                .write_chunk(&buf[..n])
                .await
                .map_err(|e| e.in_operation(op, remote))?;
            total += n as u64;
        }
        writer.finish().await.map_err(|e| e.in_operation(op, remote))?;

        tracing::info!(local = %local.display(), remote, bytes = total, "sftp upload complete");
        Ok(total)
    }

    /// Stream `remote` into a local file, returning the remote size.
    pub async fn download_file(&self, remote: &str, local: &Path) -> SshResult<u64> {
        let protocol = self.protocol()?;
        let op = TransferOp::Download;
        let attrs = protocol
            .stat(remote)
            .await
            .map_err(|e| e.in_operation(op, remote))?;
        let mut reader = protocol
            .open_read(remote)
            .await
            .map_err(|e| e.in_operation(op, remote))?;

        let mut file = tokio::fs::File::create(local)
            .await
            .map_err(|e| local_error(op, local, e))?;
        let mut copied: u64 = 0;
        loop {
            let chunk = reader
                .read_chunk(TRANSFER_CHUNK_SIZE)
                .await
                .map_err(|e| e.in_operation(op, remote))?;
            if chunk.is_empty() {
                break;
            }
            file.write_all(&chunk)
                .await
                .map_err(|e| local_error(op, local, e))?;
            copied += chunk.len() as u64;
        }
        file.flush().await.map_err(|e| local_error(op, local, e))?;

        let size = attrs.size.unwrap_or(copied);
        tracing::info!(remote, local = %local.display(), bytes = copied, "sftp download complete");
        Ok(size)
    }

    // ── Content ──────────────────────────────────────────────────────────

    /// Read at most `limit` bytes of `path` as text.
    pub async fn read_file(&self, path: &str, limit: usize) -> SshResult<FileContent> {
        let protocol = self.protocol()?;
        let op = TransferOp::Read;
        let attrs = protocol
            .stat(path)
            .await
            .map_err(|e| e.in_operation(op, path))?;
        let size = attrs.size.unwrap_or(0);

        let mut reader = protocol
            .open_read(path)
            .await
            .map_err(|e| e.in_operation(op, path))?;
        let want = limit.min(usize::try_from(size).unwrap_or(usize::MAX));
        let mut bytes = Vec::with_capacity(want);
        while bytes.len() < limit {
            let max = (limit - bytes.len()).min(TRANSFER_CHUNK_SIZE);
            let chunk = reader
                .read_chunk(max)
                .await
                .map_err(|e| e.in_operation(op, path))?;
            if chunk.is_empty() {
                break;
            }
            bytes.extend_from_slice(&chunk);
        }
        bytes.truncate(limit);

        let truncated = size > limit as u64;
        Ok(FileContent {
            path: path.to_string(),
            content: decode_preview(bytes, truncated),
            size,
            truncated,
        })
    }

    /// Create or overwrite `path` with `content`; returns bytes written.
    pub async fn write_file(&self, path: &str, content: &str) -> SshResult<u64> {
        let protocol = self.protocol()?;
        let op = TransferOp::Write;
        let mut writer = protocol
            .open_write(path)
            .await
            .map_err(|e| e.in_operation(op, path))?;
        for chunk in content.as_bytes().chunks(TRANSFER_CHUNK_SIZE) {
            writer
                .write_chunk(chunk)
                .await
                .map_err(|e| e.in_operation(op, path))?;
        }
        writer.finish().await.map_err(|e| e.in_operation(op, path))?;
        Ok(content.len() as u64)
    }

    // ── Mutations ────────────────────────────────────────────────────────

    pub async fn delete_file(&self, path: &str) -> SshResult<()> {
        let protocol = self.protocol()?;
        protocol
            .remove_file(path)
            .await
            .map_err(|e| e.in_operation(TransferOp::Delete, path))
    }

    /// Remove an empty directory. Non-empty directories are not recursed.
    pub async fn delete_directory(&self, path: &str) -> SshResult<()> {
        let protocol = self.protocol()?;
        protocol
            .remove_dir(path)
            .await
            .map_err(|e| e.in_operation(TransferOp::Delete, path))
    }

    pub async fn create_directory(&self, path: &str) -> SshResult<()> {
        let protocol = self.protocol()?;
        protocol
            .make_dir(path)
            .await
            .map_err(|e| e.in_operation(TransferOp::Mkdir, path))
    }

    pub async fn rename(&self, old_path: &str, new_path: &str) -> SshResult<()> {
        let protocol = self.protocol()?;
        protocol
            .rename(old_path, new_path)
            .await
            .map_err(|e| e.in_operation(TransferOp::Rename, old_path))
    }

    /// Release the sub-channel. Safe to call repeatedly.
    pub async fn close(&self) -> SshResult<()> {
        let protocol = self.slot().take();
        match protocol {
            Some(p) => p.close().await,
            None => Ok(()),
        }
    }
}

impl std::fmt::Debug for TransferChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransferChannel")
            .field("open", &self.is_open())
            .finish()
    }
}

fn to_file_stat(path: &str, attrs: &FileAttrs) -> FileStat {
    let mode = attrs.perm.unwrap_or(0);
    FileStat {
        path: path.to_string(),
        mode,
        permissions: format_permissions(mode),
        is_directory: is_dir(mode),
        is_file: is_regular(mode),
        is_symlink: is_symlink(mode),
        uid: attrs.uid.unwrap_or(0),
        gid: attrs.gid.unwrap_or(0),
        size: attrs.size.unwrap_or(0),
        accessed: epoch_to_utc(attrs.atime),
        modified: epoch_to_utc(attrs.mtime),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sshmcp_ssh::ssh::testing::{FakeConnector, FakeServer};
    use sshmcp_ssh::ssh::{AuthMethod, ConnectTarget, SessionOptions, SshErrorKind};

    async fn channel_on(server: &FakeServer) -> (TransportSession, TransferChannel) {
        let session = TransportSession::new(
            ConnectTarget {
                host: "fake.local".into(),
                port: 22,
                username: "tester".into(),
                auth: AuthMethod::Password {
                    password: "pw".into(),
                },
            },
            SessionOptions::default(),
        );
        session
            .connect(&FakeConnector::new(server.clone()))
            .await
            .unwrap();
        let channel = TransferChannel::open(&session).await.unwrap();
        (session, channel)
    }

    #[tokio::test]
    async fn operations_fail_before_init_and_after_close() {
        let channel = TransferChannel::new();
        let err = channel.list_directory("/").await.unwrap_err();
        assert_eq!(err.kind, SshErrorKind::NotInitialized);
        assert_eq!(err.message, "SFTP channel not initialized");

        let server = FakeServer::new();
        let (_session, channel) = channel_on(&server).await;
        assert!(channel.is_open());
        channel.close().await.unwrap();
        channel.close().await.unwrap();
        let err = channel.stat("/").await.unwrap_err();
        assert_eq!(err.kind, SshErrorKind::NotInitialized);
    }

    #[tokio::test]
    async fn init_requires_connected_session() {
        let session = TransportSession::new(
            ConnectTarget {
                host: "fake.local".into(),
                port: 22,
                username: "tester".into(),
                auth: AuthMethod::Password {
                    password: "pw".into(),
                },
            },
            SessionOptions::default(),
        );
        let err = TransferChannel::open(&session).await.unwrap_err();
        assert_eq!(err.kind, SshErrorKind::NotConnected);
    }

    #[tokio::test]
    async fn listing_puts_directories_first_then_sorts_by_name() {
        let server = FakeServer::new();
        server.add_dir("/srv");
        server.add_file("/srv/zeta.txt", "z");
        server.add_dir("/srv/beta");
        server.add_file("/srv/alpha.txt", "a");
        server.add_dir("/srv/Alpha");
        server.add_file("/srv/Beta.log", "b");
        let (_session, channel) = channel_on(&server).await;

        let entries = channel.list_directory("/srv").await.unwrap();
        let names: Vec<&str> = entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, ["Alpha", "beta", "Beta.log", "alpha.txt", "zeta.txt"]);

        let first_file = entries.iter().position(|e| !e.is_directory).unwrap();
        assert!(entries[..first_file].iter().all(|e| e.is_directory));
        assert!(entries[first_file..].iter().all(|e| e.is_file));

        let beta = &entries[1];
        assert_eq!(beta.path, "/srv/beta");
        assert_eq!(beta.permissions, "drwxr-xr-x");
        assert!(beta.modified.is_some());
    }

    #[tokio::test]
    async fn listing_missing_directory_names_the_operation() {
        let server = FakeServer::new();
        let (_session, channel) = channel_on(&server).await;
        let err = channel.list_directory("/nope").await.unwrap_err();
        assert!(err.is_not_found());
        assert!(err.message.starts_with("SFTP list failed for '/nope':"));
    }

    #[tokio::test]
    async fn write_then_read_round_trips() {
        let server = FakeServer::new();
        let (_session, channel) = channel_on(&server).await;

        let text = "line one\nligne deux, café\n";
        let written = channel.write_file("/notes.txt", text).await.unwrap();
        assert_eq!(written, text.len() as u64);

        let read = channel
            .read_file("/notes.txt", DEFAULT_READ_LIMIT)
            .await
            .unwrap();
        assert_eq!(read.content, text);
        assert_eq!(read.size, text.len() as u64);
        assert!(!read.truncated);
    }

    #[tokio::test]
    async fn large_read_is_truncated_but_reports_full_size() {
        let server = FakeServer::new();
        let (_session, channel) = channel_on(&server).await;
        let big = "x".repeat(DEFAULT_READ_LIMIT + 5_000);
        channel.write_file("/big.txt", &big).await.unwrap();

        let read = channel
            .read_file("/big.txt", DEFAULT_READ_LIMIT)
            .await
            .unwrap();
        assert!(read.truncated);
        assert_eq!(read.content.len(), DEFAULT_READ_LIMIT);
        assert_eq!(read.size, big.len() as u64);
    }

    #[tokio::test]
    async fn truncated_read_drops_split_character() {
        let server = FakeServer::new();
        server.add_file("/utf8.txt", "ab€".as_bytes().to_vec());
        let (_session, channel) = channel_on(&server).await;

        let read = channel.read_file("/utf8.txt", 3).await.unwrap();
        assert!(read.truncated);
        assert_eq!(read.content, "ab");
    }

    #[tokio::test]
    async fn upload_and_download_stream_through_local_files() {
        let server = FakeServer::new();
        let (_session, channel) = channel_on(&server).await;
        let dir = tempfile::tempdir().unwrap();

        let payload: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();
        let local = dir.path().join("payload.bin");
        std::fs::write(&local, &payload).unwrap();

        let sent = channel.upload_file(&local, "/payload.bin").await.unwrap();
        assert_eq!(sent, payload.len() as u64);
        assert_eq!(server.file("/payload.bin").unwrap(), payload);

        let back = dir.path().join("back.bin");
        let got = channel.download_file("/payload.bin", &back).await.unwrap();
        assert_eq!(got, payload.len() as u64);
        assert_eq!(std::fs::read(&back).unwrap(), payload);
    }

    #[tokio::test]
    async fn upload_of_missing_local_file_fails() {
        let server = FakeServer::new();
        let (_session, channel) = channel_on(&server).await;
        let dir = tempfile::tempdir().unwrap();

        let err = channel
            .upload_file(&dir.path().join("missing"), "/x")
            .await
            .unwrap_err();
        assert!(err.is_not_found());
        assert!(err.message.contains("SFTP upload failed"));
        assert!(!server.exists("/x"));
    }

    #[tokio::test]
    async fn exists_distinguishes_missing_from_errors() {
        let server = FakeServer::new();
        server.add_file("/present", "1");
        server.add_file("/secret", "2");
        server.deny("/secret");
        let (_session, channel) = channel_on(&server).await;

        assert!(channel.exists("/present").await.unwrap());
        assert!(!channel.exists("/absent").await.unwrap());
        let err = channel.exists("/secret").await.unwrap_err();
        assert_eq!(err.kind, SshErrorKind::PermissionDenied);
    }

    #[tokio::test]
    async fn mkdir_rename_delete() {
        let server = FakeServer::new();
        let (_session, channel) = channel_on(&server).await;

        channel.create_directory("/work").await.unwrap();
        channel.write_file("/work/a.txt", "a").await.unwrap();

        let err = channel.delete_directory("/work").await.unwrap_err();
        assert!(err.message.starts_with("SFTP delete failed for '/work':"));
        assert!(server.is_dir("/work"));

        channel.rename("/work/a.txt", "/work/b.txt").await.unwrap();
        assert!(server.exists("/work/b.txt"));
        assert!(!server.exists("/work/a.txt"));

        channel.delete_file("/work/b.txt").await.unwrap();
        channel.delete_directory("/work").await.unwrap();
        assert!(!server.exists("/work"));
    }

    #[tokio::test]
    async fn stat_converts_mode_and_times() {
        let server = FakeServer::new();
        server.add_file("/etc.conf", "k=v\n");
        let (_session, channel) = channel_on(&server).await;

        let stat = channel.stat("/etc.conf").await.unwrap();
        assert!(stat.is_file);
        assert!(!stat.is_directory);
        assert_eq!(stat.size, 4);
        assert_eq!(stat.permissions, "-rw-r--r--");
        assert_eq!(stat.modified.unwrap().timestamp(), 1_700_000_000);
    }
}
