//! libssh2-backed implementation of the transport traits.
//!
//! ssh2 is blocking, so every call runs on `spawn_blocking` (or a dedicated
//! reader thread for command output) while holding the transport's
//! operation lock. A libssh2 session must not be driven from two threads at
//! once; the lock serialises commands and file operations per connection.

use crate::ssh::error::{SshError, SshErrorKind, SshResult};
use crate::ssh::transport::{
    AbortSignal, Connector, ExecChannel, ExecEvent, FileAttrs, FileProtocol, RemoteEntry,
    RemoteReader, RemoteWriter, Transport,
};
use crate::ssh::types::{AuthMethod, ConnectTarget};
use async_trait::async_trait;
use ssh2::{Channel, KeyboardInteractivePrompt, Prompt, Session, Sftp};
use std::io::{ErrorKind, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

const READ_BUFFER: usize = 16 * 1024;
const MIN_SLEEP_MS: u64 = 1;
const MAX_SLEEP_MS: u64 = 10;
const IDLE_THRESHOLD: u32 = 10;
const SFTP_DIR_MODE: i32 = 0o755;

fn lost(alive: &AtomicBool, result: &SshResult<impl Sized>) {
    if let Err(e) = result {
        if e.kind == SshErrorKind::ConnectionFailed {
            alive.store(false, Ordering::SeqCst);
        }
    }
}

// ── Connector ────────────────────────────────────────────────────────────────

#[derive(Debug, Default, Clone, Copy)]
pub struct Ssh2Connector;

impl Ssh2Connector {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Connector for Ssh2Connector {
    async fn connect(
        &self,
        target: &ConnectTarget,
        abort: AbortSignal,
    ) -> SshResult<Arc<dyn Transport>> {
        if let AuthMethod::PrivateKeyFile { path, .. } = &target.auth {
            if !path.exists() {
                return Err(SshError::invalid_config(format!(
                    "Private key file not found: {}",
                    path.display()
                )));
            }
        }

        let addr = target.address();
        let stream = tokio::net::TcpStream::connect(&addr)
            .await
            .map_err(|e| SshError::connection_failed(format!("TCP connect to {} failed: {}", addr, e)))?;
        let stream = stream.into_std()?;
        stream.set_nonblocking(false)?;

        // Shutting the socket down is the only way to interrupt a blocking
        // libssh2 handshake from another thread.
        let killer = stream.try_clone()?;
        abort.on_abort(move || {
            let _ = killer.shutdown(Shutdown::Both);
        });
        let socket = stream.try_clone()?;

        let target = target.clone();
        let session = tokio::task::spawn_blocking(move || -> SshResult<Session> {
            let mut session = Session::new()?;
            session.set_tcp_stream(stream);
            session.handshake()?;
            authenticate(&session, &target)?;
            Ok(session)
        })
        .await??;

        if abort.is_aborted() {
            let _ = session.disconnect(None, "Client disconnecting", None);
            return Err(SshError::connection_lost("handshake aborted"));
        }

        tracing::debug!(addr = %addr, "ssh2 session established");
        Ok(Arc::new(Ssh2Transport {
            session,
            socket,
            addr,
            op_lock: Arc::new(AsyncMutex::new(())),
            alive: Arc::new(AtomicBool::new(true)),
            closed: AtomicBool::new(false),
        }))
    }
}

struct PasswordPrompter {
    password: String,
}

impl KeyboardInteractivePrompt for PasswordPrompter {
    fn prompt<'a>(
        &mut self,
        _username: &str,
        _instructions: &str,
        prompts: &[Prompt<'a>],
    ) -> Vec<String> {
        prompts.iter().map(|_| self.password.clone()).collect()
    }
}

fn authenticate(session: &Session, target: &ConnectTarget) -> SshResult<()> {
    let user = target.username.as_str();
    match &target.auth {
        AuthMethod::Password { password } => {
            if session.userauth_password(user, password).is_err() {
                // Some servers only accept passwords through keyboard-interactive.
                let mut prompter = PasswordPrompter {
                    password: password.clone(),
                };
                let _ = session.userauth_keyboard_interactive(user, &mut prompter);
            }
        }
        AuthMethod::PrivateKey {
            content,
            passphrase,
        } => {
            // ssh2 has no in-memory public-key auth on every platform, so
            // the key goes through a private temp file.
            let mut key_file = tempfile::NamedTempFile::new()?;
            key_file.write_all(content.as_bytes())?;
            if !content.ends_with('\n') {
                key_file.write_all(b"\n")?;
            }
            key_file.flush()?;
            session.userauth_pubkey_file(user, None, key_file.path(), passphrase.as_deref())?;
        }
        AuthMethod::PrivateKeyFile { path, passphrase } => {
            session.userauth_pubkey_file(user, None, path, passphrase.as_deref())?;
        }
    }

    if !session.authenticated() {
        return Err(SshError::new(
            SshErrorKind::ConnectionFailed,
            format!("Authentication failed for {} ({})", user, target.auth.label()),
        ));
    }
    Ok(())
}

// ── Transport ────────────────────────────────────────────────────────────────

pub struct Ssh2Transport {
    session: Session,
    socket: TcpStream,
    addr: String,
    op_lock: Arc<AsyncMutex<()>>,
    alive: Arc<AtomicBool>,
    closed: AtomicBool,
}

#[async_trait]
impl Transport for Ssh2Transport {
    async fn exec(&self, command: &str) -> SshResult<Box<dyn ExecChannel>> {
        if !self.is_alive() {
            return Err(SshError::not_connected());
        }
        let guard = self.op_lock.clone().lock_owned().await;

        let session = self.session.clone();
        let cmd = command.to_string();
        let opened = tokio::task::spawn_blocking(move || -> SshResult<Channel> {
            session.set_blocking(true);
            let mut channel = session.channel_session()?;
            channel.exec(&cmd)?;
            Ok(channel)
        })
        .await?;
        lost(&self.alive, &opened);
        let channel = opened?;

        let (tx, rx) = mpsc::unbounded_channel();
        let abort = Arc::new(AtomicBool::new(false));
        let pump = ExecPump {
            session: self.session.clone(),
            channel,
            tx,
            abort: abort.clone(),
            alive: self.alive.clone(),
            _guard: guard,
        };
        let handle = std::thread::Builder::new()
            .name("ssh-exec".into())
            .spawn(move || pump.run())?;

        Ok(Box::new(Ssh2Exec {
            rx,
            abort,
            pump: Some(handle),
        }))
    }

    async fn open_file_protocol(&self) -> SshResult<Arc<dyn FileProtocol>> {
        if !self.is_alive() {
            return Err(SshError::not_connected());
        }
        let _guard = self.op_lock.lock().await;
        let session = self.session.clone();
        let opened = tokio::task::spawn_blocking(move || -> SshResult<Sftp> {
            session.set_blocking(true);
            Ok(session.sftp()?)
        })
        .await?;
        lost(&self.alive, &opened);

        Ok(Arc::new(Ssh2Sftp {
            sftp: Mutex::new(Some(Arc::new(opened?))),
            session: self.session.clone(),
            op_lock: self.op_lock.clone(),
            alive: self.alive.clone(),
        }))
    }

    async fn disconnect(&self) -> SshResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.alive.store(false, Ordering::SeqCst);

        let session = self.session.clone();
        let socket = self.socket.try_clone()?;
        let addr = self.addr.clone();
        tokio::task::spawn_blocking(move || -> SshResult<()> {
            let result = session.disconnect(None, "Client disconnecting", None);
            // Unblocks any reader thread still parked on the socket.
            let _ = socket.shutdown(Shutdown::Both);
            tracing::debug!(addr = %addr, "ssh2 session closed");
            result.map_err(SshError::from)
        })
        .await?
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst) && !self.closed.load(Ordering::SeqCst)
    }
}

// ── Exec pump ────────────────────────────────────────────────────────────────

struct ExecPump {
    session: Session,
    channel: Channel,
    tx: UnboundedSender<SshResult<ExecEvent>>,
    abort: Arc<AtomicBool>,
    alive: Arc<AtomicBool>,
    /// Held until the command finishes so nothing else drives the session.
    _guard: OwnedMutexGuard<()>,
}

enum Poll {
    Data(usize),
    Idle,
}

fn poll_read(reader: &mut impl Read, buf: &mut [u8]) -> SshResult<Poll> {
    match reader.read(buf) {
        Ok(0) => Ok(Poll::Idle),
        Ok(n) => Ok(Poll::Data(n)),
        Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::Interrupted) => {
            Ok(Poll::Idle)
        }
        Err(e) => Err(e.into()),
    }
}

impl ExecPump {
    fn run(mut self) {
        self.session.set_blocking(false);
        let finished = self.pump();
        self.session.set_blocking(true);

        match finished {
            Ok(true) => {
                let _ = self.channel.wait_close();
                let _ = self.tx.send(Ok(ExecEvent::Exit(self.exit_code())));
            }
            Ok(false) => {
                let _ = self.channel.close();
            }
            Err(e) => {
                if e.kind == SshErrorKind::ConnectionFailed {
                    self.alive.store(false, Ordering::SeqCst);
                }
                let _ = self.channel.close();
                let _ = self.tx.send(Err(e));
            }
        }
    }

    /// `Ok(true)` on EOF, `Ok(false)` when aborted.
    fn pump(&mut self) -> SshResult<bool> {
        let mut buf = [0u8; READ_BUFFER];
        let mut idle: u32 = 0;

        loop {
            if self.abort.load(Ordering::SeqCst) {
                return Ok(false);
            }
            let mut progressed = false;

            if let Poll::Data(n) = poll_read(&mut self.channel, &mut buf)? {
                progressed = true;
                if self.tx.send(Ok(ExecEvent::Stdout(buf[..n].to_vec()))).is_err() {
                    return Ok(false);
                }
            }
            let mut stderr = self.channel.stderr();
            if let Poll::Data(n) = poll_read(&mut stderr, &mut buf)? {
                progressed = true;
                if self.tx.send(Ok(ExecEvent::Stderr(buf[..n].to_vec()))).is_err() {
                    return Ok(false);
                }
            }

            if progressed {
                idle = 0;
                continue;
            }
            if self.channel.eof() {
                return Ok(true);
            }
            idle = idle.saturating_add(1);
            let sleep = if idle > IDLE_THRESHOLD {
                MAX_SLEEP_MS
            } else {
                MIN_SLEEP_MS
            };
            std::thread::sleep(Duration::from_millis(sleep));
        }
    }

    fn exit_code(&self) -> Option<i32> {
        // A process killed by a signal has no meaningful exit status.
        match self.channel.exit_signal() {
            Ok(signal) if signal.exit_signal.is_some() => None,
            _ => self.channel.exit_status().ok(),
        }
    }
}

pub struct Ssh2Exec {
    rx: UnboundedReceiver<SshResult<ExecEvent>>,
    abort: Arc<AtomicBool>,
    pump: Option<JoinHandle<()>>,
}

#[async_trait]
impl ExecChannel for Ssh2Exec {
    async fn next_event(&mut self) -> Option<SshResult<ExecEvent>> {
        self.rx.recv().await
    }

    async fn abort(&mut self) {
        self.abort.store(true, Ordering::SeqCst);
        if let Some(pump) = self.pump.take() {
            let _ = tokio::task::spawn_blocking(move || pump.join()).await;
        }
    }
}

impl Drop for Ssh2Exec {
    fn drop(&mut self) {
        self.abort.store(true, Ordering::SeqCst);
    }
}

// ── SFTP ─────────────────────────────────────────────────────────────────────

pub struct Ssh2Sftp {
    sftp: Mutex<Option<Arc<Sftp>>>,
    session: Session,
    op_lock: Arc<AsyncMutex<()>>,
    alive: Arc<AtomicBool>,
}

fn to_attrs(stat: &ssh2::FileStat) -> FileAttrs {
    FileAttrs {
        size: stat.size,
        uid: stat.uid,
        gid: stat.gid,
        perm: stat.perm,
        atime: stat.atime,
        mtime: stat.mtime,
    }
}

impl Ssh2Sftp {
    fn handle(&self) -> SshResult<Arc<Sftp>> {
        let slot = match self.sftp.lock() {
            Ok(slot) => slot,
            Err(poisoned) => poisoned.into_inner(),
        };
        slot.clone().ok_or_else(SshError::not_initialized)
    }

    async fn run<T, F>(&self, op: F) -> SshResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&Sftp) -> SshResult<T> + Send + 'static,
    {
        let sftp = self.handle()?;
        let session = self.session.clone();
        let _guard = self.op_lock.lock().await;
        let result = tokio::task::spawn_blocking(move || {
            session.set_blocking(true);
            op(&sftp)
        })
        .await?;
        lost(&self.alive, &result);
        result
    }
}

#[async_trait]
impl FileProtocol for Ssh2Sftp {
    async fn read_dir(&self, path: &str) -> SshResult<Vec<RemoteEntry>> {
        let path = path.to_string();
        self.run(move |sftp| {
            let entries = sftp.readdir(Path::new(&path))?;
            Ok(entries
                .into_iter()
                .filter_map(|(p, stat)| {
                    let name = p.file_name()?.to_string_lossy().into_owned();
                    if name == "." || name == ".." {
                        return None;
                    }
                    Some(RemoteEntry {
                        name,
                        attrs: to_attrs(&stat),
                    })
                })
                .collect())
        })
        .await
    }

    async fn stat(&self, path: &str) -> SshResult<FileAttrs> {
        let path = path.to_string();
        self.run(move |sftp| Ok(to_attrs(&sftp.stat(Path::new(&path))?)))
            .await
    }

    async fn open_read(&self, path: &str) -> SshResult<Box<dyn RemoteReader>> {
        let p = path.to_string();
        let file = self.run(move |sftp| Ok(sftp.open(Path::new(&p))?)).await?;
        Ok(Box::new(Ssh2File {
            file: Some(file),
            session: self.session.clone(),
            op_lock: self.op_lock.clone(),
            alive: self.alive.clone(),
        }))
    }

    async fn open_write(&self, path: &str) -> SshResult<Box<dyn RemoteWriter>> {
        let p = path.to_string();
        let file = self.run(move |sftp| Ok(sftp.create(Path::new(&p))?)).await?;
        Ok(Box::new(Ssh2File {
            file: Some(file),
            session: self.session.clone(),
            op_lock: self.op_lock.clone(),
            alive: self.alive.clone(),
        }))
    }

    async fn remove_file(&self, path: &str) -> SshResult<()> {
        let path = path.to_string();
        self.run(move |sftp| Ok(sftp.unlink(Path::new(&path))?)).await
    }

    async fn remove_dir(&self, path: &str) -> SshResult<()> {
        let path = path.to_string();
        self.run(move |sftp| Ok(sftp.rmdir(Path::new(&path))?)).await
    }

    async fn make_dir(&self, path: &str) -> SshResult<()> {
        let path = path.to_string();
        self.run(move |sftp| Ok(sftp.mkdir(Path::new(&path), SFTP_DIR_MODE)?))
            .await
    }

    async fn rename(&self, from: &str, to: &str) -> SshResult<()> {
        let (from, to) = (from.to_string(), to.to_string());
        self.run(move |sftp| Ok(sftp.rename(Path::new(&from), Path::new(&to), None)?))
            .await
    }

    async fn close(&self) -> SshResult<()> {
        let taken = match self.sftp.lock() {
            Ok(mut slot) => slot.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(sftp) = taken {
            // Dropping the last handle shuts the subsystem down, which is
            // blocking network I/O.
            let _guard = self.op_lock.lock().await;
            let session = self.session.clone();
            tokio::task::spawn_blocking(move || {
                session.set_blocking(true);
                drop(sftp);
            })
            .await?;
        }
        Ok(())
    }
}

/// Remote file handle used for both directions.
struct Ssh2File {
    file: Option<ssh2::File>,
    session: Session,
    op_lock: Arc<AsyncMutex<()>>,
    alive: Arc<AtomicBool>,
}

impl Ssh2File {
    async fn with_file<T, F>(&mut self, op: F) -> SshResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut ssh2::File) -> SshResult<T> + Send + 'static,
    {
        let mut file = self
            .file
            .take()
            .ok_or_else(|| SshError::protocol("remote file handle already closed"))?;
        let session = self.session.clone();
        let _guard = self.op_lock.lock().await;
        let (file, result) = tokio::task::spawn_blocking(move || {
            session.set_blocking(true);
            let result = op(&mut file);
            (file, result)
        })
        .await?;
        self.file = Some(file);
        lost(&self.alive, &result);
        result
    }
}

#[async_trait]
impl RemoteReader for Ssh2File {
    async fn read_chunk(&mut self, max: usize) -> SshResult<Vec<u8>> {
        self.with_file(move |file| {
            let mut buf = vec![0u8; max];
            let n = file.read(&mut buf)?;
            buf.truncate(n);
            Ok(buf)
        })
        .await
    }
}

#[async_trait]
impl RemoteWriter for Ssh2File {
    async fn write_chunk(&mut self, data: &[u8]) -> SshResult<()> {
        let data = data.to_vec();
        self.with_file(move |file| Ok(file.write_all(&data)?)).await
    }

    async fn finish(mut self: Box<Self>) -> SshResult<()> {
        self.with_file(|file| Ok(file.flush()?)).await?;
        if let Some(file) = self.file.take() {
            let _guard = self.op_lock.lock().await;
            let session = self.session.clone();
            tokio::task::spawn_blocking(move || {
                session.set_blocking(true);
                drop(file);
            })
            .await?;
        }
        Ok(())
    }
}
