//! In-memory transport for tests.
//!
//! `FakeServer` holds a tiny filesystem, a table of canned command results
//! and a few failure knobs. `FakeConnector` hands out transports bound to
//! it, so the session engine and the transfer layer can be exercised
//! without a real SSH server.

use crate::ssh::error::{SshError, SshErrorKind, SshResult};
use crate::ssh::transport::{
    AbortSignal, Connector, ExecChannel, ExecEvent, FileAttrs, FileProtocol, RemoteEntry,
    RemoteReader, RemoteWriter, Transport,
};
use crate::ssh::types::{AuthMethod, ConnectTarget};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

const CHUNK: usize = 4096;
const FAKE_MTIME: u64 = 1_700_000_000;
const FAKE_UID: u32 = 1000;

#[derive(Debug, Clone)]
pub enum FakeCommand {
    Output {
        stdout: String,
        stderr: String,
        exit_code: Option<i32>,
    },
    /// Never produces output or exits.
    Hang,
    /// Like `Hang`, but aborting the channel never completes either.
    Unkillable,
}

#[derive(Debug, Clone)]
enum FakeNode {
    Dir,
    File(Vec<u8>),
}

#[derive(Default)]
struct ServerState {
    fs: BTreeMap<String, FakeNode>,
    commands: HashMap<String, FakeCommand>,
    password: Option<String>,
    connect_delay: Option<Duration>,
    fail_disconnect: bool,
    sftp_close_delay: Option<Duration>,
    denied: HashSet<String>,
    /// Close events in the order they happened, tagged with the connection
    /// number, e.g. `"sftp_close#1"`.
    events: Vec<String>,
}

#[derive(Default)]
struct FakeInner {
    state: Mutex<ServerState>,
    generation: AtomicU64,
    connect_attempts: AtomicUsize,
    aborted_connects: AtomicUsize,
    aborted_execs: AtomicUsize,
    disconnects: AtomicUsize,
    file_protocols_opened: AtomicUsize,
}

#[derive(Clone)]
pub struct FakeServer {
    inner: Arc<FakeInner>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    match m.lock() {
        Ok(g) => g,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn normalize(path: &str) -> String {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else {
        trimmed.to_string()
    }
}

fn parent_of(path: &str) -> String {
    match path.rsplit_once('/') {
        Some(("", _)) | None => "/".to_string(),
        Some((parent, _)) => parent.to_string(),
    }
}

fn not_found() -> SshError {
    SshError::new(SshErrorKind::NotFound, "No such file")
}

fn failure(msg: &str) -> SshError {
    SshError::protocol(msg)
}

impl Default for FakeServer {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeServer {
    pub fn new() -> Self {
        let server = Self {
            inner: Arc::default(),
        };
        server.state().fs.insert("/".into(), FakeNode::Dir);
        server
    }

    fn state(&self) -> MutexGuard<'_, ServerState> {
        lock(&self.inner.state)
    }

    pub fn with_password(self, password: &str) -> Self {
        self.state().password = Some(password.to_string());
        self
    }

    pub fn with_connect_delay(self, delay: Duration) -> Self {
        self.state().connect_delay = Some(delay);
        self
    }

    pub fn with_failing_disconnect(self) -> Self {
        self.state().fail_disconnect = true;
        self
    }

    /// Make closing an SFTP sub-channel take `delay`.
    pub fn with_sftp_close_delay(self, delay: Duration) -> Self {
        self.state().sftp_close_delay = Some(delay);
        self
    }

    pub fn set_command(&self, command: &str, result: FakeCommand) {
        self.state().commands.insert(command.to_string(), result);
    }

    pub fn add_dir(&self, path: &str) {
        self.state().fs.insert(normalize(path), FakeNode::Dir);
    }

    pub fn add_file(&self, path: &str, content: impl Into<Vec<u8>>) {
        self.state()
            .fs
            .insert(normalize(path), FakeNode::File(content.into()));
    }

    pub fn file(&self, path: &str) -> Option<Vec<u8>> {
        match self.state().fs.get(&normalize(path)) {
            Some(FakeNode::File(data)) => Some(data.clone()),
            _ => None,
        }
    }

    pub fn is_dir(&self, path: &str) -> bool {
        matches!(self.state().fs.get(&normalize(path)), Some(FakeNode::Dir))
    }

    pub fn exists(&self, path: &str) -> bool {
        self.state().fs.contains_key(&normalize(path))
    }

    /// Make every file operation on `path` fail with permission denied.
    pub fn deny(&self, path: &str) {
        self.state().denied.insert(normalize(path));
    }

    /// Simulate the remote end dropping every open connection.
    pub fn kill_connections(&self) {
        self.inner.generation.fetch_add(1, Ordering::SeqCst);
    }

    pub fn connect_attempts(&self) -> usize {
        self.inner.connect_attempts.load(Ordering::SeqCst)
    }

    pub fn aborted_connects(&self) -> usize {
        self.inner.aborted_connects.load(Ordering::SeqCst)
    }

    pub fn aborted_execs(&self) -> usize {
        self.inner.aborted_execs.load(Ordering::SeqCst)
    }

    pub fn disconnects(&self) -> usize {
        self.inner.disconnects.load(Ordering::SeqCst)
    }

    pub fn file_protocols_opened(&self) -> usize {
        self.inner.file_protocols_opened.load(Ordering::SeqCst)
    }

    pub fn file_protocols_closed(&self) -> usize {
        self.state()
            .events
            .iter()
            .filter(|e| e.starts_with("sftp_close#"))
            .count()
    }

    /// Ordered close log: `sftp_close#<n>` and `disconnect#<n>`, where `n`
    /// is the 1-based connection number.
    pub fn events(&self) -> Vec<String> {
        self.state().events.clone()
    }

    fn record(&self, event: &str, conn: usize) {
        self.state().events.push(format!("{}#{}", event, conn));
    }

    fn is_current(&self, generation: u64) -> bool {
        self.inner.generation.load(Ordering::SeqCst) == generation
    }

    fn command(&self, command: &str) -> FakeCommand {
        if let Some(found) = self.state().commands.get(command) {
            return found.clone();
        }
        match command.strip_prefix("echo ") {
            Some(rest) => FakeCommand::Output {
                stdout: format!("{}\n", rest),
                stderr: String::new(),
                exit_code: Some(0),
            },
            None => FakeCommand::Output {
                stdout: String::new(),
                stderr: format!("sh: {}: command not found\n", command),
                exit_code: Some(127),
            },
        }
    }

    fn check_access(&self, state: &ServerState, path: &str) -> SshResult<()> {
        if state.denied.contains(path) {
            return Err(SshError::new(SshErrorKind::PermissionDenied, "Permission denied"));
        }
        Ok(())
    }

    fn attrs_of(node: &FakeNode) -> FileAttrs {
        let (perm, size) = match node {
            FakeNode::Dir => (0o040755, 4096),
            FakeNode::File(data) => (0o100644, data.len() as u64),
        };
        FileAttrs {
            size: Some(size),
            uid: Some(FAKE_UID),
            gid: Some(FAKE_UID),
            perm: Some(perm),
            atime: Some(FAKE_MTIME),
            mtime: Some(FAKE_MTIME),
        }
    }
}

// ── Connector ────────────────────────────────────────────────────────────────

pub struct FakeConnector {
    server: FakeServer,
}

impl FakeConnector {
    pub fn new(server: FakeServer) -> Self {
        Self { server }
    }
}

#[async_trait]
impl Connector for FakeConnector {
    async fn connect(
        &self,
        target: &ConnectTarget,
        abort: AbortSignal,
    ) -> SshResult<Arc<dyn Transport>> {
        let inner = self.server.inner.clone();
        let conn = inner.connect_attempts.fetch_add(1, Ordering::SeqCst) + 1;

        let hook_inner = inner.clone();
        abort.on_abort(move || {
            hook_inner.aborted_connects.fetch_add(1, Ordering::SeqCst);
        });

        let (delay, password) = {
            let state = self.server.state();
            (state.connect_delay, state.password.clone())
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if abort.is_aborted() {
            return Err(SshError::connection_lost("handshake aborted"));
        }

        if let (Some(expected), AuthMethod::Password { password }) = (password, &target.auth) {
            if *password != expected {
                return Err(SshError::new(
                    SshErrorKind::ConnectionFailed,
                    "Authentication failed",
                ));
            }
        }

        Ok(Arc::new(FakeTransport {
            server: self.server.clone(),
            conn,
            generation: inner.generation.load(Ordering::SeqCst),
            closed: AtomicBool::new(false),
        }))
    }
}

// ── Transport ────────────────────────────────────────────────────────────────

pub struct FakeTransport {
    server: FakeServer,
    conn: usize,
    generation: u64,
    closed: AtomicBool,
}

#[async_trait]
impl Transport for FakeTransport {
    async fn exec(&self, command: &str) -> SshResult<Box<dyn ExecChannel>> {
        if !self.is_alive() {
            return Err(SshError::connection_lost("channel closed"));
        }
        let mut events = VecDeque::new();
        let mut unkillable = false;
        let hang = match self.server.command(command) {
            FakeCommand::Hang => true,
            FakeCommand::Unkillable => {
                unkillable = true;
                true
            }
            FakeCommand::Output {
                stdout,
                stderr,
                exit_code,
            } => {
                for chunk in stdout.as_bytes().chunks(CHUNK) {
                    events.push_back(ExecEvent::Stdout(chunk.to_vec()));
                }
                for chunk in stderr.as_bytes().chunks(CHUNK) {
                    events.push_back(ExecEvent::Stderr(chunk.to_vec()));
                }
                events.push_back(ExecEvent::Exit(exit_code));
                false
            }
        };
        Ok(Box::new(FakeExec {
            server: self.server.clone(),
            events,
            hang,
            unkillable,
            aborted: false,
        }))
    }

    async fn open_file_protocol(&self) -> SshResult<Arc<dyn FileProtocol>> {
        if !self.is_alive() {
            return Err(SshError::connection_lost("channel closed"));
        }
        self.server
            .inner
            .file_protocols_opened
            .fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(FakeSftp {
            server: self.server.clone(),
            conn: self.conn,
            generation: self.generation,
            open: AtomicBool::new(true),
        }))
    }

    async fn disconnect(&self) -> SshResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.server.inner.disconnects.fetch_add(1, Ordering::SeqCst);
        self.server.record("disconnect", self.conn);
        if self.server.state().fail_disconnect {
            return Err(SshError::io("disconnect failed"));
        }
        Ok(())
    }

    fn is_alive(&self) -> bool {
        !self.closed.load(Ordering::SeqCst) && self.server.is_current(self.generation)
    }
}

pub struct FakeExec {
    server: FakeServer,
    events: VecDeque<ExecEvent>,
    hang: bool,
    unkillable: bool,
    aborted: bool,
}

#[async_trait]
impl ExecChannel for FakeExec {
    async fn next_event(&mut self) -> Option<SshResult<ExecEvent>> {
        if let Some(event) = self.events.pop_front() {
            return Some(Ok(event));
        }
        if self.hang && !self.aborted {
            std::future::pending::<()>().await;
        }
        None
    }

    async fn abort(&mut self) {
        if !self.aborted {
            self.aborted = true;
            self.server.inner.aborted_execs.fetch_add(1, Ordering::SeqCst);
        }
        if self.unkillable {
            std::future::pending::<()>().await;
        }
    }
}

// ── File protocol ────────────────────────────────────────────────────────────

pub struct FakeSftp {
    server: FakeServer,
    conn: usize,
    generation: u64,
    open: AtomicBool,
}

impl FakeSftp {
    fn ensure_open(&self) -> SshResult<()> {
        if !self.open.load(Ordering::SeqCst) {
            return Err(failure("sftp subsystem closed"));
        }
        if !self.server.is_current(self.generation) {
            return Err(SshError::connection_lost("channel closed"));
        }
        Ok(())
    }
}

#[async_trait]
impl FileProtocol for FakeSftp {
    async fn read_dir(&self, path: &str) -> SshResult<Vec<RemoteEntry>> {
        self.ensure_open()?;
        let path = normalize(path);
        let state = self.server.state();
        self.server.check_access(&state, &path)?;
        match state.fs.get(&path) {
            Some(FakeNode::Dir) => {}
            Some(FakeNode::File(_)) => return Err(failure("Not a directory")),
            None => return Err(not_found()),
        }
        Ok(state
            .fs
            .iter()
            .filter(|(key, _)| key.as_str() != path && parent_of(key) == path)
            .map(|(key, node)| RemoteEntry {
                name: key.rsplit('/').next().unwrap_or(key.as_str()).to_string(),
                attrs: FakeServer::attrs_of(node),
            })
            .collect())
    }

    async fn stat(&self, path: &str) -> SshResult<FileAttrs> {
        self.ensure_open()?;
        let path = normalize(path);
        let state = self.server.state();
        self.server.check_access(&state, &path)?;
        state
            .fs
            .get(&path)
            .map(FakeServer::attrs_of)
            .ok_or_else(not_found)
    }

    async fn open_read(&self, path: &str) -> SshResult<Box<dyn RemoteReader>> {
        self.ensure_open()?;
        let path = normalize(path);
        let state = self.server.state();
        self.server.check_access(&state, &path)?;
        match state.fs.get(&path) {
            Some(FakeNode::File(data)) => Ok(Box::new(FakeReader {
                data: data.clone(),
                pos: 0,
            })),
            Some(FakeNode::Dir) => Err(failure("Is a directory")),
            None => Err(not_found()),
        }
    }

    async fn open_write(&self, path: &str) -> SshResult<Box<dyn RemoteWriter>> {
        self.ensure_open()?;
        let path = normalize(path);
        let mut state = self.server.state();
        self.server.check_access(&state, &path)?;
        if !matches!(state.fs.get(&parent_of(&path)), Some(FakeNode::Dir)) {
            return Err(not_found());
        }
        if matches!(state.fs.get(&path), Some(FakeNode::Dir)) {
            return Err(failure("Is a directory"));
        }
        state.fs.insert(path.clone(), FakeNode::File(Vec::new()));
        Ok(Box::new(FakeWriter {
            server: self.server.clone(),
            path,
        }))
    }

    async fn remove_file(&self, path: &str) -> SshResult<()> {
        self.ensure_open()?;
        let path = normalize(path);
        let mut state = self.server.state();
        self.server.check_access(&state, &path)?;
        match state.fs.get(&path) {
            Some(FakeNode::File(_)) => {
                state.fs.remove(&path);
                Ok(())
            }
            Some(FakeNode::Dir) => Err(failure("Failure")),
            None => Err(not_found()),
        }
    }

    async fn remove_dir(&self, path: &str) -> SshResult<()> {
        self.ensure_open()?;
        let path = normalize(path);
        let mut state = self.server.state();
        self.server.check_access(&state, &path)?;
        match state.fs.get(&path) {
            Some(FakeNode::Dir) => {
                let has_children = state
                    .fs
                    .keys()
                    .any(|key| key.as_str() != path && parent_of(key) == path);
                if has_children {
                    return Err(failure("Directory not empty"));
                }
                state.fs.remove(&path);
                Ok(())
            }
            Some(FakeNode::File(_)) => Err(failure("Not a directory")),
            None => Err(not_found()),
        }
    }

    async fn make_dir(&self, path: &str) -> SshResult<()> {
        self.ensure_open()?;
        let path = normalize(path);
        let mut state = self.server.state();
        if state.fs.contains_key(&path) {
            return Err(failure("Failure"));
        }
        if !matches!(state.fs.get(&parent_of(&path)), Some(FakeNode::Dir)) {
            return Err(not_found());
        }
        state.fs.insert(path, FakeNode::Dir);
        Ok(())
    }

    async fn rename(&self, from: &str, to: &str) -> SshResult<()> {
        self.ensure_open()?;
        let (from, to) = (normalize(from), normalize(to));
        let mut state = self.server.state();
        if !state.fs.contains_key(&from) {
            return Err(not_found());
        }
        if state.fs.contains_key(&to) {
            return Err(failure("Failure"));
        }
        if !matches!(state.fs.get(&parent_of(&to)), Some(FakeNode::Dir)) {
            return Err(not_found());
        }
        let prefix = format!("{}/", from);
        let moved: Vec<String> = state
            .fs
            .keys()
            .filter(|key| **key == from || key.starts_with(&prefix))
            .cloned()
            .collect();
        for key in moved {
            if let Some(node) = state.fs.remove(&key) {
                let new_key = format!("{}{}", to, &key[from.len()..]);
                state.fs.insert(new_key, node);
            }
        }
        Ok(())
    }

    async fn close(&self) -> SshResult<()> {
        if !self.open.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        let delay = self.server.state().sftp_close_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.server.record("sftp_close", self.conn);
        Ok(())
    }
}

pub struct FakeReader {
    data: Vec<u8>,
    pos: usize,
}

#[async_trait]
impl RemoteReader for FakeReader {
    async fn read_chunk(&mut self, max: usize) -> SshResult<Vec<u8>> {
        let end = (self.pos + max.min(CHUNK)).min(self.data.len());
        let chunk = self.data[self.pos..end].to_vec();
        self.pos = end;
        Ok(chunk)
    }
}

pub struct FakeWriter {
    server: FakeServer,
    path: String,
}

#[async_trait]
impl RemoteWriter for FakeWriter {
    async fn write_chunk(&mut self, data: &[u8]) -> SshResult<()> {
        let mut state = self.server.state();
        match state.fs.get_mut(&self.path) {
            Some(FakeNode::File(content)) => {
                content.extend_from_slice(data);
                Ok(())
            }
            _ => Err(failure("file handle no longer valid")),
        }
    }

    async fn finish(self: Box<Self>) -> SshResult<()> {
        Ok(())
    }
}
