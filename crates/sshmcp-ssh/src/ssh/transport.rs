//! Capability traits between the session engine and a wire-level SSH stack.
//!
//! The engine only ever talks to these traits. `backend` implements them on
//! top of libssh2; `testing` provides an in-memory implementation.

use crate::ssh::error::SshResult;
use crate::ssh::types::ConnectTarget;
use async_trait::async_trait;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

// ── Abort signal ─────────────────────────────────────────────────────────────

type AbortHook = Box<dyn FnOnce() + Send>;

#[derive(Default)]
struct AbortInner {
    aborted: AtomicBool,
    hooks: Mutex<Vec<AbortHook>>,
}

/// One-shot cancellation handle shared between a caller and a connector.
#[derive(Clone, Default)]
pub struct AbortSignal {
    inner: Arc<AbortInner>,
}

impl AbortSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fire the signal and run every registered hook. Later calls do nothing.
    pub fn abort(&self) {
        if self.inner.aborted.swap(true, Ordering::SeqCst) {
            return;
        }
        let hooks = match self.inner.hooks.lock() {
            Ok(mut hooks) => std::mem::take(&mut *hooks),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        };
        for hook in hooks {
            hook();
        }
    }

    pub fn is_aborted(&self) -> bool {
        self.inner.aborted.load(Ordering::SeqCst)
    }

    /// Register a hook; it runs immediately if the signal already fired.
    pub fn on_abort(&self, hook: impl FnOnce() + Send + 'static) {
        {
            let mut hooks = match self.inner.hooks.lock() {
                Ok(hooks) => hooks,
                Err(poisoned) => poisoned.into_inner(),
            };
            if !self.is_aborted() {
                hooks.push(Box::new(hook));
                return;
            }
        }
        hook();
    }
}

impl fmt::Debug for AbortSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AbortSignal")
            .field("aborted", &self.is_aborted())
            .finish()
    }
}

// ── Connection ───────────────────────────────────────────────────────────────

#[async_trait]
pub trait Connector: Send + Sync {
    /// Open and authenticate a transport.
    ///
    /// Implementations must give up promptly once `abort` fires.
    async fn connect(
        &self,
        target: &ConnectTarget,
        abort: AbortSignal,
    ) -> SshResult<Arc<dyn Transport>>;
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Start a remote command.
    async fn exec(&self, command: &str) -> SshResult<Box<dyn ExecChannel>>;

    /// Open a file-protocol sub-channel on this transport.
    async fn open_file_protocol(&self) -> SshResult<Arc<dyn FileProtocol>>;

    /// Shut the transport down. Must be safe to call more than once.
    async fn disconnect(&self) -> SshResult<()>;

    /// False once the remote side closed or a fatal socket error occurred.
    fn is_alive(&self) -> bool;
}

// ── Command execution ────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecEvent {
    Stdout(Vec<u8>),
    Stderr(Vec<u8>),
    /// Terminal event; `None` when the channel closed without a status.
    Exit(Option<i32>),
}

#[async_trait]
pub trait ExecChannel: Send {
    /// Next chunk of output or the exit event. `None` after `Exit`.
    async fn next_event(&mut self) -> Option<SshResult<ExecEvent>>;

    /// Terminate the remote command and release the channel.
    async fn abort(&mut self);
}

// ── File protocol ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileAttrs {
    pub size: Option<u64>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub perm: Option<u32>,
    pub atime: Option<u64>,
    pub mtime: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteEntry {
    /// Final path component.
    pub name: String,
    pub attrs: FileAttrs,
}

#[async_trait]
pub trait FileProtocol: Send + Sync {
    /// Immediate children of `path`, excluding `.` and `..`.
    async fn read_dir(&self, path: &str) -> SshResult<Vec<RemoteEntry>>;
    async fn stat(&self, path: &str) -> SshResult<FileAttrs>;
    async fn open_read(&self, path: &str) -> SshResult<Box<dyn RemoteReader>>;
    /// Create or truncate `path` for writing.
    async fn open_write(&self, path: &str) -> SshResult<Box<dyn RemoteWriter>>;
    async fn remove_file(&self, path: &str) -> SshResult<()>;
    async fn remove_dir(&self, path: &str) -> SshResult<()>;
    async fn make_dir(&self, path: &str) -> SshResult<()>;
    async fn rename(&self, from: &str, to: &str) -> SshResult<()>;
    /// Release the sub-channel. Must be safe to call more than once.
    async fn close(&self) -> SshResult<()>;
}

#[async_trait]
pub trait RemoteReader: Send {
    /// Read up to `max` bytes; an empty vector means end of file.
    async fn read_chunk(&mut self, max: usize) -> SshResult<Vec<u8>>;
}

#[async_trait]
pub trait RemoteWriter: Send {
    async fn write_chunk(&mut self, data: &[u8]) -> SshResult<()>;
    /// Flush and close the remote handle.
    async fn finish(self: Box<Self>) -> SshResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn abort_runs_hooks_once() {
        let signal = AbortSignal::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        signal.on_abort(move || {
            h.fetch_add(1, Ordering::SeqCst);
        });

        signal.abort();
        signal.abort();
        assert!(signal.is_aborted());
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn late_hook_runs_immediately() {
        let signal = AbortSignal::new();
        signal.abort();

        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        signal.clone().on_abort(move || {
            h.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
