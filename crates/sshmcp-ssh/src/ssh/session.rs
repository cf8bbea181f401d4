// ── Transport session ────────────────────────────────────────────────────────
//
// One authenticated connection plus its connect/exec policy. Blocking work
// lives behind the `Transport` trait; this layer owns the state machine,
// the deadlines and the bounded capture of command output.

use crate::ssh::error::{SshError, SshErrorKind, SshResult};
use crate::ssh::output::BoundedText;
use crate::ssh::transport::{AbortSignal, Connector, ExecChannel, ExecEvent, Transport};
use crate::ssh::types::{CommandOutput, ConnectTarget};
use crate::ssh::validation::{DEFAULT_CONNECT_TIMEOUT_MS, DEFAULT_EXEC_TIMEOUT_MS};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;

/// Upper bound on tearing down a channel after its deadline passed.
pub const ABORT_GRACE: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
    Closed,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionOptions {
    pub connect_timeout: Duration,
    pub exec_timeout: Duration,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_millis(DEFAULT_CONNECT_TIMEOUT_MS),
            exec_timeout: Duration::from_millis(DEFAULT_EXEC_TIMEOUT_MS),
        }
    }
}

pub struct TransportSession {
    target: ConnectTarget,
    options: SessionOptions,
    state: Mutex<SessionState>,
    transport: Mutex<Option<Arc<dyn Transport>>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    match m.lock() {
        Ok(g) => g,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl TransportSession {
    pub fn new(target: ConnectTarget, options: SessionOptions) -> Self {
        Self {
            target,
            options,
            state: Mutex::new(SessionState::Disconnected),
            transport: Mutex::new(None),
        }
    }

    pub fn target(&self) -> &ConnectTarget {
        &self.target
    }

    pub fn options(&self) -> SessionOptions {
        self.options
    }

    /// Current state; a `Connected` session whose transport died reads as
    /// `Disconnected`.
    pub fn state(&self) -> SessionState {
        let state = *lock(&self.state);
        if state == SessionState::Connected && !self.transport_alive() {
            return SessionState::Disconnected;
        }
        state
    }

    pub fn is_connected(&self) -> bool {
        self.state() == SessionState::Connected
    }

    /// Live transport handle, if connected.
    pub fn transport(&self) -> Option<Arc<dyn Transport>> {
        if !self.is_connected() {
            return None;
        }
        lock(&self.transport).clone()
    }

    fn transport_alive(&self) -> bool {
        lock(&self.transport)
            .as_ref()
            .map(|t| t.is_alive())
            .unwrap_or(false)
    }

    fn set_state(&self, state: SessionState) {
        *lock(&self.state) = state;
    }

    // ── Connect ──────────────────────────────────────────────────────────

    pub async fn connect(&self, connector: &dyn Connector) -> SshResult<()> {
        {
            let mut state = lock(&self.state);
            match *state {
                SessionState::Connected if self.transport_alive() => return Ok(()),
                SessionState::Connecting => {
                    return Err(SshError::validation("Connection already in progress"));
                }
                SessionState::Closed => {
                    return Err(SshError::not_connected());
                }
                _ => *state = SessionState::Connecting,
            }
        }

        let timeout = self.options.connect_timeout;
        let abort = AbortSignal::new();
        tracing::info!(
            host = %self.target.host,
            port = self.target.port,
            username = %self.target.username,
            auth = self.target.auth.label(),
            "connecting"
        );

        let result = tokio::time::timeout(timeout, connector.connect(&self.target, abort.clone())).await;
        match result {
            Ok(Ok(transport)) => {
                *lock(&self.transport) = Some(transport);
                self.set_state(SessionState::Connected);
                tracing::info!(host = %self.target.host, "connected");
                Ok(())
            }
            Ok(Err(e)) => {
                self.set_state(SessionState::Failed);
                tracing::warn!(host = %self.target.host, error = %e, "connect failed");
                match e.kind {
                    SshErrorKind::InvalidConfig => Err(e),
                    _ => Err(SshError::connection_failed(e.message)),
                }
            }
            Err(_) => {
                abort.abort();
                self.set_state(SessionState::Failed);
                tracing::warn!(
                    host = %self.target.host,
                    timeout_ms = timeout.as_millis() as u64,
                    "connect timed out"
                );
                Err(SshError::connect_timeout(timeout.as_millis()))
            }
        }
    }

    // ── Execute ──────────────────────────────────────────────────────────

    /// Run `command`, capturing both streams up to the output budget.
    ///
    /// `timeout` overrides the session's execution timeout. On expiry the
    /// remote channel is aborted before the error is returned.
    pub async fn execute(&self, command: &str, timeout: Option<Duration>) -> SshResult<CommandOutput> {
        let transport = self.transport().ok_or_else(SshError::not_connected)?;
        let timeout = timeout.unwrap_or(self.options.exec_timeout);
        let deadline = Instant::now() + timeout;
        tracing::debug!(command, timeout_ms = timeout.as_millis() as u64, "exec");

        let mut channel = match tokio::time::timeout_at(deadline, transport.exec(command)).await {
            Ok(Ok(channel)) => channel,
            Ok(Err(e)) => return Err(e),
            Err(_) => return Err(SshError::exec_timeout(timeout.as_millis())),
        };

        let mut stdout = BoundedText::default();
        let mut stderr = BoundedText::default();
        let drained =
            tokio::time::timeout_at(deadline, drain_channel(channel.as_mut(), &mut stdout, &mut stderr))
                .await;

        let exit_code = match drained {
            Ok(Ok(code)) => code,
            Ok(Err(e)) => {
                abort_channel(channel.as_mut()).await;
                return Err(e);
            }
            Err(_) => {
                abort_channel(channel.as_mut()).await;
                tracing::warn!(command, timeout_ms = timeout.as_millis() as u64, "exec timed out");
                return Err(SshError::exec_timeout(timeout.as_millis()));
            }
        };

        let (stdout, out_cut) = stdout.finish();
        let (stderr, err_cut) = stderr.finish();
        Ok(CommandOutput {
            stdout,
            stderr,
            exit_code,
            truncated: out_cut || err_cut,
        })
    }

    // ── Close ────────────────────────────────────────────────────────────

    /// Disconnect the transport. A second call, or a call on a session that
    /// never connected, is a no-op.
    pub async fn close(&self) -> SshResult<()> {
        let transport = lock(&self.transport).take();
        {
            let mut state = lock(&self.state);
            if *state == SessionState::Connected || transport.is_some() {
                *state = SessionState::Closed;
            }
        }
        match transport {
            Some(t) => {
                tracing::info!(host = %self.target.host, "disconnecting");
                t.disconnect().await
            }
            None => Ok(()),
        }
    }
}

impl std::fmt::Debug for TransportSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportSession")
            .field("target", &self.target)
            .field("options", &self.options)
            .field("state", &self.state())
            .finish()
    }
}

async fn abort_channel(channel: &mut dyn ExecChannel) {
    if tokio::time::timeout(ABORT_GRACE, channel.abort()).await.is_err() {
        tracing::warn!(
            grace_ms = ABORT_GRACE.as_millis() as u64,
            "channel abort did not finish; abandoning it"
        );
    }
}

async fn drain_channel(
    channel: &mut dyn ExecChannel,
    stdout: &mut BoundedText,
    stderr: &mut BoundedText,
) -> SshResult<Option<i32>> {
    while let Some(event) = channel.next_event().await {
        match event? {
            ExecEvent::Stdout(bytes) => stdout.push(&bytes),
            ExecEvent::Stderr(bytes) => stderr.push(&bytes),
            ExecEvent::Exit(code) => return Ok(code),
        }
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssh::output::MAX_OUTPUT_CHARS;
    use crate::ssh::testing::{FakeCommand, FakeConnector, FakeServer};
    use crate::ssh::types::AuthMethod;

    fn target(password: &str) -> ConnectTarget {
        ConnectTarget {
            host: "fake.local".into(),
            port: 22,
            username: "tester".into(),
            auth: AuthMethod::Password {
                password: password.into(),
            },
        }
    }

    async fn connected(server: &FakeServer) -> TransportSession {
        let session = TransportSession::new(target("secret"), SessionOptions::default());
        session.connect(&FakeConnector::new(server.clone())).await.unwrap();
        session
    }

    #[tokio::test]
    async fn connect_then_echo() {
        let server = FakeServer::new().with_password("secret");
        let session = connected(&server).await;
        assert!(session.is_connected());

        let out = session.execute("echo hello", None).await.unwrap();
        assert_eq!(out.stdout, "hello\n");
        assert_eq!(out.exit_code, Some(0));
        assert!(!out.truncated);
    }

    #[tokio::test]
    async fn wrong_password_is_a_connection_error() {
        let server = FakeServer::new().with_password("secret");
        let session = TransportSession::new(target("wrong"), SessionOptions::default());
        let err = session.connect(&FakeConnector::new(server)).await.unwrap_err();
        assert_eq!(err.kind, SshErrorKind::ConnectionFailed);
        assert!(err.message.starts_with("Failed to connect:"));
        assert_eq!(session.state(), SessionState::Failed);
    }

    #[tokio::test]
    async fn connect_timeout_aborts_handshake() {
        let server = FakeServer::new().with_connect_delay(Duration::from_secs(5));
        let options = SessionOptions {
            connect_timeout: Duration::from_millis(100),
            ..SessionOptions::default()
        };
        let session = TransportSession::new(target("secret"), options);
        let err = session.connect(&FakeConnector::new(server.clone())).await.unwrap_err();
        assert!(err.is_timeout());
        assert!(err.message.contains("100ms"));
        assert_eq!(server.aborted_connects(), 1);
    }

    #[tokio::test]
    async fn exec_before_connect_is_rejected() {
        let session = TransportSession::new(target("secret"), SessionOptions::default());
        let err = session.execute("echo hi", None).await.unwrap_err();
        assert_eq!(err.kind, SshErrorKind::NotConnected);
        assert_eq!(err.message, "Not connected");
    }

    #[tokio::test]
    async fn exec_after_close_is_rejected() {
        let server = FakeServer::new();
        let session = connected(&server).await;
        session.close().await.unwrap();
        session.close().await.unwrap();
        assert_eq!(server.disconnects(), 1);

        let err = session.execute("echo hi", None).await.unwrap_err();
        assert_eq!(err.kind, SshErrorKind::NotConnected);
    }

    #[tokio::test]
    async fn remote_close_flips_liveness() {
        let server = FakeServer::new();
        let session = connected(&server).await;
        server.kill_connections();
        assert!(!session.is_connected());
        assert!(session.execute("echo hi", None).await.is_err());
    }

    #[tokio::test]
    async fn large_output_is_truncated_per_stream() {
        let server = FakeServer::new();
        server.set_command(
            "spam",
            FakeCommand::Output {
                stdout: "a".repeat(MAX_OUTPUT_CHARS + 10_000),
                stderr: "warn\n".into(),
                exit_code: Some(0),
            },
        );
        let session = connected(&server).await;
        let out = session.execute("spam", None).await.unwrap();
        assert!(out.truncated);
        assert_eq!(out.stdout.chars().count(), MAX_OUTPUT_CHARS);
        assert_eq!(out.stderr, "warn\n");
    }

    #[tokio::test]
    async fn exec_timeout_aborts_remote_command() {
        let server = FakeServer::new();
        server.set_command("sleep 10", FakeCommand::Hang);
        let session = connected(&server).await;

        let started = std::time::Instant::now();
        let err = session
            .execute("sleep 10", Some(Duration::from_millis(500)))
            .await
            .unwrap_err();
        let elapsed = started.elapsed();

        assert!(err.is_timeout());
        assert!(err.message.contains("500ms"));
        assert!(elapsed >= Duration::from_millis(450));
        assert!(elapsed < Duration::from_millis(1_500));
        assert_eq!(server.aborted_execs(), 1);
    }

    #[tokio::test]
    async fn stuck_abort_does_not_hold_the_timeout_error() {
        let server = FakeServer::new();
        server.set_command("cat /dev/zero", FakeCommand::Unkillable);
        let session = connected(&server).await;

        let started = std::time::Instant::now();
        let err = session
            .execute("cat /dev/zero", Some(Duration::from_millis(200)))
            .await
            .unwrap_err();

        assert!(err.is_timeout());
        assert!(started.elapsed() < Duration::from_millis(200) + ABORT_GRACE + Duration::from_millis(500));
        assert_eq!(server.aborted_execs(), 1);
    }

    #[tokio::test]
    async fn missing_exit_status_is_none() {
        let server = FakeServer::new();
        server.set_command(
            "kill -9 $$",
            FakeCommand::Output {
                stdout: String::new(),
                stderr: String::new(),
                exit_code: None,
            },
        );
        let session = connected(&server).await;
        let out = session.execute("kill -9 $$", None).await.unwrap();
        assert_eq!(out.exit_code, None);
    }
}
