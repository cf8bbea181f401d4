//! Error type for the session engine and the transfer layer.

use serde::{Deserialize, Serialize};
use std::fmt::Display;
use thiserror::Error;

/// Categorised SSH / SFTP error.
#[derive(Debug, Clone, Error, Serialize, Deserialize)]
#[error("{message}")]
pub struct SshError {
    pub kind: SshErrorKind,
    pub message: String,
    /// Session the failure relates to, if known.
    pub session_id: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SshErrorKind {
    /// Missing or contradictory configuration; raised before any network I/O.
    InvalidConfig,
    /// Caller-supplied input rejected (empty command, over-long command, …).
    Validation,
    /// TCP, handshake or authentication failure, or a lost connection.
    ConnectionFailed,
    /// Connect or execution deadline elapsed.
    Timeout,
    /// No session registered under the id.
    SessionNotFound,
    /// The session exists but its transport handle is gone.
    ClientNotFound,
    /// Operation attempted on a transport that is not connected.
    NotConnected,
    /// Transfer channel used before initialisation or after close.
    NotInitialized,
    /// A file operation failed.
    TransferFailed,
    /// Remote or local path does not exist.
    NotFound,
    /// Remote or local permission denied.
    PermissionDenied,
    /// Protocol-level failure reported by the transport.
    Protocol,
    /// Local I/O failure.
    Io,
}

pub type SshResult<T> = Result<T, SshError>;

// ── Construction helpers ─────────────────────────────────────────────

impl SshError {
    pub fn new(kind: SshErrorKind, msg: impl Into<String>) -> Self {
        Self {
            kind,
            message: msg.into(),
            session_id: None,
        }
    }

    pub fn with_session(mut self, id: impl Into<String>) -> Self {
        self.session_id = Some(id.into());
        self
    }

    pub fn invalid_config(msg: impl Into<String>) -> Self {
        Self::new(SshErrorKind::InvalidConfig, msg)
    }

    pub fn missing_auth() -> Self {
        Self::invalid_config(
            "At least one authentication method (password, private key, or private key path) is required",
        )
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::new(SshErrorKind::Validation, msg)
    }

    pub fn connection_failed(msg: impl Display) -> Self {
        Self::new(
            SshErrorKind::ConnectionFailed,
            format!("Failed to connect: {}", msg),
        )
    }

    pub fn connection_lost(msg: impl Display) -> Self {
        Self::new(SshErrorKind::ConnectionFailed, format!("Connection lost: {}", msg))
    }

    pub fn connect_timeout(timeout_ms: u128) -> Self {
        Self::new(
            SshErrorKind::Timeout,
            format!("Connection timeout after {}ms", timeout_ms),
        )
    }

    pub fn exec_timeout(timeout_ms: u128) -> Self {
        Self::new(
            SshErrorKind::Timeout,
            format!("Command execution timeout after {}ms", timeout_ms),
        )
    }

    pub fn session_not_found(id: &str) -> Self {
        Self::new(
            SshErrorKind::SessionNotFound,
            format!("Session not found: {}", id),
        )
        .with_session(id)
    }

    pub fn client_not_found(id: &str) -> Self {
        Self::new(
            SshErrorKind::ClientNotFound,
            format!("Client not found for session: {}", id),
        )
        .with_session(id)
    }

    pub fn no_default_session() -> Self {
        Self::invalid_config(
            "No default session available: connect first with `connect` and pass its session_id, \
             or configure a default connection (SSH_HOST, SSH_USERNAME and an auth method)",
        )
    }

    pub fn not_connected() -> Self {
        Self::new(SshErrorKind::NotConnected, "Not connected")
    }

    pub fn not_initialized() -> Self {
        Self::new(SshErrorKind::NotInitialized, "SFTP channel not initialized")
    }

    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::new(SshErrorKind::Protocol, msg)
    }

    pub fn io(msg: impl Into<String>) -> Self {
        Self::new(SshErrorKind::Io, msg)
    }

    /// Wrap a failure with the file operation that triggered it.
    ///
    /// `NotFound` and `PermissionDenied` keep their kind so callers can
    /// still branch on them; everything else becomes `TransferFailed`.
    pub fn in_operation(self, operation: impl Display, path: &str) -> Self {
        let kind = match self.kind {
            SshErrorKind::NotFound
            | SshErrorKind::PermissionDenied
            | SshErrorKind::NotInitialized
            | SshErrorKind::ConnectionFailed => self.kind,
            _ => SshErrorKind::TransferFailed,
        };
        Self {
            kind,
            message: format!("SFTP {} failed for '{}': {}", operation, path, self.message),
            session_id: self.session_id,
        }
    }

    pub fn is_timeout(&self) -> bool {
        self.kind == SshErrorKind::Timeout
    }

    pub fn is_not_found(&self) -> bool {
        self.kind == SshErrorKind::NotFound
    }
}

// ── Conversions ──────────────────────────────────────────────────────

// libssh2 error codes (session scope).
const LIBSSH2_ERROR_SOCKET_SEND: i32 = -7;
const LIBSSH2_ERROR_TIMEOUT: i32 = -9;
const LIBSSH2_ERROR_SOCKET_DISCONNECT: i32 = -13;
const LIBSSH2_ERROR_SOCKET_RECV: i32 = -43;

// SFTP status codes (draft-ietf-secsh-filexfer-02).
const SSH_FX_NO_SUCH_FILE: i32 = 2;
const SSH_FX_PERMISSION_DENIED: i32 = 3;
const SSH_FX_NO_SUCH_PATH: i32 = 10;

impl From<ssh2::Error> for SshError {
    fn from(e: ssh2::Error) -> Self {
        match e.code() {
            ssh2::ErrorCode::SFTP(SSH_FX_NO_SUCH_FILE) | ssh2::ErrorCode::SFTP(SSH_FX_NO_SUCH_PATH) => {
                Self::new(SshErrorKind::NotFound, e.message().to_string())
            }
            ssh2::ErrorCode::SFTP(SSH_FX_PERMISSION_DENIED) => {
                Self::new(SshErrorKind::PermissionDenied, e.message().to_string())
            }
            ssh2::ErrorCode::Session(
                LIBSSH2_ERROR_SOCKET_SEND
                | LIBSSH2_ERROR_SOCKET_DISCONNECT
                | LIBSSH2_ERROR_SOCKET_RECV,
            ) => Self::connection_lost(e.message()),
            ssh2::ErrorCode::Session(LIBSSH2_ERROR_TIMEOUT) => {
                Self::new(SshErrorKind::Timeout, e.message().to_string())
            }
            _ => Self::protocol(e.to_string()),
        }
    }
}

impl From<std::io::Error> for SshError {
    fn from(e: std::io::Error) -> Self {
        use std::io::ErrorKind;
        match e.kind() {
            ErrorKind::TimedOut => Self::new(SshErrorKind::Timeout, format!("I/O timeout: {}", e)),
            ErrorKind::NotFound => Self::new(SshErrorKind::NotFound, e.to_string()),
            ErrorKind::PermissionDenied => Self::new(SshErrorKind::PermissionDenied, e.to_string()),
            ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::BrokenPipe
            | ErrorKind::UnexpectedEof => Self::connection_lost(e),
            _ => Self::io(e.to_string()),
        }
    }
}

impl From<tokio::task::JoinError> for SshError {
    fn from(e: tokio::task::JoinError) -> Self {
        Self::io(format!("Blocking SSH task failed: {}", e))
    }
}

impl From<SshError> for String {
    fn from(e: SshError) -> String {
        e.message
    }
}
