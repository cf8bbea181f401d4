//! Process configuration read from the environment once at startup.

use crate::service::{ConnectRequest, ServiceConfig};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use sshmcp_ssh::ssh::validation::{
    clamp_connect_timeout, clamp_exec_timeout, DEFAULT_CONNECT_TIMEOUT_MS, DEFAULT_EXEC_TIMEOUT_MS,
};
use sshmcp_ssh::ssh::{default_ssh_port, AuthMethod, SshError, SshResult};
use std::path::{Path, PathBuf};

pub const ENV_HOST: &str = "SSH_HOST";
pub const ENV_PORT: &str = "SSH_PORT";
pub const ENV_USERNAME: &str = "SSH_USERNAME";
pub const ENV_PASSWORD: &str = "SSH_PASSWORD";
pub const ENV_PRIVATE_KEY: &str = "SSH_PRIVATE_KEY";
pub const ENV_PRIVATE_KEY_PATH: &str = "SSH_PRIVATE_KEY_PATH";
pub const ENV_PASSPHRASE: &str = "SSH_PASSPHRASE";
pub const ENV_EXEC_TIMEOUT_MS: &str = "SSH_EXEC_TIMEOUT_MS";
pub const ENV_CONNECT_TIMEOUT_MS: &str = "SSH_CONNECT_TIMEOUT_MS";
pub const ENV_LOG_FORMAT: &str = "SSHMCP_LOG_FORMAT";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvConfig {
    pub host: Option<String>,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Key material, already decoded from base64 when it was encoded.
    pub private_key: Option<String>,
    pub private_key_path: Option<PathBuf>,
    pub passphrase: Option<String>,
    pub exec_timeout_ms: u64,
    pub connect_timeout_ms: u64,
    pub log_json: bool,
}

impl Default for EnvConfig {
    fn default() -> Self {
        Self {
            host: None,
            port: default_ssh_port(),
            username: None,
            password: None,
            private_key: None,
            private_key_path: None,
            passphrase: None,
            exec_timeout_ms: DEFAULT_EXEC_TIMEOUT_MS,
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT_MS,
            log_json: false,
        }
    }
}

impl EnvConfig {
    pub fn from_env() -> SshResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup. Blank values count as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> SshResult<Self> {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let defaults = Self::default();

        Ok(Self {
            host: get(ENV_HOST),
            port: parse_number(ENV_PORT, get(ENV_PORT))?.unwrap_or(defaults.port),
            username: get(ENV_USERNAME),
            // passwords may legitimately carry surrounding spaces
            password: lookup(ENV_PASSWORD).filter(|v| !v.is_empty()),
            private_key: get(ENV_PRIVATE_KEY).map(|k| decode_private_key(&k)),
            private_key_path: get(ENV_PRIVATE_KEY_PATH).map(|p| expand_home(Path::new(&p))),
            passphrase: lookup(ENV_PASSPHRASE).filter(|v| !v.is_empty()),
            exec_timeout_ms: parse_number(ENV_EXEC_TIMEOUT_MS, get(ENV_EXEC_TIMEOUT_MS))?
                .unwrap_or(defaults.exec_timeout_ms),
            connect_timeout_ms: parse_number(ENV_CONNECT_TIMEOUT_MS, get(ENV_CONNECT_TIMEOUT_MS))?
                .unwrap_or(defaults.connect_timeout_ms),
            log_json: get(ENV_LOG_FORMAT).is_some_and(|f| f.eq_ignore_ascii_case("json")),
        })
    }

    /// Default timeouts for every session the service opens.
    pub fn service_config(&self) -> ServiceConfig {
        ServiceConfig {
            exec_timeout: clamp_exec_timeout(self.exec_timeout_ms),
            connect_timeout: clamp_connect_timeout(self.connect_timeout_ms),
        }
    }

    /// Preset connection, if host and username are both configured.
    ///
    /// Fails without touching the network when no auth method is set.
    pub fn connect_request(&self) -> SshResult<Option<ConnectRequest>> {
        let (host, username) = match (&self.host, &self.username) {
            (Some(h), Some(u)) => (h.clone(), u.clone()),
            _ => return Ok(None),
        };
        let auth = AuthMethod::from_parts(
            self.password.clone(),
            self.private_key.clone(),
            self.private_key_path.clone(),
            self.passphrase.clone(),
        )?;
        Ok(Some(ConnectRequest {
            host,
            port: self.port,
            username,
            auth,
            exec_timeout: None,
            connect_timeout: None,
        }))
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, raw: Option<String>) -> SshResult<Option<T>> {
    match raw {
        None => Ok(None),
        Some(v) => v
            .parse()
            .map(Some)
            .map_err(|_| SshError::invalid_config(format!("{} must be a number, got '{}'", key, v))),
    }
}

/// Accept a key either as raw PEM / OpenSSH text or base64 of it.
pub fn decode_private_key(raw: &str) -> String {
    let trimmed = raw.trim();
    if trimmed.contains("-----BEGIN") {
        return trimmed.to_string();
    }
    let compact: String = trimmed.chars().filter(|c| !c.is_whitespace()).collect();
    match STANDARD.decode(compact.as_bytes()) {
        Ok(bytes) => match String::from_utf8(bytes) {
            Ok(text) => text,
            Err(_) => trimmed.to_string(),
        },
        Err(_) => trimmed.to_string(),
    }
}

/// Expand a leading `~` to the user's home directory.
pub fn expand_home(path: &Path) -> PathBuf {
    let Ok(rest) = path.strip_prefix("~") else {
        return path.to_path_buf();
    };
    match dirs::home_dir() {
        Some(home) => home.join(rest),
        None => path.to_path_buf(),
    }
}
