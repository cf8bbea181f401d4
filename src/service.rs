// ── SSH session service ──────────────────────────────────────────────────────
//
// Owns every live session, resolves the effective session for a request,
// materialises the SFTP channel on first use and tears everything down in
// order: transfer channel, then transport, then the registry entry.

use crate::config::EnvConfig;
use futures::future::join_all;
use serde::Serialize;
use sshmcp_sftp::sftp::{FileContent, FileEntry, FileStat, TransferChannel};
use sshmcp_ssh::ssh::validation::{DEFAULT_CONNECT_TIMEOUT_MS, DEFAULT_EXEC_TIMEOUT_MS};
use sshmcp_ssh::ssh::{
    AuthMethod, CommandOutput, ConnectTarget, Connector, SessionOptions, SessionRegistry,
    SessionState, SessionSummary, SshError, SshResult, TransportSession,
};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServiceConfig {
    pub exec_timeout: Duration,
    pub connect_timeout: Duration,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            exec_timeout: Duration::from_millis(DEFAULT_EXEC_TIMEOUT_MS),
            connect_timeout: Duration::from_millis(DEFAULT_CONNECT_TIMEOUT_MS),
        }
    }
}

/// Everything needed to open one session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectRequest {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub auth: AuthMethod,
    /// Per-session overrides of the service defaults.
    pub exec_timeout: Option<Duration>,
    pub connect_timeout: Option<Duration>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectOutcome {
    pub session_id: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionInfo {
    #[serde(flatten)]
    pub summary: SessionSummary,
    pub state: SessionState,
    pub connected: bool,
    pub sftp_open: bool,
    pub is_default: bool,
}

/// Live handles of one session. The transfer channel is created lazily
/// and always closed before the transport; once `close` starts no new
/// channel is opened.
pub struct SessionHandles {
    transport: Arc<TransportSession>,
    transfer: tokio::sync::Mutex<Option<Arc<TransferChannel>>>,
    closing: AtomicBool,
}

impl SessionHandles {
    fn new(transport: Arc<TransportSession>) -> Self {
        Self {
            transport,
            transfer: tokio::sync::Mutex::new(None),
            closing: AtomicBool::new(false),
        }
    }

    async fn transfer_channel(&self, session_id: &str) -> SshResult<Arc<TransferChannel>> {
        let mut slot = self.transfer.lock().await;
        if self.closing.load(Ordering::SeqCst) {
            return Err(SshError::client_not_found(session_id));
        }
        if !self.transport.is_connected() {
            if let Some(stale) = slot.take() {
                if let Err(e) = stale.close().await {
                    tracing::debug!(session_id, error = %e, "closing stale sftp channel failed");
                }
            }
            return Err(SshError::client_not_found(session_id));
        }
        if let Some(channel) = slot.as_ref() {
            if channel.is_open() {
                return Ok(channel.clone());
            }
        }
        let channel = Arc::new(TransferChannel::open(&self.transport).await?);
        *slot = Some(channel.clone());
        Ok(channel)
    }

    async fn sftp_open(&self) -> bool {
        self.transfer
            .lock()
            .await
            .as_ref()
            .is_some_and(|c| c.is_open())
    }

    async fn close(&self) -> SshResult<()> {
        self.closing.store(true, Ordering::SeqCst);
        // waits for any in-flight channel open to land in the slot
        let channel = self.transfer.lock().await.take();
        let transfer = match channel {
            Some(channel) => channel.close().await,
            None => Ok(()),
        };
        let transport = self.transport.close().await;
        transfer.and(transport)
    }
}

pub struct SshService {
    connector: Arc<dyn Connector>,
    config: ServiceConfig,
    registry: Mutex<SessionRegistry<Arc<SessionHandles>>>,
    default_session: Mutex<Option<String>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    match m.lock() {
        Ok(g) => g,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl SshService {
    pub fn new(connector: Arc<dyn Connector>, config: ServiceConfig) -> Self {
        Self {
            connector,
            config,
            registry: Mutex::new(SessionRegistry::new()),
            default_session: Mutex::new(None),
        }
    }

    pub fn config(&self) -> ServiceConfig {
        self.config
    }

    // ── Session lifecycle ────────────────────────────────────────────────

    pub async fn connect(&self, request: ConnectRequest) -> SshResult<ConnectOutcome> {
        let options = SessionOptions {
            connect_timeout: request.connect_timeout.unwrap_or(self.config.connect_timeout),
            exec_timeout: request.exec_timeout.unwrap_or(self.config.exec_timeout),
        };
        let target = ConnectTarget {
            host: request.host,
            port: request.port,
            username: request.username,
            auth: request.auth,
        };
        let session = Arc::new(TransportSession::new(target.clone(), options));
        session.connect(self.connector.as_ref()).await?;

        let session_id = lock(&self.registry)
            .create(
                target.host.clone(),
                target.port,
                target.username.clone(),
                Arc::new(SessionHandles::new(session)),
            )
            .session_id
            .clone();

        tracing::info!(session_id = %session_id, host = %target.host, "session opened");
        Ok(ConnectOutcome {
            message: format!(
                "Connected to {}@{}:{}",
                target.username, target.host, target.port
            ),
            session_id,
        })
    }

    /// Connect with the preset parameters and make that session the
    /// default. Returns `None` when no preset is configured.
    pub async fn auto_connect(&self, env: &EnvConfig) -> SshResult<Option<String>> {
        let Some(request) = env.connect_request()? else {
            return Ok(None);
        };
        let outcome = self.connect(request).await?;
        self.set_default_session(Some(outcome.session_id.clone()));
        Ok(Some(outcome.session_id))
    }

    pub fn default_session_id(&self) -> Option<String> {
        lock(&self.default_session).clone()
    }

    pub fn set_default_session(&self, session_id: Option<String>) {
        *lock(&self.default_session) = session_id;
    }

    /// Explicit id if given, else the default session.
    pub fn effective_id(&self, session_id: Option<&str>) -> SshResult<String> {
        match session_id.filter(|id| !id.is_empty()) {
            Some(id) => Ok(id.to_string()),
            None => self
                .default_session_id()
                .ok_or_else(SshError::no_default_session),
        }
    }

    /// Look up a session's handles and mark it as used.
    fn handles(&self, session_id: &str) -> SshResult<Arc<SessionHandles>> {
        let mut registry = lock(&self.registry);
        let handles = registry
            .get(session_id)
            .map(|record| record.handle.clone())
            .ok_or_else(|| SshError::session_not_found(session_id))?;
        registry.touch(session_id);
        Ok(handles)
    }

    async fn transfer(&self, session_id: Option<&str>) -> SshResult<Arc<TransferChannel>> {
        let id = self.effective_id(session_id)?;
        let handles = self.handles(&id)?;
        handles
            .transfer_channel(&id)
            .await
            .map_err(|e| e.with_session(&id))
    }

    pub fn list_sessions(&self) -> Vec<SessionSummary> {
        lock(&self.registry).list()
    }

    pub fn session_count(&self) -> usize {
        lock(&self.registry).len()
    }

    pub async fn session_info(&self, session_id: Option<&str>) -> SshResult<SessionInfo> {
        let id = self.effective_id(session_id)?;
        let (summary, handles) = {
            let registry = lock(&self.registry);
            let record = registry
                .get(&id)
                .ok_or_else(|| SshError::session_not_found(&id))?;
            (record.summary(), record.handle.clone())
        };
        Ok(SessionInfo {
            summary,
            state: handles.transport.state(),
            connected: handles.transport.is_connected(),
            sftp_open: handles.sftp_open().await,
            is_default: self.default_session_id().as_deref() == Some(id.as_str()),
        })
    }

    /// Close one session and forget it. Returns the id that was closed.
    pub async fn disconnect(&self, session_id: Option<&str>) -> SshResult<String> {
        let id = self.effective_id(session_id)?;
        let handles = lock(&self.registry)
            .remove(&id)
            .map(|record| record.handle)
            .ok_or_else(|| SshError::session_not_found(&id))?;

        let closed = handles.close().await;
        {
            let mut default = lock(&self.default_session);
            if default.as_deref() == Some(id.as_str()) {
                *default = None;
            }
        }
        tracing::info!(session_id = %id, "session closed");
        closed.map_err(|e| e.with_session(&id))?;
        Ok(id)
    }

    /// Close every session concurrently. Individual failures are logged
    /// and do not stop the others. Returns how many sessions were closed.
    pub async fn disconnect_all(&self) -> usize {
        let drained: Vec<(String, Arc<SessionHandles>)> = {
            let mut registry = lock(&self.registry);
            registry
                .ids()
                .into_iter()
                .filter_map(|id| registry.remove(&id).map(|record| (id, record.handle)))
                .collect()
        };
        self.set_default_session(None);

        let count = drained.len();
        join_all(drained.into_iter().map(|(id, handles)| async move {
            if let Err(e) = handles.close().await {
                tracing::warn!(session_id = %id, error = %e, "error while closing session");
            }
        }))
        .await;

        if count > 0 {
            tracing::info!(count, "all sessions closed");
        }
        count
    }

    /// Shutdown hook; same as `disconnect_all`.
    pub async fn cleanup(&self) -> usize {
        self.disconnect_all().await
    }

    // ── Remote execution ─────────────────────────────────────────────────

    pub async fn execute(
        &self,
        session_id: Option<&str>,
        command: &str,
        timeout: Option<Duration>,
    ) -> SshResult<CommandOutput> {
        let id = self.effective_id(session_id)?;
        let handles = self.handles(&id)?;
        handles
            .transport
            .execute(command, timeout)
            .await
            .map_err(|e| e.with_session(&id))
    }

    // ── SFTP ─────────────────────────────────────────────────────────────

    pub async fn sftp_list(&self, session_id: Option<&str>, path: &str) -> SshResult<Vec<FileEntry>> {
        self.transfer(session_id).await?.list_directory(path).await
    }

    pub async fn sftp_upload(
        &self,
        session_id: Option<&str>,
        local_path: &Path,
        remote_path: &str,
    ) -> SshResult<u64> {
        self.transfer(session_id)
            .await?
            .upload_file(local_path, remote_path)
            .await
    }

    pub async fn sftp_download(
        &self,
        session_id: Option<&str>,
        remote_path: &str,
        local_path: &Path,
    ) -> SshResult<u64> {
        self.transfer(session_id)
            .await?
            .download_file(remote_path, local_path)
            .await
    }

    pub async fn sftp_read(
        &self,
        session_id: Option<&str>,
        path: &str,
        limit: usize,
    ) -> SshResult<FileContent> {
        self.transfer(session_id).await?.read_file(path, limit).await
    }

    pub async fn sftp_write(
        &self,
        session_id: Option<&str>,
        path: &str,
        content: &str,
    ) -> SshResult<u64> {
        self.transfer(session_id)
            .await?
            .write_file(path, content)
            .await
    }

    /// Delete a file or an empty directory, whichever `path` is.
    ///
    /// The type check and the removal are separate round trips, so a
    /// concurrent change on the server between the two is not detected.
    /// Returns true when a directory was removed.
    pub async fn sftp_delete(
        &self,
        session_id: Option<&str>,
        path: &str,
        recursive: bool,
    ) -> SshResult<bool> {
        if recursive {
            tracing::debug!(path, "recursive delete requested; removing only empty directories");
        }
        let channel = self.transfer(session_id).await?;
        let stat = channel.stat(path).await?;
        if stat.is_directory {
            channel.delete_directory(path).await?;
        } else {
            channel.delete_file(path).await?;
        }
        Ok(stat.is_directory)
    }

    pub async fn sftp_mkdir(&self, session_id: Option<&str>, path: &str) -> SshResult<()> {
        self.transfer(session_id).await?.create_directory(path).await
    }

    pub async fn sftp_rename(
        &self,
        session_id: Option<&str>,
        old_path: &str,
        new_path: &str,
    ) -> SshResult<()> {
        self.transfer(session_id)
            .await?
            .rename(old_path, new_path)
            .await
    }

    pub async fn sftp_stat(&self, session_id: Option<&str>, path: &str) -> SshResult<FileStat> {
        self.transfer(session_id).await?.stat(path).await
    }

    pub async fn sftp_exists(&self, session_id: Option<&str>, path: &str) -> SshResult<bool> {
        self.transfer(session_id).await?.exists(path).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sshmcp_sftp::sftp::DEFAULT_READ_LIMIT;
    use sshmcp_ssh::ssh::testing::{FakeConnector, FakeServer};
    use sshmcp_ssh::ssh::SshErrorKind;
    use std::collections::HashSet;

    fn service(server: &FakeServer) -> SshService {
        SshService::new(
            Arc::new(FakeConnector::new(server.clone())),
            ServiceConfig::default(),
        )
    }

    fn request(password: &str) -> ConnectRequest {
        ConnectRequest {
            host: "fake.local".into(),
            port: 22,
            username: "tester".into(),
            auth: AuthMethod::Password {
                password: password.into(),
            },
            exec_timeout: None,
            connect_timeout: None,
        }
    }

    async fn connect(svc: &SshService) -> String {
        svc.connect(request("pw")).await.unwrap().session_id
    }

    #[tokio::test]
    async fn connect_issues_unique_ids() {
        let server = FakeServer::new();
        let svc = service(&server);
        let mut ids = HashSet::new();
        for _ in 0..10 {
            assert!(ids.insert(connect(&svc).await));
        }
        assert_eq!(svc.list_sessions().len(), 10);
    }

    #[tokio::test]
    async fn failed_connect_registers_nothing() {
        let server = FakeServer::new().with_password("right");
        let svc = service(&server);
        let err = svc.connect(request("wrong")).await.unwrap_err();
        assert_eq!(err.kind, SshErrorKind::ConnectionFailed);
        assert_eq!(svc.session_count(), 0);
    }

    #[tokio::test]
    async fn execute_touches_the_session() {
        let server = FakeServer::new();
        let svc = service(&server);
        let id = connect(&svc).await;
        assert!(svc.list_sessions()[0].last_used_at.is_none());

        let out = svc.execute(Some(&id), "echo hello", None).await.unwrap();
        assert_eq!(out.stdout, "hello\n");
        assert_eq!(out.exit_code, Some(0));
        assert!(svc.list_sessions()[0].last_used_at.is_some());
    }

    #[tokio::test]
    async fn unknown_session_is_reported_with_its_id() {
        let server = FakeServer::new();
        let svc = service(&server);
        let err = svc.execute(Some("nope"), "echo hi", None).await.unwrap_err();
        assert_eq!(err.kind, SshErrorKind::SessionNotFound);
        assert_eq!(err.message, "Session not found: nope");

        let err = svc.disconnect(Some("nope")).await.unwrap_err();
        assert_eq!(err.message, "Session not found: nope");
    }

    #[tokio::test]
    async fn missing_default_names_both_remedies() {
        let server = FakeServer::new();
        let svc = service(&server);
        let err = svc.execute(None, "echo hi", None).await.unwrap_err();
        assert!(err.message.starts_with("No default session available"));
        assert!(err.message.contains("connect"));
        assert!(err.message.contains("SSH_HOST"));
    }

    #[tokio::test]
    async fn auto_connect_sets_default_and_disconnect_clears_it() {
        let server = FakeServer::new();
        let svc = service(&server);
        let env = EnvConfig {
            host: Some("fake.local".into()),
            username: Some("tester".into()),
            password: Some("pw".into()),
            ..EnvConfig::default()
        };
        let id = svc.auto_connect(&env).await.unwrap().unwrap();
        assert_eq!(svc.default_session_id().as_deref(), Some(id.as_str()));

        let out = svc.execute(None, "echo via-default", None).await.unwrap();
        assert_eq!(out.stdout, "via-default\n");

        assert_eq!(svc.disconnect(None).await.unwrap(), id);
        assert!(svc.default_session_id().is_none());
        assert_eq!(svc.session_count(), 0);
        let err = svc.execute(None, "echo hi", None).await.unwrap_err();
        assert!(err.message.contains("No default session available"));
    }

    #[tokio::test]
    async fn auto_connect_without_preset_does_nothing() {
        let server = FakeServer::new();
        let svc = service(&server);
        assert!(svc.auto_connect(&EnvConfig::default()).await.unwrap().is_none());
        assert_eq!(server.connect_attempts(), 0);
    }

    #[tokio::test]
    async fn auto_connect_without_auth_never_dials() {
        let server = FakeServer::new();
        let svc = service(&server);
        let env = EnvConfig {
            host: Some("fake.local".into()),
            username: Some("tester".into()),
            ..EnvConfig::default()
        };
        let err = svc.auto_connect(&env).await.unwrap_err();
        assert_eq!(err.kind, SshErrorKind::InvalidConfig);
        assert_eq!(server.connect_attempts(), 0);
    }

    #[tokio::test]
    async fn disconnect_closes_transfer_then_transport() {
        let server = FakeServer::new();
        let svc = service(&server);
        let id = connect(&svc).await;
        svc.sftp_list(Some(&id), "/").await.unwrap();

        svc.disconnect(Some(&id)).await.unwrap();
        assert_eq!(server.disconnects(), 1);
        assert_eq!(server.events(), ["sftp_close#1", "disconnect#1"]);
        let err = svc.sftp_list(Some(&id), "/").await.unwrap_err();
        assert_eq!(err.kind, SshErrorKind::SessionNotFound);
    }

    #[tokio::test]
    async fn sftp_during_disconnect_opens_no_new_channel() {
        let server = FakeServer::new().with_sftp_close_delay(Duration::from_millis(100));
        let svc = service(&server);
        let id = connect(&svc).await;
        svc.sftp_list(Some(&id), "/").await.unwrap();

        let (closed, listed) = tokio::join!(svc.disconnect(Some(&id)), async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            let listed_ids: Vec<String> =
                svc.list_sessions().into_iter().map(|s| s.session_id).collect();
            (listed_ids, svc.sftp_list(Some(&id), "/").await)
        });

        assert_eq!(closed.unwrap(), id);
        let (listed_ids, mid_close) = listed;
        assert!(listed_ids.is_empty());
        assert_eq!(mid_close.unwrap_err().kind, SshErrorKind::SessionNotFound);
        assert_eq!(server.file_protocols_opened(), 1);
        assert_eq!(server.file_protocols_closed(), 1);
        assert_eq!(server.events(), ["sftp_close#1", "disconnect#1"]);
    }

    #[tokio::test]
    async fn closing_handles_refuse_new_channels() {
        let server = FakeServer::new();
        let session = Arc::new(TransportSession::new(
            ConnectTarget {
                host: "fake.local".into(),
                port: 22,
                username: "tester".into(),
                auth: AuthMethod::Password {
                    password: "pw".into(),
                },
            },
            SessionOptions::default(),
        ));
        session
            .connect(&FakeConnector::new(server.clone()))
            .await
            .unwrap();
        let handles = SessionHandles::new(session);

        handles.close().await.unwrap();
        let err = handles.transfer_channel("s-1").await.unwrap_err();
        assert_eq!(err.kind, SshErrorKind::ClientNotFound);
        assert_eq!(server.file_protocols_opened(), 0);
    }

    #[tokio::test]
    async fn cleanup_empties_registry_even_when_close_fails() {
        let server = FakeServer::new().with_failing_disconnect();
        let svc = service(&server);
        for _ in 0..4 {
            connect(&svc).await;
        }
        let first = svc.list_sessions()[0].session_id.clone();
        svc.set_default_session(Some(first));

        assert_eq!(svc.cleanup().await, 4);
        assert_eq!(svc.session_count(), 0);
        assert!(svc.default_session_id().is_none());
        assert_eq!(server.disconnects(), 4);
        assert_eq!(svc.cleanup().await, 0);
    }

    #[tokio::test]
    async fn cleanup_closes_each_transfer_before_its_transport() {
        let server = FakeServer::new();
        let svc = service(&server);
        for _ in 0..3 {
            let id = connect(&svc).await;
            svc.sftp_list(Some(&id), "/").await.unwrap();
        }

        assert_eq!(svc.cleanup().await, 3);
        let events = server.events();
        assert_eq!(events.len(), 6);
        for conn in 1..=3 {
            let pos = |name: &str| {
                events
                    .iter()
                    .position(|e| *e == format!("{}#{}", name, conn))
                    .unwrap()
            };
            assert!(pos("sftp_close") < pos("disconnect"));
        }
    }

    #[tokio::test]
    async fn transfer_channel_is_created_once_and_reused() {
        let server = FakeServer::new();
        let svc = service(&server);
        let id = connect(&svc).await;

        svc.sftp_mkdir(Some(&id), "/data").await.unwrap();
        svc.sftp_write(Some(&id), "/data/a.txt", "alpha").await.unwrap();
        let read = svc
            .sftp_read(Some(&id), "/data/a.txt", DEFAULT_READ_LIMIT)
            .await
            .unwrap();
        assert_eq!(read.content, "alpha");
        assert_eq!(server.file_protocols_opened(), 1);

        let info = svc.session_info(Some(&id)).await.unwrap();
        assert!(info.sftp_open);
        assert!(info.connected);
        assert!(!info.is_default);
    }

    #[tokio::test]
    async fn delete_picks_file_or_directory_from_stat() {
        let server = FakeServer::new();
        server.add_dir("/tmp");
        server.add_file("/tmp/f", "x");
        server.add_dir("/tmp/empty");
        server.add_dir("/tmp/full");
        server.add_file("/tmp/full/keep", "k");
        let svc = service(&server);
        let id = connect(&svc).await;

        assert!(!svc.sftp_delete(Some(&id), "/tmp/f", false).await.unwrap());
        assert!(svc.sftp_delete(Some(&id), "/tmp/empty", true).await.unwrap());
        assert!(!server.exists("/tmp/f"));
        assert!(!server.exists("/tmp/empty"));

        // recursive is ignored: non-empty directories stay
        let err = svc.sftp_delete(Some(&id), "/tmp/full", true).await.unwrap_err();
        assert!(err.message.contains("SFTP delete failed for '/tmp/full'"));
        assert!(server.exists("/tmp/full/keep"));
    }

    #[tokio::test]
    async fn dead_transport_reports_missing_client() {
        let server = FakeServer::new();
        let svc = service(&server);
        let id = connect(&svc).await;
        server.kill_connections();

        let err = svc.sftp_stat(Some(&id), "/").await.unwrap_err();
        assert_eq!(err.kind, SshErrorKind::ClientNotFound);
        assert!(err.message.contains(&id));

        let err = svc.execute(Some(&id), "echo hi", None).await.unwrap_err();
        assert_eq!(err.kind, SshErrorKind::NotConnected);

        svc.disconnect(Some(&id)).await.unwrap();
        assert_eq!(svc.session_count(), 0);
    }

    #[tokio::test]
    async fn open_channel_is_dropped_when_transport_dies() {
        let server = FakeServer::new();
        let svc = service(&server);
        let id = connect(&svc).await;
        svc.sftp_list(Some(&id), "/").await.unwrap();
        server.kill_connections();

        let err = svc.sftp_stat(Some(&id), "/").await.unwrap_err();
        assert_eq!(err.kind, SshErrorKind::ClientNotFound);
        assert_eq!(err.message, format!("Client not found for session: {}", id));
        assert_eq!(server.file_protocols_closed(), 1);
        assert!(!svc.session_info(Some(&id)).await.unwrap().sftp_open);
    }

    #[tokio::test]
    async fn per_session_exec_timeout_override() {
        let server = FakeServer::new();
        server.set_command("sleep 5", sshmcp_ssh::ssh::testing::FakeCommand::Hang);
        let svc = service(&server);
        let mut req = request("pw");
        req.exec_timeout = Some(Duration::from_millis(200));
        let id = svc.connect(req).await.unwrap().session_id;

        let err = svc.execute(Some(&id), "sleep 5", None).await.unwrap_err();
        assert!(err.is_timeout());
        assert!(err.message.contains("200ms"));
        assert_eq!(err.session_id.as_deref(), Some(id.as_str()));
    }
}
