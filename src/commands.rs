// ── Tool commands ────────────────────────────────────────────────────────────
//
// Typed parameter / response shapes for every tool and thin wrappers that
// validate input, call the service and flatten errors to strings.

use crate::config::{decode_private_key, expand_home};
use crate::service::{ConnectRequest, SessionInfo, SshService};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sshmcp_sftp::sftp::{FileContent, FileEntry, FileStat, DEFAULT_READ_LIMIT};
use sshmcp_ssh::ssh::validation::{clamp_connect_timeout, clamp_exec_timeout, validate_command};
use sshmcp_ssh::ssh::{default_ssh_port, AuthMethod, CommandOutput, SessionSummary};
use std::path::{Path, PathBuf};

pub const TOOLS: &[&str] = &[
    "connect",
    "exec",
    "list_sessions",
    "session_info",
    "disconnect",
    "disconnect_all",
    "sftp_list",
    "sftp_upload",
    "sftp_download",
    "sftp_read",
    "sftp_write",
    "sftp_delete",
    "sftp_mkdir",
    "sftp_rename",
    "sftp_stat",
];

// ── Parameters ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct ConnectParams {
    pub host: String,
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    pub username: String,
    #[serde(default)]
    pub password: Option<String>,
    /// Raw PEM / OpenSSH text or base64 of it.
    #[serde(default)]
    pub private_key: Option<String>,
    #[serde(default)]
    pub private_key_path: Option<String>,
    #[serde(default)]
    pub passphrase: Option<String>,
    /// Execution timeout for this session, in ms.
    #[serde(default)]
    pub timeout: Option<u64>,
    #[serde(default)]
    pub connect_timeout: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SessionParams {
    #[serde(default)]
    pub session_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExecParams {
    #[serde(default)]
    pub session_id: Option<String>,
    pub command: String,
    #[serde(default)]
    pub timeout: Option<u64>,
}

fn root_path() -> String {
    "/".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct SftpListParams {
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default = "root_path")]
    pub path: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SftpPathParams {
    #[serde(default)]
    pub session_id: Option<String>,
    pub path: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SftpTransferParams {
    #[serde(default)]
    pub session_id: Option<String>,
    pub local_path: String,
    pub remote_path: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SftpWriteParams {
    #[serde(default)]
    pub session_id: Option<String>,
    pub path: String,
    pub content: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SftpDeleteParams {
    #[serde(default)]
    pub session_id: Option<String>,
    pub path: String,
    /// Accepted for compatibility; only empty directories are removed.
    #[serde(default)]
    pub recursive: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SftpRenameParams {
    #[serde(default)]
    pub session_id: Option<String>,
    pub old_path: String,
    pub new_path: String,
}

// ── Responses ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct ConnectResponse {
    pub session_id: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionListResponse {
    pub sessions: Vec<SessionSummary>,
    pub count: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct OperationResponse {
    pub success: bool,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct DisconnectAllResponse {
    pub success: bool,
    pub count: usize,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct TransferResponse {
    pub success: bool,
    pub size: u64,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct DirectoryListing {
    pub path: String,
    pub files: Vec<FileEntry>,
    pub count: usize,
}

fn ok(message: impl Into<String>) -> OperationResponse {
    OperationResponse {
        success: true,
        message: message.into(),
    }
}

fn sid(session_id: &Option<String>) -> Option<&str> {
    session_id.as_deref()
}

// ── Session commands ─────────────────────────────────────────────────────────

pub async fn connect(service: &SshService, params: ConnectParams) -> Result<ConnectResponse, String> {
    let auth = AuthMethod::from_parts(
        params.password,
        params.private_key.map(|k| decode_private_key(&k)),
        params
            .private_key_path
            .filter(|p| !p.trim().is_empty())
            .map(|p| expand_home(Path::new(p.trim()))),
        params.passphrase,
    )?;
    let request = ConnectRequest {
        host: params.host,
        port: params.port,
        username: params.username,
        auth,
        exec_timeout: params.timeout.map(clamp_exec_timeout),
        connect_timeout: params.connect_timeout.map(clamp_connect_timeout),
    };
    let outcome = service.connect(request).await?;
    Ok(ConnectResponse {
        session_id: outcome.session_id,
        message: outcome.message,
    })
}

pub async fn exec(service: &SshService, params: ExecParams) -> Result<CommandOutput, String> {
    let command = validate_command(&params.command)?;
    let timeout = params.timeout.map(clamp_exec_timeout);
    Ok(service
        .execute(sid(&params.session_id), &command, timeout)
        .await?)
}

pub fn list_sessions(service: &SshService) -> SessionListResponse {
    let sessions = service.list_sessions();
    SessionListResponse {
        count: sessions.len(),
        sessions,
    }
}

pub async fn session_info(service: &SshService, params: SessionParams) -> Result<SessionInfo, String> {
    Ok(service.session_info(sid(&params.session_id)).await?)
}

pub async fn disconnect(service: &SshService, params: SessionParams) -> Result<OperationResponse, String> {
    let id = service.disconnect(sid(&params.session_id)).await?;
    Ok(ok(format!("Disconnected session {}", id)))
}

pub async fn disconnect_all(service: &SshService) -> DisconnectAllResponse {
    let count = service.disconnect_all().await;
    DisconnectAllResponse {
        success: true,
        count,
        message: format!("Disconnected {} session(s)", count),
    }
}

// ── SFTP commands ────────────────────────────────────────────────────────────

pub async fn sftp_list(service: &SshService, params: SftpListParams) -> Result<DirectoryListing, String> {
    let files = service.sftp_list(sid(&params.session_id), &params.path).await?;
    Ok(DirectoryListing {
        path: params.path,
        count: files.len(),
        files,
    })
}

pub async fn sftp_upload(service: &SshService, params: SftpTransferParams) -> Result<TransferResponse, String> {
    let local = expand_home(&PathBuf::from(&params.local_path));
    let size = service
        .sftp_upload(sid(&params.session_id), &local, &params.remote_path)
        .await?;
    Ok(TransferResponse {
        success: true,
        size,
        message: format!("Uploaded {} to {}", params.local_path, params.remote_path),
    })
}

pub async fn sftp_download(service: &SshService, params: SftpTransferParams) -> Result<TransferResponse, String> {
    let local = expand_home(&PathBuf::from(&params.local_path));
    let size = service
        .sftp_download(sid(&params.session_id), &params.remote_path, &local)
        .await?;
    Ok(TransferResponse {
        success: true,
        size,
        message: format!("Downloaded {} to {}", params.remote_path, params.local_path),
    })
}

pub async fn sftp_read(service: &SshService, params: SftpPathParams) -> Result<FileContent, String> {
    Ok(service
        .sftp_read(sid(&params.session_id), &params.path, DEFAULT_READ_LIMIT)
        .await?)
}

pub async fn sftp_write(service: &SshService, params: SftpWriteParams) -> Result<TransferResponse, String> {
    let size = service
        .sftp_write(sid(&params.session_id), &params.path, &params.content)
        .await?;
    Ok(TransferResponse {
        success: true,
        size,
        message: format!("Wrote {} bytes to {}", size, params.path),
    })
}

pub async fn sftp_delete(service: &SshService, params: SftpDeleteParams) -> Result<OperationResponse, String> {
    let was_dir = service
        .sftp_delete(sid(&params.session_id), &params.path, params.recursive)
        .await?;
    let kind = if was_dir { "directory" } else { "file" };
    Ok(ok(format!("Deleted {} {}", kind, params.path)))
}

pub async fn sftp_mkdir(service: &SshService, params: SftpPathParams) -> Result<OperationResponse, String> {
    service
        .sftp_mkdir(sid(&params.session_id), &params.path)
        .await?;
    Ok(ok(format!("Created directory {}", params.path)))
}

pub async fn sftp_rename(service: &SshService, params: SftpRenameParams) -> Result<OperationResponse, String> {
    service
        .sftp_rename(sid(&params.session_id), &params.old_path, &params.new_path)
        .await?;
    Ok(ok(format!("Renamed {} to {}", params.old_path, params.new_path)))
}

pub async fn sftp_stat(service: &SshService, params: SftpPathParams) -> Result<FileStat, String> {
    Ok(service
        .sftp_stat(sid(&params.session_id), &params.path)
        .await?)
}

// ── Dispatch ─────────────────────────────────────────────────────────────────

fn parse<T: DeserializeOwned>(tool: &str, params: Value) -> Result<T, String> {
    let params = if params.is_null() { json!({}) } else { params };
    serde_json::from_value(params).map_err(|e| format!("Invalid parameters for {}: {}", tool, e))
}

fn to_value<T: Serialize>(value: T) -> Result<Value, String> {
    serde_json::to_value(value).map_err(|e| format!("Failed to serialise result: {}", e))
}

/// Route one tool call by name.
pub async fn dispatch(service: &SshService, tool: &str, params: Value) -> Result<Value, String> {
    match tool {
        "connect" => to_value(connect(service, parse(tool, params)?).await?),
        "exec" => to_value(exec(service, parse(tool, params)?).await?),
        "list_sessions" => to_value(list_sessions(service)),
        "session_info" => to_value(session_info(service, parse(tool, params)?).await?),
        "disconnect" => to_value(disconnect(service, parse(tool, params)?).await?),
        "disconnect_all" => to_value(disconnect_all(service).await),
        "sftp_list" => to_value(sftp_list(service, parse(tool, params)?).await?),
        "sftp_upload" => to_value(sftp_upload(service, parse(tool, params)?).await?),
        "sftp_download" => to_value(sftp_download(service, parse(tool, params)?).await?),
        "sftp_read" => to_value(sftp_read(service, parse(tool, params)?).await?),
        "sftp_write" => to_value(sftp_write(service, parse(tool, params)?).await?),
        "sftp_delete" => to_value(sftp_delete(service, parse(tool, params)?).await?),
        "sftp_mkdir" => to_value(sftp_mkdir(service, parse(tool, params)?).await?),
        "sftp_rename" => to_value(sftp_rename(service, parse(tool, params)?).await?),
        "sftp_stat" => to_value(sftp_stat(service, parse(tool, params)?).await?),
        other => Err(format!(
            "Unknown tool: {} (available: {})",
            other,
            TOOLS.join(", ")
        )),
    }
}

#[derive(Debug, Deserialize)]
struct ToolRequest {
    #[serde(default)]
    id: Value,
    tool: String,
    #[serde(default)]
    params: Value,
}

/// Handle one JSON-lines request and build its response object.
pub async fn handle_line(service: &SshService, line: &str) -> Value {
    let request: ToolRequest = match serde_json::from_str(line) {
        Ok(request) => request,
        Err(e) => {
            return json!({ "id": Value::Null, "error": format!("Invalid request: {}", e) });
        }
    };
    tracing::debug!(tool = %request.tool, "tool call");
    match dispatch(service, &request.tool, request.params).await {
        Ok(result) => json!({ "id": request.id, "result": result }),
        Err(error) => {
            tracing::debug!(tool = %request.tool, error = %error, "tool call failed");
            json!({ "id": request.id, "error": error })
        }
    }
}
