// ── sshmcp-sftp / sftp module ─────────────────────────────────────────────────
//
//   • types        – entries, stats, file content, operation names
//   • permissions  – mode-bit decoding and "drwxr-xr-x" rendering
//   • channel      – the per-session transfer channel

pub mod types;
pub mod permissions;
pub mod channel;

pub use channel::{TransferChannel, DEFAULT_READ_LIMIT, TRANSFER_CHUNK_SIZE};
pub use permissions::format_permissions;
pub use types::*;
