// ── sshmcp-ssh / ssh module ───────────────────────────────────────────────────
//
//   • error       – categorised error type shared with the SFTP crate
//   • types       – auth methods, connect targets, command output, summaries
//   • registry    – in-memory session table (id → record)
//   • transport   – capability traits the engine drives
//   • backend     – libssh2 implementation of those traits
//   • session     – transport session: connect / execute / close
//   • output      – character-bounded stream capture
//   • validation  – command checks and timeout clamping

pub mod error;
pub mod types;
pub mod registry;
pub mod transport;
pub mod backend;
pub mod session;
pub mod output;
pub mod validation;

#[cfg(any(test, feature = "test-support"))]
pub mod testing;

pub use backend::Ssh2Connector;
pub use error::{SshError, SshErrorKind, SshResult};
pub use output::{BoundedText, MAX_OUTPUT_CHARS};
pub use registry::{SessionRecord, SessionRegistry};
pub use session::{SessionOptions, SessionState, TransportSession};
pub use transport::*;
pub use types::*;
