// ── Input validation & timeout clamping ──────────────────────────────────────

use crate::ssh::error::{SshError, SshResult};
use std::time::Duration;

pub const MAX_COMMAND_LENGTH: usize = 1_000;

pub const DEFAULT_EXEC_TIMEOUT_MS: u64 = 30_000;
pub const MIN_EXEC_TIMEOUT_MS: u64 = 1_000;
pub const MAX_EXEC_TIMEOUT_MS: u64 = 300_000;

pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 10_000;
pub const MIN_CONNECT_TIMEOUT_MS: u64 = 1_000;
pub const MAX_CONNECT_TIMEOUT_MS: u64 = 60_000;

/// Reject empty or over-long commands and return the trimmed command.
pub fn validate_command(command: &str) -> SshResult<String> {
    let trimmed = command.trim();
    if trimmed.is_empty() {
        return Err(SshError::validation("Command cannot be empty"));
    }
    let len = trimmed.chars().count();
    if len > MAX_COMMAND_LENGTH {
        return Err(SshError::validation(format!(
            "Command too long: {} characters (maximum {})",
            len, MAX_COMMAND_LENGTH
        )));
    }
    Ok(trimmed.to_string())
}

pub fn clamp_exec_timeout(ms: u64) -> Duration {
    Duration::from_millis(ms.clamp(MIN_EXEC_TIMEOUT_MS, MAX_EXEC_TIMEOUT_MS))
}

pub fn clamp_connect_timeout(ms: u64) -> Duration {
    Duration::from_millis(ms.clamp(MIN_CONNECT_TIMEOUT_MS, MAX_CONNECT_TIMEOUT_MS))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssh::SshErrorKind;

    #[test]
    fn rejects_blank_commands() {
        for cmd in ["", "   ", "\t\n"] {
            let err = validate_command(cmd).unwrap_err();
            assert_eq!(err.kind, SshErrorKind::Validation);
        }
    }

    #[test]
    fn trims_surrounding_whitespace() {
        assert_eq!(validate_command("  uname -a \n").unwrap(), "uname -a");
    }

    #[test]
    fn enforces_length_limit() {
        let ok = "x".repeat(MAX_COMMAND_LENGTH);
        assert!(validate_command(&ok).is_ok());

        let too_long = "x".repeat(MAX_COMMAND_LENGTH + 1);
        let err = validate_command(&too_long).unwrap_err();
        assert!(err.message.contains("1001"));
    }

    #[test]
    fn clamps_timeouts_into_range() {
        assert_eq!(clamp_exec_timeout(10), Duration::from_millis(1_000));
        assert_eq!(clamp_exec_timeout(45_000), Duration::from_millis(45_000));
        assert_eq!(clamp_exec_timeout(u64::MAX), Duration::from_millis(300_000));

        assert_eq!(clamp_connect_timeout(0), Duration::from_millis(1_000));
        assert_eq!(clamp_connect_timeout(90_000), Duration::from_millis(60_000));
    }
}
