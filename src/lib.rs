//! SSH session lifecycle and remote-operation engine.
//!
//! [`service::SshService`] owns the registry of live sessions and routes
//! command execution and SFTP work to them; [`commands`] exposes the tool
//! surface consumed by the stdio server in `main.rs`.

pub mod commands;
pub mod config;
pub mod service;

pub use config::EnvConfig;
pub use service::{ServiceConfig, SshService};
