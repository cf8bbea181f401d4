//! # sshmcp – SSH
//!
//! Session registry, transport sessions with connect / execution timeouts,
//! bounded output capture, and the libssh2-backed transport.

pub mod ssh;
