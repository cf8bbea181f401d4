//! # sshmcp – SFTP
//!
//! File-transfer channel layered on an established SSH transport session:
//! listing, streaming upload / download, bounded reads, writes, deletes,
//! mkdir, rename and stat.

pub mod sftp;
