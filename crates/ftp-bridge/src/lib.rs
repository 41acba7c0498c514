//! # ftp-bridge
//!
//! Embedded FTP/FTPS front end for a message-processing gateway.
//!
//! Each routed FTP command becomes a synthetic request that runs through a
//! pluggable policy engine; the policy's response decides the wire reply
//! and, for downloads and listings, the bytes sent on the data connection.

pub mod ftp;

pub use ftp::listener::FtpListener;
pub use ftp::policy::{PolicyContext, PolicyEngine, PolicyError, PolicyStatus};
