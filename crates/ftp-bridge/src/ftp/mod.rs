//! # FTP(S) bridge
//!
//! Server-side FTP front end (RFC 959, passive data connections per
//! RFC 2428, implicit FTPS per RFC 4217) whose commands are answered by a
//! policy engine instead of a file system.
//!
//! Architecture:
//! - `types` — connector config, data type, reply
//! - `error` — bridge error taxonomy
//! - `protocol` — control-connection codec (line framing, reply encoding)
//! - `commands` — command set, built-in handlers, dispatch tables
//! - `directory` — virtual working directory
//! - `reply` — policy outcome → wire reply mapping
//! - `message` — synthetic request/response and message bodies
//! - `policy` — policy engine interface and fault events
//! - `synthesizer` — builds a request from session + command
//! - `pool` — bounded transfer worker pool
//! - `transfer` — upload pipe and download copy
//! - `processor` — per-command state machine
//! - `session` — per-control-connection state, data-connection interface
//! - `passive` — PASV/EPSV data-connection factory
//! - `tls` — rustls server context
//! - `listener` — accept loop and minimal protocol engine

pub mod types;
pub mod error;
pub mod protocol;
pub mod commands;
pub mod directory;
pub mod reply;
pub mod message;
pub mod policy;
pub mod synthesizer;
pub mod pool;
pub mod transfer;
pub mod processor;
pub mod session;
pub mod passive;
pub mod tls;
pub mod listener;

#[cfg(test)]
pub mod testing;

// Re-exports for lib.rs consumers
pub use types::*;
pub use error::{BridgeError, BridgeErrorKind, BridgeResult};
pub use commands::{Command, CommandFamily, Dispatcher};
pub use message::{FtpRequestMetadata, FtpResponseMetadata, MessageBody, SyntheticRequest, SyntheticResponse};
pub use processor::{CommandOutcome, DiagnosticContext, RequestProcessor};
pub use session::{DataConnectionFactory, Session};
pub use tls::TlsContext;
