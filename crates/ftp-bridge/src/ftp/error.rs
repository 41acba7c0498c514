//! Bridge error type.
//!
//! Every failure a command invocation can hit is categorised here and
//! translated to exactly one wire reply by [`crate::ftp::reply`].

use std::fmt;

/// Categorised bridge error.
#[derive(Debug, Clone)]
pub struct BridgeError {
    pub kind: BridgeErrorKind,
    pub message: String,
    /// FTP reply code associated with the error, if any.
    pub code: Option<u16>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeErrorKind {
    /// Required argument missing or blank (501).
    InvalidArgument,
    /// Data command before PASV/EPSV (503).
    BadSequence,
    /// Transfer requested in a non-binary representation type (550).
    TypeMismatch,
    /// Passive data connection could not be opened (425).
    DataConnectionFailed,
    /// Transfer aborted mid-stream (426).
    TransferAborted,
    /// Transfer worker pool saturated (421).
    CapacityExceeded,
    /// Policy returned non-success or raised (550).
    PolicyFailure,
    /// Response metadata/body missing after a declared success (550).
    ProtocolInconsistency,
    /// Synthetic request could not be built (550).
    RequestCreation,
    /// Config / parameter validation error.
    InvalidConfig,
    /// TLS context or handshake failure.
    TlsFailed,
    /// Control connection I/O.
    IoError,
}

pub type BridgeResult<T> = Result<T, BridgeError>;

// ── Construction helpers ─────────────────────────────────────────────

impl BridgeError {
    pub fn new(kind: BridgeErrorKind, msg: impl Into<String>) -> Self {
        Self {
            kind,
            message: msg.into(),
            code: None,
        }
    }

    pub fn with_code(mut self, code: u16) -> Self {
        self.code = Some(code);
        self
    }

    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::new(BridgeErrorKind::InvalidArgument, msg)
    }

    pub fn bad_sequence(msg: impl Into<String>) -> Self {
        Self::new(BridgeErrorKind::BadSequence, msg)
    }

    pub fn type_mismatch(msg: impl Into<String>) -> Self {
        Self::new(BridgeErrorKind::TypeMismatch, msg)
    }

    pub fn data_connection(msg: impl Into<String>) -> Self {
        Self::new(BridgeErrorKind::DataConnectionFailed, msg)
    }

    pub fn transfer_aborted(msg: impl Into<String>) -> Self {
        Self::new(BridgeErrorKind::TransferAborted, msg)
    }

    pub fn capacity(msg: impl Into<String>) -> Self {
        Self::new(BridgeErrorKind::CapacityExceeded, msg)
    }

    pub fn policy_failure(msg: impl Into<String>) -> Self {
        Self::new(BridgeErrorKind::PolicyFailure, msg)
    }

    pub fn inconsistency(msg: impl Into<String>) -> Self {
        Self::new(BridgeErrorKind::ProtocolInconsistency, msg)
    }

    pub fn request_creation(msg: impl Into<String>) -> Self {
        Self::new(BridgeErrorKind::RequestCreation, msg)
    }

    pub fn invalid_config(msg: impl Into<String>) -> Self {
        Self::new(BridgeErrorKind::InvalidConfig, msg)
    }

    pub fn tls_failed(msg: impl Into<String>) -> Self {
        Self::new(BridgeErrorKind::TlsFailed, msg)
    }

    pub fn io_error(msg: impl Into<String>) -> Self {
        Self::new(BridgeErrorKind::IoError, msg)
    }

    /// Whether the control connection must be closed after replying.
    pub fn closes_control(&self) -> bool {
        self.kind == BridgeErrorKind::CapacityExceeded
    }
}

impl fmt::Display for BridgeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(code) = self.code {
            write!(f, "[FTP {:?} {}] {}", self.kind, code, self.message)
        } else {
            write!(f, "[FTP {:?}] {}", self.kind, self.message)
        }
    }
}

impl std::error::Error for BridgeError {}

impl From<std::io::Error> for BridgeError {
    fn from(e: std::io::Error) -> Self {
        Self::io_error(e.to_string())
    }
}

impl From<BridgeError> for String {
    fn from(e: BridgeError) -> String {
        e.message
    }
}

impl From<rustls::Error> for BridgeError {
    fn from(e: rustls::Error) -> Self {
        Self::tls_failed(e.to_string())
    }
}
