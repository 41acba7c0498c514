//! Per-control-connection session state.
//!
//! The listener owns the [`Session`]; the request processor reads it and
//! mutates only the per-command bits (restart offset, data connection,
//! virtual directory on a successful navigation).

use crate::ftp::directory::VirtualDirectory;
use crate::ftp::types::DataType;
use async_trait::async_trait;
use secrecy::SecretString;
use std::io;
use std::net::{IpAddr, SocketAddr};
use tokio::io::{AsyncRead, AsyncWrite};
use uuid::Uuid;

// ─── Data connections ────────────────────────────────────────────────

/// Byte stream of an open data connection (plain TCP, TLS, or in-memory).
pub trait DataStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> DataStream for T {}

pub type DataConnection = Box<dyn DataStream>;

/// Source of passive data connections for one session.
#[async_trait]
pub trait DataConnectionFactory: Send + Sync {
    /// Address the client was told to connect to, if PASV/EPSV is armed.
    fn passive_address(&self) -> Option<SocketAddr>;

    /// Whether data connections are TLS-protected (PROT P).
    fn is_secure(&self) -> bool;

    fn set_secure(&mut self, secure: bool);

    /// Arm a passive listener and return the address to advertise.
    async fn listen(&mut self, local_ip: IpAddr) -> io::Result<SocketAddr>;

    /// Accept the client's data connection on the armed listener.
    async fn open(&mut self) -> io::Result<DataConnection>;

    /// Drop the listener and forget the passive address.
    fn close(&mut self);
}

// ─── Session ─────────────────────────────────────────────────────────

/// Authenticated user.
#[derive(Debug)]
pub struct User {
    pub name: String,
    /// `None` when PASS carried no password.
    pub password: Option<SecretString>,
}

pub struct Session {
    pub id: String,
    pub user: Option<User>,
    /// Name from USER awaiting PASS.
    pub pending_user: Option<String>,
    pub data_type: DataType,
    pub control_secure: bool,
    pub local_addr: SocketAddr,
    pub remote_addr: SocketAddr,
    pub directory: VirtualDirectory,
    pub data: Box<dyn DataConnectionFactory>,
    /// Offset from REST, valid for the next command only.
    pub restart_offset: Option<u64>,
    pub utf8: bool,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("user", &self.user)
            .field("data_type", &self.data_type)
            .field("control_secure", &self.control_secure)
            .field("remote_addr", &self.remote_addr)
            .field("directory", &self.directory.current())
            .finish_non_exhaustive()
    }
}

impl Session {
    pub fn new(
        local_addr: SocketAddr,
        remote_addr: SocketAddr,
        control_secure: bool,
        data: Box<dyn DataConnectionFactory>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            user: None,
            pending_user: None,
            data_type: DataType::default(),
            control_secure,
            local_addr,
            remote_addr,
            directory: VirtualDirectory::new(),
            data,
            restart_offset: None,
            utf8: false,
        }
    }

    pub fn is_logged_in(&self) -> bool {
        self.user.is_some()
    }

    /// Both control and data channels are secured.
    pub fn is_secure(&self) -> bool {
        self.control_secure && self.data.is_secure()
    }

    pub fn client_ip(&self) -> IpAddr {
        self.remote_addr.ip()
    }

    /// Clear per-command state.
    pub fn reset_state(&mut self) {
        self.restart_offset = None;
    }

    pub fn log_in(&mut self, name: String, password: Option<SecretString>) {
        self.pending_user = None;
        self.user = Some(User { name, password });
    }
}
