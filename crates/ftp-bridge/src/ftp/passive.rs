//! Passive-mode data connections (PASV / EPSV).
//!
//! The server binds a listener, advertises its address and accepts exactly
//! one client connection per transfer. Active mode (PORT/EPRT) is not
//! offered.

use crate::ftp::session::{DataConnection, DataConnectionFactory};
use crate::ftp::tls::TlsContext;
use crate::ftp::types::{ConnectorConfig, PassivePortRange};
use async_trait::async_trait;
use std::io;
use std::net::{IpAddr, SocketAddr};
use tokio::net::TcpListener;
use tokio::time::{timeout, Duration};

pub struct PassiveDataConnectionFactory {
    /// Address put in PASV replies instead of the bound one.
    advertise: Option<IpAddr>,
    ports: Option<PassivePortRange>,
    accept_timeout: Duration,
    tls: Option<TlsContext>,
    secure: bool,
    listener: Option<TcpListener>,
    address: Option<SocketAddr>,
}

impl PassiveDataConnectionFactory {
    pub fn new(config: &ConnectorConfig, tls: Option<TlsContext>) -> Self {
        Self {
            advertise: config.passive_address,
            ports: config.passive_ports,
            accept_timeout: Duration::from_secs(config.data_timeout_sec),
            tls,
            secure: false,
            listener: None,
            address: None,
        }
    }

    async fn bind(&self, ip: IpAddr) -> io::Result<TcpListener> {
        let Some(range) = self.ports else {
            return TcpListener::bind(SocketAddr::new(ip, 0)).await;
        };
        let mut last_err = None;
        for port in range.start..=range.end {
            match TcpListener::bind(SocketAddr::new(ip, port)).await {
                Ok(listener) => return Ok(listener),
                Err(e) => last_err = Some(e),
            }
        }
        Err(last_err.unwrap_or_else(|| {
            io::Error::new(io::ErrorKind::AddrInUse, "passive port range exhausted")
        }))
    }
}

#[async_trait]
impl DataConnectionFactory for PassiveDataConnectionFactory {
    fn passive_address(&self) -> Option<SocketAddr> {
        self.address
    }

    fn is_secure(&self) -> bool {
        self.secure
    }

    fn set_secure(&mut self, secure: bool) {
        self.secure = secure;
    }

    async fn listen(&mut self, local_ip: IpAddr) -> io::Result<SocketAddr> {
        self.close();
        let listener = self.bind(local_ip).await?;
        let bound = listener.local_addr()?;
        let advertised = SocketAddr::new(self.advertise.unwrap_or(local_ip), bound.port());
        tracing::debug!(%bound, %advertised, "passive listener armed");
        self.listener = Some(listener);
        self.address = Some(advertised);
        Ok(advertised)
    }

    async fn open(&mut self) -> io::Result<DataConnection> {
        let listener = self.listener.as_ref().ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotConnected, "no passive listener armed")
        })?;
        let (tcp, peer) = timeout(self.accept_timeout, listener.accept())
            .await
            .map_err(|_| {
                io::Error::new(io::ErrorKind::TimedOut, "passive data connection timed out")
            })??;
        tcp.set_nodelay(true).ok();
        tracing::debug!(%peer, secure = self.secure, "data connection accepted");

        if !self.secure {
            return Ok(Box::new(tcp));
        }
        let tls = self.tls.as_ref().ok_or_else(|| {
            io::Error::new(io::ErrorKind::Other, "data protection requested without a TLS context")
        })?;
        let stream = timeout(self.accept_timeout, tls.acceptor().accept(tcp))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "data channel TLS handshake timed out"))??;
        Ok(Box::new(stream))
    }

    fn close(&mut self) {
        self.listener = None;
        self.address = None;
    }
}
