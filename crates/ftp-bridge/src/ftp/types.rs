//! Shared types for the FTP bridge.

use crate::ftp::error::{BridgeError, BridgeResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;

/// Fallback body ceiling used when a connector asks for the system default (-1).
pub const DEFAULT_MAX_REQUEST_SIZE: u64 = 2_621_440;

/// Content type given to synthetic request bodies unless overridden.
pub const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

// ─── Session ─────────────────────────────────────────────────────────

/// Representation type negotiated with TYPE (RFC 959 §3.1.1).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub enum DataType {
    /// RFC 959 says ASCII until the client asks otherwise.
    #[default]
    Ascii,
    Binary,
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ascii => f.write_str("ASCII"),
            Self::Binary => f.write_str("BINARY"),
        }
    }
}

/// Identifier of a downstream destination a connector is pinned to.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(transparent)]
pub struct DestinationId(String);

impl DestinationId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DestinationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ─── Connector configuration ─────────────────────────────────────────

/// Inclusive port range handed out for passive data connections.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PassivePortRange {
    pub start: u16,
    pub end: u16,
}

/// Configuration for one FTP(S) connector.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectorConfig {
    /// Listener identity used in diagnostic context and fault events.
    pub id: String,
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Wrap the control connection in TLS from the first byte (port 990 style).
    #[serde(default)]
    pub implicit_tls: bool,
    /// Route the full command set instead of the upload-only subset.
    #[serde(default)]
    pub extended_commands: bool,
    /// Destination every synthetic request is pinned to, bypassing discovery.
    #[serde(default)]
    pub pinned_destination: Option<DestinationId>,
    /// Content type for request bodies (defaults to octet-stream).
    #[serde(default)]
    pub content_type: Option<String>,
    /// Maximum request body in bytes. -1 selects the system default, 0 is unbounded.
    #[serde(default = "default_max_request_size")]
    pub max_request_size: i64,
    /// Concurrent upload copy tasks; the pending queue is bounded by the same figure.
    #[serde(default = "default_max_transfers")]
    pub max_concurrent_transfers: usize,
    /// Address advertised in PASV replies (defaults to the control connection's local IP).
    #[serde(default)]
    pub passive_address: Option<IpAddr>,
    #[serde(default)]
    pub passive_ports: Option<PassivePortRange>,
    /// Seconds to wait for the client to connect to a passive port.
    #[serde(default = "default_data_timeout")]
    pub data_timeout_sec: u64,
    /// Seconds to wait for an upload copy task to attach to its pipe.
    #[serde(default = "default_transfer_start_timeout")]
    pub transfer_start_timeout_sec: u64,
    /// Bodies larger than this are spilled to a temporary file.
    #[serde(default = "default_spill_threshold")]
    pub spill_threshold: usize,
    /// Idle control connections are dropped after this many seconds (0 = never).
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_sec: u64,
}

fn default_bind_address() -> String {
    "0.0.0.0".into()
}
fn default_port() -> u16 {
    21
}
fn default_max_request_size() -> i64 {
    -1
}
fn default_max_transfers() -> usize {
    10
}
fn default_data_timeout() -> u64 {
    30
}
fn default_transfer_start_timeout() -> u64 {
    10
}
fn default_spill_threshold() -> usize {
    131_072
}
fn default_idle_timeout() -> u64 {
    300
}

impl ConnectorConfig {
    /// Minimal config for a listener id; every other field takes its default.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            bind_address: default_bind_address(),
            port: default_port(),
            implicit_tls: false,
            extended_commands: false,
            pinned_destination: None,
            content_type: None,
            max_request_size: default_max_request_size(),
            max_concurrent_transfers: default_max_transfers(),
            passive_address: None,
            passive_ports: None,
            data_timeout_sec: default_data_timeout(),
            transfer_start_timeout_sec: default_transfer_start_timeout(),
            spill_threshold: default_spill_threshold(),
            idle_timeout_sec: default_idle_timeout(),
        }
    }

    /// Parse and validate a JSON connector definition.
    pub fn from_json(json: &str) -> BridgeResult<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| BridgeError::invalid_config(format!("Connector config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> BridgeResult<()> {
        if self.id.trim().is_empty() {
            return Err(BridgeError::invalid_config("Connector id must not be empty"));
        }
        if self.extended_commands && self.pinned_destination.is_none() {
            return Err(BridgeError::invalid_config(
                "Extended commands require a pinned destination",
            ));
        }
        if let Some(dest) = &self.pinned_destination {
            if dest.as_str().trim().is_empty() {
                return Err(BridgeError::invalid_config("Pinned destination must not be blank"));
            }
        }
        if self.max_concurrent_transfers == 0 {
            return Err(BridgeError::invalid_config(
                "maxConcurrentTransfers must be at least 1",
            ));
        }
        if self.max_request_size < -1 {
            return Err(BridgeError::invalid_config(format!(
                "maxRequestSize {} is invalid (use -1 for the default, 0 for unbounded)",
                self.max_request_size
            )));
        }
        if let Some(ct) = &self.content_type {
            let mut parts = ct.splitn(2, '/');
            let (main, sub) = (parts.next().unwrap_or(""), parts.next().unwrap_or(""));
            if main.trim().is_empty() || sub.trim().is_empty() {
                return Err(BridgeError::invalid_config(format!(
                    "Content type '{}' is not of the form type/subtype",
                    ct
                )));
            }
        }
        if let Some(range) = self.passive_ports {
            if range.start == 0 || range.start > range.end {
                return Err(BridgeError::invalid_config(format!(
                    "Passive port range {}-{} is invalid",
                    range.start, range.end
                )));
            }
        }
        Ok(())
    }

    /// Body ceiling in bytes, `None` when unbounded.
    pub fn effective_max_request_size(&self) -> Option<u64> {
        match self.max_request_size {
            -1 => Some(DEFAULT_MAX_REQUEST_SIZE),
            0 => None,
            n => Some(n as u64),
        }
    }

    pub fn request_content_type(&self) -> &str {
        self.content_type.as_deref().unwrap_or(DEFAULT_CONTENT_TYPE)
    }

    pub fn bind_target(&self) -> String {
        format!("{}:{}", self.bind_address, self.port)
    }
}

// ─── Replies ─────────────────────────────────────────────────────────

/// A reply written on the control connection (may be multi-line).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Reply {
    pub code: u16,
    pub lines: Vec<String>,
}

impl Reply {
    pub fn new(code: u16, text: impl AsRef<str>) -> Self {
        let lines = text.as_ref().lines().map(str::to_string).collect::<Vec<_>>();
        Self {
            code,
            lines: if lines.is_empty() { vec![String::new()] } else { lines },
        }
    }

    pub fn multi(code: u16, lines: Vec<String>) -> Self {
        Self { code, lines }
    }

    /// Full reply text (all lines joined).
    pub fn text(&self) -> String {
        self.lines.join("\n")
    }

    /// Positive-completion reply (2xx).
    pub fn is_completion(&self) -> bool {
        (200..300).contains(&self.code)
    }
}

impl fmt::Display for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.code, self.text())
    }
}
