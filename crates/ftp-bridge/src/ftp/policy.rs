//! Policy engine boundary.
//!
//! The bridge hands every command to a [`PolicyEngine`] as a
//! [`PolicyContext`] (synthetic request plus an empty response container)
//! and reads back a [`PolicyStatus`]. Non-success outcomes and raised
//! errors produce a fault body that is published as a [`FaultEvent`] and
//! logged, never written to the FTP client.

use crate::ftp::message::{BodyError, SyntheticRequest, SyntheticResponse};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;
use thiserror::Error;
use tokio::sync::broadcast;

/// Outcome of running a message through policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PolicyStatus {
    Success,
    Falsified,
    AuthRequired,
    Unauthorized,
    ServiceNotFound,
    ServerError,
    Undefined,
}

impl PolicyStatus {
    pub fn is_success(self) -> bool {
        self == Self::Success
    }

    pub fn message(self) -> &'static str {
        match self {
            Self::Success => "No Error",
            Self::Falsified => "Assertion Falsified",
            Self::AuthRequired => "Authentication Required",
            Self::Unauthorized => "Not Authorized",
            Self::ServiceNotFound => "Service Not Found",
            Self::ServerError => "Server Error",
            Self::Undefined => "Undefined",
        }
    }
}

impl fmt::Display for PolicyStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.message())
    }
}

/// Raised (as opposed to returned) policy failures.
#[derive(Debug, Error)]
pub enum PolicyError {
    /// The request referred to an outdated version of the policy.
    #[error("request referred to an outdated version of policy")]
    StalePolicy,
    #[error("policy processing failed: {0}")]
    Internal(String),
    #[error(transparent)]
    Body(#[from] BodyError),
}

/// Everything the policy sees for one command.
#[derive(Debug)]
pub struct PolicyContext {
    pub request: SyntheticRequest,
    pub response: SyntheticResponse,
    /// Set by the policy to end the exchange with no reply at all.
    pub stealth: bool,
}

impl PolicyContext {
    pub fn new(request: SyntheticRequest) -> Self {
        Self {
            request,
            response: SyntheticResponse::new(),
            stealth: false,
        }
    }
}

#[async_trait]
pub trait PolicyEngine: Send + Sync {
    /// Run the request through policy. Called at most once per command.
    async fn process(&self, ctx: &mut PolicyContext) -> Result<PolicyStatus, PolicyError>;

    /// Fault body for a returned non-success status.
    fn returning_fault(&self, status: PolicyStatus, ctx: &PolicyContext) -> String {
        format!(
            "FTP {} request to {} failed: {}",
            ctx.request.ftp.command,
            ctx.request.ftp.request_url(),
            status
        )
    }

    /// Fault body for a raised error.
    fn exception_fault(&self, err: &PolicyError, ctx: &PolicyContext) -> String {
        format!(
            "FTP {} request to {} raised: {}",
            ctx.request.ftp.command,
            ctx.request.ftp.request_url(),
            err
        )
    }
}

// ─── Fault events ────────────────────────────────────────────────────

/// Published for every policy failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FaultEvent {
    pub listener_id: String,
    pub client_ip: IpAddr,
    pub command: String,
    pub status: PolicyStatus,
    pub fault: String,
}

/// Broadcast channel for [`FaultEvent`]s. Publishing with no subscribers
/// is not an error.
#[derive(Debug, Clone)]
pub struct FaultChannel {
    tx: broadcast::Sender<FaultEvent>,
}

impl FaultChannel {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<FaultEvent> {
        self.tx.subscribe()
    }

    pub fn publish(&self, event: FaultEvent) {
        let _ = self.tx.send(event);
    }
}

impl Default for FaultChannel {
    fn default() -> Self {
        Self::new(64)
    }
}
