//! Builds the synthetic request for one command invocation.

use crate::ftp::commands::Command;
use crate::ftp::error::{BridgeError, BridgeResult};
use crate::ftp::message::{Credentials, FtpRequestMetadata, MessageBody, SyntheticRequest};
use crate::ftp::session::Session;
use crate::ftp::types::{ConnectorConfig, DestinationId};
use tokio::io::AsyncRead;

#[derive(Debug, Clone)]
pub struct MessageSynthesizer {
    content_type: String,
    pinned_destination: Option<DestinationId>,
    max_request_size: Option<u64>,
    spill_threshold: usize,
}

impl MessageSynthesizer {
    pub fn new(config: &ConnectorConfig) -> Self {
        Self {
            content_type: config.request_content_type().to_string(),
            pinned_destination: config.pinned_destination.clone(),
            max_request_size: config.effective_max_request_size(),
            spill_threshold: config.spill_threshold,
        }
    }

    /// Body storage for an upload stream, bounded by the connector's
    /// maximum request size.
    pub fn upload_body<R>(&self, reader: R) -> MessageBody
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        MessageBody::streaming(reader, self.max_request_size, self.spill_threshold)
    }

    pub fn metadata(
        &self,
        session: &Session,
        command: Command,
        argument: Option<&str>,
    ) -> FtpRequestMetadata {
        let credentials = session.user.as_ref().and_then(|user| {
            user.password
                .as_ref()
                .map(|password| Credentials::new(user.name.clone(), password))
        });
        FtpRequestMetadata {
            local_address: session.local_addr,
            remote_address: session.remote_addr,
            command: command.name().to_string(),
            argument: argument.map(str::to_string),
            path: session.directory.current().to_string(),
            target: argument.map(|arg| session.directory.entry(arg).path().to_string()),
            secure: session.is_secure(),
            unique: command.is_unique(),
            restart_offset: session.restart_offset,
            credentials,
        }
    }

    pub fn request(
        &self,
        session: &Session,
        command: Command,
        argument: Option<&str>,
        body: MessageBody,
    ) -> BridgeResult<SyntheticRequest> {
        if let Some(arg) = argument {
            if arg.contains(['\0', '\r', '\n']) {
                return Err(BridgeError::request_creation(format!(
                    "{} argument contains control characters",
                    command
                )));
            }
        }
        Ok(SyntheticRequest {
            content_type: self.content_type.clone(),
            body,
            ftp: self.metadata(session, command, argument),
            pinned_destination: self.pinned_destination.clone(),
        })
    }
}
