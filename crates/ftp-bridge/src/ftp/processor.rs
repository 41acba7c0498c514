//! Request processor — the FTP command-to-message bridge.
//!
//! One state machine for every routed command, parameterized by the
//! command's family:
//!
//! 1. argument check (501)
//! 2. passive setup check for data commands (503)
//! 3. binary type check for uploads (550)
//! 4. `150` and open the data connection (425); uploads start the pooled
//!    copy into the request body (421 / 426)
//! 5. synthesize the request and run it through policy, exactly once
//! 6. interpret: stealth, failure (550), missing metadata (550)
//! 7. transfer out for download/listing (426)
//! 8. final reply; navigation updates the virtual directory on 2xx only
//!
//! Downloads run the policy before touching the data connection, so a
//! refused retrieval never opens it. Cleanup (state reset, data
//! connection close) runs after every invocation whichever branch ended it.

use crate::ftp::commands::{Command, CommandFamily, Dispatcher, Handler};
use crate::ftp::error::{BridgeError, BridgeErrorKind, BridgeResult};
use crate::ftp::message::MessageBody;
use crate::ftp::policy::{FaultChannel, FaultEvent, PolicyContext, PolicyEngine, PolicyError, PolicyStatus};
use crate::ftp::pool::TransferPool;
use crate::ftp::protocol::ReplySink;
use crate::ftp::reply::{self, Interpretation};
use crate::ftp::session::Session;
use crate::ftp::synthesizer::MessageSynthesizer;
use crate::ftp::transfer;
use crate::ftp::types::{ConnectorConfig, DataType, Reply};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::Instrument;

/// Request-scoped diagnostic context. Every command runs inside the span
/// built from it.
#[derive(Debug, Clone)]
pub struct DiagnosticContext {
    pub listener_id: String,
    pub client_ip: IpAddr,
    pub session_id: String,
}

impl DiagnosticContext {
    pub fn new(listener_id: impl Into<String>, session: &Session) -> Self {
        Self {
            listener_id: listener_id.into(),
            client_ip: session.client_ip(),
            session_id: session.id.clone(),
        }
    }

    pub fn span(&self, command: &str) -> tracing::Span {
        tracing::info_span!(
            "ftp_command",
            listener = %self.listener_id,
            client = %self.client_ip,
            session = %self.session_id,
            command = %command,
        )
    }
}

/// What the control connection does after a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandOutcome {
    Continue,
    Disconnect,
}

/// Shared by every session on a connector.
pub struct RequestProcessor {
    listener_id: String,
    dispatcher: &'static Dispatcher,
    policy: Arc<dyn PolicyEngine>,
    pool: Arc<TransferPool>,
    synthesizer: MessageSynthesizer,
    faults: FaultChannel,
    start_timeout: Duration,
}

impl RequestProcessor {
    pub fn new(config: &ConnectorConfig, policy: Arc<dyn PolicyEngine>) -> Self {
        let pool = Arc::new(TransferPool::new(config.max_concurrent_transfers));
        Self::with_pool(config, policy, pool)
    }

    pub fn with_pool(
        config: &ConnectorConfig,
        policy: Arc<dyn PolicyEngine>,
        pool: Arc<TransferPool>,
    ) -> Self {
        Self {
            listener_id: config.id.clone(),
            dispatcher: Dispatcher::for_connector(config),
            policy,
            pool,
            synthesizer: MessageSynthesizer::new(config),
            faults: FaultChannel::default(),
            start_timeout: Duration::from_secs(config.transfer_start_timeout_sec),
        }
    }

    pub fn listener_id(&self) -> &str {
        &self.listener_id
    }

    pub fn dispatcher(&self) -> &'static Dispatcher {
        self.dispatcher
    }

    pub fn transfer_pool(&self) -> &Arc<TransferPool> {
        &self.pool
    }

    pub fn faults(&self) -> &FaultChannel {
        &self.faults
    }

    /// Resolve `verb` and run it: built-ins reply directly, routed commands
    /// go through [`process`](Self::process), unknown verbs get 502.
    pub async fn handle(
        &self,
        verb: &str,
        argument: Option<&str>,
        session: &mut Session,
        sink: &mut dyn ReplySink,
        diag: &DiagnosticContext,
    ) -> CommandOutcome {
        match self.dispatcher.resolve(verb) {
            Some(Handler::Bridge(command)) => self.process(command, argument, session, sink, diag).await,
            Some(Handler::Builtin(builtin)) => {
                let reply = builtin(session, argument);
                send_or_disconnect(sink, &reply).await
            }
            None => {
                tracing::debug!(verb, table = self.dispatcher.name(), "unsupported command");
                send_or_disconnect(sink, &reply::not_implemented(verb)).await
            }
        }
    }

    /// Run one routed command to completion. Never fails: every error
    /// becomes a reply (or a disconnect).
    pub async fn process(
        &self,
        command: Command,
        argument: Option<&str>,
        session: &mut Session,
        sink: &mut dyn ReplySink,
        diag: &DiagnosticContext,
    ) -> CommandOutcome {
        let span = diag.span(command.name());
        async move {
            let result = self.run(command, argument, session, sink, diag).await;
            let outcome = self.finish(command, result, sink).await;
            session.reset_state();
            if command.requires_data_connection() {
                session.data.close();
            }
            outcome
        }
        .instrument(span)
        .await
    }

    async fn run(
        &self,
        command: Command,
        argument: Option<&str>,
        session: &mut Session,
        sink: &mut dyn ReplySink,
        diag: &DiagnosticContext,
    ) -> BridgeResult<Option<Reply>> {
        let family = command.family();
        let argument = argument.filter(|a| !a.trim().is_empty());

        if command.is_argument_required() && argument.is_none() {
            return Err(BridgeError::invalid_argument(format!("{} requires an argument", command)));
        }
        if matches!(
            family,
            CommandFamily::Listing | CommandFamily::Navigation | CommandFamily::Simple
        ) {
            session.reset_state();
        }
        if command.requires_data_connection() && session.data.passive_address().is_none() {
            return Err(BridgeError::bad_sequence(format!("{} before PASV/EPSV", command)));
        }
        if family == CommandFamily::Upload && session.data_type != DataType::Binary {
            return Err(BridgeError::type_mismatch(format!(
                "Type '{}' not supported for this action.",
                session.data_type
            )));
        }

        match family {
            CommandFamily::Upload => self.upload(command, argument, session, sink, diag).await,
            CommandFamily::Download => self.download(command, argument, session, sink, diag).await,
            CommandFamily::Listing => self.listing(command, argument, session, sink, diag).await,
            CommandFamily::Navigation => self.navigate(command, argument, session, diag).await,
            CommandFamily::Simple => {
                let (ctx, status) = self.submit_empty(command, argument, session, diag).await?;
                let Some(reply) = interpret(status, &ctx)? else {
                    return Ok(None);
                };
                Ok(Some(reply::simple(command, reply, session.directory.current())))
            }
        }
    }

    async fn upload(
        &self,
        command: Command,
        argument: Option<&str>,
        session: &mut Session,
        sink: &mut dyn ReplySink,
        diag: &DiagnosticContext,
    ) -> BridgeResult<Option<Reply>> {
        sink.send(&reply::file_status_okay(command)).await?;
        let conn = session
            .data
            .open()
            .await
            .map_err(|e| BridgeError::data_connection(format!("Open data connection: {}", e)))?;
        let (pipe, upload) = transfer::receive_upload(&self.pool, conn, self.start_timeout).await?;

        let body = self.synthesizer.upload_body(pipe);
        let request = self.synthesizer.request(session, command, argument, body)?;
        let mut ctx = PolicyContext::new(request);
        let status = self.submit(command, &mut ctx, diag).await;

        if let Some(bytes) = upload.settle(ctx.request.body.is_drained()).await? {
            tracing::debug!(bytes, "upload received");
        }
        let Some(reply) = interpret(status, &ctx)? else {
            return Ok(None);
        };
        Ok(Some(reply::data_completion(command, reply)))
    }

    async fn download(
        &self,
        command: Command,
        argument: Option<&str>,
        session: &mut Session,
        sink: &mut dyn ReplySink,
        diag: &DiagnosticContext,
    ) -> BridgeResult<Option<Reply>> {
        let (mut ctx, status) = self.submit_empty(command, argument, session, diag).await?;
        let Some(reply) = interpret(status, &ctx)? else {
            return Ok(None);
        };
        if reply.code >= 400 {
            return Ok(Some(reply));
        }
        let body = response_body(&mut ctx)?;

        sink.send(&reply::file_status_okay(command)).await?;
        let mut conn = session
            .data
            .open()
            .await
            .map_err(|e| BridgeError::data_connection(format!("Open data connection: {}", e)))?;
        let sent = transfer::send_download(&mut conn, body).await?;
        tracing::debug!(bytes = sent, "download sent");
        Ok(Some(reply::data_completion(command, reply)))
    }

    async fn listing(
        &self,
        command: Command,
        argument: Option<&str>,
        session: &mut Session,
        sink: &mut dyn ReplySink,
        diag: &DiagnosticContext,
    ) -> BridgeResult<Option<Reply>> {
        sink.send(&reply::file_status_okay(command)).await?;
        let mut conn = session
            .data
            .open()
            .await
            .map_err(|e| BridgeError::data_connection(format!("Open data connection: {}", e)))?;

        let (mut ctx, status) = self.submit_empty(command, argument, session, diag).await?;
        let Some(reply) = interpret(status, &ctx)? else {
            return Ok(None);
        };
        if reply.code >= 400 {
            return Ok(Some(reply));
        }
        let body = response_body(&mut ctx)?;
        let sent = transfer::send_download(&mut conn, body).await?;
        tracing::debug!(bytes = sent, "listing sent");
        Ok(Some(reply::data_completion(command, reply)))
    }

    async fn navigate(
        &self,
        command: Command,
        argument: Option<&str>,
        session: &mut Session,
        diag: &DiagnosticContext,
    ) -> BridgeResult<Option<Reply>> {
        let (ctx, status) = self.submit_empty(command, argument, session, diag).await?;
        let Some(reply) = interpret(status, &ctx)? else {
            return Ok(None);
        };
        if !reply.is_completion() {
            return Ok(Some(reply));
        }
        let before = session.directory.current().to_string();
        let path = match (command, argument) {
            (Command::Cdup, _) => session.directory.parent().to_string(),
            (_, Some(arg)) => session.directory.change_to(arg).to_string(),
            (_, None) => {
                session.directory.reset();
                session.directory.current().to_string()
            }
        };
        tracing::debug!(from = %before, to = %path, "working directory changed");
        Ok(Some(reply::navigation(reply, &path)))
    }

    // ─── Policy ──────────────────────────────────────────────────────

    async fn submit_empty(
        &self,
        command: Command,
        argument: Option<&str>,
        session: &Session,
        diag: &DiagnosticContext,
    ) -> BridgeResult<(PolicyContext, PolicyStatus)> {
        let request = self
            .synthesizer
            .request(session, command, argument, MessageBody::empty())?;
        let mut ctx = PolicyContext::new(request);
        let status = self.submit(command, &mut ctx, diag).await;
        Ok((ctx, status))
    }

    async fn submit(
        &self,
        command: Command,
        ctx: &mut PolicyContext,
        diag: &DiagnosticContext,
    ) -> PolicyStatus {
        let (status, fault) = match self.policy.process(ctx).await {
            Ok(status) => {
                tracing::debug!(%status, "policy completed");
                if status.is_success() {
                    (status, None)
                } else {
                    (status, Some(self.policy.returning_fault(status, ctx)))
                }
            }
            Err(PolicyError::StalePolicy) => {
                tracing::info!("Request referred to an outdated version of policy");
                let fault = self.policy.exception_fault(&PolicyError::StalePolicy, ctx);
                (PolicyStatus::Undefined, Some(fault))
            }
            Err(err) => {
                tracing::warn!(error = %err, "Exception while processing FTP message");
                let fault = self.policy.exception_fault(&err, ctx);
                (PolicyStatus::Undefined, Some(fault))
            }
        };
        if let Some(fault) = fault {
            tracing::debug!(%fault, "policy fault (not sent to client)");
            self.faults.publish(FaultEvent {
                listener_id: diag.listener_id.clone(),
                client_ip: diag.client_ip,
                command: command.name().to_string(),
                status,
                fault,
            });
        }
        status
    }

    // ─── Replies ─────────────────────────────────────────────────────

    async fn finish(
        &self,
        command: Command,
        result: BridgeResult<Option<Reply>>,
        sink: &mut dyn ReplySink,
    ) -> CommandOutcome {
        match result {
            Ok(Some(reply)) => send_or_disconnect(sink, &reply).await,
            Ok(None) => {
                tracing::info!("policy requested a stealth response; closing without reply");
                CommandOutcome::Disconnect
            }
            Err(err) if err.kind == BridgeErrorKind::IoError => {
                tracing::info!(error = %err, "control connection failed mid-command");
                CommandOutcome::Disconnect
            }
            Err(err) => {
                match err.kind {
                    BridgeErrorKind::InvalidArgument
                    | BridgeErrorKind::BadSequence
                    | BridgeErrorKind::TypeMismatch => tracing::debug!(error = %err, "command rejected"),
                    _ => tracing::warn!(error = %err, "FTP {} failed", command),
                }
                let reply = reply::for_error(&err, command);
                match send_or_disconnect(sink, &reply).await {
                    CommandOutcome::Continue if err.closes_control() => CommandOutcome::Disconnect,
                    outcome => outcome,
                }
            }
        }
    }
}

/// `None` for a stealth outcome.
fn interpret(status: PolicyStatus, ctx: &PolicyContext) -> BridgeResult<Option<Reply>> {
    match reply::interpret(status, ctx.stealth, ctx.response.ftp.as_ref()) {
        Interpretation::Stealth => Ok(None),
        Interpretation::Failed(err) => Err(err),
        Interpretation::Proceed(reply) => Ok(Some(reply)),
    }
}

fn response_body(ctx: &mut PolicyContext) -> BridgeResult<MessageBody> {
    ctx.response.body.take().ok_or_else(|| {
        BridgeError::inconsistency("response body missing after a successful policy outcome")
    })
}

async fn send_or_disconnect(sink: &mut dyn ReplySink, reply: &Reply) -> CommandOutcome {
    match sink.send(reply).await {
        Ok(()) => CommandOutcome::Continue,
        Err(e) => {
            tracing::info!(error = %e, "could not write reply; closing control connection");
            CommandOutcome::Disconnect
        }
    }
}
