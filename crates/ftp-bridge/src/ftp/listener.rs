//! Connector listener — accepts control connections and runs the small
//! protocol engine in front of the bridge.
//!
//! The engine answers login, transfer parameters and passive setup itself
//! (USER, PASS, QUIT, TYPE, MODE, STRU, PASV, EPSV, REST, OPTS, PBSZ, PROT,
//! AUTH). Everything else goes to the [`RequestProcessor`].

use crate::ftp::error::{BridgeError, BridgeResult};
use crate::ftp::passive::PassiveDataConnectionFactory;
use crate::ftp::policy::PolicyEngine;
use crate::ftp::processor::{CommandOutcome, DiagnosticContext, RequestProcessor};
use crate::ftp::protocol::{CommandLine, ControlCodec, Inbound};
use crate::ftp::session::Session;
use crate::ftp::tls::TlsContext;
use crate::ftp::types::{ConnectorConfig, DataType, Reply};
use secrecy::SecretString;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::Instrument;

/// How long shutdown waits for open sessions and running transfers.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

struct Shared {
    config: ConnectorConfig,
    processor: RequestProcessor,
    tls: Option<TlsContext>,
}

/// One configured FTP(S) connector.
pub struct FtpListener {
    shared: Arc<Shared>,
    cancel: CancellationToken,
    connections: TaskTracker,
}

impl FtpListener {
    pub fn new(
        config: ConnectorConfig,
        policy: Arc<dyn PolicyEngine>,
        tls: Option<TlsContext>,
    ) -> BridgeResult<Self> {
        config.validate()?;
        if config.implicit_tls && tls.is_none() {
            return Err(BridgeError::invalid_config(format!(
                "Connector {} uses implicit TLS but has no TLS context",
                config.id
            )));
        }
        let processor = RequestProcessor::new(&config, policy);
        Ok(Self {
            shared: Arc::new(Shared {
                config,
                processor,
                tls,
            }),
            cancel: CancellationToken::new(),
            connections: TaskTracker::new(),
        })
    }

    pub fn config(&self) -> &ConnectorConfig {
        &self.shared.config
    }

    pub fn processor(&self) -> &RequestProcessor {
        &self.shared.processor
    }

    /// Number of open control connections.
    pub fn active_connections(&self) -> usize {
        self.connections.len()
    }

    /// Token that stops [`serve`](Self::serve) when cancelled.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    pub async fn bind(&self) -> BridgeResult<TcpListener> {
        let target = self.shared.config.bind_target();
        TcpListener::bind(&target)
            .await
            .map_err(|e| BridgeError::io_error(format!("Bind {}: {}", target, e)))
    }

    /// Bind the configured address and serve until shut down.
    pub async fn run(&self) -> BridgeResult<()> {
        let listener = self.bind().await?;
        self.serve(listener).await
    }

    /// Accept control connections on `listener` until shut down, then
    /// drain sessions and the transfer pool.
    pub async fn serve(&self, listener: TcpListener) -> BridgeResult<()> {
        let local = listener.local_addr()?;
        tracing::info!(
            listener = %self.shared.config.id,
            %local,
            implicit_tls = self.shared.config.implicit_tls,
            "FTP connector listening"
        );

        loop {
            let (tcp, peer) = tokio::select! {
                _ = self.cancel.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        tracing::warn!(error = %e, "accept failed");
                        continue;
                    }
                },
            };
            let shared = Arc::clone(&self.shared);
            let cancel = self.cancel.child_token();
            self.connections
                .spawn(async move { accept_connection(shared, tcp, peer, cancel).await });
        }

        drop(listener);
        self.connections.close();
        let (sessions_done, transfers_done) = futures::future::join(
            timeout(SHUTDOWN_GRACE, self.connections.wait()),
            self.shared.processor.transfer_pool().shutdown(SHUTDOWN_GRACE),
        )
        .await;
        if sessions_done.is_err() {
            tracing::warn!(
                remaining = self.connections.len(),
                "control connections still open after shutdown grace period"
            );
        }
        tracing::info!(
            listener = %self.shared.config.id,
            transfers_done,
            "FTP connector stopped"
        );
        Ok(())
    }
}

async fn accept_connection(
    shared: Arc<Shared>,
    tcp: TcpStream,
    peer: SocketAddr,
    cancel: CancellationToken,
) {
    let local = match tcp.local_addr() {
        Ok(addr) => addr,
        Err(e) => {
            tracing::warn!(%peer, error = %e, "control connection has no local address");
            return;
        }
    };
    tcp.set_nodelay(true).ok();

    if !shared.config.implicit_tls {
        serve_control(&shared, tcp, local, peer, false, cancel).await;
        return;
    }
    let Some(tls) = shared.tls.as_ref() else {
        return;
    };
    let handshake = Duration::from_secs(shared.config.data_timeout_sec);
    match timeout(handshake, tls.acceptor().accept(tcp)).await {
        Ok(Ok(stream)) => serve_control(&shared, stream, local, peer, true, cancel).await,
        Ok(Err(e)) => tracing::warn!(%peer, error = %e, "implicit TLS handshake failed"),
        Err(_) => tracing::warn!(%peer, "implicit TLS handshake timed out"),
    }
}

async fn serve_control<S>(
    shared: &Shared,
    stream: S,
    local: SocketAddr,
    peer: SocketAddr,
    secure: bool,
    cancel: CancellationToken,
) where
    S: AsyncRead + AsyncWrite + Send + Unpin,
{
    let data = PassiveDataConnectionFactory::new(&shared.config, shared.tls.clone());
    let mut session = Session::new(local, peer, secure, Box::new(data));
    let diag = DiagnosticContext::new(shared.config.id.clone(), &session);
    let span = tracing::info_span!(
        "ftp_session",
        listener = %diag.listener_id,
        client = %diag.client_ip,
        session = %diag.session_id,
    );

    async move {
        tracing::info!(secure, "control connection opened");
        let mut codec = ControlCodec::new(stream);
        let idle = Duration::from_secs(shared.config.idle_timeout_sec);

        if codec.write_reply(&Reply::new(220, "Service ready for new user.")).await.is_err() {
            return;
        }

        loop {
            let inbound = tokio::select! {
                _ = cancel.cancelled() => {
                    let _ = codec.write_reply(&Reply::new(421, "Service closing control connection.")).await;
                    break;
                }
                read = next_command(&mut codec, idle) => match read {
                    Ok(Ok(inbound)) => inbound,
                    Ok(Err(e)) => {
                        tracing::debug!(error = %e, "control connection read failed");
                        break;
                    }
                    Err(_) => {
                        tracing::info!("control connection idle timeout");
                        let _ = codec.write_reply(&Reply::new(421, "Idle timeout, closing control connection.")).await;
                        break;
                    }
                },
            };

            let line = match inbound {
                Inbound::Closed => break,
                Inbound::Empty => continue,
                Inbound::Overlong => {
                    if codec.write_reply(&Reply::new(500, "Command line too long.")).await.is_err() {
                        break;
                    }
                    continue;
                }
                Inbound::Command(line) => line,
            };

            let outcome = match engine(&mut session, &line).await {
                Step::Reply(reply) => match codec.write_reply(&reply).await {
                    Ok(()) => CommandOutcome::Continue,
                    Err(_) => CommandOutcome::Disconnect,
                },
                Step::Quit(reply) => {
                    let _ = codec.write_reply(&reply).await;
                    CommandOutcome::Disconnect
                }
                Step::Route => {
                    shared
                        .processor
                        .handle(&line.verb, line.argument.as_deref(), &mut session, &mut codec, &diag)
                        .await
                }
            };
            if outcome == CommandOutcome::Disconnect {
                break;
            }
        }

        session.data.close();
        let _ = codec.shutdown().await;
        tracing::info!("control connection closed");
    }
    .instrument(span)
    .await
}

/// Next control line, bounded by `idle`. A zero `idle` waits forever.
async fn next_command<S>(
    codec: &mut ControlCodec<S>,
    idle: Duration,
) -> Result<std::io::Result<Inbound>, tokio::time::error::Elapsed>
where
    S: AsyncRead + AsyncWrite + Send + Unpin,
{
    if idle.is_zero() {
        Ok(codec.read_command().await)
    } else {
        timeout(idle, codec.read_command()).await
    }
}

// ─── Protocol engine ─────────────────────────────────────────────────

enum Step {
    Reply(Reply),
    Quit(Reply),
    /// Not an engine command; hand it to the dispatcher.
    Route,
}

fn reply(code: u16, text: impl AsRef<str>) -> Step {
    Step::Reply(Reply::new(code, text))
}

async fn engine(session: &mut Session, line: &CommandLine) -> Step {
    let arg = line.argument.as_deref().map(str::trim);
    match line.verb.as_str() {
        "USER" => {
            let Some(name) = arg else {
                return reply(501, "Syntax error in parameters or arguments.");
            };
            session.user = None;
            session.pending_user = Some(name.to_string());
            return reply(331, "User name okay, need password.");
        }
        "PASS" => {
            let Some(name) = session.pending_user.take() else {
                return reply(503, "Login with USER first.");
            };
            let password = line
                .argument
                .as_deref()
                .filter(|p| !p.is_empty())
                .map(|p| SecretString::new(p.to_string()));
            tracing::info!(user = %name, "user logged in");
            session.log_in(name, password);
            return reply(230, "User logged in, proceed.");
        }
        "QUIT" => return Step::Quit(Reply::new(221, "Goodbye.")),
        "AUTH" => return reply(502, "Explicit TLS not offered; use implicit FTPS."),
        _ => {}
    }

    if !session.is_logged_in() {
        return reply(530, "Not logged in.");
    }

    match line.verb.as_str() {
        "TYPE" => match arg.map(str::to_ascii_uppercase).as_deref() {
            Some("A") | Some("A N") => {
                session.data_type = DataType::Ascii;
                reply(200, "Type set to A.")
            }
            Some("I") | Some("L 8") => {
                session.data_type = DataType::Binary;
                reply(200, "Type set to I.")
            }
            _ => reply(504, "Command not implemented for that parameter."),
        },
        "MODE" => only(arg, "S", "Mode set to S."),
        "STRU" => only(arg, "F", "Structure set to F."),
        "PBSZ" => reply(200, "PBSZ=0"),
        "PROT" => match arg.map(str::to_ascii_uppercase).as_deref() {
            Some("C") => {
                session.data.set_secure(false);
                reply(200, "Protection level set to C.")
            }
            Some("P") if session.control_secure => {
                session.data.set_secure(true);
                reply(200, "Protection level set to P.")
            }
            Some("P") => reply(534, "Request denied for policy reasons."),
            _ => reply(504, "Command not implemented for that parameter."),
        },
        "PASV" => {
            let local_ip = session.local_addr.ip();
            if local_ip.is_ipv6() {
                return reply(522, "Network protocol not supported, use EPSV.");
            }
            match session.data.listen(local_ip).await {
                Ok(SocketAddr::V4(addr)) => {
                    let [h1, h2, h3, h4] = addr.ip().octets();
                    let port = addr.port();
                    reply(
                        227,
                        format!(
                            "Entering Passive Mode ({},{},{},{},{},{}).",
                            h1,
                            h2,
                            h3,
                            h4,
                            port >> 8,
                            port & 0xff
                        ),
                    )
                }
                Ok(SocketAddr::V6(_)) => {
                    session.data.close();
                    reply(522, "Network protocol not supported, use EPSV.")
                }
                Err(e) => {
                    tracing::warn!(error = %e, "passive listener failed");
                    reply(425, "Can't open data connection.")
                }
            }
        }
        "EPSV" => {
            if arg.is_some_and(|a| a.eq_ignore_ascii_case("ALL")) {
                return reply(200, "EPSV ALL ok.");
            }
            let local_ip: IpAddr = session.local_addr.ip();
            match session.data.listen(local_ip).await {
                Ok(addr) => reply(
                    229,
                    format!("Entering Extended Passive Mode (|||{}|).", addr.port()),
                ),
                Err(e) => {
                    tracing::warn!(error = %e, "passive listener failed");
                    reply(425, "Can't open data connection.")
                }
            }
        }
        "REST" => match arg.and_then(|a| a.parse::<u64>().ok()) {
            Some(offset) => {
                session.restart_offset = Some(offset);
                reply(350, format!("Restarting at {}. Send STORE or RETRIEVE.", offset))
            }
            None => reply(501, "Syntax error in parameters or arguments."),
        },
        "OPTS" => match arg.map(str::to_ascii_uppercase).as_deref() {
            Some("UTF8 ON") | Some("UTF8") => {
                session.utf8 = true;
                reply(200, "UTF8 mode enabled.")
            }
            Some("UTF8 OFF") => {
                session.utf8 = false;
                reply(200, "UTF8 mode disabled.")
            }
            _ => reply(501, "Option not understood."),
        },
        _ => Step::Route,
    }
}

fn only(arg: Option<&str>, accepted: &str, ok: &str) -> Step {
    match arg {
        Some(a) if a.eq_ignore_ascii_case(accepted) => reply(200, ok),
        Some(_) => reply(504, "Command not implemented for that parameter."),
        None => reply(501, "Syntax error in parameters or arguments."),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ftp::testing::{test_session, ScriptedPolicy};
    use secrecy::ExposeSecret;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

    fn line(verb: &str, argument: Option<&str>) -> CommandLine {
        CommandLine {
            verb: verb.into(),
            argument: argument.map(str::to_string),
        }
    }

    async fn code(session: &mut Session, verb: &str, argument: Option<&str>) -> u16 {
        match engine(session, &line(verb, argument)).await {
            Step::Reply(r) | Step::Quit(r) => r.code,
            Step::Route => 0,
        }
    }

    #[tokio::test]
    async fn test_login_sequence() {
        let (mut session, _) = test_session();
        assert_eq!(code(&mut session, "PASS", Some("x")).await, 503);
        assert_eq!(code(&mut session, "USER", Some("bob")).await, 331);
        assert!(!session.is_logged_in());
        assert_eq!(code(&mut session, "NOOP", None).await, 530);
        assert_eq!(code(&mut session, "PASS", Some("hunter2")).await, 230);
        let user = session.user.as_ref().unwrap();
        assert_eq!(user.name, "bob");
        assert_eq!(user.password.as_ref().unwrap().expose_secret(), "hunter2");

        assert_eq!(code(&mut session, "USER", Some("anonymous")).await, 331);
        assert_eq!(code(&mut session, "PASS", None).await, 230);
        assert!(session.user.as_ref().unwrap().password.is_none());
    }

    #[tokio::test]
    async fn test_transfer_parameters() {
        let (mut session, _) = test_session();
        assert_eq!(code(&mut session, "TYPE", Some("i")).await, 200);
        assert_eq!(session.data_type, DataType::Binary);
        assert_eq!(code(&mut session, "TYPE", Some("A")).await, 200);
        assert_eq!(session.data_type, DataType::Ascii);
        assert_eq!(code(&mut session, "TYPE", Some("E")).await, 504);
        assert_eq!(code(&mut session, "MODE", Some("S")).await, 200);
        assert_eq!(code(&mut session, "MODE", Some("B")).await, 504);
        assert_eq!(code(&mut session, "STRU", Some("R")).await, 504);
        assert_eq!(code(&mut session, "REST", Some("128")).await, 350);
        assert_eq!(session.restart_offset, Some(128));
        assert_eq!(code(&mut session, "REST", Some("-1")).await, 501);
        assert_eq!(code(&mut session, "OPTS", Some("UTF8 ON")).await, 200);
        assert!(session.utf8);
    }

    #[tokio::test]
    async fn test_protection_needs_secure_control() {
        let (mut session, _) = test_session();
        assert_eq!(code(&mut session, "PBSZ", Some("0")).await, 200);
        assert_eq!(code(&mut session, "PROT", Some("P")).await, 534);
        assert!(!session.data.is_secure());
        session.control_secure = true;
        assert_eq!(code(&mut session, "PROT", Some("P")).await, 200);
        assert!(session.is_secure());
        assert_eq!(code(&mut session, "PROT", Some("C")).await, 200);
        assert!(!session.is_secure());
        assert_eq!(code(&mut session, "AUTH", Some("TLS")).await, 502);
    }

    #[tokio::test]
    async fn test_passive_replies() {
        let (mut session, probe) = test_session();
        match engine(&mut session, &line("PASV", None)).await {
            Step::Reply(r) => assert_eq!(r.text(), "Entering Passive Mode (127,0,0,1,7,228)."),
            _ => panic!("PASV is an engine command"),
        }
        assert!(probe.is_armed());
        match engine(&mut session, &line("EPSV", None)).await {
            Step::Reply(r) => assert_eq!(r.text(), "Entering Extended Passive Mode (|||2020|)."),
            _ => panic!("EPSV is an engine command"),
        }
    }

    #[tokio::test]
    async fn test_unknown_verbs_are_routed() {
        let (mut session, _) = test_session();
        assert!(matches!(engine(&mut session, &line("STOR", Some("f"))).await, Step::Route));
        assert!(matches!(engine(&mut session, &line("XYZ", None)).await, Step::Route));
        assert!(matches!(engine(&mut session, &line("QUIT", None)).await, Step::Quit(_)));
    }

    #[test]
    fn test_implicit_tls_requires_context() {
        let mut config = ConnectorConfig::new("tls");
        config.implicit_tls = true;
        let err = FtpListener::new(config, Arc::new(ScriptedPolicy::returning(crate::ftp::policy::PolicyStatus::Success)), None)
            .err()
            .unwrap();
        assert!(err.message.contains("no TLS context"));
    }

    #[tokio::test]
    async fn test_greeting_overlong_and_shutdown() {
        let mut config = ConnectorConfig::new("loop");
        config.bind_address = "127.0.0.1".into();
        config.port = 0;
        let listener = Arc::new(
            FtpListener::new(
                config,
                Arc::new(ScriptedPolicy::returning(crate::ftp::policy::PolicyStatus::Success)),
                None,
            )
            .unwrap(),
        );
        let tcp = listener.bind().await.unwrap();
        let addr = tcp.local_addr().unwrap();
        let server = tokio::spawn({
            let listener = Arc::clone(&listener);
            async move { listener.serve(tcp).await }
        });

        let stream = TcpStream::connect(addr).await.unwrap();
        let (rd, mut wr) = stream.into_split();
        let mut rd = BufReader::new(rd);
        let mut greeting = String::new();
        rd.read_line(&mut greeting).await.unwrap();
        assert!(greeting.starts_with("220 "));

        let mut long = vec![b'X'; crate::ftp::protocol::MAX_LINE + 10];
        long.extend_from_slice(b"\r\n");
        wr.write_all(&long).await.unwrap();
        let mut answer = String::new();
        rd.read_line(&mut answer).await.unwrap();
        assert!(answer.starts_with("500 "));

        wr.write_all(b"NOOP\r\n").await.unwrap();
        answer.clear();
        rd.read_line(&mut answer).await.unwrap();
        assert!(answer.starts_with("530 "));

        listener.shutdown();
        answer.clear();
        rd.read_line(&mut answer).await.unwrap();
        assert!(answer.starts_with("421 "));
        server.await.unwrap().unwrap();
        assert_eq!(listener.active_connections(), 0);
    }

    #[tokio::test]
    async fn test_zero_idle_timeout_never_expires() {
        let mut config = ConnectorConfig::new("no-idle");
        config.bind_address = "127.0.0.1".into();
        config.port = 0;
        config.idle_timeout_sec = 0;
        let listener = Arc::new(
            FtpListener::new(
                config,
                Arc::new(ScriptedPolicy::returning(crate::ftp::policy::PolicyStatus::Success)),
                None,
            )
            .unwrap(),
        );
        let tcp = listener.bind().await.unwrap();
        let addr = tcp.local_addr().unwrap();
        let server = tokio::spawn({
            let listener = Arc::clone(&listener);
            async move { listener.serve(tcp).await }
        });

        let stream = TcpStream::connect(addr).await.unwrap();
        let (rd, mut wr) = stream.into_split();
        let mut rd = BufReader::new(rd);
        let mut answer = String::new();
        rd.read_line(&mut answer).await.unwrap();
        assert!(answer.starts_with("220 "));

        // Nothing arrives while the client sits idle.
        answer.clear();
        let quiet = tokio::time::timeout(Duration::from_millis(300), rd.read_line(&mut answer)).await;
        assert!(quiet.is_err(), "unexpected reply: {:?}", answer);
        assert_eq!(listener.active_connections(), 1);

        wr.write_all(b"NOOP\r\n").await.unwrap();
        answer.clear();
        rd.read_line(&mut answer).await.unwrap();
        assert!(answer.starts_with("530 "));

        listener.shutdown();
        answer.clear();
        rd.read_line(&mut answer).await.unwrap();
        assert!(answer.starts_with("421 "));
        server.await.unwrap().unwrap();
    }
}
