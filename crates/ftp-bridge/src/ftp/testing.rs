//! Test doubles: scripted policy, recording reply sink, in-memory data
//! connections.

use crate::ftp::message::MessageBody;
use crate::ftp::policy::{PolicyContext, PolicyEngine, PolicyError, PolicyStatus};
use crate::ftp::protocol::ReplySink;
use crate::ftp::session::{DataConnection, DataConnectionFactory, Session};
use crate::ftp::types::{DestinationId, Reply};
use async_trait::async_trait;
use bytes::Bytes;
use secrecy::SecretString;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, DuplexStream, ReadBuf};

pub const DATA_PORT: u16 = 2020;

// ─── Data connections ────────────────────────────────────────────────

#[derive(Default)]
struct DataState {
    address: Option<SocketAddr>,
    secure: bool,
    next: Option<DataConnection>,
    fail_next_open: bool,
    opens: usize,
    closes: usize,
}

/// In-memory factory; the test drives the client side through [`DataProbe`].
pub struct MemoryDataFactory {
    state: Arc<Mutex<DataState>>,
}

/// Test-side handle on a [`MemoryDataFactory`].
#[derive(Clone)]
pub struct DataProbe {
    state: Arc<Mutex<DataState>>,
}

impl DataProbe {
    /// Arm a passive address and return the client end of the next
    /// data connection.
    pub fn arm(&self) -> DuplexStream {
        let (server, client) = tokio::io::duplex(64 * 1024);
        self.arm_with(Box::new(server));
        client
    }

    pub fn arm_with(&self, conn: DataConnection) {
        let mut state = self.state.lock().unwrap();
        state.address = Some(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), DATA_PORT));
        state.next = Some(conn);
    }

    pub fn fail_next_open(&self) {
        self.state.lock().unwrap().fail_next_open = true;
    }

    pub fn opens(&self) -> usize {
        self.state.lock().unwrap().opens
    }

    pub fn closes(&self) -> usize {
        self.state.lock().unwrap().closes
    }

    pub fn is_armed(&self) -> bool {
        self.state.lock().unwrap().address.is_some()
    }
}

#[async_trait]
impl DataConnectionFactory for MemoryDataFactory {
    fn passive_address(&self) -> Option<SocketAddr> {
        self.state.lock().unwrap().address
    }

    fn is_secure(&self) -> bool {
        self.state.lock().unwrap().secure
    }

    fn set_secure(&mut self, secure: bool) {
        self.state.lock().unwrap().secure = secure;
    }

    async fn listen(&mut self, local_ip: IpAddr) -> io::Result<SocketAddr> {
        let addr = SocketAddr::new(local_ip, DATA_PORT);
        self.state.lock().unwrap().address = Some(addr);
        Ok(addr)
    }

    async fn open(&mut self) -> io::Result<DataConnection> {
        let mut state = self.state.lock().unwrap();
        state.opens += 1;
        if std::mem::take(&mut state.fail_next_open) {
            return Err(io::Error::new(io::ErrorKind::ConnectionRefused, "refused"));
        }
        state
            .next
            .take()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "nothing armed"))
    }

    fn close(&mut self) {
        let mut state = self.state.lock().unwrap();
        state.closes += 1;
        state.address = None;
        state.next = None;
    }
}

/// Logged-in session (user `alice`, password `secret`) on an in-memory
/// data factory, in the default ASCII type.
pub fn test_session() -> (Session, DataProbe) {
    let state = Arc::new(Mutex::new(DataState::default()));
    let factory = MemoryDataFactory {
        state: Arc::clone(&state),
    };
    let mut session = Session::new(
        "127.0.0.1:21".parse().unwrap(),
        "192.0.2.10:40000".parse().unwrap(),
        false,
        Box::new(factory),
    );
    session.log_in("alice".into(), Some(SecretString::new("secret".into())));
    (session, DataProbe { state })
}

/// Data stream that yields a few bytes and then fails.
pub struct BrokenStream {
    sent: bool,
}

impl BrokenStream {
    pub fn new() -> Self {
        Self { sent: false }
    }
}

impl AsyncRead for BrokenStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if self.sent {
            return Poll::Ready(Err(io::Error::new(io::ErrorKind::ConnectionReset, "peer reset")));
        }
        self.sent = true;
        buf.put_slice(b"half a file");
        Poll::Ready(Ok(()))
    }
}

impl AsyncWrite for BrokenStream {
    fn poll_write(self: Pin<&mut Self>, _: &mut Context<'_>, _: &[u8]) -> Poll<io::Result<usize>> {
        Poll::Ready(Err(io::Error::new(io::ErrorKind::ConnectionReset, "peer reset")))
    }

    fn poll_flush(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

// ─── Reply sink ──────────────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct RecordingSink {
    pub replies: Vec<Reply>,
    pub broken: bool,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn codes(&self) -> Vec<u16> {
        self.replies.iter().map(|r| r.code).collect()
    }

    pub fn last(&self) -> Option<&Reply> {
        self.replies.last()
    }
}

#[async_trait]
impl ReplySink for RecordingSink {
    async fn send(&mut self, reply: &Reply) -> io::Result<()> {
        if self.broken {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "control connection gone"));
        }
        self.replies.push(reply.clone());
        Ok(())
    }
}

// ─── Policy ──────────────────────────────────────────────────────────

/// What the scripted policy saw for one call.
#[derive(Debug, Clone)]
pub struct SeenRequest {
    pub command: String,
    pub argument: Option<String>,
    pub path: String,
    pub target: Option<String>,
    pub url: String,
    pub unique: bool,
    pub secure: bool,
    pub restart_offset: Option<u64>,
    pub username: Option<String>,
    pub pinned_destination: Option<DestinationId>,
    pub content_type: String,
    pub body: Option<Bytes>,
}

type Script = dyn Fn(&mut PolicyContext) -> Result<PolicyStatus, PolicyError> + Send + Sync;

pub struct ScriptedPolicy {
    script: Box<Script>,
    consume_body: bool,
    calls: AtomicUsize,
    seen: Mutex<Vec<SeenRequest>>,
}

impl ScriptedPolicy {
    pub fn new<F>(script: F) -> Self
    where
        F: Fn(&mut PolicyContext) -> Result<PolicyStatus, PolicyError> + Send + Sync + 'static,
    {
        Self {
            script: Box::new(script),
            consume_body: true,
            calls: AtomicUsize::new(0),
            seen: Mutex::new(Vec::new()),
        }
    }

    /// Success with the given reply metadata.
    pub fn replying(code: u16, text: &'static str) -> Self {
        Self::new(move |ctx| {
            ctx.response.set_reply(code, text);
            Ok(PolicyStatus::Success)
        })
    }

    /// Success with reply metadata and a response body.
    pub fn replying_with_body(code: u16, text: &'static str, body: &'static str) -> Self {
        Self::new(move |ctx| {
            ctx.response.set_reply(code, text);
            ctx.response.body = Some(MessageBody::from_bytes(body));
            Ok(PolicyStatus::Success)
        })
    }

    pub fn returning(status: PolicyStatus) -> Self {
        Self::new(move |_| Ok(status))
    }

    /// Leave the request body untouched.
    pub fn ignoring_body(mut self) -> Self {
        self.consume_body = false;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn seen(&self) -> Vec<SeenRequest> {
        self.seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl PolicyEngine for ScriptedPolicy {
    async fn process(&self, ctx: &mut PolicyContext) -> Result<PolicyStatus, PolicyError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let body = if self.consume_body {
            Some(ctx.request.body.bytes().await?)
        } else {
            None
        };
        let ftp = &ctx.request.ftp;
        self.seen.lock().unwrap().push(SeenRequest {
            command: ftp.command.clone(),
            argument: ftp.argument.clone(),
            path: ftp.path.clone(),
            target: ftp.target.clone(),
            url: ftp.request_url(),
            unique: ftp.unique,
            secure: ftp.secure,
            restart_offset: ftp.restart_offset,
            username: ftp.credentials.as_ref().map(|c| c.username.clone()),
            pinned_destination: ctx.request.pinned_destination.clone(),
            content_type: ctx.request.content_type.clone(),
            body,
        });
        (self.script)(ctx)
    }
}
