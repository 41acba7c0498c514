//! Synthetic request/response messages and their FTP metadata.
//!
//! A [`MessageBody`] is the body storage handed to the policy engine. It
//! starts out either empty, as a live stream (the upload pipe), or as fixed
//! bytes, and can be stashed: read to the end into memory, spilling to a
//! temporary file once it outgrows the configured threshold. The maximum
//! request size is enforced on every read path.

use crate::ftp::directory::normalize_relative;
use crate::ftp::types::DestinationId;
use bytes::{Bytes, BytesMut};
use secrecy::{ExposeSecret, SecretString};
use std::io::{self, SeekFrom};
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{ready, Context, Poll};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeekExt, AsyncWriteExt, ReadBuf};

/// Boxed byte source a body can be turned into.
pub type BodyReader = Box<dyn AsyncRead + Send + Unpin>;

const READ_CHUNK: usize = 16 * 1024;

// ─── Errors ──────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum BodyError {
    #[error("message body exceeds the maximum of {limit} bytes")]
    TooLarge { limit: u64 },
    #[error("message body was already consumed")]
    Consumed,
    #[error("message body I/O failed: {0}")]
    Io(#[source] io::Error),
}

/// Marker carried inside the `io::Error` a limited reader produces.
#[derive(Debug, Error)]
#[error("body exceeds the {limit}-byte limit")]
struct LimitExceeded {
    limit: u64,
}

impl From<io::Error> for BodyError {
    fn from(e: io::Error) -> Self {
        match e.get_ref().and_then(|inner| inner.downcast_ref::<LimitExceeded>()) {
            Some(marker) => BodyError::TooLarge {
                limit: marker.limit,
            },
            None => BodyError::Io(e),
        }
    }
}

// ─── Tracked reader ──────────────────────────────────────────────────

/// Wraps the live source: enforces the size limit and records when the
/// source reached a terminal state (EOF or error).
struct Tracked {
    inner: BodyReader,
    read: u64,
    limit: Option<u64>,
    finished: Arc<AtomicBool>,
}

impl AsyncRead for Tracked {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let before = buf.filled().len();
        let result = ready!(Pin::new(&mut self.inner).poll_read(cx, buf));
        if let Err(e) = result {
            self.finished.store(true, Ordering::Release);
            return Poll::Ready(Err(e));
        }
        let n = buf.filled().len() - before;
        if n == 0 {
            self.finished.store(true, Ordering::Release);
            return Poll::Ready(Ok(()));
        }
        self.read += n as u64;
        if let Some(limit) = self.limit {
            if self.read > limit {
                // An error must not come with data.
                buf.set_filled(before);
                self.finished.store(true, Ordering::Release);
                return Poll::Ready(Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    LimitExceeded { limit },
                )));
            }
        }
        Poll::Ready(Ok(()))
    }
}

// ─── Body ────────────────────────────────────────────────────────────

enum Stash {
    Memory(Bytes),
    Spilled { file: tokio::fs::File, len: u64 },
}

enum BodyState {
    Empty,
    Streaming(Tracked),
    Stashed(Stash),
    Taken,
}

/// Body of a synthetic message.
pub struct MessageBody {
    state: BodyState,
    spill_threshold: usize,
    finished: Arc<AtomicBool>,
}

impl std::fmt::Debug for MessageBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = match &self.state {
            BodyState::Empty => "empty",
            BodyState::Streaming(_) => "streaming",
            BodyState::Stashed(Stash::Memory(_)) => "stashed(memory)",
            BodyState::Stashed(Stash::Spilled { .. }) => "stashed(file)",
            BodyState::Taken => "taken",
        };
        f.debug_struct("MessageBody").field("state", &state).finish()
    }
}

impl Default for MessageBody {
    fn default() -> Self {
        Self::empty()
    }
}

impl MessageBody {
    pub fn empty() -> Self {
        Self {
            state: BodyState::Empty,
            spill_threshold: usize::MAX,
            finished: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn from_bytes(bytes: impl Into<Bytes>) -> Self {
        Self {
            state: BodyState::Stashed(Stash::Memory(bytes.into())),
            spill_threshold: usize::MAX,
            finished: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Body backed by a live reader. `limit` is the maximum size in bytes
    /// (`None` for unbounded); stashed content above `spill_threshold`
    /// moves to a temporary file.
    pub fn streaming<R>(reader: R, limit: Option<u64>, spill_threshold: usize) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        let finished = Arc::new(AtomicBool::new(false));
        Self {
            state: BodyState::Streaming(Tracked {
                inner: Box::new(reader),
                read: 0,
                limit,
                finished: Arc::clone(&finished),
            }),
            spill_threshold,
            finished,
        }
    }

    /// Whether the underlying source reached EOF or failed.
    pub fn is_drained(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }

    /// Length in bytes once known (stashed or empty).
    pub fn len(&self) -> Option<u64> {
        match &self.state {
            BodyState::Empty => Some(0),
            BodyState::Stashed(Stash::Memory(b)) => Some(b.len() as u64),
            BodyState::Stashed(Stash::Spilled { len, .. }) => Some(*len),
            BodyState::Streaming(_) | BodyState::Taken => None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == Some(0)
    }

    /// Read a streaming body to the end and keep it. Returns its length.
    pub async fn stash(&mut self) -> Result<u64, BodyError> {
        let mut reader = match std::mem::replace(&mut self.state, BodyState::Taken) {
            BodyState::Streaming(reader) => reader,
            BodyState::Taken => return Err(BodyError::Consumed),
            other => {
                self.state = other;
                return Ok(self.len().unwrap_or(0));
            }
        };

        let mut buf = BytesMut::with_capacity(READ_CHUNK);
        loop {
            if buf.len() >= self.spill_threshold {
                let (file, len) = spill(buf.freeze(), &mut reader).await?;
                tracing::debug!(bytes = len, "message body spilled to temporary file");
                self.state = BodyState::Stashed(Stash::Spilled { file, len });
                return Ok(len);
            }
            buf.reserve(READ_CHUNK);
            if reader.read_buf(&mut buf).await? == 0 {
                break;
            }
        }
        let len = buf.len() as u64;
        self.state = BodyState::Stashed(Stash::Memory(buf.freeze()));
        Ok(len)
    }

    /// Whole body as bytes (stashing first if needed).
    pub async fn bytes(&mut self) -> Result<Bytes, BodyError> {
        self.stash().await?;
        match &mut self.state {
            BodyState::Empty => Ok(Bytes::new()),
            BodyState::Stashed(Stash::Memory(b)) => Ok(b.clone()),
            BodyState::Stashed(Stash::Spilled { file, len }) => {
                file.seek(SeekFrom::Start(0)).await?;
                let mut out = Vec::with_capacity(*len as usize);
                file.read_to_end(&mut out).await?;
                Ok(Bytes::from(out))
            }
            BodyState::Streaming(_) | BodyState::Taken => Err(BodyError::Consumed),
        }
    }

    /// Hand the body out as a reader. The body is consumed.
    pub async fn take_reader(&mut self) -> Result<BodyReader, BodyError> {
        match std::mem::replace(&mut self.state, BodyState::Taken) {
            BodyState::Empty => {
                self.state = BodyState::Empty;
                Ok(Box::new(tokio::io::empty()))
            }
            BodyState::Streaming(reader) => Ok(Box::new(reader)),
            BodyState::Stashed(Stash::Memory(b)) => Ok(Box::new(io::Cursor::new(b))),
            BodyState::Stashed(Stash::Spilled { mut file, .. }) => {
                file.seek(SeekFrom::Start(0)).await?;
                Ok(Box::new(file))
            }
            BodyState::Taken => Err(BodyError::Consumed),
        }
    }
}

async fn spill(head: Bytes, reader: &mut Tracked) -> Result<(tokio::fs::File, u64), BodyError> {
    let std_file = tokio::task::spawn_blocking(tempfile::tempfile)
        .await
        .map_err(|e| BodyError::Io(io::Error::new(io::ErrorKind::Other, e)))??;
    let mut file = tokio::fs::File::from_std(std_file);
    file.write_all(&head).await?;
    let copied = tokio::io::copy(reader, &mut file).await?;
    file.flush().await?;
    Ok((file, head.len() as u64 + copied))
}

// ─── Metadata ────────────────────────────────────────────────────────

/// Username/password pair derived from the session's user.
#[derive(Debug)]
pub struct Credentials {
    pub username: String,
    pub password: SecretString,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: &SecretString) -> Self {
        Self {
            username: username.into(),
            password: SecretString::new(password.expose_secret().clone()),
        }
    }
}

/// FTP protocol metadata attached to a synthetic request. Built once per
/// command and never mutated.
#[derive(Debug)]
pub struct FtpRequestMetadata {
    pub local_address: SocketAddr,
    pub remote_address: SocketAddr,
    pub command: String,
    pub argument: Option<String>,
    /// Virtual working directory when the command was received.
    pub path: String,
    /// `path` combined with the argument, when there is one.
    pub target: Option<String>,
    pub secure: bool,
    pub unique: bool,
    pub restart_offset: Option<u64>,
    pub credentials: Option<Credentials>,
}

impl FtpRequestMetadata {
    pub fn local_port(&self) -> u16 {
        self.local_address.port()
    }

    pub fn remote_port(&self) -> u16 {
        self.remote_address.port()
    }

    /// URL-style descriptor, e.g. `ftps://10.0.0.1:990/inbox/report.csv`.
    /// The scheme is `ftps` only when control and data are both secured.
    pub fn request_url(&self) -> String {
        let scheme = if self.secure { "ftps" } else { "ftp" };
        let host = match self.local_address {
            SocketAddr::V4(v4) => v4.ip().to_string(),
            SocketAddr::V6(v6) => format!("[{}]", v6.ip()),
        };
        let mut url = format!("{}://{}:{}{}", scheme, host, self.local_port(), self.path);
        if let Some(arg) = self.argument.as_deref().filter(|a| !a.trim().is_empty()) {
            if !url.ends_with('/') {
                url.push('/');
            }
            url.push_str(&normalize_relative(arg));
        }
        url
    }
}

/// Reply the policy wants sent on the control connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FtpResponseMetadata {
    pub code: u16,
    pub text: String,
}

impl FtpResponseMetadata {
    pub fn new(code: u16, text: impl Into<String>) -> Self {
        Self {
            code,
            text: text.into(),
        }
    }
}

// ─── Messages ────────────────────────────────────────────────────────

#[derive(Debug)]
pub struct SyntheticRequest {
    pub content_type: String,
    pub body: MessageBody,
    pub ftp: FtpRequestMetadata,
    /// Downstream target fixed by the connector; routing skips discovery.
    pub pinned_destination: Option<DestinationId>,
}

/// Response container filled in by the policy. Both parts may be left
/// unset, which the bridge treats as a contract violation on success.
#[derive(Debug, Default)]
pub struct SyntheticResponse {
    pub body: Option<MessageBody>,
    pub ftp: Option<FtpResponseMetadata>,
}

impl SyntheticResponse {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_reply(&mut self, code: u16, text: impl Into<String>) {
        self.ftp = Some(FtpResponseMetadata::new(code, text));
    }

    pub fn set_body(&mut self, body: impl Into<Bytes>) {
        self.body = Some(MessageBody::from_bytes(body));
    }
}
