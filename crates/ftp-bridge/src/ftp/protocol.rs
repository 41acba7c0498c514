//! Server-side control-connection codec (RFC 959 §4).
//!
//! Handles:
//! - Reading CRLF-terminated command lines with a length cap
//! - Splitting a line into verb and argument
//! - Writing single-line and multi-line replies

use crate::ftp::types::Reply;
use async_trait::async_trait;
use std::io;
use tokio::io::{
    split, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader,
    ReadHalf, WriteHalf,
};

/// Longest accepted command line, CRLF excluded.
pub const MAX_LINE: usize = 4096;

/// Where the bridge writes replies.
#[async_trait]
pub trait ReplySink: Send {
    async fn send(&mut self, reply: &Reply) -> io::Result<()>;
}

/// A parsed command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandLine {
    /// Upper-cased verb.
    pub verb: String,
    /// Everything after the first space, `None` when blank.
    pub argument: Option<String>,
}

/// Split `line` (CRLF already stripped) into verb and argument.
pub fn parse_command_line(line: &str) -> Option<CommandLine> {
    let line = line.trim_start();
    if line.is_empty() {
        return None;
    }
    let (verb, rest) = match line.split_once(' ') {
        Some((v, r)) => (v, Some(r)),
        None => (line, None),
    };
    Some(CommandLine {
        verb: verb.to_ascii_uppercase(),
        argument: rest.filter(|r| !r.trim().is_empty()).map(str::to_string),
    })
}

/// Wire form of a reply: `NNN text` or `NNN-first` … `NNN last`.
///
/// Line breaks inside a line are dropped, and intermediate lines that
/// start with a digit are indented so a client cannot read them as the
/// closing line.
pub fn encode_reply(reply: &Reply) -> String {
    let mut out = String::new();
    let last = reply.lines.len().saturating_sub(1);
    for (i, raw) in reply.lines.iter().enumerate() {
        let line: String = raw.chars().filter(|c| *c != '\r' && *c != '\n').collect();
        if i == last {
            out.push_str(&format!("{} {}\r\n", reply.code, line));
        } else if i == 0 {
            out.push_str(&format!("{}-{}\r\n", reply.code, line));
        } else {
            if line.starts_with(|c: char| c.is_ascii_digit()) {
                out.push(' ');
            }
            out.push_str(&line);
            out.push_str("\r\n");
        }
    }
    if reply.lines.is_empty() {
        out.push_str(&format!("{} \r\n", reply.code));
    }
    out
}

/// What came in on the control connection.
#[derive(Debug, PartialEq, Eq)]
pub enum Inbound {
    Command(CommandLine),
    /// A line longer than [`MAX_LINE`]; it has been discarded.
    Overlong,
    /// Blank line.
    Empty,
    /// Client closed the connection.
    Closed,
}

/// Control-connection codec over any byte stream (plain TCP or TLS).
pub struct ControlCodec<S> {
    reader: BufReader<ReadHalf<S>>,
    writer: WriteHalf<S>,
}

impl<S: AsyncRead + AsyncWrite + Send> ControlCodec<S> {
    pub fn new(stream: S) -> Self {
        let (rd, wr) = split(stream);
        Self {
            reader: BufReader::new(rd),
            writer: wr,
        }
    }

    pub async fn read_command(&mut self) -> io::Result<Inbound> {
        let mut buf = Vec::new();
        let limit = (MAX_LINE + 2) as u64;
        let n = (&mut self.reader).take(limit).read_until(b'\n', &mut buf).await?;
        if n == 0 {
            return Ok(Inbound::Closed);
        }
        if !buf.ends_with(b"\n") {
            if n as u64 >= limit {
                self.discard_line().await?;
                return Ok(Inbound::Overlong);
            }
            // EOF in the middle of a line; treat what we have as the line.
        }
        let line = String::from_utf8_lossy(&buf);
        let line = line.trim_end_matches(['\r', '\n']);
        tracing::trace!("<<< {}", redact(line));
        Ok(match parse_command_line(line) {
            Some(cmd) => Inbound::Command(cmd),
            None => Inbound::Empty,
        })
    }

    async fn discard_line(&mut self) -> io::Result<()> {
        loop {
            let chunk = self.reader.fill_buf().await?;
            if chunk.is_empty() {
                return Ok(());
            }
            match chunk.iter().position(|b| *b == b'\n') {
                Some(pos) => {
                    self.reader.consume(pos + 1);
                    return Ok(());
                }
                None => {
                    let len = chunk.len();
                    self.reader.consume(len);
                }
            }
        }
    }

    pub async fn write_reply(&mut self, reply: &Reply) -> io::Result<()> {
        self.writer.write_all(encode_reply(reply).as_bytes()).await?;
        self.writer.flush().await?;
        tracing::trace!(">>> {}", reply);
        Ok(())
    }

    pub async fn shutdown(&mut self) -> io::Result<()> {
        self.writer.shutdown().await
    }
}

#[async_trait]
impl<S: AsyncRead + AsyncWrite + Send> ReplySink for ControlCodec<S> {
    async fn send(&mut self, reply: &Reply) -> io::Result<()> {
        self.write_reply(reply).await
    }
}

/// Keep passwords out of trace output.
fn redact(line: &str) -> &str {
    if line.get(..4).is_some_and(|verb| verb.eq_ignore_ascii_case("PASS")) {
        "PASS ****"
    } else {
        line
    }
}
