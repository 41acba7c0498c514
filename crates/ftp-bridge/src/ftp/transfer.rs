//! Data transfer bridge.
//!
//! Upload: a pooled copy task reads the client's data connection and feeds
//! a rendezvous pipe whose other end becomes the synthetic request body.
//! The caller waits (bounded) until the copy task has attached to the
//! pipe; producer failures travel down the pipe to the reader.
//!
//! Download/listing: the response body is copied straight onto the data
//! connection on the calling task.

use crate::ftp::error::{BridgeError, BridgeResult};
use crate::ftp::message::MessageBody;
use crate::ftp::pool::TransferPool;
use crate::ftp::session::DataConnection;
use bytes::{Bytes, BytesMut};
use std::io;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::io::StreamReader;

const CHUNK: usize = 32 * 1024;

/// Consumer end of the upload pipe.
pub type UploadPipe = StreamReader<ReceiverStream<io::Result<Bytes>>, Bytes>;

// ─── Upload ──────────────────────────────────────────────────────────

/// How a copy task that did not fail ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CopyEnd {
    /// Client closed the data connection; every byte went down the pipe.
    Complete(u64),
    /// The body consumer dropped the pipe first (policy rejected the body).
    Abandoned(u64),
}

/// Handle on a running upload copy. Dropping it aborts the copy.
#[derive(Debug)]
pub struct UploadTransfer {
    handle: Option<JoinHandle<io::Result<CopyEnd>>>,
}

impl UploadTransfer {
    /// Finish the transfer after the policy ran. A drained pipe means the
    /// copy task already finished, so its result is collected; otherwise
    /// the copy is aborted and `None` returned.
    pub async fn settle(mut self, drained: bool) -> BridgeResult<Option<u64>> {
        let Some(handle) = self.handle.take() else {
            return Ok(None);
        };
        if !drained {
            handle.abort();
            return Ok(None);
        }
        match handle.await {
            Ok(Ok(CopyEnd::Complete(bytes))) => Ok(Some(bytes)),
            Ok(Ok(CopyEnd::Abandoned(bytes))) => {
                tracing::debug!(bytes, "upload body abandoned by its consumer");
                Ok(None)
            }
            Ok(Err(e)) => Err(BridgeError::transfer_aborted(format!(
                "Upload from client failed: {}",
                e
            ))),
            Err(e) => Err(BridgeError::transfer_aborted(format!(
                "Upload task ended abnormally: {}",
                e
            ))),
        }
    }
}

impl Drop for UploadTransfer {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

/// Start pulling the client's upload off `conn`.
///
/// Fails with a capacity error when the pool is saturated, and with a
/// transfer error when the copy task does not attach within
/// `start_timeout`.
pub async fn receive_upload(
    pool: &TransferPool,
    conn: DataConnection,
    start_timeout: Duration,
) -> BridgeResult<(UploadPipe, UploadTransfer)> {
    let (tx, rx) = mpsc::channel::<io::Result<Bytes>>(1);
    let (gate_tx, gate_rx) = oneshot::channel::<()>();

    let handle = pool.submit(copy_to_pipe(conn, tx, gate_tx))?;
    let transfer = UploadTransfer {
        handle: Some(handle),
    };

    match timeout(start_timeout, gate_rx).await {
        Ok(Ok(())) => {}
        Ok(Err(_)) => {
            return Err(BridgeError::transfer_aborted(
                "Upload task ended before attaching to the pipe",
            ))
        }
        Err(_) => {
            return Err(BridgeError::transfer_aborted(format!(
                "Upload task did not start within {:?}",
                start_timeout
            )))
        }
    }

    Ok((StreamReader::new(ReceiverStream::new(rx)), transfer))
}

async fn copy_to_pipe(
    mut conn: DataConnection,
    tx: mpsc::Sender<io::Result<Bytes>>,
    gate: oneshot::Sender<()>,
) -> io::Result<CopyEnd> {
    let _ = gate.send(());
    let mut total = 0u64;
    loop {
        let mut buf = BytesMut::with_capacity(CHUNK);
        let read = tokio::select! {
            read = conn.read_buf(&mut buf) => read,
            _ = tx.closed() => return Ok(CopyEnd::Abandoned(total)),
        };
        match read {
            Ok(0) => {
                tracing::trace!(bytes = total, "upload data connection reached EOF");
                return Ok(CopyEnd::Complete(total));
            }
            Ok(n) => {
                total += n as u64;
                if tx.send(Ok(buf.freeze())).await.is_err() {
                    return Ok(CopyEnd::Abandoned(total));
                }
            }
            Err(e) => {
                tracing::debug!(error = %e, "upload data connection read failed");
                let _ = tx.send(Err(io::Error::new(e.kind(), e.to_string()))).await;
                return Err(e);
            }
        }
    }
}

// ─── Download / listing ──────────────────────────────────────────────

/// Push `body` onto the data connection and close the write side.
pub async fn send_download(conn: &mut DataConnection, mut body: MessageBody) -> BridgeResult<u64> {
    let mut reader = body.take_reader().await.map_err(|e| {
        BridgeError::transfer_aborted(format!("Response body unreadable: {}", e))
    })?;
    let sent = tokio::io::copy(&mut reader, conn)
        .await
        .map_err(|e| BridgeError::transfer_aborted(format!("Data connection write: {}", e)))?;
    conn.shutdown()
        .await
        .map_err(|e| BridgeError::transfer_aborted(format!("Data connection close: {}", e)))?;
    Ok(sent)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ftp::error::BridgeErrorKind;
    use std::pin::Pin;
    use std::task::{Context, Poll};
    use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

    /// Yields some bytes, then a connection reset.
    struct Flaky {
        sent: bool,
    }

    impl AsyncRead for Flaky {
        fn poll_read(
            mut self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            if self.sent {
                Poll::Ready(Err(io::Error::new(io::ErrorKind::ConnectionReset, "reset")))
            } else {
                self.sent = true;
                buf.put_slice(b"partial");
                Poll::Ready(Ok(()))
            }
        }
    }

    impl AsyncWrite for Flaky {
        fn poll_write(self: Pin<&mut Self>, _: &mut Context<'_>, b: &[u8]) -> Poll<io::Result<usize>> {
            Poll::Ready(Ok(b.len()))
        }
        fn poll_flush(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
        fn poll_shutdown(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn test_upload_is_byte_exact() {
        let pool = TransferPool::new(2);
        let (server, mut client) = tokio::io::duplex(1024);
        let payload: Vec<u8> = (0..50_000u32).map(|i| (i % 253) as u8).collect();
        let expected = payload.clone();
        tokio::spawn(async move {
            client.write_all(&payload).await.unwrap();
            client.shutdown().await.unwrap();
        });

        let (mut pipe, transfer) =
            receive_upload(&pool, Box::new(server), Duration::from_secs(5)).await.unwrap();
        let mut got = Vec::new();
        pipe.read_to_end(&mut got).await.unwrap();
        assert_eq!(got, expected);
        assert_eq!(transfer.settle(true).await.unwrap(), Some(expected.len() as u64));
    }

    #[tokio::test]
    async fn test_producer_error_reaches_reader_and_settle() {
        let pool = TransferPool::new(1);
        let (mut pipe, transfer) =
            receive_upload(&pool, Box::new(Flaky { sent: false }), Duration::from_secs(5))
                .await
                .unwrap();
        let mut got = Vec::new();
        let err = pipe.read_to_end(&mut got).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionReset);
        let err = transfer.settle(true).await.unwrap_err();
        assert_eq!(err.kind, BridgeErrorKind::TransferAborted);
    }

    #[tokio::test]
    async fn test_dropped_pipe_is_not_a_transfer_error() {
        let pool = TransferPool::new(1);
        // Client keeps the connection open and idle after a first chunk.
        let (server, mut client) = tokio::io::duplex(1024);
        client.write_all(b"first chunk").await.unwrap();
        let (mut pipe, transfer) =
            receive_upload(&pool, Box::new(server), Duration::from_secs(5)).await.unwrap();
        let mut first = [0u8; 11];
        pipe.read_exact(&mut first).await.unwrap();
        drop(pipe);
        assert_eq!(transfer.settle(true).await.unwrap(), None);
        assert_eq!(pool.admitted(), 0);
        drop(client);
    }

    #[tokio::test]
    async fn test_saturated_pool_rejects() {
        let pool = TransferPool::new(1);
        let mut parked = Vec::new();
        for _ in 0..2 {
            parked.push(pool.submit(std::future::pending::<()>()).unwrap());
        }
        let (server, _client) = tokio::io::duplex(64);
        let err = receive_upload(&pool, Box::new(server), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert_eq!(err.kind, BridgeErrorKind::CapacityExceeded);
        for h in parked {
            h.abort();
        }
    }

    #[tokio::test]
    async fn test_start_gate_times_out_when_no_worker() {
        let pool = TransferPool::new(1);
        let parked = pool.submit(std::future::pending::<()>()).unwrap();
        let (server, _client) = tokio::io::duplex(64);
        let err = receive_upload(&pool, Box::new(server), Duration::from_millis(50))
            .await
            .unwrap_err();
        assert_eq!(err.kind, BridgeErrorKind::TransferAborted);
        parked.abort();
    }

    #[tokio::test]
    async fn test_undrained_settle_aborts() {
        let pool = TransferPool::new(1);
        let (server, _client) = tokio::io::duplex(64);
        let (_pipe, transfer) =
            receive_upload(&pool, Box::new(server), Duration::from_secs(5)).await.unwrap();
        assert_eq!(transfer.settle(false).await.unwrap(), None);
        for _ in 0..10 {
            if pool.active() == 0 {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(pool.active(), 0);
    }

    #[tokio::test]
    async fn test_download_copies_and_closes() {
        let (server, mut client) = tokio::io::duplex(1024);
        let mut conn: DataConnection = Box::new(server);
        let sent = send_download(&mut conn, MessageBody::from_bytes("a.txt\r\nb.txt\r\n"))
            .await
            .unwrap();
        assert_eq!(sent, 14);
        let mut got = String::new();
        client.read_to_string(&mut got).await.unwrap();
        assert_eq!(got, "a.txt\r\nb.txt\r\n");
    }
}
