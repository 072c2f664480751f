use std::{
    fmt,
    net::SocketAddr,
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};
use tokio::{
    io::{AsyncWrite, AsyncWriteExt},
    sync::Mutex,
};
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

/// Boxed write half of a client stream.
pub type Writer = Box<dyn AsyncWrite + Send + Unpin>;

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identifier of an accepted connection. Ids grow in accept order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    fn next() -> Self {
        Self(NEXT_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Failure to deliver a line to one peer.
#[derive(Debug, thiserror::Error)]
pub enum SendError {
    /// The connection was closed before or during the send.
    #[error("connection is closed")]
    Closed,
    /// The peer did not accept the line within the deadline.
    #[error("send timed out after {0:?}")]
    TimedOut(Duration),
    /// The underlying write failed.
    #[error("write failed")]
    Io(#[from] std::io::Error),
}

/// The sending side of one client stream.
///
/// The reading side stays with the task handling the connection; this half is
/// shared (behind an [`std::sync::Arc`]) with everyone that delivers to the peer.
pub struct Connection {
    id: ConnectionId,
    addr: SocketAddr,
    writer: Mutex<Option<Writer>>,
    closed: CancellationToken,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("addr", &self.addr)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Connection {
    /// Wrap the write half of a freshly accepted stream.
    pub fn new<W>(addr: SocketAddr, writer: W) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            id: ConnectionId::next(),
            addr,
            writer: Mutex::new(Some(Box::new(writer))),
            closed: CancellationToken::new(),
        }
    }

    /// Identifier of this connection.
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Remote address of the peer.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Whether [`Connection::close`] was called.
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Resolves once the connection is closed, by anyone.
    pub fn closed(&self) -> WaitForCancellationFuture<'_> {
        self.closed.cancelled()
    }

    /// Write one line and flush it, giving up after `timeout`.
    ///
    /// Writes to the same connection are serialized, so lines from concurrent
    /// senders never interleave.
    pub async fn send(&self, line: &str, timeout: Duration) -> Result<(), SendError> {
        if self.is_closed() {
            return Err(SendError::Closed);
        }
        let write = async {
            let mut guard = self.writer.lock().await;
            let writer = guard.as_mut().ok_or(SendError::Closed)?;
            writer.write_all(line.as_bytes()).await?;
            writer.flush().await?;
            Ok::<(), SendError>(())
        };
        tokio::select! {
            result = tokio::time::timeout(timeout, write) => {
                result.map_err(|_elapsed| SendError::TimedOut(timeout))?
            }
            _ = self.closed.cancelled() => Err(SendError::Closed),
        }
    }

    /// Close the connection. Wakes the reader and any pending send; calling it
    /// again does nothing.
    pub async fn close(&self, timeout: Duration) {
        if self.is_closed() {
            return;
        }
        self.closed.cancel();
        let writer = self.writer.lock().await.take();
        if let Some(mut writer) = writer {
            match tokio::time::timeout(timeout, writer.shutdown()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::debug!(conn = %self.id, "shutdown failed: {e}"),
                Err(_) => tracing::debug!(conn = %self.id, "shutdown timed out"),
            }
        }
    }
}
