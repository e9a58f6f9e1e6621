use std::fmt;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, WriteHalf};
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::error::{Error, Result};
use crate::proxy::latch::{Latch, LatchWatch};

const READ_BUFFER_SIZE: usize = 16 * 1024;

/// Chunks a connection may hold before its writer task catches up.
pub const WRITE_QUEUE_DEPTH: usize = 64;

/// Any bidirectional byte stream a [`Connection`] can drive.
pub trait ByteStream: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> ByteStream for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

/// Handle to one side of a proxied byte stream.
///
/// Writes are queued to a dedicated writer task, one `write_all` per chunk,
/// so chunk boundaries and order survive. The queue holds at most
/// [`WRITE_QUEUE_DEPTH`] chunks.
#[derive(Clone)]
pub struct Connection {
    label: Arc<str>,
    queue: mpsc::Sender<Bytes>,
    closed: Latch,
}

impl Connection {
    /// Take ownership of `stream`, returning the handle and its data reader.
    pub fn open<S: ByteStream>(stream: S, label: impl Into<Arc<str>>) -> (Connection, Incoming) {
        let label = label.into();
        let (reader, writer) = tokio::io::split(stream);
        let (tx, rx) = mpsc::channel(WRITE_QUEUE_DEPTH);
        let closed = Latch::new();

        tokio::spawn(write_loop(writer, rx, closed.clone(), label.clone()));

        let connection = Connection {
            label,
            queue: tx,
            closed,
        };
        let incoming = Incoming {
            reader: Box::new(reader),
            buf: BytesMut::with_capacity(READ_BUFFER_SIZE),
            connection: connection.clone(),
        };
        (connection, incoming)
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Queue `data` without waiting. Dropped if the connection is already
    /// closed; a full queue is an error.
    pub fn write(&self, data: Bytes) -> Result<()> {
        if self.closed.is_set() {
            trace!(conn = %self.label, bytes = data.len(), "dropping write on closed connection");
            return Ok(());
        }
        match self.queue.try_send(data) {
            Ok(()) | Err(mpsc::error::TrySendError::Closed(_)) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => Err(Error::WriteBacklog {
                conn: self.label.to_string(),
                limit: WRITE_QUEUE_DEPTH,
            }),
        }
    }

    /// Queue `data`, waiting for room. Returns early if the connection closes.
    pub async fn send(&self, data: Bytes) {
        let mut closed = self.closed.watch();
        tokio::select! {
            _ = self.queue.send(data) => {}
            _ = closed.wait() => {}
        }
    }

    /// Close the connection after any queued writes are flushed.
    ///
    /// Returns `true` only for the call that actually closed it.
    pub fn close(&self) -> bool {
        if !self.closed.fire() {
            return false;
        }
        debug!(conn = %self.label, "closing connection");
        true
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_set()
    }

    /// Resolves once the connection is closed by either side.
    pub fn on_closed(&self) -> LatchWatch {
        self.closed.watch()
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("label", &self.label)
            .field("closed", &self.closed.is_set())
            .finish()
    }
}

/// Read side of a [`Connection`].
pub struct Incoming {
    reader: Box<dyn AsyncRead + Send + Unpin>,
    buf: BytesMut,
    connection: Connection,
}

impl Incoming {
    /// Next chunk of data in arrival order, or `None` once the connection is
    /// closed. End of stream from the peer closes the connection.
    ///
    /// Cancel safe.
    pub async fn next_chunk(&mut self) -> Option<Bytes> {
        if self.connection.is_closed() {
            return None;
        }

        let mut closed = self.connection.on_closed();
        self.buf.reserve(READ_BUFFER_SIZE);

        let result = tokio::select! {
            result = self.reader.read_buf(&mut self.buf) => result,
            _ = closed.wait() => return None,
        };

        match result {
            Ok(0) => {
                debug!(conn = %self.connection.label, "peer closed connection");
                self.connection.close();
                None
            }
            Ok(n) => {
                trace!(conn = %self.connection.label, bytes = n, "read chunk");
                Some(self.buf.split().freeze())
            }
            Err(e) => {
                debug!(conn = %self.connection.label, error = %e, "read failed");
                self.connection.close();
                None
            }
        }
    }
}

async fn write_loop<S: ByteStream>(
    mut writer: WriteHalf<S>,
    mut queue: mpsc::Receiver<Bytes>,
    closed: Latch,
    label: Arc<str>,
) {
    let mut closing = closed.watch();

    loop {
        // Queued chunks go out before a close is honoured.
        let data = tokio::select! {
            biased;
            data = queue.recv() => match data {
                Some(data) => data,
                None => break,
            },
            _ = closing.wait() => break,
        };

        let result = async {
            writer.write_all(&data).await?;
            writer.flush().await
        }
        .await;

        if let Err(e) = result {
            debug!(conn = %label, error = %e, "write failed");
            closed.fire();
            break;
        }
    }

    if let Err(e) = writer.shutdown().await {
        trace!(conn = %label, error = %e, "shutdown failed");
    }
}
