//! In-memory streams and connectors for exercising bridges without sockets.

use std::collections::VecDeque;
use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context as TaskContext, Poll, Waker};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::{mpsc, oneshot};

use crate::error::{Error, Result};
use crate::proxy::connection::ByteStream;
use crate::proxy::connector::Connector;
use crate::proxy::target::Target;

#[derive(Default)]
struct StreamLog {
    writes: Vec<Bytes>,
    shutdowns: usize,
    reads: usize,
    stalled: bool,
    blocked_writer: Option<Waker>,
}

/// Stream whose reads are fed chunk by chunk from a [`MockPeer`] and whose
/// writes are recorded one entry per `poll_write`.
pub struct MockStream {
    chunks: mpsc::UnboundedReceiver<Bytes>,
    leftover: Bytes,
    log: Arc<Mutex<StreamLog>>,
}

/// Far end of a [`MockStream`].
pub struct MockPeer {
    tx: Option<mpsc::UnboundedSender<Bytes>>,
    log: Arc<Mutex<StreamLog>>,
}

pub fn mock_pair() -> (MockStream, MockPeer) {
    let (tx, rx) = mpsc::unbounded_channel();
    let log = Arc::new(Mutex::new(StreamLog::default()));
    let stream = MockStream {
        chunks: rx,
        leftover: Bytes::new(),
        log: log.clone(),
    };
    let peer = MockPeer { tx: Some(tx), log };
    (stream, peer)
}

impl MockPeer {
    /// Deliver one chunk to the stream's reader.
    pub fn send(&self, data: &[u8]) {
        assert!(!data.is_empty(), "empty chunks read as end of stream");
        if let Some(ref tx) = self.tx {
            let _ = tx.send(Bytes::copy_from_slice(data));
        }
    }

    /// End of stream for the reader once buffered chunks are consumed.
    pub fn hang_up(&mut self) {
        self.tx.take();
    }

    pub fn writes(&self) -> Vec<Bytes> {
        self.log.lock().unwrap().writes.clone()
    }

    pub fn shutdowns(&self) -> usize {
        self.log.lock().unwrap().shutdowns
    }

    /// Chunks the stream's reader has consumed so far.
    pub fn reads(&self) -> usize {
        self.log.lock().unwrap().reads
    }

    /// Make every write on the stream pend until [`MockPeer::resume_writes`].
    pub fn stall_writes(&self) {
        self.log.lock().unwrap().stalled = true;
    }

    pub fn resume_writes(&self) {
        let mut log = self.log.lock().unwrap();
        log.stalled = false;
        if let Some(waker) = log.blocked_writer.take() {
            waker.wake();
        }
    }
}

impl AsyncRead for MockStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if self.leftover.is_empty() {
            match self.chunks.poll_recv(cx) {
                Poll::Ready(Some(chunk)) => {
                    self.log.lock().unwrap().reads += 1;
                    self.leftover = chunk;
                }
                Poll::Ready(None) => return Poll::Ready(Ok(())),
                Poll::Pending => return Poll::Pending,
            }
        }
        let n = buf.remaining().min(self.leftover.len());
        let chunk = self.leftover.split_to(n);
        buf.put_slice(&chunk);
        Poll::Ready(Ok(()))
    }
}

impl AsyncWrite for MockStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let mut log = self.log.lock().unwrap();
        if log.stalled {
            log.blocked_writer = Some(cx.waker().clone());
            return Poll::Pending;
        }
        log.writes.push(Bytes::copy_from_slice(buf));
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut TaskContext<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut TaskContext<'_>) -> Poll<io::Result<()>> {
        self.log.lock().unwrap().shutdowns += 1;
        Poll::Ready(Ok(()))
    }
}

/// Connector handing out pre-built [`MockStream`]s in order.
#[derive(Default)]
pub struct MockConnector {
    streams: Mutex<VecDeque<MockStream>>,
    attempts: Mutex<Vec<Target>>,
    gate: Mutex<Option<oneshot::Receiver<()>>>,
    refuse: bool,
}

impl MockConnector {
    /// Connector with one upstream stream ready; returns the upstream's peer.
    pub fn with_upstream() -> (Arc<Self>, MockPeer) {
        let (stream, peer) = mock_pair();
        let connector = Self {
            streams: Mutex::new(VecDeque::from([stream])),
            ..Default::default()
        };
        (Arc::new(connector), peer)
    }

    /// Like [`MockConnector::with_upstream`] but the first connect stays
    /// pending until the returned sender fires.
    pub fn gated() -> (Arc<Self>, MockPeer, oneshot::Sender<()>) {
        let (stream, peer) = mock_pair();
        let (release, gate) = oneshot::channel();
        let connector = Self {
            streams: Mutex::new(VecDeque::from([stream])),
            gate: Mutex::new(Some(gate)),
            ..Default::default()
        };
        (Arc::new(connector), peer, release)
    }

    pub fn refusing() -> Arc<Self> {
        Arc::new(Self {
            refuse: true,
            ..Default::default()
        })
    }

    pub fn attempts(&self) -> Vec<Target> {
        self.attempts.lock().unwrap().clone()
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self, target: &Target) -> Result<Box<dyn ByteStream>> {
        self.attempts.lock().unwrap().push(target.clone());

        let gate = self.gate.lock().unwrap().take();
        if let Some(gate) = gate {
            let _ = gate.await;
        }

        if self.refuse {
            return Err(Error::Connect {
                target: target.to_string(),
                source: io::ErrorKind::ConnectionRefused.into(),
            });
        }

        let stream = self.streams.lock().unwrap().pop_front().ok_or_else(|| Error::Connect {
            target: target.to_string(),
            source: io::ErrorKind::AddrNotAvailable.into(),
        })?;
        Ok(Box::new(stream))
    }
}

/// Poll `cond` until it holds, failing the test after two seconds.
pub async fn wait_until(mut cond: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(2), async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}
