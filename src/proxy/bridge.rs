use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use tracing::{debug, trace};

use crate::error::{Error, Result};
use crate::proxy::connection::{Connection, Incoming};
use crate::proxy::context::Context;
use crate::proxy::forwarder::Forwarder;
use crate::proxy::target::{self, ProxyTarget};

type Connecting = Pin<Box<dyn Future<Output = Result<Forwarder>> + Send>>;

/// Settings shared by every bridge a listener creates.
#[derive(Debug, Clone)]
pub struct BridgeSettings {
    pub proxy: ProxyTarget,
    /// Bytes a bridge may hold before its upstream is ready: an unfinished
    /// request head, or requests arriving while the connect is in flight.
    pub max_pending_bytes: usize,
    /// Stop the execution context when this bridge's client disconnects.
    /// Only meaningful when a single bridge runs on the context.
    pub stop_context_on_close: bool,
}

enum Upstream {
    /// No complete first request yet.
    Unconnected,
    /// First request received and the connect is in flight. Chunks arriving
    /// meanwhile wait in `queued`, in arrival order.
    Connecting {
        connect: Connecting,
        queued: VecDeque<Bytes>,
        queued_bytes: usize,
    },
    Ready(Forwarder),
}

enum Event {
    Data(Bytes),
    Connected(Result<Forwarder>),
    ClientClosed,
    UpstreamClosed,
}

/// Pairs one client connection with, lazily, exactly one [`Forwarder`].
pub struct ConnectionBridge {
    ctx: Context,
    client: Connection,
    incoming: Incoming,
    settings: Arc<BridgeSettings>,
    upstream: Upstream,
    /// First request bytes held until the header block is complete.
    head: BytesMut,
}

impl ConnectionBridge {
    pub fn new(
        ctx: Context,
        client: Connection,
        incoming: Incoming,
        settings: Arc<BridgeSettings>,
    ) -> Self {
        Self {
            ctx,
            client,
            incoming,
            settings,
            upstream: Upstream::Unconnected,
            head: BytesMut::new(),
        }
    }

    /// Drive the bridge until either side closes or a fatal error occurs.
    ///
    /// On return the client connection and any upstream are closed.
    pub async fn run(mut self) -> Result<()> {
        let result = self.drive().await;
        self.shutdown();
        result
    }

    async fn drive(&mut self) -> Result<()> {
        loop {
            let event = match self.upstream {
                Upstream::Unconnected => next_data(&mut self.incoming).await,
                Upstream::Connecting { ref mut connect, .. } => tokio::select! {
                    event = next_data(&mut self.incoming) => event,
                    result = connect.as_mut() => Event::Connected(result),
                },
                Upstream::Ready(ref forwarder) => {
                    let mut upstream_closed = forwarder.on_closed();
                    tokio::select! {
                        event = next_data(&mut self.incoming) => event,
                        _ = upstream_closed.wait() => Event::UpstreamClosed,
                    }
                }
            };

            match event {
                Event::Data(chunk) => self.handle_request(chunk)?,
                Event::Connected(result) => self.handle_connected(result?).await?,
                Event::ClientClosed => {
                    debug!(peer = %self.client.label(), "client closed connection");
                    self.finish_pending_connect().await;
                    return Ok(());
                }
                Event::UpstreamClosed => {
                    debug!(peer = %self.client.label(), "upstream closed connection");
                    return Ok(());
                }
            }
        }
    }

    fn handle_request(&mut self, chunk: Bytes) -> Result<()> {
        match self.upstream {
            Upstream::Unconnected => {
                self.head.extend_from_slice(&chunk);
                // Without a fixed proxy the Host header decides the target, so
                // the whole header block has to be in before resolving.
                if self.settings.proxy.host.is_none() && !target::head_complete(&self.head) {
                    if self.head.len() > self.settings.max_pending_bytes {
                        return Err(Error::PendingOverflow {
                            queued: self.head.len(),
                            limit: self.settings.max_pending_bytes,
                        });
                    }
                    trace!(
                        peer = %self.client.label(),
                        bytes = self.head.len(),
                        "waiting for the rest of the request head"
                    );
                    return Ok(());
                }

                let forwarder = Forwarder::new(
                    self.ctx.clone(),
                    self.client.clone(),
                    self.head.split().freeze(),
                    &self.settings.proxy,
                )?;
                debug!(
                    peer = %self.client.label(),
                    upstream = %forwarder.target(),
                    "connecting upstream"
                );
                self.upstream = Upstream::Connecting {
                    connect: Box::pin(forwarder.connect()),
                    queued: VecDeque::new(),
                    queued_bytes: 0,
                };
            }
            Upstream::Connecting {
                ref mut queued,
                ref mut queued_bytes,
                ..
            } => {
                *queued_bytes += chunk.len();
                if *queued_bytes > self.settings.max_pending_bytes {
                    return Err(Error::PendingOverflow {
                        queued: *queued_bytes,
                        limit: self.settings.max_pending_bytes,
                    });
                }
                trace!(
                    peer = %self.client.label(),
                    bytes = chunk.len(),
                    "queueing request until upstream is ready"
                );
                queued.push_back(chunk);
            }
            // A full upstream write queue is fatal, like an overflowing
            // connect queue.
            Upstream::Ready(ref mut forwarder) => {
                forwarder.new_request(chunk);
                forwarder.send_request()?;
            }
        }
        Ok(())
    }

    /// Sends the first request and then everything queued during the
    /// connect. The queue was already capped by `max_pending_bytes`, so these
    /// wait for room on the upstream rather than fail.
    async fn handle_connected(&mut self, mut forwarder: Forwarder) -> Result<()> {
        let queued = match std::mem::replace(&mut self.upstream, Upstream::Unconnected) {
            Upstream::Connecting { queued, .. } => queued,
            _ => VecDeque::new(),
        };

        forwarder.flush_request().await?;
        for chunk in queued {
            forwarder.new_request(chunk);
            forwarder.flush_request().await?;
        }

        self.upstream = Upstream::Ready(forwarder);
        Ok(())
    }

    /// A connect still in flight when the client leaves is allowed to finish
    /// so its outbound connection can be closed rather than left dangling.
    async fn finish_pending_connect(&mut self) {
        let Upstream::Connecting { ref mut connect, .. } = self.upstream else {
            return;
        };

        match connect.as_mut().await {
            Ok(forwarder) => {
                debug!(
                    peer = %self.client.label(),
                    "client left before upstream connected, closing upstream"
                );
                forwarder.close();
            }
            Err(e) => {
                debug!(
                    peer = %self.client.label(),
                    error = %e,
                    "pending upstream connect failed"
                );
            }
        }
        self.upstream = Upstream::Unconnected;
    }

    fn shutdown(&mut self) {
        if let Upstream::Ready(ref forwarder) = self.upstream {
            forwarder.close();
        }
        self.upstream = Upstream::Unconnected;
        self.client.close();

        if self.settings.stop_context_on_close {
            self.ctx.stop();
        }
    }
}

async fn next_data(incoming: &mut Incoming) -> Event {
    match incoming.next_chunk().await {
        Some(chunk) => Event::Data(chunk),
        None => Event::ClientClosed,
    }
}
