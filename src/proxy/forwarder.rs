use bytes::Bytes;
use tracing::{debug, info, trace};

use crate::error::{Error, Result};
use crate::proxy::connection::{Connection, Incoming};
use crate::proxy::context::Context;
use crate::proxy::latch::{Latch, LatchWatch};
use crate::proxy::target::{ProxyTarget, Target};

/// Owns the single outbound connection of a bridge.
///
/// The target is resolved once, at construction. Requests are written to the
/// upstream verbatim and every chunk the upstream sends back is relayed to the
/// client unmodified, in arrival order. The relay stops reading the upstream
/// while the client's write queue is full.
pub struct Forwarder {
    ctx: Context,
    client: Connection,
    target: Target,
    pending: Bytes,
    upstream: Option<Connection>,
    closed: Latch,
}

impl Forwarder {
    pub fn new(
        ctx: Context,
        client: Connection,
        request: Bytes,
        proxy: &ProxyTarget,
    ) -> Result<Self> {
        let target = Target::resolve(proxy, &request)?;
        Ok(Self {
            ctx,
            client,
            target,
            pending: request,
            upstream: None,
            closed: Latch::new(),
        })
    }

    pub fn target(&self) -> &Target {
        &self.target
    }

    /// Open the outbound connection and start relaying responses.
    ///
    /// Resolves to the forwarder itself so close handling can be wired once
    /// the upstream exists.
    pub async fn connect(mut self) -> Result<Self> {
        let (upstream, incoming) = self.ctx.connect(&self.target).await?;
        info!(client = %self.client.label(), upstream = %self.target, "upstream connected");

        tokio::spawn(relay(incoming, self.client.clone(), self.closed.clone()));
        self.upstream = Some(upstream);
        Ok(self)
    }

    /// Replace the pending request. Anything already sent is unaffected.
    pub fn new_request(&mut self, request: Bytes) {
        self.pending = request;
    }

    /// Write the pending request to the upstream.
    pub fn send_request(&self) -> Result<()> {
        let upstream = self.upstream.as_ref().ok_or(Error::NotConnected)?;
        trace!(upstream = %self.target, bytes = self.pending.len(), "sending request");
        upstream.write(self.pending.clone())
    }

    /// Like [`Forwarder::send_request`], but waits for room in the upstream's
    /// write queue instead of failing.
    pub async fn flush_request(&self) -> Result<()> {
        let upstream = self.upstream.as_ref().ok_or(Error::NotConnected)?;
        trace!(upstream = %self.target, bytes = self.pending.len(), "flushing request");
        upstream.send(self.pending.clone()).await;
        Ok(())
    }

    pub fn close(&self) {
        if let Some(ref upstream) = self.upstream {
            upstream.close();
        }
        if self.closed.fire() {
            debug!(upstream = %self.target, "forwarder closed");
        }
    }

    /// Resolves once the outbound connection has closed. May be taken before
    /// `connect` completes.
    pub fn on_closed(&self) -> LatchWatch {
        self.closed.watch()
    }
}

impl Drop for Forwarder {
    fn drop(&mut self) {
        self.close();
    }
}

async fn relay(mut upstream: Incoming, client: Connection, closed: Latch) {
    while let Some(chunk) = upstream.next_chunk().await {
        trace!(client = %client.label(), bytes = chunk.len(), "relaying response chunk");
        client.send(chunk).await;
    }
    closed.fire();
}
