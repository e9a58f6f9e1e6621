use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

use crate::error::Result;
use crate::proxy::bridge::{BridgeSettings, ConnectionBridge};
use crate::proxy::connection::Connection;
use crate::proxy::context::Context;

/// Run the proxy listener.
///
/// Binds `listen_addr` and bridges every accepted connection until the
/// execution context is stopped.
pub async fn run(
    listen_addr: SocketAddr,
    ctx: Context,
    settings: Arc<BridgeSettings>,
) -> Result<()> {
    let listener = TcpListener::bind(listen_addr).await?;
    info!(addr = %listen_addr, "proxy listening");
    serve(listener, ctx, settings).await
}

/// Accept loop over an already bound listener.
///
/// When `stop_context_on_close` is set only one client is accepted; the loop
/// then waits for that bridge to stop the context.
pub async fn serve(
    listener: TcpListener,
    ctx: Context,
    settings: Arc<BridgeSettings>,
) -> Result<()> {
    let mut stopped = ctx.stopped();

    loop {
        let (tcp_stream, peer_addr) = tokio::select! {
            result = listener.accept() => match result {
                Ok(conn) => conn,
                Err(e) => {
                    error!(error = %e, "failed to accept TCP connection");
                    continue;
                }
            },
            _ = stopped.wait() => {
                info!("proxy listener shutting down");
                return Ok(());
            }
        };

        debug!(peer = %peer_addr, "accepted TCP connection");
        if let Err(e) = tcp_stream.set_nodelay(true) {
            warn!(peer = %peer_addr, error = %e, "failed to set TCP_NODELAY");
        }

        let (client, incoming) = Connection::open(tcp_stream, peer_addr.to_string());
        let bridge = ConnectionBridge::new(ctx.clone(), client, incoming, settings.clone());
        tokio::spawn(async move {
            match bridge.run().await {
                Ok(()) => debug!(peer = %peer_addr, "bridge finished"),
                Err(e) => debug!(peer = %peer_addr, error = %e, "bridge closed with error"),
            }
        });

        if settings.stop_context_on_close {
            info!(
                peer = %peer_addr,
                "single client accepted, no longer accepting connections"
            );
            break;
        }
    }

    drop(listener);
    stopped.wait().await;
    info!("proxy listener shutting down");
    Ok(())
}
