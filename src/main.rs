mod config;
mod error;
mod proxy;

use std::sync::Arc;

use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use crate::config::{Config, LogFormat};
use crate::proxy::bridge::BridgeSettings;
use crate::proxy::connector::TcpConnector;
use crate::proxy::context::Context;

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let config = match Config::from_env() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("fatal: {e}");
            std::process::exit(1);
        }
    };

    init_logging(&config.log_format);
    info!(
        listen = %config.listen_addr,
        proxy_host = config.proxy.host.as_deref().unwrap_or("<from Host header>"),
        single_client = config.single_client,
        "proxy-piggy starting"
    );

    if let Err(e) = run(config).await {
        error!(error = %e, "proxy-piggy exited with error");
        std::process::exit(1);
    }
}

async fn run(config: Config) -> error::Result<()> {
    let ctx = Context::start(Arc::new(TcpConnector), config.connect_timeout);

    let settings = Arc::new(BridgeSettings {
        proxy: config.proxy.clone(),
        max_pending_bytes: config.max_pending_bytes,
        stop_context_on_close: config.single_client,
    });

    // Spawn the listener; it returns once the context is stopped.
    let listener_ctx = ctx.clone();
    let mut listener_handle = tokio::spawn(async move {
        proxy::listener::run(config.listen_addr, listener_ctx, settings).await
    });

    let mut stopped = ctx.stopped();
    tokio::select! {
        _ = shutdown_signal() => {
            info!("shutdown signal received, stopping...");
            ctx.stop();
        }
        _ = stopped.wait() => {}
        result = &mut listener_handle => {
            // Bind failures end the listener before anything else happens.
            ctx.stop();
            return flatten(result);
        }
    }

    let result = flatten(listener_handle.await);
    info!("proxy-piggy stopped");
    result
}

fn flatten(joined: Result<error::Result<()>, tokio::task::JoinError>) -> error::Result<()> {
    match joined {
        Ok(result) => result,
        Err(e) => Err(error::Error::Io(std::io::Error::other(e))),
    }
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("failed to register SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.expect("failed to listen for Ctrl+C");
    }
}

fn init_logging(format: &LogFormat) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);

    match format {
        LogFormat::Json => subscriber.json().init(),
        LogFormat::Pretty => subscriber.init(),
    }
}
