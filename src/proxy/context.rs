use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::error::{Error, Result};
use crate::proxy::connection::{Connection, Incoming};
use crate::proxy::connector::Connector;
use crate::proxy::latch::{Latch, LatchWatch};
use crate::proxy::target::Target;

/// Execution context shared by every bridge on a listener.
///
/// Holds the outbound connector, the bound on each connect and a stop
/// signal. Whoever assembles the
/// bridges owns its lifecycle; cloning hands out another handle to the same
/// context.
#[derive(Clone)]
pub struct Context {
    connector: Arc<dyn Connector>,
    connect_timeout: Duration,
    stopped: Latch,
}

impl Context {
    pub fn start(connector: Arc<dyn Connector>, connect_timeout: Duration) -> Self {
        info!(?connect_timeout, "execution context started");
        Self {
            connector,
            connect_timeout,
            stopped: Latch::new(),
        }
    }

    /// Stop the context. Returns `true` only for the call that stopped it.
    pub fn stop(&self) -> bool {
        let stopped = self.stopped.fire();
        if stopped {
            info!("execution context stopped");
        }
        stopped
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.is_set()
    }

    pub fn stopped(&self) -> LatchWatch {
        self.stopped.watch()
    }

    /// Open an outbound connection to `target`, giving up after the
    /// context's connect timeout.
    pub async fn connect(&self, target: &Target) -> Result<(Connection, Incoming)> {
        let stream = tokio::time::timeout(self.connect_timeout, self.connector.connect(target))
            .await
            .map_err(|_| Error::ConnectTimeout {
                target: target.to_string(),
                timeout: self.connect_timeout,
            })??;
        Ok(Connection::open(stream, target.to_string()))
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("connect_timeout", &self.connect_timeout)
            .field("stopped", &self.stopped.is_set())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::testing::MockConnector;

    const TIMEOUT: Duration = Duration::from_secs(5);

    #[tokio::test]
    async fn stop_happens_once() {
        let (connector, _upstream) = MockConnector::with_upstream();
        let ctx = Context::start(connector, TIMEOUT);
        let other = ctx.clone();

        assert!(!ctx.is_stopped());
        assert!(other.stop());
        assert!(!ctx.stop());
        assert!(ctx.is_stopped());
        ctx.stopped().wait().await;
    }

    #[tokio::test]
    async fn connect_goes_through_connector() {
        let (connector, _upstream) = MockConnector::with_upstream();
        let ctx = Context::start(connector.clone(), TIMEOUT);

        let (conn, _incoming) = ctx.connect(&Target::new("example.com", 80)).await.unwrap();
        assert_eq!(conn.label(), "example.com:80");
        assert_eq!(connector.attempts(), vec![Target::new("example.com", 80)]);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_connect_times_out() {
        let (connector, _upstream, _release) = MockConnector::gated();
        let ctx = Context::start(connector.clone(), TIMEOUT);

        let started = tokio::time::Instant::now();
        let err = ctx
            .connect(&Target::new("example.com", 80))
            .await
            .err()
            .unwrap();

        assert!(
            matches!(err, Error::ConnectTimeout { timeout, .. } if timeout == TIMEOUT),
            "{err}"
        );
        assert!(started.elapsed() >= TIMEOUT);
        assert_eq!(connector.attempts().len(), 1);
    }
}
