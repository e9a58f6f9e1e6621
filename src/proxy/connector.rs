use async_trait::async_trait;
use tokio::net::TcpStream;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::proxy::connection::ByteStream;
use crate::proxy::target::Target;

/// Opens outbound streams to resolved targets.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, target: &Target) -> Result<Box<dyn ByteStream>>;
}

/// Plain TCP. The connect deadline is applied by the caller.
#[derive(Debug, Default)]
pub struct TcpConnector;

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self, target: &Target) -> Result<Box<dyn ByteStream>> {
        let stream = TcpStream::connect((target.host.as_str(), target.port))
            .await
            .map_err(|source| Error::Connect {
                target: target.to_string(),
                source,
            })?;

        if let Err(e) = stream.set_nodelay(true) {
            warn!(upstream = %target, error = %e, "failed to set TCP_NODELAY");
        }
        debug!(upstream = %target, "outbound TCP connection established");

        Ok(Box::new(stream))
    }
}
