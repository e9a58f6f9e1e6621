use std::io;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("malformed request: {0}")]
    MalformedRequest(String),

    #[error("failed to connect to {target}: {source}")]
    Connect {
        target: String,
        #[source]
        source: io::Error,
    },

    #[error("connect to {target} timed out after {timeout:?}")]
    ConnectTimeout { target: String, timeout: Duration },

    #[error("{queued} bytes queued while connecting upstream, limit is {limit}")]
    PendingOverflow { queued: usize, limit: usize },

    #[error("write queue to {conn} is full ({limit} chunks)")]
    WriteBacklog { conn: String, limit: usize },

    #[error("upstream connection not established")]
    NotConnected,

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
