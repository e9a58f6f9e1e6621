use std::env;
use std::net::SocketAddr;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::proxy::target::ProxyTarget;

#[derive(Debug, Clone)]
pub struct Config {
    pub listen_addr: SocketAddr,
    pub proxy: ProxyTarget,
    pub connect_timeout: Duration,
    pub max_pending_bytes: usize,
    pub single_client: bool,
    pub log_format: LogFormat,
}

#[derive(Debug, Clone, PartialEq)]
pub enum LogFormat {
    Json,
    Pretty,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let listen_addr: SocketAddr = lookup("LISTEN_ADDR")
            .unwrap_or_else(|| "0.0.0.0:8080".into())
            .parse()
            .map_err(|e| Error::Config(format!("invalid LISTEN_ADDR: {e}")))?;

        let proxy_host = lookup("PROXY_HOST");
        if proxy_host.as_deref().is_some_and(|host| host.trim().is_empty()) {
            return Err(Error::Config("PROXY_HOST must not be empty".into()));
        }

        let proxy_port = match lookup("PROXY_PORT") {
            Some(raw) => {
                let port: u16 = raw
                    .parse()
                    .map_err(|e| Error::Config(format!("invalid PROXY_PORT: {e}")))?;
                if port == 0 {
                    return Err(Error::Config("PROXY_PORT must be non-zero".into()));
                }
                if proxy_host.is_none() {
                    return Err(Error::Config(
                        "PROXY_PORT is set but PROXY_HOST is not".into(),
                    ));
                }
                Some(port)
            }
            None => None,
        };

        let connect_timeout_secs: u64 = lookup("CONNECT_TIMEOUT_SECS")
            .unwrap_or_else(|| "10".into())
            .parse()
            .map_err(|e| Error::Config(format!("invalid CONNECT_TIMEOUT_SECS: {e}")))?;

        if connect_timeout_secs == 0 {
            return Err(Error::Config(
                "CONNECT_TIMEOUT_SECS must be greater than zero".into(),
            ));
        }

        let max_pending_bytes: usize = lookup("MAX_PENDING_BYTES")
            .unwrap_or_else(|| "1048576".into())
            .parse()
            .map_err(|e| Error::Config(format!("invalid MAX_PENDING_BYTES: {e}")))?;

        let single_client = match lookup("SINGLE_CLIENT")
            .unwrap_or_else(|| "false".into())
            .to_lowercase()
            .as_str()
        {
            "true" | "1" => true,
            "false" | "0" => false,
            other => {
                return Err(Error::Config(format!(
                    "invalid SINGLE_CLIENT '{other}': must be 'true' or 'false'"
                )))
            }
        };

        let log_format = match lookup("LOG_FORMAT")
            .unwrap_or_else(|| "json".into())
            .to_lowercase()
            .as_str()
        {
            "json" => LogFormat::Json,
            "pretty" => LogFormat::Pretty,
            other => {
                return Err(Error::Config(format!(
                    "invalid LOG_FORMAT '{other}': must be 'json' or 'pretty'"
                )))
            }
        };

        Ok(Config {
            listen_addr,
            proxy: ProxyTarget {
                host: proxy_host.map(|host| host.trim().to_string()),
                port: proxy_port,
            },
            connect_timeout: Duration::from_secs(connect_timeout_secs),
            max_pending_bytes,
            single_client,
            log_format,
        })
    }
}
