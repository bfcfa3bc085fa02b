use std::time::Duration;

use jobqueue::{QueueError, Result};
use url::Url;

pub(crate) const DEFAULT_PORT: u16 = 6379;
pub(crate) const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(3);

/// Where and how to reach the Redis server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedisOptions {
    pub host: String,
    pub port: u16,
    pub password: Option<String>,
    pub db: i64,
    pub connect_timeout: Duration,
}

impl Default for RedisOptions {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: DEFAULT_PORT,
            password: None,
            db: 0,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }
}

impl RedisOptions {
    /// Parse `redis://[:password@]host[:port][/db]`.
    pub fn from_url(raw: &str) -> Result<Self> {
        let invalid = |detail: String| QueueError::Connection(format!("redis url {raw:?}: {detail}"));

        let url = Url::parse(raw).map_err(|e| invalid(e.to_string()))?;
        if url.scheme() != "redis" {
            return Err(invalid(format!("unsupported scheme {:?}", url.scheme())));
        }
        let host = url
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| invalid("missing host".to_string()))?;

        let db = match url.path().trim_matches('/') {
            "" => 0,
            db => db
                .parse()
                .map_err(|_| invalid(format!("database must be a number, got {db:?}")))?,
        };

        Ok(Self {
            host: host.to_string(),
            port: url.port().unwrap_or(DEFAULT_PORT),
            password: url.password().map(str::to_string),
            db,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        })
    }
}
