use std::time::Duration;

use jobqueue::{QueueError, Result};
use redis::{Cmd, Connection, FromRedisValue, RedisError};
use tracing::{debug, warn};

/// Arguments of the last successful `connect`.
#[derive(Debug, Clone)]
struct ConnectContext {
    host: String,
    port: u16,
    timeout: Duration,
}

/// Redis connection that survives the server going away.
///
/// Remembers the last successful connect, `AUTH` and `SELECT`. When a command
/// fails because the connection was dropped, the adapter reconnects, replays
/// that context and retries the command exactly once; any other failure, or a
/// second failure, is returned to the caller. Connecting itself is never
/// retried.
#[derive(Default)]
pub struct RedisAdapter {
    conn: Option<Connection>,
    connect: Option<ConnectContext>,
    auth: Option<String>,
    select: Option<i64>,
}

impl RedisAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_connected(&self) -> bool {
        self.conn.is_some()
    }

    pub fn connect(&mut self, host: &str, port: u16, timeout: Duration) -> Result<()> {
        let context = ConnectContext {
            host: host.to_string(),
            port,
            timeout,
        };
        self.conn = Some(open(&context)?);
        debug!(host = %context.host, port = context.port, "connected to redis");
        self.connect = Some(context);
        Ok(())
    }

    pub fn auth(&mut self, password: &str) -> Result<()> {
        self.query::<()>(redis::cmd("AUTH").arg(password))?;
        self.auth = Some(password.to_string());
        Ok(())
    }

    pub fn select(&mut self, db: i64) -> Result<()> {
        self.query::<()>(redis::cmd("SELECT").arg(db))?;
        self.select = Some(db);
        Ok(())
    }

    /// Drop the connection and forget the replay context.
    pub fn close(&mut self) {
        self.conn = None;
        self.connect = None;
        self.auth = None;
        self.select = None;
    }

    /// Run `cmd`, reconnecting and retrying once if the connection dropped.
    pub fn query<T: FromRedisValue>(&mut self, cmd: &Cmd) -> Result<T> {
        let conn = self
            .conn
            .as_mut()
            .ok_or_else(|| QueueError::Connection("not connected".into()))?;

        match cmd.query(conn) {
            Ok(value) => Ok(value),
            Err(e) if is_connection_dropped(&e) => {
                warn!(error = %e, "redis connection dropped, reconnecting");
                self.replay()?;
                let conn = self
                    .conn
                    .as_mut()
                    .ok_or_else(|| QueueError::Connection("not connected".into()))?;
                cmd.query(conn).map_err(command_error)
            }
            Err(e) => Err(command_error(e)),
        }
    }

    /// Reconnect and re-issue `AUTH`/`SELECT` from the saved context.
    fn replay(&mut self) -> Result<()> {
        self.conn = None;
        let context = self
            .connect
            .as_ref()
            .ok_or_else(|| QueueError::Connection("no connection to replay".into()))?;
        let mut conn = open(context)?;

        if let Some(password) = &self.auth {
            redis::cmd("AUTH")
                .arg(password)
                .query::<()>(&mut conn)
                .map_err(|e| QueueError::Connection(format!("replay AUTH: {e}")))?;
        }
        if let Some(db) = self.select {
            redis::cmd("SELECT")
                .arg(db)
                .query::<()>(&mut conn)
                .map_err(|e| QueueError::Connection(format!("replay SELECT {db}: {e}")))?;
        }

        self.conn = Some(conn);
        Ok(())
    }
}

fn open(context: &ConnectContext) -> Result<Connection> {
    let host = if context.host.contains(':') && !context.host.starts_with('[') {
        format!("[{}]", context.host)
    } else {
        context.host.clone()
    };
    let url = format!("redis://{host}:{}/", context.port);

    let client = redis::Client::open(url.as_str())
        .map_err(|e| QueueError::Connection(format!("{url}: {e}")))?;
    client
        .get_connection_with_timeout(context.timeout)
        .map_err(|e| QueueError::Connection(format!("connect {url}: {e}")))
}

/// The "server went away" class: worth one reconnect.
fn is_connection_dropped(e: &RedisError) -> bool {
    e.is_connection_dropped() || e.is_io_error()
}

fn command_error(e: RedisError) -> QueueError {
    if is_connection_dropped(&e) {
        QueueError::Connection(e.to_string())
    } else {
        QueueError::Command(e.to_string())
    }
}
