//! A `QueueSource` over a Redis list.

use crate::config::RedisConfig;
use crate::core::{Message, QueueSource};
use crate::queue::{decode_batch, QueueError};
use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::{Client, ConnectionAddr, ConnectionInfo, IntoConnectionInfo, RedisConnectionInfo};
use std::future::Future;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{debug, info, instrument, warn};

/// Pops messages with `RPOP`, one item per round trip.
pub struct RedisQueue {
    client: Client,
    conn: Mutex<Option<MultiplexedConnection>>,
    conn_timeout: Duration,
    read_timeout: Duration,
}

impl RedisQueue {
    /// Creates the client. No connection is made until the first pop.
    pub fn new(config: &RedisConfig) -> Result<Self, QueueError> {
        let client = Client::open(connection_info(config)?)?;
        info!(addr = %config.addr, db = config.db, "Redis queue client created");
        Ok(Self {
            client,
            conn: Mutex::new(None),
            conn_timeout: Duration::from_millis(config.timeout.conn_ms),
            read_timeout: Duration::from_millis(config.timeout.read_ms),
        })
    }

    /// Returns the cached connection, connecting first if there is none.
    async fn connection(&self) -> Result<MultiplexedConnection, QueueError> {
        let mut slot = self.conn.lock().await;
        if let Some(conn) = slot.as_ref() {
            return Ok(conn.clone());
        }
        let conn = with_timeout(
            self.conn_timeout,
            self.client.get_multiplexed_async_connection(),
        )
        .await?;
        debug!("Connected to Redis");
        *slot = Some(conn.clone());
        Ok(conn)
    }

    /// Drops the cached connection so the next pop reconnects.
    async fn reset(&self) {
        self.conn.lock().await.take();
    }
}

const DEFAULT_PORT: u16 = 6379;

/// Builds the connection settings field by field, so the password is used
/// verbatim rather than parsed out of a URL.
fn connection_info(config: &RedisConfig) -> Result<ConnectionInfo, QueueError> {
    let invalid = || QueueError::InvalidAddress(config.addr.clone());
    let (host, port) = match config.addr.rsplit_once(':') {
        Some((host, port)) if !host.ends_with(':') => {
            (host, port.parse::<u16>().map_err(|_| invalid())?)
        }
        _ => (config.addr.as_str(), DEFAULT_PORT),
    };
    let host = host.trim_start_matches('[').trim_end_matches(']');
    if host.is_empty() {
        return Err(invalid());
    }

    let mut redis = RedisConnectionInfo::default().set_db(config.db);
    if let Some(pass) = config.pass.as_deref().filter(|p| !p.is_empty()) {
        redis = redis.set_password(pass);
    }
    Ok(ConnectionAddr::Tcp(host.to_string(), port)
        .into_connection_info()?
        .set_redis_settings(redis))
}

async fn with_timeout<T, F>(limit: Duration, fut: F) -> Result<T, QueueError>
where
    F: Future<Output = Result<T, redis::RedisError>>,
{
    match timeout(limit, fut).await {
        Ok(result) => result.map_err(QueueError::from),
        Err(_) => Err(QueueError::Timeout(limit.as_millis() as u64)),
    }
}

#[async_trait]
impl QueueSource for RedisQueue {
    #[instrument(skip(self))]
    async fn pop(&self, count: usize, queue: &str) -> Result<Vec<Message>, QueueError> {
        let mut conn = self.connection().await?;
        let mut raw = Vec::with_capacity(count);

        for _ in 0..count {
            let reply = with_timeout(
                self.read_timeout,
                redis::cmd("RPOP")
                    .arg(queue)
                    .query_async::<Option<String>>(&mut conn),
            )
            .await;
            match reply {
                Ok(Some(item)) => raw.push(item),
                Ok(None) => break,
                Err(e) => {
                    self.reset().await;
                    if raw.is_empty() {
                        return Err(e);
                    }
                    // Items already popped are gone from Redis; hand them on.
                    warn!(queue, error = %e, "RPOP failed mid-batch");
                    break;
                }
            }
        }

        Ok(decode_batch(queue, raw))
    }
}
