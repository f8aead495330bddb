//! Fixed-size `may_postgres` connection pool.
//!
//! Connections live in persistent slots. Idle slots sit in a bounded
//! crossbeam channel; acquiring a slot is a `recv_timeout` on that channel,
//! which doubles as the semaphore limiting concurrent database work. A
//! [`PooledClient`] returns its connection to the channel when dropped, and a
//! slot whose connection fails its health check is re-dialed before reuse.

use crate::config::DatabaseConfig;
use crate::connection::{check_connection_health, connect, ConnectionError};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use may_postgres::Client;
use std::ops::Deref;
use std::time::{Duration, Instant};

/// Pool of persistent connection slots
pub struct ConnectionPool {
    url: String,
    idle_tx: Sender<Client>,
    idle_rx: Receiver<Client>,
    size: usize,
    timeout: Duration,
}

impl ConnectionPool {
    /// Dial every slot up front
    ///
    /// # Errors
    ///
    /// Returns `ConnectionError` if the configuration is invalid or any slot
    /// fails to connect.
    pub fn connect(config: &DatabaseConfig) -> Result<Self, ConnectionError> {
        let size = config.max_connections.max(1);
        let (idle_tx, idle_rx) = bounded(size);
        for _ in 0..size {
            let client = connect(&config.url)?;
            // Capacity equals slot count, so this never blocks.
            let _ = idle_tx.send(client);
        }
        log::info!("connection pool ready with {size} slot(s)");
        Ok(Self {
            url: config.url.clone(),
            idle_tx,
            idle_rx,
            size,
            timeout: Duration::from_secs(config.pool_timeout_seconds),
        })
    }

    /// Number of slots
    pub fn size(&self) -> usize {
        self.size
    }

    /// Number of idle slots right now
    pub fn idle(&self) -> usize {
        self.idle_rx.len()
    }

    /// Check out a connection, waiting up to the pool timeout
    ///
    /// # Errors
    ///
    /// Returns `ConnectionError::PoolTimeout` when no slot frees up in time,
    /// or a connection error if re-dialing an unhealthy slot fails.
    pub fn acquire(&self) -> Result<PooledClient<'_>, ConnectionError> {
        let start = Instant::now();
        let client = match self.idle_rx.recv_timeout(self.timeout) {
            Ok(client) => client,
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => {
                return Err(ConnectionError::PoolTimeout {
                    waited_ms: start.elapsed().as_millis(),
                });
            }
        };

        let client = if check_connection_health(&client) {
            client
        } else {
            log::warn!("replacing unhealthy pooled connection");
            match connect(&self.url) {
                Ok(fresh) => fresh,
                Err(e) => {
                    // Keep the slot count stable; the next acquire retries the dial.
                    let _ = self.idle_tx.send(client);
                    return Err(e);
                }
            }
        };

        Ok(PooledClient {
            client: Some(client),
            pool: self,
        })
    }
}

/// A checked-out connection; returned to the pool on drop
pub struct PooledClient<'a> {
    client: Option<Client>,
    pool: &'a ConnectionPool,
}

impl Deref for PooledClient<'_> {
    type Target = Client;

    fn deref(&self) -> &Client {
        // Only `drop` takes the client out.
        self.client.as_ref().unwrap_or_else(|| unreachable!("pooled client used after release"))
    }
}

impl Drop for PooledClient<'_> {
    fn drop(&mut self) {
        if let Some(client) = self.client.take() {
            let _ = self.pool.idle_tx.send(client);
        }
    }
}
