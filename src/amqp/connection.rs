//! # Broker Connection Manager
//!
//! Owns the lapin connection and hands out channels with consumer
//! prefetch of 1. The first connect fails fast; after a connection has
//! been established once, lost connections are re-established with a
//! fixed backoff so callers observe latency rather than errors during a
//! transient reconnect window.

use lapin::options::{BasicQosOptions, ConfirmSelectOptions};
use lapin::{Channel, Connection, ConnectionProperties};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::config::AmqpConfig;
use crate::error::{QueueError, QueueResult};

/// Strict one-in-flight sequential processing per channel.
const CONSUMER_PREFETCH: u16 = 1;

pub struct ConnectionManager {
    config: AmqpConfig,
    connection: RwLock<Option<Connection>>,
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("url", &self.config.url_redacted())
            .finish()
    }
}

impl ConnectionManager {
    pub fn new(config: AmqpConfig) -> Self {
        Self {
            config,
            connection: RwLock::new(None),
        }
    }

    /// Establish the initial broker connection.
    ///
    /// A failure here is fatal to `initialize()`; no retry is attempted
    /// before the first connection has ever succeeded.
    pub async fn connect(&self) -> QueueResult<()> {
        let connection = self.open().await?;
        info!(url = %self.config.url_redacted(), "Connected to AMQP broker");
        *self.connection.write().await = Some(connection);
        Ok(())
    }

    async fn open(&self) -> QueueResult<Connection> {
        Connection::connect(
            &self.config.uri_with_heartbeat(),
            ConnectionProperties::default().with_connection_name("taskqueue-core".into()),
        )
        .await
        .map_err(|e| QueueError::connection(format!("AMQP connection failed: {e}")))
    }

    /// Create a channel with consumer prefetch applied.
    ///
    /// Reconnects transparently (fixed backoff, bounded attempts) if the
    /// connection was lost; errors immediately if `connect` has never
    /// succeeded.
    pub async fn channel(&self) -> QueueResult<Channel> {
        // Fast path: healthy connection.
        {
            let guard = self.connection.read().await;
            match guard.as_ref() {
                None => {
                    return Err(QueueError::connection(
                        "AMQP connection has not been established; call initialize() first",
                    ))
                }
                Some(connection) if connection.status().connected() => {
                    if let Ok(channel) = self.new_channel(connection).await {
                        return Ok(channel);
                    }
                    // Channel creation failed on a connection that claims
                    // to be up; fall through to reconnect.
                }
                Some(_) => {}
            }
        }

        self.reconnect_and_channel().await
    }

    async fn reconnect_and_channel(&self) -> QueueResult<Channel> {
        let mut guard = self.connection.write().await;

        // Another caller may have reconnected while we waited for the lock.
        if let Some(connection) = guard.as_ref() {
            if connection.status().connected() {
                if let Ok(channel) = self.new_channel(connection).await {
                    return Ok(channel);
                }
            }
        }

        let interval = std::time::Duration::from_millis(self.config.reconnect_interval_ms);
        let mut last_error = None;

        for attempt in 1..=self.config.reconnect_max_attempts {
            match self.open().await {
                Ok(connection) => {
                    info!(attempt, "Reconnected to AMQP broker");
                    let channel = self.new_channel(&connection).await?;
                    *guard = Some(connection);
                    return Ok(channel);
                }
                Err(e) => {
                    warn!(attempt, error = %e, "AMQP reconnect attempt failed");
                    last_error = Some(e);
                    tokio::time::sleep(interval).await;
                }
            }
        }

        Err(last_error.unwrap_or_else(|| QueueError::connection("AMQP reconnect gave up")))
    }

    async fn new_channel(&self, connection: &Connection) -> QueueResult<Channel> {
        let channel = connection
            .create_channel()
            .await
            .map_err(|e| QueueError::connection(format!("AMQP channel creation failed: {e}")))?;

        channel
            .basic_qos(CONSUMER_PREFETCH, BasicQosOptions::default())
            .await
            .map_err(|e| QueueError::connection(format!("Failed to set channel QoS: {e}")))?;

        // Publisher confirms, so schedule_task only returns once the broker
        // has taken responsibility for the message.
        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(|e| QueueError::connection(format!("Failed to enable confirms: {e}")))?;

        debug!(id = channel.id(), "AMQP channel created");
        Ok(channel)
    }

    /// Close the broker connection. Safe to call repeatedly.
    pub async fn close(&self) -> QueueResult<()> {
        if let Some(connection) = self.connection.write().await.take() {
            if let Err(e) = connection.close(200, "closing").await {
                warn!(error = %e, "Error while closing AMQP connection");
            }
        }
        Ok(())
    }
}
