//! # AMQP Adapter
//!
//! Implements the queue contract against a RabbitMQ broker. Delay is
//! emulated with per-message TTL plus the dead-letter topology; recurring
//! tasks re-publish themselves from inside the consumer after each
//! successful execution.
//!
//! ## Introspection limits
//!
//! AMQP offers no list-all-queues or job-history primitive without a
//! management-plane integration, so on this backend `queue_names` reports
//! only locally registered consumers, `queue_stats` returns zeroed rows,
//! and `tasks`/`task` return empty results. This is a documented
//! capability gap versus the Postgres adapter, not parity to be faked.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicNackOptions,
    BasicPublishOptions,
};
use lapin::types::FieldTable;
use lapin::BasicProperties;
use tokio::sync::{watch, RwLock};
use tracing::{debug, error, info, warn};

use crate::adapter::QueueAdapter;
use crate::config::AmqpConfig;
use crate::error::{QueueError, QueueResult};
use crate::message::{
    CompletionOutcome, QueueStats, TaskHandler, TaskInfo, TaskListOptions, TaskMessage, TaskPage,
};

use super::connection::ConnectionManager;
use super::topology::Topology;

/// Shared mutable state, cloned into consumer tasks.
#[derive(Clone)]
struct AdapterState {
    connection: Arc<ConnectionManager>,
    topology: Topology,
    /// Renewal gate: a recurring chain only re-arms while its task name
    /// stays registered here
    handlers: Arc<RwLock<HashMap<String, TaskHandler>>>,
    /// Task names with an active consumer loop; dropping a sender tells
    /// that loop to stop
    consumers: Arc<RwLock<HashMap<String, watch::Sender<()>>>>,
    resubscribe_interval_ms: u64,
}

pub struct AmqpAdapter {
    state: AdapterState,
}

impl std::fmt::Debug for AmqpAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AmqpAdapter")
            .field("connection", &self.state.connection)
            .finish()
    }
}

impl AmqpAdapter {
    pub fn new(config: AmqpConfig, queue_prefix: impl Into<String>) -> Self {
        let resubscribe_interval_ms = config.reconnect_interval_ms;
        Self {
            state: AdapterState {
                connection: Arc::new(ConnectionManager::new(config)),
                topology: Topology::new(queue_prefix),
                handlers: Arc::new(RwLock::new(HashMap::new())),
                consumers: Arc::new(RwLock::new(HashMap::new())),
                resubscribe_interval_ms,
            },
        }
    }

    /// Publish a task message to the delay queue with the given TTL.
    ///
    /// Used both for caller-initiated scheduling and for recurring
    /// renewal, so renewal failure can be injected and observed
    /// independently of handler execution.
    async fn publish_with_delay(
        state: &AdapterState,
        message: &TaskMessage,
        delay_ms: u64,
    ) -> QueueResult<()> {
        message.validate()?;

        let delayed_queue = state.topology.delayed_queue(&message.task_name);
        let payload = serde_json::to_vec(message)?;

        let channel = state.connection.channel().await?;
        let confirm = channel
            .basic_publish(
                "",
                &delayed_queue,
                BasicPublishOptions::default(),
                &payload,
                BasicProperties::default()
                    .with_delivery_mode(2)
                    .with_content_type("application/json".into())
                    .with_expiration(delay_ms.to_string().into()),
            )
            .await
            .map_err(|e| QueueError::publish(&delayed_queue, format!("publish failed: {e}")))?;

        confirm.await.map_err(|e| {
            QueueError::publish(&delayed_queue, format!("publish confirmation failed: {e}"))
        })?;

        info!(
            task_name = %message.task_name,
            delay_ms,
            recurring = message.is_recurring(),
            "Task scheduled on AMQP backend"
        );
        Ok(())
    }

    /// Re-arm a recurring chain after a successful execution.
    async fn renew_recurring(state: &AdapterState, message: &TaskMessage) -> CompletionOutcome {
        if !message.is_recurring() {
            return CompletionOutcome::Executed;
        }

        // Cancelled between execution and renewal: the chain stops here.
        if !state.handlers.read().await.contains_key(&message.task_name) {
            info!(task_name = %message.task_name, "Recurring task cancelled; not renewing");
            return CompletionOutcome::Executed;
        }

        let interval_ms = message.interval_ms.unwrap_or(0);
        match Self::publish_with_delay(state, &message.renewal(), interval_ms).await {
            Ok(()) => CompletionOutcome::ExecutedAndRenewed,
            Err(e) => {
                // The completed occurrence is still acknowledged; the
                // chain stalls until re-armed externally.
                error!(
                    task_name = %message.task_name,
                    error = %e,
                    "Failed to schedule next occurrence of recurring task"
                );
                CompletionOutcome::ExecutedRenewalFailed
            }
        }
    }

    /// Consumer loop for one task name.
    ///
    /// Subscribes to the work queue and processes deliveries one at a
    /// time (prefetch 1). When the underlying connection drops, the
    /// delivery stream ends and the loop re-subscribes after a backoff,
    /// as long as the task name remains registered. Deregistration drops
    /// the paired watch sender, which cancels the broker subscription and
    /// ends the loop.
    async fn consume_loop(
        state: AdapterState,
        task_name: String,
        handler: TaskHandler,
        mut shutdown: watch::Receiver<()>,
    ) {
        let work_queue = state.topology.task_queue(&task_name);
        let consumer_tag = format!("taskqueue-{task_name}");

        loop {
            if !state.consumers.read().await.contains_key(&task_name) {
                debug!(task_name, "Consumer deregistered; stopping loop");
                return;
            }

            let channel = match state.connection.channel().await {
                Ok(channel) => channel,
                Err(e) => {
                    warn!(task_name, error = %e, "Consumer could not obtain channel");
                    Self::resubscribe_pause(&state).await;
                    continue;
                }
            };

            if let Err(e) = state.topology.declare_task_queues(&channel, &task_name).await {
                warn!(task_name, error = %e, "Consumer could not declare topology");
                Self::resubscribe_pause(&state).await;
                continue;
            }

            let mut deliveries = match channel
                .basic_consume(
                    &work_queue,
                    &consumer_tag,
                    BasicConsumeOptions::default(),
                    FieldTable::default(),
                )
                .await
            {
                Ok(consumer) => consumer,
                Err(e) => {
                    warn!(task_name, error = %e, "basic_consume failed");
                    Self::resubscribe_pause(&state).await;
                    continue;
                }
            };

            info!(task_name, queue = %work_queue, "Consumer registered");

            loop {
                tokio::select! {
                    delivery = deliveries.next() => match delivery {
                        Some(Ok(delivery)) => {
                            Self::process_delivery(&state, &task_name, &handler, delivery).await;
                        }
                        Some(Err(e)) => {
                            warn!(task_name, error = %e, "Delivery stream error");
                            break;
                        }
                        None => break,
                    },
                    // Resolves (with Err) once the sender is dropped by
                    // cancel_task or close.
                    _ = shutdown.changed() => {
                        if let Err(e) = channel
                            .basic_cancel(&consumer_tag, BasicCancelOptions::default())
                            .await
                        {
                            warn!(task_name, error = %e, "Failed to cancel broker subscription");
                        }
                        debug!(task_name, "Consumer deregistered; stopping loop");
                        return;
                    }
                }
            }

            // Stream ended: connection or channel was lost.
            if state.consumers.read().await.contains_key(&task_name) {
                warn!(task_name, "Consumer stream ended; re-subscribing");
                Self::resubscribe_pause(&state).await;
            }
        }
    }

    async fn resubscribe_pause(state: &AdapterState) {
        tokio::time::sleep(std::time::Duration::from_millis(state.resubscribe_interval_ms)).await;
    }

    /// Handle one delivery: run the handler, then ack on success (after
    /// any renewal) or nack without requeue on failure.
    async fn process_delivery(
        state: &AdapterState,
        task_name: &str,
        handler: &TaskHandler,
        delivery: lapin::message::Delivery,
    ) {
        let message: TaskMessage = match serde_json::from_slice(&delivery.data) {
            Ok(message) => message,
            Err(e) => {
                warn!(task_name, error = %e, "Dropping undecodable task message");
                if let Err(nack_err) = delivery
                    .nack(BasicNackOptions {
                        requeue: false,
                        ..Default::default()
                    })
                    .await
                {
                    warn!(task_name, error = %nack_err, "Failed to nack poison message");
                }
                return;
            }
        };

        match handler(message.clone()).await {
            Ok(()) => {
                let outcome = Self::renew_recurring(state, &message).await;
                debug!(task_name, ?outcome, "Task occurrence completed");

                // Renewal failure must not prevent acknowledging the
                // already-executed occurrence.
                if let Err(e) = delivery.ack(BasicAckOptions::default()).await {
                    warn!(task_name, error = %e, "Failed to ack completed task");
                }
            }
            Err(e) => {
                error!(task_name, error = %e, "Task handler failed");
                // No requeue: immediate redelivery would retry in a tight
                // loop; recovery is left to broker-level policy.
                if let Err(nack_err) = delivery
                    .nack(BasicNackOptions {
                        requeue: false,
                        ..Default::default()
                    })
                    .await
                {
                    warn!(task_name, error = %nack_err, "Failed to nack failed task");
                }
            }
        }
    }
}

#[async_trait]
impl QueueAdapter for AmqpAdapter {
    async fn initialize(&self) -> QueueResult<()> {
        self.state.connection.connect().await?;
        let channel = self.state.connection.channel().await?;
        self.state.topology.declare_exchange(&channel).await?;
        info!("AMQP queue adapter initialized");
        Ok(())
    }

    async fn create_queue(&self, task_name: &str) -> QueueResult<()> {
        let channel = self.state.connection.channel().await?;
        match self
            .state
            .topology
            .declare_task_queues(&channel, task_name)
            .await
        {
            Ok(()) => Ok(()),
            Err(e) if e.is_already_exists() => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn schedule_task(
        &self,
        task_name: &str,
        delay_ms: u64,
        data: Option<serde_json::Value>,
    ) -> QueueResult<()> {
        self.create_queue(task_name).await?;
        let message = TaskMessage::new(task_name, data);
        Self::publish_with_delay(&self.state, &message, delay_ms).await
    }

    async fn schedule_recurring_task(
        &self,
        task_name: &str,
        handler: TaskHandler,
        interval_ms: u64,
        data: Option<serde_json::Value>,
    ) -> QueueResult<()> {
        self.register_consumer(task_name, handler).await?;
        let message = TaskMessage::recurring(task_name, data, interval_ms);
        Self::publish_with_delay(&self.state, &message, interval_ms).await
    }

    async fn register_consumer(&self, task_name: &str, handler: TaskHandler) -> QueueResult<()> {
        {
            let consumers = self.state.consumers.read().await;
            if consumers.contains_key(task_name) {
                debug!(task_name, "Consumer already registered; skipping");
                return Ok(());
            }
        }

        self.create_queue(task_name).await?;

        let (shutdown_tx, shutdown_rx) = watch::channel(());
        {
            let mut consumers = self.state.consumers.write().await;
            if consumers.contains_key(task_name) {
                return Ok(());
            }
            consumers.insert(task_name.to_string(), shutdown_tx);
        }
        self.state
            .handlers
            .write()
            .await
            .insert(task_name.to_string(), handler.clone());

        let state = self.state.clone();
        let task_name = task_name.to_string();
        tokio::spawn(Self::consume_loop(state, task_name, handler, shutdown_rx));

        Ok(())
    }

    async fn cancel_task(&self, task_name: &str) -> QueueResult<()> {
        self.state.handlers.write().await.remove(task_name);
        // Dropping the sender stops the consumer loop; pending messages
        // stay queued on the broker until a consumer is registered again.
        self.state.consumers.write().await.remove(task_name);
        info!(task_name, "Task cancelled; future renewals stopped");
        Ok(())
    }

    async fn queue_names(&self) -> QueueResult<Vec<String>> {
        // Only locally registered consumers are known without a
        // management-plane integration.
        let consumers = self.state.consumers.read().await;
        let mut names: Vec<String> = consumers.keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    async fn queue_stats(&self, queue_name: Option<&str>) -> QueueResult<Vec<QueueStats>> {
        warn!("AMQP backend exposes no per-state job metrics; returning placeholder stats");
        let names = match queue_name {
            Some(name) => vec![name.to_string()],
            None => self.queue_names().await?,
        };
        Ok(names.into_iter().map(QueueStats::empty).collect())
    }

    async fn tasks(&self, options: TaskListOptions) -> QueueResult<TaskPage> {
        warn!("AMQP backend holds no durable task history; returning empty listing");
        Ok(TaskPage::empty(&options))
    }

    async fn task(&self, _task_id: &str) -> QueueResult<Option<TaskInfo>> {
        Ok(None)
    }

    async fn close(&self) -> QueueResult<()> {
        self.state.consumers.write().await.clear();
        self.state.handlers.write().await.clear();
        self.state.connection.close().await?;
        info!("AMQP queue adapter closed");
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "amqp"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::handler_fn;

    // With no broker connection ever established, publishing the renewal
    // fails; the outcome still records that the occurrence executed.
    #[tokio::test]
    async fn test_renewal_failure_preserves_execution_outcome() {
        let adapter = AmqpAdapter::new(AmqpConfig::default(), "test");
        adapter.state.handlers.write().await.insert(
            "tick".to_string(),
            handler_fn(|_message| async move { Ok(()) }),
        );

        let recurring = TaskMessage::recurring("tick", None, 100);
        let outcome = AmqpAdapter::renew_recurring(&adapter.state, &recurring).await;
        assert_eq!(outcome, CompletionOutcome::ExecutedRenewalFailed);
    }

    #[tokio::test]
    async fn test_one_shot_and_cancelled_chains_do_not_renew() {
        let adapter = AmqpAdapter::new(AmqpConfig::default(), "test");

        let one_shot = TaskMessage::new("tick", None);
        assert_eq!(
            AmqpAdapter::renew_recurring(&adapter.state, &one_shot).await,
            CompletionOutcome::Executed
        );

        // Recurring but no longer registered: cancelled between execution
        // and renewal, so the chain ends without touching the broker.
        let recurring = TaskMessage::recurring("gone", None, 100);
        assert_eq!(
            AmqpAdapter::renew_recurring(&adapter.state, &recurring).await,
            CompletionOutcome::Executed
        );
    }
}
