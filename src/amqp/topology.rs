//! # Queue Topology
//!
//! Dead-letter-exchange based delay topology. One durable direct DLX is
//! shared by every task name; per task name there are two durable queues:
//!
//! - `<prefix>.<name>` — the work queue, bound to the DLX with its own
//!   name as routing key
//! - `<prefix>.delayed.<name>` — the delay queue, dead-lettering into the
//!   DLX with the work queue's routing key and no queue-level TTL
//!
//! Publishing to the delay queue with a per-message expiration makes the
//! broker itself the timer: once the TTL elapses the message is
//! dead-lettered through the DLX into the work queue.

use lapin::options::{ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions};
use lapin::types::{AMQPValue, FieldTable};
use lapin::{Channel, ExchangeKind};
use tracing::debug;

use crate::error::{QueueError, QueueResult};

#[derive(Debug, Clone)]
pub struct Topology {
    prefix: String,
}

impl Topology {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    /// Name of the shared dead-letter exchange.
    pub fn dlx_name(&self) -> String {
        format!("{}.dlx", self.prefix)
    }

    /// Work queue name for a task.
    pub fn task_queue(&self, task_name: &str) -> String {
        format!("{}.{}", self.prefix, task_name)
    }

    /// Delay queue name for a task.
    pub fn delayed_queue(&self, task_name: &str) -> String {
        format!("{}.delayed.{}", self.prefix, task_name)
    }

    /// Declare the shared DLX. Idempotent.
    pub async fn declare_exchange(&self, channel: &Channel) -> QueueResult<()> {
        let dlx = self.dlx_name();
        channel
            .exchange_declare(
                &dlx,
                ExchangeKind::Direct,
                ExchangeDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| QueueError::queue_creation(&dlx, format!("DLX declaration failed: {e}")))?;

        debug!(exchange = %dlx, "Dead-letter exchange declared");
        Ok(())
    }

    /// Declare the work and delay queues for a task name and bind the work
    /// queue to the DLX. Idempotent; re-declaring with identical arguments
    /// succeeds on the broker side.
    pub async fn declare_task_queues(&self, channel: &Channel, task_name: &str) -> QueueResult<()> {
        self.declare_exchange(channel).await?;

        let dlx = self.dlx_name();
        let work_queue = self.task_queue(task_name);
        let delayed_queue = self.delayed_queue(task_name);

        channel
            .queue_declare(
                &work_queue,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| {
                QueueError::queue_creation(&work_queue, format!("queue declaration failed: {e}"))
            })?;

        channel
            .queue_bind(
                &work_queue,
                &dlx,
                &work_queue,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| {
                QueueError::queue_creation(&work_queue, format!("DLX binding failed: {e}"))
            })?;

        // Per-message TTL is the delay mechanism, so no queue-level TTL here.
        let mut args = FieldTable::default();
        args.insert(
            "x-dead-letter-exchange".into(),
            AMQPValue::LongString(dlx.into()),
        );
        args.insert(
            "x-dead-letter-routing-key".into(),
            AMQPValue::LongString(work_queue.into()),
        );

        channel
            .queue_declare(
                &delayed_queue,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                args,
            )
            .await
            .map_err(|e| {
                QueueError::queue_creation(
                    &delayed_queue,
                    format!("delay queue declaration failed: {e}"),
                )
            })?;

        debug!(task_name, "Task queue topology declared");
        Ok(())
    }
}
