//! # Queue Adapter Contract
//!
//! The unifying contract both backends implement, plus enum dispatch over
//! the concrete adapters so the facade stays non-generic and call sites
//! never branch on backend type.

use async_trait::async_trait;

use crate::amqp::AmqpAdapter;
use crate::error::QueueResult;
use crate::in_memory::InMemoryAdapter;
use crate::message::{QueueStats, TaskHandler, TaskInfo, TaskListOptions, TaskPage};
use crate::postgres::PostgresAdapter;

/// Backend-agnostic queue operations.
///
/// All operations are asynchronous and may fail with a backend-specific
/// [`crate::error::QueueError`] the caller surfaces; none of them crash the
/// process. Calling anything before `initialize` completes fails fast.
#[async_trait]
pub trait QueueAdapter: Send + Sync {
    /// Establish backend connectivity. Safe to call once at startup.
    async fn initialize(&self) -> QueueResult<()>;

    /// Ensure the named queue exists. "Already exists" is success;
    /// genuine connectivity/permission errors propagate.
    async fn create_queue(&self, task_name: &str) -> QueueResult<()>;

    /// Enqueue one occurrence, eligible for consumption no earlier than
    /// `delay_ms` from now. Auto-provisions the queue.
    async fn schedule_task(
        &self,
        task_name: &str,
        delay_ms: u64,
        data: Option<serde_json::Value>,
    ) -> QueueResult<()>;

    /// Register `handler` for `task_name` (if not already registered) and
    /// schedule the first occurrence after `interval_ms`. Subsequent
    /// occurrences are chained by the consumer after each success.
    async fn schedule_recurring_task(
        &self,
        task_name: &str,
        handler: TaskHandler,
        interval_ms: u64,
        data: Option<serde_json::Value>,
    ) -> QueueResult<()>;

    /// Idempotent consumer registration; a second registration for the
    /// same task name is a no-op. Auto-creates the queue first.
    async fn register_consumer(&self, task_name: &str, handler: TaskHandler) -> QueueResult<()>;

    /// Stop future self-renewal for a recurring task. Already-enqueued
    /// occurrences are never discarded: backends with a durable claim run
    /// them with the handler captured at registration, while the broker
    /// backend stops its subscription and leaves them queued until a
    /// consumer is registered again.
    async fn cancel_task(&self, task_name: &str) -> QueueResult<()>;

    /// Names of known queues. Best-effort on a degraded backend.
    async fn queue_names(&self) -> QueueResult<Vec<String>>;

    /// Per-queue counters, for one queue or all known queues. Degrades to
    /// empty/partial results rather than erroring.
    async fn queue_stats(&self, queue_name: Option<&str>) -> QueueResult<Vec<QueueStats>>;

    /// Paged task listing. May error when the backend is entirely
    /// unreachable; single-queue fetch failures are skipped.
    async fn tasks(&self, options: TaskListOptions) -> QueueResult<TaskPage>;

    /// Look up one task by id.
    async fn task(&self, task_id: &str) -> QueueResult<Option<TaskInfo>>;

    /// Release the backend connection. Safe to call multiple times.
    async fn close(&self) -> QueueResult<()>;

    /// Backend name for logging/metrics.
    fn backend_name(&self) -> &'static str;
}

/// Enum dispatch over the concrete adapters.
///
/// The factory only ever constructs `Amqp` or `Postgres`; `InMemory` is a
/// test/development backend constructed directly.
#[derive(Debug)]
pub enum QueueAdapterKind {
    Amqp(AmqpAdapter),
    Postgres(PostgresAdapter),
    InMemory(InMemoryAdapter),
}

macro_rules! dispatch {
    ($self:ident, $inner:ident => $body:expr) => {
        match $self {
            Self::Amqp($inner) => $body,
            Self::Postgres($inner) => $body,
            Self::InMemory($inner) => $body,
        }
    };
}

impl QueueAdapterKind {
    pub fn backend_name(&self) -> &'static str {
        dispatch!(self, s => s.backend_name())
    }

    pub async fn initialize(&self) -> QueueResult<()> {
        dispatch!(self, s => s.initialize().await)
    }

    pub async fn create_queue(&self, task_name: &str) -> QueueResult<()> {
        dispatch!(self, s => s.create_queue(task_name).await)
    }

    pub async fn schedule_task(
        &self,
        task_name: &str,
        delay_ms: u64,
        data: Option<serde_json::Value>,
    ) -> QueueResult<()> {
        dispatch!(self, s => s.schedule_task(task_name, delay_ms, data).await)
    }

    pub async fn schedule_recurring_task(
        &self,
        task_name: &str,
        handler: TaskHandler,
        interval_ms: u64,
        data: Option<serde_json::Value>,
    ) -> QueueResult<()> {
        dispatch!(self, s => s.schedule_recurring_task(task_name, handler, interval_ms, data).await)
    }

    pub async fn register_consumer(
        &self,
        task_name: &str,
        handler: TaskHandler,
    ) -> QueueResult<()> {
        dispatch!(self, s => s.register_consumer(task_name, handler).await)
    }

    pub async fn cancel_task(&self, task_name: &str) -> QueueResult<()> {
        dispatch!(self, s => s.cancel_task(task_name).await)
    }

    pub async fn queue_names(&self) -> QueueResult<Vec<String>> {
        dispatch!(self, s => s.queue_names().await)
    }

    pub async fn queue_stats(&self, queue_name: Option<&str>) -> QueueResult<Vec<QueueStats>> {
        dispatch!(self, s => s.queue_stats(queue_name).await)
    }

    pub async fn tasks(&self, options: TaskListOptions) -> QueueResult<TaskPage> {
        dispatch!(self, s => s.tasks(options).await)
    }

    pub async fn task(&self, task_id: &str) -> QueueResult<Option<TaskInfo>> {
        dispatch!(self, s => s.task(task_id).await)
    }

    pub async fn close(&self) -> QueueResult<()> {
        dispatch!(self, s => s.close().await)
    }
}
