//! # In-Memory Queue Adapter
//!
//! Process-local backend for tests and development. Delivery is a spawned
//! timer per occurrence; recurring chains run inside that task. Keeps a
//! full job history so introspection behaves like the Postgres backend.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::adapter::QueueAdapter;
use crate::error::QueueResult;
use crate::message::{
    QueueStats, TaskHandler, TaskInfo, TaskListOptions, TaskMessage, TaskPage, TaskStatus,
};

/// Poll cadence while an occurrence waits for its consumer.
const CONSUMER_WAIT_MS: u64 = 25;

#[derive(Default)]
struct Shared {
    queues: RwLock<BTreeSet<String>>,
    /// Renewal gate: present while the recurring chain should continue.
    handlers: RwLock<HashMap<String, TaskHandler>>,
    /// Handlers as captured at registration; kept until close so
    /// already-enqueued occurrences of a cancelled task still execute.
    consumers: RwLock<HashMap<String, TaskHandler>>,
    jobs: RwLock<HashMap<String, TaskInfo>>,
    closed: AtomicBool,
}

impl Shared {
    async fn record_job(&self, message: &TaskMessage) -> String {
        let id = Uuid::new_v4().to_string();
        let info = TaskInfo {
            id: id.clone(),
            name: message.task_name.clone(),
            data: serde_json::to_value(message).ok(),
            status: TaskStatus::Created,
            created_on: Utc::now(),
            started_on: None,
            completed_on: None,
            failed_on: None,
            retries: 0,
            output: None,
            error: None,
        };
        self.jobs.write().await.insert(id.clone(), info);
        id
    }

    async fn mark_active(&self, job_id: &str) {
        if let Some(job) = self.jobs.write().await.get_mut(job_id) {
            job.status = TaskStatus::Active;
            job.started_on = Some(Utc::now());
        }
    }

    async fn mark_completed(&self, job_id: &str) {
        if let Some(job) = self.jobs.write().await.get_mut(job_id) {
            job.status = TaskStatus::Completed;
            job.completed_on = Some(Utc::now());
        }
    }

    async fn mark_failed(&self, job_id: &str, error: String) {
        if let Some(job) = self.jobs.write().await.get_mut(job_id) {
            job.status = TaskStatus::Failed;
            job.failed_on = Some(Utc::now());
            job.error = Some(error);
        }
    }
}

#[derive(Clone, Default)]
pub struct InMemoryAdapter {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for InMemoryAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryAdapter").finish()
    }
}

impl InMemoryAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver one occurrence after its delay, then chain renewals for
    /// recurring messages. Runs as its own task per scheduled occurrence.
    async fn delivery_loop(shared: Arc<Shared>, mut message: TaskMessage, mut delay_ms: u64) {
        loop {
            let job_id = shared.record_job(&message).await;
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;

            // Wait until a consumer is registered for this task name.
            let handler = loop {
                if shared.closed.load(Ordering::SeqCst) {
                    return;
                }
                if let Some(handler) = shared.consumers.read().await.get(&message.task_name) {
                    break handler.clone();
                }
                tokio::time::sleep(Duration::from_millis(CONSUMER_WAIT_MS)).await;
            };

            shared.mark_active(&job_id).await;
            match handler(message.clone()).await {
                Ok(()) => shared.mark_completed(&job_id).await,
                Err(e) => {
                    warn!(task_name = %message.task_name, error = %e, "Task handler failed");
                    shared.mark_failed(&job_id, e.to_string()).await;
                    return;
                }
            }

            let renew = message.is_recurring()
                && shared.handlers.read().await.contains_key(&message.task_name);
            if !renew {
                return;
            }

            delay_ms = message.interval_ms.unwrap_or(0);
            message = message.renewal();
        }
    }

    async fn schedule(&self, message: TaskMessage, delay_ms: u64) -> QueueResult<()> {
        message.validate()?;
        self.create_queue(&message.task_name).await?;

        debug!(
            task_name = %message.task_name,
            delay_ms,
            recurring = message.is_recurring(),
            "Task scheduled on in-memory backend"
        );

        let shared = self.shared.clone();
        tokio::spawn(async move {
            Self::delivery_loop(shared, message, delay_ms).await;
        });
        Ok(())
    }
}

#[async_trait]
impl QueueAdapter for InMemoryAdapter {
    async fn initialize(&self) -> QueueResult<()> {
        self.shared.closed.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn create_queue(&self, task_name: &str) -> QueueResult<()> {
        self.shared.queues.write().await.insert(task_name.to_string());
        Ok(())
    }

    async fn schedule_task(
        &self,
        task_name: &str,
        delay_ms: u64,
        data: Option<serde_json::Value>,
    ) -> QueueResult<()> {
        self.schedule(TaskMessage::new(task_name, data), delay_ms).await
    }

    async fn schedule_recurring_task(
        &self,
        task_name: &str,
        handler: TaskHandler,
        interval_ms: u64,
        data: Option<serde_json::Value>,
    ) -> QueueResult<()> {
        let message = TaskMessage::recurring(task_name, data, interval_ms);
        message.validate()?;

        self.register_consumer(task_name, handler).await?;
        self.schedule(message, interval_ms).await
    }

    async fn register_consumer(&self, task_name: &str, handler: TaskHandler) -> QueueResult<()> {
        self.create_queue(task_name).await?;

        // Re-registration replaces the handler and re-arms the renewal
        // gate, so a cancelled task can start a fresh recurring chain.
        {
            let mut consumers = self.shared.consumers.write().await;
            if consumers
                .insert(task_name.to_string(), handler.clone())
                .is_some()
            {
                debug!(task_name, "Consumer already registered; handler re-armed");
            }
        }
        self.shared
            .handlers
            .write()
            .await
            .insert(task_name.to_string(), handler);
        Ok(())
    }

    async fn cancel_task(&self, task_name: &str) -> QueueResult<()> {
        let was_registered = self.shared.handlers.write().await.remove(task_name).is_some();
        info!(task_name, was_registered, "Recurring task cancelled");
        Ok(())
    }

    async fn queue_names(&self) -> QueueResult<Vec<String>> {
        Ok(self.shared.queues.read().await.iter().cloned().collect())
    }

    async fn queue_stats(&self, queue_name: Option<&str>) -> QueueResult<Vec<QueueStats>> {
        let queues: Vec<String> = match queue_name {
            Some(name) => vec![name.to_string()],
            None => self.queue_names().await?,
        };

        let jobs = self.shared.jobs.read().await;
        let stats = queues
            .into_iter()
            .map(|queue| {
                let mut stats = QueueStats::empty(&queue);
                for job in jobs.values().filter(|j| j.name == queue) {
                    match job.status {
                        TaskStatus::Created => {
                            stats.created += 1;
                            stats.waiting += 1;
                        }
                        TaskStatus::Retry => stats.waiting += 1,
                        TaskStatus::Active => stats.active += 1,
                        TaskStatus::Completed => stats.completed += 1,
                        TaskStatus::Failed => stats.failed += 1,
                        TaskStatus::Cancelled => stats.cancelled += 1,
                        TaskStatus::Expired => {}
                    }
                }
                stats
            })
            .collect();
        Ok(stats)
    }

    async fn tasks(&self, options: TaskListOptions) -> QueueResult<TaskPage> {
        let jobs = self.shared.jobs.read().await;
        let selected: Vec<TaskInfo> = jobs
            .values()
            .filter(|j| match &options.queue_name {
                Some(queue) => &j.name == queue,
                None => true,
            })
            .cloned()
            .collect();
        Ok(options.apply(selected))
    }

    async fn task(&self, task_id: &str) -> QueueResult<Option<TaskInfo>> {
        Ok(self.shared.jobs.read().await.get(task_id).cloned())
    }

    async fn close(&self) -> QueueResult<()> {
        self.shared.closed.store(true, Ordering::SeqCst);
        self.shared.consumers.write().await.clear();
        self.shared.handlers.write().await.clear();
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "in-memory"
    }
}
