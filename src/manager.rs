//! # Task Manager
//!
//! The application-facing facade. Owns at most one adapter at a time,
//! constructed lazily from configuration on first use and memoized; after
//! `close` the next call constructs a fresh one.

use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::info;

use crate::adapter::QueueAdapterKind;
use crate::config::QueueConfig;
use crate::error::QueueResult;
use crate::factory::build_adapter;
use crate::message::{QueueStats, TaskHandler, TaskInfo, TaskListOptions, TaskPage};

pub struct TaskManager {
    config: QueueConfig,
    adapter: RwLock<Option<Arc<QueueAdapterKind>>>,
}

impl std::fmt::Debug for TaskManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskManager")
            .field("backend", &self.config.backend)
            .finish()
    }
}

impl TaskManager {
    pub fn new(config: QueueConfig) -> Self {
        Self {
            config,
            adapter: RwLock::new(None),
        }
    }

    /// Wrap a pre-built adapter; used by tests to inject the in-memory
    /// backend.
    pub fn with_adapter(adapter: QueueAdapterKind) -> Self {
        Self {
            config: QueueConfig::default(),
            adapter: RwLock::new(Some(Arc::new(adapter))),
        }
    }

    /// The memoized adapter, constructing it on first call.
    ///
    /// Construction is connection-free; failures here are configuration
    /// errors only.
    async fn adapter(&self) -> QueueResult<Arc<QueueAdapterKind>> {
        if let Some(adapter) = self.adapter.read().await.as_ref() {
            return Ok(adapter.clone());
        }

        let mut guard = self.adapter.write().await;
        // Another caller may have built it while we waited for the lock.
        if let Some(adapter) = guard.as_ref() {
            return Ok(adapter.clone());
        }

        let adapter = Arc::new(build_adapter(&self.config)?);
        info!(backend = adapter.backend_name(), "Queue adapter constructed");
        *guard = Some(adapter.clone());
        Ok(adapter)
    }

    /// Establish backend connectivity eagerly. Optional; every operation
    /// below reaches the backend on its own.
    pub async fn initialize(&self) -> QueueResult<()> {
        self.adapter().await?.initialize().await
    }

    pub async fn create_queue(&self, task_name: &str) -> QueueResult<()> {
        self.adapter().await?.create_queue(task_name).await
    }

    pub async fn schedule_task(
        &self,
        task_name: &str,
        delay_ms: u64,
        data: Option<serde_json::Value>,
    ) -> QueueResult<()> {
        self.adapter()
            .await?
            .schedule_task(task_name, delay_ms, data)
            .await
    }

    pub async fn schedule_recurring_task(
        &self,
        task_name: &str,
        handler: TaskHandler,
        interval_ms: u64,
        data: Option<serde_json::Value>,
    ) -> QueueResult<()> {
        self.adapter()
            .await?
            .schedule_recurring_task(task_name, handler, interval_ms, data)
            .await
    }

    pub async fn register_consumer(
        &self,
        task_name: &str,
        handler: TaskHandler,
    ) -> QueueResult<()> {
        self.adapter()
            .await?
            .register_consumer(task_name, handler)
            .await
    }

    pub async fn cancel_task(&self, task_name: &str) -> QueueResult<()> {
        self.adapter().await?.cancel_task(task_name).await
    }

    pub async fn queue_names(&self) -> QueueResult<Vec<String>> {
        self.adapter().await?.queue_names().await
    }

    pub async fn queue_stats(&self, queue_name: Option<&str>) -> QueueResult<Vec<QueueStats>> {
        self.adapter().await?.queue_stats(queue_name).await
    }

    pub async fn tasks(&self, options: TaskListOptions) -> QueueResult<TaskPage> {
        self.adapter().await?.tasks(options).await
    }

    pub async fn task(&self, task_id: &str) -> QueueResult<Option<TaskInfo>> {
        self.adapter().await?.task(task_id).await
    }

    /// Close and drop the current adapter. The next operation constructs a
    /// fresh one from the same configuration.
    pub async fn close(&self) -> QueueResult<()> {
        let adapter = self.adapter.write().await.take();
        if let Some(adapter) = adapter {
            adapter.close().await?;
            info!(backend = adapter.backend_name(), "Queue adapter closed");
        }
        Ok(())
    }
}
