//! # Postgres Queue Adapter
//!
//! Job-table backend with native delayed-start scheduling. Consumers are
//! polling workers claiming one job at a time; handler failure is handed
//! to the store's retry policy instead of being retried in-process.
//! Introspection is first-class here: the job table is the task history.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{OnceCell, RwLock};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::adapter::QueueAdapter;
use crate::config::PostgresConfig;
use crate::error::QueueResult;
use crate::message::{
    CompletionOutcome, QueueStats, TaskHandler, TaskInfo, TaskListOptions, TaskMessage, TaskPage,
};
use crate::postgres::store::{ClaimedJob, JobStore};

/// One job per claim; prefetch-one parity with the broker backend.
const CLAIM_BATCH: i64 = 1;

/// Idle polls between expiration sweeps of a queue.
const SWEEP_EVERY_IDLE_POLLS: u32 = 20;

#[derive(Clone)]
struct AdapterState {
    config: PostgresConfig,
    store: Arc<OnceCell<JobStore>>,
    /// Renewal gate: present while the recurring chain should continue.
    handlers: Arc<RwLock<HashMap<String, TaskHandler>>>,
    /// Names with a running worker loop; also the loop's liveness flag.
    workers: Arc<RwLock<HashSet<String>>>,
}

pub struct PostgresAdapter {
    state: AdapterState,
}

impl std::fmt::Debug for PostgresAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgresAdapter")
            .field("connected", &self.state.store.initialized())
            .finish()
    }
}

impl PostgresAdapter {
    pub fn new(config: PostgresConfig) -> Self {
        Self {
            state: AdapterState {
                config,
                store: Arc::new(OnceCell::new()),
                handlers: Arc::new(RwLock::new(HashMap::new())),
                workers: Arc::new(RwLock::new(HashSet::new())),
            },
        }
    }

    /// Connect lazily on first use; the schema install is idempotent.
    async fn store(&self) -> QueueResult<&JobStore> {
        Self::store_for(&self.state).await
    }

    async fn store_for(state: &AdapterState) -> QueueResult<&JobStore> {
        state
            .store
            .get_or_try_init(|| async {
                let store = JobStore::connect(&state.config).await?;
                store.install_schema().await?;
                Ok(store)
            })
            .await
    }

    /// Handle one claimed job end to end.
    async fn process_job(
        state: &AdapterState,
        store: &JobStore,
        task_name: &str,
        handler: &TaskHandler,
        job: ClaimedJob,
    ) {
        let message = job.task_message(task_name);

        match handler(message.clone()).await {
            Ok(()) => {
                if let Err(e) = store.complete(job.id).await {
                    error!(task_name, job_id = %job.id, error = %e, "Failed to mark job completed");
                    return;
                }
                let outcome = Self::renew_recurring(state, store, task_name, &message).await;
                debug!(task_name, job_id = %job.id, ?outcome, "Task occurrence completed");
            }
            Err(e) => {
                warn!(
                    task_name,
                    job_id = %job.id,
                    retry_count = job.retry_count,
                    error = %e,
                    "Task handler failed; store retry policy applies"
                );
                if let Err(db_err) = store.fail(job.id, &e.to_string()).await {
                    error!(task_name, job_id = %job.id, error = %db_err, "Failed to record job failure");
                }
            }
        }
    }

    /// Schedule the next occurrence of a recurring task after a success.
    ///
    /// Skipped when the task was cancelled between delivery and completion.
    async fn renew_recurring(
        state: &AdapterState,
        store: &JobStore,
        task_name: &str,
        message: &TaskMessage,
    ) -> CompletionOutcome {
        if !message.is_recurring() {
            return CompletionOutcome::Executed;
        }
        if !state.handlers.read().await.contains_key(task_name) {
            info!(task_name, "Recurring task cancelled; skipping renewal");
            return CompletionOutcome::Executed;
        }

        let interval_ms = message.interval_ms.unwrap_or(0);
        match store.enqueue(task_name, &message.renewal(), interval_ms).await {
            Ok(_) => CompletionOutcome::ExecutedAndRenewed,
            Err(e) => {
                error!(
                    task_name,
                    error = %e,
                    "Failed to schedule next recurring occurrence; chain is stalled"
                );
                CompletionOutcome::ExecutedRenewalFailed
            }
        }
    }

    /// Polling worker loop for one task name.
    ///
    /// Runs until `close` clears the worker set. The handler is the one
    /// captured at registration, so already-enqueued occurrences of a
    /// cancelled task still execute.
    async fn worker_loop(state: AdapterState, task_name: String, handler: TaskHandler) {
        let poll_interval = Duration::from_millis(state.config.poll_interval_ms);
        let mut idle_polls: u32 = 0;

        info!(task_name, "Postgres worker started");

        while state.workers.read().await.contains(&task_name) {
            let store = match Self::store_for(&state).await {
                Ok(store) => store,
                Err(e) => {
                    warn!(task_name, error = %e, "Worker could not reach the job store");
                    tokio::time::sleep(poll_interval).await;
                    continue;
                }
            };

            match store.claim(&task_name, CLAIM_BATCH).await {
                Ok(jobs) if !jobs.is_empty() => {
                    idle_polls = 0;
                    for job in jobs {
                        // Prefer the currently registered handler; fall back
                        // to the one captured at registration so occurrences
                        // of a cancelled task still execute.
                        let current = state
                            .handlers
                            .read()
                            .await
                            .get(&task_name)
                            .cloned()
                            .unwrap_or_else(|| handler.clone());
                        Self::process_job(&state, store, &task_name, &current, job).await;
                    }
                }
                Ok(_) => {
                    idle_polls += 1;
                    if idle_polls % SWEEP_EVERY_IDLE_POLLS == 0 {
                        match store.expire_stale(&task_name).await {
                            Ok(0) => {}
                            Ok(n) => warn!(task_name, expired = n, "Expired stale active jobs"),
                            Err(e) => warn!(task_name, error = %e, "Expiration sweep failed"),
                        }
                    }
                    tokio::time::sleep(poll_interval).await;
                }
                Err(e) => {
                    warn!(task_name, error = %e, "Job claim failed; backing off");
                    tokio::time::sleep(poll_interval).await;
                }
            }
        }

        info!(task_name, "Postgres worker stopped");
    }
}

#[async_trait]
impl QueueAdapter for PostgresAdapter {
    async fn initialize(&self) -> QueueResult<()> {
        self.store().await?;
        info!("Postgres queue adapter initialized");
        Ok(())
    }

    async fn create_queue(&self, task_name: &str) -> QueueResult<()> {
        self.store().await?.ensure_queue(task_name).await
    }

    async fn schedule_task(
        &self,
        task_name: &str,
        delay_ms: u64,
        data: Option<serde_json::Value>,
    ) -> QueueResult<()> {
        let store = self.store().await?;
        store.ensure_queue(task_name).await?;

        let message = TaskMessage::new(task_name, data);
        message.validate()?;
        store.enqueue(task_name, &message, delay_ms).await?;
        Ok(())
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

        // First occurrence fires one interval from now; the worker chains
        // the rest after each success.
        self.store()
            .await?
            .enqueue(task_name, &message, interval_ms)
            .await?;
        Ok(())
    }

    async fn register_consumer(&self, task_name: &str, handler: TaskHandler) -> QueueResult<()> {
        let store = self.store().await?;
        store.ensure_queue(task_name).await?;

        // Always re-arm the renewal gate: a task cancelled earlier can be
        // registered (and its recurring chain restarted) again.
        self.state
            .handlers
            .write()
            .await
            .insert(task_name.to_string(), handler.clone());

        {
            let mut workers = self.state.workers.write().await;
            if !workers.insert(task_name.to_string()) {
                debug!(task_name, "Worker already registered; handler re-armed");
                return Ok(());
            }
        }

        let state = self.state.clone();
        let name = task_name.to_string();
        tokio::spawn(async move {
            Self::worker_loop(state, name, handler).await;
        });

        Ok(())
    }

    async fn cancel_task(&self, task_name: &str) -> QueueResult<()> {
        let was_registered = self.state.handlers.write().await.remove(task_name).is_some();
        info!(task_name, was_registered, "Recurring task cancelled");
        Ok(())
    }

    async fn queue_names(&self) -> QueueResult<Vec<String>> {
        // Listing degrades to empty rather than erroring when the store is
        // unreachable; dashboards keep rendering during an outage.
        match self.store().await {
            Ok(store) => match store.queue_names().await {
                Ok(names) => Ok(names),
                Err(e) => {
                    warn!(error = %e, "Queue listing failed; reporting no queues");
                    Ok(Vec::new())
                }
            },
            Err(e) => {
                warn!(error = %e, "Job store unreachable; reporting no queues");
                Ok(Vec::new())
            }
        }
    }

    async fn queue_stats(&self, queue_name: Option<&str>) -> QueueResult<Vec<QueueStats>> {
        match self.store().await {
            Ok(store) => match store.stats(queue_name).await {
                Ok(stats) => Ok(stats),
                Err(e) => {
                    warn!(error = %e, "Stats query failed; reporting no stats");
                    Ok(Vec::new())
                }
            },
            Err(e) => {
                warn!(error = %e, "Job store unreachable; reporting no stats");
                Ok(Vec::new())
            }
        }
    }

    async fn tasks(&self, options: TaskListOptions) -> QueueResult<TaskPage> {
        let store = self.store().await?;

        let queues = match &options.queue_name {
            Some(name) => vec![name.clone()],
            None => store.queue_names().await?,
        };

        let mut all = Vec::new();
        for queue in &queues {
            match store.jobs_for_queue(queue).await {
                Ok(mut jobs) => all.append(&mut jobs),
                // One bad queue must not take down the whole listing.
                Err(e) => warn!(queue, error = %e, "Skipping queue in task listing"),
            }
        }

        Ok(options.apply(all))
    }

    async fn task(&self, task_id: &str) -> QueueResult<Option<TaskInfo>> {
        let Ok(job_id) = Uuid::parse_str(task_id) else {
            return Ok(None);
        };
        self.store().await?.job_by_id(job_id).await
    }

    async fn close(&self) -> QueueResult<()> {
        self.state.workers.write().await.clear();
        self.state.handlers.write().await.clear();

        if let Some(store) = self.state.store.get() {
            store.close().await;
        }
        info!("Postgres queue adapter closed");
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "postgres"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::handler_fn;

    // Renewal failure is a distinct outcome, not an error that undoes the
    // completed occurrence: with the pool closed between execution and
    // renewal, the chain stalls but the execution result stands.
    #[tokio::test]
    #[ignore = "requires Postgres running"]
    async fn test_renewal_failure_preserves_execution_outcome() {
        let config = PostgresConfig {
            database_url: std::env::var("DATABASE_URL")
                .unwrap_or_else(|_| "postgresql://localhost/taskqueue_test".to_string()),
            ..Default::default()
        };
        let store = JobStore::connect(&config).await.unwrap();
        store.install_schema().await.unwrap();

        let adapter = PostgresAdapter::new(config);
        adapter.state.handlers.write().await.insert(
            "chain".to_string(),
            handler_fn(|_message| async move { Ok(()) }),
        );

        let message = TaskMessage::recurring("chain", None, 1_000);
        store.close().await;

        let outcome =
            PostgresAdapter::renew_recurring(&adapter.state, &store, "chain", &message).await;
        assert_eq!(outcome, CompletionOutcome::ExecutedRenewalFailed);
    }
}
