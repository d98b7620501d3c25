//! # Task Message & Read Model
//!
//! The task envelope carried through any backend, the handler contract,
//! and the introspection read-model (task info, queue stats, listings).
//!
//! Wire format is JSON with camelCase keys so payloads stay compatible
//! across backends and with external producers.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};

use crate::error::{QueueError, QueueResult};

/// Error type returned by task handlers.
///
/// Handlers may fail with any error; the adapter only needs to know that
/// the occurrence failed, not why.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Consumer callback invoked once per delivered task occurrence.
///
/// Returning `Err` signals failure: the AMQP adapter nacks without requeue,
/// the Postgres adapter lets the store's retry policy take over.
pub type TaskHandler =
    Arc<dyn Fn(TaskMessage) -> BoxFuture<'static, Result<(), HandlerError>> + Send + Sync>;

/// Wrap an async closure as a [`TaskHandler`].
pub fn handler_fn<F, Fut>(f: F) -> TaskHandler
where
    F: Fn(TaskMessage) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    Arc::new(move |message| Box::pin(f(message)))
}

/// The unit of work transported through any backend.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TaskMessage {
    /// Logical queue/task identifier; stable across retries and renewals
    pub task_name: String,

    /// Caller-supplied payload, passed through untouched
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,

    /// Forward-compatibility field; backend-native retry counters are
    /// authoritative where available
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_count: Option<u32>,

    /// Milliseconds since epoch, set once at first scheduling
    pub created_at: i64,

    /// When true, the consumer re-schedules an equivalent message after
    /// successful handling
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_recurring: Option<bool>,

    /// Delay before the next occurrence; required when `is_recurring`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interval_ms: Option<u64>,
}

impl TaskMessage {
    /// Create a one-shot task message.
    pub fn new(task_name: impl Into<String>, data: Option<serde_json::Value>) -> Self {
        Self {
            task_name: task_name.into(),
            data,
            retry_count: None,
            created_at: Utc::now().timestamp_millis(),
            is_recurring: None,
            interval_ms: None,
        }
    }

    /// Create a recurring task message with the given renewal interval.
    pub fn recurring(
        task_name: impl Into<String>,
        data: Option<serde_json::Value>,
        interval_ms: u64,
    ) -> Self {
        Self {
            task_name: task_name.into(),
            data,
            retry_count: None,
            created_at: Utc::now().timestamp_millis(),
            is_recurring: Some(true),
            interval_ms: Some(interval_ms),
        }
    }

    /// True when this message must be re-scheduled after successful handling.
    pub fn is_recurring(&self) -> bool {
        self.is_recurring.unwrap_or(false)
    }

    /// Enforce the envelope invariant: recurring implies a positive interval.
    pub fn validate(&self) -> QueueResult<()> {
        if self.is_recurring() {
            match self.interval_ms {
                Some(interval) if interval > 0 => Ok(()),
                _ => Err(QueueError::invalid_message(format!(
                    "recurring task '{}' requires a positive intervalMs",
                    self.task_name
                ))),
            }
        } else {
            Ok(())
        }
    }

    /// The message to publish for the next occurrence of a recurring task.
    ///
    /// Equivalent to the current message: `created_at` is preserved (it is
    /// set once at first scheduling), data is carried forward.
    pub fn renewal(&self) -> TaskMessage {
        self.clone()
    }
}

/// Outcome of consuming one occurrence.
///
/// Renewal is a distinct step from handler execution so a renewal failure
/// can be observed (and logged) without undoing the completed work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionOutcome {
    /// One-shot task executed successfully
    Executed,
    /// Recurring task executed and the next occurrence was scheduled
    ExecutedAndRenewed,
    /// Recurring task executed but scheduling the next occurrence failed;
    /// the chain stalls until re-armed externally
    ExecutedRenewalFailed,
}

/// Canonical task lifecycle states.
///
/// created → {active → (completed | failed → retry → active … | expired)}
/// | cancelled. Unknown backend-native states map to `Created` so
/// introspection stays resilient to backend version drift.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Created,
    Retry,
    Active,
    Completed,
    Expired,
    Cancelled,
    Failed,
}

impl TaskStatus {
    /// Map a backend-native state string onto the canonical enum.
    ///
    /// Unrecognized states default to `Created` rather than raising.
    pub fn from_native(state: &str) -> Self {
        match state {
            "created" => Self::Created,
            "retry" => Self::Retry,
            "active" => Self::Active,
            "completed" => Self::Completed,
            "expired" => Self::Expired,
            "cancelled" => Self::Cancelled,
            "failed" => Self::Failed,
            _ => Self::Created,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Retry => "retry",
            Self::Active => "active",
            Self::Completed => "completed",
            Self::Expired => "expired",
            Self::Cancelled => "cancelled",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Read-model for a single task occurrence.
///
/// Completeness is adapter-dependent: the Postgres adapter fills every
/// field from the job table; the AMQP adapter has no durable task history.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskInfo {
    pub id: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    pub status: TaskStatus,
    pub created_on: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_on: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_on: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_on: Option<DateTime<Utc>>,
    pub retries: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Per-queue aggregate counters, produced on demand.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStats {
    pub queue_name: String,
    /// Jobs in state `created`
    pub created: u64,
    /// Jobs awaiting execution (`created` + `retry`)
    pub waiting: u64,
    pub active: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
}

impl QueueStats {
    /// Zeroed stats for a queue; used where the backend exposes no metrics.
    pub fn empty(queue_name: impl Into<String>) -> Self {
        Self {
            queue_name: queue_name.into(),
            ..Default::default()
        }
    }
}

/// Sort field for task listings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskOrderBy {
    Created,
    Started,
    Completed,
}

/// Sort direction for task listings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    Asc,
    Desc,
}

/// Query shape for task listings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskListOptions {
    /// Restrict to one queue; None lists across all known queues
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queue_name: Option<String>,
    /// Restrict to tasks in any of these statuses
    #[serde(skip_serializing_if = "Option::is_none")]
    pub statuses: Option<Vec<TaskStatus>>,
    /// 1-based page index
    pub page: u32,
    pub page_size: u32,
    pub order_by: TaskOrderBy,
    pub order: SortOrder,
}

impl Default for TaskListOptions {
    fn default() -> Self {
        Self {
            queue_name: None,
            statuses: None,
            page: 1,
            page_size: 20,
            order_by: TaskOrderBy::Created,
            order: SortOrder::Desc,
        }
    }
}

impl TaskListOptions {
    pub fn for_queue(queue_name: impl Into<String>) -> Self {
        Self {
            queue_name: Some(queue_name.into()),
            ..Default::default()
        }
    }

    pub fn with_status(mut self, status: TaskStatus) -> Self {
        self.statuses.get_or_insert_with(Vec::new).push(status);
        self
    }

    pub fn with_page(mut self, page: u32, page_size: u32) -> Self {
        self.page = page;
        self.page_size = page_size;
        self
    }

    /// Apply status filtering, sorting, and pagination to a fetched set.
    ///
    /// Shared by adapters whose backend cannot do this server-side: the
    /// Postgres adapter fetches per queue and finishes here, as does the
    /// in-memory adapter. Missing started/completed timestamps fall back
    /// through `created_on` so ordering stays total.
    pub fn apply(&self, mut tasks: Vec<TaskInfo>) -> TaskPage {
        if let Some(statuses) = &self.statuses {
            tasks.retain(|t| statuses.contains(&t.status));
        }

        let key = |t: &TaskInfo| match self.order_by {
            TaskOrderBy::Created => t.created_on,
            TaskOrderBy::Started => t.started_on.unwrap_or(t.created_on),
            TaskOrderBy::Completed => t.completed_on.unwrap_or(t.created_on),
        };
        tasks.sort_by_key(key);
        if self.order == SortOrder::Desc {
            tasks.reverse();
        }

        let total = tasks.len() as u64;
        let page_size = self.page_size.max(1);
        let page = self.page.max(1);
        let total_pages = total.div_ceil(u64::from(page_size));

        let start = (u64::from(page) - 1) * u64::from(page_size);
        let tasks: Vec<TaskInfo> = tasks
            .into_iter()
            .skip(start as usize)
            .take(page_size as usize)
            .collect();

        TaskPage {
            tasks,
            total,
            page,
            page_size,
            total_pages,
        }
    }
}

/// One page of a task listing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskPage {
    pub tasks: Vec<TaskInfo>,
    pub total: u64,
    pub page: u32,
    pub page_size: u32,
    pub total_pages: u64,
}

impl TaskPage {
    /// An empty page echoing the requested coordinates.
    pub fn empty(options: &TaskListOptions) -> Self {
        Self {
            tasks: Vec::new(),
            total: 0,
            page: options.page.max(1),
            page_size: options.page_size.max(1),
            total_pages: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn info(id: &str, status: TaskStatus, created_secs: i64) -> TaskInfo {
        TaskInfo {
            id: id.to_string(),
            name: "t".to_string(),
            data: None,
            status,
            created_on: Utc.timestamp_opt(created_secs, 0).unwrap(),
            started_on: None,
            completed_on: None,
            failed_on: None,
            retries: 0,
            output: None,
            error: None,
        }
    }

    #[test]
    fn test_message_wire_format() {
        let msg = TaskMessage::recurring("news-fetch", Some(serde_json::json!({"q": 1})), 5000);
        let json = serde_json::to_value(&msg).unwrap();

        assert_eq!(json["taskName"], "news-fetch");
        assert_eq!(json["isRecurring"], true);
        assert_eq!(json["intervalMs"], 5000);
        assert!(json.get("retryCount").is_none());

        let decoded: TaskMessage = serde_json::from_value(json).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_recurring_invariant() {
        let ok = TaskMessage::recurring("t", None, 1000);
        assert!(ok.validate().is_ok());

        let mut bad = TaskMessage::new("t", None);
        bad.is_recurring = Some(true);
        assert!(bad.validate().is_err());

        bad.interval_ms = Some(0);
        assert!(bad.validate().is_err());

        let one_shot = TaskMessage::new("t", None);
        assert!(!one_shot.is_recurring());
        assert!(one_shot.validate().is_ok());
    }

    #[test]
    fn test_renewal_preserves_envelope() {
        let msg = TaskMessage::recurring("heartbeat", Some(serde_json::json!({"n": 2})), 200);
        let next = msg.renewal();
        assert_eq!(next.created_at, msg.created_at);
        assert_eq!(next.data, msg.data);
        assert_eq!(next.interval_ms, Some(200));
    }

    #[test]
    fn test_status_from_native_unknown_defaults_to_created() {
        assert_eq!(TaskStatus::from_native("failed"), TaskStatus::Failed);
        assert_eq!(TaskStatus::from_native("retry"), TaskStatus::Retry);
        assert_eq!(TaskStatus::from_native("who_knows"), TaskStatus::Created);
    }

    #[test]
    fn test_listing_pagination_arithmetic() {
        let tasks: Vec<TaskInfo> = (0..45)
            .map(|i| info(&format!("job-{i}"), TaskStatus::Created, i))
            .collect();

        let page1 = TaskListOptions::default()
            .with_page(1, 20)
            .apply(tasks.clone());
        assert_eq!(page1.tasks.len(), 20);
        assert_eq!(page1.total, 45);
        assert_eq!(page1.total_pages, 3);

        let page3 = TaskListOptions::default().with_page(3, 20).apply(tasks);
        assert_eq!(page3.tasks.len(), 5);
        assert_eq!(page3.page, 3);
    }

    #[test]
    fn test_listing_status_filter_is_exact() {
        let tasks = vec![
            info("a", TaskStatus::Failed, 1),
            info("b", TaskStatus::Retry, 2),
            info("c", TaskStatus::Completed, 3),
            info("d", TaskStatus::Failed, 4),
        ];

        let page = TaskListOptions::default()
            .with_status(TaskStatus::Failed)
            .apply(tasks);
        assert_eq!(page.total, 2);
        assert!(page.tasks.iter().all(|t| t.status == TaskStatus::Failed));
    }

    proptest::proptest! {
        // Walking every page yields each task exactly once, in order.
        #[test]
        fn prop_pages_partition_the_listing(total in 0usize..120, page_size in 1u32..40) {
            let tasks: Vec<TaskInfo> = (0..total)
                .map(|i| info(&format!("job-{i}"), TaskStatus::Created, i as i64))
                .collect();
            let base = TaskListOptions {
                order: SortOrder::Asc,
                ..Default::default()
            };

            let first = base.clone().with_page(1, page_size).apply(tasks.clone());
            proptest::prop_assert_eq!(first.total, total as u64);
            proptest::prop_assert_eq!(
                first.total_pages,
                (total as u64).div_ceil(u64::from(page_size))
            );

            let mut seen = Vec::new();
            for page in 1..=first.total_pages.max(1) {
                let chunk = base
                    .clone()
                    .with_page(page as u32, page_size)
                    .apply(tasks.clone());
                proptest::prop_assert!(chunk.tasks.len() <= page_size as usize);
                seen.extend(chunk.tasks.into_iter().map(|t| t.id));
            }

            let expected: Vec<String> = (0..total).map(|i| format!("job-{i}")).collect();
            proptest::prop_assert_eq!(seen, expected);
        }
    }

    #[test]
    fn test_listing_sort_falls_back_to_created_on() {
        let mut started = info("started", TaskStatus::Active, 10);
        started.started_on = Some(Utc.timestamp_opt(100, 0).unwrap());
        let unstarted = info("unstarted", TaskStatus::Created, 50);

        let page = TaskListOptions {
            order_by: TaskOrderBy::Started,
            order: SortOrder::Asc,
            ..Default::default()
        }
        .apply(vec![started, unstarted]);

        assert_eq!(page.tasks[0].id, "unstarted");
        assert_eq!(page.tasks[1].id, "started");
    }
}
