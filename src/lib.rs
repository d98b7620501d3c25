//! # taskqueue-core
//!
//! Backend-agnostic delayed and recurring task scheduling over
//! interchangeable queue backends.
//!
//! ## Architecture
//!
//! - **[`TaskManager`]** — application-facing facade; lazily constructs
//!   and memoizes one adapter from configuration
//! - **[`QueueAdapter`]** — the contract every backend implements:
//!   scheduling, consumption, cancellation, introspection
//! - **[`AmqpAdapter`]** — RabbitMQ backend; delay via per-message TTL
//!   plus a dead-letter exchange, recurrence re-published by the consumer
//! - **[`PostgresAdapter`]** — job-table backend; native delayed start,
//!   store-level retry, full task history for introspection
//! - **[`InMemoryAdapter`]** — process-local backend for tests and
//!   development
//!
//! ## Example
//!
//! ```no_run
//! use taskqueue_core::{handler_fn, QueueConfig, TaskManager};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let manager = TaskManager::new(QueueConfig::from_env()?);
//! manager.initialize().await?;
//!
//! manager
//!     .register_consumer(
//!         "welcome-email",
//!         handler_fn(|message| async move {
//!             println!("sending welcome email: {:?}", message.data);
//!             Ok(())
//!         }),
//!     )
//!     .await?;
//!
//! manager
//!     .schedule_task("welcome-email", 0, Some(serde_json::json!({"user": 42})))
//!     .await?;
//! # Ok(())
//! # }
//! ```

pub mod adapter;
pub mod amqp;
pub mod config;
pub mod error;
pub mod factory;
pub mod in_memory;
pub mod manager;
pub mod message;
pub mod postgres;

pub use adapter::{QueueAdapter, QueueAdapterKind};
pub use amqp::AmqpAdapter;
pub use config::{AmqpConfig, PostgresConfig, QueueBackendKind, QueueConfig};
pub use error::{QueueError, QueueResult};
pub use factory::build_adapter;
pub use in_memory::InMemoryAdapter;
pub use manager::TaskManager;
pub use message::{
    handler_fn, CompletionOutcome, HandlerError, QueueStats, SortOrder, TaskHandler, TaskInfo,
    TaskListOptions, TaskMessage, TaskOrderBy, TaskPage, TaskStatus,
};
pub use postgres::PostgresAdapter;
