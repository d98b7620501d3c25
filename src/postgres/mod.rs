//! Postgres backend: the job-table store and the polling adapter on top.

mod adapter;
mod store;

pub use adapter::PostgresAdapter;
pub use store::{ClaimedJob, JobStore};
