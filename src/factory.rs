//! # Adapter Factory
//!
//! Maps configuration onto a concrete adapter. Construction is cheap and
//! connection-free; the adapter connects in `initialize` (AMQP) or on
//! first use (Postgres).

use tracing::{info, warn};

use crate::adapter::QueueAdapterKind;
use crate::amqp::AmqpAdapter;
use crate::config::{QueueBackendKind, QueueConfig};
use crate::error::QueueResult;
use crate::postgres::PostgresAdapter;

/// Build the adapter the configuration selects.
///
/// A missing backend falls back to Postgres with a warning; an
/// unrecognized backend name was already rejected when the configuration
/// was parsed.
pub fn build_adapter(config: &QueueConfig) -> QueueResult<QueueAdapterKind> {
    let backend = config.backend.unwrap_or_else(|| {
        warn!("No queue backend configured; defaulting to postgres");
        QueueBackendKind::Postgres
    });

    info!(backend = backend.as_str(), "Building queue adapter");

    let adapter = match backend {
        QueueBackendKind::Amqp => QueueAdapterKind::Amqp(AmqpAdapter::new(
            config.amqp.clone(),
            config.queue_prefix.clone(),
        )),
        QueueBackendKind::Postgres => {
            QueueAdapterKind::Postgres(PostgresAdapter::new(config.postgres.clone()))
        }
    };
    Ok(adapter)
}
