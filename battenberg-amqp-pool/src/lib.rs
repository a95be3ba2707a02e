//! `battenberg-amqp-pool` multiplexes AMQP links over a small number of shared connections.
//!
//! AMQP 1.0 carries many links over one connection, but the per-connection handle space is
//! bounded: naive link-per-connection usage exhausts server resources, while a single
//! connection per client exhausts the handle budget. The pool sits in between:
//!
//! - [`ConnectionPool::lease`] hands out a [`ConnectionLease`] counting a number of links
//!   against a per-connection budget, reusing the first connection with spare room and
//!   opening a new one otherwise.
//! - Releasing the last lease on a connection arms an idle-cleanup timer; if nobody leases
//!   the connection again before it fires, the connection is disconnected and removed.
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use battenberg_amqp::configuration::ServiceBusSettings;
//! use battenberg_amqp::transport::{AmqpTransport, ConnectionFactory};
//! use battenberg_amqp_pool::ConnectionPool;
//!
//! async fn example(transport: Arc<dyn AmqpTransport>) -> anyhow::Result<()> {
//!     let settings = ServiceBusSettings::from_connection_string(
//!         "Endpoint=sb://ns.servicebus.windows.net/;SharedAccessKeyName=n;SharedAccessKey=k",
//!     )?;
//!     let pool = ConnectionPool::new(ConnectionFactory::new(transport, settings));
//!
//!     // One lease, one link against the budget of the connection behind it.
//!     let lease = pool.lease(1)?;
//!     let _connection = lease.connection().await?;
//!     lease.release();
//!     Ok(())
//! }
//! ```

mod error;
mod pool;

pub use error::Error;
pub use pool::{ConnectionLease, ConnectionPool, PoolOptions};
