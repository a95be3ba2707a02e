//! `battenberg` is a client for Azure Service Bus, built on top of an AMQP 1.0 transport,
//! to send and receive brokered messages on queues and topic subscriptions - including
//! their dead-letter sub-entities.
//!
//! The interesting parts live below the surface API:
//!
//! - a connection pool that multiplexes many links over few AMQP connections, subject to a
//!   per-connection link budget, reaping idle connections on a delay (the
//!   `battenberg-amqp-pool` crate);
//! - a credit manager that keeps the number of unsettled messages at the application
//!   bounded, returning exactly one flow credit per delivery across immediate and delayed
//!   settlement;
//! - a peek-lock processing pipeline with automatic lock renewal, auto-settlement on the
//!   handler's outcome, and transparent link reattach;
//! - a management request/response client on each entity's `$management` node, used for
//!   lock renewal.
//!
//! [`ServiceBusClient`] is the entrypoint: it hands out cached [`QueueClient`] and
//! [`TopicClient`] handles.
//!
//! The AMQP engine itself is pluggable: see [`battenberg_amqp::transport`].

pub mod client;
pub mod constants;
pub mod management;
pub mod message;
pub mod queue;
pub mod receivers;
pub mod senders;
pub mod topic;

pub use client::ServiceBusClient;
pub use message::{BrokeredMessage, ProcessingState, ReceivedMessage};
pub use queue::QueueClient;
pub use receivers::{
    ClosureHandler, LockAutoRenew, MessageHandler, MessageListener, OnMessageOptions,
    ReceiveMode, ReceiverError, ReceiverEvent,
};
pub use senders::{SendError, Sender};
pub use topic::TopicClient;

// Re-export of the AMQP layer and the pool, so that depending on `battenberg` alone is
// enough to build and run a client.
pub use battenberg_amqp;
pub use battenberg_amqp_pool;
