//! `battenberg-amqp` is the AMQP 1.0 layer of `battenberg`, our Azure Service Bus client.
//!
//! `battenberg-amqp` provides:
//! - a strongly-typed contract for the underlying AMQP 1.0 transport (see the [`transport`]
//!   module) - connections, sessions, sender and receiver links, delivery streams and link
//!   lifecycle events;
//! - [`ServiceBusSettings`], to hold the parameters required to connect to a Service Bus
//!   namespace, including connection-string parsing;
//! - helpers to manipulate AMQP 1.0 message sections (see the [`amqp`] module);
//! - the lock-token codec used to settle and renew peek-locked messages (see [`lock_token`]);
//! - the broker error taxonomy and the mapper from raw AMQP error conditions (see [`error`]).
//!
//! The transport implementation itself (framing, SASL, heartbeats) lives behind the
//! [`transport::AmqpTransport`] seam; everything in this workspace is written against the
//! contract, never against a concrete AMQP engine.
//!
//! [`ServiceBusSettings`]: configuration::ServiceBusSettings

pub mod amqp;
pub mod configuration;
pub mod error;
pub mod lock_token;
pub mod transport;

pub use error::{BrokerCondition, BrokerError, TransportError};
pub use lock_token::LockToken;
