//! The transport error type and the mapper from raw AMQP error conditions to the broker
//! error taxonomy.

use std::fmt;

use fe2o3_amqp_types::definitions::{self, AmqpError, ErrorCondition};

/// The error type returned by the transport contract ([`crate::transport`]).
///
/// Carries the AMQP error condition when the failure originated from the peer, so callers
/// can run it through [`broker_error`] to classify it.
#[derive(thiserror::Error, Debug, Clone)]
#[error("{message}")]
pub struct TransportError {
    /// Human-readable description of the failure.
    pub message: String,
    /// The AMQP error condition reported by the peer, if any.
    pub condition: Option<ErrorCondition>,
}

impl TransportError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            condition: None,
        }
    }

    pub fn with_condition(message: impl Into<String>, condition: ErrorCondition) -> Self {
        Self {
            message: message.into(),
            condition: Some(condition),
        }
    }
}

impl From<definitions::Error> for TransportError {
    fn from(error: definitions::Error) -> Self {
        let message = error
            .description
            .clone()
            .unwrap_or_else(|| format!("{:?}", error.condition));
        Self {
            message,
            condition: Some(error.condition),
        }
    }
}

/// The broker-level error classes a Service Bus peer can report on a link, session or
/// connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokerCondition {
    InternalError,
    NotFound,
    UnauthorizedAccess,
    DecodeError,
    ResourceLimitExceeded,
    NotAllowed,
    InvalidField,
    NotImplemented,
    ResourceLocked,
    PreconditionFailed,
    ResourceDeleted,
    FrameSizeTooSmall,
    IllegalState,
    /// The peer reported a condition this crate does not recognize.
    Unknown,
}

impl fmt::Display for BrokerCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let symbol = match self {
            Self::InternalError => "amqp:internal-error",
            Self::NotFound => "amqp:not-found",
            Self::UnauthorizedAccess => "amqp:unauthorized-access",
            Self::DecodeError => "amqp:decode-error",
            Self::ResourceLimitExceeded => "amqp:resource-limit-exceeded",
            Self::NotAllowed => "amqp:not-allowed",
            Self::InvalidField => "amqp:invalid-field",
            Self::NotImplemented => "amqp:not-implemented",
            Self::ResourceLocked => "amqp:resource-locked",
            Self::PreconditionFailed => "amqp:precondition-failed",
            Self::ResourceDeleted => "amqp:resource-deleted",
            Self::FrameSizeTooSmall => "amqp:frame-size-too-small",
            Self::IllegalState => "amqp:illegal-state",
            Self::Unknown => "unknown",
        };
        f.write_str(symbol)
    }
}

/// A classified broker failure.
#[derive(thiserror::Error, Debug, Clone)]
#[error("the broker reported `{condition}`: {message}")]
pub struct BrokerError {
    pub condition: BrokerCondition,
    pub message: String,
}

/// Classify a transport failure by its AMQP error condition.
///
/// Returns `None` when the failure carries no condition at all - a local I/O problem rather
/// than something the broker said.
pub fn broker_error(error: &TransportError) -> Option<BrokerError> {
    let condition = error.condition.as_ref()?;
    let condition = match condition {
        ErrorCondition::AmqpError(amqp) => match amqp {
            AmqpError::InternalError => BrokerCondition::InternalError,
            AmqpError::NotFound => BrokerCondition::NotFound,
            AmqpError::UnauthorizedAccess => BrokerCondition::UnauthorizedAccess,
            AmqpError::DecodeError => BrokerCondition::DecodeError,
            AmqpError::ResourceLimitExceeded => BrokerCondition::ResourceLimitExceeded,
            AmqpError::NotAllowed => BrokerCondition::NotAllowed,
            AmqpError::InvalidField => BrokerCondition::InvalidField,
            AmqpError::NotImplemented => BrokerCondition::NotImplemented,
            AmqpError::ResourceLocked => BrokerCondition::ResourceLocked,
            AmqpError::PreconditionFailed => BrokerCondition::PreconditionFailed,
            AmqpError::ResourceDeleted => BrokerCondition::ResourceDeleted,
            AmqpError::FrameSizeTooSmall => BrokerCondition::FrameSizeTooSmall,
            AmqpError::IllegalState => BrokerCondition::IllegalState,
        },
        _ => BrokerCondition::Unknown,
    };
    Some(BrokerError {
        condition,
        message: error.message.clone(),
    })
}
