//! A module to re-export the AMQP 1.0 protocol types exposed by the public API of this crate,
//! plus helpers to manipulate message sections.
//!
//! This ensures that users of the client do not have to add `fe2o3-amqp-types` as a direct
//! dependency, with all the associated waltzer of keeping dependencies in sync.

use fe2o3_amqp_types::messaging::annotations::OwnedKey;

/// The AMQP 1.0 message sections. Re-exported from `fe2o3-amqp-types`.
pub use fe2o3_amqp_types::messaging::{
    Accepted, AmqpValue, ApplicationProperties, Body, Header, Message, MessageAnnotations,
    MessageId, Modified, Outcome, Properties, Rejected, Released,
};
/// AMQP 1.0 primitive types. Re-exported from `fe2o3-amqp-types`.
pub use fe2o3_amqp_types::primitives::{
    Array, OrderedMap, SimpleValue, Symbol, Timestamp, Uuid, Value,
};

// Re-export protocol definitions (error conditions, settle modes, ...).
pub use fe2o3_amqp_types::definitions;

/// An AMQP 1.0 message as carried on the wire.
pub type AmqpMessage = Message<Body<Value>>;

/// Build a message with no body section.
pub fn empty_message() -> AmqpMessage {
    Message {
        header: None,
        delivery_annotations: None,
        message_annotations: None,
        properties: None,
        application_properties: None,
        body: Body::Empty,
        footer: None,
    }
}

/// Build a message whose body is a single `amqp-value` section.
pub fn value_message(value: Value) -> AmqpMessage {
    AmqpMessage {
        body: Body::Value(AmqpValue(value)),
        ..empty_message()
    }
}

/// The `amqp-value` body of a message, if it has one.
pub fn body_value(message: &AmqpMessage) -> Option<&Value> {
    match &message.body {
        Body::Value(AmqpValue(value)) => Some(value),
        _ => None,
    }
}

/// The bare properties section of a message, created on first access.
pub fn properties_mut(message: &mut AmqpMessage) -> &mut Properties {
    message.properties.get_or_insert_with(Properties::default)
}

/// Set the value for a key inside the application-properties section of a message.
pub fn set_application_property(message: &mut AmqpMessage, key: &str, value: SimpleValue) {
    message
        .application_properties
        .get_or_insert_with(ApplicationProperties::default)
        .0
        .insert(key.to_owned(), value);
}

/// Lookup an application property by key.
pub fn get_application_property<'m>(message: &'m AmqpMessage, key: &str) -> Option<&'m SimpleValue> {
    message.application_properties.as_ref()?.0.get(key)
}

/// Set the value for a symbol-keyed message annotation.
pub fn set_message_annotation(message: &mut AmqpMessage, key: &str, value: Value) {
    message
        .message_annotations
        .get_or_insert_with(MessageAnnotations::default)
        .0
        .insert(OwnedKey::Symbol(Symbol::from(key)), value);
}

/// Lookup a message annotation by symbol key.
pub fn get_message_annotation<'m>(message: &'m AmqpMessage, key: &str) -> Option<&'m Value> {
    message
        .message_annotations
        .as_ref()?
        .0
        .get(&OwnedKey::Symbol(Symbol::from(key)))
}

/// Convert a wall-clock instant to an AMQP timestamp (milliseconds since the Unix epoch).
///
/// Instants before the epoch clamp to the epoch - AMQP timestamps of brokered messages are
/// always on the right side of 1970.
pub fn timestamp_from_system_time(time: std::time::SystemTime) -> Timestamp {
    let millis = time
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0);
    Timestamp::from_milliseconds(millis)
}

/// Convert an AMQP timestamp back to a wall-clock instant.
pub fn system_time_from_timestamp(timestamp: &Timestamp) -> std::time::SystemTime {
    let millis = timestamp.milliseconds();
    if millis >= 0 {
        std::time::UNIX_EPOCH + std::time::Duration::from_millis(millis as u64)
    } else {
        std::time::UNIX_EPOCH - std::time::Duration::from_millis(millis.unsigned_abs())
    }
}
