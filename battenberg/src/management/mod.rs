//! The control-plane client: a pair of links on an entity's `$management` node, used for
//! request/response RPCs such as lock renewal.

pub use client::{ManagementClient, ManagementEvent, ManagementResponse};

mod client;

use battenberg_amqp::TransportError;

/// Failures of a management request.
#[derive(thiserror::Error, Debug, Clone)]
pub enum ManagementError {
    /// The request failed - synchronously because the link pair was not ready, at send
    /// time because the transport refused it, or because the broker answered with a
    /// non-2xx status.
    #[error("the management request failed{}", failure_details(.status, .condition))]
    RequestFailure {
        status: Option<u32>,
        condition: Option<String>,
        tracking_id: Option<String>,
        #[source]
        source: Option<TransportError>,
    },
    /// No response arrived within the request timeout.
    #[error("the management request timed out")]
    RequestTimeout,
    /// The response link detached while the request was in flight.
    #[error("the management request was terminated before a response arrived")]
    RequestTerminated,
    /// A response arrived whose correlation id matches no in-flight request.
    #[error("received a management response with no matching request")]
    OrphanedResponse { correlation_id: Option<String> },
}

fn failure_details(status: &Option<u32>, condition: &Option<String>) -> String {
    let mut details = String::new();
    if let Some(status) = status {
        details.push_str(&format!(" (status {status}"));
        if let Some(condition) = condition {
            details.push_str(&format!(", {condition}"));
        }
        details.push(')');
    }
    details
}
