//! Tunable defaults recognized across the client.

use std::time::Duration;

/// Timeout applied to every management (control-plane) request.
pub const AMQP_REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

/// The broker's delivery lock duration we plan lock renewals against.
pub const SERVICE_BUS_DELIVERY_TIMEOUT: Duration = Duration::from_secs(30);

/// Default deadline for a batch receive.
pub const SERVICE_BUS_SERVER_TIMEOUT: Duration = Duration::from_secs(60);

/// Fraction of [`SERVICE_BUS_DELIVERY_TIMEOUT`] after which the next lock renewal runs.
pub const RENEW_THRESHOLD: f64 = 0.75;

/// Backoff between a link detach and the transparent reattach attempt.
pub const REATTACH_INTERVAL: Duration = Duration::from_secs(5);

/// Default ceiling on how long a message's lock keeps being renewed.
pub const DEFAULT_AUTO_RENEW_TIMEOUT: Duration = Duration::from_secs(300);

/// Default number of concurrently in-flight handler invocations per streaming receiver.
pub const DEFAULT_MAX_CONCURRENT_CALLS: u32 = 1;

/// Default timeout applied to a send when the caller does not pick one.
pub const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_secs(15);

/// How long before the lock deadline the next renewal is planned.
pub(crate) fn renewal_interval() -> Duration {
    SERVICE_BUS_DELIVERY_TIMEOUT.mul_f64(RENEW_THRESHOLD)
}

pub(crate) const DEAD_LETTER_SUFFIX: &str = "$DeadLetterQueue";
pub(crate) const MANAGEMENT_SUFFIX: &str = "$management";
