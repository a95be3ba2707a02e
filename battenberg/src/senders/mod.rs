//! Facilities to send messages to a queue or topic. Check out [`Sender`] as a starting
//! point.

pub use sender::{SendError, Sender};

mod sender;
