//! Flow-credit accounting for a receiver link.
//!
//! Every delivery observed on a link consumes one credit; the credit manager decides when
//! the window is topped back up. Settlements - immediate or delayed - each return exactly
//! one credit, and the pending-settle set below is what keeps that "exactly one" true
//! across both paths.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use battenberg_amqp::transport::{
    CreditPolicy, LinkState, ReceiverLink, ReceiverLinkPolicy, SettleMode,
};
use battenberg_amqp::{LockToken, TransportError};
use tracing::debug;

use crate::receivers::ReceiveMode;

/// Failures issuing flow credits.
#[derive(thiserror::Error, Debug)]
pub enum CreditError {
    #[error("no receiver link has been bound to the credit manager")]
    LinkNotFound,
    #[error("failed to issue flow credits on the receiver link")]
    Flow(#[source] TransportError),
}

/// Per-link credit accounting.
///
/// Built before the link exists (the derived [`link_policy`](Self::link_policy) is part of
/// link creation) and bound to it afterwards via [`bind`](Self::bind).
pub struct CreditManager {
    mode: ReceiveMode,
    initial_credit: u32,
    threshold: u32,
    state: Mutex<CreditState>,
}

struct CreditState {
    link: Option<Arc<dyn ReceiverLink>>,
    /// Lock tokens of messages in the delayed-settle window. Counted once at scheduling
    /// time; the eventual settlement must not count them again.
    pending_settles: HashSet<LockToken>,
    additional_credits: u32,
}

impl CreditManager {
    pub fn new(mode: ReceiveMode, max_concurrent_calls: u32) -> Self {
        Self {
            mode,
            initial_credit: max_concurrent_calls,
            threshold: max_concurrent_calls.div_ceil(2),
            state: Mutex::new(CreditState {
                link: None,
                pending_settles: HashSet::new(),
                additional_credits: 0,
            }),
        }
    }

    /// The link policy derived from the receive mode.
    ///
    /// Peek-lock puts the link in settle-on-disposition mode with a manually replenished
    /// window sized to the concurrency cap; receive-and-delete passes the library default
    /// through untouched.
    pub fn link_policy(&self) -> ReceiverLinkPolicy {
        match self.mode {
            ReceiveMode::PeekLock => ReceiverLinkPolicy {
                settle_mode: SettleMode::SettleOnDisposition,
                credit_policy: CreditPolicy::Manual,
                credit_quantum: self.initial_credit,
            },
            ReceiveMode::ReceiveAndDelete => ReceiverLinkPolicy::default(),
        }
    }

    /// Bind the manager to the link it accounts for. Called once, right after link
    /// creation.
    pub fn bind(&self, link: Arc<dyn ReceiverLink>) {
        self.state
            .lock()
            .expect("credit state lock poisoned")
            .link = Some(link);
    }

    /// Record that `token` will settle later (delayed settlement). The credit is counted
    /// now; the eventual [`settle_message`](Self::settle_message) will not count it again.
    /// Scheduling the same token twice is a no-op.
    pub fn schedule_message_settle(&self, token: LockToken) {
        {
            let mut state = self.state.lock().expect("credit state lock poisoned");
            if !state.pending_settles.insert(token) {
                return;
            }
            state.additional_credits += 1;
        }
        if let Err(error) = self.refresh_credits() {
            debug!(%token, %error, "credit refresh skipped while scheduling settle");
        }
    }

    /// Record that `token` settled. Counts one credit unless the token was already counted
    /// by [`schedule_message_settle`](Self::schedule_message_settle).
    pub fn settle_message(&self, token: LockToken) {
        {
            let mut state = self.state.lock().expect("credit state lock poisoned");
            if !state.pending_settles.remove(&token) {
                state.additional_credits += 1;
            }
        }
        if let Err(error) = self.refresh_credits() {
            debug!(%token, %error, "credit refresh skipped while settling");
        }
    }

    /// Top the link's credit window back up when it has drained below the threshold.
    ///
    /// Silently does nothing while the link is detached - sending flow on a detached link
    /// is a protocol error; the accrued credits are issued after the next refresh on an
    /// attached link.
    pub fn refresh_credits(&self) -> Result<(), CreditError> {
        let mut state = self.state.lock().expect("credit state lock poisoned");
        let Some(link) = state.link.clone() else {
            return Err(CreditError::LinkNotFound);
        };
        if link.state() != LinkState::Attached {
            return Ok(());
        }
        if state.additional_credits > 0 && link.credit() < self.threshold {
            link.add_credit(state.additional_credits)
                .map_err(CreditError::Flow)?;
            state.additional_credits = 0;
        }
        Ok(())
    }

    /// Number of messages currently in the delayed-settle window.
    pub fn pending_settle_count(&self) -> usize {
        self.state
            .lock()
            .expect("credit state lock poisoned")
            .pending_settles
            .len()
    }
}
