//! One-shot batch receive: pull up to N messages, settled on the wire, with a deadline.

use battenberg_amqp::transport::{
    CreditPolicy, LinkEvent, ReceiverLinkPolicy, ReceiverOptions, SettleMode,
};
use battenberg_amqp_pool::ConnectionPool;
use tokio::sync::broadcast;
use tracing::debug;
use uuid::Uuid;

use crate::message::ReceivedMessage;
use crate::receivers::detach_details;

/// Error returned when a batch receive could not run to its deadline.
#[derive(thiserror::Error, Debug)]
pub enum BatchReceiveError {
    #[error("the receiver link detached during the batch receive{}", detach_details(.info))]
    Detached {
        info: Option<battenberg_amqp::transport::DetachInfo>,
    },
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Pull up to `count` messages from `entity_path`.
///
/// Opens a transient receiver link with an exactly-`count` credit window and wire-settled
/// deliveries, then resolves with whatever arrived when either the count is reached or
/// `timeout` elapses. The link, session and lease are torn down in every exit path.
///
/// Note: every call opens a fresh link; under high call rates this eats into the
/// per-connection link budget.
#[tracing::instrument(name = "receive_batch", skip(pool))]
pub(crate) async fn receive_batch(
    pool: &ConnectionPool,
    entity_path: &str,
    count: u32,
    timeout: std::time::Duration,
) -> Result<Vec<ReceivedMessage>, BatchReceiveError> {
    let lease = pool.lease(1).map_err(anyhow::Error::from)?;
    let connection = lease.connection().await.map_err(anyhow::Error::from)?;
    let session = connection
        .create_session()
        .await
        .map_err(anyhow::Error::from)?;
    let attach_result = session
        .create_receiver(ReceiverOptions {
            name: format!("batchReceiver${}", Uuid::new_v4()),
            source: entity_path.to_owned(),
            target: None,
            policy: ReceiverLinkPolicy {
                settle_mode: SettleMode::AutoSettle,
                credit_policy: CreditPolicy::DoNotRefresh,
                credit_quantum: 0,
            },
        })
        .await;
    let (link, mut deliveries) = match attach_result {
        Ok(receiver) => receiver,
        Err(error) => {
            let _ = session.end().await;
            return Err(anyhow::Error::from(error)
                .context("Failed to attach the batch receiver link.")
                .into());
        }
    };
    let mut link_events = link.events();

    let mut messages = Vec::with_capacity(count as usize);
    let result = match link.add_credit(count) {
        Err(error) => Err(BatchReceiveError::Other(
            anyhow::Error::from(error).context("Failed to issue the batch credit window."),
        )),
        Ok(()) => {
            let deadline = tokio::time::sleep(timeout);
            tokio::pin!(deadline);
            loop {
                tokio::select! {
                    // The broker has no drain support here: the deadline is what ends a
                    // short batch.
                    _ = &mut deadline => break Ok(()),
                    event = link_events.recv() => match event {
                        Ok(LinkEvent::Attached) => continue,
                        Ok(LinkEvent::Detached(info)) => break Err(BatchReceiveError::Detached { info }),
                        Err(broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(broadcast::error::RecvError::Closed) => {
                            break Err(BatchReceiveError::Detached { info: None })
                        }
                    },
                    delivery = deliveries.recv() => match delivery {
                        Some(delivery) => {
                            messages.push(ReceivedMessage::pre_settled(delivery));
                            if messages.len() >= count as usize {
                                break Ok(());
                            }
                        }
                        None => break Err(BatchReceiveError::Detached { info: None }),
                    },
                }
            }
        }
    };

    debug!(
        entity_path,
        collected = messages.len(),
        requested = count,
        "batch receive finished"
    );
    let _ = session.end().await;
    let _ = link.detach().await;
    lease.release();

    result.map(|()| messages)
}
