//! Publisher confirms.
//!
//! Every publish goes out on a channel in confirm mode. The broker answers
//! with an ack or a nack; if the channel goes away first the publish is
//! reported as lost. Exactly one [`PublishOutcome`] is produced per publish.

use std::{
    fmt,
    future::Future,
    pin::Pin,
    task::{Context, Poll},
};

use tokio::sync::oneshot;

/// Final state of one publish.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    /// Broker took responsibility for the message.
    Ack,
    /// Broker refused the message.
    Nack,
    /// Channel was closed or replaced before the broker answered.
    /// The message may or may not have been routed.
    Lost,
}

impl fmt::Display for PublishOutcome {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            PublishOutcome::Ack => f.write_str("ack"),
            PublishOutcome::Nack => f.write_str("nack"),
            PublishOutcome::Lost => f.write_str("lost"),
        }
    }
}

/// Handle returned by [`Queue::publish_confirmed`], resolves to the broker's answer.
///
/// Dropping it does not cancel anything; the outcome is still logged.
///
/// [`Queue::publish_confirmed`]: crate::queue::Queue::publish_confirmed
#[derive(Debug)]
pub struct PendingConfirm {
    queue: String,
    sequence: u64,
    rx: oneshot::Receiver<PublishOutcome>,
}

impl PendingConfirm {
    pub(crate) fn new(queue: &str, sequence: u64, rx: oneshot::Receiver<PublishOutcome>) -> Self {
        Self {
            queue: queue.to_owned(),
            sequence,
            rx,
        }
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Publisher confirm sequence number on the channel it was published on.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }
}

impl Future for PendingConfirm {
    type Output = PublishOutcome;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        // a dropped responder means the tracker went away with its channel
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|res| res.unwrap_or(PublishOutcome::Lost))
    }
}
