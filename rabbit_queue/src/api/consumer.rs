//! Consumer side API: inbound deliveries and the handlers that process them.
//!
//! A handler returns `true` to acknowledge a delivery. Returning `false` (or
//! panicking) leaves the delivery unacknowledged; the client never sends a
//! negative acknowledgement, so when the message comes back is up to the
//! broker, typically once the channel it was delivered on is closed.

use async_trait::async_trait;

/// One message received from a queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    payload: Vec<u8>,
    delivery_tag: u64,
    redelivered: bool,
}

impl Delivery {
    pub fn new(payload: Vec<u8>, delivery_tag: u64, redelivered: bool) -> Self {
        Self {
            payload,
            delivery_tag,
            redelivered,
        }
    }

    /// Message body as published.
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Broker assigned tag, only meaningful on the channel the message arrived on.
    pub fn delivery_tag(&self) -> u64 {
        self.delivery_tag
    }

    /// `true` if the broker delivered this message before without an ack.
    pub fn redelivered(&self) -> bool {
        self.redelivered
    }

    pub fn into_payload(self) -> Vec<u8> {
        self.payload
    }
}

/// Callback invoked once per delivery, in delivery order.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Return `true` to acknowledge the delivery.
    async fn handle(&self, delivery: &Delivery) -> bool;
}

/// Adapter for plain closures over the payload, see [`Queue::consume`].
///
/// [`Queue::consume`]: crate::queue::Queue::consume
pub struct FnHandler<F> {
    f: F,
}

impl<F> FnHandler<F>
where
    F: Fn(&[u8]) -> bool + Send + Sync,
{
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<F> MessageHandler for FnHandler<F>
where
    F: Fn(&[u8]) -> bool + Send + Sync,
{
    async fn handle(&self, delivery: &Delivery) -> bool {
        (self.f)(delivery.payload())
    }
}
