//! Seam between the reliable layer and the broker protocol.
//!
//! The supervisor only talks to the broker through these traits. The
//! production implementation is [`AmqpTransport`], built on `amqprs`.
//!
//! A [`Transport`] opens [`Link`]s. Each link carries a generation number
//! chosen by the caller and reports its lifecycle as [`LinkEvent`]s on the
//! sender passed to [`Transport::connect`]. A link opens [`LinkChannel`]s,
//! which are only valid while their link is.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::{consumer::Delivery, Result};

mod amqp;
pub use amqp::AmqpTransport;

/// Sequence number of a link, bumped on every (re)connect.
pub type Generation = u64;

/// Lifecycle notification from a link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// Connected and authenticated.
    Ready(Generation),
    /// Connection lost or closed by the peer.
    Detached {
        generation: Generation,
        reason: String,
    },
}

/// Publisher confirm as sent by the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Confirmation {
    Ack { delivery_tag: u64, multiple: bool },
    Nack { delivery_tag: u64, multiple: bool },
}

/// Result of a successful queue declaration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QueueInfo {
    pub message_count: u32,
    pub consumer_count: u32,
}

#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Open a link. Resolves once the link is ready for use.
    async fn connect(
        &self,
        uri: &str,
        generation: Generation,
        events: mpsc::UnboundedSender<LinkEvent>,
    ) -> Result<Arc<dyn Link>>;
}

/// One live broker connection.
#[async_trait]
pub trait Link: Send + Sync {
    fn generation(&self) -> Generation;
    fn is_open(&self) -> bool;
    async fn open_channel(&self) -> Result<Arc<dyn LinkChannel>>;
    async fn close(&self) -> Result<()>;
}

/// One channel on a link.
#[async_trait]
pub trait LinkChannel: Send + Sync {
    fn is_open(&self) -> bool;

    /// Declare a durable queue.
    async fn declare_queue(&self, queue: &str) -> Result<QueueInfo>;

    /// Limit unacknowledged deliveries on this channel.
    async fn set_prefetch(&self, prefetch_count: u16) -> Result<()>;

    /// Subscribe with manual acks, deliveries are forwarded in order. Returns the consumer tag.
    async fn consume(&self, queue: &str, deliveries: mpsc::UnboundedSender<Delivery>)
        -> Result<String>;

    async fn ack(&self, delivery_tag: u64) -> Result<()>;

    /// Put the channel in confirm mode, broker confirms are forwarded.
    async fn enable_confirms(&self, confirms: mpsc::UnboundedSender<Confirmation>) -> Result<()>;

    /// Persistent publish through the default exchange with `queue` as routing key.
    async fn publish(&self, queue: &str, payload: &[u8], priority: u8) -> Result<()>;

    async fn close(&self) -> Result<()>;
}
