use std::sync::Arc;

use tokio::sync::oneshot;
use tracing::{debug, error, warn};

use super::{
    client::ClientShared,
    confirm::PendingConfirm,
    consumer::{FnHandler, MessageHandler},
};
use crate::Result;

/// Handle to one named queue of a [`MessagingClient`].
///
/// The queue is declared durable on first use, by the first publish or
/// consume. Handles are cheap and can be created on every call.
///
/// [`MessagingClient`]: crate::MessagingClient
#[derive(Clone)]
pub struct Queue {
    name: String,
    client: Arc<ClientShared>,
}

impl Queue {
    pub(crate) fn new(name: &str, client: Arc<ClientShared>) -> Self {
        Self {
            name: name.to_owned(),
            client,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Publish a persistent message with the given priority.
    ///
    /// Returns `false` when no channel is available, e.g. while reconnecting.
    /// The broker's answer is only logged, see
    /// [`publish_confirmed`](Queue::publish_confirmed) to wait for it.
    pub async fn publish(&self, payload: &[u8], priority: u8) -> bool {
        let writer = self.client.registry.get_or_create_write(&self.name).await;
        match writer.publish(payload, priority, None).await {
            Ok(_) => true,
            Err(err) => {
                warn!("publish to queue '{}' failed: {}", self.name, err);
                false
            }
        }
    }

    /// Publish a persistent message and return a handle to the broker's answer.
    ///
    /// # Example
    /// ```no_run
    /// # use rabbit_queue::{MessagingClient, PublishOutcome};
    /// # async fn run(client: MessagingClient) -> rabbit_queue::Result<()> {
    /// let confirm = client.queue("orders").publish_confirmed(b"payload-1", 0).await?;
    /// if confirm.await != PublishOutcome::Ack {
    ///     // publish again or give up
    /// }
    /// # Ok(())
    /// # }
    /// ```
    pub async fn publish_confirmed(&self, payload: &[u8], priority: u8) -> Result<PendingConfirm> {
        let writer = self.client.registry.get_or_create_write(&self.name).await;
        let (responder, rx) = oneshot::channel();
        let sequence = writer.publish(payload, priority, Some(responder)).await?;
        Ok(PendingConfirm::new(&self.name, sequence, rx))
    }

    /// Consume with a plain function over the payload.
    ///
    /// See [`consume_with`](Queue::consume_with).
    pub async fn consume<F>(&self, f: F, prefetch: Option<u16>) -> bool
    where
        F: Fn(&[u8]) -> bool + Send + Sync + 'static,
    {
        self.consume_with(FnHandler::new(f), prefetch).await
    }

    /// Subscribe `handler` to this queue.
    ///
    /// Deliveries are acknowledged when the handler returns `true`. `None`
    /// uses the client's default prefetch. Subscribing again replaces the
    /// handler, the prefetch of the first subscription stays.
    ///
    /// Returns `true` if the subscription is live now. On `false` with a
    /// valid prefetch the handler stays registered and is subscribed when
    /// the connection is restored.
    pub async fn consume_with<H>(&self, handler: H, prefetch: Option<u16>) -> bool
    where
        H: MessageHandler + 'static,
    {
        let prefetch = match prefetch {
            Some(0) => {
                error!("prefetch of queue '{}' must be positive", self.name);
                return false;
            }
            Some(prefetch) => prefetch,
            None => self.client.default_prefetch,
        };

        let reader = self
            .client
            .registry
            .get_or_create_read(&self.name, Arc::new(handler), prefetch)
            .await;
        if reader.prefetch() != prefetch {
            debug!(
                "queue '{}' keeps prefetch {}, ignore {}",
                self.name,
                reader.prefetch(),
                prefetch
            );
        }
        reader.bound_generation().await.is_some()
    }
}
