use std::{
    sync::{Arc, PoisonError, RwLock},
    time::Duration,
};

use tokio::{
    sync::{mpsc, oneshot, Mutex},
    task::JoinHandle,
};
use tracing::{debug, error, info, trace, warn};

use super::declare_durable;
use crate::{
    consumer::{Delivery, MessageHandler},
    error::Error,
    transport::{Generation, Link, LinkChannel},
    Result,
};

type HandlerSlot = Arc<RwLock<Arc<dyn MessageHandler>>>;

/// Consumer side of one queue.
pub(crate) struct ReadChannel {
    name: String,
    prefetch: u16,
    declare_timeout: Duration,
    handler: HandlerSlot,
    binding: Mutex<Option<ReadBinding>>,
}

struct ReadBinding {
    generation: Generation,
    channel: Arc<dyn LinkChannel>,
    consumer_tag: String,
    shutdown_tx: oneshot::Sender<()>,
    consumer_task: JoinHandle<()>,
}

impl ReadChannel {
    pub(crate) fn new(
        name: &str,
        handler: Arc<dyn MessageHandler>,
        prefetch: u16,
        declare_timeout: Duration,
    ) -> Self {
        Self {
            name: name.to_owned(),
            prefetch,
            declare_timeout,
            handler: Arc::new(RwLock::new(handler)),
            binding: Mutex::new(None),
        }
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn prefetch(&self) -> u16 {
        self.prefetch
    }

    /// Takes effect from the next delivery on, without resubscribing.
    pub(crate) fn set_handler(&self, handler: Arc<dyn MessageHandler>) {
        *self.handler.write().unwrap_or_else(PoisonError::into_inner) = handler;
    }

    pub(crate) async fn bound_generation(&self) -> Option<Generation> {
        self.binding
            .lock()
            .await
            .as_ref()
            .filter(|b| b.channel.is_open())
            .map(|b| b.generation)
    }

    /// Declare the queue on a fresh channel of `link`, set prefetch and subscribe.
    pub(crate) async fn start(&self, link: &Arc<dyn Link>) -> Result<()> {
        let mut binding = self.binding.lock().await;
        if let Some(current) = binding.as_ref() {
            if current.generation > link.generation() {
                return Err(Error::ChannelUseError(format!(
                    "queue '{}' already bound to link {}, refuse stale link {}",
                    self.name,
                    current.generation,
                    link.generation()
                )));
            }
            if current.generation == link.generation() && current.channel.is_open() {
                trace!("queue '{}' already bound to link {}", self.name, current.generation);
                return Ok(());
            }
        }
        if let Some(old) = binding.take() {
            old.release(&self.name).await;
        }

        let channel = link.open_channel().await?;
        let (deliveries_tx, deliveries_rx) = mpsc::unbounded_channel();
        let subscribed = async {
            declare_durable(channel.as_ref(), &self.name, self.declare_timeout).await?;
            channel.set_prefetch(self.prefetch).await?;
            channel.consume(&self.name, deliveries_tx).await
        };
        let consumer_tag = match subscribed.await {
            Ok(consumer_tag) => consumer_tag,
            Err(err) => {
                if let Err(close_err) = channel.close().await {
                    debug!("close channel of queue '{}': {}", self.name, close_err);
                }
                return Err(err);
            }
        };

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let consumer_task = tokio::spawn(run_consumer(
            self.name.clone(),
            link.generation(),
            channel.clone(),
            self.handler.clone(),
            deliveries_rx,
            shutdown_rx,
        ));
        info!(
            "consumer {} of queue '{}' subscribed on link {}, prefetch {}",
            consumer_tag,
            self.name,
            link.generation(),
            self.prefetch
        );
        binding.replace(ReadBinding {
            generation: link.generation(),
            channel,
            consumer_tag,
            shutdown_tx,
            consumer_task,
        });
        Ok(())
    }

    /// Stop consuming, unacknowledged deliveries go back to the broker with the channel.
    pub(crate) async fn release(&self) {
        let old = self.binding.lock().await.take();
        if let Some(old) = old {
            old.release(&self.name).await;
        }
    }
}

impl ReadBinding {
    /// Returns once no handler of this binding runs anymore.
    async fn release(self, queue: &str) {
        // consumer task may already be gone, then there is nobody to notify
        let _ = self.shutdown_tx.send(());
        if let Err(err) = self.consumer_task.await {
            error!("consumer task of queue '{}' failed: {}", queue, err);
        }
        if self.channel.is_open() {
            if let Err(err) = self.channel.close().await {
                debug!("close channel of queue '{}': {}", queue, err);
            }
        }
        debug!(
            "consumer {} of queue '{}' released link {}",
            self.consumer_tag, queue, self.generation
        );
    }
}

/// Runs the handler for each delivery of one binding, in order, and acks on success.
///
/// Acks always go to the channel the delivery arrived on. On shutdown a
/// handler still running is cancelled and its delivery left unacknowledged.
async fn run_consumer(
    queue: String,
    generation: Generation,
    channel: Arc<dyn LinkChannel>,
    handler_slot: HandlerSlot,
    mut deliveries: mpsc::UnboundedReceiver<Delivery>,
    mut shutdown_rx: oneshot::Receiver<()>,
) {
    trace!("starts consumer task of queue '{}' on link {}", queue, generation);
    loop {
        let delivery = tokio::select! {
            biased;

            _ = &mut shutdown_rx => break,
            delivery = deliveries.recv() => match delivery {
                Some(delivery) => delivery,
                None => {
                    warn!(
                        "channel of queue '{}' on link {} closed, consumer stops",
                        queue, generation
                    );
                    break;
                }
            },
        };
        let delivery_tag = delivery.delivery_tag();
        if delivery.redelivered() {
            debug!("redelivery {} on queue '{}'", delivery_tag, queue);
        }

        let handler = handler_slot
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        // a panic stays inside the handler task
        let mut handler_task = tokio::spawn(async move { handler.handle(&delivery).await });
        let handled = tokio::select! {
            biased;

            _ = &mut shutdown_rx => {
                handler_task.abort();
                let _ = handler_task.await;
                debug!(
                    "handler of queue '{}' cancelled on delivery {}, left unacknowledged",
                    queue, delivery_tag
                );
                break;
            }
            handled = &mut handler_task => handled,
        };
        match handled {
            Ok(true) => match channel.ack(delivery_tag).await {
                Ok(()) => trace!("acked delivery {} on queue '{}'", delivery_tag, queue),
                Err(err) => warn!(
                    "ack of delivery {} on queue '{}' failed: {}",
                    delivery_tag, queue, err
                ),
            },
            Ok(false) => warn!(
                "handler declined delivery {} on queue '{}', left unacknowledged",
                delivery_tag, queue
            ),
            Err(err) => error!(
                "handler of queue '{}' failed on delivery {}: {}",
                queue, delivery_tag, err
            ),
        }
    }
    debug!("consumer task of queue '{}' on link {} exits", queue, generation);
}
