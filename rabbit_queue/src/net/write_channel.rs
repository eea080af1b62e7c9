use std::{collections::BTreeMap, sync::Arc, time::Duration};

use tokio::{
    sync::{mpsc, oneshot, Mutex},
    task::JoinHandle,
};
use tracing::{debug, error, info, trace, warn};

use super::declare_durable;
use crate::{
    confirm::PublishOutcome,
    error::Error,
    transport::{Confirmation, Generation, Link, LinkChannel},
    Result,
};

/// Publisher side of one queue.
pub(crate) struct WriteChannel {
    name: String,
    declare_timeout: Duration,
    binding: Mutex<Option<WriteBinding>>,
}

struct WriteBinding {
    generation: Generation,
    channel: Arc<dyn LinkChannel>,
    tracker: Arc<Mutex<ConfirmTracker>>,
    stop_tracker: oneshot::Sender<()>,
    tracker_task: JoinHandle<()>,
}

impl WriteChannel {
    pub(crate) fn new(name: &str, declare_timeout: Duration) -> Self {
        Self {
            name: name.to_owned(),
            declare_timeout,
            binding: Mutex::new(None),
        }
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    /// Generation of the link this channel is bound to, if any.
    pub(crate) async fn bound_generation(&self) -> Option<Generation> {
        self.binding
            .lock()
            .await
            .as_ref()
            .filter(|b| b.channel.is_open())
            .map(|b| b.generation)
    }

    /// Declare the queue on a fresh channel of `link` and put it in confirm mode.
    ///
    /// A binding to an older generation is released first, its pending
    /// publishes resolve as lost.
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
        let (confirms_tx, confirms_rx) = mpsc::unbounded_channel();
        let prepared = async {
            declare_durable(channel.as_ref(), &self.name, self.declare_timeout).await?;
            channel.enable_confirms(confirms_tx).await
        };
        if let Err(err) = prepared.await {
            if let Err(close_err) = channel.close().await {
                debug!("close channel of queue '{}': {}", self.name, close_err);
            }
            return Err(err);
        }

        let tracker = Arc::new(Mutex::new(ConfirmTracker::new(&self.name)));
        let (stop_tracker, stop_rx) = oneshot::channel();
        let tracker_task = tokio::spawn(track_confirms(tracker.clone(), confirms_rx, stop_rx));
        binding.replace(WriteBinding {
            generation: link.generation(),
            channel,
            tracker,
            stop_tracker,
            tracker_task,
        });
        info!("publisher of queue '{}' bound to link {}", self.name, link.generation());
        Ok(())
    }

    /// Publish on the current binding. Returns the confirm sequence number.
    ///
    /// The lock is held across the publish so sequence numbers follow the
    /// order in which the broker sees the messages.
    pub(crate) async fn publish(
        &self,
        payload: &[u8],
        priority: u8,
        responder: Option<oneshot::Sender<PublishOutcome>>,
    ) -> Result<u64> {
        let guard = self.binding.lock().await;
        let binding = match guard.as_ref() {
            Some(binding) if binding.channel.is_open() => binding,
            _ => return Err(Error::NotConnected(self.name.clone())),
        };

        let sequence = binding.tracker.lock().await.register(payload.len(), responder);
        if let Err(err) = binding.channel.publish(&self.name, payload, priority).await {
            binding.tracker.lock().await.forget(sequence);
            return Err(err);
        }
        trace!(
            "published {} bytes to queue '{}' as #{}",
            payload.len(),
            self.name,
            sequence
        );
        Ok(sequence)
    }

    /// Drop the binding, pending publishes resolve as lost.
    pub(crate) async fn release(&self) {
        let old = self.binding.lock().await.take();
        if let Some(old) = old {
            old.release(&self.name).await;
        }
    }
}

impl WriteBinding {
    async fn release(self, queue: &str) {
        // let the tracker drain confirms already received before giving up on the rest
        let _ = self.stop_tracker.send(());
        if let Err(err) = self.tracker_task.await {
            error!("confirm tracker of queue '{}' failed: {}", queue, err);
        }
        self.tracker.lock().await.fail_all();

        if self.channel.is_open() {
            if let Err(err) = self.channel.close().await {
                debug!("close channel of queue '{}': {}", queue, err);
            }
        }
        debug!("publisher of queue '{}' released link {}", queue, self.generation);
    }
}

async fn track_confirms(
    tracker: Arc<Mutex<ConfirmTracker>>,
    mut confirms: mpsc::UnboundedReceiver<Confirmation>,
    mut stop: oneshot::Receiver<()>,
) {
    loop {
        tokio::select! {
            biased;

            confirmation = confirms.recv() => match confirmation {
                Some(confirmation) => tracker.lock().await.resolve(confirmation),
                None => break,
            },
            _ = &mut stop => {
                while let Ok(confirmation) = confirms.try_recv() {
                    tracker.lock().await.resolve(confirmation);
                }
                break;
            }
        }
    }
}

/////////////////////////////////////////////////////////////////////////////
/// Publishes waiting for a broker confirm, keyed by confirm sequence number.
///
/// Sequence numbers start at 1 on every channel, as the broker counts them.
struct ConfirmTracker {
    queue: String,
    next_sequence: u64,
    pending: BTreeMap<u64, PendingPublish>,
}

struct PendingPublish {
    size: usize,
    responder: Option<oneshot::Sender<PublishOutcome>>,
}

impl ConfirmTracker {
    fn new(queue: &str) -> Self {
        Self {
            queue: queue.to_owned(),
            next_sequence: 1,
            pending: BTreeMap::new(),
        }
    }

    fn register(&mut self, size: usize, responder: Option<oneshot::Sender<PublishOutcome>>) -> u64 {
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        self.pending.insert(sequence, PendingPublish { size, responder });
        sequence
    }

    /// Undo `register` for a publish that never reached the link.
    fn forget(&mut self, sequence: u64) {
        self.pending.remove(&sequence);
        if sequence + 1 == self.next_sequence {
            self.next_sequence = sequence;
        }
    }

    fn resolve(&mut self, confirmation: Confirmation) {
        let (delivery_tag, multiple, outcome) = match confirmation {
            Confirmation::Ack {
                delivery_tag,
                multiple,
            } => (delivery_tag, multiple, PublishOutcome::Ack),
            Confirmation::Nack {
                delivery_tag,
                multiple,
            } => (delivery_tag, multiple, PublishOutcome::Nack),
        };

        let settled: Vec<(u64, PendingPublish)> = if multiple {
            let rest = self.pending.split_off(&delivery_tag.saturating_add(1));
            std::mem::replace(&mut self.pending, rest)
                .into_iter()
                .collect()
        } else {
            self.pending
                .remove(&delivery_tag)
                .map(|publish| vec![(delivery_tag, publish)])
                .unwrap_or_default()
        };
        if settled.is_empty() {
            debug!(
                "{} for unknown publish #{} on queue '{}'",
                outcome, delivery_tag, self.queue
            );
        }
        for (sequence, publish) in settled {
            self.settle(sequence, publish, outcome);
        }
    }

    fn fail_all(&mut self) {
        for (sequence, publish) in std::mem::take(&mut self.pending) {
            self.settle(sequence, publish, PublishOutcome::Lost);
        }
    }

    fn settle(&self, sequence: u64, publish: PendingPublish, outcome: PublishOutcome) {
        match outcome {
            PublishOutcome::Ack => debug!(
                "publish #{} ({} bytes) to queue '{}' acked",
                sequence, publish.size, self.queue
            ),
            PublishOutcome::Nack => warn!(
                "publish #{} ({} bytes) to queue '{}' nacked",
                sequence, publish.size, self.queue
            ),
            PublishOutcome::Lost => error!(
                "publish #{} ({} bytes) to queue '{}' lost",
                sequence, publish.size, self.queue
            ),
        }
        if let Some(responder) = publish.responder {
            // receiver may have been dropped, the outcome is logged either way
            let _ = responder.send(outcome);
        }
    }
}
