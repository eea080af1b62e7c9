use std::{collections::HashMap, fmt, sync::Arc, time::Duration};

use tokio::sync::RwLock;
use tracing::{debug, error, info};

use super::{CurrentLink, ReadChannel, WriteChannel};
use crate::{consumer::MessageHandler, transport::Link};

/// Counts of one restoration pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) struct RestoreReport {
    pub(crate) readers_restored: usize,
    pub(crate) readers_failed: usize,
    pub(crate) writers_restored: usize,
    pub(crate) writers_failed: usize,
}

impl fmt::Display for RestoreReport {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "readers {} ok / {} failed, writers {} ok / {} failed",
            self.readers_restored, self.readers_failed, self.writers_restored, self.writers_failed
        )
    }
}

/// All channels of a client, by queue name and direction.
///
/// Channels are created on first use and kept for the lifetime of the client.
pub(crate) struct ChannelRegistry {
    link: Arc<CurrentLink>,
    declare_timeout: Duration,
    readers: RwLock<HashMap<String, Arc<ReadChannel>>>,
    writers: RwLock<HashMap<String, Arc<WriteChannel>>>,
}

impl ChannelRegistry {
    pub(crate) fn new(link: Arc<CurrentLink>, declare_timeout: Duration) -> Self {
        Self {
            link,
            declare_timeout,
            readers: RwLock::new(HashMap::new()),
            writers: RwLock::new(HashMap::new()),
        }
    }

    /// Return the consumer of `name`, creating it on first use.
    ///
    /// An existing consumer keeps its prefetch and switches to `handler`.
    /// A consumer without a live binding is bound to the current link, if any.
    pub(crate) async fn get_or_create_read(
        &self,
        name: &str,
        handler: Arc<dyn MessageHandler>,
        prefetch: u16,
    ) -> Arc<ReadChannel> {
        let existing = self.readers.read().await.get(name).cloned();
        let channel = match existing {
            Some(channel) => {
                channel.set_handler(handler);
                channel
            }
            None => {
                let mut readers = self.readers.write().await;
                // another caller may have won the race for the write lock
                match readers.get(name) {
                    Some(channel) => {
                        channel.set_handler(handler);
                        channel.clone()
                    }
                    None => {
                        let channel = Arc::new(ReadChannel::new(
                            name,
                            handler,
                            prefetch,
                            self.declare_timeout,
                        ));
                        readers.insert(name.to_owned(), channel.clone());
                        channel
                    }
                }
            }
        };

        // bind outside the registry lock
        if channel.bound_generation().await.is_none() {
            match self.link.get() {
                Some(link) => {
                    if let Err(err) = channel.start(&link).await {
                        error!("failed to start consumer of queue '{}': {}", name, err);
                    }
                }
                None => debug!("consumer of queue '{}' waits for a connection", name),
            }
        }
        channel
    }

    /// Return the publisher of `name`, creating it on first use.
    ///
    /// A publisher without a live binding is bound to the current link, if any.
    pub(crate) async fn get_or_create_write(&self, name: &str) -> Arc<WriteChannel> {
        let existing = self.writers.read().await.get(name).cloned();
        let channel = match existing {
            Some(channel) => channel,
            None => self
                .writers
                .write()
                .await
                .entry(name.to_owned())
                .or_insert_with(|| Arc::new(WriteChannel::new(name, self.declare_timeout)))
                .clone(),
        };

        if channel.bound_generation().await.is_none() {
            match self.link.get() {
                Some(link) => {
                    if let Err(err) = channel.start(&link).await {
                        error!("failed to start publisher of queue '{}': {}", name, err);
                    }
                }
                None => debug!("publisher of queue '{}' waits for a connection", name),
            }
        }
        channel
    }

    pub(crate) async fn is_empty(&self) -> bool {
        self.readers.read().await.is_empty() && self.writers.read().await.is_empty()
    }

    pub(crate) async fn read_names(&self) -> Vec<String> {
        self.readers.read().await.keys().cloned().collect()
    }

    pub(crate) async fn write_names(&self) -> Vec<String> {
        self.writers.read().await.keys().cloned().collect()
    }

    /// Bind every channel to `link`: all consumers first, then all publishers.
    ///
    /// Works on a snapshot so no registry lock is held during declarations.
    pub(crate) async fn restore_all(&self, link: Arc<dyn Link>) -> RestoreReport {
        let readers = self.snapshot_readers().await;
        let writers = self.snapshot_writers().await;
        let mut report = RestoreReport::default();

        for reader in readers {
            match reader.start(&link).await {
                Ok(()) => report.readers_restored += 1,
                Err(err) => {
                    report.readers_failed += 1;
                    error!("failed to restore consumer of queue '{}': {}", reader.name(), err);
                }
            }
        }
        for writer in writers {
            match writer.start(&link).await {
                Ok(()) => report.writers_restored += 1,
                Err(err) => {
                    report.writers_failed += 1;
                    error!("failed to restore publisher of queue '{}': {}", writer.name(), err);
                }
            }
        }
        info!("restored channels on link {}: {}", link.generation(), report);
        report
    }

    /// Drop every binding. Channels stay registered.
    pub(crate) async fn release_all(&self) {
        for reader in self.snapshot_readers().await {
            reader.release().await;
        }
        for writer in self.snapshot_writers().await {
            writer.release().await;
        }
    }

    async fn snapshot_readers(&self) -> Vec<Arc<ReadChannel>> {
        self.readers.read().await.values().cloned().collect()
    }

    async fn snapshot_writers(&self) -> Vec<Arc<WriteChannel>> {
        self.writers.read().await.values().cloned().collect()
    }
}
