mod read_channel;
mod registry;
mod supervisor;
mod write_channel;

use std::{
    fmt,
    sync::{Arc, PoisonError, RwLock},
    time::Duration,
};

use tokio::time;
use tracing::info;

pub(crate) use read_channel::ReadChannel;
pub(crate) use registry::ChannelRegistry;
pub(crate) use supervisor::Supervisor;
pub(crate) use write_channel::WriteChannel;

use crate::{
    error::Error,
    transport::{Link, LinkChannel, QueueInfo},
    Result,
};

/// Declare `queue` durable, giving up after `timeout`.
async fn declare_durable(
    channel: &dyn LinkChannel,
    queue: &str,
    timeout: Duration,
) -> Result<QueueInfo> {
    let info = time::timeout(timeout, channel.declare_queue(queue))
        .await
        .map_err(|_| Error::DeclareTimeout(queue.to_owned()))??;
    info!(
        "declared queue '{}', messages: {}, consumers: {}",
        queue, info.message_count, info.consumer_count
    );
    Ok(info)
}

/// Lifecycle state of the broker connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Stopped,
    Connecting,
    Ready,
    Detached,
    Reconnecting,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            ConnectionState::Stopped => "stopped",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Ready => "ready",
            ConnectionState::Detached => "detached",
            ConnectionState::Reconnecting => "reconnecting",
        };
        f.write_str(name)
    }
}

/// Slot holding the link of the current generation.
///
/// Written only by the supervisor, read by the registry when it binds a new channel.
#[derive(Default)]
pub(crate) struct CurrentLink {
    link: RwLock<Option<Arc<dyn Link>>>,
}

impl CurrentLink {
    pub(crate) fn get(&self) -> Option<Arc<dyn Link>> {
        self.link
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub(crate) fn replace(&self, link: Arc<dyn Link>) -> Option<Arc<dyn Link>> {
        self.link
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(link)
    }

    pub(crate) fn take(&self) -> Option<Arc<dyn Link>> {
        self.link
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }
}
