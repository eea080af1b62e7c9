use std::{
    ops::ControlFlow,
    sync::{
        atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering},
        Arc,
    },
};

use tokio::{
    sync::{mpsc, oneshot, watch, Mutex},
    task::JoinHandle,
    time,
};
use tracing::{debug, error, info, trace, warn};

use super::{ChannelRegistry, ConnectionState, CurrentLink};
use crate::{
    backoff::BackoffPolicy,
    transport::{Generation, Link, LinkEvent, Transport},
    Result,
};

/// Owns the broker link and the task that keeps it alive.
pub(crate) struct Supervisor {
    shared: Arc<SupervisorShared>,
    lifecycle: Mutex<Lifecycle>,
}

/// State seen by both the public handles and the connection handler task.
struct SupervisorShared {
    transport: Arc<dyn Transport>,
    backoff: Arc<dyn BackoffPolicy>,
    registry: Arc<ChannelRegistry>,
    link: Arc<CurrentLink>,
    state_tx: watch::Sender<ConnectionState>,

    /// set while a restart sequence runs
    restarting: AtomicBool,
    /// reconnect attempts since construction, failed ones included
    attempts: AtomicU32,
    /// generation of the current link
    generation: AtomicU64,
    /// last generation handed to the transport
    allocated: AtomicU64,
}

#[derive(Default)]
struct Lifecycle {
    handler: Option<RunningHandler>,
}

struct RunningHandler {
    shutdown_tx: oneshot::Sender<()>,
    join: JoinHandle<()>,
}

impl Supervisor {
    pub(crate) fn new(
        transport: Arc<dyn Transport>,
        backoff: Arc<dyn BackoffPolicy>,
        registry: Arc<ChannelRegistry>,
        link: Arc<CurrentLink>,
    ) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Stopped);
        Self {
            shared: Arc::new(SupervisorShared {
                transport,
                backoff,
                registry,
                link,
                state_tx,
                restarting: AtomicBool::new(false),
                attempts: AtomicU32::new(0),
                generation: AtomicU64::new(0),
                allocated: AtomicU64::new(0),
            }),
            lifecycle: Mutex::new(Lifecycle::default()),
        }
    }

    pub(crate) fn state(&self) -> ConnectionState {
        *self.shared.state_tx.borrow()
    }

    pub(crate) fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state_tx.subscribe()
    }

    pub(crate) fn reconnect_attempts(&self) -> u32 {
        self.shared.attempts.load(Ordering::SeqCst)
    }

    pub(crate) fn generation(&self) -> Generation {
        self.shared.generation.load(Ordering::SeqCst)
    }

    /// Connect and spawn the connection handler.
    ///
    /// Returns once the first link is ready. A no-op while already started.
    pub(crate) async fn start(&self, uri: &str) -> Result<()> {
        let mut lifecycle = self.lifecycle.lock().await;
        if let Some(running) = lifecycle.handler.as_ref() {
            if !running.join.is_finished() {
                debug!("supervisor already started, ignore start");
                return Ok(());
            }
            // handler gone without a stop, start over
            lifecycle.handler.take();
        }

        self.shared.set_state(ConnectionState::Connecting);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let generation = self.shared.next_generation();
        match self
            .shared
            .transport
            .connect(uri, generation, events_tx.clone())
            .await
        {
            Ok(link) => self.shared.install(link),
            Err(err) => {
                self.shared.set_state(ConnectionState::Stopped);
                error!("failed to open link {}: {}", generation, err);
                return Err(err);
            }
        }

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let handler = ConnectionHandler {
            shared: self.shared.clone(),
            uri: uri.to_owned(),
            events_tx,
            restore_task: None,
        };
        let join = tokio::spawn(handler.run_until_shutdown(events_rx, shutdown_rx));
        lifecycle.handler = Some(RunningHandler { shutdown_tx, join });
        Ok(())
    }

    /// Stop the connection handler, release every channel and close the link.
    ///
    /// A no-op while stopped. No handler runs once this returns.
    pub(crate) async fn stop(&self) -> Result<()> {
        let mut lifecycle = self.lifecycle.lock().await;
        let Some(running) = lifecycle.handler.take() else {
            trace!("supervisor not started, ignore stop");
            return Ok(());
        };

        // handler may already be gone, then there is nobody to notify
        let _ = running.shutdown_tx.send(());
        if let Err(err) = running.join.await {
            error!("connection handler failed: {}", err);
        }

        let link = self.shared.link.take();
        self.shared.registry.release_all().await;
        let closed = match link {
            Some(link) if link.is_open() => link.close().await,
            _ => Ok(()),
        };
        self.shared.set_state(ConnectionState::Stopped);
        info!("supervisor stopped at link {}", self.generation());
        closed
    }
}

impl SupervisorShared {
    fn set_state(&self, state: ConnectionState) {
        let previous = self.state_tx.send_replace(state);
        if previous != state {
            debug!("connection state {} -> {}", previous, state);
        }
    }

    fn next_generation(&self) -> Generation {
        self.allocated.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn install(&self, link: Arc<dyn Link>) {
        let generation = link.generation();
        self.generation.store(generation, Ordering::SeqCst);
        if let Some(old) = self.link.replace(link) {
            debug!("link {} replaced by link {}", old.generation(), generation);
        }
        self.set_state(ConnectionState::Ready);
        info!("link {} ready", generation);
    }
}

/////////////////////////////////////////////////////////////////////////////
/// Event loop of a started supervisor.
///
/// Reconnects run inline, so link events queue up meanwhile and the ones of
/// the replaced link are dropped as stale. Restorations run on their own task.
struct ConnectionHandler {
    shared: Arc<SupervisorShared>,
    uri: String,
    /// handed to the transport on every reconnect
    events_tx: mpsc::UnboundedSender<LinkEvent>,
    restore_task: Option<JoinHandle<()>>,
}

impl ConnectionHandler {
    async fn run_until_shutdown(
        mut self,
        mut events_rx: mpsc::UnboundedReceiver<LinkEvent>,
        mut shutdown_rx: oneshot::Receiver<()>,
    ) {
        trace!("connection handler starts");
        loop {
            tokio::select! {
                biased;

                _ = &mut shutdown_rx => {
                    info!("connection handler received shutdown");
                    break;
                }
                event = events_rx.recv() => match event {
                    Some(LinkEvent::Ready(generation)) => self.handle_ready(generation).await,
                    Some(LinkEvent::Detached { generation, reason }) => {
                        if self
                            .handle_detached(generation, &reason, &mut shutdown_rx)
                            .await
                            .is_break()
                        {
                            info!("connection handler received shutdown while reconnecting");
                            break;
                        }
                    }
                    None => break,
                },
            }
        }
        if let Some(restore) = self.restore_task.take() {
            restore.abort();
            // must not bind anything once stop releases the channels
            let _ = restore.await;
        }
        debug!("connection handler exits");
    }

    async fn handle_ready(&mut self, generation: Generation) {
        if generation != self.shared.generation.load(Ordering::SeqCst) {
            debug!("ignore ready of stale link {}", generation);
            return;
        }
        let link = match self.shared.link.get() {
            Some(link) if link.generation() == generation => link,
            _ => {
                debug!("link {} no longer installed, skip restore", generation);
                return;
            }
        };
        // first connect with no channel yet, nothing to restore
        if self.shared.attempts.load(Ordering::SeqCst) == 0
            && self.shared.registry.is_empty().await
        {
            return;
        }

        if let Some(restore) = self.restore_task.take() {
            restore.abort();
            let _ = restore.await;
        }
        let registry = self.shared.registry.clone();
        self.restore_task = Some(tokio::spawn(async move {
            let report = registry.restore_all(link).await;
            if report.readers_failed + report.writers_failed > 0 {
                warn!("incomplete restore on link {}: {}", generation, report);
            }
        }));
    }

    async fn handle_detached(
        &mut self,
        generation: Generation,
        reason: &str,
        shutdown_rx: &mut oneshot::Receiver<()>,
    ) -> ControlFlow<()> {
        if generation != self.shared.generation.load(Ordering::SeqCst) {
            debug!("ignore detachment of stale link {}: {}", generation, reason);
            return ControlFlow::Continue(());
        }
        // events are handled one at a time on this task, which alone keeps
        // restarts from overlapping; the flag only reports a restart in flight
        if self.shared.restarting.swap(true, Ordering::SeqCst) {
            debug!("restart in flight, ignore detachment of link {}", generation);
            return ControlFlow::Continue(());
        }

        warn!("link {} detached: {}", generation, reason);
        let flow = self.restart(shutdown_rx).await;
        self.shared.restarting.store(false, Ordering::SeqCst);
        flow
    }

    /// Drop the detached link and reconnect until it works or shutdown arrives.
    async fn restart(&mut self, shutdown_rx: &mut oneshot::Receiver<()>) -> ControlFlow<()> {
        self.shared.set_state(ConnectionState::Detached);
        if let Some(restore) = self.restore_task.take() {
            restore.abort();
            let _ = restore.await;
        }
        // unpublish the link first so no channel binds to it again
        let old = self.shared.link.take();
        self.shared.registry.release_all().await;
        if let Some(old) = old {
            if old.is_open() {
                if let Err(err) = old.close().await {
                    debug!("close detached link {}: {}", old.generation(), err);
                }
            }
        }

        loop {
            let attempt = self.shared.attempts.fetch_add(1, Ordering::SeqCst) + 1;
            let delay = self.shared.backoff.delay(attempt);
            self.shared.set_state(ConnectionState::Reconnecting);
            info!("reconnect attempt {} in {:?}", attempt, delay);
            tokio::select! {
                biased;

                _ = &mut *shutdown_rx => return ControlFlow::Break(()),
                _ = time::sleep(delay) => {}
            }

            self.shared.set_state(ConnectionState::Connecting);
            let generation = self.shared.next_generation();
            let connected = tokio::select! {
                biased;

                _ = &mut *shutdown_rx => return ControlFlow::Break(()),
                connected = self.shared.transport.connect(
                    &self.uri,
                    generation,
                    self.events_tx.clone(),
                ) => connected,
            };
            match connected {
                Ok(link) => {
                    self.shared.install(link);
                    return ControlFlow::Continue(());
                }
                Err(err) => error!(
                    "reconnect attempt {} for link {} failed: {}",
                    attempt, generation, err
                ),
            }
        }
    }
}
