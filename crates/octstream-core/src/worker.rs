//! One paced tokio task per client session.
//!
//! The worker owns its session and distributor outright. The only thing it
//! shares with other workers is the tree behind the distributor.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::distributor::Distributor;
use crate::session::ClientStreamSession;
use crate::transport::ClientId;
use crate::tree::read_tree;

/// Lifecycle of a [`StreamWorker`], published on its [`WorkerHandle`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Starting,
    /// Waiting for the tree's initial load.
    Idle,
    Running,
    ShuttingDown,
    Stopped,
}

/// Time to sleep after a cycle that took `elapsed`.
pub fn pacing_delay(elapsed: Duration, interval: Duration, min_sleep: Duration) -> Duration {
    interval.saturating_sub(elapsed).max(min_sleep)
}

type ExitCallback = Box<dyn FnOnce(ClientId) + Send>;

/// Runs [`Distributor::distribute`] for one session at the configured rate.
pub struct StreamWorker {
    session: ClientStreamSession,
    distributor: Distributor,
    on_exit: Option<ExitCallback>,
}

impl StreamWorker {
    pub fn new(session: ClientStreamSession, distributor: Distributor) -> Self {
        Self {
            session,
            distributor,
            on_exit: None,
        }
    }

    /// Called once with the client id when the loop stops.
    pub fn on_exit(mut self, callback: impl FnOnce(ClientId) + Send + 'static) -> Self {
        self.on_exit = Some(Box::new(callback));
        self
    }

    /// Start the loop on the current tokio runtime.
    pub fn spawn(self) -> WorkerHandle {
        let client_id = self.session.client_id();
        let shutdown = self.session.shutdown_flag();
        let (state_tx, state_rx) = watch::channel(WorkerState::Starting);
        let task = tokio::spawn(self.run(state_tx));
        WorkerHandle {
            client_id,
            shutdown,
            state: state_rx,
            task,
        }
    }

    async fn run(mut self, state: watch::Sender<WorkerState>) {
        let client_id = self.session.client_id();
        let interval = self.distributor.config().send_interval();
        let min_sleep = self.distributor.config().min_sleep;
        info!("stream worker for client {} started", client_id);

        while !self.session.is_shutting_down() {
            let cycle_start = Instant::now();

            let loaded = read_tree(self.distributor.tree()).is_initial_load_complete();
            if loaded {
                state.send_if_modified(|s| replace_state(s, WorkerState::Running));
                let view_changed = self.session.update_current_view_frustum();
                self.distributor.distribute(&mut self.session, view_changed);
            } else {
                state.send_if_modified(|s| replace_state(s, WorkerState::Idle));
            }

            tokio::time::sleep(pacing_delay(cycle_start.elapsed(), interval, min_sleep)).await;
        }

        state.send_replace(WorkerState::ShuttingDown);
        let sender = self.distributor.sender();
        info!(
            "stream worker for client {} stopped after {} packets ({} bytes)",
            client_id,
            sender.total_packets(),
            sender.total_bytes()
        );
        if let Some(callback) = self.on_exit.take() {
            callback(client_id);
        }
        state.send_replace(WorkerState::Stopped);
    }
}

fn replace_state(current: &mut WorkerState, next: WorkerState) -> bool {
    if *current == next {
        return false;
    }
    *current = next;
    true
}

// ---------------------------------------------------------------------------
// WorkerHandle
// ---------------------------------------------------------------------------

/// Control side of a spawned [`StreamWorker`].
pub struct WorkerHandle {
    client_id: ClientId,
    shutdown: Arc<AtomicBool>,
    state: watch::Receiver<WorkerState>,
    task: JoinHandle<()>,
}

impl WorkerHandle {
    pub fn client_id(&self) -> ClientId {
        self.client_id
    }

    /// Ask the worker to stop at its next cycle.
    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
    }

    pub fn state(&self) -> WorkerState {
        *self.state.borrow()
    }

    /// A receiver that observes every state change.
    pub fn subscribe(&self) -> watch::Receiver<WorkerState> {
        self.state.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for the loop to exit.
    pub async fn join(self) {
        if let Err(e) = self.task.await {
            warn!("stream worker for client {} ended abnormally: {}", self.client_id, e);
        }
    }
}
