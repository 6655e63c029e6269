use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Shutdown state machine
///
/// States:
/// 1. Running - normal operation
/// 2. Draining - background tasks told to stop, waiting for them
/// 3. Terminated - everything stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownState {
    Running,
    Draining,
    Terminated,
}

/// Manages graceful shutdown of background tasks
pub struct ShutdownManager {
    /// Current state
    state: watch::Sender<ShutdownState>,

    /// Stop signal handed to background tasks
    stop: watch::Sender<bool>,

    /// Drain period duration
    drain_period: Duration,

    /// Tracked background tasks
    tasks: Mutex<Vec<(&'static str, JoinHandle<()>)>>,
}

impl ShutdownManager {
    pub fn new(drain_period: Duration) -> Self {
        let (state, _) = watch::channel(ShutdownState::Running);
        let (stop, _) = watch::channel(false);

        Self {
            state,
            stop,
            drain_period,
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Get current state
    pub fn state(&self) -> ShutdownState {
        *self.state.borrow()
    }

    /// Subscribe to state changes
    pub fn subscribe(&self) -> watch::Receiver<ShutdownState> {
        self.state.subscribe()
    }

    /// Stop signal: flips to true when draining starts
    pub fn stop_signal(&self) -> watch::Receiver<bool> {
        self.stop.subscribe()
    }

    /// Spawn a tracked background task that receives the stop signal
    pub fn spawn<F, Fut>(&self, name: &'static str, task: F)
    where
        F: FnOnce(watch::Receiver<bool>) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(task(self.stop_signal()));
        self.tasks.lock().unwrap().push((name, handle));
        debug!(task = name, "background task started");
    }

    /// Number of tracked tasks
    pub fn task_count(&self) -> usize {
        self.tasks.lock().unwrap().len()
    }

    /// Start draining (called on SIGTERM/SIGINT)
    pub fn start_drain(&self) {
        if self.state() != ShutdownState::Running {
            return;
        }

        info!(
            drain_period_secs = self.drain_period.as_secs(),
            tasks = self.task_count(),
            "starting graceful shutdown drain"
        );

        let _ = self.state.send(ShutdownState::Draining);
        let _ = self.stop.send(true);
    }

    /// Wait for tracked tasks, aborting any still running after the drain period
    pub async fn drain(&self) {
        let tasks: Vec<_> = self.tasks.lock().unwrap().drain(..).collect();

        for (name, mut handle) in tasks {
            match tokio::time::timeout(self.drain_period, &mut handle).await {
                Ok(Ok(())) => debug!(task = name, "background task stopped"),
                Ok(Err(e)) => warn!(task = name, error = %e, "background task failed"),
                Err(_) => {
                    warn!(task = name, "drain timeout reached, aborting task");
                    handle.abort();
                }
            }
        }
    }

    /// Complete shutdown
    pub fn terminate(&self) {
        if self.state() == ShutdownState::Terminated {
            return;
        }

        let _ = self.stop.send(true);
        info!("shutdown complete");
        let _ = self.state.send(ShutdownState::Terminated);
    }

    /// Check if still running
    pub fn is_running(&self) -> bool {
        self.state() == ShutdownState::Running
    }
}
