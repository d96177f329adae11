//! Registry of cancellable background tasks
//!
//! Every worker runs under its own child [`CancellationToken`] and is tracked
//! by identity. A task removes its own entry when it finishes, so the registry
//! only ever holds live work.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// How long cancelled tasks get to finish their in-flight message
pub const CANCEL_GRACE: Duration = Duration::from_secs(2);

struct TrackedTask {
    generation: u64,
    token: CancellationToken,
    handle: JoinHandle<()>,
}

type TaskMap = Arc<Mutex<HashMap<String, TrackedTask>>>;

/// How a shutdown ended, per task count
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Finished on their own within the drain period
    pub drained: usize,
    /// Finished after cancellation
    pub cancelled: usize,
    /// Still running after the cancel grace and aborted
    pub aborted: usize,
}

pub struct TaskRegistry {
    name: String,
    root: CancellationToken,
    tasks: TaskMap,
    running: watch::Sender<usize>,
    next_generation: AtomicU64,
}

impl TaskRegistry {
    pub fn new(name: impl Into<String>) -> Self {
        let (running, _) = watch::channel(0);
        Self {
            name: name.into(),
            root: CancellationToken::new(),
            tasks: Arc::default(),
            running,
            next_generation: AtomicU64::new(0),
        }
    }

    fn lock(tasks: &TaskMap) -> std::sync::MutexGuard<'_, HashMap<String, TrackedTask>> {
        tasks.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Spawn `task` under a child token; an existing task with the same id is
    /// cancelled and replaced
    pub fn spawn<F, Fut>(&self, id: impl Into<String>, task: F)
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let id = id.into();
        let token = self.root.child_token();
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let future = task(token.clone());

        // Held across spawn so the task cannot deregister before it is inserted
        let mut tasks = Self::lock(&self.tasks);

        let cleanup_tasks = self.tasks.clone();
        let cleanup_running = self.running.clone();
        let cleanup_id = id.clone();
        let handle = tokio::spawn(async move {
            future.await;
            let mut tasks = Self::lock(&cleanup_tasks);
            if tasks
                .get(&cleanup_id)
                .is_some_and(|tracked| tracked.generation == generation)
            {
                tasks.remove(&cleanup_id);
                cleanup_running.send_replace(tasks.len());
            }
            debug!(task = %cleanup_id, "Task finished");
        });

        if let Some(previous) = tasks.insert(
            id.clone(),
            TrackedTask {
                generation,
                token,
                handle,
            },
        ) {
            warn!(registry = %self.name, task = %id, "Replacing running task");
            previous.token.cancel();
        }
        self.running.send_replace(tasks.len());
    }

    pub fn is_running(&self, id: &str) -> bool {
        Self::lock(&self.tasks).contains_key(id)
    }

    pub fn len(&self) -> usize {
        Self::lock(&self.tasks).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = Self::lock(&self.tasks).keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Wait until no task is running, up to `timeout`
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        let mut running = self.running.subscribe();
        let idle = tokio::time::timeout(timeout, running.wait_for(|count| *count == 0))
            .await
            .is_ok();
        idle
    }

    /// Cancel one task and wait up to `grace` before aborting it
    ///
    /// Returns `false` if the task was unknown or had to be aborted.
    pub async fn cancel(&self, id: &str, grace: Duration) -> bool {
        let tracked = {
            let mut tasks = Self::lock(&self.tasks);
            let tracked = tasks.remove(id);
            self.running.send_replace(tasks.len());
            tracked
        };
        let Some(TrackedTask {
            token, mut handle, ..
        }) = tracked
        else {
            return false;
        };

        token.cancel();
        match tokio::time::timeout(grace, &mut handle).await {
            Ok(_) => true,
            Err(_) => {
                warn!(registry = %self.name, task = %id, "Task did not stop in time, aborting");
                handle.abort();
                false
            }
        }
    }

    /// Let tasks finish on their own for `drain`, then cancel the rest and
    /// abort whatever is still running after [`CANCEL_GRACE`]
    pub async fn shutdown(&self, drain: Duration) -> ShutdownReport {
        let started = self.len();
        if self.wait_idle(drain).await {
            info!(registry = %self.name, tasks = started, "All tasks drained");
            return ShutdownReport {
                drained: started,
                ..Default::default()
            };
        }

        let pending = self.len();
        info!(registry = %self.name, pending, "Drain period elapsed, cancelling tasks");
        self.root.cancel();
        self.wait_idle(CANCEL_GRACE).await;

        let stragglers: Vec<(String, TrackedTask)> = {
            let mut tasks = Self::lock(&self.tasks);
            let drained = tasks.drain().collect();
            self.running.send_replace(0);
            drained
        };
        for (id, tracked) in &stragglers {
            warn!(registry = %self.name, task = %id, "Aborting task after cancel grace");
            tracked.handle.abort();
        }

        ShutdownReport {
            drained: started - pending,
            cancelled: pending - stragglers.len(),
            aborted: stragglers.len(),
        }
    }

    /// Cancel every task without a drain period
    pub async fn cancel_all(&self) -> ShutdownReport {
        self.shutdown(Duration::ZERO).await
    }
}

impl Drop for TaskRegistry {
    fn drop(&mut self) {
        self.root.cancel();
    }
}
