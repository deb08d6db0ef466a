//! Tracked task spawning with cooperative cancellation.
//!
//! Tasks spawned through a [`TaskManager`] are counted while they run and
//! share a root [`CancellationToken`]. Cancellation is cooperative: a task is
//! handed a child token and is expected to finish its own cleanup once the
//! token fires. Only tasks still running after the shutdown timeout are
//! aborted.

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::task::{AbortHandle, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::errors::types::{Error, Result};

#[derive(Debug)]
struct TrackedTask {
    id: usize,
    name: String,
    abort: AbortHandle,
    started_at: Instant,
}

/// Decrements the active counter when the task future is dropped,
/// whether it completed or was aborted.
struct ActiveGuard(Arc<AtomicUsize>);

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Task manager for one layer of the stack
#[derive(Debug)]
pub struct TaskManager {
    name: String,
    cancel_token: CancellationToken,
    next_task_id: AtomicUsize,
    active_count: Arc<AtomicUsize>,
    tasks: Mutex<Vec<TrackedTask>>,
    max_tasks: usize,
    shutdown_timeout: Duration,
}

impl TaskManager {
    /// Create a new task manager
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_config(name, 1000, Duration::from_secs(5))
    }

    /// Create with custom configuration
    pub fn with_config(name: impl Into<String>, max_tasks: usize, shutdown_timeout: Duration) -> Self {
        Self {
            name: name.into(),
            cancel_token: CancellationToken::new(),
            next_task_id: AtomicUsize::new(0),
            active_count: Arc::new(AtomicUsize::new(0)),
            tasks: Mutex::new(Vec::new()),
            max_tasks,
            shutdown_timeout,
        }
    }

    /// A token cancelled when this manager shuts down
    pub fn child_token(&self) -> CancellationToken {
        self.cancel_token.child_token()
    }

    /// Whether shutdown has been requested
    pub fn is_shutting_down(&self) -> bool {
        self.cancel_token.is_cancelled()
    }

    /// Spawn a tracked task
    pub fn spawn_tracked<F>(&self, name: impl Into<String>, future: F) -> Result<JoinHandle<()>>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.cancel_token.is_cancelled() {
            return Err(Error::Task(format!("{} is shutting down", self.name)));
        }

        let active = self.active_count.load(Ordering::SeqCst);
        if active >= self.max_tasks {
            return Err(Error::Task(format!(
                "Task limit reached for {}: {} active tasks",
                self.name, active
            )));
        }

        let task_name = name.into();
        let task_id = self.next_task_id.fetch_add(1, Ordering::SeqCst);
        self.active_count.fetch_add(1, Ordering::SeqCst);

        let guard = ActiveGuard(self.active_count.clone());
        let layer = self.name.clone();
        let name_for_task = task_name.clone();
        let handle = tokio::spawn(async move {
            let _guard = guard;
            debug!("Task started: {} [{}] in {}", name_for_task, task_id, layer);
            future.await;
            debug!("Task finished: {} [{}] in {}", name_for_task, task_id, layer);
        });

        let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        tasks.retain(|t| !t.abort.is_finished());
        tasks.push(TrackedTask {
            id: task_id,
            name: task_name,
            abort: handle.abort_handle(),
            started_at: Instant::now(),
        });

        Ok(handle)
    }

    /// Number of tasks still running
    pub fn active_task_count(&self) -> usize {
        self.active_count.load(Ordering::SeqCst)
    }

    /// Cancel every task and wait for them to wind down.
    ///
    /// Tasks that outlive the shutdown timeout are aborted. Returns how many
    /// were aborted; their cleanup did not run to completion.
    pub async fn shutdown_all(&self) -> usize {
        let start = Instant::now();
        debug!(
            "Starting shutdown for {} with {} active tasks",
            self.name,
            self.active_task_count()
        );

        self.cancel_token.cancel();

        let graceful = tokio::time::timeout(self.shutdown_timeout, self.wait_for_completion()).await;
        let aborted = if graceful.is_err() {
            warn!(
                "{} shutdown timed out after {:?}, forcing abort",
                self.name, self.shutdown_timeout
            );
            let aborted = self.abort_all();
            let _ = tokio::time::timeout(self.shutdown_timeout, self.wait_for_completion()).await;
            aborted
        } else {
            debug!("{} shutdown completed in {:?}", self.name, start.elapsed());
            0
        };

        self.tasks.lock().unwrap_or_else(|e| e.into_inner()).clear();
        aborted
    }

    async fn wait_for_completion(&self) {
        while self.active_count.load(Ordering::SeqCst) > 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    fn abort_all(&self) -> usize {
        let tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        let mut aborted = 0;
        for task in tasks.iter().filter(|t| !t.abort.is_finished()) {
            warn!(
                "Force aborting task: {} [{}] after {:?}",
                task.name,
                task.id,
                task.started_at.elapsed()
            );
            task.abort.abort();
            aborted += 1;
        }
        aborted
    }

    /// Task statistics
    pub fn stats(&self) -> TaskStats {
        let tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        TaskStats {
            name: self.name.clone(),
            spawned: self.next_task_id.load(Ordering::SeqCst),
            active: self.active_count.load(Ordering::SeqCst),
            tracked: tasks.len(),
        }
    }
}

/// Task statistics
#[derive(Debug, Clone)]
pub struct TaskStats {
    pub name: String,
    pub spawned: usize,
    pub active: usize,
    pub tracked: usize,
}
