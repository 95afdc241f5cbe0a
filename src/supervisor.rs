//! Supervisor for detached background work (§5 "fire-and-forget async" redesign note).
//!
//! Tasks spawned here (signal generation, at minimum) are not lost into the void: the
//! `JoinSet` keeps every handle reachable so `shutdown()` can drain them at process exit,
//! and a panicking/erroring task increments `failures` instead of disappearing silently.

use std::future::Future;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::task::JoinSet;

#[derive(Default)]
pub struct TaskSupervisor {
    tasks: Mutex<JoinSet<()>>,
    failures: AtomicU64,
}

impl TaskSupervisor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawns `fut`, reaping already-finished handles opportunistically so the `JoinSet`
    /// doesn't grow unbounded over the life of a long-running process.
    pub fn spawn<F>(&self, fut: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut tasks = self.tasks.lock().expect("supervisor mutex poisoned");
        while tasks.try_join_next().is_some() {}
        tasks.spawn(fut);
    }

    pub fn record_failure(&self) {
        self.failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn failure_count(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    /// Awaits every outstanding task. Called at graceful shutdown so a `tokio::spawn`'d
    /// signal-generation pass in flight still finishes before the process exits.
    ///
    /// Swaps the `JoinSet` out of the mutex first rather than holding the guard across
    /// `join_next().await` — `std::sync::MutexGuard` isn't `Send` and shouldn't be held
    /// across a suspension point regardless.
    pub async fn shutdown(&self) {
        let mut tasks = {
            let mut guard = self.tasks.lock().expect("supervisor mutex poisoned");
            std::mem::take(&mut *guard)
        };
        while let Some(result) = tasks.join_next().await {
            if let Err(e) = result {
                tracing::warn!(error = %e, "supervised task panicked");
                self.failures.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::AtomicBool;

    #[tokio::test]
    async fn shutdown_awaits_spawned_task() {
        let supervisor = Arc::new(TaskSupervisor::new());
        let ran = Arc::new(AtomicBool::new(false));
        let ran2 = ran.clone();
        supervisor.spawn(async move {
            ran2.store(true, Ordering::SeqCst);
        });
        supervisor.shutdown().await;
        assert!(ran.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn panicking_task_increments_failure_count() {
        let supervisor = Arc::new(TaskSupervisor::new());
        supervisor.spawn(async move {
            panic!("boom");
        });
        supervisor.shutdown().await;
        assert_eq!(supervisor.failure_count(), 1);
    }
}
