// =============================================================================
// Scheduler — fixed-delay task registry
// =============================================================================
//
// Each engine registers its scan and monitor loops here at startup. Tasks run
// with fixed-delay semantics: the next run begins `interval` after the
// previous one returned, so a single task instance never overlaps itself.
// Shutdown stops new runs and lets in-flight ones finish within a deadline.
// =============================================================================

use std::future::Future;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub struct Scheduler {
    shutdown_rx: watch::Receiver<bool>,
    handles: Mutex<Vec<(String, JoinHandle<()>)>>,
}

impl Scheduler {
    /// `shutdown_rx` is the coordinator's shutdown signal.
    pub fn new(shutdown_rx: watch::Receiver<bool>) -> Self {
        Self {
            shutdown_rx,
            handles: Mutex::new(Vec::new()),
        }
    }

    /// Register a periodic task. `task` is invoked repeatedly; the delay
    /// starts counting when an invocation returns.
    pub fn register<F, Fut>(&self, task_id: impl Into<String>, interval: Duration, task: F)
    where
        F: Fn() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send,
    {
        let task_id = task_id.into();
        let mut shutdown = self.shutdown_rx.clone();
        let id_for_log = task_id.clone();

        let handle = tokio::spawn(async move {
            info!(task = %id_for_log, interval_ms = interval.as_millis() as u64, "scheduled task started");
            loop {
                if *shutdown.borrow() {
                    break;
                }

                task().await;

                // Fixed delay: sleep after the run, abort early on shutdown.
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            debug!(task = %id_for_log, "scheduled task stopped");
        });

        self.handles.lock().push((task_id, handle));
    }

    /// Wait for all task loops to finish, up to `deadline` per task. Tasks
    /// still running after the deadline are aborted.
    pub async fn join_all(&self, deadline: Duration) {
        let handles: Vec<(String, JoinHandle<()>)> = {
            let mut guard = self.handles.lock();
            guard.drain(..).collect()
        };

        for (task_id, handle) in handles {
            match tokio::time::timeout(deadline, handle).await {
                Ok(_) => debug!(task = %task_id, "task joined"),
                Err(_) => {
                    warn!(task = %task_id, "task did not stop within deadline — aborting");
                }
            }
        }
    }

    /// Number of registered tasks (dashboard/diagnostics).
    pub fn task_count(&self) -> usize {
        self.handles.lock().len()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn task_runs_repeatedly_until_shutdown() {
        let (tx, rx) = watch::channel(false);
        let scheduler = Scheduler::new(rx);
        let counter = Arc::new(AtomicU32::new(0));

        let c = counter.clone();
        scheduler.register("tick", Duration::from_millis(10), move || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
            }
        });

        tokio::time::sleep(Duration::from_millis(100)).await;
        tx.send(true).unwrap();
        scheduler.join_all(Duration::from_millis(500)).await;

        let runs = counter.load(Ordering::SeqCst);
        assert!(runs >= 3, "expected several runs, got {runs}");

        // No further runs after shutdown.
        let after = counter.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(counter.load(Ordering::SeqCst), after);
    }

    #[tokio::test]
    async fn fixed_delay_means_no_overlap() {
        let (tx, rx) = watch::channel(false);
        let scheduler = Scheduler::new(rx);
        let active = Arc::new(AtomicU32::new(0));
        let overlapped = Arc::new(AtomicU32::new(0));

        let a = active.clone();
        let o = overlapped.clone();
        scheduler.register("slow", Duration::from_millis(1), move || {
            let a = a.clone();
            let o = o.clone();
            async move {
                if a.fetch_add(1, Ordering::SeqCst) > 0 {
                    o.fetch_add(1, Ordering::SeqCst);
                }
                // The body takes longer than the interval.
                tokio::time::sleep(Duration::from_millis(20)).await;
                a.fetch_sub(1, Ordering::SeqCst);
            }
        });

        tokio::time::sleep(Duration::from_millis(120)).await;
        tx.send(true).unwrap();
        scheduler.join_all(Duration::from_millis(500)).await;

        assert_eq!(overlapped.load(Ordering::SeqCst), 0, "task instances overlapped");
    }

    #[tokio::test]
    async fn shutdown_interrupts_the_sleep() {
        let (tx, rx) = watch::channel(false);
        let scheduler = Scheduler::new(rx);

        scheduler.register("long-sleep", Duration::from_secs(3600), || async {});

        tokio::time::sleep(Duration::from_millis(20)).await;
        let start = std::time::Instant::now();
        tx.send(true).unwrap();
        scheduler.join_all(Duration::from_secs(5)).await;
        assert!(start.elapsed() < Duration::from_secs(2), "join should not wait out the hour sleep");
    }
}
