//! Work queue that drives a [`Reconciler`].
//!
//! Names arrive on a channel. A name is queued at most once, never reconciled
//! by two tasks at the same time, and rescheduled according to the outcome of
//! its pass.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use super::{Outcome, Reconciler};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunnerOptions {
    /// Upper bound on reconciliations running at once.
    pub max_concurrent: usize,
    /// Delay before a failed pass is retried.
    pub default_retry: Duration,
}

impl RunnerOptions {
    pub fn new(max_concurrent: usize, default_retry: Duration) -> Self {
        Self {
            max_concurrent: max_concurrent.max(1),
            default_retry,
        }
    }

    /// One reconciliation at a time.
    pub fn serial(default_retry: Duration) -> Self {
        Self::new(1, default_retry)
    }
}

/// Counters of finished reconcile passes.
#[derive(Debug, Default)]
pub struct RunnerStats {
    reconciled: AtomicU64,
    postponed: AtomicU64,
    failed: AtomicU64,
}

impl RunnerStats {
    /// Passes that finished with [`Outcome::Done`].
    pub fn reconciled(&self) -> u64 {
        self.reconciled.load(Ordering::Relaxed)
    }

    pub fn postponed(&self) -> u64 {
        self.postponed.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }
}

/// Queue bookkeeping owned by the runner loop.
#[derive(Debug, Default)]
struct QueueState {
    pending: VecDeque<String>,
    queued: HashSet<String>,
    running: HashSet<String>,
    /// Names that were requested again while running.
    dirty: HashSet<String>,
}

impl QueueState {
    fn enqueue(&mut self, name: String) {
        if self.running.contains(&name) {
            self.dirty.insert(name);
        } else if self.queued.insert(name.clone()) {
            self.pending.push_back(name);
        }
    }

    fn next(&mut self) -> Option<String> {
        let name = self.pending.pop_front()?;
        self.queued.remove(&name);
        self.running.insert(name.clone());
        Some(name)
    }

    /// Marks `name` finished. Returns whether it must run again right away.
    fn finish(&mut self, name: &str) -> bool {
        self.running.remove(name);
        self.dirty.remove(name)
    }
}

pub struct ControllerRunner<R: Reconciler> {
    reconciler: Arc<R>,
    options: RunnerOptions,
    stats: Arc<RunnerStats>,
    shutdown: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl<R: Reconciler> ControllerRunner<R> {
    pub fn new(reconciler: R, options: RunnerOptions) -> Self {
        Self {
            reconciler: Arc::new(reconciler),
            options,
            stats: Arc::new(RunnerStats::default()),
            shutdown: Arc::new(AtomicBool::new(false)),
            notify: Arc::new(Notify::new()),
        }
    }

    pub fn stats(&self) -> Arc<RunnerStats> {
        Arc::clone(&self.stats)
    }

    pub fn options(&self) -> RunnerOptions {
        self.options
    }

    /// Runs one pass for `name` and returns when it should run again.
    pub async fn process(&self, name: &str) -> Option<Duration> {
        process(
            self.reconciler.as_ref(),
            &self.stats,
            self.options.default_retry,
            name,
        )
        .await
    }

    /// Starts the queue loop. It runs until [`ControllerRunner::stop`] is called.
    pub fn start(&self, mut events: mpsc::UnboundedReceiver<String>) -> JoinHandle<()> {
        let reconciler = Arc::clone(&self.reconciler);
        let stats = Arc::clone(&self.stats);
        let shutdown = Arc::clone(&self.shutdown);
        let notify = Arc::clone(&self.notify);
        let options = self.options;

        tokio::spawn(async move {
            let kind = reconciler.kind();
            let (requeue_tx, mut requeue_rx) = mpsc::unbounded_channel::<String>();
            let (done_tx, mut done_rx) = mpsc::unbounded_channel::<(String, Option<Duration>)>();
            let mut state = QueueState::default();
            let mut events_open = true;

            info!(kind, max_concurrent = options.max_concurrent, "controller runner started");

            loop {
                if shutdown.load(Ordering::SeqCst) {
                    break;
                }

                while state.running.len() < options.max_concurrent {
                    let Some(name) = state.next() else { break };
                    let reconciler = Arc::clone(&reconciler);
                    let stats = Arc::clone(&stats);
                    let done_tx = done_tx.clone();
                    tokio::spawn(async move {
                        let retry =
                            process(reconciler.as_ref(), &stats, options.default_retry, &name)
                                .await;
                        let _ = done_tx.send((name, retry));
                    });
                }

                tokio::select! {
                    _ = notify.notified() => {}
                    event = events.recv(), if events_open => match event {
                        Some(name) => state.enqueue(name),
                        None => {
                            debug!(kind, "event channel closed");
                            events_open = false;
                        }
                    },
                    Some(name) = requeue_rx.recv() => state.enqueue(name),
                    Some((name, retry)) = done_rx.recv() => {
                        if state.finish(&name) {
                            state.enqueue(name);
                        } else if let Some(delay) = retry {
                            let requeue_tx = requeue_tx.clone();
                            tokio::spawn(async move {
                                tokio::time::sleep(delay).await;
                                let _ = requeue_tx.send(name);
                            });
                        }
                    }
                }
            }

            info!(kind, "controller runner stopped");
        })
    }

    pub fn stop(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.notify.notify_one();
    }

    pub fn is_stopped(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }
}

/// Translates one reconcile result into a scheduling decision.
async fn process<R: Reconciler + ?Sized>(
    reconciler: &R,
    stats: &RunnerStats,
    default_retry: Duration,
    name: &str,
) -> Option<Duration> {
    let kind = reconciler.kind();
    match reconciler.reconcile(name).await {
        Ok(Outcome::Done) => {
            stats.reconciled.fetch_add(1, Ordering::Relaxed);
            debug!(kind, name, "reconciled");
            None
        }
        Ok(Outcome::RetryAfter(delay)) => {
            stats.postponed.fetch_add(1, Ordering::Relaxed);
            info!(kind, name, ?delay, "reconcile postponed");
            Some(delay)
        }
        Err(e) => {
            stats.failed.fetch_add(1, Ordering::Relaxed);
            error!(
                kind,
                name,
                configuration = e.is_configuration(),
                error = %e,
                "reconcile failed"
            );
            Some(default_retry)
        }
    }
}
