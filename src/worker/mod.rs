//! Dedicated worker threads.
//!
//! A [`WorkerThread`] owns one long-lived OS thread that drains a private
//! FIFO of pooled work items until told to stop. Items can be queued from
//! any thread; the worker itself is the only consumer. One item's failure
//! never stops the worker or discards the items queued behind it.

pub mod manager;

use crate::error::{ThreadingError, ThreadingResult};
use crate::pool::{RunOutcome, WorkItem, WorkItemPool};
use crossbeam_channel::{bounded, select, unbounded, Receiver, Sender};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// How a worker is owned and released.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ownership {
    /// One caller; disposed immediately on release.
    Exclusive,
    /// Many callers; refcounted, disposed when the last owner releases.
    Shared,
}

/// Worker identity. Shared and exclusive workers draw their ids from
/// disjoint numeric ranges (see [`manager::EXCLUSIVE_ID_BASE`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WorkerId(pub u32);

/// Snapshot of a worker's execution counters.
#[derive(Debug, Clone, Default)]
pub struct WorkerStats {
    pub completed: u64,
    pub skipped: u64,
    pub failed: u64,
}

/// A dedicated background worker with a private FIFO queue.
///
/// Lifecycle: Created -> Running -> Stopping -> Terminated. The worker only
/// ever exits its loop on an explicit stop signal (or when every sender is
/// gone); the registry drives teardown with a bounded join.
pub struct WorkerThread {
    id: WorkerId,
    ownership: Ownership,
    work_tx: Sender<WorkItem>,
    stop_tx: Sender<()>,
    terminated_rx: flume::Receiver<()>,
    handle: Mutex<Option<JoinHandle<()>>>,
    running: AtomicBool,
    pool: Arc<WorkItemPool>,
    completed: AtomicU64,
    skipped: AtomicU64,
    failed: AtomicU64,
}

impl WorkerThread {
    pub(crate) fn spawn(
        id: WorkerId,
        ownership: Ownership,
        pool: Arc<WorkItemPool>,
    ) -> ThreadingResult<Arc<Self>> {
        let (work_tx, work_rx) = unbounded();
        let (stop_tx, stop_rx) = bounded(1);
        let (terminated_tx, terminated_rx) = flume::bounded(1);

        let worker = Arc::new(Self {
            id,
            ownership,
            work_tx,
            stop_tx,
            terminated_rx,
            handle: Mutex::new(None),
            running: AtomicBool::new(true),
            pool,
            completed: AtomicU64::new(0),
            skipped: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        });

        let loop_worker = Arc::clone(&worker);
        let handle = thread::Builder::new()
            .name(format!("modforge-worker-{}", id.0))
            .spawn(move || loop_worker.run_loop(work_rx, stop_rx, terminated_tx))
            .map_err(|e| ThreadingError::SpawnFailed {
                id: id.0,
                error: e.to_string(),
            })?;

        *worker.handle.lock() = Some(handle);
        Ok(worker)
    }

    pub fn id(&self) -> WorkerId {
        self.id
    }

    pub fn ownership(&self) -> Ownership {
        self.ownership
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Items queued but not yet picked up by the worker.
    pub fn pending(&self) -> usize {
        self.work_tx.len()
    }

    pub fn stats(&self) -> WorkerStats {
        WorkerStats {
            completed: self.completed.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }

    /// Appends an item to the worker's FIFO. Callable from any thread.
    /// Queuing on a stopped worker fails and the item goes straight back to
    /// the pool, so no path leaks it.
    pub fn queue(&self, item: WorkItem) -> ThreadingResult<()> {
        if !self.is_running() {
            self.pool.recycle(item);
            return Err(ThreadingError::WorkerStopped { id: self.id.0 });
        }
        match self.work_tx.send(item) {
            Ok(()) => Ok(()),
            Err(send_error) => {
                self.pool.recycle(send_error.0);
                Err(ThreadingError::WorkerStopped { id: self.id.0 })
            }
        }
    }

    /// Signals the worker to exit its loop. Idempotent; does not wait.
    pub(crate) fn stop(&self) {
        if self.running.swap(false, Ordering::AcqRel) {
            let _ = self.stop_tx.try_send(());
        }
    }

    /// Waits up to `timeout` for the worker loop to exit, then joins the
    /// thread. A timeout leaves the thread untouched and reports the
    /// probable deadlock to the caller.
    pub(crate) fn join_within(&self, timeout: Duration) -> ThreadingResult<()> {
        match self.terminated_rx.recv_timeout(timeout) {
            Ok(()) | Err(flume::RecvTimeoutError::Disconnected) => {
                if let Some(handle) = self.handle.lock().take() {
                    if handle.join().is_err() {
                        log::error!("[Worker {}] thread panicked outside an item", self.id.0);
                    }
                }
                Ok(())
            }
            Err(flume::RecvTimeoutError::Timeout) => Err(ThreadingError::JoinTimeout {
                id: self.id.0,
                timeout_ms: timeout.as_millis() as u64,
            }),
        }
    }

    fn run_loop(
        &self,
        work_rx: Receiver<WorkItem>,
        stop_rx: Receiver<()>,
        terminated_tx: flume::Sender<()>,
    ) {
        log::debug!("[Worker {}] running", self.id.0);

        loop {
            if !self.running.load(Ordering::Acquire) {
                break;
            }
            select! {
                recv(stop_rx) -> _ => break,
                recv(work_rx) -> message => match message {
                    Ok(mut item) => {
                        match item.run() {
                            RunOutcome::Completed => {
                                self.completed.fetch_add(1, Ordering::Relaxed);
                            }
                            RunOutcome::Skipped => {
                                self.skipped.fetch_add(1, Ordering::Relaxed);
                            }
                            RunOutcome::Failed => {
                                self.failed.fetch_add(1, Ordering::Relaxed);
                            }
                        }
                        self.pool.recycle(item);
                    }
                    // Every sender is gone; nothing can arrive anymore.
                    Err(_) => break,
                },
            }
        }

        self.running.store(false, Ordering::Release);

        // Hand unprocessed items back so the pool lease balance stays exact.
        while let Ok(item) = work_rx.try_recv() {
            self.pool.recycle(item);
        }

        let _ = terminated_tx.send(());
        log::debug!("[Worker {}] terminated", self.id.0);
    }
}
