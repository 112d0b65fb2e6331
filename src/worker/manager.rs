//! Worker registry and lifecycle management.
//!
//! Workers are provisioned by identity, not elastically by load: exclusive
//! workers get a fresh id per caller, shared workers are looked up by a
//! caller-chosen id and reference counted. A hard cap bounds the live thread
//! count, and teardown joins every worker with a bounded timeout so one
//! misbehaving thread can never hang the whole sequence.

use super::{Ownership, WorkerId, WorkerThread};
use crate::config::ThreadingConfig;
use crate::error::{ThreadingError, ThreadingResult};
use crate::pool::WorkItemPool;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

/// First id in the exclusive range. Shared ids must stay below this, which
/// keeps the two ranges disjoint by construction.
pub const EXCLUSIVE_ID_BASE: u32 = 65_536;

struct RegistryState {
    workers: HashMap<WorkerId, Arc<WorkerThread>>,
    /// Shared workers only; exclusive workers are never refcounted.
    refcounts: HashMap<WorkerId, usize>,
    next_exclusive: u32,
}

/// Registry of live dedicated workers.
///
/// All registry mutations happen under one lock. The lock is never held
/// while joining a worker, so a slow teardown cannot block lookups or
/// creation of unrelated workers.
pub struct WorkerManager {
    config: ThreadingConfig,
    pool: Arc<WorkItemPool>,
    state: Mutex<RegistryState>,
}

impl WorkerManager {
    pub fn new(config: ThreadingConfig, pool: Arc<WorkItemPool>) -> Self {
        Self {
            config,
            pool,
            state: Mutex::new(RegistryState {
                workers: HashMap::new(),
                refcounts: HashMap::new(),
                next_exclusive: EXCLUSIVE_ID_BASE,
            }),
        }
    }

    /// Creates a fresh exclusively-owned worker. Fails once the live worker
    /// count has reached the configured cap; there is no degraded fallback.
    pub fn create_exclusive(&self) -> ThreadingResult<Arc<WorkerThread>> {
        let mut state = self.state.lock();
        if state.workers.len() >= self.config.max_threads {
            return Err(ThreadingError::ThreadCapExceeded {
                limit: self.config.max_threads,
            });
        }

        let id = WorkerId(state.next_exclusive);
        state.next_exclusive += 1;

        let worker = WorkerThread::spawn(id, Ownership::Exclusive, Arc::clone(&self.pool))?;
        state.workers.insert(id, Arc::clone(&worker));
        log::debug!("[WorkerManager] created exclusive worker {}", id.0);
        Ok(worker)
    }

    /// Looks up the shared worker with the given id, creating it with a
    /// refcount of 1 if absent, incrementing the refcount if present.
    pub fn get_or_create_shared(&self, id: u32) -> ThreadingResult<Arc<WorkerThread>> {
        if id >= EXCLUSIVE_ID_BASE {
            return Err(ThreadingError::SharedIdOutOfRange {
                id,
                max: EXCLUSIVE_ID_BASE,
            });
        }
        let id = WorkerId(id);

        let mut state = self.state.lock();
        if let Some(existing) = state.workers.get(&id) {
            let worker = Arc::clone(existing);
            *state.refcounts.entry(id).or_insert(0) += 1;
            return Ok(worker);
        }

        if state.workers.len() >= self.config.max_threads {
            return Err(ThreadingError::ThreadCapExceeded {
                limit: self.config.max_threads,
            });
        }

        let worker = WorkerThread::spawn(id, Ownership::Shared, Arc::clone(&self.pool))?;
        state.workers.insert(id, Arc::clone(&worker));
        state.refcounts.insert(id, 1);
        log::debug!("[WorkerManager] created shared worker {}", id.0);
        Ok(worker)
    }

    /// Releases a worker obtained from this manager. Exclusive workers are
    /// stopped and joined immediately; shared workers only once the last
    /// owner has released. Returns [`ThreadingError::JoinTimeout`] if the
    /// worker thread outlives the configured join timeout.
    pub fn release(&self, worker: &Arc<WorkerThread>) -> ThreadingResult<()> {
        let id = worker.id();
        let to_dispose = {
            let mut state = self.state.lock();
            match worker.ownership() {
                Ownership::Exclusive => state
                    .workers
                    .remove(&id)
                    .ok_or(ThreadingError::UnknownWorker { id: id.0 })?,
                Ownership::Shared => {
                    let count = state
                        .refcounts
                        .get_mut(&id)
                        .ok_or(ThreadingError::UnknownWorker { id: id.0 })?;
                    *count -= 1;
                    if *count > 0 {
                        return Ok(());
                    }
                    state.refcounts.remove(&id);
                    state
                        .workers
                        .remove(&id)
                        .ok_or(ThreadingError::UnknownWorker { id: id.0 })?
                }
            }
        };

        self.dispose(&to_dispose)
    }

    /// Stops and joins every live worker. The teardown entry point the host
    /// calls when a session unloads. A worker that misses the join timeout
    /// is logged as a probable deadlock and teardown moves on to the next.
    pub fn release_all(&self) {
        let workers: Vec<Arc<WorkerThread>> = {
            let mut state = self.state.lock();
            state.refcounts.clear();
            state.workers.drain().map(|(_, worker)| worker).collect()
        };
        if workers.is_empty() {
            return;
        }

        log::debug!("[WorkerManager] releasing {} workers", workers.len());

        // Signal everything first so the joins below overlap the shutdowns.
        for worker in &workers {
            worker.stop();
        }
        for worker in &workers {
            if let Err(error) = worker.join_within(self.config.join_timeout) {
                log::error!("[WorkerManager] {} (probable deadlock)", error);
            }
        }
    }

    /// Looks up a live worker by id. Returns `None` once the worker has been
    /// fully disposed; the id is safe to reuse only after that.
    pub fn get_thread(&self, id: WorkerId) -> Option<Arc<WorkerThread>> {
        self.state.lock().workers.get(&id).cloned()
    }

    pub fn live_count(&self) -> usize {
        self.state.lock().workers.len()
    }

    fn dispose(&self, worker: &Arc<WorkerThread>) -> ThreadingResult<()> {
        worker.stop();
        let result = worker.join_within(self.config.join_timeout);
        if let Err(error) = &result {
            log::error!("[WorkerManager] {} (probable deadlock)", error);
        } else {
            log::debug!("[WorkerManager] disposed worker {}", worker.id().0);
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    fn test_manager(max_threads: usize) -> WorkerManager {
        let config = ThreadingConfig {
            max_threads,
            ..Default::default()
        };
        WorkerManager::new(config, Arc::new(WorkItemPool::new()))
    }

    #[test]
    fn test_exclusive_ids_are_unique_and_in_range() {
        let manager = test_manager(4);
        let a = manager.create_exclusive().expect("create failed");
        let b = manager.create_exclusive().expect("create failed");

        assert_ne!(a.id(), b.id());
        assert!(a.id().0 >= EXCLUSIVE_ID_BASE);
        assert!(b.id().0 >= EXCLUSIVE_ID_BASE);

        manager.release(&a).expect("release failed");
        manager.release(&b).expect("release failed");
        assert_eq!(manager.live_count(), 0);
    }

    #[test]
    fn test_creation_beyond_cap_fails_explicitly() {
        let manager = test_manager(2);
        let a = manager.create_exclusive().expect("create failed");
        let b = manager.create_exclusive().expect("create failed");

        let over = manager.create_exclusive();
        assert!(matches!(
            over,
            Err(ThreadingError::ThreadCapExceeded { limit: 2 })
        ));
        // The failed creation registered nothing.
        assert_eq!(manager.live_count(), 2);

        manager.release(&a).expect("release failed");
        manager.release(&b).expect("release failed");
    }

    #[test]
    fn test_shared_refcount_disposes_after_last_release() {
        let manager = test_manager(4);

        let first = manager.get_or_create_shared(7).expect("create failed");
        let second = manager.get_or_create_shared(7).expect("lookup failed");
        assert_eq!(first.id(), second.id());
        assert_eq!(manager.live_count(), 1);

        // First release: the worker must stay alive and still execute work.
        manager.release(&first).expect("release failed");
        let alive = manager.get_thread(WorkerId(7)).expect("worker disposed early");

        let ran = Arc::new(AtomicBool::new(false));
        let (done_tx, done_rx) = flume::bounded(1);
        let mut item = manager.pool.get();
        let ran_clone = Arc::clone(&ran);
        item.set_action(move || {
            ran_clone.store(true, Ordering::SeqCst);
            let _ = done_tx.send(());
        });
        alive.queue(item).expect("queue failed");
        done_rx
            .recv_timeout(Duration::from_secs(5))
            .expect("shared worker stalled after partial release");
        assert!(ran.load(Ordering::SeqCst));

        // Last release disposes exactly once.
        manager.release(&second).expect("release failed");
        assert!(manager.get_thread(WorkerId(7)).is_none());
        assert_eq!(manager.live_count(), 0);
        assert!(!second.is_running());
    }

    #[test]
    fn test_shared_id_must_stay_below_exclusive_range() {
        let manager = test_manager(4);
        let result = manager.get_or_create_shared(EXCLUSIVE_ID_BASE);
        assert!(matches!(
            result,
            Err(ThreadingError::SharedIdOutOfRange { .. })
        ));
    }

    #[test]
    fn test_release_unknown_worker_is_an_error() {
        let manager = test_manager(4);
        let worker = manager.create_exclusive().expect("create failed");
        manager.release(&worker).expect("release failed");

        let again = manager.release(&worker);
        assert!(matches!(again, Err(ThreadingError::UnknownWorker { .. })));
    }

    #[test]
    fn test_release_all_survives_a_stuck_worker() {
        let config = ThreadingConfig {
            max_threads: 4,
            join_timeout: Duration::from_millis(50),
            ..Default::default()
        };
        let pool = Arc::new(WorkItemPool::new());
        let manager = WorkerManager::new(config, Arc::clone(&pool));

        let stuck = manager.create_exclusive().expect("create failed");
        let healthy = manager.create_exclusive().expect("create failed");

        // Occupy the first worker well past the join timeout.
        let mut sleeper = pool.get();
        sleeper.set_label("sleeper");
        sleeper.set_action(|| std::thread::sleep(Duration::from_millis(400)));
        stuck.queue(sleeper).expect("queue failed");
        // Give the worker a moment to actually pick the item up.
        std::thread::sleep(Duration::from_millis(100));

        // Must return despite the stuck worker, and the healthy one is gone.
        manager.release_all();
        assert_eq!(manager.live_count(), 0);
        assert!(!healthy.is_running());
        assert!(manager.get_thread(stuck.id()).is_none());

        // Let the sleeper finish so the test does not leak a busy thread.
        std::thread::sleep(Duration::from_millis(400));
    }

    #[test]
    fn test_get_thread_sees_live_workers_only() {
        let manager = test_manager(4);
        assert!(manager.get_thread(WorkerId(3)).is_none());

        let worker = manager.get_or_create_shared(3).expect("create failed");
        assert!(manager.get_thread(WorkerId(3)).is_some());

        manager.release(&worker).expect("release failed");
        assert!(manager.get_thread(WorkerId(3)).is_none());
    }
}
