//! Explicit service wrapper for the threading core.
//!
//! The host constructs exactly one [`ThreadingService`] on the logic thread
//! at session startup and calls [`shutdown`] at a well-defined teardown point
//! (unloading a session, returning to the main menu) before dependent state
//! is torn down. There is no implicit global state anywhere in this crate.
//!
//! [`shutdown`]: ThreadingService::shutdown

use crate::budget::BudgetedQueue;
use crate::config::ThreadingConfig;
use crate::dispatch::MainThreadDispatcher;
use crate::pool::WorkItemPool;
use crate::worker::manager::WorkerManager;
use std::sync::Arc;

/// Owner of the scheduling core: work-item pool, worker registry, and
/// main-thread dispatcher.
pub struct ThreadingService {
    config: ThreadingConfig,
    pool: Arc<WorkItemPool>,
    manager: WorkerManager,
    dispatcher: Arc<MainThreadDispatcher>,
}

impl ThreadingService {
    /// Construct on the logic thread; the dispatcher binds to the calling
    /// thread's identity.
    pub fn new(config: ThreadingConfig) -> Self {
        let pool = Arc::new(WorkItemPool::new());
        let manager = WorkerManager::new(config.clone(), Arc::clone(&pool));
        let dispatcher = Arc::new(MainThreadDispatcher::new());
        Self {
            config,
            pool,
            manager,
            dispatcher,
        }
    }

    pub fn config(&self) -> &ThreadingConfig {
        &self.config
    }

    pub fn pool(&self) -> &Arc<WorkItemPool> {
        &self.pool
    }

    pub fn manager(&self) -> &WorkerManager {
        &self.manager
    }

    pub fn dispatcher(&self) -> &Arc<MainThreadDispatcher> {
        &self.dispatcher
    }

    /// Builds a budgeted queue using the configured per-tick frame budget.
    /// The queue lives on the logic thread; the host owns and pumps it.
    pub fn create_budgeted_queue(&self) -> BudgetedQueue {
        BudgetedQueue::new(self.config.frame_budget)
    }

    /// Teardown hook: stops and joins every live worker with the configured
    /// bounded timeout. The host calls this when a session unloads, before
    /// the state that queued work might still reference goes away.
    pub fn shutdown(&self) {
        self.manager.release_all();
    }

    /// Installs the env_logger backend. Safe to call more than once; later
    /// calls are ignored.
    pub fn init_logging() {
        let _ = env_logger::builder().try_init();
    }
}

impl Drop for ThreadingService {
    fn drop(&mut self) {
        self.manager.release_all();
    }
}
