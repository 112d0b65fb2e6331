//! Pooled work items.
//!
//! Work handed to dedicated workers is wrapped in [`WorkItem`]s leased from a
//! shared [`WorkItemPool`] so that steady-state dispatch does not heap-allocate
//! per call. The pool supports concurrent lease/recycle from any thread; a
//! leased item belongs to exactly one owner between lease and recycle and is
//! not internally synchronized.

use parking_lot::Mutex;
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

type Action = Box<dyn FnOnce() + Send + 'static>;
type ValidityCheck = Box<dyn Fn() -> bool + Send + 'static>;
type FailureHook = Box<dyn FnOnce(&str) + Send + 'static>;

/// Outcome of running a leased work item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// The action ran to completion.
    Completed,
    /// The validity check failed; the action was discarded without running.
    Skipped,
    /// The action panicked; the panic was caught and reported.
    Failed,
}

/// A reusable unit of schedulable work.
///
/// A leased item carries an action, an optional validity check evaluated
/// immediately before invocation, and an optional failure hook invoked with
/// the panic message if the action panics. Whatever happens during [`run`],
/// the item must go back to its pool via [`WorkItemPool::recycle`].
///
/// [`run`]: WorkItem::run
pub struct WorkItem {
    action: Option<Action>,
    validity: Option<ValidityCheck>,
    on_failure: Option<FailureHook>,
    label: Option<String>,
}

impl WorkItem {
    fn new() -> Self {
        Self {
            action: None,
            validity: None,
            on_failure: None,
            label: None,
        }
    }

    pub fn set_action(&mut self, action: impl FnOnce() + Send + 'static) {
        self.action = Some(Box::new(action));
    }

    pub fn set_validity(&mut self, check: impl Fn() -> bool + Send + 'static) {
        self.validity = Some(Box::new(check));
    }

    pub fn set_on_failure(&mut self, hook: impl FnOnce(&str) + Send + 'static) {
        self.on_failure = Some(Box::new(hook));
    }

    /// Label used in diagnostics when the action misbehaves.
    pub fn set_label(&mut self, label: impl Into<String>) {
        self.label = Some(label.into());
    }

    /// Evaluates the validity check. Defaults to true when absent. Consumers
    /// check this immediately before invocation; an invalid item is discarded
    /// without running its action.
    pub fn is_valid(&self) -> bool {
        self.validity.as_ref().map_or(true, |check| check())
    }

    /// Runs the item: validity check, then the action with panic isolation.
    /// A panic is caught, logged under the item label, and routed to the
    /// failure hook. The caller recycles the item regardless of outcome.
    pub fn run(&mut self) -> RunOutcome {
        if !self.is_valid() {
            return RunOutcome::Skipped;
        }

        let action = match self.action.take() {
            Some(action) => action,
            None => return RunOutcome::Skipped,
        };

        match panic::catch_unwind(AssertUnwindSafe(action)) {
            Ok(()) => RunOutcome::Completed,
            Err(payload) => {
                let message = panic_message(payload);
                log::error!(
                    "[WorkItem] action '{}' panicked: {}",
                    self.display_label(),
                    message
                );

                if let Some(hook) = self.on_failure.take() {
                    let hook_result = panic::catch_unwind(AssertUnwindSafe(|| hook(&message)));
                    if hook_result.is_err() {
                        log::error!(
                            "[WorkItem] failure hook for '{}' panicked",
                            self.display_label()
                        );
                    }
                }

                RunOutcome::Failed
            }
        }
    }

    fn display_label(&self) -> &str {
        self.label.as_deref().unwrap_or("unnamed")
    }

    /// Clears all fields so the instance can be reused.
    fn reset(&mut self) {
        self.action = None;
        self.validity = None;
        self.on_failure = None;
        self.label = None;
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else {
        "unknown panic".to_string()
    }
}

/// Snapshot of pool instrumentation.
#[derive(Debug, Clone, Default)]
pub struct PoolStats {
    /// Total successful leases.
    pub leased: u64,
    /// Total recycles.
    pub recycled: u64,
    /// Items constructed because the pool was empty.
    pub allocated: u64,
    /// Currently leased-but-not-recycled items.
    pub outstanding: i64,
    /// Recycles that had no matching lease. Always zero in correct code.
    pub overdraws: u64,
    /// Idle items waiting in the pool.
    pub idle: usize,
}

/// Concurrent pool of idle [`WorkItem`]s.
///
/// Lease balance is tracked in every build configuration: more recycles than
/// leases is pool corruption and gets logged the moment it happens.
pub struct WorkItemPool {
    idle: Mutex<Vec<WorkItem>>,
    leased: AtomicU64,
    recycled: AtomicU64,
    allocated: AtomicU64,
    outstanding: AtomicI64,
    overdraws: AtomicU64,
}

impl WorkItemPool {
    pub fn new() -> Self {
        Self {
            idle: Mutex::new(Vec::new()),
            leased: AtomicU64::new(0),
            recycled: AtomicU64::new(0),
            allocated: AtomicU64::new(0),
            outstanding: AtomicI64::new(0),
            overdraws: AtomicU64::new(0),
        }
    }

    /// Pre-populates the pool with `count` idle items.
    pub fn with_capacity(count: usize) -> Self {
        let pool = Self::new();
        {
            let mut idle = pool.idle.lock();
            idle.reserve(count);
            for _ in 0..count {
                idle.push(WorkItem::new());
            }
        }
        pool.allocated.store(count as u64, Ordering::Relaxed);
        pool
    }

    /// Leases an idle item, constructing a fresh one if the pool is empty.
    pub fn get(&self) -> WorkItem {
        let item = match self.idle.lock().pop() {
            Some(item) => item,
            None => {
                self.allocated.fetch_add(1, Ordering::Relaxed);
                WorkItem::new()
            }
        };
        self.leased.fetch_add(1, Ordering::Relaxed);
        self.outstanding.fetch_add(1, Ordering::Relaxed);
        item
    }

    /// Clears the item and returns it to the idle pool. Recycling an item
    /// that was never leased is a correctness bug and is reported.
    pub fn recycle(&self, mut item: WorkItem) {
        item.reset();
        self.recycled.fetch_add(1, Ordering::Relaxed);
        let before = self.outstanding.fetch_sub(1, Ordering::Relaxed);
        if before <= 0 {
            self.overdraws.fetch_add(1, Ordering::Relaxed);
            log::error!("[WorkItemPool] recycle without a matching lease (balance underflow)");
        }
        self.idle.lock().push(item);
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            leased: self.leased.load(Ordering::Relaxed),
            recycled: self.recycled.load(Ordering::Relaxed),
            allocated: self.allocated.load(Ordering::Relaxed),
            outstanding: self.outstanding.load(Ordering::Relaxed),
            overdraws: self.overdraws.load(Ordering::Relaxed),
            idle: self.idle.lock().len(),
        }
    }
}

impl Default for WorkItemPool {
    fn default() -> Self {
        Self::new()
    }
}
