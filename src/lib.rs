//! modforge-core - concurrency and scheduling core for the modding toolkit.
//!
//! A bounded set of long-lived background worker threads with
//! exclusive/shared ownership and reference counting, a pooled work-item
//! abstraction that avoids per-dispatch heap churn, a disciplined channel
//! for marshaling work from background threads back onto the single
//! logic/render thread, and a cooperative scheduler that time-slices large
//! deferred batches across frame boundaries.
//!
//! The pieces fit together like this: callers lease a [`WorkItem`] from the
//! shared pool, configure it, and queue it on a [`WorkerThread`] obtained
//! from the [`WorkerManager`]. Workers execute items in isolation; when an
//! item needs to touch logic-thread state it goes through the
//! [`MainThreadDispatcher`]. Large deferred batches that already originate
//! on the logic thread use a [`BudgetedQueue`] instead of a background
//! thread.
//!
//! Everything hangs off an explicitly constructed [`ThreadingService`]; the
//! host must call [`ThreadingService::shutdown`] at its session-teardown
//! point.

// Core scheduling components
pub mod budget;
pub mod dispatch;
pub mod pool;
pub mod worker;

// Service plumbing
pub mod config;
pub mod error;
pub mod service;

pub use budget::{BudgetStats, BudgetedQueue};
pub use config::ThreadingConfig;
pub use dispatch::{CallbackHandle, DispatchStats, MainThreadAction, MainThreadDispatcher};
pub use error::{ThreadingError, ThreadingResult};
pub use pool::{PoolStats, RunOutcome, WorkItem, WorkItemPool};
pub use service::ThreadingService;
pub use worker::manager::{WorkerManager, EXCLUSIVE_ID_BASE};
pub use worker::{Ownership, WorkerId, WorkerStats, WorkerThread};
