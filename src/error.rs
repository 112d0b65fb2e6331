//! Error types for the threading core.
//!
//! Covers the failure taxonomy of the scheduling subsystem: worker capacity
//! exhaustion, lifecycle misuse, and cross-thread timeouts. Background-thread
//! panics never surface through these types; they are caught and logged at
//! the point of invocation.

pub type ThreadingResult<T> = Result<T, ThreadingError>;

#[derive(Debug, thiserror::Error)]
pub enum ThreadingError {
    #[error("worker cap reached: {limit} workers already live")]
    ThreadCapExceeded { limit: usize },

    #[error("shared worker id {id} is outside the shared range 0..{max}")]
    SharedIdOutOfRange { id: u32, max: u32 },

    #[error("worker {id} is not registered")]
    UnknownWorker { id: u32 },

    #[error("worker {id} is stopped and no longer accepts work")]
    WorkerStopped { id: u32 },

    #[error("worker {id} did not terminate within {timeout_ms} ms")]
    JoinTimeout { id: u32, timeout_ms: u64 },

    #[error("main-thread dispatch timed out after {timeout_ms} ms")]
    DispatchTimeout { timeout_ms: u64 },

    #[error("{operation} must be called from the logic thread")]
    NotLogicThread { operation: &'static str },

    #[error("failed to spawn worker {id}: {error}")]
    SpawnFailed { id: u32, error: String },
}
