//! Main-thread dispatcher.
//!
//! Background threads must never touch logic-thread state directly; they
//! hand callbacks here instead. The host drains the dispatcher once per tick
//! ([`MainThreadDispatcher::pump_update`]) and once per GUI event pass
//! ([`MainThreadDispatcher::pump_gui`]). The two phases are kept separate
//! because tick updates and GUI/input events run with different timing and
//! reentrancy rules on the host.

use crate::error::{ThreadingError, ThreadingResult};
use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::{self, ThreadId};
use std::time::Duration;

/// An action marshaled onto the logic thread.
pub type MainThreadAction = Box<dyn FnOnce() + Send + 'static>;

type UpdateCallback = Box<dyn FnMut() -> bool + Send + 'static>;
type GuiCallback = Box<dyn FnMut() + Send + 'static>;

/// Token identifying a registered update or GUI callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallbackHandle(u64);

/// One dispatcher call's worth of actions. Executes as a unit: no update
/// callback runs between two actions of the same batch.
struct Batch {
    actions: Vec<MainThreadAction>,
    done: Option<flume::Sender<()>>,
}

/// Snapshot of dispatcher counters.
#[derive(Debug, Clone, Default)]
pub struct DispatchStats {
    pub batches_marshaled: u64,
    pub batches_executed: u64,
    pub inline_runs: u64,
    pub wait_timeouts: u64,
}

/// The only sanctioned channel for running logic-thread-affine code from
/// background threads, and the home of per-frame polling callbacks.
///
/// Construct it on the logic thread; the constructing thread's identity is
/// what every affinity check compares against.
pub struct MainThreadDispatcher {
    logic_thread: ThreadId,
    batch_tx: Sender<Batch>,
    batch_rx: Receiver<Batch>,
    updates: Mutex<Vec<(CallbackHandle, UpdateCallback)>>,
    gui: Mutex<Vec<(CallbackHandle, GuiCallback)>>,
    next_handle: AtomicU64,
    batches_marshaled: AtomicU64,
    batches_executed: AtomicU64,
    inline_runs: AtomicU64,
    wait_timeouts: AtomicU64,
}

impl MainThreadDispatcher {
    pub fn new() -> Self {
        let (batch_tx, batch_rx) = unbounded();
        Self {
            logic_thread: thread::current().id(),
            batch_tx,
            batch_rx,
            updates: Mutex::new(Vec::new()),
            gui: Mutex::new(Vec::new()),
            next_handle: AtomicU64::new(1),
            batches_marshaled: AtomicU64::new(0),
            batches_executed: AtomicU64::new(0),
            inline_runs: AtomicU64::new(0),
            wait_timeouts: AtomicU64::new(0),
        }
    }

    pub fn on_logic_thread(&self) -> bool {
        thread::current().id() == self.logic_thread
    }

    /// Registers a callback invoked once per tick. Returning `false`
    /// dequeues it automatically. Logic thread only.
    pub fn start_update(
        &self,
        callback: impl FnMut() -> bool + Send + 'static,
    ) -> ThreadingResult<CallbackHandle> {
        self.ensure_logic_thread("start_update")?;
        let handle = self.allocate_handle();
        self.updates.lock().push((handle, Box::new(callback)));
        Ok(handle)
    }

    /// Unregisters an update callback. Returns whether it was still queued.
    /// Logic thread only.
    pub fn remove_update(&self, handle: CallbackHandle) -> ThreadingResult<bool> {
        self.ensure_logic_thread("remove_update")?;
        let mut updates = self.updates.lock();
        let before = updates.len();
        updates.retain(|(existing, _)| *existing != handle);
        Ok(updates.len() != before)
    }

    /// Registers a callback invoked once per GUI event pass. Logic thread
    /// only.
    pub fn start_gui(
        &self,
        callback: impl FnMut() + Send + 'static,
    ) -> ThreadingResult<CallbackHandle> {
        self.ensure_logic_thread("start_gui")?;
        let handle = self.allocate_handle();
        self.gui.lock().push((handle, Box::new(callback)));
        Ok(handle)
    }

    /// Unregisters a GUI callback. Logic thread only.
    pub fn remove_gui(&self, handle: CallbackHandle) -> ThreadingResult<bool> {
        self.ensure_logic_thread("remove_gui")?;
        let mut gui = self.gui.lock();
        let before = gui.len();
        gui.retain(|(existing, _)| *existing != handle);
        Ok(gui.len() != before)
    }

    /// Fire-and-forget execution on the logic thread. Runs inline and
    /// synchronously when the caller already is the logic thread; otherwise
    /// the action is marshaled and this returns immediately.
    pub fn invoke(&self, action: impl FnOnce() + Send + 'static) {
        self.invoke_batch(vec![Box::new(action)]);
    }

    /// Batch variant of [`invoke`]. The whole batch executes as one unit
    /// with respect to the update-callback list.
    ///
    /// [`invoke`]: MainThreadDispatcher::invoke
    pub fn invoke_batch(&self, actions: Vec<MainThreadAction>) {
        if self.on_logic_thread() {
            self.inline_runs.fetch_add(1, Ordering::Relaxed);
            for action in actions {
                action();
            }
            return;
        }
        self.batches_marshaled.fetch_add(1, Ordering::Relaxed);
        let _ = self.batch_tx.send(Batch {
            actions,
            done: None,
        });
    }

    /// Blocking execution on the logic thread. The caller blocks until the
    /// logic thread has executed the action or `timeout` elapses; expiry is
    /// logged and reported, never swallowed, and does not cancel the batch —
    /// the logic thread may still execute it later. Called from the logic
    /// thread itself, this degenerates to an inline synchronous call so it
    /// cannot deadlock on its own wait handle.
    pub fn invoke_and_wait(
        &self,
        timeout: Duration,
        action: impl FnOnce() + Send + 'static,
    ) -> ThreadingResult<()> {
        self.invoke_batch_and_wait(timeout, vec![Box::new(action)])
    }

    /// Batch variant of [`invoke_and_wait`].
    ///
    /// [`invoke_and_wait`]: MainThreadDispatcher::invoke_and_wait
    pub fn invoke_batch_and_wait(
        &self,
        timeout: Duration,
        actions: Vec<MainThreadAction>,
    ) -> ThreadingResult<()> {
        if self.on_logic_thread() {
            self.inline_runs.fetch_add(1, Ordering::Relaxed);
            for action in actions {
                action();
            }
            return Ok(());
        }

        let (done_tx, done_rx) = flume::bounded(1);
        self.batches_marshaled.fetch_add(1, Ordering::Relaxed);
        let _ = self.batch_tx.send(Batch {
            actions,
            done: Some(done_tx),
        });

        match done_rx.recv_timeout(timeout) {
            Ok(()) => Ok(()),
            Err(_) => {
                self.wait_timeouts.fetch_add(1, Ordering::Relaxed);
                let timeout_ms = timeout.as_millis() as u64;
                log::error!(
                    "[Dispatcher] blocking dispatch timed out after {} ms; the logic thread may be stalled",
                    timeout_ms
                );
                Err(ThreadingError::DispatchTimeout { timeout_ms })
            }
        }
    }

    /// Per-tick drain: executes every pending marshaled batch, then runs the
    /// update callbacks, dropping the ones that return `false` or panic.
    /// Logic thread only.
    pub fn pump_update(&self) -> ThreadingResult<()> {
        self.ensure_logic_thread("pump_update")?;

        // Batches first, each as an atomic unit, so no update callback can
        // observe a batch half-executed.
        while let Ok(batch) = self.batch_rx.try_recv() {
            self.run_batch(batch);
        }

        // Run callbacks outside the lock so one may register another without
        // deadlocking. Removal of a *different* callback mid-pass only takes
        // effect on the next pass.
        let mut current = std::mem::take(&mut *self.updates.lock());
        current.retain_mut(|(handle, callback)| {
            match panic::catch_unwind(AssertUnwindSafe(|| callback())) {
                Ok(keep) => keep,
                Err(_) => {
                    log::error!(
                        "[Dispatcher] update callback {:?} panicked and was removed",
                        handle
                    );
                    false
                }
            }
        });
        let mut updates = self.updates.lock();
        let registered_during_pass = std::mem::take(&mut *updates);
        current.extend(registered_during_pass);
        *updates = current;

        Ok(())
    }

    /// Per-event drain of the GUI callback list. A callback that panics is
    /// caught, logged, and dequeued without affecting the rest of the pass.
    /// Logic thread only.
    pub fn pump_gui(&self) -> ThreadingResult<()> {
        self.ensure_logic_thread("pump_gui")?;

        let mut current = std::mem::take(&mut *self.gui.lock());
        current.retain_mut(|(handle, callback)| {
            match panic::catch_unwind(AssertUnwindSafe(|| callback())) {
                Ok(()) => true,
                Err(_) => {
                    log::error!(
                        "[Dispatcher] GUI callback {:?} panicked and was removed",
                        handle
                    );
                    false
                }
            }
        });
        let mut gui = self.gui.lock();
        let registered_during_pass = std::mem::take(&mut *gui);
        current.extend(registered_during_pass);
        *gui = current;

        Ok(())
    }

    pub fn stats(&self) -> DispatchStats {
        DispatchStats {
            batches_marshaled: self.batches_marshaled.load(Ordering::Relaxed),
            batches_executed: self.batches_executed.load(Ordering::Relaxed),
            inline_runs: self.inline_runs.load(Ordering::Relaxed),
            wait_timeouts: self.wait_timeouts.load(Ordering::Relaxed),
        }
    }

    fn run_batch(&self, batch: Batch) {
        let Batch { actions, done } = batch;
        for action in actions {
            if panic::catch_unwind(AssertUnwindSafe(action)).is_err() {
                log::error!("[Dispatcher] marshaled action panicked on the logic thread");
            }
        }
        self.batches_executed.fetch_add(1, Ordering::Relaxed);
        if let Some(done) = done {
            let _ = done.send(());
        }
    }

    fn allocate_handle(&self) -> CallbackHandle {
        CallbackHandle(self.next_handle.fetch_add(1, Ordering::Relaxed))
    }

    fn ensure_logic_thread(&self, operation: &'static str) -> ThreadingResult<()> {
        if self.on_logic_thread() {
            Ok(())
        } else {
            log::error!("[Dispatcher] {} called off the logic thread", operation);
            Err(ThreadingError::NotLogicThread { operation })
        }
    }
}

impl Default for MainThreadDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize};
    use std::sync::Arc;
    use std::time::Instant;

    #[test]
    fn test_invoke_runs_inline_on_logic_thread() {
        let dispatcher = MainThreadDispatcher::new();
        let ran = Arc::new(AtomicBool::new(false));

        let ran_clone = Arc::clone(&ran);
        dispatcher.invoke(move || ran_clone.store(true, Ordering::SeqCst));

        // Inline and synchronous: set before invoke returns, no pump needed.
        assert!(ran.load(Ordering::SeqCst));
        assert_eq!(dispatcher.stats().inline_runs, 1);
        assert_eq!(dispatcher.stats().batches_marshaled, 0);
    }

    #[test]
    fn test_marshaled_action_runs_on_pump() {
        let dispatcher = Arc::new(MainThreadDispatcher::new());
        let ran = Arc::new(AtomicBool::new(false));

        let background = {
            let dispatcher = Arc::clone(&dispatcher);
            let ran = Arc::clone(&ran);
            thread::spawn(move || {
                dispatcher.invoke(move || ran.store(true, Ordering::SeqCst));
            })
        };
        background.join().expect("background thread panicked");

        // Marshaled, not yet executed.
        assert!(!ran.load(Ordering::SeqCst));
        dispatcher.pump_update().expect("pump failed");
        assert!(ran.load(Ordering::SeqCst));
        assert_eq!(dispatcher.stats().batches_executed, 1);
    }

    #[test]
    fn test_invoke_and_wait_blocks_until_executed() {
        let dispatcher = Arc::new(MainThreadDispatcher::new());
        let ran = Arc::new(AtomicBool::new(false));

        let background = {
            let dispatcher = Arc::clone(&dispatcher);
            let ran = Arc::clone(&ran);
            thread::spawn(move || {
                dispatcher.invoke_and_wait(Duration::from_secs(5), move || {
                    ran.store(true, Ordering::SeqCst);
                })
            })
        };

        // Pump until the caller's batch shows up and executes.
        let deadline = Instant::now() + Duration::from_secs(5);
        while !ran.load(Ordering::SeqCst) {
            assert!(Instant::now() < deadline, "batch never arrived");
            dispatcher.pump_update().expect("pump failed");
            thread::yield_now();
        }

        let result = background.join().expect("background thread panicked");
        assert!(result.is_ok());
        assert!(ran.load(Ordering::SeqCst));
    }

    #[test]
    fn test_invoke_and_wait_times_out_when_never_pumped() {
        let dispatcher = Arc::new(MainThreadDispatcher::new());

        let background = {
            let dispatcher = Arc::clone(&dispatcher);
            thread::spawn(move || dispatcher.invoke_and_wait(Duration::from_millis(100), || {}))
        };

        let result = background.join().expect("background thread panicked");
        assert!(matches!(
            result,
            Err(ThreadingError::DispatchTimeout { timeout_ms: 100 })
        ));
        assert_eq!(dispatcher.stats().wait_timeouts, 1);
    }

    #[test]
    fn test_invoke_and_wait_on_logic_thread_runs_inline() {
        let dispatcher = MainThreadDispatcher::new();
        let ran = Arc::new(AtomicBool::new(false));

        let ran_clone = Arc::clone(&ran);
        let result = dispatcher.invoke_and_wait(Duration::from_millis(1), move || {
            ran_clone.store(true, Ordering::SeqCst);
        });

        // No self-deadlock, no timeout: ran inline.
        assert!(result.is_ok());
        assert!(ran.load(Ordering::SeqCst));
    }

    #[test]
    fn test_update_callback_autodequeues_on_false() {
        let dispatcher = MainThreadDispatcher::new();
        let calls = Arc::new(AtomicUsize::new(0));

        let calls_clone = Arc::clone(&calls);
        dispatcher
            .start_update(move || {
                calls_clone.fetch_add(1, Ordering::SeqCst);
                false
            })
            .expect("start_update failed");

        dispatcher.pump_update().expect("pump failed");
        dispatcher.pump_update().expect("pump failed");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_remove_update_by_handle() {
        let dispatcher = MainThreadDispatcher::new();
        let calls = Arc::new(AtomicUsize::new(0));

        let calls_clone = Arc::clone(&calls);
        let handle = dispatcher
            .start_update(move || {
                calls_clone.fetch_add(1, Ordering::SeqCst);
                true
            })
            .expect("start_update failed");

        dispatcher.pump_update().expect("pump failed");
        assert!(dispatcher.remove_update(handle).expect("remove failed"));
        dispatcher.pump_update().expect("pump failed");
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        // Removing again finds nothing.
        assert!(!dispatcher.remove_update(handle).expect("remove failed"));
    }

    #[test]
    fn test_registration_off_logic_thread_is_reported() {
        let dispatcher = Arc::new(MainThreadDispatcher::new());

        let background = {
            let dispatcher = Arc::clone(&dispatcher);
            thread::spawn(move || dispatcher.start_update(|| true))
        };
        let result = background.join().expect("background thread panicked");
        assert!(matches!(
            result,
            Err(ThreadingError::NotLogicThread {
                operation: "start_update"
            })
        ));
        // Nothing was silently queued.
        dispatcher.pump_update().expect("pump failed");
    }

    #[test]
    fn test_panicking_gui_callback_is_dequeued_others_survive() {
        let dispatcher = MainThreadDispatcher::new();
        let healthy_calls = Arc::new(AtomicUsize::new(0));

        dispatcher
            .start_gui(|| panic!("intentional test panic"))
            .expect("start_gui failed");
        let healthy_clone = Arc::clone(&healthy_calls);
        dispatcher
            .start_gui(move || {
                healthy_clone.fetch_add(1, Ordering::SeqCst);
            })
            .expect("start_gui failed");

        dispatcher.pump_gui().expect("pump failed");
        dispatcher.pump_gui().expect("pump failed");

        // The panicking callback ran once and was dropped; the healthy one
        // ran on both passes.
        assert_eq!(healthy_calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_batch_executes_before_update_callbacks_interleave() {
        let dispatcher = Arc::new(MainThreadDispatcher::new());
        let trace = Arc::new(Mutex::new(Vec::new()));

        let trace_clone = Arc::clone(&trace);
        dispatcher
            .start_update(move || {
                trace_clone.lock().push("update");
                true
            })
            .expect("start_update failed");

        let background = {
            let dispatcher = Arc::clone(&dispatcher);
            let trace = Arc::clone(&trace);
            thread::spawn(move || {
                let first = Arc::clone(&trace);
                let second = Arc::clone(&trace);
                dispatcher.invoke_batch(vec![
                    Box::new(move || first.lock().push("batch-a")),
                    Box::new(move || second.lock().push("batch-b")),
                ]);
            })
        };
        background.join().expect("background thread panicked");

        dispatcher.pump_update().expect("pump failed");

        // The batch ran whole before the update callback got its turn.
        let seen = trace.lock().clone();
        assert_eq!(seen, vec!["batch-a", "batch-b", "update"]);
    }
}
