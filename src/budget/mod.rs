//! Frame-budgeted cooperative queue.
//!
//! A single-threaded scheduler for expensive, interruptible logic-thread
//! work. Entries drain strictly FIFO under a per-tick wall-clock budget so a
//! large deferred batch (say, scanning a big grid) never stalls the frame
//! deadline. A resumable step sequence owns the head of the queue until it
//! is exhausted; later entries never interleave with it.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

type DeferredAction = Box<dyn FnOnce()>;
type StepSequence = Box<dyn Iterator<Item = ()>>;

enum Entry {
    Action(DeferredAction),
    Steps(StepSequence),
}

/// Snapshot of queue counters.
#[derive(Debug, Clone, Default)]
pub struct BudgetStats {
    pub actions_run: u64,
    pub steps_run: u64,
    /// Ticks that stopped early because the budget ran out.
    pub budget_yields: u64,
    /// Entries dropped by [`BudgetedQueue::clear`].
    pub cleared: u64,
}

/// Cooperative FIFO of deferred logic-thread work.
///
/// The host calls [`pump`] once per tick. Each pump makes at least one unit
/// of progress (one action, or one step of the head sequence), then keeps
/// going until the budget is spent. A single action always runs to
/// completion; it is never preempted mid-action.
///
/// [`pump`]: BudgetedQueue::pump
pub struct BudgetedQueue {
    entries: VecDeque<Entry>,
    budget: Duration,
    stats: BudgetStats,
}

impl BudgetedQueue {
    pub fn new(budget: Duration) -> Self {
        Self {
            entries: VecDeque::new(),
            budget,
            stats: BudgetStats::default(),
        }
    }

    /// Appends a one-shot action.
    pub fn queue_action(&mut self, action: impl FnOnce() + 'static) {
        self.entries.push_back(Entry::Action(Box::new(action)));
    }

    /// Appends a resumable multi-step unit. Each `next()` call is one step;
    /// the sequence is advanced incrementally across ticks.
    pub fn queue_steps(&mut self, steps: impl Iterator<Item = ()> + 'static) {
        self.entries.push_back(Entry::Steps(Box::new(steps)));
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drops every pending entry immediately. An in-progress step sequence
    /// is abandoned without a completion signal.
    pub fn clear(&mut self) {
        if !self.entries.is_empty() {
            log::debug!("[BudgetedQueue] clearing {} pending entries", self.entries.len());
        }
        self.stats.cleared += self.entries.len() as u64;
        self.entries.clear();
    }

    /// Advances the queue for one tick, bounded by the configured budget.
    pub fn pump(&mut self) {
        if self.entries.is_empty() {
            return;
        }
        let start = Instant::now();

        loop {
            let entry = match self.entries.pop_front() {
                Some(entry) => entry,
                None => break,
            };

            match entry {
                Entry::Action(action) => {
                    action();
                    self.stats.actions_run += 1;
                }
                Entry::Steps(mut steps) => {
                    let mut advanced = false;
                    let mut exhausted = false;
                    loop {
                        if steps.next().is_none() {
                            exhausted = true;
                            break;
                        }
                        advanced = true;
                        self.stats.steps_run += 1;
                        if start.elapsed() >= self.budget {
                            break;
                        }
                    }
                    if !exhausted {
                        // Unfinished sequence keeps the head slot.
                        self.entries.push_front(Entry::Steps(steps));
                    } else if !advanced {
                        // The sequence ended without doing work this tick;
                        // discovering that is not progress, so move on to
                        // the next entry without charging the budget check.
                        continue;
                    }
                }
            }

            if start.elapsed() >= self.budget {
                if !self.entries.is_empty() {
                    self.stats.budget_yields += 1;
                }
                break;
            }
        }
    }

    pub fn stats(&self) -> BudgetStats {
        self.stats.clone()
    }
}
