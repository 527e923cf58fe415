//! Reconciliation scheduling.
//!
//! Dirty auto-computed processors queue up in `(priority, registration
//! order)` position; renderer-class processors queue separately and only run
//! once the main queue is empty. A pass drains breadth-first (processors
//! dirtied during the pass join the same pass), bounded by a compute cap
//! that turns runaway dependency loops into
//! [`Error::ReconciliationLoopDetected`].
//!
//! One async pass lock serializes everything that executes user bodies:
//! reconciliation passes and suspended-run resumptions alike. Concurrent
//! `reconciliation()` callers therefore all observe completion of the
//! in-flight pass. The lock is held only across synchronous work; a body's
//! `Pending` poll parks it and the pass moves on.

use std::collections::BTreeSet;

use parking_lot::Mutex;
use serde_json::json;

use crate::{
    engine::EnvInner,
    error::{Error, Result},
    id::TraxId,
    log::EventKind,
    processor::Processor,
};

#[derive(Clone, PartialEq, Eq, PartialOrd, Ord)]
struct QueueKey {
    priority: i32,
    order: u64,
    id: TraxId,
}

#[derive(Default)]
struct SchedState {
    queue: BTreeSet<QueueKey>,
    renderers: BTreeSet<QueueKey>,
    active: Vec<Processor>,
    woken: Vec<TraxId>,
}

pub(crate) struct Scheduler {
    pub(crate) pass_lock: tokio::sync::Mutex<()>,
    state: Mutex<SchedState>,
}

impl Scheduler {
    pub(crate) fn new() -> Self {
        Self {
            pass_lock: tokio::sync::Mutex::new(()),
            state: Mutex::new(SchedState::default()),
        }
    }

    pub(crate) fn enqueue(&self, processor: &Processor) {
        let key = QueueKey {
            priority: processor.priority(),
            order: processor.key(),
            id: processor.id().clone(),
        };
        let mut state = self.state.lock();
        if processor.is_renderer() {
            state.renderers.insert(key);
        } else {
            state.queue.insert(key);
        }
    }

    /// Next processor to run: the whole non-renderer queue drains before any
    /// renderer is considered.
    pub(crate) fn pop_next(&self) -> Option<TraxId> {
        let mut state = self.state.lock();
        let next = state
            .queue
            .iter()
            .next()
            .or_else(|| state.renderers.iter().next())?
            .clone();
        state.queue.remove(&next);
        state.renderers.remove(&next);
        Some(next.id)
    }

    pub(crate) fn has_pending(&self) -> bool {
        let state = self.state.lock();
        !state.queue.is_empty() || !state.renderers.is_empty()
    }

    /// Drops every queued entry, returning the ids so the caller can re-arm
    /// their dirty flags (a dirty-but-unqueued processor would otherwise
    /// ignore all future dirtying).
    pub(crate) fn clear_queues(&self) -> Vec<TraxId> {
        let mut state = self.state.lock();
        let drained = state
            .queue
            .iter()
            .chain(state.renderers.iter())
            .map(|key| key.id.clone())
            .collect();
        state.queue.clear();
        state.renderers.clear();
        drained
    }

    /// Records a wake-up of a suspended processor that has no driving task
    /// (no tokio runtime was available at suspension time).
    pub(crate) fn note_woken(&self, id: TraxId) {
        self.state.lock().woken.push(id);
    }

    pub(crate) fn take_woken(&self) -> Vec<TraxId> {
        std::mem::take(&mut self.state.lock().woken)
    }

    pub(crate) fn push_active(&self, processor: Processor) {
        self.state.lock().active.push(processor);
    }

    pub(crate) fn pop_active(&self) {
        self.state.lock().active.pop();
    }

    /// The processor currently executing, if any (innermost for nested
    /// computations).
    pub(crate) fn active_processor(&self) -> Option<Processor> {
        self.state.lock().active.last().cloned()
    }

    pub(crate) fn active_top_key(&self) -> Option<u64> {
        self.state.lock().active.last().map(Processor::key)
    }
}

impl EnvInner {
    /// Drains the dirty queues and closes the cycle. Caller must hold the
    /// pass lock.
    pub(crate) fn run_pass_locked(self: &std::sync::Arc<Self>) -> Result<()> {
        // resume suspended runs that were woken without a driving task
        for id in self.scheduler.take_woken() {
            if let Some(processor) = self.registry.get_processor(&id) {
                self.resume_once(&processor);
            }
        }
        let cap = self.config.reconciliation_loop_cap;
        let mut computed = 0u32;
        while let Some(id) = self.scheduler.pop_next() {
            let Some(processor) = self.registry.get_processor(&id) else {
                continue;
            };
            if processor.is_disposed() || !processor.is_dirty() {
                continue;
            }
            computed += 1;
            if computed > cap {
                tracing::debug!(cap, processor = %id, "reconciliation loop detected");
                // interrupted processors skip this round; resetting their
                // dirty flags lets the next write re-arm them
                processor.reset_dirty();
                for stale in self.scheduler.clear_queues() {
                    if let Some(stale) = self.registry.get_processor(&stale) {
                        stale.reset_dirty();
                    }
                }
                self.log.append(
                    EventKind::Error,
                    json!({
                        "message": format!(
                            "reconciliation loop detected: more than {cap} computations in one pass"
                        ),
                    }),
                );
                if self.log.has_open_cycle() {
                    self.log.cycle_complete();
                }
                return Err(Error::ReconciliationLoopDetected(cap));
            }
            // disposed-processor errors cannot occur here: liveness was just
            // checked and the pass lock keeps user bodies sequential
            let _ = self.execute_processor(&processor, false);
        }
        tracing::trace!(computed, "reconciliation pass drained");
        if self.log.has_open_cycle() {
            self.log.cycle_complete();
        }
        Ok(())
    }

    /// Runs a reconciliation pass, serialized with every other pass and
    /// resumption. Resolves once the in-flight pass (if any) and this pass
    /// complete; suspended processors do not block completion.
    pub(crate) async fn reconciliation(self: &std::sync::Arc<Self>) -> Result<()> {
        let _guard = self.scheduler.pass_lock.lock().await;
        self.run_pass_locked()
    }
}
