//! Processors: named derivation units over tracked data.
//!
//! A processor wraps a user compute body (sync closure or async future
//! factory). Each run starts from a cleared dependency set and captures
//! whatever the body reads, so conditionally-read dependencies drop out on
//! the next run. Writes to captured dependencies mark the processor dirty
//! synchronously; the reconciliation scheduler then recomputes it in
//! `(priority, registration order)` position.
//!
//! Async bodies follow a suspension protocol: the scheduler polls the future
//! once inside the synchronous pass; a `Pending` poll parks the future with a
//! wake signal (`ProcessingPause`) and the processor leaves the dirty queue.
//! When the signal fires, the run resumes in a later cycle
//! (`ProcessingResume`), driven by a spawned task when a tokio runtime is
//! present or by the next `reconciliation()` call otherwise, until the
//! future completes (`ProcessingEnd`). Dirtying while suspended coalesces
//! into a single pending re-run; the same processor never runs twice
//! concurrently.

use std::{
    fmt,
    pin::Pin,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Weak,
    },
    task::{Context, Poll},
    time::Instant,
};

use futures::future::BoxFuture;
use fxhash::{FxHashMap, FxHashSet};
use parking_lot::Mutex;
use serde_json::json;
use tokio::sync::Notify;

use crate::{
    engine::EnvInner,
    error::{Error, Result},
    id::TraxId,
    log::EventKind,
    trackable::PropKey,
    value::Value,
};

/// A synchronous compute body.
pub type ComputeFn = Box<dyn FnMut() -> Result<()> + Send>;

/// An asynchronous compute body: a factory producing one future per run.
pub type AsyncComputeFn = Box<dyn FnMut() -> BoxFuture<'static, Result<()>> + Send>;

pub(crate) enum Body {
    Sync(ComputeFn),
    Async(AsyncComputeFn),
}

/// Creation-time attributes of a processor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessorOptions {
    /// Reconciliation order: lower priorities compute first.
    pub priority: i32,
    /// Renderer-class processors are deferred to a final phase of each pass,
    /// after every non-renderer processor has settled.
    pub renderer: bool,
    /// Whether the scheduler recomputes this processor automatically during
    /// reconciliation. Manual processors only run through
    /// [`Processor::compute`] with `force`.
    pub auto_compute: bool,
    /// Skip the immediate run at creation; the first computation happens
    /// during the next reconciliation instead.
    pub lazy: bool,
    /// Cap on successful computations. Once reached, further dirtying is
    /// ignored and the processor is effectively frozen; used for one-shot
    /// initializers.
    pub max_compute_count: Option<u32>,
}

impl Default for ProcessorOptions {
    fn default() -> Self {
        Self {
            priority: 0,
            renderer: false,
            auto_compute: true,
            lazy: false,
            max_compute_count: None,
        }
    }
}

/// Lifecycle state of a processor.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProcessorState {
    /// Not currently computing.
    Idle,
    /// A run is in progress on the current thread.
    Computing,
    /// A run is parked on an unresolved future.
    Suspended,
    /// Terminal: holds no dependencies, never runs again.
    Disposed,
}

pub(crate) struct WakeSignal {
    processor: TraxId,
    env: Weak<EnvInner>,
    pub(crate) woken: AtomicBool,
    pub(crate) notify: Notify,
    pub(crate) driven: AtomicBool,
}

impl WakeSignal {
    fn new(processor: TraxId, env: Weak<EnvInner>) -> Self {
        Self {
            processor,
            env,
            woken: AtomicBool::new(false),
            notify: Notify::new(),
            driven: AtomicBool::new(false),
        }
    }
}

impl futures::task::ArcWake for WakeSignal {
    fn wake_by_ref(arc_self: &Arc<Self>) {
        arc_self.woken.store(true, Ordering::SeqCst);
        if !arc_self.driven.load(Ordering::SeqCst) {
            if let Some(env) = arc_self.env.upgrade() {
                env.scheduler.note_woken(arc_self.processor.clone());
            }
        }
        arc_self.notify.notify_one();
    }
}

pub(crate) struct SuspendedRun {
    pub(crate) future: BoxFuture<'static, Result<()>>,
    pub(crate) signal: Arc<WakeSignal>,
}

pub(crate) struct ProcState {
    pub(crate) state: ProcessorState,
    pub(crate) dirty: bool,
    pub(crate) pending_rerun: bool,
    pub(crate) compute_count: u32,
    pub(crate) body: Option<Body>,
    pub(crate) suspended: Option<SuspendedRun>,
    pub(crate) deps: FxHashMap<TraxId, FxHashSet<PropKey>>,
    pub(crate) on_dirty: Option<Arc<dyn Fn() + Send + Sync>>,
}

pub(crate) struct ProcessorData {
    id: TraxId,
    key: u64,
    priority: i32,
    renderer: bool,
    auto_compute: bool,
    max_compute_count: Option<u32>,
    env: Weak<EnvInner>,
    pub(crate) state: Mutex<ProcState>,
}

/// Handle to a processor. Cheap to clone.
#[derive(Clone)]
pub struct Processor {
    pub(crate) data: Arc<ProcessorData>,
}

pub(crate) enum StepResult {
    Completed,
    Suspended,
}

impl Processor {
    /// The processor id (`<storeId>#<name>:<instance>`).
    #[must_use]
    pub fn id(&self) -> &TraxId {
        &self.data.id
    }

    /// Registration key; also the graph arena index and the tie-breaker in
    /// reconciliation order.
    pub(crate) fn key(&self) -> u64 {
        self.data.key
    }

    /// Reconciliation priority (lower runs first).
    #[must_use]
    pub fn priority(&self) -> i32 {
        self.data.priority
    }

    /// Whether this processor runs in the deferred renderer phase.
    #[must_use]
    pub fn is_renderer(&self) -> bool {
        self.data.renderer
    }

    /// Whether the scheduler recomputes this processor automatically.
    #[must_use]
    pub fn auto_compute(&self) -> bool {
        self.data.auto_compute
    }

    /// The computation cap, if any.
    #[must_use]
    pub fn max_compute_count(&self) -> Option<u32> {
        self.data.max_compute_count
    }

    /// Number of successfully completed computations.
    #[must_use]
    pub fn compute_count(&self) -> u32 {
        self.data.state.lock().compute_count
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> ProcessorState {
        self.data.state.lock().state
    }

    /// Whether a dependency changed since the last computation.
    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.data.state.lock().dirty
    }

    /// Whether the processor was disposed (or its environment torn down).
    #[must_use]
    pub fn is_disposed(&self) -> bool {
        self.data.env.strong_count() == 0 || self.state() == ProcessorState::Disposed
    }

    /// Sorted snapshot of the dependency set captured by the last run.
    #[must_use]
    pub fn dependencies(&self) -> Vec<(TraxId, String)> {
        let st = self.data.state.lock();
        let mut deps: Vec<(TraxId, String)> = st
            .deps
            .iter()
            .flat_map(|(id, keys)| keys.iter().map(move |k| (id.clone(), k.to_string())))
            .collect();
        drop(st);
        deps.sort();
        deps
    }

    /// Installs a callback invoked synchronously the instant the processor
    /// transitions from clean to dirty. Used by UI adapters to schedule
    /// external work without joining the reconciliation cycle.
    pub fn on_dirty(&self, callback: impl Fn() + Send + Sync + 'static) {
        self.data.state.lock().on_dirty = Some(Arc::new(callback));
    }

    /// Runs the compute body if the processor is dirty, not disposed, and
    /// either `force` is set or the processor is auto-computed. Ineligible
    /// calls emit a `ProcessorSkipped` event.
    pub fn compute(&self, force: bool) -> Result<()> {
        let env = self
            .data
            .env
            .upgrade()
            .ok_or_else(|| Error::ObjectDisposed(self.id().clone()))?;
        env.execute_processor(self, force)
    }

    /// Disposes the processor: drops its dependencies, cancels any suspended
    /// run (the parked future is dropped; a pending wake finds nothing to
    /// resume), and emits a `Dispose` event. Idempotent.
    pub fn dispose(&self) {
        let suspended = {
            let mut st = self.data.state.lock();
            if st.state == ProcessorState::Disposed {
                return;
            }
            st.state = ProcessorState::Disposed;
            st.dirty = false;
            st.pending_rerun = false;
            st.body = None;
            st.deps.clear();
            st.on_dirty = None;
            st.suspended.take()
        };
        if let Some(run) = suspended {
            // let a parked resumer task observe the disposal and exit
            run.signal.notify.notify_one();
        }
        if let Some(env) = self.data.env.upgrade() {
            env.graph.lock().clear_processor(self.key());
            env.registry.remove_processor(self.id(), self.key());
            env.log
                .append(EventKind::Dispose, json!({ "objectId": self.id().as_str() }));
        }
    }

    /// Clears the dirty flag without computing. Used when a reconciliation
    /// pass is aborted by loop detection.
    pub(crate) fn reset_dirty(&self) {
        self.data.state.lock().dirty = false;
    }

    /// Records a dependency captured during the current run.
    pub(crate) fn record_dep(&self, id: TraxId, key: PropKey) {
        self.data.state.lock().deps.entry(id).or_default().insert(key);
    }

    /// Marks the processor dirty because `cause` changed (or unconditionally
    /// for a coalesced re-run). Suspended processors coalesce; capped or
    /// disposed processors ignore the dirtying entirely.
    pub(crate) fn mark_dirty(
        &self,
        env: &Arc<EnvInner>,
        cause: Option<(&TraxId, &PropKey)>,
    ) {
        let callback = {
            let mut st = self.data.state.lock();
            if st.state == ProcessorState::Disposed {
                return;
            }
            if self
                .data
                .max_compute_count
                .map_or(false, |max| st.compute_count >= max)
            {
                return;
            }
            if st.state == ProcessorState::Suspended {
                st.pending_rerun = true;
                return;
            }
            if st.dirty {
                return;
            }
            st.dirty = true;
            st.on_dirty.clone()
        };
        let mut data = json!({ "processorId": self.id().as_str() });
        if let Some((object, key)) = cause {
            data["objectId"] = json!(object.as_str());
            data["propName"] = json!(key.to_string());
        }
        env.log.append(EventKind::ProcessorDirty, data);
        if let Some(callback) = callback {
            callback();
        }
        if self.data.auto_compute {
            env.scheduler.enqueue(self);
        }
    }
}

impl fmt::Debug for Processor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Processor")
            .field("id", &self.data.id)
            .field("priority", &self.data.priority)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl EnvInner {
    /// Creates and registers a processor. The caller decides whether to run
    /// it immediately (non-lazy creation) or leave it queued.
    pub(crate) fn create_processor(
        self: &Arc<Self>,
        id: TraxId,
        options: ProcessorOptions,
        body: Body,
    ) -> Processor {
        let key = self.next_order.fetch_add(1, Ordering::Relaxed);
        let processor = Processor {
            data: Arc::new(ProcessorData {
                id: id.clone(),
                key,
                priority: options.priority,
                renderer: options.renderer,
                auto_compute: options.auto_compute,
                max_compute_count: options.max_compute_count,
                env: Arc::downgrade(self),
                state: Mutex::new(ProcState {
                    state: ProcessorState::Idle,
                    dirty: true,
                    pending_rerun: false,
                    compute_count: 0,
                    body: Some(body),
                    suspended: None,
                    deps: FxHashMap::default(),
                    on_dirty: None,
                }),
            }),
        };
        self.registry.insert_processor(processor.clone());
        self.log.append(
            EventKind::New,
            json!({ "objectId": id.as_str(), "objectKind": "processor" }),
        );
        processor
    }

    /// Runs one computation of `processor` if it is eligible.
    pub(crate) fn execute_processor(
        self: &Arc<Self>,
        processor: &Processor,
        force: bool,
    ) -> Result<()> {
        let body = {
            let mut st = processor.data.state.lock();
            if st.state == ProcessorState::Disposed {
                return Err(Error::ObjectDisposed(processor.id().clone()));
            }
            let capped = processor
                .data
                .max_compute_count
                .map_or(false, |max| st.compute_count >= max);
            let eligible = st.dirty
                && !capped
                && (force || processor.data.auto_compute)
                && st.state == ProcessorState::Idle
                && st.body.is_some();
            if !eligible {
                drop(st);
                self.log.append(
                    EventKind::ProcessorSkipped,
                    json!({ "processorId": processor.id().as_str() }),
                );
                return Ok(());
            }
            st.dirty = false;
            st.state = ProcessorState::Computing;
            st.deps.clear();
            st.body.take()
        };
        let Some(body) = body else {
            return Ok(());
        };
        self.graph.lock().clear_processor(processor.key());
        self.log.append(
            EventKind::ProcessingStart,
            json!({ "processorId": processor.id().as_str() }),
        );
        let started = Instant::now();
        match body {
            Body::Sync(mut compute) => {
                self.scheduler.push_active(processor.clone());
                let result = compute();
                self.scheduler.pop_active();
                let rerun = {
                    let mut st = processor.data.state.lock();
                    if st.state == ProcessorState::Disposed {
                        // disposed from inside its own body: stay disposed
                        self.log.add_compute_time(started.elapsed());
                        return Ok(());
                    }
                    st.body = Some(Body::Sync(compute));
                    st.state = ProcessorState::Idle;
                    if result.is_ok() {
                        st.compute_count += 1;
                    }
                    std::mem::take(&mut st.pending_rerun)
                };
                self.finish_run(processor, result, rerun);
            }
            Body::Async(mut factory) => {
                self.scheduler.push_active(processor.clone());
                let future = factory();
                self.scheduler.pop_active();
                {
                    let mut st = processor.data.state.lock();
                    if st.state != ProcessorState::Disposed {
                        st.body = Some(Body::Async(factory));
                    }
                }
                let signal = Arc::new(WakeSignal::new(
                    processor.id().clone(),
                    Arc::downgrade(self),
                ));
                if matches!(
                    self.poll_processor(processor, future, signal.clone()),
                    StepResult::Suspended
                ) {
                    self.spawn_resumer(processor.clone(), signal);
                }
            }
        }
        self.log.add_compute_time(started.elapsed());
        Ok(())
    }

    /// One poll of an async run, with the processor active for dependency
    /// capture.
    fn poll_processor(
        self: &Arc<Self>,
        processor: &Processor,
        mut future: BoxFuture<'static, Result<()>>,
        signal: Arc<WakeSignal>,
    ) -> StepResult {
        let waker = futures::task::waker(signal.clone());
        let mut cx = Context::from_waker(&waker);
        self.scheduler.push_active(processor.clone());
        let polled = future.as_mut().poll(&mut cx);
        self.scheduler.pop_active();
        match polled {
            Poll::Ready(result) => {
                let rerun = {
                    let mut st = processor.data.state.lock();
                    if st.state == ProcessorState::Disposed {
                        return StepResult::Completed;
                    }
                    st.state = ProcessorState::Idle;
                    st.suspended = None;
                    if result.is_ok() {
                        st.compute_count += 1;
                    }
                    std::mem::take(&mut st.pending_rerun)
                };
                self.finish_run(processor, result, rerun);
                StepResult::Completed
            }
            Poll::Pending => {
                {
                    let mut st = processor.data.state.lock();
                    if st.state == ProcessorState::Disposed {
                        return StepResult::Completed;
                    }
                    st.state = ProcessorState::Suspended;
                    st.suspended = Some(SuspendedRun { future, signal });
                }
                self.log.append(
                    EventKind::ProcessingPause,
                    json!({ "processorId": processor.id().as_str() }),
                );
                StepResult::Suspended
            }
        }
    }

    fn finish_run(self: &Arc<Self>, processor: &Processor, result: Result<()>, rerun: bool) {
        match result {
            Ok(()) => {
                self.log.append(
                    EventKind::ProcessingEnd,
                    json!({ "processorId": processor.id().as_str() }),
                );
            }
            Err(error) => {
                self.log.append(
                    EventKind::Error,
                    json!({
                        "processorId": processor.id().as_str(),
                        "message": error.to_string(),
                    }),
                );
            }
        }
        if rerun {
            processor.mark_dirty(self, None);
        }
    }

    /// Resumes a suspended run for one poll. Returns `true` when the run is
    /// over (completed, disposed, or nothing to resume).
    pub(crate) fn resume_once(self: &Arc<Self>, processor: &Processor) -> bool {
        let run = {
            let mut st = processor.data.state.lock();
            if st.state != ProcessorState::Suspended {
                return true;
            }
            let Some(run) = st.suspended.take() else {
                return true;
            };
            st.state = ProcessorState::Computing;
            run
        };
        run.signal.woken.store(false, Ordering::SeqCst);
        self.log.append(
            EventKind::ProcessingResume,
            json!({ "processorId": processor.id().as_str() }),
        );
        let started = Instant::now();
        let step = self.poll_processor(processor, run.future, run.signal);
        self.log.add_compute_time(started.elapsed());
        matches!(step, StepResult::Completed)
    }

    /// Resumes a suspended processor under the pass lock and drains whatever
    /// the resumption dirtied; the resumption's events form a new cycle.
    pub(crate) async fn resume_processor(self: &Arc<Self>, processor: &Processor) -> bool {
        let _guard = self.scheduler.pass_lock.lock().await;
        let done = self.resume_once(processor);
        // loop detection inside the drain is already logged on the stream
        let _ = self.run_pass_locked();
        done
    }

    fn spawn_resumer(self: &Arc<Self>, processor: Processor, signal: Arc<WakeSignal>) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            // no runtime: woken futures get resumed by the next reconciliation
            return;
        };
        signal.driven.store(true, Ordering::SeqCst);
        let env = self.clone();
        handle.spawn(async move {
            loop {
                signal.notify.notified().await;
                if processor.is_disposed() {
                    break;
                }
                if env.resume_processor(&processor).await {
                    break;
                }
            }
        });
    }
}

/// Future adaptor bracketing an [`AsyncFn`](crate::store::AsyncFn) call with
/// pause/resume events, mirroring the processor suspension protocol on the
/// stream.
pub(crate) struct Traced {
    env: Weak<EnvInner>,
    id: TraxId,
    paused: bool,
    inner: BoxFuture<'static, Result<Value>>,
}

impl Traced {
    pub(crate) fn new(
        env: Weak<EnvInner>,
        id: TraxId,
        inner: BoxFuture<'static, Result<Value>>,
    ) -> Self {
        Self { env, id, paused: false, inner }
    }
}

impl std::future::Future for Traced {
    type Output = Result<Value>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let env = this.env.upgrade();
        if this.paused {
            if let Some(env) = &env {
                env.log.append(
                    EventKind::ProcessingResume,
                    json!({ "processorId": this.id.as_str() }),
                );
            }
            this.paused = false;
        }
        match this.inner.as_mut().poll(cx) {
            Poll::Ready(result) => Poll::Ready(result),
            Poll::Pending => {
                if let Some(env) = &env {
                    env.log.append(
                        EventKind::ProcessingPause,
                        json!({ "processorId": this.id.as_str() }),
                    );
                }
                this.paused = true;
                Poll::Pending
            }
        }
    }
}
