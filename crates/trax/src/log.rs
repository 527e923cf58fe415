//! Append-only, cycle-scoped event stream.
//!
//! Every observable engine action (reads during computation, writes,
//! creations, disposals, processor lifecycle transitions) is appended here as
//! a [`StreamEvent`], grouped into numbered cycles. A cycle opens lazily on
//! the first event after the previous completion and closes when a
//! reconciliation pass finishes, so all mutations between two passes are
//! attributed to the same cycle.
//!
//! Consumers have four access modes:
//!
//! - [`Log::subscribe`]: synchronous callback on every matching append
//! - [`Log::scan`]: replay of all retained events
//! - [`Log::await_event`]: future resolving on the next matching event
//! - [`Log::event`] / [`Log::info`] / [`Log::warning`] / [`Log::error`]:
//!   application-level entries sharing the same stream
//!
//! Event kinds carry compact wire codes (`!SET`, `!CS`, ...). Custom
//! application kinds must not start with `!`.

use std::{
    collections::VecDeque,
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use fxhash::FxHashMap;
use parking_lot::Mutex;
use serde_json::json;
use tokio::sync::oneshot;

use crate::error::{Error, Result};


/// The kind of a [`StreamEvent`].
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum EventKind {
    /// A reconciliation cycle opened (`!CS`).
    CycleStart,
    /// A reconciliation cycle completed (`!CC`); payload carries elapsed wall
    /// time and summed compute time in milliseconds.
    CycleComplete,
    /// A store, container, or processor was created (`!NEW`).
    New,
    /// A store, container, or processor was disposed (`!DEL`).
    Dispose,
    /// A property was read while a processor was active (`!GET`).
    Get,
    /// A property was written (`!SET`).
    Set,
    /// A processor transitioned from clean to dirty (`!DRT`).
    ProcessorDirty,
    /// A processor was asked to compute but was not eligible (`!SKP`).
    ProcessorSkipped,
    /// A processor computation started (`!PCS`).
    ProcessingStart,
    /// A processor suspended on an unresolved future (`!PCP`).
    ProcessingPause,
    /// A suspended processor resumed in a later cycle (`!PCR`).
    ProcessingResume,
    /// A processor computation completed (`!PCE`).
    ProcessingEnd,
    /// An `update_array` group header (`!AUP`).
    ArrayUpdate,
    /// An `update_dictionary` group header (`!DUP`).
    DictionaryUpdate,
    /// An error entry; recovered compute failures land here (`!ERR`).
    Error,
    /// A warning entry (`!WRN`).
    Warning,
    /// An informational entry (`!NFO`).
    Info,
    /// An application-defined event; the code is the application's own kind
    /// string (must not start with `!`).
    Custom(Arc<str>),
}

impl EventKind {
    /// The compact wire code for this kind, as matched by subscription
    /// patterns.
    #[must_use]
    pub fn code(&self) -> &str {
        match self {
            EventKind::CycleStart => "!CS",
            EventKind::CycleComplete => "!CC",
            EventKind::New => "!NEW",
            EventKind::Dispose => "!DEL",
            EventKind::Get => "!GET",
            EventKind::Set => "!SET",
            EventKind::ProcessorDirty => "!DRT",
            EventKind::ProcessorSkipped => "!SKP",
            EventKind::ProcessingStart => "!PCS",
            EventKind::ProcessingPause => "!PCP",
            EventKind::ProcessingResume => "!PCR",
            EventKind::ProcessingEnd => "!PCE",
            EventKind::ArrayUpdate => "!AUP",
            EventKind::DictionaryUpdate => "!DUP",
            EventKind::Error => "!ERR",
            EventKind::Warning => "!WRN",
            EventKind::Info => "!NFO",
            EventKind::Custom(code) => code,
        }
    }
}

/// Position of an event in the stream: `<cycle>:<seq>`. Total order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EventId {
    /// Cycle number, strictly increasing across cycles.
    pub cycle: u64,
    /// Sequence within the cycle, strictly increasing.
    pub seq: u32,
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.cycle, self.seq)
    }
}

/// One entry of the event stream.
#[derive(Clone, Debug)]
pub struct StreamEvent {
    /// Stream position.
    pub id: EventId,
    /// Event kind.
    pub kind: EventKind,
    /// Structured payload. The devtools transport serializes this as JSON;
    /// the schema is an external concern.
    pub data: serde_json::Value,
}

/// Handle returned by [`Log::subscribe`], used to unsubscribe.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type SubscriberFn = Arc<dyn Fn(&StreamEvent) + Send + Sync>;
type MatcherFn = Box<dyn Fn(&StreamEvent) -> bool + Send>;

struct Subscriber {
    pattern: Arc<str>,
    callback: SubscriberFn,
}

struct Awaiter {
    pattern: Arc<str>,
    matcher: Option<MatcherFn>,
    tx: oneshot::Sender<StreamEvent>,
}

struct ClosedCycle {
    number: u64,
    events: Vec<StreamEvent>,
}

struct OpenCycle {
    number: u64,
    next_seq: u32,
    events: Vec<StreamEvent>,
    opened_at: Instant,
    compute_time: Duration,
}

struct StreamState {
    retained: VecDeque<ClosedCycle>,
    open: Option<OpenCycle>,
    next_cycle: u64,
    awaiters: Vec<Awaiter>,
}

/// The event stream of one trax environment. Cheap to clone.
#[derive(Clone)]
pub struct Log {
    inner: Arc<LogInner>,
}

struct LogInner {
    retain: usize,
    state: Mutex<StreamState>,
    subscribers: Mutex<FxHashMap<u64, Subscriber>>,
    next_subscription: AtomicU64,
}

fn matches(pattern: &str, event: &StreamEvent) -> bool {
    pattern == "*" || event.kind.code() == pattern
}

impl Log {
    pub(crate) fn new(retain: usize) -> Self {
        Self {
            inner: Arc::new(LogInner {
                retain: retain.max(1),
                state: Mutex::new(StreamState {
                    retained: VecDeque::new(),
                    open: None,
                    next_cycle: 0,
                    awaiters: Vec::new(),
                }),
                subscribers: Mutex::new(FxHashMap::default()),
                next_subscription: AtomicU64::new(1),
            }),
        }
    }

    /// Appends an engine event, opening a cycle if none is open, and returns
    /// its position.
    pub(crate) fn append(&self, kind: EventKind, data: serde_json::Value) -> EventId {
        let mut dispatch = Vec::with_capacity(2);
        let id = {
            let mut state = self.inner.state.lock();
            Self::ensure_open(&mut state, &mut dispatch);
            let open = state.open.as_mut().expect("cycle just opened");
            let event = StreamEvent {
                id: EventId { cycle: open.number, seq: open.next_seq },
                kind,
                data,
            };
            open.next_seq += 1;
            open.events.push(event.clone());
            dispatch.push(event.clone());
            Self::resolve_awaiters(&mut state, &dispatch);
            event.id
        };
        self.dispatch(&dispatch);
        id
    }

    fn ensure_open(state: &mut StreamState, dispatch: &mut Vec<StreamEvent>) {
        if state.open.is_some() {
            return;
        }
        let number = state.next_cycle;
        state.next_cycle += 1;
        let start = StreamEvent {
            id: EventId { cycle: number, seq: 0 },
            kind: EventKind::CycleStart,
            data: json!({}),
        };
        state.open = Some(OpenCycle {
            number,
            next_seq: 1,
            events: vec![start.clone()],
            opened_at: Instant::now(),
            compute_time: Duration::ZERO,
        });
        dispatch.push(start);
    }

    /// Closes the open cycle, if any, appending its `CycleComplete` event.
    pub(crate) fn cycle_complete(&self) {
        let mut dispatch = Vec::with_capacity(1);
        {
            let mut state = self.inner.state.lock();
            let Some(mut open) = state.open.take() else {
                return;
            };
            let complete = StreamEvent {
                id: EventId { cycle: open.number, seq: open.next_seq },
                kind: EventKind::CycleComplete,
                data: json!({
                    "elapsedTime": open.opened_at.elapsed().as_secs_f64() * 1e3,
                    "computeTime": open.compute_time.as_secs_f64() * 1e3,
                }),
            };
            open.events.push(complete.clone());
            dispatch.push(complete);
            state
                .retained
                .push_back(ClosedCycle { number: open.number, events: open.events });
            while state.retained.len() > self.inner.retain {
                state.retained.pop_front();
            }
            Self::resolve_awaiters(&mut state, &dispatch);
        }
        self.dispatch(&dispatch);
    }

    /// Credits compute time to the open cycle.
    pub(crate) fn add_compute_time(&self, elapsed: Duration) {
        if let Some(open) = self.inner.state.lock().open.as_mut() {
            open.compute_time += elapsed;
        }
    }

    pub(crate) fn has_open_cycle(&self) -> bool {
        self.inner.state.lock().open.is_some()
    }

    fn resolve_awaiters(state: &mut StreamState, appended: &[StreamEvent]) {
        if state.awaiters.is_empty() {
            return;
        }
        let mut kept = Vec::with_capacity(state.awaiters.len());
        'awaiters: for awaiter in state.awaiters.drain(..) {
            for event in appended {
                let hit = matches(&awaiter.pattern, event)
                    && awaiter.matcher.as_ref().map_or(true, |m| m(event));
                if hit {
                    // receiver may have been dropped; nothing to do then
                    let _ = awaiter.tx.send(event.clone());
                    continue 'awaiters;
                }
            }
            kept.push(awaiter);
        }
        state.awaiters = kept;
    }

    fn dispatch(&self, events: &[StreamEvent]) {
        if events.is_empty() {
            return;
        }
        // snapshot under the lock, call outside it so callbacks may re-enter
        let subscribers: Vec<(Arc<str>, SubscriberFn)> = self
            .inner
            .subscribers
            .lock()
            .values()
            .map(|s| (s.pattern.clone(), s.callback.clone()))
            .collect();
        for event in events {
            for (pattern, callback) in &subscribers {
                if matches(pattern, event) {
                    callback(event);
                }
            }
        }
    }

    /// Registers a synchronous subscriber. `pattern` is either `"*"` or an
    /// exact event code (`"!SET"`, `"@app/message"`, ...). The callback runs
    /// on the thread performing the append, after internal locks are
    /// released.
    pub fn subscribe(
        &self,
        pattern: impl Into<Arc<str>>,
        callback: impl Fn(&StreamEvent) + Send + Sync + 'static,
    ) -> SubscriptionId {
        let id = self.inner.next_subscription.fetch_add(1, Ordering::Relaxed);
        self.inner.subscribers.lock().insert(
            id,
            Subscriber { pattern: pattern.into(), callback: Arc::new(callback) },
        );
        SubscriptionId(id)
    }

    /// Removes a subscriber. Returns `false` if the id was already gone.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.inner.subscribers.lock().remove(&id.0).is_some()
    }

    /// Replays all retained events (oldest first, including the open cycle)
    /// through `scanner` until it returns `false`.
    pub fn scan(&self, mut scanner: impl FnMut(&StreamEvent) -> bool) {
        let snapshot: Vec<StreamEvent> = {
            let state = self.inner.state.lock();
            state
                .retained
                .iter()
                .flat_map(|c| c.events.iter())
                .chain(state.open.iter().flat_map(|c| c.events.iter()))
                .cloned()
                .collect()
        };
        for event in &snapshot {
            if !scanner(event) {
                break;
            }
        }
    }

    /// Resolves with the next event matching `pattern`.
    pub async fn await_event(&self, pattern: impl Into<Arc<str>>) -> StreamEvent {
        self.register_awaiter(pattern.into(), None)
            .await
            .expect("event stream closed")
    }

    /// Resolves with the next event matching `pattern` for which `matcher`
    /// returns `true`.
    pub async fn await_event_matching(
        &self,
        pattern: impl Into<Arc<str>>,
        matcher: impl Fn(&StreamEvent) -> bool + Send + 'static,
    ) -> StreamEvent {
        self.register_awaiter(pattern.into(), Some(Box::new(matcher)))
            .await
            .expect("event stream closed")
    }

    fn register_awaiter(
        &self,
        pattern: Arc<str>,
        matcher: Option<MatcherFn>,
    ) -> oneshot::Receiver<StreamEvent> {
        let (tx, rx) = oneshot::channel();
        self.inner
            .state
            .lock()
            .awaiters
            .push(Awaiter { pattern, matcher, tx });
        rx
    }

    /// Appends an application-defined event. Kinds starting with `!` are
    /// reserved for the engine; such a call is logged as an `Error` entry
    /// instead of polluting the reserved namespace.
    pub fn event(&self, kind: &str, data: serde_json::Value) -> EventId {
        if kind.starts_with('!') {
            return self.append(
                EventKind::Error,
                json!({ "message": format!("event kind `{kind}` uses the reserved `!` prefix") }),
            );
        }
        self.append(EventKind::Custom(Arc::from(kind)), data)
    }

    /// Appends an informational entry.
    pub fn info(&self, message: impl fmt::Display) -> EventId {
        self.append(EventKind::Info, json!({ "message": message.to_string() }))
    }

    /// Appends a warning entry.
    pub fn warning(&self, message: impl fmt::Display) -> EventId {
        self.append(EventKind::Warning, json!({ "message": message.to_string() }))
    }

    /// Appends an error entry.
    pub fn error(&self, message: impl fmt::Display) -> EventId {
        self.append(EventKind::Error, json!({ "message": message.to_string() }))
    }

    /// Consumer-side integrity check: retained cycle numbers must be
    /// consecutive. Returns [`Error::InvalidCycleSequence`] on the first gap.
    pub fn verify_cycle_sequence(&self) -> Result<()> {
        let state = self.inner.state.lock();
        let numbers = state
            .retained
            .iter()
            .map(|c| c.number)
            .chain(state.open.iter().map(|c| c.number));
        let mut expected = None;
        for number in numbers {
            if let Some(expected) = expected {
                if number != expected {
                    return Err(Error::InvalidCycleSequence { expected, found: number });
                }
            }
            expected = Some(number + 1);
        }
        Ok(())
    }
}

impl fmt::Debug for Log {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("Log")
            .field("retained_cycles", &state.retained.len())
            .field("open_cycle", &state.open.as_ref().map(|c| c.number))
            .finish_non_exhaustive()
    }
}
