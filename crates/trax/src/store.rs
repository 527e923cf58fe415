//! Stores: namespaces owning a tree of tracked containers and processors.
//!
//! A store is created through [`Trax::create_store`](crate::Trax::create_store)
//! with an init callback that sets up the root object and registers
//! processors. Disposal cascades: every container and processor the store
//! owns is disposed with it.

use std::sync::{Arc, Weak};

use futures::future::BoxFuture;
use fxhash::FxHashMap;
use parking_lot::Mutex;
use serde_json::json;

use crate::{
    engine::EnvInner,
    error::{Error, Result},
    id::TraxId,
    log::EventKind,
    processor::{
        AsyncComputeFn, Body, ComputeFn, Processor, ProcessorOptions, Traced,
    },
    trackable::{Trackable, TraxObject},
    value::Value,
};

/// Optional lifecycle processors attached at [`Store::init_with`] /
/// [`Store::add_with`] time.
///
/// `on_init` runs exactly once, synchronously, before the call returns
/// (`max_compute_count = 1`); `on_init_async` is its suspendable counterpart;
/// `on_change` is a standing processor recomputed on every dependency change.
#[derive(Default)]
pub struct InitOptions {
    /// One-shot synchronous initializer.
    pub on_init: Option<ComputeFn>,
    /// One-shot asynchronous initializer.
    pub on_init_async: Option<AsyncComputeFn>,
    /// Standing change processor.
    pub on_change: Option<ComputeFn>,
}

#[derive(Default)]
struct StoreState {
    disposed: bool,
    root: Option<TraxObject>,
    trackables: Vec<TraxId>,
    processors: Vec<TraxId>,
    live_by_name: FxHashMap<String, TraxId>,
    instances: FxHashMap<String, u32>,
    data_by_path: FxHashMap<String, TraxId>,
}

pub(crate) struct StoreData {
    id: Arc<str>,
    env: Weak<EnvInner>,
    state: Mutex<StoreState>,
}

/// Handle to a store. Cheap to clone.
#[derive(Clone)]
pub struct Store {
    data: Arc<StoreData>,
}

pub(crate) fn create_store(
    env: &Arc<EnvInner>,
    prefix: &str,
    init: impl FnOnce(&Store) -> Result<()>,
) -> Result<Store> {
    let id = env.registry.claim_store_id(prefix);
    let store = Store {
        data: Arc::new(StoreData {
            id: id.clone(),
            env: Arc::downgrade(env),
            state: Mutex::new(StoreState::default()),
        }),
    };
    env.registry.insert_store(store.clone());
    env.log.append(
        EventKind::New,
        json!({ "objectId": &*id, "objectKind": "store" }),
    );
    if let Err(error) = init(&store) {
        store.dispose();
        return Err(error);
    }
    if store.data.state.lock().root.is_none() {
        env.log
            .warning(format!("store `{id}` was not initialized; creating an empty root"));
        store.init(Value::Object(Vec::new()))?;
    }
    Ok(store)
}

impl Store {
    /// The store id (possibly suffix-disambiguated from the requested
    /// prefix).
    #[must_use]
    pub fn id(&self) -> &str {
        &self.data.id
    }

    /// Whether the store (or its environment) has been disposed.
    #[must_use]
    pub fn is_disposed(&self) -> bool {
        self.data.env.strong_count() == 0 || self.data.state.lock().disposed
    }

    fn env(&self) -> Result<Arc<EnvInner>> {
        self.data
            .env
            .upgrade()
            .ok_or_else(|| Error::ObjectDisposed(TraxId::from(&*self.data.id)))
    }

    fn store_trax_id(&self) -> TraxId {
        TraxId::from(&*self.data.id)
    }

    /// Initializes the root object from an object literal. Calling `init` on
    /// an already-initialized store logs a warning and returns the existing
    /// root.
    pub fn init(&self, seed: Value) -> Result<TraxObject> {
        self.init_with(seed, InitOptions::default())
    }

    /// [`init`](Self::init) with lifecycle processors.
    pub fn init_with(&self, seed: Value, options: InitOptions) -> Result<TraxObject> {
        let env = self.env()?;
        {
            let st = self.data.state.lock();
            if st.disposed {
                return Err(Error::ObjectDisposed(self.store_trax_id()));
            }
            if let Some(root) = &st.root {
                let root = root.clone();
                drop(st);
                env.log
                    .warning(format!("store `{}` is already initialized", self.data.id));
                return Ok(root);
            }
        }
        let root_id = TraxId::data(&self.data.id, "root");
        if !matches!(seed, Value::Object(_)) {
            return Err(Error::TypeMismatch { id: root_id, expected: "an object literal" });
        }
        let Value::Tracked(root) = env.materialize(root_id.clone(), seed)? else {
            return Err(Error::TypeMismatch { id: root_id, expected: "an object literal" });
        };
        let root = root.as_object()?;
        self.data.state.lock().root = Some(root.clone());
        self.attach_lifecycle("", options)?;
        Ok(root)
    }

    /// The root object. Must be called after [`init`](Self::init).
    pub fn root(&self) -> Result<TraxObject> {
        let st = self.data.state.lock();
        if st.disposed {
            return Err(Error::ObjectDisposed(self.store_trax_id()));
        }
        st.root
            .clone()
            .ok_or_else(|| Error::UnknownId(format!("{}/root", self.data.id)))
    }

    /// Get-or-create a sub-container keyed by composite path. When the path
    /// already names a live container, that container is returned untouched
    /// and `seed` is ignored.
    pub fn add(&self, path: &[&str], seed: Value) -> Result<Trackable> {
        self.add_with(path, seed, InitOptions::default())
    }

    /// [`add`](Self::add) with lifecycle processors (named after the path).
    pub fn add_with(
        &self,
        path: &[&str],
        seed: Value,
        options: InitOptions,
    ) -> Result<Trackable> {
        let env = self.env()?;
        let joined = path.join(":");
        if joined.is_empty() {
            return Err(Error::UnknownId("empty object path".to_string()));
        }
        {
            let st = self.data.state.lock();
            if st.disposed {
                return Err(Error::ObjectDisposed(self.store_trax_id()));
            }
            if let Some(id) = st.data_by_path.get(&joined) {
                if let Some(existing) = env.registry.get_trackable(id) {
                    if !existing.is_disposed() {
                        return Ok(existing);
                    }
                }
            }
        }
        let base = TraxId::data(&self.data.id, &joined);
        if !seed.is_composite_literal() {
            return Err(Error::TypeMismatch { id: base, expected: "a composite literal" });
        }
        let Value::Tracked(tracked) = env.materialize(base.clone(), seed)? else {
            return Err(Error::TypeMismatch { id: base, expected: "a composite literal" });
        };
        self.data
            .state
            .lock()
            .data_by_path
            .insert(joined.clone(), tracked.id().clone());
        self.attach_lifecycle(&joined, options)?;
        Ok(tracked)
    }

    /// Resolves a previously-added container by path.
    #[must_use]
    pub fn get(&self, path: &[&str]) -> Option<Trackable> {
        let env = self.data.env.upgrade()?;
        let joined = path.join(":");
        let id = self.data.state.lock().data_by_path.get(&joined)?.clone();
        env.registry.get_trackable(&id)
    }

    fn attach_lifecycle(&self, path: &str, options: InitOptions) -> Result<()> {
        let once = ProcessorOptions {
            auto_compute: false,
            max_compute_count: Some(1),
            ..ProcessorOptions::default()
        };
        if let Some(body) = options.on_init {
            self.register_processor(&lifecycle_name(path, "onInit"), once, Body::Sync(body))?;
        }
        if let Some(body) = options.on_init_async {
            self.register_processor(&lifecycle_name(path, "onInit"), once, Body::Async(body))?;
        }
        if let Some(body) = options.on_change {
            self.register_processor(
                &lifecycle_name(path, "onChange"),
                ProcessorOptions::default(),
                Body::Sync(body),
            )?;
        }
        Ok(())
    }

    /// Registers a synchronous processor and runs it immediately to capture
    /// its dependencies. When a live processor with the same name exists, it
    /// is returned instead (get-or-create).
    pub fn compute(
        &self,
        name: &str,
        body: impl FnMut() -> Result<()> + Send + 'static,
    ) -> Result<Processor> {
        self.compute_with(name, ProcessorOptions::default(), body)
    }

    /// [`compute`](Self::compute) with explicit options.
    pub fn compute_with(
        &self,
        name: &str,
        options: ProcessorOptions,
        body: impl FnMut() -> Result<()> + Send + 'static,
    ) -> Result<Processor> {
        self.register_processor(name, options, Body::Sync(Box::new(body)))
    }

    /// Registers an asynchronous processor. The body is a factory producing
    /// one future per run; each `Pending` poll suspends the processor until
    /// its waker fires.
    pub fn compute_async<F, Fut>(&self, name: &str, body: F) -> Result<Processor>
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: std::future::Future<Output = Result<()>> + Send + 'static,
    {
        self.compute_async_with(name, ProcessorOptions::default(), body)
    }

    /// [`compute_async`](Self::compute_async) with explicit options.
    pub fn compute_async_with<F, Fut>(
        &self,
        name: &str,
        options: ProcessorOptions,
        mut body: F,
    ) -> Result<Processor>
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: std::future::Future<Output = Result<()>> + Send + 'static,
    {
        self.register_processor(
            name,
            options,
            Body::Async(Box::new(move || Box::pin(body()) as BoxFuture<'static, Result<()>>)),
        )
    }

    /// Wraps an async function whose invocations are bracketed by processing
    /// events on the stream. Calls are one-shot runs: they are not
    /// dependency-tracked and never re-run automatically.
    pub fn async_fn<F, Fut>(&self, name: &str, body: F) -> Result<AsyncFn>
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<Value>> + Send + 'static,
    {
        if self.is_disposed() {
            return Err(Error::ObjectDisposed(self.store_trax_id()));
        }
        Ok(AsyncFn {
            store: Arc::downgrade(&self.data),
            env: self.data.env.clone(),
            store_id: self.data.id.clone(),
            name: name.to_string(),
            body: Arc::new(move |arg| Box::pin(body(arg)) as BoxFuture<'static, Result<Value>>),
        })
    }

    fn register_processor(
        &self,
        name: &str,
        options: ProcessorOptions,
        body: Body,
    ) -> Result<Processor> {
        let env = self.env()?;
        let id = {
            let mut st = self.data.state.lock();
            if st.disposed {
                return Err(Error::ObjectDisposed(self.store_trax_id()));
            }
            if let Some(existing) = st.live_by_name.get(name) {
                if let Some(processor) = env.registry.get_processor(existing) {
                    if !processor.is_disposed() {
                        return Ok(processor);
                    }
                }
            }
            let instance = st.instances.entry(name.to_string()).or_insert(0);
            *instance += 1;
            let id = TraxId::processor(&self.data.id, name, *instance);
            st.live_by_name.insert(name.to_string(), id.clone());
            st.processors.push(id.clone());
            id
        };
        let processor = env.create_processor(id, options, body);
        if !options.lazy {
            // run now to capture dependencies; serialized with any in-flight
            // pass when possible (nested creation already holds the lock on
            // this thread, in which case try_lock fails and we run inline)
            let guard = env.scheduler.pass_lock.try_lock();
            let _ = env.execute_processor(&processor, true);
            drop(guard);
        } else if options.auto_compute {
            env.scheduler.enqueue(&processor);
        }
        Ok(processor)
    }

    /// Records ownership of a materialized container.
    pub(crate) fn record_trackable(&self, id: TraxId) {
        let mut st = self.data.state.lock();
        if !st.disposed {
            st.trackables.push(id);
        }
    }

    /// Disposes the store and everything it owns: processors first, then
    /// containers. Subsequent reads on any owned object fail with
    /// [`Error::ObjectDisposed`]. Idempotent.
    pub fn dispose(&self) {
        let Some(env) = self.data.env.upgrade() else {
            self.data.state.lock().disposed = true;
            return;
        };
        let (trackables, processors) = {
            let mut st = self.data.state.lock();
            if st.disposed {
                return;
            }
            st.disposed = true;
            st.root = None;
            st.live_by_name.clear();
            st.data_by_path.clear();
            (std::mem::take(&mut st.trackables), std::mem::take(&mut st.processors))
        };
        for id in &processors {
            if let Some(processor) = env.registry.get_processor(id) {
                processor.dispose();
            }
        }
        for id in &trackables {
            if let Some(trackable) = env.registry.get_trackable(id) {
                trackable.dispose();
            }
            env.registry.release_data_id(id);
        }
        env.registry.remove_store(&self.data.id);
        env.log
            .append(EventKind::Dispose, json!({ "objectId": &*self.data.id }));
    }
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("id", &self.data.id)
            .field("disposed", &self.is_disposed())
            .finish_non_exhaustive()
    }
}

fn lifecycle_name(path: &str, suffix: &str) -> String {
    if path.is_empty() {
        suffix.to_string()
    } else {
        format!("{path}[{suffix}]")
    }
}

type AsyncFnBody = Arc<dyn Fn(Value) -> BoxFuture<'static, Result<Value>> + Send + Sync>;

/// A callable returned by [`Store::async_fn`]. Each call runs the wrapped
/// async body bracketed by `ProcessingStart`/`Pause`/`Resume`/`End` events
/// under a fresh processor id.
#[derive(Clone)]
pub struct AsyncFn {
    store: Weak<StoreData>,
    env: Weak<EnvInner>,
    store_id: Arc<str>,
    name: String,
    body: AsyncFnBody,
}

impl AsyncFn {
    /// Invokes the wrapped function. Errors from the body are logged on the
    /// stream and also returned to the caller.
    pub async fn call(&self, argument: impl Into<Value>) -> Result<Value> {
        let fallback = TraxId::processor(&self.store_id, &self.name, 0);
        let env = self
            .env
            .upgrade()
            .ok_or_else(|| Error::ObjectDisposed(fallback.clone()))?;
        let store = self
            .store
            .upgrade()
            .ok_or_else(|| Error::ObjectDisposed(fallback.clone()))?;
        let id = {
            let mut st = store.state.lock();
            if st.disposed {
                return Err(Error::ObjectDisposed(fallback));
            }
            let instance = st.instances.entry(self.name.clone()).or_insert(0);
            *instance += 1;
            TraxId::processor(&self.store_id, &self.name, *instance)
        };
        env.log.append(
            EventKind::ProcessingStart,
            json!({ "processorId": id.as_str() }),
        );
        let future = (self.body)(argument.into());
        let result = Traced::new(Arc::downgrade(&env), id.clone(), future).await;
        match &result {
            Ok(_) => {
                env.log.append(
                    EventKind::ProcessingEnd,
                    json!({ "processorId": id.as_str() }),
                );
            }
            Err(error) => {
                env.log.append(
                    EventKind::Error,
                    json!({ "processorId": id.as_str(), "message": error.to_string() }),
                );
            }
        }
        result
    }
}
