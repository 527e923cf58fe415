//! The trax environment: identity registry, dependency graph, scheduler, and
//! event stream behind one shared handle.
//!
//! All engine state is explicit per-environment, with no process-global
//! registry, so tests create isolated environments and run in parallel.
//! Dropping the last [`Trax`] clone tears the environment down; operations
//! through surviving store/trackable/processor handles then fail with
//! [`Error::ObjectDisposed`](crate::Error::ObjectDisposed).

use std::sync::{atomic::AtomicU64, Arc};

use parking_lot::Mutex;
use serde_json::json;

use crate::{
    config::TraxConfig,
    engine::{graph::DependencyGraph, registry::Registry, scheduler::Scheduler},
    error::Result,
    id::TraxId,
    log::{EventKind, Log},
    processor::Processor,
    store::{self, Store},
    trackable::{PropKey, Trackable},
    value::Value,
};

pub(crate) mod graph;
pub(crate) mod registry;
pub(crate) mod scheduler;

#[cfg(test)]
mod test;

pub(crate) struct EnvInner {
    pub(crate) config: TraxConfig,
    pub(crate) log: Log,
    pub(crate) registry: Registry,
    pub(crate) graph: Mutex<DependencyGraph>,
    pub(crate) scheduler: Scheduler,
    pub(crate) next_order: AtomicU64,
}

impl EnvInner {
    /// Registers a read of `(id, key)`: while a processor is active the read
    /// becomes one of its dependencies and a `Get` event is appended. Reads
    /// outside any computation are untracked: they cannot create
    /// dependencies and would flood the stream.
    pub(crate) fn on_read(&self, id: &TraxId, key: &PropKey, value: &Value) {
        let Some(processor) = self.scheduler.active_processor() else {
            return;
        };
        processor.record_dep(id.clone(), key.clone());
        self.graph
            .lock()
            .register_read(processor.key(), (id.clone(), key.clone()));
        self.log.append(
            EventKind::Get,
            json!({
                "objectId": id.as_str(),
                "propName": key.to_string(),
                "propValue": value.to_json(),
            }),
        );
    }

    /// Registers an applied write of `(id, key)`: appends the `Set` event and
    /// synchronously dirties every dependent processor before returning. The
    /// currently-active processor never dirties itself from its own write
    /// (self-write suppression), though other active processors up the stack
    /// do get re-enqueued.
    pub(crate) fn on_write(
        self: &Arc<Self>,
        id: &TraxId,
        key: &PropKey,
        from: &Value,
        to: &Value,
    ) {
        self.log.append(
            EventKind::Set,
            json!({
                "objectId": id.as_str(),
                "propName": key.to_string(),
                "fromValue": from.to_json(),
                "toValue": to.to_json(),
            }),
        );
        let readers = self.graph.lock().readers_of(&(id.clone(), key.clone()));
        if readers.is_empty() {
            return;
        }
        let own = self.scheduler.active_top_key();
        for reader in readers {
            if Some(reader) == own {
                continue;
            }
            if let Some(processor) = self.registry.processor_by_key(reader) {
                processor.mark_dirty(self, Some((id, key)));
            }
        }
    }
}

/// A trax environment handle. Cheap to clone; all clones share the same
/// registry, dependency graph, scheduler, and event stream.
#[derive(Clone)]
pub struct Trax {
    pub(crate) inner: Arc<EnvInner>,
}

impl Trax {
    /// Creates an environment with default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(TraxConfig::default())
    }

    /// Creates an environment with explicit configuration.
    #[must_use]
    pub fn with_config(config: TraxConfig) -> Self {
        Self {
            inner: Arc::new(EnvInner {
                log: Log::new(config.retained_cycles),
                config,
                registry: Registry::new(),
                graph: Mutex::new(DependencyGraph::default()),
                scheduler: Scheduler::new(),
                next_order: AtomicU64::new(1),
            }),
        }
    }

    /// Creates a store. `prefix` is disambiguated with a numeric suffix when
    /// it collides with a live store. `init` runs before the store is
    /// returned and must set up the root object (via [`Store::init`]); stores
    /// left uninitialized get an empty root and a `Warning` event.
    pub fn create_store(
        &self,
        prefix: &str,
        init: impl FnOnce(&Store) -> Result<()>,
    ) -> Result<Store> {
        store::create_store(&self.inner, prefix, init)
    }

    /// Resolves a live store by id.
    #[must_use]
    pub fn get_store(&self, id: &str) -> Option<Store> {
        self.inner.registry.get_store(id)
    }

    /// Resolves a live processor by full id (`<storeId>#<name>:<instance>`).
    #[must_use]
    pub fn get_processor(&self, id: &str) -> Option<Processor> {
        self.inner.registry.get_processor(&TraxId::from(id))
    }

    /// Resolves a live tracked container by full id.
    #[must_use]
    pub fn get_trackable(&self, id: &str) -> Option<Trackable> {
        self.inner.registry.get_trackable(&TraxId::from(id))
    }

    /// The id of a tracked container.
    #[must_use]
    pub fn get_trax_id(&self, trackable: &Trackable) -> TraxId {
        trackable.id().clone()
    }

    /// The processor currently computing, if any.
    #[must_use]
    pub fn get_active_processor(&self) -> Option<Processor> {
        self.inner.scheduler.active_processor()
    }

    /// Whether any processor is dirty and waiting for reconciliation.
    #[must_use]
    pub fn pending_changes(&self) -> bool {
        self.inner.scheduler.has_pending()
    }

    /// Runs a reconciliation pass: every dirty non-renderer processor
    /// computes in `(priority, registration order)` position (processors
    /// dirtied during the pass join it), then dirty renderers run under the
    /// same ordering. Resolves once the in-flight pass (if any) and this
    /// pass complete. Suspended processors never block completion; their
    /// resumption opens a later cycle.
    pub async fn reconciliation(&self) -> Result<()> {
        self.inner.reconciliation().await
    }

    /// The environment's event stream.
    #[must_use]
    pub fn log(&self) -> Log {
        self.inner.log.clone()
    }
}

impl Default for Trax {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Trax {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Trax").finish_non_exhaustive()
    }
}

static_assertions::assert_impl_all!(Trax: Send, Sync);
