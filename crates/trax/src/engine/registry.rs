//! Identity registry: id assignment, uniqueness, and handle resolution.
//!
//! Ids are never reused while their owning store is alive. Store prefixes are
//! disambiguated against live stores with a numeric suffix; derived data ids
//! are disambiguated against every id ever claimed under the store.

use std::sync::Arc;

use dashmap::{DashMap, DashSet};
use fxhash::FxHashMap;
use parking_lot::Mutex;

use crate::{id::TraxId, processor::Processor, store::Store, trackable::Trackable};

pub(crate) struct Registry {
    stores: DashMap<Arc<str>, Store>,
    store_suffixes: Mutex<FxHashMap<String, u32>>,
    used_data_ids: DashSet<TraxId>,
    trackables: DashMap<TraxId, Trackable>,
    processors: DashMap<TraxId, Processor>,
    processors_by_key: DashMap<u64, Processor>,
}

impl Registry {
    pub(crate) fn new() -> Self {
        Self {
            stores: DashMap::new(),
            store_suffixes: Mutex::new(FxHashMap::default()),
            used_data_ids: DashSet::new(),
            trackables: DashMap::new(),
            processors: DashMap::new(),
            processors_by_key: DashMap::new(),
        }
    }

    /// Claims a store id: the bare prefix when free, otherwise the prefix
    /// with the next numeric suffix (`App`, `App1`, `App2`, ...).
    pub(crate) fn claim_store_id(&self, prefix: &str) -> Arc<str> {
        if !self.stores.contains_key(prefix) {
            return Arc::from(prefix);
        }
        let mut suffixes = self.store_suffixes.lock();
        let counter = suffixes.entry(prefix.to_string()).or_insert(0);
        loop {
            *counter += 1;
            let candidate = format!("{prefix}{counter}");
            if !self.stores.contains_key(candidate.as_str()) {
                return Arc::from(candidate);
            }
        }
    }

    /// Claims a data id, appending a `-N` suffix if the base was ever used.
    pub(crate) fn claim_data_id(&self, base: TraxId) -> TraxId {
        if self.used_data_ids.insert(base.clone()) {
            return base;
        }
        let mut n = 2;
        loop {
            let candidate = base.disambiguated(n);
            if self.used_data_ids.insert(candidate.clone()) {
                return candidate;
            }
            n += 1;
        }
    }

    /// Forgets a claimed data id. Only called when the owning store is
    /// disposed as a whole; within a live store, disposed ids stay burned.
    pub(crate) fn release_data_id(&self, id: &TraxId) {
        self.used_data_ids.remove(id);
    }

    pub(crate) fn insert_store(&self, store: Store) {
        self.stores.insert(Arc::from(store.id()), store);
    }

    pub(crate) fn get_store(&self, id: &str) -> Option<Store> {
        self.stores.get(id).map(|s| s.value().clone())
    }

    pub(crate) fn remove_store(&self, id: &str) {
        self.stores.remove(id);
    }

    pub(crate) fn insert_trackable(&self, trackable: Trackable) {
        self.trackables.insert(trackable.id().clone(), trackable);
    }

    pub(crate) fn get_trackable(&self, id: &TraxId) -> Option<Trackable> {
        self.trackables.get(id).map(|t| t.value().clone())
    }

    pub(crate) fn remove_trackable(&self, id: &TraxId) {
        self.trackables.remove(id);
    }

    pub(crate) fn insert_processor(&self, processor: Processor) {
        self.processors_by_key.insert(processor.key(), processor.clone());
        self.processors.insert(processor.id().clone(), processor);
    }

    pub(crate) fn get_processor(&self, id: &TraxId) -> Option<Processor> {
        self.processors.get(id).map(|p| p.value().clone())
    }

    pub(crate) fn processor_by_key(&self, key: u64) -> Option<Processor> {
        self.processors_by_key.get(&key).map(|p| p.value().clone())
    }

    pub(crate) fn remove_processor(&self, id: &TraxId, key: u64) {
        self.processors.remove(id);
        self.processors_by_key.remove(&key);
    }
}
