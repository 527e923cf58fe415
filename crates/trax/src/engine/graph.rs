//! Dependency graph: which processors read which property slots.
//!
//! Adjacency is index-keyed (processors by their monotonic registration
//! key, properties by `(TraxId, PropKey)` pairs), with both
//! forward and reverse maps so a processor's edges can be dropped in one
//! sweep at the start of every recompute (and on disposal).

use fxhash::{FxHashMap, FxHashSet};

use crate::{id::TraxId, trackable::PropKey};

pub(crate) type PropRef = (TraxId, PropKey);

#[derive(Default)]
pub(crate) struct DependencyGraph {
    readers: FxHashMap<PropRef, FxHashSet<u64>>,
    reads: FxHashMap<u64, FxHashSet<PropRef>>,
}

impl DependencyGraph {
    /// Records that `processor` read `prop` during its current computation.
    pub(crate) fn register_read(&mut self, processor: u64, prop: PropRef) {
        if self.reads.entry(processor).or_default().insert(prop.clone()) {
            self.readers.entry(prop).or_default().insert(processor);
        }
    }

    /// The processors that read `prop` during their last computation.
    pub(crate) fn readers_of(&self, prop: &PropRef) -> Vec<u64> {
        self.readers
            .get(prop)
            .map(|set| {
                let mut readers: Vec<u64> = set.iter().copied().collect();
                readers.sort_unstable();
                readers
            })
            .unwrap_or_default()
    }

    /// Drops every edge of `processor`, in both directions.
    pub(crate) fn clear_processor(&mut self, processor: u64) {
        let Some(props) = self.reads.remove(&processor) else {
            return;
        };
        for prop in props {
            if let Some(readers) = self.readers.get_mut(&prop) {
                readers.remove(&processor);
                if readers.is_empty() {
                    self.readers.remove(&prop);
                }
            }
        }
    }

    /// Number of property slots `processor` currently depends on.
    pub(crate) fn read_count(&self, processor: u64) -> usize {
        self.reads.get(&processor).map_or(0, FxHashSet::len)
    }
}
