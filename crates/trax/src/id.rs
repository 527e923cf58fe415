//! Trax identifiers.
//!
//! Every store, trackable container, and processor carries a unique,
//! human-readable string id for the lifetime of its environment:
//!
//! - data containers: `<storeId>/<objectPath>` (path segments joined by `:`)
//! - processors: `<storeId>#<name>:<instance>`
//!
//! Ids are never reused, even after disposal: processor instance counters
//! are monotonic per `(store, name)`, and derived data ids are disambiguated
//! with a numeric suffix when a path is re-created.

use std::{fmt, sync::Arc};

/// An opaque, cheaply-cloneable identifier assigned by the identity registry.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TraxId(Arc<str>);

impl TraxId {
    /// Builds the id of a data container from its store and object path.
    pub(crate) fn data(store: &str, path: &str) -> Self {
        Self(Arc::from(format!("{store}/{path}")))
    }

    /// Builds the id of a processor from its store, name, and instance number.
    pub(crate) fn processor(store: &str, name: &str, instance: u32) -> Self {
        Self(Arc::from(format!("{store}#{name}:{instance}")))
    }

    /// Derives the id of a child container materialized under `parent`.
    pub(crate) fn child(parent: &TraxId, segment: &str) -> Self {
        Self(Arc::from(format!("{parent}:{segment}")))
    }

    /// Appends a disambiguation suffix. Used when a derived path collides
    /// with an id that already exists (ids are never reused).
    pub(crate) fn disambiguated(&self, n: u32) -> Self {
        Self(Arc::from(format!("{self}-{n}")))
    }

    /// The id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The store prefix of this id (everything before the first `/` or `#`).
    #[must_use]
    pub fn store_id(&self) -> &str {
        self.0
            .find(['/', '#'])
            .map_or(&*self.0, |idx| &self.0[..idx])
    }

    /// Whether this id names a processor rather than a data container.
    #[must_use]
    pub fn is_processor(&self) -> bool {
        self.0.contains('#')
    }
}

impl fmt::Display for TraxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for TraxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TraxId({})", self.0)
    }
}

impl From<&str> for TraxId {
    fn from(value: &str) -> Self {
        Self(Arc::from(value))
    }
}

impl AsRef<str> for TraxId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
