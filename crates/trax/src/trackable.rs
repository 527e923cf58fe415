//! Tracked containers and the read/write interception layer.
//!
//! A [`Trackable`] is a ref-counted container (object, array, or dictionary)
//! whose every property access goes through an explicit getter/setter surface
//! rather than runtime proxying: reads performed while a processor is active
//! register `(trackableId, propKey)` into that processor's dependency set and
//! emit a `Get` event; writes always emit a `Set` event and synchronously
//! dirty every dependent processor before returning. Writing a value
//! identical to the current one (primitive equality, reference identity for
//! tracked refs) is a strict no-op.
//!
//! Composite literal values written into a container are materialized into
//! new tracked containers owned by the same store, with ids derived from the
//! parent path; materialization emits `New` events but no per-property `Set`
//! events (fresh content has no observers yet).

use std::{
    fmt,
    sync::{Arc, Weak},
};

use fxhash::FxHashMap;
use parking_lot::Mutex;
use serde_json::json;

use crate::{
    engine::EnvInner,
    error::{Error, Result},
    id::TraxId,
    log::EventKind,
    value::Value,
};

/// Identity of one observable slot of a trackable.
///
/// Typed keys avoid sentinel-string collisions with user data: array reads
/// depend on `Item(i)`, length/size reads depend on `Size`, named properties
/// on `Prop(name)`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PropKey {
    /// A named property of an object or dictionary.
    Prop(Arc<str>),
    /// An array slot.
    Item(u32),
    /// The length of an array or the size of a dictionary.
    Size,
}

impl PropKey {
    pub(crate) fn prop(name: &str) -> Self {
        Self::Prop(Arc::from(name))
    }
}

impl fmt::Display for PropKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PropKey::Prop(name) => f.write_str(name),
            PropKey::Item(i) => write!(f, "{i}"),
            PropKey::Size => f.write_str("length"),
        }
    }
}

/// The shape of a tracked container.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TrackableKind {
    /// Fixed-shape record with named properties.
    Object,
    /// Indexed sequence.
    Array,
    /// Open string-keyed collection.
    Dictionary,
}

impl TrackableKind {
    pub(crate) fn label(self) -> &'static str {
        match self {
            TrackableKind::Object => "object",
            TrackableKind::Array => "array",
            TrackableKind::Dictionary => "dictionary",
        }
    }
}

pub(crate) enum Content {
    Object(FxHashMap<Arc<str>, Value>),
    Array(Vec<Value>),
    Dict(FxHashMap<Arc<str>, Value>),
}

impl Content {
    pub(crate) fn empty(kind: TrackableKind) -> Self {
        match kind {
            TrackableKind::Object => Content::Object(FxHashMap::default()),
            TrackableKind::Array => Content::Array(Vec::new()),
            TrackableKind::Dictionary => Content::Dict(FxHashMap::default()),
        }
    }
}

pub(crate) struct TrackState {
    pub(crate) disposed: bool,
    pub(crate) content: Content,
}

pub(crate) struct TrackableData {
    id: TraxId,
    kind: TrackableKind,
    env: Weak<EnvInner>,
    pub(crate) state: Mutex<TrackState>,
}

/// Untyped handle to a tracked container. Cheap to clone; identity follows
/// the trax id, which stays stable across content mutation.
#[derive(Clone)]
pub struct Trackable {
    pub(crate) data: Arc<TrackableData>,
}

impl Trackable {
    pub(crate) fn new(
        env: &Arc<EnvInner>,
        id: TraxId,
        kind: TrackableKind,
        content: Content,
    ) -> Self {
        Self {
            data: Arc::new(TrackableData {
                id,
                kind,
                env: Arc::downgrade(env),
                state: Mutex::new(TrackState { disposed: false, content }),
            }),
        }
    }

    /// The id assigned by the identity registry.
    #[must_use]
    pub fn id(&self) -> &TraxId {
        &self.data.id
    }

    /// The container shape.
    #[must_use]
    pub fn kind(&self) -> TrackableKind {
        self.data.kind
    }

    /// Whether this container (or its whole environment) has been disposed.
    #[must_use]
    pub fn is_disposed(&self) -> bool {
        self.data.env.strong_count() == 0 || self.data.state.lock().disposed
    }

    /// Narrows to an object handle.
    pub fn as_object(&self) -> Result<TraxObject> {
        match self.kind() {
            TrackableKind::Object => Ok(TraxObject(self.clone())),
            _ => Err(Error::TypeMismatch { id: self.id().clone(), expected: "an object" }),
        }
    }

    /// Narrows to an array handle.
    pub fn as_array(&self) -> Result<TraxArray> {
        match self.kind() {
            TrackableKind::Array => Ok(TraxArray(self.clone())),
            _ => Err(Error::TypeMismatch { id: self.id().clone(), expected: "an array" }),
        }
    }

    /// Narrows to a dictionary handle.
    pub fn as_dict(&self) -> Result<TraxDict> {
        match self.kind() {
            TrackableKind::Dictionary => Ok(TraxDict(self.clone())),
            _ => Err(Error::TypeMismatch { id: self.id().clone(), expected: "a dictionary" }),
        }
    }

    /// Disposes the container: further reads and writes fail with
    /// [`Error::ObjectDisposed`]. Idempotent. The id is never reused.
    pub fn dispose(&self) {
        {
            let mut st = self.data.state.lock();
            if st.disposed {
                return;
            }
            st.disposed = true;
            st.content = Content::empty(self.data.kind);
        }
        if let Some(env) = self.data.env.upgrade() {
            env.registry.remove_trackable(self.id());
            env.log.append(
                EventKind::Dispose,
                json!({ "objectId": self.id().as_str() }),
            );
        }
    }

    fn env(&self) -> Result<Arc<EnvInner>> {
        self.data
            .env
            .upgrade()
            .ok_or_else(|| Error::ObjectDisposed(self.id().clone()))
    }

    /// Runs `f` against the raw content without registering dependencies or
    /// emitting events. Used by the collection differ to plan minimal edits.
    pub(crate) fn with_content<R>(&self, f: impl FnOnce(&Content) -> R) -> Result<R> {
        let st = self.data.state.lock();
        if st.disposed {
            return Err(Error::ObjectDisposed(self.id().clone()));
        }
        Ok(f(&st.content))
    }

    /// Tracked read of one slot. Absent slots read as [`Value::Null`].
    pub(crate) fn read_key(&self, key: &PropKey) -> Result<Value> {
        let env = self.env()?;
        let value = {
            let st = self.data.state.lock();
            if st.disposed {
                return Err(Error::ObjectDisposed(self.id().clone()));
            }
            match (&st.content, key) {
                (Content::Object(map) | Content::Dict(map), PropKey::Prop(name)) => {
                    map.get(name).cloned().unwrap_or_default()
                }
                (Content::Array(items), PropKey::Item(i)) => {
                    items.get(*i as usize).cloned().unwrap_or_default()
                }
                (Content::Array(items), PropKey::Size) => Value::Int(items.len() as i64),
                (Content::Dict(map), PropKey::Size) => Value::Int(map.len() as i64),
                (Content::Object(map), PropKey::Size) => Value::Int(map.len() as i64),
                _ => {
                    return Err(Error::TypeMismatch {
                        id: self.id().clone(),
                        expected: self.data.kind.label(),
                    })
                }
            }
        };
        env.on_read(self.id(), key, &value);
        Ok(value)
    }

    /// Tracked write of one slot. Identical writes are no-ops. Writing past
    /// the end of an array fills the gap with `Null` and grows the length.
    pub(crate) fn write_key(&self, key: PropKey, value: Value) -> Result<()> {
        let env = self.env()?;
        let value = env.wrap_value(self.id(), &key, value)?;
        let (from, size_change) = {
            let mut st = self.data.state.lock();
            if st.disposed {
                return Err(Error::ObjectDisposed(self.id().clone()));
            }
            match (&mut st.content, &key) {
                (Content::Object(map), PropKey::Prop(name)) => {
                    let old = map.get(name).cloned().unwrap_or_default();
                    if old.same(&value) {
                        return Ok(());
                    }
                    map.insert(name.clone(), value.clone());
                    (old, None)
                }
                (Content::Dict(map), PropKey::Prop(name)) => {
                    let old = map.get(name).cloned().unwrap_or_default();
                    if old.same(&value) {
                        return Ok(());
                    }
                    let grew = !map.contains_key(name);
                    map.insert(name.clone(), value.clone());
                    let len = map.len();
                    (old, grew.then(|| (len - 1, len)))
                }
                (Content::Array(items), PropKey::Item(i)) => {
                    let i = *i as usize;
                    if i < items.len() {
                        let old = items[i].clone();
                        if old.same(&value) {
                            return Ok(());
                        }
                        items[i] = value.clone();
                        (old, None)
                    } else {
                        let from_len = items.len();
                        items.resize(i + 1, Value::Null);
                        items[i] = value.clone();
                        (Value::Null, Some((from_len, i + 1)))
                    }
                }
                _ => {
                    return Err(Error::TypeMismatch {
                        id: self.id().clone(),
                        expected: self.data.kind.label(),
                    })
                }
            }
        };
        env.on_write(self.id(), &key, &from, &value);
        if let Some((before, after)) = size_change {
            env.on_write(
                self.id(),
                &PropKey::Size,
                &Value::Int(before as i64),
                &Value::Int(after as i64),
            );
        }
        Ok(())
    }

    /// Appends slots at the end of an array, with one size event for the
    /// whole extension.
    pub(crate) fn array_extend(&self, values: Vec<Value>) -> Result<()> {
        if values.is_empty() {
            return Ok(());
        }
        let env = self.env()?;
        let start = self.with_content(|c| match c {
            Content::Array(items) => Ok(items.len()),
            _ => Err(Error::TypeMismatch { id: self.id().clone(), expected: "an array" }),
        })??;
        let mut wrapped = Vec::with_capacity(values.len());
        for (offset, value) in values.into_iter().enumerate() {
            let key = PropKey::Item((start + offset) as u32);
            wrapped.push((key.clone(), env.wrap_value(self.id(), &key, value)?));
        }
        let after = {
            let mut st = self.data.state.lock();
            if st.disposed {
                return Err(Error::ObjectDisposed(self.id().clone()));
            }
            let Content::Array(items) = &mut st.content else {
                return Err(Error::TypeMismatch { id: self.id().clone(), expected: "an array" });
            };
            items.extend(wrapped.iter().map(|(_, v)| v.clone()));
            items.len()
        };
        for (key, value) in &wrapped {
            env.on_write(self.id(), key, &Value::Null, value);
        }
        env.on_write(
            self.id(),
            &PropKey::Size,
            &Value::Int(start as i64),
            &Value::Int(after as i64),
        );
        Ok(())
    }

    /// Drops array slots beyond `new_len`, with one size event for the whole
    /// truncation.
    pub(crate) fn array_truncate(&self, new_len: usize) -> Result<()> {
        let env = self.env()?;
        let removed = {
            let mut st = self.data.state.lock();
            if st.disposed {
                return Err(Error::ObjectDisposed(self.id().clone()));
            }
            let Content::Array(items) = &mut st.content else {
                return Err(Error::TypeMismatch { id: self.id().clone(), expected: "an array" });
            };
            if new_len >= items.len() {
                return Ok(());
            }
            let removed: Vec<Value> = items.drain(new_len..).collect();
            removed
        };
        let before = new_len + removed.len();
        for (offset, old) in removed.iter().enumerate() {
            env.on_write(
                self.id(),
                &PropKey::Item((new_len + offset) as u32),
                old,
                &Value::Null,
            );
        }
        env.on_write(
            self.id(),
            &PropKey::Size,
            &Value::Int(before as i64),
            &Value::Int(new_len as i64),
        );
        Ok(())
    }

    /// Removes a dictionary key, returning the previous value.
    pub(crate) fn dict_remove(&self, name: &str) -> Result<Value> {
        let env = self.env()?;
        let (old, before, after) = {
            let mut st = self.data.state.lock();
            if st.disposed {
                return Err(Error::ObjectDisposed(self.id().clone()));
            }
            let Content::Dict(map) = &mut st.content else {
                return Err(Error::TypeMismatch {
                    id: self.id().clone(),
                    expected: "a dictionary",
                });
            };
            match map.remove(name) {
                None => return Ok(Value::Null),
                Some(old) => {
                    let after = map.len();
                    (old, after + 1, after)
                }
            }
        };
        env.on_write(self.id(), &PropKey::prop(name), &old, &Value::Null);
        env.on_write(
            self.id(),
            &PropKey::Size,
            &Value::Int(before as i64),
            &Value::Int(after as i64),
        );
        Ok(old)
    }
}

impl fmt::Debug for Trackable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Trackable({}, {:?})", self.id(), self.kind())
    }
}

impl PartialEq for Trackable {
    fn eq(&self, other: &Self) -> bool {
        self.id() == other.id()
    }
}

impl Eq for Trackable {}

/// Handle to a tracked object (fixed-shape record).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TraxObject(Trackable);

impl TraxObject {
    /// The trax id of this object.
    #[must_use]
    pub fn id(&self) -> &TraxId {
        self.0.id()
    }

    /// The untyped handle.
    #[must_use]
    pub fn trackable(&self) -> &Trackable {
        &self.0
    }

    /// Tracked read. Absent properties read as [`Value::Null`].
    pub fn get(&self, name: &str) -> Result<Value> {
        self.0.read_key(&PropKey::prop(name))
    }

    /// Tracked read of a nested object reference.
    pub fn get_object(&self, name: &str) -> Result<Option<TraxObject>> {
        match self.get(name)? {
            Value::Tracked(t) => Ok(Some(t.as_object()?)),
            _ => Ok(None),
        }
    }

    /// Tracked read of a nested array reference.
    pub fn get_array(&self, name: &str) -> Result<Option<TraxArray>> {
        match self.get(name)? {
            Value::Tracked(t) => Ok(Some(t.as_array()?)),
            _ => Ok(None),
        }
    }

    /// Tracked read of a nested dictionary reference.
    pub fn get_dict(&self, name: &str) -> Result<Option<TraxDict>> {
        match self.get(name)? {
            Value::Tracked(t) => Ok(Some(t.as_dict()?)),
            _ => Ok(None),
        }
    }

    /// Tracked write. A no-op when the new value is identical.
    pub fn set(&self, name: &str, value: impl Into<Value>) -> Result<()> {
        self.0.write_key(PropKey::prop(name), value.into())
    }

    /// See [`Trackable::dispose`].
    pub fn dispose(&self) {
        self.0.dispose();
    }
}

impl From<TraxObject> for Trackable {
    fn from(value: TraxObject) -> Self {
        value.0
    }
}

impl From<TraxObject> for Value {
    fn from(value: TraxObject) -> Self {
        Value::Tracked(value.0)
    }
}

/// Handle to a tracked array.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TraxArray(Trackable);

impl TraxArray {
    /// The trax id of this array.
    #[must_use]
    pub fn id(&self) -> &TraxId {
        self.0.id()
    }

    /// The untyped handle.
    #[must_use]
    pub fn trackable(&self) -> &Trackable {
        &self.0
    }

    /// Tracked length read (dependency on the array's size).
    pub fn len(&self) -> Result<usize> {
        match self.0.read_key(&PropKey::Size)? {
            Value::Int(n) => Ok(n as usize),
            _ => Ok(0),
        }
    }

    /// Tracked emptiness check.
    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Tracked slot read. Out-of-range reads yield [`Value::Null`].
    pub fn get(&self, index: usize) -> Result<Value> {
        self.0.read_key(&PropKey::Item(index as u32))
    }

    /// Tracked slot write.
    pub fn set(&self, index: usize, value: impl Into<Value>) -> Result<()> {
        self.0.write_key(PropKey::Item(index as u32), value.into())
    }

    /// Appends a value.
    pub fn push(&self, value: impl Into<Value>) -> Result<()> {
        self.0.array_extend(vec![value.into()])
    }

    /// Drops all slots beyond `new_len`.
    pub fn truncate(&self, new_len: usize) -> Result<()> {
        self.0.array_truncate(new_len)
    }

    /// Tracked snapshot: registers a dependency on the length and every slot.
    pub fn to_vec(&self) -> Result<Vec<Value>> {
        let len = self.len()?;
        (0..len).map(|i| self.get(i)).collect()
    }

    /// See [`Trackable::dispose`].
    pub fn dispose(&self) {
        self.0.dispose();
    }
}

impl From<TraxArray> for Trackable {
    fn from(value: TraxArray) -> Self {
        value.0
    }
}

impl From<TraxArray> for Value {
    fn from(value: TraxArray) -> Self {
        Value::Tracked(value.0)
    }
}

/// Handle to a tracked dictionary.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TraxDict(Trackable);

impl TraxDict {
    /// The trax id of this dictionary.
    #[must_use]
    pub fn id(&self) -> &TraxId {
        self.0.id()
    }

    /// The untyped handle.
    #[must_use]
    pub fn trackable(&self) -> &Trackable {
        &self.0
    }

    /// Tracked key read. Absent keys read as [`Value::Null`].
    pub fn get(&self, key: &str) -> Result<Value> {
        self.0.read_key(&PropKey::prop(key))
    }

    /// Tracked key write.
    pub fn set(&self, key: &str, value: impl Into<Value>) -> Result<()> {
        self.0.write_key(PropKey::prop(key), value.into())
    }

    /// Removes a key, returning the previous value ([`Value::Null`] if it was
    /// absent).
    pub fn remove(&self, key: &str) -> Result<Value> {
        self.0.dict_remove(key)
    }

    /// Tracked size read.
    pub fn len(&self) -> Result<usize> {
        match self.0.read_key(&PropKey::Size)? {
            Value::Int(n) => Ok(n as usize),
            _ => Ok(0),
        }
    }

    /// Tracked emptiness check.
    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Sorted key snapshot; registers a dependency on the dictionary size.
    pub fn keys(&self) -> Result<Vec<String>> {
        self.0.read_key(&PropKey::Size)?;
        let mut keys = self.0.with_content(|c| match c {
            Content::Dict(map) => map.keys().map(|k| k.to_string()).collect::<Vec<_>>(),
            _ => Vec::new(),
        })?;
        keys.sort_unstable();
        Ok(keys)
    }

    /// See [`Trackable::dispose`].
    pub fn dispose(&self) {
        self.0.dispose();
    }
}

impl From<TraxDict> for Trackable {
    fn from(value: TraxDict) -> Self {
        value.0
    }
}

impl From<TraxDict> for Value {
    fn from(value: TraxDict) -> Self {
        Value::Tracked(value.0)
    }
}

impl EnvInner {
    /// Materializes composite literals written under `parent/key` into fresh
    /// tracked containers; passes every other value through unchanged.
    pub(crate) fn wrap_value(
        self: &Arc<Self>,
        parent: &TraxId,
        key: &PropKey,
        value: Value,
    ) -> Result<Value> {
        if !value.is_composite_literal() {
            return Ok(value);
        }
        let base = TraxId::child(parent, &key.to_string());
        self.materialize(base, value)
    }

    /// Recursively converts a composite literal into a tracked container
    /// owned by the store named in its id.
    pub(crate) fn materialize(self: &Arc<Self>, base: TraxId, value: Value) -> Result<Value> {
        let id = self.registry.claim_data_id(base);
        let trackable = match value {
            Value::Object(entries) => {
                let mut map = FxHashMap::default();
                for (name, entry) in entries {
                    let entry = self.wrap_value(&id, &PropKey::prop(&name), entry)?;
                    map.insert(Arc::from(name.as_str()), entry);
                }
                self.create_trackable(id, TrackableKind::Object, Content::Object(map))
            }
            Value::Array(items) => {
                let mut slots = Vec::with_capacity(items.len());
                for (i, item) in items.into_iter().enumerate() {
                    slots.push(self.wrap_value(&id, &PropKey::Item(i as u32), item)?);
                }
                self.create_trackable(id, TrackableKind::Array, Content::Array(slots))
            }
            Value::Dict(entries) => {
                let mut map = FxHashMap::default();
                for (name, entry) in entries {
                    let entry = self.wrap_value(&id, &PropKey::prop(&name), entry)?;
                    map.insert(Arc::from(name.as_str()), entry);
                }
                self.create_trackable(id, TrackableKind::Dictionary, Content::Dict(map))
            }
            other => return Ok(other),
        };
        Ok(Value::Tracked(trackable))
    }

    /// Registers a freshly-built container and emits its `New` event.
    pub(crate) fn create_trackable(
        self: &Arc<Self>,
        id: TraxId,
        kind: TrackableKind,
        content: Content,
    ) -> Trackable {
        let trackable = Trackable::new(self, id.clone(), kind, content);
        self.registry.insert_trackable(trackable.clone());
        if let Some(store) = self.registry.get_store(id.store_id()) {
            store.record_trackable(id.clone());
        }
        self.log.append(
            EventKind::New,
            json!({ "objectId": id.as_str(), "objectKind": kind.label() }),
        );
        trackable
    }
}
