//! Collection reconciliation: `update_array` / `update_dictionary`.
//!
//! Both operations mutate a live tracked collection in place to match a
//! target content, by index (arrays) or key (dictionaries) alignment.
//! Identity is decided by [`Value::same`] (reference identity for tracked
//! elements), so unchanged slots are never written: their dependency
//! subscriptions stay intact, which a clear-and-rebuild would incorrectly
//! dirty. Each call emits one group header event (`ArrayUpdate` /
//! `DictionaryUpdate`) followed by only the `Set` events for the slots that
//! actually differ, plus a tail append or truncate.

use fxhash::FxHashSet;
use serde_json::json;

use crate::{
    engine::Trax,
    error::Result,
    log::EventKind,
    trackable::{Content, PropKey, TraxArray, TraxDict},
    value::Value,
};

impl Trax {
    /// Reconciles `live` against `target` element-for-element. After the
    /// call, reading `live` yields content structurally equal to `target`,
    /// and every slot whose target value was already present (by reference
    /// identity) still holds the very same element.
    pub fn update_array(&self, live: &TraxArray, target: Vec<Value>) -> Result<()> {
        let trackable = live.trackable();
        let current = trackable.with_content(|content| match content {
            Content::Array(items) => items.clone(),
            _ => Vec::new(),
        })?;
        self.inner.log.append(
            EventKind::ArrayUpdate,
            json!({ "objectId": live.id().as_str(), "targetLength": target.len() }),
        );
        let shared = current.len().min(target.len());
        for (i, value) in target.iter().take(shared).enumerate() {
            if !current[i].same(value) {
                trackable.write_key(PropKey::Item(i as u32), value.clone())?;
            }
        }
        if target.len() > current.len() {
            trackable.array_extend(target.into_iter().skip(shared).collect())?;
        } else if target.len() < current.len() {
            trackable.array_truncate(target.len())?;
        }
        Ok(())
    }

    /// Reconciles `live` against `target` key-for-key: differing keys are
    /// written, absent keys are inserted, stale keys are removed. Unchanged
    /// keys are never touched.
    pub fn update_dictionary(
        &self,
        live: &TraxDict,
        target: Vec<(String, Value)>,
    ) -> Result<()> {
        let trackable = live.trackable();
        let current = trackable.with_content(|content| match content {
            Content::Dict(map) => map.clone(),
            _ => Default::default(),
        })?;
        self.inner.log.append(
            EventKind::DictionaryUpdate,
            json!({ "objectId": live.id().as_str(), "targetSize": target.len() }),
        );
        let mut seen = FxHashSet::default();
        for (key, value) in target {
            seen.insert(key.clone());
            let unchanged = current.get(key.as_str()).map_or(false, |cur| cur.same(&value));
            if !unchanged {
                trackable.write_key(PropKey::prop(&key), value)?;
            }
        }
        let mut stale: Vec<String> = current
            .keys()
            .filter(|key| !seen.contains(&***key))
            .map(|key| key.to_string())
            .collect();
        stale.sort_unstable();
        for key in &stale {
            trackable.dict_remove(key)?;
        }
        Ok(())
    }
}
