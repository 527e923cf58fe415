//! Common test utilities and shared fixtures for trax integration tests.

#![allow(missing_docs)]
#![allow(clippy::missing_panics_doc, clippy::missing_errors_doc)]

use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

use parking_lot::Mutex;
use trax::{Processor, Result, Store, Trax, TraxConfig, Value};

// ============================================================================
// Environment and instrumentation helpers
// ============================================================================

/// A fresh environment with a small retention window, enough for every
/// scenario in this crate.
#[must_use]
pub fn create_test_env() -> Trax {
    Trax::with_config(TraxConfig {
        retained_cycles: 16,
        ..TraxConfig::default()
    })
}

/// Shared run counter for asserting how often a compute body executed.
#[derive(Clone, Default)]
pub struct RunCounter(Arc<AtomicUsize>);

impl RunCounter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bump(&self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }

    #[must_use]
    pub fn count(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }
}

/// Records the event codes of every matching stream event, in append order.
#[must_use]
pub fn record_events(trax: &Trax, pattern: &str) -> Arc<Mutex<Vec<String>>> {
    let recorded = Arc::new(Mutex::new(Vec::new()));
    let sink = recorded.clone();
    trax.log().subscribe(pattern, move |event| {
        sink.lock().push(event.kind.code().to_string());
    });
    recorded
}

/// Records the `processorId` payload of every matching stream event.
#[must_use]
pub fn record_processor_ids(trax: &Trax, pattern: &str) -> Arc<Mutex<Vec<String>>> {
    let recorded = Arc::new(Mutex::new(Vec::new()));
    let sink = recorded.clone();
    trax.log().subscribe(pattern, move |event| {
        if let Some(id) = event.data["processorId"].as_str() {
            sink.lock().push(id.to_string());
        }
    });
    recorded
}

/// Polls `condition` until it holds, with a generous timeout. Used to await
/// suspended-processor resumptions without racing their driving tasks.
pub async fn wait_until(condition: impl Fn() -> bool) {
    for _ in 0..1000 {
        if condition() {
            return;
        }
        tokio::time::sleep(std::time::Duration::from_millis(2)).await;
    }
    panic!("condition not reached within timeout");
}

/// Counts retained events of one code by scanning the log.
#[must_use]
pub fn count_retained(trax: &Trax, code: &str) -> usize {
    let mut count = 0;
    trax.log().scan(|event| {
        if event.kind.code() == code {
            count += 1;
        }
        true
    });
    count
}

// ============================================================================
// Message board sample domain
// ============================================================================

/// An object literal for one message.
#[must_use]
pub fn message(author: &str, text: &str) -> Value {
    Value::obj([("author", Value::from(author)), ("text", Value::from(text))])
}

/// A store with a `messages` array and a `groups` dictionary.
pub fn create_message_board(trax: &Trax, seed: Vec<Value>) -> Result<Store> {
    trax.create_store("Board", move |store| {
        store.init(Value::obj([
            ("messages", Value::Array(seed)),
            ("groups", Value::dict(Vec::<(String, Value)>::new())),
        ]))?;
        Ok(())
    })
}

/// Installs the author-grouping processor: scans `messages`, maintains one
/// group object per distinct author under `groups`, and registers one async
/// "author info" processor per group. Groups of authors already seen are
/// reused untouched (get-or-create), so inserting a message from a new
/// author creates exactly one new group and one new processor.
pub fn install_author_grouping(store: &Store) -> Result<Processor> {
    let root = store.root()?;
    let store_handle = store.clone();
    store.compute("GroupByAuthor", move || {
        let Some(messages) = root.get_array("messages")? else {
            return Ok(());
        };
        let Some(groups) = root.get_dict("groups")? else {
            return Ok(());
        };

        let mut counts: Vec<(String, i64)> = Vec::new();
        for i in 0..messages.len()? {
            let Some(entry) = messages.get(i)?.as_tracked().cloned() else {
                continue;
            };
            let author = entry
                .as_object()?
                .get("author")?
                .as_str()
                .map(|s| s.to_string())
                .unwrap_or_default();
            match counts.iter_mut().find(|(a, _)| *a == author) {
                Some((_, n)) => *n += 1,
                None => counts.push((author, 1)),
            }
        }

        for (author, count) in counts {
            let group = store_handle.add(
                &["groups", author.as_str()],
                Value::obj([("author", Value::from(author.as_str()))]),
            )?;
            let group = group.as_object()?;
            group.set("count", count)?;
            groups.set(&author, group.clone())?;

            let target = group.clone();
            let display = author.clone();
            store_handle.compute_async(&format!("AuthorInfo[{author}]"), move || {
                let target = target.clone();
                let display = display.clone();
                async move { target.set("displayName", format!("Author {display}")) }
            })?;
        }
        Ok(())
    })
}
