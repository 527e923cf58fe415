use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

use crate::{
    engine::graph::DependencyGraph,
    id::TraxId,
    trackable::PropKey,
    Trax, Value,
};

#[test]
fn store_prefixes_disambiguate_against_live_stores() {
    let trax = Trax::new();
    let a = trax.create_store("App", |_| Ok(())).unwrap();
    let b = trax.create_store("App", |_| Ok(())).unwrap();
    let c = trax.create_store("App", |_| Ok(())).unwrap();
    assert_eq!(a.id(), "App");
    assert_eq!(b.id(), "App1");
    assert_eq!(c.id(), "App2");

    // disposing frees the prefix for reuse
    b.dispose();
    let d = trax.create_store("App1", |_| Ok(())).unwrap();
    assert_eq!(d.id(), "App1");
}

#[test]
fn data_ids_are_never_reused_within_a_live_store() {
    let trax = Trax::new();
    let registry = &trax.inner.registry;
    let base = TraxId::data("App", "root:items");
    assert_eq!(registry.claim_data_id(base.clone()).as_str(), "App/root:items");
    assert_eq!(
        registry.claim_data_id(base.clone()).as_str(),
        "App/root:items-2"
    );
    assert_eq!(
        registry.claim_data_id(base.clone()).as_str(),
        "App/root:items-3"
    );

    registry.release_data_id(&base);
    assert_eq!(registry.claim_data_id(base).as_str(), "App/root:items");
}

#[test]
fn graph_edges_clear_in_both_directions() {
    let mut graph = DependencyGraph::default();
    let x = (TraxId::data("S", "root"), PropKey::prop("x"));
    let y = (TraxId::data("S", "root"), PropKey::prop("y"));

    graph.register_read(1, x.clone());
    graph.register_read(1, y.clone());
    graph.register_read(2, x.clone());
    assert_eq!(graph.readers_of(&x), [1, 2]);
    assert_eq!(graph.read_count(1), 2);

    graph.clear_processor(1);
    assert_eq!(graph.readers_of(&x), [2]);
    assert_eq!(graph.readers_of(&y), Vec::<u64>::new());
    assert_eq!(graph.read_count(1), 0);
}

#[tokio::test]
async fn dependencies_rebuild_per_compute() {
    let trax = Trax::new();
    let store = trax
        .create_store("Cond", |store| {
            store.init(Value::obj([
                ("flag", Value::Bool(true)),
                ("a", Value::Int(1)),
                ("b", Value::Int(2)),
                ("out", Value::Int(0)),
            ]))?;
            Ok(())
        })
        .unwrap();
    let root = store.root().unwrap();

    let r = root.clone();
    let processor = store
        .compute("Pick", move || {
            let flag = r.get("flag")?.as_bool().copied().unwrap_or(false);
            let value = if flag { r.get("a")? } else { r.get("b")? };
            r.set("out", value)
        })
        .unwrap();

    let deps: Vec<String> = processor.dependencies().iter().map(|(_, p)| p.clone()).collect();
    assert!(deps.contains(&"a".to_string()));
    assert!(!deps.contains(&"b".to_string()));

    // the branch flips: `a` is no longer read, `b` is
    root.set("flag", false).unwrap();
    trax.reconciliation().await.unwrap();

    let deps: Vec<String> = processor.dependencies().iter().map(|(_, p)| p.clone()).collect();
    assert!(!deps.contains(&"a".to_string()));
    assert!(deps.contains(&"b".to_string()));

    // a write to the dropped dependency no longer dirties the processor
    root.set("a", 99).unwrap();
    assert!(!processor.is_dirty());
}

#[tokio::test]
async fn self_writes_do_not_redirty_the_writer() {
    let trax = Trax::new();
    let runs = Arc::new(AtomicUsize::new(0));
    let store = trax
        .create_store("Counter", |store| {
            store.init(Value::obj([("n", Value::Int(0))]))?;
            Ok(())
        })
        .unwrap();
    let root = store.root().unwrap();

    let r = root.clone();
    let counted = runs.clone();
    let processor = store
        .compute("Bump", move || {
            counted.fetch_add(1, Ordering::SeqCst);
            let n = r.get("n")?.as_int().copied().unwrap_or(0);
            r.set("n", n + 1)
        })
        .unwrap();

    assert_eq!(runs.load(Ordering::SeqCst), 1);
    assert!(!processor.is_dirty());
    trax.reconciliation().await.unwrap();
    assert_eq!(runs.load(Ordering::SeqCst), 1);

    // an external write to the same property does dirty it
    root.set("n", 10).unwrap();
    assert!(processor.is_dirty());
    trax.reconciliation().await.unwrap();
    assert_eq!(runs.load(Ordering::SeqCst), 2);
    assert_eq!(root.get("n").unwrap().as_int().copied(), Some(11));
}

#[tokio::test]
async fn active_processor_is_visible_during_computation() {
    let trax = Trax::new();
    let seen = Arc::new(parking_lot::Mutex::new(None));
    let store = trax
        .create_store("Active", |store| {
            store.init(Value::obj([("x", Value::Int(0))]))?;
            Ok(())
        })
        .unwrap();
    let root = store.root().unwrap();

    let r = root.clone();
    let observer = trax.clone();
    let slot = seen.clone();
    store
        .compute("Watch", move || {
            let _ = r.get("x")?;
            *slot.lock() = observer.get_active_processor().map(|p| p.id().clone());
            Ok(())
        })
        .unwrap();

    assert_eq!(
        seen.lock().as_ref().map(|id| id.as_str().to_string()),
        Some("Active#Watch:1".to_string())
    );
    assert!(trax.get_active_processor().is_none());
}
