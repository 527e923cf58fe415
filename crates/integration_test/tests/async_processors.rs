//! Suspension protocol tests: pause/resume, coalesced re-runs, rejection
//! recovery, and cancellation of suspended processors.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use trax::{Error, InitOptions, ProcessorState, Value};
use trax_integration_test::{
    count_retained, create_test_env, wait_until, RunCounter,
};

#[tokio::test]
async fn suspended_processors_resume_in_a_later_cycle() {
    let trax = create_test_env();
    let store = trax
        .create_store("Async", |store| {
            store.init(Value::obj([("x", Value::Int(7)), ("loaded", Value::Int(0))]))?;
            Ok(())
        })
        .unwrap();
    let root = store.root().unwrap();

    let (tx, rx) = oneshot::channel::<i64>();
    let rx_slot = Arc::new(Mutex::new(Some(rx)));
    let r = root.clone();
    let processor = store
        .compute_async("Load", move || {
            let r = r.clone();
            let rx = rx_slot.lock().take();
            async move {
                let base = r.get("x")?.as_int().copied().unwrap_or(0);
                let Some(rx) = rx else {
                    return Ok(());
                };
                let fetched = rx.await.unwrap_or(0);
                r.set("loaded", base + fetched)
            }
        })
        .unwrap();

    // the first poll happened synchronously at creation, then suspended
    assert_eq!(processor.state(), ProcessorState::Suspended);
    assert_eq!(processor.compute_count(), 0);
    assert_eq!(count_retained(&trax, "!PCP"), 1);

    // the suspended run does not block cycle completion
    trax.reconciliation().await.unwrap();

    tx.send(35).unwrap();
    let p = processor.clone();
    wait_until(move || p.state() == ProcessorState::Idle).await;

    assert_eq!(processor.compute_count(), 1);
    assert_eq!(root.get("loaded").unwrap().as_int().copied(), Some(42));
    assert_eq!(count_retained(&trax, "!PCR"), 1);
    assert_eq!(count_retained(&trax, "!PCE"), 1);

    // the resumption opened a strictly later cycle than the start
    let (mut start_cycle, mut resume_cycle) = (None, None);
    trax.log().scan(|event| {
        match event.kind.code() {
            "!PCS" => start_cycle.get_or_insert(event.id.cycle),
            "!PCR" => resume_cycle.get_or_insert(event.id.cycle),
            _ => &mut 0,
        };
        true
    });
    assert!(resume_cycle.unwrap() > start_cycle.unwrap());
}

#[tokio::test]
async fn dependencies_are_captured_across_suspension_points() {
    let trax = create_test_env();
    let store = trax
        .create_store("Span", |store| {
            store.init(Value::obj([
                ("before", Value::Int(1)),
                ("after", Value::Int(2)),
                ("sum", Value::Int(0)),
            ]))?;
            Ok(())
        })
        .unwrap();
    let root = store.root().unwrap();

    let (tx, rx) = mpsc::unbounded_channel::<()>();
    let gate = Arc::new(tokio::sync::Mutex::new(rx));
    let r = root.clone();
    let processor = store
        .compute_async("Sum", move || {
            let r = r.clone();
            let gate = gate.clone();
            async move {
                let a = r.get("before")?.as_int().copied().unwrap_or(0);
                gate.lock().await.recv().await;
                let b = r.get("after")?.as_int().copied().unwrap_or(0);
                r.set("sum", a + b)
            }
        })
        .unwrap();

    tx.send(()).unwrap();
    let p = processor.clone();
    wait_until(move || p.compute_count() == 1).await;
    assert_eq!(root.get("sum").unwrap().as_int().copied(), Some(3));

    let deps: Vec<String> = processor
        .dependencies()
        .iter()
        .map(|(_, prop)| prop.clone())
        .collect();
    assert!(deps.contains(&"before".to_string()));
    assert!(deps.contains(&"after".to_string()));

    // a write to the dependency read *after* the suspension re-runs the body
    root.set("after", 10).unwrap();
    tx.send(()).unwrap();
    trax.reconciliation().await.unwrap();
    let p = processor.clone();
    wait_until(move || p.compute_count() == 2).await;
    assert_eq!(root.get("sum").unwrap().as_int().copied(), Some(11));
}

#[tokio::test]
async fn dirtying_while_suspended_coalesces_into_one_rerun() {
    let trax = create_test_env();
    let store = trax
        .create_store("Coal", |store| {
            store.init(Value::obj([("x", Value::Int(0))]))?;
            Ok(())
        })
        .unwrap();
    let root = store.root().unwrap();

    let runs = RunCounter::new();
    let (tx, rx) = mpsc::unbounded_channel::<()>();
    let gate = Arc::new(tokio::sync::Mutex::new(rx));
    let (r, counted) = (root.clone(), runs.clone());
    let processor = store
        .compute_async("Slow", move || {
            let r = r.clone();
            let gate = gate.clone();
            let counted = counted.clone();
            async move {
                counted.bump();
                let _ = r.get("x")?;
                gate.lock().await.recv().await;
                Ok(())
            }
        })
        .unwrap();
    assert_eq!(runs.count(), 1);

    // two dirtying writes while suspended: coalesced into one pending re-run
    root.set("x", 1).unwrap();
    root.set("x", 2).unwrap();
    assert_eq!(processor.state(), ProcessorState::Suspended);
    assert!(!processor.is_dirty());

    tx.send(()).unwrap();
    let counted = runs.clone();
    wait_until(move || counted.count() == 2).await;

    tx.send(()).unwrap();
    let p = processor.clone();
    wait_until(move || p.compute_count() == 2).await;

    // no third run: both writes were folded into the single re-run
    trax.reconciliation().await.unwrap();
    assert_eq!(runs.count(), 2);
}

#[tokio::test]
async fn rejected_async_runs_are_logged_and_leave_the_processor_usable() {
    let trax = create_test_env();
    let store = trax
        .create_store("Reject", |store| {
            store.init(Value::obj([("x", Value::Int(0))]))?;
            Ok(())
        })
        .unwrap();
    let root = store.root().unwrap();

    let (tx, rx) = oneshot::channel::<()>();
    let rx_slot = Arc::new(Mutex::new(Some(rx)));
    let r = root.clone();
    let processor = store
        .compute_async("Doomed", move || {
            let r = r.clone();
            let rx = rx_slot.lock().take();
            async move {
                let _ = r.get("x")?;
                if let Some(rx) = rx {
                    let _ = rx.await;
                    return Err(Error::UnknownId("upstream rejected".to_string()));
                }
                Ok(())
            }
        })
        .unwrap();
    let count_before = processor.compute_count();

    tx.send(()).unwrap();
    let p = processor.clone();
    wait_until(move || p.state() == ProcessorState::Idle).await;

    assert_eq!(processor.compute_count(), count_before);
    assert!(!processor.is_disposed());
    assert_eq!(count_retained(&trax, "!ERR"), 1);
    assert_eq!(count_retained(&trax, "!PCE"), 0);

    // still usable: the next dirtying runs the body again, successfully
    root.set("x", 1).unwrap();
    trax.reconciliation().await.unwrap();
    assert_eq!(processor.compute_count(), count_before + 1);
}

#[tokio::test]
async fn disposing_a_suspended_processor_discards_its_resumption() {
    let trax = create_test_env();
    let store = trax
        .create_store("Cancel", |store| {
            store.init(Value::obj([("x", Value::Int(0)), ("out", Value::Int(0))]))?;
            Ok(())
        })
        .unwrap();
    let root = store.root().unwrap();

    let (tx, rx) = oneshot::channel::<i64>();
    let rx_slot = Arc::new(Mutex::new(Some(rx)));
    let r = root.clone();
    let processor = store
        .compute_async("Abandoned", move || {
            let r = r.clone();
            let rx = rx_slot.lock().take();
            async move {
                let Some(rx) = rx else {
                    return Ok(());
                };
                let fetched = rx.await.unwrap_or(0);
                r.set("out", fetched)
            }
        })
        .unwrap();
    assert_eq!(processor.state(), ProcessorState::Suspended);

    processor.dispose();
    assert!(processor.is_disposed());

    // the pending promise settles, but the result is discarded
    let _ = tx.send(42);
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    trax.reconciliation().await.unwrap();

    assert_eq!(root.get("out").unwrap().as_int().copied(), Some(0));
    assert_eq!(count_retained(&trax, "!PCE"), 0);
    assert_eq!(count_retained(&trax, "!PCR"), 0);
}

#[tokio::test]
async fn suspended_processors_do_not_block_other_work() {
    let trax = create_test_env();
    let store = trax
        .create_store("Mix", |store| {
            store.init(Value::obj([("x", Value::Int(0)), ("double", Value::Int(0))]))?;
            Ok(())
        })
        .unwrap();
    let root = store.root().unwrap();

    let (_tx, rx) = oneshot::channel::<()>();
    let rx_slot = Arc::new(Mutex::new(Some(rx)));
    store
        .compute_async("Stuck", move || {
            let rx = rx_slot.lock().take();
            async move {
                if let Some(rx) = rx {
                    let _ = rx.await;
                }
                Ok(())
            }
        })
        .unwrap();

    let r = root.clone();
    store
        .compute("Double", move || {
            let x = r.get("x")?.as_int().copied().unwrap_or(0);
            r.set("double", x * 2)
        })
        .unwrap();

    root.set("x", 21).unwrap();
    trax.reconciliation().await.unwrap();
    assert_eq!(root.get("double").unwrap().as_int().copied(), Some(42));
}

#[tokio::test]
async fn lifecycle_processors_from_init_options() {
    let trax = create_test_env();
    let inits = RunCounter::new();
    let changes = RunCounter::new();

    let (i, c) = (inits.clone(), changes.clone());
    let store = trax
        .create_store("Life", move |store| {
            let on_init = {
                let (store, i) = (store.clone(), i.clone());
                move || {
                    i.bump();
                    store.root()?.set("x", 1)
                }
            };
            let on_change = {
                let (store, c) = (store.clone(), c.clone());
                move || {
                    c.bump();
                    let _ = store.root()?.get("x")?;
                    Ok(())
                }
            };
            store.init_with(
                Value::obj([("x", Value::Int(0))]),
                InitOptions {
                    on_init: Some(Box::new(on_init)),
                    on_change: Some(Box::new(on_change)),
                    ..InitOptions::default()
                },
            )?;
            Ok(())
        })
        .unwrap();
    let root = store.root().unwrap();

    assert_eq!(inits.count(), 1);
    assert_eq!(changes.count(), 1);
    assert_eq!(root.get("x").unwrap().as_int().copied(), Some(1));

    root.set("x", 5).unwrap();
    trax.reconciliation().await.unwrap();
    assert_eq!(inits.count(), 1); // one-shot initializer stays frozen
    assert_eq!(changes.count(), 2);
}

#[tokio::test]
async fn async_fn_calls_are_bracketed_on_the_stream() {
    let trax = create_test_env();
    let store = trax
        .create_store("Fns", |store| {
            store.init(Value::obj([("greeting", Value::from("hey"))]))?;
            Ok(())
        })
        .unwrap();
    let root = store.root().unwrap();

    let r = root.clone();
    let greet = store
        .async_fn("Greet", move |name| {
            let r = r.clone();
            async move {
                tokio::task::yield_now().await;
                let prefix = r.get("greeting")?.as_str().map(|s| s.to_string()).unwrap_or_default();
                let name = name.as_str().map(|s| s.to_string()).unwrap_or_default();
                Ok(Value::from(format!("{prefix} {name}")))
            }
        })
        .unwrap();

    let out = greet.call("ada").await.unwrap();
    assert_eq!(out.as_str().map(|s| &**s), Some("hey ada"));

    assert_eq!(count_retained(&trax, "!PCS"), 1);
    assert_eq!(count_retained(&trax, "!PCE"), 1);
    // the yield produced one pause/resume pair
    assert_eq!(count_retained(&trax, "!PCP"), 1);
    assert_eq!(count_retained(&trax, "!PCR"), 1);

    let failing = store
        .async_fn("Fail", |_| async move {
            Err(Error::UnknownId("nope".to_string()))
        })
        .unwrap();
    assert!(failing.call(Value::Null).await.is_err());
    assert_eq!(count_retained(&trax, "!ERR"), 1);
}
