//! Event stream tests: cycle bracketing, ordering, subscriptions, replay,
//! and application-level events.

use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::json;
use trax::{StreamEvent, Value};
use trax_integration_test::{create_test_env, record_events};

fn collect(trax: &trax::Trax) -> Vec<StreamEvent> {
    let mut events = Vec::new();
    trax.log().scan(|event| {
        events.push(event.clone());
        true
    });
    events
}

#[tokio::test]
async fn cycles_bracket_all_events_and_ids_increase() {
    let trax = create_test_env();
    let store = trax
        .create_store("Brackets", |store| {
            store.init(Value::obj([("x", Value::Int(0)), ("y", Value::Int(0))]))?;
            Ok(())
        })
        .unwrap();
    let root = store.root().unwrap();
    let r = root.clone();
    store
        .compute("Copy", move || {
            let x = r.get("x")?.as_int().copied().unwrap_or(0);
            r.set("y", x)
        })
        .unwrap();
    trax.reconciliation().await.unwrap();

    root.set("x", 1).unwrap();
    trax.reconciliation().await.unwrap();

    let events = collect(&trax);
    assert!(events.len() > 4);

    // ids are strictly increasing in stream order
    for pair in events.windows(2) {
        assert!(pair[0].id < pair[1].id, "{} !< {}", pair[0].id, pair[1].id);
    }

    // each completed cycle starts with !CS at seq 0 and ends with !CC
    let mut cycle_numbers = Vec::new();
    for event in &events {
        match event.kind.code() {
            "!CS" => {
                assert_eq!(event.id.seq, 0);
                cycle_numbers.push(event.id.cycle);
            }
            "!CC" => assert_eq!(event.id.cycle, *cycle_numbers.last().unwrap()),
            _ => {}
        }
    }
    assert!(cycle_numbers.len() >= 2);
    assert!(cycle_numbers.windows(2).all(|w| w[0] < w[1]));
    trax.log().verify_cycle_sequence().unwrap();
}

#[tokio::test]
async fn processor_events_nest_between_start_and_end_markers() {
    let trax = create_test_env();
    let store = trax
        .create_store("Nest", |store| {
            store.init(Value::obj([("x", Value::Int(2)), ("sq", Value::Int(0))]))?;
            Ok(())
        })
        .unwrap();
    let root = store.root().unwrap();
    let r = root.clone();
    store
        .compute("Square", move || {
            let x = r.get("x")?.as_int().copied().unwrap_or(0);
            r.set("sq", x * x)
        })
        .unwrap();

    let events = collect(&trax);
    let start = events
        .iter()
        .position(|e| e.kind.code() == "!PCS" && e.data["processorId"] == json!("Nest#Square:1"))
        .unwrap();
    let end = events
        .iter()
        .position(|e| e.kind.code() == "!PCE" && e.data["processorId"] == json!("Nest#Square:1"))
        .unwrap();
    let get = events
        .iter()
        .position(|e| e.kind.code() == "!GET" && e.data["propName"] == json!("x"))
        .unwrap();
    let set = events
        .iter()
        .position(|e| e.kind.code() == "!SET" && e.data["propName"] == json!("sq"))
        .unwrap();

    assert!(start < get && get < set && set < end);
}

#[tokio::test]
async fn cycle_complete_reports_timings() {
    let trax = create_test_env();
    trax.log().info("tick");
    trax.reconciliation().await.unwrap();

    let events = collect(&trax);
    let complete = events.iter().find(|e| e.kind.code() == "!CC").unwrap();
    assert!(complete.data["elapsedTime"].is_number());
    assert!(complete.data["computeTime"].is_number());
}

#[tokio::test]
async fn set_events_carry_old_and_new_values() {
    let trax = create_test_env();
    let store = trax
        .create_store("Payload", |store| {
            store.init(Value::obj([("n", Value::Int(1))]))?;
            Ok(())
        })
        .unwrap();
    store.root().unwrap().set("n", 2).unwrap();

    let events = collect(&trax);
    let set = events.iter().find(|e| e.kind.code() == "!SET").unwrap();
    assert_eq!(set.data["objectId"], json!("Payload/root"));
    assert_eq!(set.data["propName"], json!("n"));
    assert_eq!(set.data["fromValue"], json!(1));
    assert_eq!(set.data["toValue"], json!(2));
}

#[tokio::test]
async fn application_events_share_the_stream() {
    let trax = create_test_env();
    let pings = record_events(&trax, "@app/ping");

    trax.log().event("@app/ping", json!({ "n": 1 }));
    trax.log().event("@app/pong", json!({ "n": 2 }));
    trax.log().info("note");
    trax.log().warning("careful");
    trax.log().error("broken");

    assert_eq!(pings.lock().len(), 1);

    let events = collect(&trax);
    let codes: Vec<&str> = events.iter().map(|e| e.kind.code()).collect();
    assert_eq!(
        codes,
        ["!CS", "@app/ping", "@app/pong", "!NFO", "!WRN", "!ERR"]
    );
    trax.reconciliation().await.unwrap();
}

#[tokio::test]
async fn await_event_matches_future_events() {
    let trax = create_test_env();
    let log = trax.log();

    let waiter = tokio::spawn({
        let log = log.clone();
        async move {
            log.await_event_matching("@job/done", |event| event.data["id"] == json!(2))
                .await
        }
    });
    tokio::task::yield_now().await;

    log.event("@job/done", json!({ "id": 1 }));
    log.event("@job/done", json!({ "id": 2 }));

    let hit = waiter.await.unwrap();
    assert_eq!(hit.data["id"], json!(2));
}

#[tokio::test]
async fn subscription_callbacks_run_synchronously_on_append() {
    let trax = create_test_env();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let subscription = trax.log().subscribe("!SET", move |event| {
        sink.lock().push(event.data["propName"].to_string());
    });

    let store = trax
        .create_store("Sub", |store| {
            store.init(Value::obj([("a", Value::Int(0))]))?;
            Ok(())
        })
        .unwrap();
    let root = store.root().unwrap();

    root.set("a", 1).unwrap();
    assert_eq!(seen.lock().len(), 1); // before the write call even settles

    assert!(trax.log().unsubscribe(subscription));
    root.set("a", 2).unwrap();
    assert_eq!(seen.lock().len(), 1);
}

#[tokio::test]
async fn scan_stops_when_the_scanner_returns_false() {
    let trax = create_test_env();
    trax.log().info("one");
    trax.log().info("two");
    trax.log().info("three");

    let mut seen = 0;
    trax.log().scan(|_| {
        seen += 1;
        seen < 2
    });
    assert_eq!(seen, 2);
}
