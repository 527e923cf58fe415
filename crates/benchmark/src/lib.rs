#![allow(missing_docs)]

use trax::{Store, Trax, TraxConfig, TraxObject, Value};

/// Environment with a wide retention window so benchmarks never pay for
/// cycle eviction mid-measurement.
#[must_use]
pub fn create_bench_env() -> Trax {
    Trax::with_config(TraxConfig {
        retained_cycles: 2,
        reconciliation_loop_cap: u32::MAX,
    })
}

/// Builds a store with `width` independent counters and one processor per
/// counter deriving its double.
pub fn build_fanout(trax: &Trax, width: usize) -> (Store, TraxObject) {
    let store = trax
        .create_store("Fanout", |store| {
            let mut props: Vec<(String, Value)> = Vec::new();
            for i in 0..width {
                props.push((format!("in{i}"), Value::Int(0)));
                props.push((format!("out{i}"), Value::Int(0)));
            }
            store.init(Value::Object(props))?;
            Ok(())
        })
        .expect("fanout store");
    let root = store.root().expect("root");
    for i in 0..width {
        let r = root.clone();
        let (input, output) = (format!("in{i}"), format!("out{i}"));
        store
            .compute(&format!("Double{i}"), move || {
                let n = r.get(&input)?.as_int().copied().unwrap_or(0);
                r.set(&output, n * 2)
            })
            .expect("fanout processor");
    }
    (store, root)
}

/// Builds a store with a chain of `depth` processors, each feeding the next
/// property, so one write cascades through the whole chain in a single pass.
pub fn build_chain(trax: &Trax, depth: usize) -> (Store, TraxObject) {
    let store = trax
        .create_store("Chain", |store| {
            let props: Vec<(String, Value)> =
                (0..=depth).map(|i| (format!("p{i}"), Value::Int(0))).collect();
            store.init(Value::Object(props))?;
            Ok(())
        })
        .expect("chain store");
    let root = store.root().expect("root");
    for i in 0..depth {
        let r = root.clone();
        let (input, output) = (format!("p{i}"), format!("p{}", i + 1));
        store
            .compute(&format!("Step{i}"), move || {
                let n = r.get(&input)?.as_int().copied().unwrap_or(0);
                r.set(&output, n + 1)
            })
            .expect("chain processor");
    }
    (store, root)
}
