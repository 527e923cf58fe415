//! # Trax: Cycle-Based Reactive Dataflow Engine
//!
//! Trax is a transactional, cycle-based dataflow runtime. Mutable tracked
//! containers (objects, arrays, dictionaries) are observed by **processors**
//! (derivation functions, synchronous or asynchronous) whose dependency
//! sets are captured lazily from the property reads they actually perform.
//! Writes apply immediately and synchronously dirty the processors that
//! depend on them; a **reconciliation pass** then recomputes exactly the
//! dirty processors, in priority order, grouping everything that happened
//! since the previous pass into one numbered **cycle** on a structured event
//! stream.
//!
//! Typical use cases include:
//! - Derived view models recomputed from mutable application state
//! - Incremental aggregation over collections (group-by, totals, indexes)
//! - Devtools and instrumentation built on the event stream
//!
//! ## Key Features
//!
//! - **Lazy dependency capture**: a processor depends on exactly what its
//!   last run read; conditional branches drop stale dependencies
//! - **Cycle-based reconciliation**: dirty processors run once per pass, in
//!   `(priority, registration order)` position, renderers last
//! - **Suspendable computations**: async bodies park on unresolved futures
//!   without blocking the pass, and resume in a later cycle
//! - **Minimal collection diffing**: `update_array` / `update_dictionary`
//!   mutate only the slots that changed, preserving element identity
//! - **Structured event stream**: every read, write, creation, disposal, and
//!   processor transition is appended to a cycle-scoped log with
//!   subscription, replay, and await support
//! - **Isolated environments**: all state hangs off an explicit [`Trax`]
//!   handle; no process globals, tests run in parallel
//!
//! ## Example
//!
//! ```rust
//! use trax::{Trax, Value};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> trax::Result<()> {
//! let trax = Trax::new();
//! let store = trax.create_store("Cart", |store| {
//!     store.init(Value::obj([
//!         ("quantity", Value::Int(1)),
//!         ("total", Value::Int(0)),
//!     ]))?;
//!     Ok(())
//! })?;
//! let root = store.root()?;
//!
//! // processors run once at creation to capture their dependencies
//! let cart = root.clone();
//! store.compute("Total", move || {
//!     let quantity = cart.get("quantity")?.as_int().copied().unwrap_or(0);
//!     cart.set("total", quantity * 42)
//! })?;
//! assert_eq!(root.get("total")?.as_int().copied(), Some(42));
//!
//! // writes dirty dependent processors; reconciliation recomputes them
//! root.set("quantity", 3)?;
//! trax.reconciliation().await?;
//! assert_eq!(root.get("total")?.as_int().copied(), Some(126));
//! # Ok(())
//! # }
//! ```
//!
//! ## Core Concepts
//!
//! ### Tracked containers
//!
//! [`Store::init`] and [`Store::add`] materialize [`Value`] literals into
//! tracked containers with stable, human-readable ids
//! (`<storeId>/<objectPath>`). Identity survives content mutation; replacing
//! a property never changes the id of its container.
//!
//! ### Processors
//!
//! [`Store::compute`] registers a named derivation. Each run clears and
//! recaptures the dependency set, so processors stay subscribed to exactly
//! what they read. Async processors ([`Store::compute_async`]) may suspend;
//! dirtying while suspended coalesces into a single re-run.
//!
//! ### Reconciliation
//!
//! [`Trax::reconciliation`] drains the dirty queue breadth-first and closes
//! the current cycle. Runaway dependency loops abort the pass with
//! [`Error::ReconciliationLoopDetected`]. Compute-body failures are logged
//! as `Error` events and never escape the pass.

pub mod config;
pub mod engine;
pub mod error;
pub mod id;
pub mod log;
pub mod processor;
pub mod store;
pub mod trackable;
pub mod value;

mod diff;

pub use config::TraxConfig;
pub use engine::Trax;
pub use error::{Error, Result};
pub use id::TraxId;
pub use log::{EventId, EventKind, Log, StreamEvent, SubscriptionId};
pub use processor::{
    AsyncComputeFn, ComputeFn, Processor, ProcessorOptions, ProcessorState,
};
pub use store::{AsyncFn, InitOptions, Store};
pub use trackable::{
    PropKey, Trackable, TrackableKind, TraxArray, TraxDict, TraxObject,
};
pub use value::Value;
