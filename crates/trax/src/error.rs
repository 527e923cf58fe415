//! Error taxonomy for the trax engine.
//!
//! Two propagation regimes coexist:
//!
//! - **Engine invariant violations** (operating on a disposed container,
//!   resolving an unknown id, a runaway reconciliation loop) surface
//!   synchronously as `Err` to the caller of the offending operation.
//! - **Compute-body failures** are captured by the scheduler, logged as
//!   [`Error`](crate::log::EventKind::Error) events on the stream, and never
//!   escape [`reconciliation`](crate::Trax::reconciliation). A processor that
//!   failed stays usable and runs again on the next dirtying.

use crate::id::TraxId;

/// The error type shared by all engine operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// An operation was attempted on a disposed trackable, processor, store,
    /// or a torn-down environment.
    #[error("`{0}` has been disposed")]
    ObjectDisposed(TraxId),

    /// A reference to a trax id that does not exist in this environment.
    #[error("unknown trax id `{0}`")]
    UnknownId(String),

    /// The reconciliation pass exceeded its compute cap, which signals a
    /// circular compute dependency between processors.
    #[error("reconciliation loop detected: more than {0} computations in one pass")]
    ReconciliationLoopDetected(u32),

    /// A user compute body returned an error. Recovered locally by the
    /// scheduler; only visible to code that inspects processor results
    /// directly (e.g. [`AsyncFn`](crate::store::AsyncFn) calls).
    #[error("compute error in `{processor}`: {message}")]
    ComputeError {
        /// Id of the processor whose body failed.
        processor: TraxId,
        /// Stringified error returned by the body.
        message: String,
    },

    /// A log consumer detected missing or out-of-order cycle ids. Produced by
    /// [`Log::verify_cycle_sequence`](crate::log::Log::verify_cycle_sequence),
    /// never raised by the engine itself.
    #[error("invalid cycle sequence: expected cycle {expected}, found {found}")]
    InvalidCycleSequence {
        /// The cycle number the consumer expected next.
        expected: u64,
        /// The cycle number actually observed.
        found: u64,
    },

    /// A typed accessor was used against a container of a different kind,
    /// e.g. array operations through a dictionary handle.
    #[error("`{id}` is not {expected}")]
    TypeMismatch {
        /// Id of the mistyped container.
        id: TraxId,
        /// Human-readable name of the expected kind.
        expected: &'static str,
    },
}

/// Result alias used across the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;
