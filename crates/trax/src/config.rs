//! Engine tuning knobs.

/// Configuration for a [`Trax`](crate::Trax) environment.
///
/// The engine is dynamically typed at the value layer, so configuration is a
/// plain struct rather than a type parameter. All fields have conservative
/// defaults; construct with struct-update syntax:
///
/// ```rust
/// use trax::{Trax, TraxConfig};
///
/// let trax = Trax::with_config(TraxConfig {
///     retained_cycles: 32,
///     ..TraxConfig::default()
/// });
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TraxConfig {
    /// Number of completed cycles whose events stay available to
    /// [`Log::scan`](crate::log::Log::scan). Older cycles are discarded.
    pub retained_cycles: usize,

    /// Maximum number of processor computations allowed in a single
    /// reconciliation pass. Exceeding the cap aborts the pass with
    /// [`Error::ReconciliationLoopDetected`](crate::Error::ReconciliationLoopDetected).
    pub reconciliation_loop_cap: u32,
}

impl Default for TraxConfig {
    fn default() -> Self {
        Self {
            retained_cycles: 8,
            reconciliation_loop_cap: 1000,
        }
    }
}
