//! Worker count resolution
//!
//! Turns the configured `max_concurrent` value into the number of pool workers.

/// Upper bound for an auto-derived worker count.
const MAX_AUTO_WORKERS: usize = 8;

/// Resolve the configured concurrency into a worker count.
///
/// - An explicit non-zero value is used as-is
/// - `0` derives the count from the logical CPU count via num_cpus,
///   clamped to [1, 8]
pub fn resolve_concurrency(configured: u32) -> usize {
    if configured > 0 {
        configured as usize
    } else {
        derive_from_cores(num_cpus::get())
    }
}

/// Derive a worker count from a core count, clamped to [1, 8]
fn derive_from_cores(cores: usize) -> usize {
    cores.clamp(1, MAX_AUTO_WORKERS)
}
