//! Hide propagation engines.

/// Parallel full re-filter used on initial load.
pub mod batch;
/// Incremental cascade over the reply graph.
pub mod propagation;
/// Post cache collaborator trait.
pub mod traits;
