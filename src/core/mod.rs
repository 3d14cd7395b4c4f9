//! In-memory reply graph and hide decision stores.

/// Hide decision arena, change stream and op journal.
pub mod decisions;
/// Helper set and index aliases.
pub mod indices;
/// Per-thread reply graph arena.
pub mod reply_graph;
