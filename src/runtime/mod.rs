//! Single-writer async runtime and event stream APIs.

/// Event stream types emitted by the stores and the runtime.
pub mod events;
/// Handle and command loop implementation.
pub mod handle;
