//! Change stream payloads.

use crate::types::{OpSeq, PostDescriptor};

/// Events emitted by the decision store and the runtime loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HideEvent {
    /// Decisions for these posts were committed in memory; their rendering
    /// must be recomputed.
    PostsChanged {
        /// Affected posts, ascending.
        posts: Vec<PostDescriptor>,
    },
    /// Persistence has reached at least this op sequence.
    DurableUpTo {
        /// Highest sequence known durable.
        op_seq: OpSeq,
    },
    /// A journal write failed; in-memory decisions stay applied and the
    /// unwritten ops are retried.
    PersistFailed {
        /// Failure description.
        message: String,
    },
}
