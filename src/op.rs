//! Decision journal ops and persistence wrappers.

use serde::{Deserialize, Serialize};

use crate::{
    hide::PostHide,
    types::{OpSeq, PostDescriptor},
};

/// Version number for serialized [`StoredHideOpEnvelope`] payloads.
pub const OP_FORMAT_VERSION: u16 = 1;

/// Immutable decision write appended to the journal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum HideOp {
    /// Insert or replace the decision for `hide.post`.
    Upsert {
        /// New decision.
        hide: PostHide,
    },
    /// Drop the decision for a post.
    Remove {
        /// Post whose decision was dropped.
        post: PostDescriptor,
    },
}

impl HideOp {
    /// Post this op targets.
    pub fn post(&self) -> &PostDescriptor {
        match self {
            Self::Upsert { hide } => &hide.post,
            Self::Remove { post } => post,
        }
    }
}

/// Journal row metadata plus op payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredHideOp {
    /// Monotonic op sequence.
    pub seq: OpSeq,
    /// Op timestamp in milliseconds.
    pub ts_ms: u64,
    /// Op body.
    pub op: HideOp,
}

/// Versioned wrapper for stable on-disk payload decoding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredHideOpEnvelope {
    /// Payload format version.
    pub format_version: u16,
    /// Wrapped op.
    pub stored: StoredHideOp,
}

impl StoredHideOpEnvelope {
    /// Constructs an envelope using [`OP_FORMAT_VERSION`].
    pub fn new(stored: StoredHideOp) -> Self {
        Self {
            format_version: OP_FORMAT_VERSION,
            stored,
        }
    }
}
