pub mod sqlite;

use crate::{
    core::decisions::{DecisionSnapshotV1, StoreError},
    op::StoredHideOp,
    types::OpSeq,
};

#[derive(Debug, thiserror::Error)]
pub enum PersistError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("serde: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("{0}")]
    Message(String),
}

impl From<StoreError> for PersistError {
    fn from(value: StoreError) -> Self {
        Self::Message(format!("store error: {value}"))
    }
}

pub type PersistResult<T> = Result<T, PersistError>;

/// Durable home for hide decisions.
///
/// Implementations receive the decision store's journal in sequence order.
pub trait HideSink: Send {
    fn append_ops(&mut self, ops: &[StoredHideOp]) -> PersistResult<OpSeq>;
    fn flush(&mut self) -> PersistResult<()> {
        Ok(())
    }
    fn write_snapshot(&mut self, _snapshot: &DecisionSnapshotV1, _last_seq: OpSeq) -> PersistResult<()> {
        Ok(())
    }
    fn compact_through(&mut self, _seq: OpSeq) -> PersistResult<usize> {
        Ok(0)
    }
}
