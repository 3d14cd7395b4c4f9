//! Decision journal stored in SQLite.
//!
//! `events` holds one row per journaled op, keyed by its sequence number and
//! indexed by thread. `snapshots` holds full decision dumps; a load starts at
//! the newest one and replays the rows after it.

use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use rusqlite::{Connection, OptionalExtension, Row, params};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::{
    core::decisions::{DecisionSnapshotV1, HideDecisionStore},
    op::{HideOp, OP_FORMAT_VERSION, StoredHideOp, StoredHideOpEnvelope},
    types::OpSeq,
};

use super::{HideSink, PersistError, PersistResult};

/// Bumped whenever `schema.sql` changes incompatibly.
const SCHEMA_VERSION: i64 = 1;
const SNAPSHOT_FORMAT_VERSION: u16 = 1;

// Rows already present are kept: a batch retried after a failed flush must
// not fail on its own earlier insert.
const INSERT_OP: &str = "INSERT INTO events \
     (seq, ts_ms, kind, site_key, board_code, thread_no, post_no, post_sub_no, payload) \
     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9) \
     ON CONFLICT(seq) DO NOTHING";
const SELECT_OPS_AFTER: &str =
    "SELECT seq, ts_ms, payload FROM events WHERE seq > ?1 ORDER BY seq";
const SELECT_NEWEST_SNAPSHOT: &str =
    "SELECT last_seq, payload FROM snapshots ORDER BY last_seq DESC, id DESC LIMIT 1";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SnapshotEnvelope {
    format_version: u16,
    snapshot: DecisionSnapshotV1,
}

/// [`HideSink`] writing to a SQLite database in WAL mode.
pub struct SqliteHideSink {
    conn: Connection,
}

impl SqliteHideSink {
    pub fn open(path: impl AsRef<Path>) -> PersistResult<Self> {
        Self::prepare(Connection::open(path)?)
    }

    pub fn open_in_memory() -> PersistResult<Self> {
        Self::prepare(Connection::open_in_memory()?)
    }

    fn prepare(conn: Connection) -> PersistResult<Self> {
        let version: i64 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;
        match version {
            0 => {
                conn.execute_batch(include_str!("schema.sql"))?;
                conn.pragma_update(None, "user_version", SCHEMA_VERSION)?;
                debug!(version = SCHEMA_VERSION, "created decision journal schema");
            }
            SCHEMA_VERSION => {}
            other => {
                return Err(PersistError::Message(format!(
                    "decision journal schema version {other} is not supported"
                )));
            }
        }
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        Ok(Self { conn })
    }

    /// Rebuilds the decision store: newest snapshot, then every later op.
    pub fn load_decisions(&self) -> PersistResult<HideDecisionStore> {
        let (store, from_seq) = match self.newest_snapshot()? {
            Some((last_seq, snapshot)) => (HideDecisionStore::from_snapshot(snapshot)?, last_seq),
            None => (HideDecisionStore::new(), 0),
        };

        let tail = self.load_ops_after(from_seq.max(store.latest_op_seq()))?;
        let replayed = tail.len();
        tail.into_iter().for_each(|op| store.apply_replayed_op(op));

        info!(
            decisions = store.len(),
            snapshot_seq = from_seq,
            replayed,
            "loaded hide decisions"
        );
        Ok(store)
    }

    /// Journaled ops with a sequence number above `seq`, oldest first.
    pub fn load_ops_after(&self, seq: OpSeq) -> PersistResult<Vec<StoredHideOp>> {
        let mut stmt = self.conn.prepare_cached(SELECT_OPS_AFTER)?;
        let ops = stmt
            .query_map(params![seq as i64], decode_op_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(ops)
    }

    pub fn write_snapshot(&mut self, snapshot: &DecisionSnapshotV1, last_seq: OpSeq) -> PersistResult<()> {
        let payload = serde_json::to_vec(&SnapshotEnvelope {
            format_version: SNAPSHOT_FORMAT_VERSION,
            snapshot: snapshot.clone(),
        })?;
        self.conn.execute(
            "INSERT INTO snapshots (last_seq, ts_ms, payload) VALUES (?1, ?2, ?3)",
            params![last_seq as i64, now_ms() as i64, payload],
        )?;
        debug!(last_seq, decisions = snapshot.decisions.len(), "wrote decision snapshot");
        Ok(())
    }

    /// Drops journal rows covered by a snapshot, returning how many went.
    pub fn compact_through(&mut self, seq: OpSeq) -> PersistResult<usize> {
        let dropped = self
            .conn
            .execute("DELETE FROM events WHERE seq <= ?1", params![seq as i64])?;
        debug!(seq, dropped, "compacted decision journal");
        Ok(dropped)
    }

    /// Highest journaled sequence number, zero for an empty journal.
    pub fn latest_seq(&self) -> PersistResult<OpSeq> {
        let seq: Option<i64> = self
            .conn
            .query_row("SELECT MAX(seq) FROM events", [], |row| row.get(0))
            .optional()?
            .flatten();
        Ok(seq.map_or(0, |seq| seq as OpSeq))
    }

    fn newest_snapshot(&self) -> PersistResult<Option<(OpSeq, DecisionSnapshotV1)>> {
        let row: Option<(i64, Vec<u8>)> = self
            .conn
            .query_row(SELECT_NEWEST_SNAPSHOT, [], |row| Ok((row.get(0)?, row.get(1)?)))
            .optional()?;
        let Some((last_seq, payload)) = row else {
            return Ok(None);
        };

        let envelope: SnapshotEnvelope = serde_json::from_slice(&payload)?;
        if envelope.format_version != SNAPSHOT_FORMAT_VERSION {
            warn!(version = envelope.format_version, "refusing decision snapshot");
            return Err(PersistError::Message(format!(
                "decision snapshot format {} is not supported",
                envelope.format_version
            )));
        }
        Ok(Some((last_seq as OpSeq, envelope.snapshot)))
    }
}

impl HideSink for SqliteHideSink {
    fn append_ops(&mut self, ops: &[StoredHideOp]) -> PersistResult<OpSeq> {
        let Some(last) = ops.last() else {
            return self.latest_seq();
        };

        let tx = self.conn.transaction()?;
        {
            let mut insert = tx.prepare_cached(INSERT_OP)?;
            for stored in ops {
                let post = stored.op.post();
                let payload = serde_json::to_vec(&StoredHideOpEnvelope::new(stored.clone()))?;
                insert.execute(params![
                    stored.seq as i64,
                    stored.ts_ms as i64,
                    kind_code(&stored.op),
                    post.thread.catalog.site_key,
                    post.thread.catalog.board_code,
                    post.thread.thread_no as i64,
                    post.post_no as i64,
                    post.post_sub_no as i64,
                    payload,
                ])?;
            }
        }
        tx.commit()?;
        Ok(last.seq)
    }

    fn flush(&mut self) -> PersistResult<()> {
        self.conn.execute_batch("PRAGMA wal_checkpoint(PASSIVE);")?;
        Ok(())
    }

    fn write_snapshot(&mut self, snapshot: &DecisionSnapshotV1, last_seq: OpSeq) -> PersistResult<()> {
        SqliteHideSink::write_snapshot(self, snapshot, last_seq)
    }

    fn compact_through(&mut self, seq: OpSeq) -> PersistResult<usize> {
        SqliteHideSink::compact_through(self, seq)
    }
}

/// Maps an `events` row back to the op it journaled.
///
/// The row's own `seq` and `ts_ms` columns win over the copies in the payload.
fn decode_op_row(row: &Row<'_>) -> rusqlite::Result<StoredHideOp> {
    let seq: i64 = row.get(0)?;
    let ts_ms: i64 = row.get(1)?;
    let payload: Vec<u8> = row.get(2)?;

    let bad_payload = |message: String| {
        rusqlite::Error::FromSqlConversionFailure(
            2,
            rusqlite::types::Type::Blob,
            Box::new(std::io::Error::other(message)),
        )
    };
    let envelope: StoredHideOpEnvelope = serde_json::from_slice(&payload)
        .map_err(|err| bad_payload(format!("op {seq} does not decode: {err}")))?;
    if envelope.format_version != OP_FORMAT_VERSION {
        return Err(bad_payload(format!(
            "op {seq} has format {}, expected {OP_FORMAT_VERSION}",
            envelope.format_version
        )));
    }

    Ok(StoredHideOp {
        seq: seq as OpSeq,
        ts_ms: ts_ms as u64,
        op: envelope.stored.op,
    })
}

fn kind_code(op: &HideOp) -> i64 {
    match op {
        HideOp::Upsert { .. } => 1,
        HideOp::Remove { .. } => 2,
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |elapsed| elapsed.as_millis() as u64)
}
