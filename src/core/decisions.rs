use std::time::{SystemTime, UNIX_EPOCH};

use hashbrown::HashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, trace};

use crate::{
    hide::PostHide,
    op::{HideOp, StoredHideOp},
    runtime::events::HideEvent,
    types::{ChanDescriptor, OpSeq, PostDescriptor, ThreadDescriptor},
};

const EVENT_CAPACITY: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("duplicate decision for {0}")]
    DuplicateDecision(PostDescriptor),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecisionSnapshotV1 {
    pub next_op_seq: OpSeq,
    pub decisions: Vec<PostHide>,
}

type ThreadDecisions = HashMap<PostDescriptor, PostHide>;

/// Result of [`HideDecisionStore::upsert_if_unchanged`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommitOutcome {
    /// Decisions written.
    pub written: Vec<PostHide>,
    /// Posts whose stored decision moved since it was read; nothing was
    /// written for them.
    pub conflicts: Vec<PostDescriptor>,
}

#[derive(Debug, Default)]
struct DecisionArena {
    threads: HashMap<ThreadDescriptor, ThreadDecisions>,
    pending_ops: Vec<StoredHideOp>,
    next_op_seq: OpSeq,
    journal: bool,
}

impl DecisionArena {
    fn get(&self, post: &PostDescriptor) -> Option<&PostHide> {
        self.threads.get(&post.thread)?.get(post)
    }

    fn write(&mut self, hide: PostHide) {
        self.threads
            .entry(hide.post.thread.clone())
            .or_default()
            .insert(hide.post.clone(), hide.clone());
        self.journal(HideOp::Upsert { hide });
    }

    fn remove(&mut self, post: &PostDescriptor) -> bool {
        let Some(thread) = self.threads.get_mut(&post.thread) else {
            return false;
        };
        if thread.remove(post).is_none() {
            return false;
        }
        if thread.is_empty() {
            self.threads.remove(&post.thread);
        }

        self.journal(HideOp::Remove { post: post.clone() });
        true
    }

    fn journal(&mut self, op: HideOp) {
        let seq = self.take_next_op_seq();
        if self.journal {
            self.pending_ops.push(StoredHideOp {
                seq,
                ts_ms: now_ms(),
                op,
            });
        }
    }

    fn insert_silently(&mut self, hide: PostHide) -> Option<PostHide> {
        self.threads
            .entry(hide.post.thread.clone())
            .or_default()
            .insert(hide.post.clone(), hide)
    }

    fn take_next_op_seq(&mut self) -> OpSeq {
        let seq = self.next_op_seq;
        self.next_op_seq += 1;
        seq
    }
}

/// In-memory hide decisions for every loaded thread.
///
/// All reads and writes go through one lock. Writes that do not change a
/// post's visibility-relevant fields are dropped, so subscribers only hear
/// about posts whose rendering really has to change.
///
/// A store built with [`HideDecisionStore::new`] journals every write until
/// [`HideDecisionStore::drain_pending_ops`] is called; the runtime drains it
/// after each command. Callers that never persist should use
/// [`HideDecisionStore::without_journal`] so the journal does not grow.
#[derive(Debug)]
pub struct HideDecisionStore {
    inner: Mutex<DecisionArena>,
    events_tx: broadcast::Sender<HideEvent>,
}

impl Default for HideDecisionStore {
    fn default() -> Self {
        Self::new()
    }
}

impl HideDecisionStore {
    pub fn new() -> Self {
        Self::with_journal(true)
    }

    /// A store that keeps sequence numbers but never queues journal ops.
    pub fn without_journal() -> Self {
        Self::with_journal(false)
    }

    fn with_journal(journal: bool) -> Self {
        let (events_tx, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Mutex::new(DecisionArena {
                next_op_seq: 1,
                journal,
                ..DecisionArena::default()
            }),
            events_tx,
        }
    }

    pub fn from_snapshot(snapshot: DecisionSnapshotV1) -> Result<Self, StoreError> {
        let store = Self::new();
        {
            let mut arena = store.inner.lock();
            arena.next_op_seq = snapshot.next_op_seq.max(1);
            for hide in snapshot.decisions {
                let post = hide.post.clone();
                if arena.insert_silently(hide).is_some() {
                    return Err(StoreError::DuplicateDecision(post));
                }
            }
        }
        Ok(store)
    }

    pub fn export_snapshot(&self) -> DecisionSnapshotV1 {
        let arena = self.inner.lock();
        let mut decisions: Vec<PostHide> = arena
            .threads
            .values()
            .flat_map(|thread| thread.values().cloned())
            .collect();
        decisions.sort_by(|a, b| a.post.cmp(&b.post));

        DecisionSnapshotV1 {
            next_op_seq: arena.next_op_seq,
            decisions,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<HideEvent> {
        self.events_tx.subscribe()
    }

    /// Sender side of the change stream, shared with the runtime loop.
    pub fn events_sender(&self) -> broadcast::Sender<HideEvent> {
        self.events_tx.clone()
    }

    pub fn get(&self, post: &PostDescriptor) -> Option<PostHide> {
        self.inner.lock().get(post).cloned()
    }

    pub fn is_hidden(&self, post: &PostDescriptor) -> bool {
        self.inner.lock().get(post).is_some_and(PostHide::is_hidden)
    }

    /// Decisions visible from `chan`.
    ///
    /// For a catalog these are the decisions of each thread's OP.
    pub fn decisions_for(&self, chan: &ChanDescriptor) -> HashMap<PostDescriptor, PostHide> {
        let arena = self.inner.lock();
        match chan {
            ChanDescriptor::Thread(thread) => arena.threads.get(thread).cloned().unwrap_or_default(),
            ChanDescriptor::Catalog(catalog) => arena
                .threads
                .iter()
                .filter(|(thread, _)| &thread.catalog == catalog)
                .filter_map(|(thread, decisions)| decisions.get(&thread.op()))
                .map(|hide| (hide.post.clone(), hide.clone()))
                .collect(),
        }
    }

    pub fn hidden_posts(&self, chan: &ChanDescriptor) -> Vec<PostDescriptor> {
        let mut out: Vec<PostDescriptor> = self
            .decisions_for(chan)
            .into_values()
            .filter(PostHide::is_hidden)
            .map(|hide| hide.post)
            .collect();
        out.sort();
        out
    }

    /// Writes each decision that differs from the stored one.
    ///
    /// A post without a stored decision compares as [`PostHide::unspecified`].
    /// Returns the decisions actually written.
    pub fn upsert(&self, decisions: impl IntoIterator<Item = PostHide>) -> Vec<PostHide> {
        let written = {
            let mut arena = self.inner.lock();
            let mut written = Vec::new();
            for hide in decisions {
                let changed = match arena.get(&hide.post) {
                    Some(existing) => hide.differs_from(existing),
                    None => hide.differs_from(&PostHide::unspecified(hide.post.clone())),
                };
                if !changed {
                    trace!(post = %hide.post, "skipping redundant decision write");
                    continue;
                }
                arena.write(hide.clone());
                written.push(hide);
            }
            written
        };

        self.emit_changed(written.iter().map(|hide| hide.post.clone()).collect());
        written
    }

    /// Writes derived decisions computed from an earlier read.
    ///
    /// Each entry pairs the decision the caller read (`None` for no record)
    /// with the one it wants stored. An entry whose stored decision no longer
    /// matches the read one is reported as a conflict and left alone.
    pub fn upsert_if_unchanged(
        &self,
        writes: impl IntoIterator<Item = (Option<PostHide>, PostHide)>,
    ) -> CommitOutcome {
        let outcome = {
            let mut arena = self.inner.lock();
            let mut outcome = CommitOutcome::default();
            for (read, next) in writes {
                let current = arena.get(&next.post).cloned();
                let unchanged = match (&current, &read) {
                    (None, None) => true,
                    (Some(current), Some(read)) => !current.differs_from(read),
                    _ => false,
                };
                if !unchanged {
                    trace!(post = %next.post, "decision moved since it was read");
                    outcome.conflicts.push(next.post);
                    continue;
                }

                let base = current.unwrap_or_else(|| PostHide::unspecified(next.post.clone()));
                if !next.differs_from(&base) {
                    continue;
                }
                arena.write(next.clone());
                outcome.written.push(next);
            }
            outcome
        };

        self.emit_changed(outcome.written.iter().map(|hide| hide.post.clone()).collect());
        outcome
    }

    /// Read-mutate-write of the decisions for `posts`.
    ///
    /// The mutator sees [`PostHide::unspecified`] for posts with no decision.
    pub fn update<F>(&self, posts: &[PostDescriptor], mut mutator: F) -> Vec<PostHide>
    where
        F: FnMut(PostHide) -> PostHide,
    {
        let written = {
            let mut arena = self.inner.lock();
            let mut written = Vec::new();
            for post in posts {
                let current = arena
                    .get(post)
                    .cloned()
                    .unwrap_or_else(|| PostHide::unspecified(post.clone()));
                let mut next = mutator(current.clone());
                next.post = post.clone();
                if !next.differs_from(&current) {
                    continue;
                }
                arena.write(next.clone());
                written.push(next);
            }
            written
        };

        self.emit_changed(written.iter().map(|hide| hide.post.clone()).collect());
        written
    }

    /// Drops the decisions for `posts`, returning the posts that had one.
    pub fn remove(&self, posts: &[PostDescriptor]) -> Vec<PostDescriptor> {
        let removed: Vec<PostDescriptor> = {
            let mut arena = self.inner.lock();
            posts
                .iter()
                .filter(|post| arena.remove(post))
                .cloned()
                .collect()
        };

        self.emit_changed(removed.clone());
        removed
    }

    pub fn clear_thread(&self, thread: &ThreadDescriptor) -> Vec<PostDescriptor> {
        let posts: Vec<PostDescriptor> = {
            let arena = self.inner.lock();
            arena
                .threads
                .get(thread)
                .map(|decisions| decisions.keys().cloned().collect())
                .unwrap_or_default()
        };
        self.remove(&posts)
    }

    /// Loads persisted decisions without journaling or emitting events.
    pub fn restore(&self, decisions: impl IntoIterator<Item = PostHide>) {
        let mut arena = self.inner.lock();
        let mut count = 0usize;
        for hide in decisions {
            arena.insert_silently(hide);
            count += 1;
        }
        debug!(count, "restored hide decisions");
    }

    pub fn apply_replayed_op(&self, stored: StoredHideOp) {
        let mut arena = self.inner.lock();
        match stored.op {
            HideOp::Upsert { hide } => {
                arena.insert_silently(hide);
            }
            HideOp::Remove { post } => {
                if let Some(thread) = arena.threads.get_mut(&post.thread) {
                    thread.remove(&post);
                    if thread.is_empty() {
                        arena.threads.remove(&post.thread);
                    }
                }
            }
        }
        arena.next_op_seq = arena.next_op_seq.max(stored.seq.saturating_add(1));
    }

    /// Forgets a thread's in-memory decisions without journaling a removal.
    pub fn evict_thread(&self, thread: &ThreadDescriptor) -> usize {
        let removed = self
            .inner
            .lock()
            .threads
            .remove(thread)
            .map(|decisions| decisions.len())
            .unwrap_or(0);
        debug!(thread = thread.thread_no, removed, "evicted thread decisions");
        removed
    }

    pub fn len(&self) -> usize {
        self.inner.lock().threads.values().map(HashMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn drain_pending_ops(&self) -> Vec<StoredHideOp> {
        std::mem::take(&mut self.inner.lock().pending_ops)
    }

    pub fn latest_op_seq(&self) -> OpSeq {
        self.inner.lock().next_op_seq.saturating_sub(1)
    }

    fn emit_changed(&self, mut posts: Vec<PostDescriptor>) {
        if posts.is_empty() {
            return;
        }
        posts.sort();
        posts.dedup();
        let _ = self.events_tx.send(HideEvent::PostsChanged { posts });
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
