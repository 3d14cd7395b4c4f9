use std::sync::Arc;

use tokio::{
    sync::{Mutex, broadcast, mpsc, oneshot},
    time::{Duration, Instant},
};
use tracing::{debug, info, trace, warn};

use crate::{
    core::{
        decisions::{DecisionSnapshotV1, HideDecisionStore, StoreError},
        reply_graph::ReplyGraphStore,
    },
    engine::{
        batch::{FilterError, FilterOutcome, PostFilterHelper},
        propagation::{PostHideHelper, PropagationOutcome},
        traits::PostCache,
    },
    hide::{PostCellData, PostHide},
    op::StoredHideOp,
    persist::{HideSink, PersistError, PersistResult},
    types::{ChanDescriptor, OpSeq, PostDescriptor},
};

use super::events::HideEvent;

#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("store: {0}")]
    Store(#[from] StoreError),
    #[error("persist: {0}")]
    Persist(#[from] PersistError),
    #[error("filter: {0}")]
    Filter(#[from] FilterError),
    #[error("runtime channel closed")]
    ChannelClosed,
}

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub flush_on_write: bool,
    pub batch_max_ops: usize,
    pub batch_max_latency_ms: u64,
    pub persist_queue_bound: usize,
    pub snapshot_every_ops: usize,
    pub compact_after_snapshot: bool,
    /// Workers for full re-filters; zero picks the available parallelism.
    pub filter_workers: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            flush_on_write: true,
            batch_max_ops: 32,
            batch_max_latency_ms: 75,
            persist_queue_bound: 64,
            snapshot_every_ops: 2000,
            compact_after_snapshot: false,
            filter_workers: 0,
        }
    }
}

/// A freshly parsed post and the posts its comment links quote.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestedPost {
    pub cell: PostCellData,
    pub replies_to: Vec<PostDescriptor>,
}

pub struct PostHideHandle {
    cmd_tx: mpsc::Sender<Command>,
    events_tx: broadcast::Sender<HideEvent>,
}

impl Clone for PostHideHandle {
    fn clone(&self) -> Self {
        Self {
            cmd_tx: self.cmd_tx.clone(),
            events_tx: self.events_tx.clone(),
        }
    }
}

type Reply<T> = oneshot::Sender<Result<T, RuntimeError>>;

enum Command {
    Ingest {
        chan: ChanDescriptor,
        posts: Vec<IngestedPost>,
        resp: Reply<PropagationOutcome>,
    },
    Hide {
        chan: ChanDescriptor,
        posts: Vec<PostDescriptor>,
        apply_to_replies: bool,
        reason: String,
        resp: Reply<PropagationOutcome>,
    },
    Unhide {
        chan: ChanDescriptor,
        posts: Vec<PostDescriptor>,
        resp: Reply<PropagationOutcome>,
    },
    ClearOverrides {
        chan: ChanDescriptor,
        posts: Vec<PostDescriptor>,
        resp: Reply<PropagationOutcome>,
    },
    FilterAll {
        chan: ChanDescriptor,
        posts: Vec<PostCellData>,
        resp: Reply<FilterOutcome>,
    },
    IsHidden {
        post: PostDescriptor,
        resp: oneshot::Sender<bool>,
    },
    HiddenPosts {
        chan: ChanDescriptor,
        resp: oneshot::Sender<Vec<PostDescriptor>>,
    },
    Flush {
        resp: Reply<OpSeq>,
    },
    Checkpoint {
        resp: Reply<()>,
    },
    Shutdown {
        resp: Reply<()>,
    },
}

enum PersistMsg {
    Ops(Vec<StoredHideOp>),
    Flush {
        resp: oneshot::Sender<PersistResult<OpSeq>>,
    },
    Checkpoint {
        snapshot: DecisionSnapshotV1,
        last_seq: OpSeq,
        compact: bool,
        resp: oneshot::Sender<PersistResult<()>>,
    },
    Shutdown {
        resp: oneshot::Sender<PersistResult<()>>,
    },
}

type DurableResult = PersistResult<OpSeq>;

/// What woke the command loop.
enum Wake {
    Command(Option<Command>),
    Durable(Option<DurableResult>),
}

struct LoopState {
    helper: PostHideHelper,
    filter: PostFilterHelper,
    decisions: Arc<HideDecisionStore>,
    cache: Arc<dyn PostCache>,
    config: RuntimeConfig,
    ops_since_snapshot: usize,
    backlog: Vec<StoredHideOp>,
    /// Last journal failure not yet followed by a successful write.
    journal_failure: Option<String>,
}

impl LoopState {
    fn note_durable(&mut self, result: DurableResult, events_tx: &broadcast::Sender<HideEvent>) {
        let event = match result {
            Ok(op_seq) => {
                self.journal_failure = None;
                HideEvent::DurableUpTo { op_seq }
            }
            Err(err) => {
                let message = err.to_string();
                self.journal_failure = Some(message.clone());
                HideEvent::PersistFailed { message }
            }
        };
        let _ = events_tx.send(event);
    }

    fn journal_health(&self) -> Result<(), RuntimeError> {
        match &self.journal_failure {
            Some(message) => Err(RuntimeError::Persist(PersistError::Message(format!(
                "decision journal is failing: {message}"
            )))),
            None => Ok(()),
        }
    }
}

pub fn spawn_post_hide(
    graph: Arc<ReplyGraphStore>,
    decisions: Arc<HideDecisionStore>,
    cache: Arc<dyn PostCache>,
    sink: Option<Box<dyn HideSink>>,
    config: RuntimeConfig,
) -> PostHideHandle {
    let (cmd_tx, mut cmd_rx) = mpsc::channel::<Command>(256);
    let events_tx = decisions.events_sender();

    let (persist_tx, mut durable_rx) = match sink {
        Some(sink) => {
            let (persist_tx, persist_rx) = mpsc::channel::<PersistMsg>(config.persist_queue_bound);
            let (durable_tx, durable_rx) = mpsc::unbounded_channel::<DurableResult>();
            spawn_journal_worker(sink, persist_rx, durable_tx, &config);
            (Some(persist_tx), Some(durable_rx))
        }
        None => (None, None),
    };

    let events_tx_loop = events_tx.clone();
    let mut state = LoopState {
        helper: PostHideHelper::new(Arc::clone(&graph), Arc::clone(&decisions)),
        filter: PostFilterHelper::new(graph, Arc::clone(&decisions), config.filter_workers),
        decisions,
        cache,
        config,
        ops_since_snapshot: 0,
        backlog: Vec::new(),
        journal_failure: None,
    };
    info!(filter_workers = state.filter.workers(), "post hide runtime started");

    tokio::spawn(async move {
        loop {
            let wake = match durable_rx.as_mut() {
                // Journal results go first so a command sees every result
                // reported before it arrived.
                Some(rx) => tokio::select! {
                    biased;
                    durable = rx.recv() => Wake::Durable(durable),
                    cmd = cmd_rx.recv() => Wake::Command(cmd),
                },
                None => Wake::Command(cmd_rx.recv().await),
            };

            match wake {
                Wake::Command(Some(cmd)) => {
                    if handle_command(cmd, &mut state, &events_tx_loop, persist_tx.as_ref()).await {
                        break;
                    }
                }
                Wake::Command(None) => break,
                Wake::Durable(Some(result)) => state.note_durable(result, &events_tx_loop),
                Wake::Durable(None) => {
                    warn!("decision journal worker stopped");
                    durable_rx = None;
                }
            }
        }
        debug!("post hide runtime stopped");
    });

    PostHideHandle { cmd_tx, events_tx }
}

impl PostHideHandle {
    pub fn subscribe(&self) -> broadcast::Receiver<HideEvent> {
        self.events_tx.subscribe()
    }

    /// Adds freshly parsed posts to the reply graph and settles their hide
    /// state along with every reply they affect.
    pub async fn ingest(
        &self,
        chan: ChanDescriptor,
        posts: Vec<IngestedPost>,
    ) -> Result<PropagationOutcome, RuntimeError> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Ingest { chan, posts, resp: tx }).await?;
        rx.await.map_err(|_| RuntimeError::ChannelClosed)?
    }

    pub async fn hide(
        &self,
        chan: ChanDescriptor,
        posts: Vec<PostDescriptor>,
        apply_to_replies: bool,
        reason: impl Into<String>,
    ) -> Result<PropagationOutcome, RuntimeError> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Hide {
            chan,
            posts,
            apply_to_replies,
            reason: reason.into(),
            resp: tx,
        })
        .await?;
        rx.await.map_err(|_| RuntimeError::ChannelClosed)?
    }

    pub async fn unhide(
        &self,
        chan: ChanDescriptor,
        posts: Vec<PostDescriptor>,
    ) -> Result<PropagationOutcome, RuntimeError> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Unhide { chan, posts, resp: tx }).await?;
        rx.await.map_err(|_| RuntimeError::ChannelClosed)?
    }

    /// Drops the user's own decisions for `posts`, letting ancestors decide again.
    pub async fn clear_overrides(
        &self,
        chan: ChanDescriptor,
        posts: Vec<PostDescriptor>,
    ) -> Result<PropagationOutcome, RuntimeError> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::ClearOverrides { chan, posts, resp: tx }).await?;
        rx.await.map_err(|_| RuntimeError::ChannelClosed)?
    }

    pub async fn filter_all(
        &self,
        chan: ChanDescriptor,
        posts: Vec<PostCellData>,
    ) -> Result<FilterOutcome, RuntimeError> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::FilterAll { chan, posts, resp: tx }).await?;
        rx.await.map_err(|_| RuntimeError::ChannelClosed)?
    }

    pub async fn is_hidden(&self, post: PostDescriptor) -> Result<bool, RuntimeError> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::IsHidden { post, resp: tx }).await?;
        rx.await.map_err(|_| RuntimeError::ChannelClosed)
    }

    pub async fn hidden_posts(&self, chan: ChanDescriptor) -> Result<Vec<PostDescriptor>, RuntimeError> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::HiddenPosts { chan, resp: tx }).await?;
        rx.await.map_err(|_| RuntimeError::ChannelClosed)
    }

    pub async fn flush(&self) -> Result<OpSeq, RuntimeError> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Flush { resp: tx }).await?;
        rx.await.map_err(|_| RuntimeError::ChannelClosed)?
    }

    pub async fn checkpoint(&self) -> Result<(), RuntimeError> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Checkpoint { resp: tx }).await?;
        rx.await.map_err(|_| RuntimeError::ChannelClosed)?
    }

    pub async fn shutdown(&self) -> Result<(), RuntimeError> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Shutdown { resp: tx }).await?;
        rx.await.map_err(|_| RuntimeError::ChannelClosed)?
    }

    async fn send(&self, cmd: Command) -> Result<(), RuntimeError> {
        self.cmd_tx
            .send(cmd)
            .await
            .map_err(|_| RuntimeError::ChannelClosed)
    }
}

async fn handle_command(
    cmd: Command,
    state: &mut LoopState,
    events_tx: &broadcast::Sender<HideEvent>,
    persist_tx: Option<&mpsc::Sender<PersistMsg>>,
) -> bool {
    match cmd {
        Command::Ingest { chan, posts, resp } => {
            let mut ids = Vec::with_capacity(posts.len());
            let mut fresh_cells = Vec::new();
            for post in posts {
                if state.cache.post_cell(&post.cell.post).is_none() {
                    fresh_cells.push(post.cell.clone());
                }
                if let ChanDescriptor::Thread(_) = chan {
                    state.helper.graph().insert(post.cell.post.clone(), post.replies_to);
                }
                ids.push(post.cell.post);
            }
            state.cache.put_cells(&fresh_cells);

            let outcome = state.helper.process_posts(&chan, &ids, state.cache.as_ref());
            let res = settle_write(state, events_tx, persist_tx).await.map(|_| outcome);
            let _ = resp.send(res);
        }
        Command::Hide {
            chan,
            posts,
            apply_to_replies,
            reason,
            resp,
        } => {
            state.decisions.update(&posts, |current| {
                PostHide::hidden_manually(current.post, apply_to_replies, reason.clone())
            });
            let outcome = state.helper.process_posts(&chan, &posts, state.cache.as_ref());
            let res = settle_write(state, events_tx, persist_tx).await.map(|_| outcome);
            let _ = resp.send(res);
        }
        Command::Unhide { chan, posts, resp } => {
            state
                .decisions
                .update(&posts, |current| PostHide::unhidden_manually(current.post));
            let outcome = state.helper.process_posts(&chan, &posts, state.cache.as_ref());
            let res = settle_write(state, events_tx, persist_tx).await.map(|_| outcome);
            let _ = resp.send(res);
        }
        Command::ClearOverrides { chan, posts, resp } => {
            let manual: Vec<PostDescriptor> = posts
                .iter()
                .filter(|post| state.decisions.get(post).is_some_and(|hide| hide.is_manual()))
                .cloned()
                .collect();
            state.decisions.remove(&manual);
            let outcome = state.helper.process_posts(&chan, &posts, state.cache.as_ref());
            let res = settle_write(state, events_tx, persist_tx).await.map(|_| outcome);
            let _ = resp.send(res);
        }
        Command::FilterAll { chan, posts, resp } => {
            let res = match state.filter.filter_posts(&chan, posts).await {
                Ok(outcome) => {
                    state.cache.put_cells(&outcome.cells);
                    settle_write(state, events_tx, persist_tx).await.map(|_| outcome)
                }
                Err(err) => Err(RuntimeError::from(err)),
            };
            let _ = resp.send(res);
        }
        Command::IsHidden { post, resp } => {
            let _ = resp.send(state.decisions.is_hidden(&post));
        }
        Command::HiddenPosts { chan, resp } => {
            let _ = resp.send(state.decisions.hidden_posts(&chan));
        }
        Command::Flush { resp } => {
            let _ = resp.send(flush_journal(state, events_tx, persist_tx).await);
        }
        Command::Checkpoint { resp } => {
            let out = match commit_written(state, events_tx, persist_tx).await {
                Err(err) => Err(err),
                Ok(()) => match persist_tx {
                    Some(tx) => request_checkpoint(state, tx).await,
                    None => Ok(()),
                },
            };
            let _ = resp.send(out);
        }
        Command::Shutdown { resp } => {
            let _ = resp.send(shutdown_journal(state, events_tx, persist_tx).await);
            return true;
        }
    }

    false
}

/// Journals a write command's ops and reports any journal failure still
/// outstanding, including one from an earlier command.
async fn settle_write(
    state: &mut LoopState,
    events_tx: &broadcast::Sender<HideEvent>,
    persist_tx: Option<&mpsc::Sender<PersistMsg>>,
) -> Result<(), RuntimeError> {
    commit_written(state, events_tx, persist_tx).await?;
    state.journal_health()
}

/// Hands the decision journal to the persistence worker.
///
/// Ops the queue refuses stay in the backlog and are retried with the next
/// write; the in-memory decisions are already applied either way.
async fn commit_written(
    state: &mut LoopState,
    events_tx: &broadcast::Sender<HideEvent>,
    persist_tx: Option<&mpsc::Sender<PersistMsg>>,
) -> Result<(), RuntimeError> {
    let mut ops = std::mem::take(&mut state.backlog);
    ops.extend(state.decisions.drain_pending_ops());
    if ops.is_empty() {
        return Ok(());
    }

    let Some(tx) = persist_tx else {
        let _ = events_tx.send(HideEvent::DurableUpTo {
            op_seq: state.decisions.latest_op_seq(),
        });
        return Ok(());
    };

    let count = ops.len();
    match tx.try_send(PersistMsg::Ops(ops)) {
        Ok(()) => {
            state.ops_since_snapshot += count;
            maybe_auto_checkpoint(state, tx).await;
            Ok(())
        }
        Err(err) => {
            let message = format!("persist queue error: {err}");
            if let mpsc::error::TrySendError::Full(PersistMsg::Ops(ops))
            | mpsc::error::TrySendError::Closed(PersistMsg::Ops(ops)) = err
            {
                state.backlog = ops;
            }
            warn!(backlog = state.backlog.len(), "decision journal queue refused ops");
            Err(RuntimeError::Persist(PersistError::Message(message)))
        }
    }
}

/// Writes out everything journaled so far and syncs the sink.
///
/// Returns the highest sequence the sink has confirmed.
async fn flush_journal(
    state: &mut LoopState,
    events_tx: &broadcast::Sender<HideEvent>,
    persist_tx: Option<&mpsc::Sender<PersistMsg>>,
) -> Result<OpSeq, RuntimeError> {
    commit_written(state, events_tx, persist_tx).await?;
    let Some(tx) = persist_tx else {
        return Ok(state.decisions.latest_op_seq());
    };

    let (flush_tx, flush_rx) = oneshot::channel();
    tx.send(PersistMsg::Flush { resp: flush_tx })
        .await
        .map_err(|_| RuntimeError::ChannelClosed)?;
    match flush_rx.await.map_err(|_| RuntimeError::ChannelClosed)? {
        Ok(op_seq) => {
            state.journal_failure = None;
            Ok(op_seq)
        }
        Err(err) => {
            state.journal_failure = Some(err.to_string());
            Err(RuntimeError::from(err))
        }
    }
}

async fn shutdown_journal(
    state: &mut LoopState,
    events_tx: &broadcast::Sender<HideEvent>,
    persist_tx: Option<&mpsc::Sender<PersistMsg>>,
) -> Result<(), RuntimeError> {
    let Some(tx) = persist_tx else {
        return Ok(());
    };
    if let Err(err) = commit_written(state, events_tx, persist_tx).await {
        warn!(error = %err, "journal ops left unqueued at shutdown");
    }

    let (done_tx, done_rx) = oneshot::channel();
    tx.send(PersistMsg::Shutdown { resp: done_tx })
        .await
        .map_err(|_| RuntimeError::ChannelClosed)?;
    done_rx
        .await
        .map_err(|_| RuntimeError::ChannelClosed)?
        .map_err(RuntimeError::from)
}

async fn request_checkpoint(
    state: &mut LoopState,
    tx: &mpsc::Sender<PersistMsg>,
) -> Result<(), RuntimeError> {
    let snapshot = state.decisions.export_snapshot();
    let last_seq = state.decisions.latest_op_seq();
    let (cp_tx, cp_rx) = oneshot::channel();
    tx.send(PersistMsg::Checkpoint {
        snapshot,
        last_seq,
        compact: state.config.compact_after_snapshot,
        resp: cp_tx,
    })
    .await
    .map_err(|_| RuntimeError::ChannelClosed)?;

    cp_rx
        .await
        .map_err(|_| RuntimeError::ChannelClosed)?
        .map_err(RuntimeError::from)?;
    state.ops_since_snapshot = 0;
    Ok(())
}

async fn maybe_auto_checkpoint(state: &mut LoopState, tx: &mpsc::Sender<PersistMsg>) {
    if state.config.snapshot_every_ops == 0 || state.ops_since_snapshot < state.config.snapshot_every_ops {
        return;
    }
    if let Err(err) = request_checkpoint(state, tx).await {
        warn!(error = %err, "automatic checkpoint failed");
    }
}

/// Journal ops the sink has not confirmed yet, oldest first.
///
/// Ops leave `unconfirmed` only once `append_ops` succeeds for them, so a
/// failed append is retried with the next write, flush or deadline.
struct JournalWriter {
    sink: Arc<Mutex<Box<dyn HideSink>>>,
    unconfirmed: Vec<StoredHideOp>,
    durable_seq: OpSeq,
    durable_tx: mpsc::UnboundedSender<DurableResult>,
}

impl JournalWriter {
    async fn on_sink<T, F>(&self, work: F) -> PersistResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Box<dyn HideSink>) -> PersistResult<T> + Send + 'static,
    {
        let sink = Arc::clone(&self.sink);
        tokio::task::spawn_blocking(move || {
            let mut guard = sink.blocking_lock();
            work(&mut *guard)
        })
        .await
        .map_err(|err| PersistError::Message(format!("journal task failed: {err}")))?
    }

    /// Appends every unconfirmed op, then syncs the sink when `sync` is set.
    async fn write_out(&mut self, sync: bool) -> PersistResult<()> {
        if !self.unconfirmed.is_empty() {
            let batch = self.unconfirmed.clone();
            let count = batch.len();
            let seq = match self.on_sink(move |sink| sink.append_ops(&batch)).await {
                Ok(seq) => seq,
                Err(err) => return Err(self.fail("append", count, err)),
            };
            self.unconfirmed.drain(..count);
            self.durable_seq = self.durable_seq.max(seq);
            trace!(count, durable_seq = self.durable_seq, "journal ops appended");
            let _ = self.durable_tx.send(Ok(self.durable_seq));
        }

        if sync {
            if let Err(err) = self.on_sink(|sink| sink.flush()).await {
                return Err(self.fail("sync", 0, err));
            }
        }
        Ok(())
    }

    async fn checkpoint(
        &mut self,
        snapshot: DecisionSnapshotV1,
        last_seq: OpSeq,
        compact: bool,
    ) -> PersistResult<()> {
        self.write_out(true).await?;
        let dropped = self
            .on_sink(move |sink| {
                sink.write_snapshot(&snapshot, last_seq)?;
                if compact {
                    sink.compact_through(last_seq)
                } else {
                    Ok(0)
                }
            })
            .await?;
        debug!(last_seq, dropped, "decision checkpoint written");
        Ok(())
    }

    fn fail(&self, stage: &str, count: usize, err: PersistError) -> PersistError {
        warn!(
            stage,
            count,
            retained = self.unconfirmed.len(),
            error = %err,
            "decision journal write failed"
        );
        let _ = self
            .durable_tx
            .send(Err(PersistError::Message(format!("journal {stage} failed: {err}"))));
        err
    }
}

fn spawn_journal_worker(
    sink: Box<dyn HideSink>,
    mut rx: mpsc::Receiver<PersistMsg>,
    durable_tx: mpsc::UnboundedSender<DurableResult>,
    config: &RuntimeConfig,
) {
    let latency = Duration::from_millis(config.batch_max_latency_ms);
    let batch_max_ops = config.batch_max_ops;
    let flush_on_write = config.flush_on_write;
    let mut writer = JournalWriter {
        sink: Arc::new(Mutex::new(sink)),
        unconfirmed: Vec::new(),
        durable_seq: 0,
        durable_tx,
    };

    tokio::spawn(async move {
        let mut deadline = Instant::now() + latency;
        loop {
            let msg = tokio::select! {
                msg = rx.recv() => msg,
                _ = tokio::time::sleep_until(deadline), if !writer.unconfirmed.is_empty() => {
                    let _ = writer.write_out(false).await;
                    deadline = Instant::now() + latency;
                    continue;
                }
            };

            match msg {
                Some(PersistMsg::Ops(ops)) => {
                    writer.unconfirmed.extend(ops);
                    if !flush_on_write && writer.unconfirmed.len() < batch_max_ops {
                        continue;
                    }
                    let _ = writer.write_out(true).await;
                }
                Some(PersistMsg::Flush { resp }) => {
                    let result = writer.write_out(true).await.map(|()| writer.durable_seq);
                    let _ = resp.send(result);
                }
                Some(PersistMsg::Checkpoint {
                    snapshot,
                    last_seq,
                    compact,
                    resp,
                }) => {
                    let _ = resp.send(writer.checkpoint(snapshot, last_seq, compact).await);
                }
                Some(PersistMsg::Shutdown { resp }) => {
                    let _ = resp.send(writer.write_out(true).await);
                    break;
                }
                None => {
                    let _ = writer.write_out(true).await;
                    break;
                }
            }
            deadline = Instant::now() + latency;
        }
        debug!(
            durable_seq = writer.durable_seq,
            unconfirmed = writer.unconfirmed.len(),
            "decision journal worker stopped"
        );
    });
}
