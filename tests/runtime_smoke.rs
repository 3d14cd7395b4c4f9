use std::{
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use tempfile::TempDir;
use tokio::sync::broadcast;

use replyhide::{
    core::{decisions::HideDecisionStore, reply_graph::ReplyGraphStore},
    engine::traits::{InMemoryPostCache, PostCache},
    hide::{HideState, PostCellData},
    op::StoredHideOp,
    persist::{HideSink, PersistError, PersistResult, sqlite::SqliteHideSink},
    runtime::{
        events::HideEvent,
        handle::{IngestedPost, PostHideHandle, RuntimeConfig, RuntimeError, spawn_post_hide},
    },
    types::{ChanDescriptor, OpSeq, PostDescriptor, ThreadDescriptor},
};

fn thread() -> ThreadDescriptor {
    ThreadDescriptor::new("site", "g", 1)
}

fn ingested(post: PostDescriptor, replies_to: Vec<PostDescriptor>) -> IngestedPost {
    IngestedPost {
        cell: PostCellData::visible(post),
        replies_to,
    }
}

/// OP plus posts 2..=n, each quoting the one before.
fn chain(t: &ThreadDescriptor, n: u64) -> Vec<IngestedPost> {
    (1..=n)
        .map(|no| {
            let parents = if no == 1 { vec![] } else { vec![t.post(no - 1)] };
            ingested(t.post(no), parents)
        })
        .collect()
}

struct SlowSink {
    seen: Arc<Mutex<Vec<OpSeq>>>,
    delay: Duration,
}

impl HideSink for SlowSink {
    fn append_ops(&mut self, ops: &[StoredHideOp]) -> PersistResult<OpSeq> {
        std::thread::sleep(self.delay);
        let mut seen = self.seen.lock().expect("lock");
        for op in ops {
            seen.push(op.seq);
        }
        Ok(ops.last().map(|o| o.seq).unwrap_or(0))
    }
}

/// Sink that refuses every append while `failing` is set.
struct FlakySink {
    failing: Arc<AtomicBool>,
    seen: Arc<Mutex<Vec<OpSeq>>>,
}

impl HideSink for FlakySink {
    fn append_ops(&mut self, ops: &[StoredHideOp]) -> PersistResult<OpSeq> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(PersistError::Message("disk full".into()));
        }
        self.seen.lock().expect("lock").extend(ops.iter().map(|op| op.seq));
        Ok(ops.last().map(|o| o.seq).unwrap_or(0))
    }
}

async fn next_changed(sub: &mut broadcast::Receiver<HideEvent>) -> Vec<PostDescriptor> {
    loop {
        let evt = tokio::time::timeout(Duration::from_secs(1), sub.recv())
            .await
            .expect("event")
            .expect("recv");
        if let HideEvent::PostsChanged { posts } = evt {
            return posts;
        }
    }
}

fn spawn_in_memory() -> (PostHideHandle, Arc<InMemoryPostCache>) {
    let cache = Arc::new(InMemoryPostCache::new());
    let handle = spawn_post_hide(
        Arc::new(ReplyGraphStore::new()),
        Arc::new(HideDecisionStore::new()),
        Arc::clone(&cache) as Arc<dyn PostCache>,
        None,
        RuntimeConfig::default(),
    );
    (handle, cache)
}

#[tokio::test]
async fn runtime_ingest_hide_unhide_and_events_ordered() {
    let t = thread();
    let chan = ChanDescriptor::Thread(t.clone());
    let (handle, cache) = spawn_in_memory();
    let mut sub = handle.subscribe();

    let ingest = handle.ingest(chan.clone(), chain(&t, 4)).await.expect("ingest");
    assert!(ingest.written.is_empty());
    assert_eq!(cache.len(), 4);

    let hidden = handle
        .hide(chan.clone(), vec![t.post(2)], true, "off topic")
        .await
        .expect("hide");
    assert_eq!(hidden.written.len(), 2);
    assert!(handle.is_hidden(t.post(4)).await.expect("query"));
    assert!(cache.post_cell(&t.post(4)).is_some_and(|c| c.is_rendered_hidden()));

    assert_eq!(next_changed(&mut sub).await, vec![t.post(2)]);
    assert_eq!(next_changed(&mut sub).await, vec![t.post(3), t.post(4)]);

    let durable = tokio::time::timeout(Duration::from_secs(1), async {
        loop {
            if let Ok(HideEvent::DurableUpTo { op_seq }) = sub.recv().await {
                return op_seq;
            }
        }
    })
    .await
    .expect("durable");
    assert_eq!(durable, 3);

    assert_eq!(
        handle.hidden_posts(chan.clone()).await.expect("hidden"),
        vec![t.post(2), t.post(3), t.post(4)]
    );

    handle.unhide(chan.clone(), vec![t.post(2)]).await.expect("unhide");
    assert!(!handle.is_hidden(t.post(3)).await.expect("query"));
    assert!(handle.hidden_posts(chan.clone()).await.expect("hidden").is_empty());
    assert_eq!(handle.flush().await.expect("flush"), 6);

    handle.shutdown().await.expect("shutdown");
}

#[tokio::test]
async fn late_reply_and_cleared_override_follow_the_hidden_ancestor() {
    let t = thread();
    let chan = ChanDescriptor::Thread(t.clone());
    let (handle, _cache) = spawn_in_memory();

    handle.ingest(chan.clone(), chain(&t, 3)).await.expect("ingest");
    handle.hide(chan.clone(), vec![t.post(2)], true, "").await.expect("hide");
    handle.unhide(chan.clone(), vec![t.post(3)]).await.expect("unhide");
    assert!(!handle.is_hidden(t.post(3)).await.expect("query"));

    let late = handle
        .ingest(chan.clone(), vec![ingested(t.post(9), vec![t.post(3)])])
        .await
        .expect("late ingest");
    assert_eq!(late.written.len(), 1);
    assert!(handle.is_hidden(t.post(9)).await.expect("query"));

    handle
        .clear_overrides(chan.clone(), vec![t.post(3), t.post(9)])
        .await
        .expect("clear");
    assert!(handle.is_hidden(t.post(3)).await.expect("query"));
    assert!(handle.is_hidden(t.post(9)).await.expect("query"));

    handle.shutdown().await.expect("shutdown");
}

#[tokio::test]
async fn filter_all_fills_the_cache() {
    let t = thread();
    let chan = ChanDescriptor::Thread(t.clone());
    let (handle, cache) = spawn_in_memory();

    handle.ingest(chan.clone(), chain(&t, 6)).await.expect("ingest");
    handle.hide(chan.clone(), vec![t.post(3)], true, "").await.expect("hide");

    let cells: Vec<PostCellData> = (1..=6u64).map(|no| PostCellData::visible(t.post(no))).collect();
    let outcome = handle.filter_all(chan.clone(), cells).await.expect("filter");

    let hidden: Vec<u64> = outcome
        .cells
        .iter()
        .filter(|c| c.is_rendered_hidden())
        .map(|c| c.post.post_no)
        .collect();
    assert_eq!(hidden, vec![3, 4, 5, 6]);
    assert!(outcome.written.is_empty());
    assert!(cache.post_cell(&t.post(6)).is_some_and(|c| c.is_rendered_hidden()));

    handle.shutdown().await.expect("shutdown");
}

#[tokio::test]
async fn durable_event_advances_and_slow_sink_surfaces_queue_pressure() {
    let t = thread();
    let chan = ChanDescriptor::Thread(t.clone());
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = SlowSink {
        seen: Arc::clone(&seen),
        delay: Duration::from_millis(250),
    };

    let cfg = RuntimeConfig {
        flush_on_write: true,
        batch_max_ops: 16,
        batch_max_latency_ms: 500,
        persist_queue_bound: 1,
        snapshot_every_ops: 0,
        compact_after_snapshot: false,
        filter_workers: 1,
    };

    let handle = spawn_post_hide(
        Arc::new(ReplyGraphStore::new()),
        Arc::new(HideDecisionStore::new()),
        Arc::new(InMemoryPostCache::new()),
        Some(Box::new(sink)),
        cfg,
    );
    let mut sub = handle.subscribe();

    handle.ingest(chan.clone(), chain(&t, 20)).await.expect("ingest");
    handle.hide(chan.clone(), vec![t.post(20)], false, "").await.expect("hide");

    let mut durable_seen = false;
    for _ in 0..5 {
        let evt = tokio::time::timeout(Duration::from_secs(1), sub.recv())
            .await
            .expect("recv timeout")
            .expect("recv");
        if matches!(evt, HideEvent::DurableUpTo { .. }) {
            durable_seen = true;
            break;
        }
    }
    assert!(durable_seen, "expected DurableUpTo event");

    let mut queue_error_seen = false;
    for no in 2..19u64 {
        let r = handle.hide(chan.clone(), vec![t.post(no)], false, "").await;
        if let Err(RuntimeError::Persist(_)) = r {
            queue_error_seen = true;
            break;
        }
    }
    assert!(queue_error_seen, "expected persistence queue pressure to surface as error");
    // The decision itself is applied even though the journal lagged.
    assert!(handle.hidden_posts(chan.clone()).await.expect("hidden").len() > 1);

    handle.shutdown().await.expect("shutdown");
    assert!(!seen.lock().expect("lock").is_empty());
}

#[tokio::test]
async fn checkpoint_then_reload_from_sqlite() {
    let tmp = TempDir::new().expect("tmp");
    let db_path = tmp.path().join("hides.db");
    let t = thread();
    let chan = ChanDescriptor::Thread(t.clone());

    let sink = SqliteHideSink::open(&db_path).expect("open");
    let decisions = Arc::new(sink.load_decisions().expect("load"));
    let handle = spawn_post_hide(
        Arc::new(ReplyGraphStore::new()),
        Arc::clone(&decisions),
        Arc::new(InMemoryPostCache::new()),
        Some(Box::new(sink)),
        RuntimeConfig {
            compact_after_snapshot: true,
            ..RuntimeConfig::default()
        },
    );

    handle.ingest(chan.clone(), chain(&t, 4)).await.expect("ingest");
    handle.hide(chan.clone(), vec![t.post(2)], true, "spam").await.expect("hide");
    handle.checkpoint().await.expect("checkpoint");
    handle.unhide(chan.clone(), vec![t.post(4)]).await.expect("unhide");
    let durable = handle.flush().await.expect("flush");
    assert_eq!(durable, decisions.latest_op_seq());
    handle.shutdown().await.expect("shutdown");

    let reopened = SqliteHideSink::open(&db_path).expect("reopen");
    let replayed = reopened.load_decisions().expect("replay");
    assert_eq!(replayed.export_snapshot(), decisions.export_snapshot());
    assert_eq!(
        replayed.get(&t.post(3)).map(|h| h.state),
        Some(HideState::HiddenAutomatically { cause: t.post(2) })
    );
    assert_eq!(
        replayed.get(&t.post(4)).map(|h| h.state),
        Some(HideState::UnhiddenManually)
    );
}

#[tokio::test]
async fn failed_journal_writes_are_reported_and_retried() {
    let t = thread();
    let chan = ChanDescriptor::Thread(t.clone());
    let failing = Arc::new(AtomicBool::new(true));
    let seen = Arc::new(Mutex::new(Vec::new()));
    let decisions = Arc::new(HideDecisionStore::new());

    let handle = spawn_post_hide(
        Arc::new(ReplyGraphStore::new()),
        Arc::clone(&decisions),
        Arc::new(InMemoryPostCache::new()),
        Some(Box::new(FlakySink {
            failing: Arc::clone(&failing),
            seen: Arc::clone(&seen),
        })),
        RuntimeConfig {
            flush_on_write: true,
            batch_max_latency_ms: 10_000,
            snapshot_every_ops: 0,
            ..RuntimeConfig::default()
        },
    );
    let mut sub = handle.subscribe();

    handle.ingest(chan.clone(), chain(&t, 4)).await.expect("ingest");
    let _ = handle.hide(chan.clone(), vec![t.post(2)], true, "").await;
    assert!(handle.is_hidden(t.post(4)).await.expect("query"));

    let flushed = handle.flush().await;
    assert!(matches!(flushed, Err(RuntimeError::Persist(_))), "{flushed:?}");
    assert!(seen.lock().expect("lock").is_empty());

    // The sink recovers; the next write still reports the earlier failure.
    failing.store(false, Ordering::SeqCst);
    let hidden = handle.hide(chan.clone(), vec![t.post(3)], true, "").await;
    assert!(matches!(hidden, Err(RuntimeError::Persist(_))), "{hidden:?}");

    let durable = handle.flush().await.expect("flush after recovery");
    assert_eq!(durable, decisions.latest_op_seq());
    assert_eq!(*seen.lock().expect("lock"), (1..=durable).collect::<Vec<_>>());

    let failure_seen = tokio::time::timeout(Duration::from_secs(1), async {
        loop {
            if let Ok(HideEvent::PersistFailed { .. }) = sub.recv().await {
                return true;
            }
        }
    })
    .await
    .unwrap_or(false);
    assert!(failure_seen, "expected a PersistFailed event");

    handle
        .unhide(chan.clone(), vec![t.post(3)])
        .await
        .expect("writes succeed again");
    handle.shutdown().await.expect("shutdown");
}
