use std::sync::Arc;

use tempfile::TempDir;

use replyhide::{
    core::{decisions::HideDecisionStore, reply_graph::ReplyGraphStore},
    engine::{propagation::PostHideHelper, traits::{InMemoryPostCache, PostCache}},
    hide::{HideState, PostCellData, PostHide},
    persist::{HideSink, sqlite::SqliteHideSink},
    types::{ChanDescriptor, ThreadDescriptor},
};

fn thread() -> ThreadDescriptor {
    ThreadDescriptor::new("site", "g", 1)
}

/// Chain 1 <- 2 <- 3 <- 4 with 2 hidden, then 3 manually restored.
fn settled_store() -> Arc<HideDecisionStore> {
    let t = thread();
    let graph = Arc::new(ReplyGraphStore::new());
    let decisions = Arc::new(HideDecisionStore::new());
    let cache = InMemoryPostCache::new();
    for no in 1..=4u64 {
        if no > 1 {
            graph.insert(t.post(no), [t.post(no - 1)]);
        }
        cache.put_cells(&[PostCellData::visible(t.post(no))]);
    }

    let helper = PostHideHelper::new(graph, Arc::clone(&decisions));
    let chan = ChanDescriptor::Thread(t.clone());
    decisions.upsert([PostHide::hidden_manually(t.post(2), true, "spam")]);
    helper.process_posts(&chan, &[t.post(2)], &cache);
    decisions.upsert([PostHide::unhidden_manually(t.post(3))]);
    helper.process_posts(&chan, &[t.post(3)], &cache);
    decisions
}

#[test]
fn sqlite_replay_round_trips_decisions() {
    let tmp = TempDir::new().expect("tmp");
    let db_path = tmp.path().join("hides.db");
    let t = thread();

    let store = settled_store();
    store.remove(&[t.post(3)]);

    let mut sink = SqliteHideSink::open(&db_path).expect("open sqlite");
    let ops = store.drain_pending_ops();
    let last = sink.append_ops(&ops).expect("append");
    assert_eq!(last, store.latest_op_seq());
    sink.flush().expect("flush");
    drop(sink);

    let reopened = SqliteHideSink::open(&db_path).expect("reopen");
    assert_eq!(reopened.latest_seq().expect("latest"), last);
    let replayed = reopened.load_decisions().expect("replay");

    assert_eq!(replayed.export_snapshot(), store.export_snapshot());
    assert!(replayed.get(&t.post(3)).is_none());
    assert_eq!(
        replayed.get(&t.post(4)).map(|h| h.state),
        Some(HideState::HiddenAutomatically { cause: t.post(2) })
    );
    assert_eq!(replayed.latest_op_seq(), store.latest_op_seq());
}

#[test]
fn snapshot_plus_tail_replay_after_compaction() {
    let tmp = TempDir::new().expect("tmp");
    let db_path = tmp.path().join("hides.db");
    let t = thread();

    let store = settled_store();
    let mut sink = SqliteHideSink::open(&db_path).expect("open sqlite");
    sink.append_ops(&store.drain_pending_ops()).expect("append");

    let checkpoint_seq = store.latest_op_seq();
    sink.write_snapshot(&store.export_snapshot(), checkpoint_seq)
        .expect("snapshot");
    let removed = sink.compact_through(checkpoint_seq).expect("compact");
    assert!(removed > 0);
    assert!(sink.load_ops_after(0).expect("ops").is_empty());

    store.upsert([PostHide::hidden_manually(t.post(4), false, "still spam")]);
    let tail = store.drain_pending_ops();
    assert_eq!(tail.len(), 1);
    sink.append_ops(&tail).expect("append tail");
    drop(sink);

    let reopened = SqliteHideSink::open(&db_path).expect("reopen");
    let replayed = reopened.load_decisions().expect("replay");
    assert_eq!(replayed.export_snapshot(), store.export_snapshot());
    assert_eq!(
        replayed.get(&t.post(4)).map(|h| h.state),
        Some(HideState::HiddenManually)
    );

    // New writes continue the sequence instead of reusing replayed numbers.
    replayed.upsert([PostHide::unhidden_manually(t.post(2))]);
    let next = replayed.drain_pending_ops();
    assert_eq!(next[0].seq, store.latest_op_seq() + 1);
}

#[test]
fn empty_database_loads_an_empty_store() {
    let sink = SqliteHideSink::open_in_memory().expect("open");
    let store = sink.load_decisions().expect("load");
    assert!(store.is_empty());
    assert_eq!(store.latest_op_seq(), 0);
    assert_eq!(sink.latest_seq().expect("latest"), 0);
}

#[test]
fn appending_nothing_reports_the_current_tail() {
    let t = thread();
    let mut sink = SqliteHideSink::open_in_memory().expect("open");
    let store = HideDecisionStore::new();
    store.upsert([PostHide::hidden_manually(t.post(2), true, "")]);
    let last = sink.append_ops(&store.drain_pending_ops()).expect("append");

    assert_eq!(sink.append_ops(&[]).expect("empty append"), last);
    assert_eq!(sink.load_ops_after(last).expect("ops").len(), 0);
    assert_eq!(sink.load_ops_after(0).expect("ops").len(), 1);
}
