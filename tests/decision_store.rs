use std::collections::BTreeSet;

use replyhide::{
    core::decisions::{DecisionSnapshotV1, HideDecisionStore, StoreError},
    hide::{HideState, PostHide},
    op::HideOp,
    runtime::events::HideEvent,
    types::{CatalogDescriptor, ChanDescriptor, ThreadDescriptor},
};

fn thread() -> ThreadDescriptor {
    ThreadDescriptor::new("site", "g", 1)
}

#[test]
fn upsert_skips_writes_that_change_nothing_visible() {
    let t = thread();
    let store = HideDecisionStore::new();
    let mut events = store.subscribe();

    let written = store.upsert([PostHide::hidden_manually(t.post(2), true, "spam")]);
    assert_eq!(written.len(), 1);
    assert_eq!(
        events.try_recv().expect("event"),
        HideEvent::PostsChanged {
            posts: vec![t.post(2)]
        }
    );

    let again = store.upsert([PostHide::hidden_manually(t.post(2), true, "different reason")]);
    assert!(again.is_empty());
    assert!(events.try_recv().is_err());

    let flipped = store.upsert([PostHide::hidden_manually(t.post(2), false, "spam")]);
    assert_eq!(flipped.len(), 1);
    assert!(events.try_recv().is_ok());

    let empty = store.upsert([PostHide::unspecified(t.post(9))]);
    assert!(empty.is_empty());
    assert!(store.get(&t.post(9)).is_none());
}

#[test]
fn update_presents_missing_posts_as_unspecified() {
    let t = thread();
    let store = HideDecisionStore::new();
    store.upsert([PostHide::hidden_manually(t.post(2), true, "")]);

    let mut seen = Vec::new();
    let written = store.update(&[t.post(2), t.post(3)], |current| {
        seen.push(current.state.clone());
        PostHide::unhidden_manually(current.post)
    });

    assert_eq!(seen, vec![HideState::HiddenManually, HideState::Unspecified]);
    assert_eq!(written.len(), 2);
    assert!(!store.is_hidden(&t.post(2)));
    assert_eq!(
        store.get(&t.post(3)).map(|h| h.state),
        Some(HideState::UnhiddenManually)
    );
}

#[test]
fn effective_visibility_follows_state_and_override() {
    let t = thread();
    let mut hide = PostHide::hidden_manually(t.post(2), true, "");
    assert!(hide.is_hidden());
    assert!(hide.is_hide_root());

    hide.manually_restored = true;
    assert!(!hide.is_hidden());
    assert!(!hide.is_hide_root());

    let mut auto = PostHide::unspecified(t.post(3));
    auto.set_automatic_roots(BTreeSet::from([t.post(2)]));
    assert!(auto.is_hidden());
    assert!(auto.is_automatic());
    assert!(!auto.is_hide_root());
    assert_eq!(auto.state, HideState::HiddenAutomatically { cause: t.post(2) });

    auto.set_automatic_roots(BTreeSet::new());
    assert_eq!(auto.state, HideState::Unspecified);
    assert!(!auto.is_hidden());

    let op = PostHide::hidden_manually(t.op(), true, "");
    assert!(op.is_hidden());
    assert!(!op.is_hide_root());
}

#[test]
fn catalog_view_only_sees_thread_ops_of_that_board() {
    let g = CatalogDescriptor::new("site", "g");
    let v = CatalogDescriptor::new("site", "v");
    let store = HideDecisionStore::new();

    store.upsert([
        PostHide::hidden_manually(g.thread(10).op(), false, ""),
        PostHide::hidden_manually(g.thread(10).post(11), false, ""),
        PostHide::hidden_manually(g.thread(20).op(), false, ""),
        PostHide::hidden_manually(v.thread(30).op(), false, ""),
    ]);

    let catalog = store.decisions_for(&ChanDescriptor::Catalog(g.clone()));
    let mut posts: Vec<_> = catalog.keys().cloned().collect();
    posts.sort();
    assert_eq!(posts, vec![g.thread(10).op(), g.thread(20).op()]);

    let in_thread = store.hidden_posts(&ChanDescriptor::Thread(g.thread(10)));
    assert_eq!(in_thread, vec![g.thread(10).op(), g.thread(10).post(11)]);
}

#[test]
fn writes_are_journaled_in_sequence() {
    let t = thread();
    let store = HideDecisionStore::new();

    store.upsert([PostHide::hidden_manually(t.post(2), true, "")]);
    store.upsert([PostHide::hidden_manually(t.post(3), true, "")]);
    assert_eq!(store.remove(&[t.post(2), t.post(7)]), vec![t.post(2)]);
    assert_eq!(store.clear_thread(&t), vec![t.post(3)]);

    let ops = store.drain_pending_ops();
    let seqs: Vec<u64> = ops.iter().map(|o| o.seq).collect();
    assert_eq!(seqs, vec![1, 2, 3, 4]);
    assert!(matches!(ops[2].op, HideOp::Remove { .. }));
    assert_eq!(store.latest_op_seq(), 4);
    assert!(store.drain_pending_ops().is_empty());
    assert!(store.is_empty());
}

#[test]
fn restore_and_evict_do_not_journal_or_notify() {
    let t = thread();
    let store = HideDecisionStore::new();
    let mut events = store.subscribe();

    store.restore([
        PostHide::hidden_manually(t.post(2), true, ""),
        PostHide::unhidden_manually(t.post(3)),
    ]);
    assert_eq!(store.len(), 2);
    assert!(store.is_hidden(&t.post(2)));

    assert_eq!(store.evict_thread(&t), 2);
    assert!(store.is_empty());
    assert!(store.drain_pending_ops().is_empty());
    assert!(events.try_recv().is_err());
}

#[test]
fn snapshot_round_trips_and_rejects_duplicates() {
    let t = thread();
    let store = HideDecisionStore::new();
    store.upsert([
        PostHide::hidden_manually(t.post(2), true, "a"),
        PostHide::hidden_manually(t.post(4), false, "b"),
    ]);

    let snapshot = store.export_snapshot();
    let restored = HideDecisionStore::from_snapshot(snapshot.clone()).expect("restore");
    assert_eq!(restored.export_snapshot(), snapshot);
    assert_eq!(restored.latest_op_seq(), store.latest_op_seq());

    let dup = DecisionSnapshotV1 {
        next_op_seq: 1,
        decisions: vec![
            PostHide::hidden_manually(t.post(2), true, ""),
            PostHide::hidden_manually(t.post(2), false, ""),
        ],
    };
    assert!(matches!(
        HideDecisionStore::from_snapshot(dup),
        Err(StoreError::DuplicateDecision(_))
    ));
}

#[test]
fn conditional_upsert_refuses_posts_that_moved_since_the_read() {
    let t = thread();
    let store = HideDecisionStore::new();
    store.upsert([PostHide::hidden_manually(t.post(2), true, "")]);

    let mut derived = PostHide::unspecified(t.post(3));
    derived.set_automatic_roots(BTreeSet::from([t.post(2)]));
    let mut other = PostHide::unspecified(t.post(4));
    other.set_automatic_roots(BTreeSet::from([t.post(2)]));

    // The user restores 3 after the caller read "no decision" for it.
    store.upsert([PostHide::unhidden_manually(t.post(3))]);
    let outcome = store.upsert_if_unchanged([(None, derived.clone()), (None, other.clone())]);

    assert_eq!(outcome.conflicts, vec![t.post(3)]);
    assert_eq!(outcome.written, vec![other.clone()]);
    assert_eq!(store.get(&t.post(3)).map(|h| h.state), Some(HideState::UnhiddenManually));
    assert!(store.is_hidden(&t.post(4)));

    let read = store.get(&t.post(4));
    let noop = store.upsert_if_unchanged([(read, other)]);
    assert!(noop.written.is_empty() && noop.conflicts.is_empty());
}

#[test]
fn store_without_journal_keeps_sequence_but_queues_nothing() {
    let t = thread();
    let store = HideDecisionStore::without_journal();

    store.upsert([PostHide::hidden_manually(t.post(2), true, "")]);
    store.remove(&[t.post(2)]);

    assert!(store.drain_pending_ops().is_empty());
    assert_eq!(store.latest_op_seq(), 2);
    assert_eq!(store.export_snapshot().next_op_seq, 3);
}
