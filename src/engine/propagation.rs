use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use hashbrown::{HashMap, HashSet};
use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::{
    core::{
        decisions::HideDecisionStore,
        indices::PostSet,
        reply_graph::{ReplyGraphStore, ThreadGraph},
    },
    hide::{PostCellData, PostHide},
    types::{ChanDescriptor, PostDescriptor},
};

use super::traits::PostCache;

/// Passes re-run for posts whose decision moved under them before giving up.
const MAX_PASS_ATTEMPTS: usize = 4;

/// Result of one propagation pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PropagationOutcome {
    /// Decisions committed to the store, ascending by post.
    pub written: Vec<PostHide>,
    /// Cells whose hide annotation changed; already stored in the cache.
    pub updated_cells: Vec<PostCellData>,
    /// True when the pass stopped early; everything before the stop is
    /// committed.
    pub cancelled: bool,
}

impl PropagationOutcome {
    /// True when the pass changed nothing.
    pub fn is_noop(&self) -> bool {
        self.written.is_empty() && self.updated_cells.is_empty()
    }
}

/// Incremental hide propagation along a thread's reply graph.
///
/// Each pass works on a snapshot of the thread graph and of the decisions
/// visible from the descriptor, so no store lock is held while walking the
/// graph. Writes are committed at the end, and only for posts whose stored
/// decision still matches the snapshot; the others are re-run.
pub struct PostHideHelper {
    graph: Arc<ReplyGraphStore>,
    decisions: Arc<HideDecisionStore>,
    pass_lock: Mutex<()>,
}

impl PostHideHelper {
    pub fn new(graph: Arc<ReplyGraphStore>, decisions: Arc<HideDecisionStore>) -> Self {
        Self {
            graph,
            decisions,
            pass_lock: Mutex::new(()),
        }
    }

    pub fn graph(&self) -> &Arc<ReplyGraphStore> {
        &self.graph
    }

    pub fn decisions(&self) -> &Arc<HideDecisionStore> {
        &self.decisions
    }

    /// Re-evaluates `changed` and every reply reachable from them.
    pub fn process_posts(
        &self,
        chan: &ChanDescriptor,
        changed: &[PostDescriptor],
        cache: &dyn PostCache,
    ) -> PropagationOutcome {
        let never = AtomicBool::new(false);
        self.process_posts_until(chan, changed, cache, &never)
    }

    /// Same as [`Self::process_posts`] but stops between posts once `cancel`
    /// is set.
    pub fn process_posts_until(
        &self,
        chan: &ChanDescriptor,
        changed: &[PostDescriptor],
        cache: &dyn PostCache,
        cancel: &AtomicBool,
    ) -> PropagationOutcome {
        let _pass = self.pass_lock.lock();

        let mut pending: Vec<PostDescriptor> = changed
            .iter()
            .filter(|post| chan.covers(post))
            .cloned()
            .collect();
        pending.sort();
        pending.dedup();
        if pending.len() < changed.len() {
            trace!(
                skipped = changed.len() - pending.len(),
                "ignoring duplicate or foreign posts"
            );
        }

        let mut written: BTreeMap<PostDescriptor, PostHide> = BTreeMap::new();
        let mut rendered: BTreeSet<PostDescriptor> = BTreeSet::new();
        let mut cancelled = false;

        for attempt in 1..=MAX_PASS_ATTEMPTS {
            let round = self.run_pass(chan, &pending, cache, cancel);
            cancelled = round.cancelled;
            written.extend(round.written.into_iter().map(|hide| (hide.post.clone(), hide)));
            rendered.extend(round.touched);

            if round.conflicts.is_empty() || cancelled {
                break;
            }
            if attempt == MAX_PASS_ATTEMPTS {
                warn!(
                    conflicts = round.conflicts.len(),
                    "decisions kept changing during propagation, leaving them as stored"
                );
                break;
            }
            debug!(
                conflicts = round.conflicts.len(),
                attempt, "decisions changed during propagation, re-running for them"
            );
            pending = round.conflicts;
        }

        let updated_cells = self.rendered_updates(&rendered, cache);
        cache.put_cells(&updated_cells);
        let written: Vec<PostHide> = written.into_values().collect();

        debug!(
            written = written.len(),
            updated_cells = updated_cells.len(),
            cancelled,
            "propagation pass finished"
        );

        PropagationOutcome {
            written,
            updated_cells,
            cancelled,
        }
    }

    /// One pass over `posts` against fresh snapshots, committed only where
    /// the stored decisions still match what the pass read.
    fn run_pass(
        &self,
        chan: &ChanDescriptor,
        posts: &[PostDescriptor],
        cache: &dyn PostCache,
        cancel: &AtomicBool,
    ) -> Round {
        let graph = match chan {
            ChanDescriptor::Thread(thread) => self.graph.snapshot(thread),
            ChanDescriptor::Catalog(_) => ThreadGraph::new(),
        };
        let read = self.decisions.decisions_for(chan);
        let mut pass = Pass {
            catalog_mode: chan.is_catalog(),
            graph: &graph,
            decisions: read.clone(),
            dirty: BTreeSet::new(),
            touched: BTreeSet::new(),
        };

        let mut cancelled = false;
        for post in posts {
            if cancel.load(Ordering::Acquire) {
                cancelled = true;
                break;
            }
            if cache.post_cell(post).is_none() {
                trace!(post = %post, "post not loaded yet, skipping");
                continue;
            }
            pass.process(post);
        }

        let Pass {
            decisions: settled,
            dirty,
            mut touched,
            ..
        } = pass;

        let writes: Vec<(Option<PostHide>, PostHide)> = dirty
            .iter()
            .filter_map(|post| {
                let next = settled.get(post)?.clone();
                Some((read.get(post).cloned(), next))
            })
            .collect();
        let commit = self.decisions.upsert_if_unchanged(writes);

        touched.extend(dirty);
        Round {
            written: commit.written,
            conflicts: commit.conflicts,
            touched,
            cancelled,
        }
    }

    /// Cells whose drawn annotation disagrees with the stored decision.
    fn rendered_updates(
        &self,
        posts: &BTreeSet<PostDescriptor>,
        cache: &dyn PostCache,
    ) -> Vec<PostCellData> {
        posts
            .iter()
            .filter_map(|post| {
                let cell = cache.post_cell(post)?;
                let expected = self.decisions.get(post).and_then(|hide| hide.hide_ui());
                (cell.post_hide != expected).then(|| PostCellData {
                    post: post.clone(),
                    post_hide: expected,
                })
            })
            .collect()
    }
}

struct Round {
    written: Vec<PostHide>,
    conflicts: Vec<PostDescriptor>,
    touched: BTreeSet<PostDescriptor>,
    cancelled: bool,
}

struct Pass<'a> {
    catalog_mode: bool,
    graph: &'a ThreadGraph,
    decisions: HashMap<PostDescriptor, PostHide>,
    dirty: BTreeSet<PostDescriptor>,
    touched: BTreeSet<PostDescriptor>,
}

impl Pass<'_> {
    fn process(&mut self, post: &PostDescriptor) {
        self.touched.insert(post.clone());

        if self.catalog_mode || post.is_op() {
            return;
        }

        self.resolve_from_ancestors(post);
        self.cascade(post);
    }

    /// Recomputes an automatic decision from the post's own ancestors.
    ///
    /// This is what picks up a hide for a freshly loaded reply.
    fn resolve_from_ancestors(&mut self, post: &PostDescriptor) {
        let current = self.decisions.get(post);
        if current.is_some_and(PostHide::is_manual) {
            return;
        }

        let known = current
            .map(|hide| hide.replied_to_hidden.clone())
            .unwrap_or_default();
        let mut roots = self.live_roots(post, &known);
        if roots.is_empty() {
            roots.extend(self.find_hidden_ancestor(post));
        }
        self.set_roots(post, roots);
    }

    /// Walks every reply of `parent` and brings its automatic state in line
    /// with the parent's.
    fn cascade(&mut self, parent: &PostDescriptor) {
        let roots = self
            .decisions
            .get(parent)
            .map(PostHide::roots_for_replies)
            .unwrap_or_default();
        let propagates = !roots.is_empty();

        let mut visited: HashSet<PostDescriptor> = HashSet::new();
        visited.insert(parent.clone());
        let mut queue: VecDeque<PostDescriptor> = VecDeque::new();
        queue.push_back(parent.clone());

        while let Some(current) = queue.pop_front() {
            let children = self.graph.replies_from(&current);
            for child in children {
                if !visited.insert(child.clone()) {
                    continue;
                }
                if child.is_op() {
                    debug!(post = %child, "refusing to cascade a hide into the OP");
                    continue;
                }

                self.apply_parent(&child, &roots, propagates);
                queue.push_back(child);
            }
        }
    }

    fn apply_parent(&mut self, child: &PostDescriptor, roots: &PostSet, propagates: bool) {
        let existing = self.decisions.get(child);
        if existing.is_some_and(PostHide::is_manual) {
            return;
        }
        let recorded = existing
            .map(|hide| hide.replied_to_hidden.clone())
            .unwrap_or_default();

        // A reply already hidden by a live root keeps that attribution; the
        // other roots are found again by the ancestor search if it goes away.
        let mut live = self.live_roots(child, &recorded);
        if live.is_empty() {
            if propagates {
                live = roots.clone();
            } else {
                live.extend(self.find_hidden_ancestor(child));
            }
        }
        self.set_roots(child, live);
    }

    /// Recorded roots that are still hide roots and still ancestors of `post`.
    fn live_roots(&self, post: &PostDescriptor, roots: &PostSet) -> PostSet {
        roots
            .iter()
            .filter(|root| {
                let is_root = match self.decisions.get(*root) {
                    Some(hide) => hide.is_hide_root(),
                    None => {
                        debug!(root = %root, "hide cause has no decision, treating as no cause");
                        false
                    }
                };
                if is_root && !self.graph.is_ancestor(post, root) {
                    debug!(post = %post, root = %root, "hide cause is no longer an ancestor");
                    return false;
                }
                is_root
            })
            .cloned()
            .collect()
    }

    fn find_hidden_ancestor(&self, post: &PostDescriptor) -> Option<PostDescriptor> {
        let decisions = &self.decisions;
        self.graph.find_ancestor(post, |ancestor| {
            decisions.get(ancestor).is_some_and(PostHide::is_hide_root)
        })
    }

    fn set_roots(&mut self, post: &PostDescriptor, roots: PostSet) {
        let before = self
            .decisions
            .get(post)
            .cloned()
            .unwrap_or_else(|| PostHide::unspecified(post.clone()));
        let mut next = before.clone();
        next.set_automatic_roots(roots);

        if next.differs_from(&before) {
            trace!(post = %post, hidden = next.is_hidden(), "automatic decision changed");
            self.decisions.insert(post.clone(), next);
            self.dirty.insert(post.clone());
        }
    }
}
