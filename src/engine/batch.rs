use std::{collections::BTreeMap, sync::Arc};

use hashbrown::{HashMap, HashSet};
use parking_lot::Mutex;
use tracing::{debug, error};

use crate::{
    core::{
        decisions::HideDecisionStore,
        indices::PostSet,
        reply_graph::{ReplyGraphStore, ThreadGraph},
    },
    hide::{PostCellData, PostHide},
    types::{ChanDescriptor, PostDescriptor},
};

type SharedDecisions = Arc<Mutex<HashMap<PostDescriptor, PostHide>>>;

#[derive(Debug, thiserror::Error)]
pub enum FilterError {
    #[error("filter worker failed: {0}")]
    Worker(String),
}

/// Result of a full re-filter.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FilterOutcome {
    /// Input cells with their hide annotation resolved, in input order.
    pub cells: Vec<PostCellData>,
    /// Decisions committed to the store.
    pub written: Vec<PostHide>,
}

/// Resolves the hide state of every post of a page at once.
///
/// Used on initial load, when every post needs a verdict. The post list is
/// split into one chunk per worker; chunks share the decision map behind a
/// single lock that is taken per lookup, never across a graph walk.
pub struct PostFilterHelper {
    graph: Arc<ReplyGraphStore>,
    decisions: Arc<HideDecisionStore>,
    workers: usize,
}

impl PostFilterHelper {
    pub fn new(graph: Arc<ReplyGraphStore>, decisions: Arc<HideDecisionStore>, workers: usize) -> Self {
        let workers = if workers == 0 { default_workers() } else { workers };
        Self {
            graph,
            decisions,
            workers,
        }
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    pub async fn filter_posts(
        &self,
        chan: &ChanDescriptor,
        posts: Vec<PostCellData>,
    ) -> Result<FilterOutcome, FilterError> {
        let total = posts.len();
        let graph = Arc::new(match chan {
            ChanDescriptor::Thread(thread) => self.graph.snapshot(thread),
            ChanDescriptor::Catalog(_) => ThreadGraph::new(),
        });
        let read = self.decisions.decisions_for(chan);
        let shared: SharedDecisions = Arc::new(Mutex::new(read.clone()));
        let catalog_mode = chan.is_catalog();

        let chunk_len = total.div_ceil(self.workers).max(1);
        let mut handles = Vec::with_capacity(self.workers);
        let mut rest = posts;
        while !rest.is_empty() {
            let tail = rest.split_off(chunk_len.min(rest.len()));
            let chunk = std::mem::replace(&mut rest, tail);
            let graph = Arc::clone(&graph);
            let shared = Arc::clone(&shared);
            let chan = chan.clone();
            handles.push(tokio::task::spawn_blocking(move || {
                filter_chunk(&chan, catalog_mode, &graph, &shared, chunk)
            }));
        }

        let mut cells = Vec::with_capacity(total);
        let mut writes = Vec::new();
        for handle in handles {
            let (chunk_cells, chunk_writes) = handle.await.map_err(|err| {
                error!(error = %err, "filter worker did not finish");
                FilterError::Worker(err.to_string())
            })?;
            cells.extend(chunk_cells);
            writes.extend(chunk_writes);
        }

        let mut latest: BTreeMap<PostDescriptor, PostHide> = BTreeMap::new();
        latest.extend(writes.into_iter().map(|hide| (hide.post.clone(), hide)));
        let commit = self.decisions.upsert_if_unchanged(
            latest
                .into_values()
                .map(|hide| (read.get(&hide.post).cloned(), hide)),
        );

        // Posts changed by someone else during the pass are drawn as stored.
        if !commit.conflicts.is_empty() {
            debug!(
                conflicts = commit.conflicts.len(),
                "decisions changed during the filter pass"
            );
            let conflicts: HashSet<&PostDescriptor> = commit.conflicts.iter().collect();
            for cell in cells.iter_mut().filter(|cell| conflicts.contains(&cell.post)) {
                cell.post_hide = self
                    .decisions
                    .get(&cell.post)
                    .as_ref()
                    .and_then(PostHide::hide_ui);
            }
        }

        debug!(
            posts = total,
            workers = self.workers,
            written = commit.written.len(),
            "full filter pass finished"
        );

        Ok(FilterOutcome {
            cells,
            written: commit.written,
        })
    }
}

fn filter_chunk(
    chan: &ChanDescriptor,
    catalog_mode: bool,
    graph: &ThreadGraph,
    shared: &SharedDecisions,
    chunk: Vec<PostCellData>,
) -> (Vec<PostCellData>, Vec<PostHide>) {
    let mut cells = Vec::with_capacity(chunk.len());
    let mut writes = Vec::new();

    for mut cell in chunk {
        let current = shared.lock().get(&cell.post).cloned();

        let settled = if catalog_mode || cell.post.is_op() || !chan.covers(&cell.post) {
            current
        } else if current.as_ref().is_some_and(PostHide::is_manual) {
            current
        } else {
            let before = current.unwrap_or_else(|| PostHide::unspecified(cell.post.clone()));
            let mut roots: PostSet = before
                .replied_to_hidden
                .iter()
                .filter(|root| is_live_root(shared, root) && graph.is_ancestor(&cell.post, root))
                .cloned()
                .collect();
            if roots.is_empty() {
                roots.extend(graph.find_ancestor(&cell.post, |ancestor| is_live_root(shared, ancestor)));
            }

            let mut next = before.clone();
            next.set_automatic_roots(roots);
            if next.differs_from(&before) {
                shared.lock().insert(cell.post.clone(), next.clone());
                writes.push(next.clone());
            }
            Some(next)
        };

        cell.post_hide = settled.as_ref().and_then(PostHide::hide_ui);
        cells.push(cell);
    }

    (cells, writes)
}

fn is_live_root(shared: &SharedDecisions, post: &PostDescriptor) -> bool {
    shared.lock().get(post).is_some_and(PostHide::is_hide_root)
}

pub fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|parallelism| parallelism.get().clamp(1, 32))
        .unwrap_or(4)
}
