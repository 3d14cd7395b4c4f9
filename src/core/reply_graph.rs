use std::collections::{BTreeSet, VecDeque};
use std::sync::Arc;

use hashbrown::{HashMap, HashSet};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, trace};

use crate::types::{PostDescriptor, ThreadDescriptor};

use super::indices::{PostSet, PostSetIndex};

/// Reply edges of a single thread.
///
/// `replies_to[p]` holds the posts `p` quotes and `replies_from[q]` the posts
/// quoting `q`; both maps are always updated together.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ThreadGraph {
    replies_to: PostSetIndex,
    replies_from: PostSetIndex,
}

impl ThreadGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, post: PostDescriptor, replies_to: PostSet) {
        let new_targets: PostSet = replies_to
            .into_iter()
            .filter(|target| target.thread == post.thread && *target != post)
            .collect();

        if let Some(old_targets) = self.replies_to.remove(&post) {
            for target in old_targets.difference(&new_targets) {
                Self::remove_from_set_index(&mut self.replies_from, target, &post);
            }
        }

        for target in &new_targets {
            self.replies_from
                .entry(target.clone())
                .or_default()
                .insert(post.clone());
        }

        if !new_targets.is_empty() {
            self.replies_to.insert(post, new_targets);
        }
    }

    pub fn replies_to(&self, post: &PostDescriptor) -> PostSet {
        self.replies_to.get(post).cloned().unwrap_or_default()
    }

    pub fn replies_from(&self, post: &PostDescriptor) -> PostSet {
        self.replies_from.get(post).cloned().unwrap_or_default()
    }

    pub fn reply_count(&self, post: &PostDescriptor) -> usize {
        self.replies_from.get(post).map(BTreeSet::len).unwrap_or(0)
    }

    /// Every post that quotes `post`, directly or through other replies.
    pub fn all_replies_from_recursively(&self, post: &PostDescriptor) -> PostSet {
        let mut visited: HashSet<PostDescriptor> = HashSet::new();
        visited.insert(post.clone());
        let mut out = PostSet::new();
        let mut queue: VecDeque<&PostDescriptor> = VecDeque::new();
        queue.push_back(post);

        while let Some(current) = queue.pop_front() {
            let Some(children) = self.replies_from.get(current) else {
                continue;
            };
            for child in children {
                if visited.insert(child.clone()) {
                    out.insert(child.clone());
                    queue.push_back(child);
                }
            }
        }

        out
    }

    /// Posts reachable from `post` within `max_depth` hops, `post` included.
    ///
    /// Posts already in `visited` are neither returned nor expanded, which
    /// lets callers chain several lookups without revisiting anything.
    pub fn find_with_replies(
        &self,
        post: &PostDescriptor,
        include_from: bool,
        include_to: bool,
        max_depth: usize,
        visited: &mut HashSet<PostDescriptor>,
    ) -> PostSet {
        let mut out = PostSet::new();
        if !visited.insert(post.clone()) {
            return out;
        }
        out.insert(post.clone());

        let mut queue: VecDeque<(PostDescriptor, usize)> = VecDeque::new();
        queue.push_back((post.clone(), 0));

        while let Some((current, depth)) = queue.pop_front() {
            if depth >= max_depth {
                continue;
            }

            let from = include_from.then(|| self.replies_from.get(&current)).flatten();
            let to = include_to.then(|| self.replies_to.get(&current)).flatten();

            for next in from.into_iter().chain(to).flatten() {
                if visited.insert(next.clone()) {
                    out.insert(next.clone());
                    queue.push_back((next.clone(), depth + 1));
                }
            }
        }

        out
    }

    /// First ancestor of `post` (following `replies_to`) accepted by `pred`.
    ///
    /// Ancestors are tried smallest-first at each step; each post is visited
    /// at most once so malformed cyclic data still terminates.
    pub fn find_ancestor<F>(&self, post: &PostDescriptor, mut pred: F) -> Option<PostDescriptor>
    where
        F: FnMut(&PostDescriptor) -> bool,
    {
        let mut visited: HashSet<&PostDescriptor> = HashSet::new();
        visited.insert(post);
        let mut stack: Vec<&PostDescriptor> = Vec::new();
        if let Some(parents) = self.replies_to.get(post) {
            stack.extend(parents.iter().rev());
        }

        while let Some(current) = stack.pop() {
            if !visited.insert(current) {
                continue;
            }
            if pred(current) {
                return Some(current.clone());
            }
            if let Some(parents) = self.replies_to.get(current) {
                stack.extend(parents.iter().rev().filter(|p| !visited.contains(*p)));
            }
        }

        None
    }

    /// True when `ancestor` is reachable from `post` through `replies_to`.
    pub fn is_ancestor(&self, post: &PostDescriptor, ancestor: &PostDescriptor) -> bool {
        self.find_ancestor(post, |candidate| candidate == ancestor)
            .is_some()
    }

    pub fn post_count(&self) -> usize {
        let mut posts: HashSet<&PostDescriptor> = HashSet::new();
        posts.extend(self.replies_to.keys());
        posts.extend(self.replies_from.keys());
        posts.len()
    }

    fn remove_from_set_index(index: &mut PostSetIndex, key: &PostDescriptor, post: &PostDescriptor) {
        if let Some(set) = index.get_mut(key) {
            set.remove(post);
            if set.is_empty() {
                index.remove(key);
            }
        }
    }
}

/// Arena of per-thread reply graphs.
///
/// The outer lock only guards the thread map; each [`ThreadGraph`] has its
/// own lock so ingestion for different threads does not contend.
#[derive(Debug, Default)]
pub struct ReplyGraphStore {
    threads: RwLock<HashMap<ThreadDescriptor, Arc<Mutex<ThreadGraph>>>>,
}

impl ReplyGraphStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, post: PostDescriptor, replies_to: impl IntoIterator<Item = PostDescriptor>) {
        let replies_to: PostSet = replies_to.into_iter().collect();
        let dropped = replies_to
            .iter()
            .filter(|target| target.thread != post.thread)
            .count();
        if dropped > 0 {
            debug!(post = %post, dropped, "ignoring cross-thread replies");
        }

        let graph = self.thread_graph_or_create(&post.thread);
        trace!(post = %post, targets = replies_to.len(), "insert reply edges");
        graph.lock().insert(post, replies_to);
    }

    /// Replaces the whole edge set of `thread`.
    pub fn replace_thread(
        &self,
        thread: &ThreadDescriptor,
        edges: impl IntoIterator<Item = (PostDescriptor, PostSet)>,
    ) {
        let mut fresh = ThreadGraph::new();
        for (post, targets) in edges {
            if post.thread != *thread {
                continue;
            }
            fresh.insert(post, targets);
        }

        let graph = self.thread_graph_or_create(thread);
        *graph.lock() = fresh;
        debug!(thread = thread.thread_no, "replaced thread reply graph");
    }

    pub fn replies_to(&self, post: &PostDescriptor) -> PostSet {
        self.with_graph(&post.thread, |g| g.replies_to(post))
            .unwrap_or_default()
    }

    pub fn replies_from(&self, post: &PostDescriptor) -> PostSet {
        self.with_graph(&post.thread, |g| g.replies_from(post))
            .unwrap_or_default()
    }

    pub fn reply_count(&self, post: &PostDescriptor) -> usize {
        self.with_graph(&post.thread, |g| g.reply_count(post))
            .unwrap_or(0)
    }

    pub fn all_replies_from_recursively(&self, post: &PostDescriptor) -> PostSet {
        self.with_graph(&post.thread, |g| g.all_replies_from_recursively(post))
            .unwrap_or_default()
    }

    pub fn find_with_replies(
        &self,
        post: &PostDescriptor,
        include_from: bool,
        include_to: bool,
        max_depth: usize,
        visited: &mut HashSet<PostDescriptor>,
    ) -> PostSet {
        self.with_graph(&post.thread, |g| {
            g.find_with_replies(post, include_from, include_to, max_depth, visited)
        })
        .unwrap_or_default()
    }

    /// Owned copy of a thread's graph, empty when the thread is unknown.
    pub fn snapshot(&self, thread: &ThreadDescriptor) -> ThreadGraph {
        self.with_graph(thread, ThreadGraph::clone).unwrap_or_default()
    }

    pub fn evict_thread(&self, thread: &ThreadDescriptor) -> bool {
        let removed = self.threads.write().remove(thread).is_some();
        if removed {
            debug!(thread = thread.thread_no, "evicted thread reply graph");
        }
        removed
    }

    pub fn thread_count(&self) -> usize {
        self.threads.read().len()
    }

    fn with_graph<T>(&self, thread: &ThreadDescriptor, f: impl FnOnce(&ThreadGraph) -> T) -> Option<T> {
        let graph = self.threads.read().get(thread).cloned()?;
        let guard = graph.lock();
        Some(f(&guard))
    }

    fn thread_graph_or_create(&self, thread: &ThreadDescriptor) -> Arc<Mutex<ThreadGraph>> {
        if let Some(graph) = self.threads.read().get(thread) {
            return Arc::clone(graph);
        }
        let mut threads = self.threads.write();
        Arc::clone(threads.entry(thread.clone()).or_default())
    }
}
