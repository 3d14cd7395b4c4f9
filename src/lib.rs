//! Post visibility propagation for an imageboard client.
//!
//! A thread's reply graph plus a sparse set of hide/unhide decisions
//! determine which posts are hidden. Hiding a post with `apply_to_replies`
//! cascades to every reply of it; manual decisions always win over
//! inherited ones and the OP never inherits a hide.
//!
//! # Examples
//!
//! Synchronous use of the stores and [`engine::propagation::PostHideHelper`]:
//! ```
//! use std::sync::Arc;
//!
//! use replyhide::{
//!     core::{decisions::HideDecisionStore, reply_graph::ReplyGraphStore},
//!     engine::{propagation::PostHideHelper, traits::{InMemoryPostCache, PostCache}},
//!     hide::{PostCellData, PostHide},
//!     types::{ChanDescriptor, ThreadDescriptor},
//! };
//!
//! let thread = ThreadDescriptor::new("site", "g", 1);
//! let graph = Arc::new(ReplyGraphStore::new());
//! // Nothing here persists, so skip the op journal.
//! let decisions = Arc::new(HideDecisionStore::without_journal());
//! let cache = InMemoryPostCache::new();
//!
//! for no in 1..=3u64 {
//!     let post = thread.post(no);
//!     let parent = (no > 1).then(|| thread.post(no - 1));
//!     graph.insert(post.clone(), parent);
//!     cache.put_cells(&[PostCellData::visible(post)]);
//! }
//!
//! let helper = PostHideHelper::new(Arc::clone(&graph), Arc::clone(&decisions));
//! decisions.upsert([PostHide::hidden_manually(thread.post(2), true, "spam")]);
//! let chan = ChanDescriptor::Thread(thread.clone());
//! helper.process_posts(&chan, &[thread.post(2)], &cache);
//!
//! assert!(decisions.is_hidden(&thread.post(3)));
//! assert!(!decisions.is_hidden(&thread.post(1)));
//! ```
//!
//! Runtime usage with a SQLite sink:
//! ```no_run
//! use std::sync::Arc;
//!
//! use replyhide::{
//!     core::{decisions::HideDecisionStore, reply_graph::ReplyGraphStore},
//!     engine::traits::InMemoryPostCache,
//!     persist::sqlite::SqliteHideSink,
//!     runtime::handle::{spawn_post_hide, RuntimeConfig},
//!     types::{ChanDescriptor, ThreadDescriptor},
//! };
//!
//! # #[tokio::main]
//! # async fn main() {
//! let sink = SqliteHideSink::open("hides.db").expect("open sqlite");
//! let decisions = Arc::new(sink.load_decisions().expect("load"));
//! let handle = spawn_post_hide(
//!     Arc::new(ReplyGraphStore::new()),
//!     decisions,
//!     Arc::new(InMemoryPostCache::new()),
//!     Some(Box::new(sink)),
//!     RuntimeConfig::default(),
//! );
//! let thread = ThreadDescriptor::new("site", "g", 1);
//! handle
//!     .hide(ChanDescriptor::Thread(thread.clone()), vec![thread.post(2)], true, "off topic")
//!     .await
//!     .expect("hide");
//! handle.shutdown().await.expect("shutdown");
//! # }
//! ```

/// Reply graph and hide decision stores.
pub mod core;
/// Incremental and batch propagation engines.
pub mod engine;
/// Hide decision records and renderer annotations.
pub mod hide;
/// Decision journal op model.
pub mod op;
/// Persistence abstraction and SQLite implementation.
pub mod persist;
/// Single-writer runtime handle and events.
pub mod runtime;
/// Catalog, thread and post descriptors.
pub mod types;
