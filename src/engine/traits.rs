use hashbrown::HashMap;
use parking_lot::RwLock;

use crate::{hide::PostCellData, types::PostDescriptor};

/// Renderer-side post cache.
///
/// The engine only reads the current hide annotation of a post and hands
/// back updated cells; it never owns post content.
pub trait PostCache: Send + Sync {
    /// Current cell for `post`, `None` when the post is not loaded.
    fn post_cell(&self, post: &PostDescriptor) -> Option<PostCellData>;

    /// Stores cells whose hide annotation changed.
    fn put_cells(&self, cells: &[PostCellData]);
}

/// Simple map-backed [`PostCache`].
#[derive(Debug, Default)]
pub struct InMemoryPostCache {
    cells: RwLock<HashMap<PostDescriptor, PostCellData>>,
}

impl InMemoryPostCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.cells.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.read().is_empty()
    }
}

impl PostCache for InMemoryPostCache {
    fn post_cell(&self, post: &PostDescriptor) -> Option<PostCellData> {
        self.cells.read().get(post).cloned()
    }

    fn put_cells(&self, cells: &[PostCellData]) {
        let mut map = self.cells.write();
        for cell in cells {
            map.insert(cell.post.clone(), cell.clone());
        }
    }
}
