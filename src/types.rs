//! Shared descriptor types identifying catalogs, threads and posts.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Thread or post number as assigned by the site.
pub type PostNo = u64;
/// Monotonic journal sequence number.
pub type OpSeq = u64;

/// A board on a site.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CatalogDescriptor {
    /// Site key, e.g. `4chan`.
    pub site_key: String,
    /// Board code, e.g. `g`.
    pub board_code: String,
}

impl CatalogDescriptor {
    /// Builds a catalog descriptor.
    pub fn new(site_key: impl Into<String>, board_code: impl Into<String>) -> Self {
        Self {
            site_key: site_key.into(),
            board_code: board_code.into(),
        }
    }

    /// Descriptor of thread `thread_no` on this board.
    pub fn thread(&self, thread_no: PostNo) -> ThreadDescriptor {
        ThreadDescriptor {
            catalog: self.clone(),
            thread_no,
        }
    }
}

/// A single thread on a board.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ThreadDescriptor {
    /// Owning board.
    pub catalog: CatalogDescriptor,
    /// Thread number, equal to the OP's post number.
    pub thread_no: PostNo,
}

impl ThreadDescriptor {
    /// Builds a thread descriptor.
    pub fn new(
        site_key: impl Into<String>,
        board_code: impl Into<String>,
        thread_no: PostNo,
    ) -> Self {
        CatalogDescriptor::new(site_key, board_code).thread(thread_no)
    }

    /// Descriptor of post `post_no` in this thread.
    pub fn post(&self, post_no: PostNo) -> PostDescriptor {
        PostDescriptor {
            thread: self.clone(),
            post_no,
            post_sub_no: 0,
        }
    }

    /// Descriptor of this thread's original post.
    pub fn op(&self) -> PostDescriptor {
        self.post(self.thread_no)
    }
}

/// Identity of a post.
///
/// Ordering follows the thread, then the post number, then the sub-number,
/// so ascending order walks a thread from oldest to newest.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PostDescriptor {
    /// Owning thread.
    pub thread: ThreadDescriptor,
    /// Post number.
    pub post_no: PostNo,
    /// Sub-number used by sites that split posts; zero otherwise.
    pub post_sub_no: u64,
}

impl PostDescriptor {
    /// True when this post is the original post of its thread.
    pub fn is_op(&self) -> bool {
        self.post_no == self.thread.thread_no && self.post_sub_no == 0
    }

    /// Board this post lives on.
    pub fn catalog(&self) -> &CatalogDescriptor {
        &self.thread.catalog
    }
}

impl fmt::Display for PostDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}/{}",
            self.thread.catalog.site_key, self.thread.catalog.board_code, self.thread.thread_no, self.post_no
        )?;
        if self.post_sub_no != 0 {
            write!(f, ",{}", self.post_sub_no)?;
        }
        Ok(())
    }
}

/// What the user is currently looking at.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChanDescriptor {
    /// A board catalog, where every entry is the OP of a separate thread.
    Catalog(CatalogDescriptor),
    /// A single thread with its reply graph.
    Thread(ThreadDescriptor),
}

impl ChanDescriptor {
    /// True for catalog descriptors.
    pub fn is_catalog(&self) -> bool {
        matches!(self, Self::Catalog(_))
    }

    /// True when `post` belongs to what this descriptor shows.
    ///
    /// A catalog only covers the OPs of its threads.
    pub fn covers(&self, post: &PostDescriptor) -> bool {
        match self {
            Self::Catalog(catalog) => post.is_op() && post.catalog() == catalog,
            Self::Thread(thread) => &post.thread == thread,
        }
    }
}

impl From<ThreadDescriptor> for ChanDescriptor {
    fn from(value: ThreadDescriptor) -> Self {
        Self::Thread(value)
    }
}

impl From<CatalogDescriptor> for ChanDescriptor {
    fn from(value: CatalogDescriptor) -> Self {
        Self::Catalog(value)
    }
}
