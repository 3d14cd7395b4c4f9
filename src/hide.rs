//! Hide decision records and the renderer-side hide annotation.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::types::PostDescriptor;

/// Where a post's hide decision came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum HideState {
    /// No explicit decision.
    #[default]
    Unspecified,
    /// The user hid this post.
    HiddenManually,
    /// Hidden because it replies, directly or transitively, to a hidden post.
    HiddenAutomatically {
        /// Hidden root this post currently inherits its hide from.
        cause: PostDescriptor,
    },
    /// The user explicitly unhid this post.
    UnhiddenManually,
}

impl HideState {
    /// True for the two states only the user can set.
    pub fn is_manual(&self) -> bool {
        matches!(self, Self::HiddenManually | Self::UnhiddenManually)
    }
}

/// Explicit or derived hide decision for one post.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostHide {
    /// Post this decision applies to.
    pub post: PostDescriptor,
    /// When true the hide cascades to every reply of this post.
    pub apply_to_replies: bool,
    /// True when the user overrode the hide by hand.
    pub manually_restored: bool,
    /// Decision state.
    pub state: HideState,
    /// Human-readable reason shown in place of the post.
    pub reason: String,
    /// Hidden roots this post inherits its hide from.
    #[serde(default)]
    pub replied_to_hidden: BTreeSet<PostDescriptor>,
}

impl PostHide {
    /// An empty decision for `post`.
    pub fn unspecified(post: PostDescriptor) -> Self {
        Self {
            post,
            apply_to_replies: false,
            manually_restored: false,
            state: HideState::Unspecified,
            reason: String::new(),
            replied_to_hidden: BTreeSet::new(),
        }
    }

    /// A decision the user made to hide `post`.
    pub fn hidden_manually(
        post: PostDescriptor,
        apply_to_replies: bool,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            post,
            apply_to_replies,
            manually_restored: false,
            state: HideState::HiddenManually,
            reason: reason.into(),
            replied_to_hidden: BTreeSet::new(),
        }
    }

    /// A decision the user made to show `post` regardless of its ancestors.
    pub fn unhidden_manually(post: PostDescriptor) -> Self {
        Self {
            post,
            apply_to_replies: false,
            manually_restored: true,
            state: HideState::UnhiddenManually,
            reason: String::new(),
            replied_to_hidden: BTreeSet::new(),
        }
    }

    /// Effective visibility derived from this decision alone.
    pub fn is_hidden(&self) -> bool {
        !self.manually_restored
            && matches!(
                self.state,
                HideState::HiddenManually | HideState::HiddenAutomatically { .. }
            )
    }

    /// True when the user set this decision by hand.
    pub fn is_manual(&self) -> bool {
        self.manually_restored || self.state.is_manual()
    }

    /// True when this decision is a live source of cascading hides.
    ///
    /// An OP never cascades into its own thread.
    pub fn is_hide_root(&self) -> bool {
        self.state == HideState::HiddenManually
            && self.apply_to_replies
            && !self.manually_restored
            && !self.post.is_op()
    }

    /// True when this post's hide flows on to its replies.
    pub fn propagates(&self) -> bool {
        self.is_hidden() && self.apply_to_replies
    }

    /// Hidden roots this decision hands down to its replies.
    pub fn roots_for_replies(&self) -> BTreeSet<PostDescriptor> {
        if self.is_hide_root() {
            return BTreeSet::from([self.post.clone()]);
        }
        if self.propagates() {
            return self.replied_to_hidden.clone();
        }
        BTreeSet::new()
    }

    /// True when this decision was derived from an ancestor.
    pub fn is_automatic(&self) -> bool {
        matches!(self.state, HideState::HiddenAutomatically { .. })
    }

    /// True when any field that affects visibility differs from `other`.
    ///
    /// `reason` is presentation only and does not count.
    pub fn differs_from(&self, other: &Self) -> bool {
        self.apply_to_replies != other.apply_to_replies
            || self.manually_restored != other.manually_restored
            || self.state != other.state
            || self.replied_to_hidden != other.replied_to_hidden
    }

    /// Turns this decision into an automatic hide inherited from `roots`.
    ///
    /// An empty root set clears the decision back to [`HideState::Unspecified`].
    pub fn set_automatic_roots(&mut self, roots: BTreeSet<PostDescriptor>) {
        match roots.first().cloned() {
            Some(cause) => {
                self.reason = format!("reply to hidden post {}", cause.post_no);
                self.state = HideState::HiddenAutomatically { cause };
                self.apply_to_replies = true;
            }
            None => {
                self.state = HideState::Unspecified;
                self.apply_to_replies = false;
                self.reason.clear();
            }
        }
        self.replied_to_hidden = roots;
    }

    /// Annotation the renderer should show for this decision.
    pub fn hide_ui(&self) -> Option<PostHideUi> {
        if !self.is_hidden() {
            return None;
        }
        Some(PostHideUi {
            reason: self.reason.clone(),
            hidden_automatically: self.is_automatic(),
        })
    }
}

/// What the renderer draws in place of a hidden post.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostHideUi {
    /// Reason text.
    pub reason: String,
    /// True when the hide was inherited from an ancestor.
    pub hidden_automatically: bool,
}

/// Renderer-side copy of a post's hide annotation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostCellData {
    /// Post this cell renders.
    pub post: PostDescriptor,
    /// Current hide annotation, `None` when the post is drawn normally.
    pub post_hide: Option<PostHideUi>,
}

impl PostCellData {
    /// A visible cell for `post`.
    pub fn visible(post: PostDescriptor) -> Self {
        Self {
            post,
            post_hide: None,
        }
    }

    /// True when the renderer currently draws this post hidden.
    pub fn is_rendered_hidden(&self) -> bool {
        self.post_hide.is_some()
    }
}
