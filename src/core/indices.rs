use std::collections::BTreeSet;

use hashbrown::HashMap;

use crate::types::PostDescriptor;

pub type PostSet = BTreeSet<PostDescriptor>;

pub type PostSetIndex = HashMap<PostDescriptor, PostSet>;
