//! Per-worker deduplicating post buffer.

use std::collections::HashMap;

use parking_lot::Mutex;

use crate::models::Post;

/// Posts keyed by post id. The first copy of an id wins until the buffer
/// is drained.
#[derive(Debug, Default)]
pub struct PostBuffer {
    posts: Mutex<HashMap<String, Post>>,
}

impl PostBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a post; returns false if its id is already buffered.
    pub fn try_add(&self, post: Post) -> bool {
        let mut posts = self.posts.lock();
        if posts.contains_key(&post.post_id) {
            return false;
        }
        posts.insert(post.post_id.clone(), post);
        true
    }

    /// Take every buffered post and leave the buffer empty, in one step.
    pub fn snapshot_and_clear(&self) -> Vec<Post> {
        let drained = std::mem::take(&mut *self.posts.lock());
        drained.into_values().collect()
    }

    pub fn size(&self) -> usize {
        self.posts.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }
}
