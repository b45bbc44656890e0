use std::collections::HashSet;

/// Message ids already notified. Unbounded and process-lifetime only: ids
/// are never evicted, and nothing survives a restart. Owned by the single
/// poll/dispatch task, so no internal locking.
#[derive(Debug, Default)]
pub struct SeenMessages {
    ids: HashSet<String>,
}

impl SeenMessages {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_new(&self, id: &str) -> bool {
        !self.ids.contains(id)
    }

    pub fn mark_seen(&mut self, id: impl Into<String>) {
        self.ids.insert(id.into());
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}
