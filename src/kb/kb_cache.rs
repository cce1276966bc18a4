//! kb_cache.rs
//!
//! Remembers which knowledge base belongs to which connection for the life of
//! the process. Only ids are cached; the object itself is always re-read
//! before a mutation.

use std::collections::HashMap;
use std::sync::Mutex;

#[derive(Debug, Default)]
pub struct KnowledgeBaseCache {
    by_connection: Mutex<HashMap<String, String>>,
}

impl KnowledgeBaseCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, String>> {
        self.by_connection.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn get(&self, connection_id: &str) -> Option<String> {
        self.lock().get(connection_id).cloned()
    }

    pub fn put(&self, connection_id: &str, knowledge_base_id: &str) {
        self.lock()
            .insert(connection_id.to_string(), knowledge_base_id.to_string());
    }

    pub fn invalidate(&self, connection_id: &str) {
        self.lock().remove(connection_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_get_invalidate() {
        let cache = KnowledgeBaseCache::new();
        assert_eq!(cache.get("c1"), None);
        cache.put("c1", "kb1");
        cache.put("c1", "kb2");
        assert_eq!(cache.get("c1").as_deref(), Some("kb2"));
        cache.invalidate("c1");
        assert_eq!(cache.get("c1"), None);
    }
}
