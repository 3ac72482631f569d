//! Per-owner cache of derived mailbox statistics

use std::collections::HashMap;
use std::sync::RwLock;

use crate::models::MailboxStats;

/// Cached `MailboxStats`, invalidated whenever an owner's threads change
#[derive(Default)]
pub struct StatsCache {
    entries: RwLock<HashMap<String, MailboxStats>>,
}

impl StatsCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, owner: &str) -> Option<MailboxStats> {
        self.entries.read().ok()?.get(owner).cloned()
    }

    pub fn put(&self, owner: &str, stats: MailboxStats) {
        if let Ok(mut entries) = self.entries.write() {
            entries.insert(owner.to_string(), stats);
        }
    }

    pub fn invalidate(&self, owner: &str) {
        if let Ok(mut entries) = self.entries.write() {
            entries.remove(owner);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_put_get_invalidate() {
        let cache = StatsCache::new();
        assert!(cache.get("a@example.com").is_none());

        let stats = MailboxStats {
            total_threads: 3,
            ..Default::default()
        };
        cache.put("a@example.com", stats.clone());
        assert_eq!(cache.get("a@example.com"), Some(stats));
        assert!(cache.get("b@example.com").is_none());

        cache.invalidate("a@example.com");
        assert!(cache.get("a@example.com").is_none());
    }
}
