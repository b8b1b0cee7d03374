use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::config::RefreshKeyCacheConfig;

use super::refresh_key::RefreshKeyValue;

#[derive(Debug, Clone)]
struct CacheEntry {
    value: RefreshKeyValue,
    inserted_at: Instant,
    ttl: Duration,
}

impl CacheEntry {
    fn is_live(&self) -> bool {
        self.inserted_at.elapsed() < self.ttl
    }
}

/// Refresh-key results keyed by `(data_source, sql)`, with TTL and size limits.
#[derive(Debug)]
pub struct KeyCache {
    entries: HashMap<(String, String), CacheEntry>,
    ttl: Duration,
    max_size: usize,
}

impl Default for KeyCache {
    fn default() -> Self {
        Self::with_config(&RefreshKeyCacheConfig::default())
    }
}

impl KeyCache {
    pub fn with_config(config: &RefreshKeyCacheConfig) -> Self {
        Self {
            entries: HashMap::new(),
            ttl: Duration::from_secs(config.ttl_secs),
            max_size: config.max_size.max(1),
        }
    }

    /// Insert with the cache-wide TTL, or `ttl` when the key sets its own.
    pub fn insert(&mut self, data_source: &str, sql: &str, value: RefreshKeyValue, ttl: Option<Duration>) {
        let key = (data_source.to_string(), sql.to_string());
        if !self.entries.contains_key(&key) && self.entries.len() >= self.max_size {
            self.evict_expired();
            if self.entries.len() >= self.max_size {
                self.evict_oldest();
            }
        }
        self.entries.insert(
            key,
            CacheEntry {
                value,
                inserted_at: Instant::now(),
                ttl: ttl.unwrap_or(self.ttl),
            },
        );
    }

    pub fn get(&self, data_source: &str, sql: &str) -> Option<&RefreshKeyValue> {
        let key = (data_source.to_string(), sql.to_string());
        self.entries
            .get(&key)
            .filter(|entry| entry.is_live())
            .map(|entry| &entry.value)
    }

    pub fn evict_expired(&mut self) {
        self.entries.retain(|_, entry| entry.is_live());
    }

    fn evict_oldest(&mut self) {
        if let Some(oldest_key) = self
            .entries
            .iter()
            .min_by_key(|(_, entry)| entry.inserted_at)
            .map(|(k, _)| k.clone())
        {
            tracing::debug!(data_source = %oldest_key.0, "evicting oldest refresh key");
            self.entries.remove(&oldest_key);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn value(v: &str) -> RefreshKeyValue {
        RefreshKeyValue(v.to_string())
    }

    #[test]
    fn expires_per_entry_ttl() {
        let mut cache = KeyCache::default();
        cache.insert("default", "SELECT 1", value("a"), Some(Duration::ZERO));
        cache.insert("default", "SELECT 2", value("b"), None);
        assert!(cache.get("default", "SELECT 1").is_none());
        assert_eq!(cache.get("default", "SELECT 2"), Some(&value("b")));
    }

    #[test]
    fn evicts_at_capacity() {
        let mut cache = KeyCache::with_config(&RefreshKeyCacheConfig {
            ttl_secs: 60,
            max_size: 2,
        });
        cache.insert("default", "a", value("1"), None);
        cache.insert("default", "b", value("2"), None);
        cache.insert("default", "c", value("3"), None);
        assert_eq!(cache.len(), 2);
        assert!(cache.get("default", "c").is_some());
    }
}
