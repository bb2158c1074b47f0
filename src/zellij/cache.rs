// ABOUTME: TTL cache for captured pane content
//
// Capture is invoked by several periodic tasks; the cache keeps them from
// hammering the backend when content cannot have changed. Keystroke sends
// invalidate it explicitly.

use std::sync::Mutex;
use std::time::{Duration, Instant};

#[derive(Default)]
struct CacheInner {
    content: String,
    last_update: Option<Instant>,
}

/// A TTL-based cache for pane content.
pub struct ContentCache {
    inner: Mutex<CacheInner>,
    ttl: Duration,
}

impl ContentCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            inner: Mutex::new(CacheInner::default()),
            ttl,
        }
    }

    /// Returns the cached content if it is still valid.
    pub fn get(&self) -> Option<String> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let last_update = inner.last_update?;
        if last_update.elapsed() > self.ttl {
            return None;
        }
        Some(inner.content.clone())
    }

    /// Stores new content, restarting the TTL.
    pub fn set(&self, content: String) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.content = content;
        inner.last_update = Some(Instant::now());
    }

    /// Clears the cache, forcing the next `get` to miss.
    pub fn invalidate(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.last_update = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_cache_misses() {
        let cache = ContentCache::new(Duration::from_millis(200));
        assert!(cache.get().is_none());
    }

    #[test]
    fn test_set_then_get() {
        let cache = ContentCache::new(Duration::from_millis(200));
        cache.set("hello".to_string());
        assert_eq!(cache.get().as_deref(), Some("hello"));
    }

    #[test]
    fn test_invalidate_clears() {
        let cache = ContentCache::new(Duration::from_millis(200));
        cache.set("hello".to_string());
        cache.invalidate();
        assert!(cache.get().is_none());
    }

    #[test]
    fn test_expiry() {
        let cache = ContentCache::new(Duration::from_millis(1));
        cache.set("hello".to_string());
        std::thread::sleep(Duration::from_millis(5));
        assert!(cache.get().is_none());
    }
}
