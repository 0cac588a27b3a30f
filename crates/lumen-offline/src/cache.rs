use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};

use crate::Response;

type Cache = HashMap<String, Response>;

/// Named caches of request URL to response.
#[derive(Debug, Default)]
pub struct CacheStorage {
    caches: Mutex<BTreeMap<String, Cache>>,
}

impl CacheStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<String, Cache>> {
        self.caches.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Create the named cache if missing.
    pub fn open(&self, name: &str) {
        self.lock().entry(name.to_string()).or_default();
    }

    /// Cache names in sorted order.
    pub fn keys(&self) -> Vec<String> {
        self.lock().keys().cloned().collect()
    }

    pub fn delete(&self, name: &str) -> bool {
        self.lock().remove(name).is_some()
    }

    pub fn put(&self, name: &str, url: &str, response: Response) {
        self.lock()
            .entry(name.to_string())
            .or_default()
            .insert(url.to_string(), response);
    }

    /// Look `url` up in one cache.
    pub fn match_in(&self, name: &str, url: &str) -> Option<Response> {
        self.lock().get(name).and_then(|cache| cache.get(url)).cloned()
    }

    /// Look `url` up across every cache, oldest name first.
    pub fn match_any(&self, url: &str) -> Option<Response> {
        self.lock().values().find_map(|cache| cache.get(url)).cloned()
    }

    pub fn entry_count(&self, name: &str) -> usize {
        self.lock().get(name).map_or(0, HashMap::len)
    }
}
