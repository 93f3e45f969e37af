//! DNS record cache.
//!
//! In-memory cache keyed by question, with absolute expiry computed from
//! record TTLs at insertion. Entries on different keys never block each
//! other; the map shards its locks per key.

use std::time::{Duration, Instant};

use dashmap::DashMap;
use log::debug;

use crate::dns::{Question, ResourceRecord};

/// Interval for sweeping expired cache entries.
pub const CACHE_CLEANUP_INTERVAL: Duration = Duration::from_secs(300);

/// An entry in the cache.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    /// The cached records.
    pub records: Vec<ResourceRecord>,

    /// Absolute expiry; the entry is never served past this point.
    pub expires_at: Instant,
}

/// Cache for resolved records, shared by all in-flight resolutions.
#[derive(Debug, Default)]
pub struct DnsCache {
    entries: DashMap<Question, CacheEntry>,
}

impl DnsCache {
    pub fn new() -> Self {
        Self { entries: DashMap::new() }
    }

    /// Get the cached records for a question.
    ///
    /// An expired entry is treated as absent and removed on the way out.
    pub fn lookup(&self, question: &Question) -> Option<Vec<ResourceRecord>> {
        {
            let entry = self.entries.get(question)?;
            if Instant::now() < entry.expires_at {
                return Some(entry.records.clone());
            }
        }
        self.entries.remove(question);
        None
    }

    /// Cache records for a question for `ttl` from now.
    pub fn insert(&self, question: Question, records: Vec<ResourceRecord>, ttl: Duration) {
        self.entries.insert(
            question,
            CacheEntry {
                records,
                expires_at: Instant::now() + ttl,
            },
        );
    }

    /// Remove expired entries.
    pub fn sweep(&self) {
        let now = Instant::now();
        self.entries.retain(|_, entry| entry.expires_at > now);
        debug!("Cache sweep completed, {} entries live", self.entries.len());
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
