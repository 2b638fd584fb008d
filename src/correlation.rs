//! Tracking of in-flight request IDs.
//!
//! Every emitted AuthnRequest/LogoutRequest ID is remembered per user
//! bucket until its response is consumed or it ages out. The validator
//! removes the entry on exit whether validation succeeded or not, so a
//! replayed response never matches twice.

use std::collections::VecDeque;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use lru::LruCache;

/// What kind of request an entry correlates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingKind {
    Authn,
    Logout,
}

#[derive(Debug)]
struct Pending {
    id: String,
    kind: PendingKind,
    issued_at: Instant,
}

#[derive(Debug, Default)]
struct Bucket {
    entries: VecDeque<Pending>,
}

impl Bucket {
    fn purge_expired(&mut self, ttl: Duration) {
        let now = Instant::now();
        self.entries
            .retain(|p| now.duration_since(p.issued_at) < ttl);
    }
}

/// Bounded map of user bucket to pending request IDs. The bucket map is
/// LRU-bounded so hostile clients cannot grow it without bound; within a
/// bucket, entries are FIFO-evicted past the per-bucket cap and purged
/// past the TTL.
pub struct CorrelationCache {
    buckets: Mutex<LruCache<String, Arc<Mutex<Bucket>>>>,
    max_per_bucket: usize,
    ttl: Duration,
}

/// Default pending-entry lifetime.
pub const DEFAULT_TTL: Duration = Duration::from_secs(600);
/// Default per-bucket entry cap.
pub const DEFAULT_MAX_PER_BUCKET: usize = 32;
const MAX_BUCKETS: usize = 16384;

impl Default for CorrelationCache {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_PER_BUCKET, DEFAULT_TTL)
    }
}

impl CorrelationCache {
    pub fn new(max_per_bucket: usize, ttl: Duration) -> Self {
        Self {
            buckets: Mutex::new(LruCache::new(
                NonZeroUsize::new(MAX_BUCKETS).expect("bucket bound is non-zero"),
            )),
            max_per_bucket: max_per_bucket.max(1),
            ttl,
        }
    }

    fn bucket(&self, user_bucket: &str) -> Arc<Mutex<Bucket>> {
        let mut buckets = self
            .buckets
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(bucket) = buckets.get(user_bucket) {
            return bucket.clone();
        }
        let bucket = Arc::new(Mutex::new(Bucket::default()));
        buckets.put(user_bucket.to_string(), bucket.clone());
        bucket
    }

    /// Record an issued request ID for the bucket.
    pub fn add(&self, user_bucket: &str, id: &str, kind: PendingKind) {
        let bucket = self.bucket(user_bucket);
        let mut bucket = bucket.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        bucket.purge_expired(self.ttl);
        while bucket.entries.len() >= self.max_per_bucket {
            bucket.entries.pop_front();
        }
        bucket.entries.push_back(Pending {
            id: id.to_string(),
            kind,
            issued_at: Instant::now(),
        });
    }

    /// Remove an entry, reporting whether it was present and live.
    pub fn remove(&self, user_bucket: &str, id: &str) -> bool {
        let bucket = self.bucket(user_bucket);
        let mut bucket = bucket.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        bucket.purge_expired(self.ttl);
        let before = bucket.entries.len();
        bucket.entries.retain(|p| p.id != id);
        bucket.entries.len() != before
    }

    pub fn contains(&self, user_bucket: &str, id: &str) -> bool {
        let bucket = self.bucket(user_bucket);
        let mut bucket = bucket.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        bucket.purge_expired(self.ttl);
        bucket.entries.iter().any(|p| p.id == id)
    }

    pub fn kind_of(&self, user_bucket: &str, id: &str) -> Option<PendingKind> {
        let bucket = self.bucket(user_bucket);
        let mut bucket = bucket.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        bucket.purge_expired(self.ttl);
        bucket.entries.iter().find(|p| p.id == id).map(|p| p.kind)
    }

    /// Live entry count for a bucket.
    pub fn pending(&self, user_bucket: &str) -> usize {
        let bucket = self.bucket(user_bucket);
        let mut bucket = bucket.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        bucket.purge_expired(self.ttl);
        bucket.entries.len()
    }
}
