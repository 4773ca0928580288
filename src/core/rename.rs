//! Pairs move-out and move-in events into renames.

use std::hash::Hash;
use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use lru::LruCache;

/// An unmatched move-out waiting for its move-in.
#[derive(Debug, Clone)]
pub struct PendingRename<O> {
    pub cookie: u32,
    pub owner: O,
    pub old_path: PathBuf,
    pub is_dir: bool,
    pub inserted: Instant,
}

/// Holds pending renames by scope and cookie, bounded both in count and in age.
///
/// Cookies are only meaningful within one scope: when two watches share a
/// directory, each sees the same cookie and keeps its own pending entry.
/// Entries leave either through [`resolve`](Self::resolve) (matched) or
/// through eviction, which hands them back so the caller can report them as
/// deletions.
pub struct RenameCorrelator<K, O>
where
    K: Hash + Eq + Clone,
{
    pending: LruCache<(K, u32), PendingRename<O>>,
    retention: Duration,
}

impl<K, O> RenameCorrelator<K, O>
where
    K: Hash + Eq + Clone,
{
    pub fn new(retention: Duration, capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            pending: LruCache::new(capacity),
            retention,
        }
    }

    /// Record a move-out seen by `scope`. Returns an entry pushed out to make
    /// room, or a previous entry of the same scope with the same cookie.
    pub fn record(&mut self, scope: K, pending: PendingRename<O>) -> Option<PendingRename<O>> {
        self.pending
            .push((scope, pending.cookie), pending)
            .map(|(_, evicted)| evicted)
    }

    /// Take the pending move-out `scope` recorded for `cookie`, if one is held.
    pub fn resolve(&mut self, scope: &K, cookie: u32) -> Option<PendingRename<O>> {
        self.pending.pop(&(scope.clone(), cookie))
    }

    /// Remove and return every entry older than the retention window, oldest first.
    pub fn evict_expired(&mut self, now: Instant) -> Vec<PendingRename<O>> {
        let mut expired = Vec::new();
        while let Some((_, oldest)) = self.pending.peek_lru() {
            if now.saturating_duration_since(oldest.inserted) < self.retention {
                break;
            }
            if let Some((_, pending)) = self.pending.pop_lru() {
                expired.push(pending);
            }
        }
        expired
    }

    /// When the oldest pending entry expires.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.pending
            .peek_lru()
            .map(|(_, oldest)| oldest.inserted + self.retention)
    }

    pub fn retention(&self) -> Duration {
        self.retention
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pending(cookie: u32, path: &str, inserted: Instant) -> PendingRename<u8> {
        PendingRename {
            cookie,
            owner: 0,
            old_path: PathBuf::from(path),
            is_dir: false,
            inserted,
        }
    }

    #[test]
    fn test_resolve_consumes_entry() {
        let mut correlator = RenameCorrelator::new(Duration::from_secs(1), 8);
        let now = Instant::now();

        assert!(correlator.record(1, pending(7, "a/b.txt", now)).is_none());
        let matched = correlator.resolve(&1, 7).expect("pending rename");
        assert_eq!(matched.old_path, PathBuf::from("a/b.txt"));
        assert!(correlator.resolve(&1, 7).is_none());
        assert!(correlator.is_empty());
    }

    #[test]
    fn test_same_cookie_in_two_scopes() {
        let mut correlator = RenameCorrelator::new(Duration::from_secs(1), 8);
        let now = Instant::now();

        assert!(correlator.record(1, pending(7, "a/x", now)).is_none());
        assert!(correlator.record(2, pending(7, "x", now)).is_none());
        assert_eq!(correlator.len(), 2);

        assert_eq!(correlator.resolve(&2, 7).unwrap().old_path, PathBuf::from("x"));
        assert_eq!(correlator.resolve(&1, 7).unwrap().old_path, PathBuf::from("a/x"));
        assert!(correlator.resolve(&3, 7).is_none());
    }

    #[test]
    fn test_same_scope_and_cookie_displaces() {
        let mut correlator = RenameCorrelator::new(Duration::from_secs(1), 8);
        let now = Instant::now();

        correlator.record(1, pending(7, "first", now));
        let displaced = correlator.record(1, pending(7, "second", now)).expect("displaced");

        assert_eq!(displaced.old_path, PathBuf::from("first"));
        assert_eq!(correlator.len(), 1);
    }

    #[test]
    fn test_capacity_evicts_oldest() {
        let mut correlator = RenameCorrelator::new(Duration::from_secs(1), 2);
        let now = Instant::now();

        correlator.record(0, pending(1, "one", now));
        correlator.record(0, pending(2, "two", now));
        let evicted = correlator.record(0, pending(3, "three", now)).expect("evicted");

        assert_eq!(evicted.cookie, 1);
        assert_eq!(correlator.len(), 2);
    }

    #[test]
    fn test_evict_expired_respects_retention() {
        let retention = Duration::from_millis(100);
        let mut correlator = RenameCorrelator::new(retention, 8);
        let start = Instant::now();

        correlator.record(0, pending(1, "old", start));
        correlator.record(0, pending(2, "young", start + Duration::from_millis(80)));
        assert_eq!(correlator.next_deadline(), Some(start + retention));

        let expired = correlator.evict_expired(start + Duration::from_millis(120));
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].old_path, PathBuf::from("old"));
        assert_eq!(correlator.next_deadline(), Some(start + Duration::from_millis(180)));

        assert_eq!(correlator.evict_expired(start + Duration::from_secs(1)).len(), 1);
        assert!(correlator.next_deadline().is_none());
    }
}
