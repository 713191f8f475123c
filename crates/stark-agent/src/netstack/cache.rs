//! The per-pod sticky target cache.
//!
//! Each (calling pod, service) pair remembers the pod it resolved to until
//! the entry's TTL lapses, the target degrades, or the entry is explicitly
//! invalidated after a failed envelope.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::HashMap;

use stark_core::{NodeId, PodId, ServiceId};

/// A cached target selection.
#[derive(Debug, Clone)]
pub struct CachedTarget {
    /// The selected pod.
    pub pod_id: PodId,
    /// The node hosting it.
    pub node_id: NodeId,
    /// Dialable peer address of that node, when known.
    pub peer_addr: Option<String>,
    /// When the entry stops being valid.
    pub expires_at: DateTime<Utc>,
    /// Cleared when the target is observed failing.
    pub healthy: bool,
}

impl CachedTarget {
    /// Whether the entry may be used at `now`.
    #[must_use]
    pub fn is_valid(&self, now: DateTime<Utc>) -> bool {
        self.healthy && now < self.expires_at
    }
}

/// Sticky target cache keyed by (calling pod, service).
#[derive(Default)]
pub struct TargetCache {
    entries: RwLock<HashMap<(PodId, ServiceId), CachedTarget>>,
}

impl TargetCache {
    /// Create an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A valid entry for the pair, if any.
    #[must_use]
    pub fn get(&self, source: &PodId, service: &ServiceId) -> Option<CachedTarget> {
        let entries = self.entries.read();
        let entry = entries.get(&(*source, service.clone()))?;
        entry.is_valid(Utc::now()).then(|| entry.clone())
    }

    /// Record a selection for the pair.
    pub fn insert(&self, source: PodId, service: ServiceId, target: CachedTarget) {
        self.entries.write().insert((source, service), target);
    }

    /// Drop the entry for one pair.
    pub fn invalidate(&self, source: &PodId, service: &ServiceId) {
        self.entries.write().remove(&(*source, service.clone()));
    }

    /// Mark every entry pointing at `target_pod` unhealthy.
    pub fn mark_target_unhealthy(&self, target_pod: &PodId) {
        for entry in self.entries.write().values_mut() {
            if entry.pod_id == *target_pod {
                entry.healthy = false;
            }
        }
    }

    /// Drop every entry held by a calling pod; used when it terminates.
    pub fn forget_source(&self, source: &PodId) {
        self.entries.write().retain(|(pod, _), _| pod != source);
    }

    /// Number of live entries (valid or not).
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Whether the cache is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn target(seed: u64, ttl_secs: i64) -> CachedTarget {
        CachedTarget {
            pod_id: PodId::generate_deterministic(seed),
            node_id: NodeId::generate_deterministic(seed),
            peer_addr: Some("10.0.0.1:7700".into()),
            expires_at: Utc::now() + Duration::seconds(ttl_secs),
            healthy: true,
        }
    }

    fn service() -> ServiceId {
        "b".parse().unwrap()
    }

    #[test]
    fn valid_entry_returned() {
        let cache = TargetCache::new();
        let source = PodId::generate_deterministic(1);
        cache.insert(source, service(), target(10, 60));

        let found = cache.get(&source, &service()).expect("cached entry");
        assert_eq!(found.pod_id, PodId::generate_deterministic(10));
    }

    #[test]
    fn expired_entry_is_a_miss() {
        let cache = TargetCache::new();
        let source = PodId::generate_deterministic(1);
        cache.insert(source, service(), target(10, -1));

        assert!(cache.get(&source, &service()).is_none());
        // The stale entry still occupies a slot until overwritten.
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn unhealthy_target_is_a_miss_everywhere() {
        let cache = TargetCache::new();
        let source_a = PodId::generate_deterministic(1);
        let source_b = PodId::generate_deterministic(2);
        cache.insert(source_a, service(), target(10, 60));
        cache.insert(source_b, service(), target(10, 60));

        cache.mark_target_unhealthy(&PodId::generate_deterministic(10));
        assert!(cache.get(&source_a, &service()).is_none());
        assert!(cache.get(&source_b, &service()).is_none());
    }

    #[test]
    fn invalidate_clears_single_pair() {
        let cache = TargetCache::new();
        let source = PodId::generate_deterministic(1);
        cache.insert(source, service(), target(10, 60));
        cache.invalidate(&source, &service());
        assert!(cache.is_empty());
    }

    #[test]
    fn forget_source_clears_callers_entries() {
        let cache = TargetCache::new();
        let source_a = PodId::generate_deterministic(1);
        let source_b = PodId::generate_deterministic(2);
        cache.insert(source_a, service(), target(10, 60));
        cache.insert(source_b, service(), target(10, 60));

        cache.forget_source(&source_a);
        assert!(cache.get(&source_a, &service()).is_none());
        assert!(cache.get(&source_b, &service()).is_some());
    }
}
