use lru::LruCache;
use parking_lot::Mutex;
use std::num::NonZeroUsize;
use std::sync::Arc;

use super::query_planner::ExecutionPlan;

/// Bounded LRU of execution plans keyed by the normalized operation hash.
///
/// Owned by one executor; a new composition starts with an empty cache.
pub struct PlanCache {
    inner: Mutex<LruCache<u64, Arc<ExecutionPlan>>>,
}

impl PlanCache {
    pub fn new(capacity: NonZeroUsize) -> Self {
        Self {
            inner: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub fn get(&self, key: u64) -> Option<Arc<ExecutionPlan>> {
        self.inner.lock().get(&key).cloned()
    }

    pub fn insert(&self, key: u64, plan: Arc<ExecutionPlan>) {
        self.inner.lock().put(key, plan);
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::OperationKind;

    fn plan(root: &str) -> Arc<ExecutionPlan> {
        Arc::new(ExecutionPlan {
            kind: OperationKind::Query,
            root_type: root.to_string(),
            fetches: vec![],
            local_fields: vec![],
            response_keys: vec![],
        })
    }

    #[test]
    fn test_evicts_least_recently_used() {
        let cache = PlanCache::new(NonZeroUsize::new(2).unwrap());
        cache.insert(1, plan("a"));
        cache.insert(2, plan("b"));
        assert!(cache.get(1).is_some());
        cache.insert(3, plan("c"));

        assert_eq!(cache.len(), 2);
        assert!(cache.get(2).is_none());
        assert_eq!(cache.get(1).unwrap().root_type, "a");
        assert_eq!(cache.get(3).unwrap().root_type, "c");
    }
}
