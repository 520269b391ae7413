use crate::data::{MemoryStore, RuleId, Store};
use dashmap::DashMap;
use std::collections::HashSet;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct VersionKey {
    pub subscriber_id: String,
    pub teid: u32,
    pub rule_id: RuleId,
}

impl VersionKey {
    pub fn new(subscriber_id: &str, teid: u32, rule_id: &str) -> Self {
        VersionKey {
            subscriber_id: subscriber_id.to_string(),
            teid,
            rule_id: rule_id.to_string(),
        }
    }
}

/// The accepted version of every installed rule.  A flow carrying any other version is
/// stale.
#[derive(Clone)]
pub struct RuleVersionTracker {
    store: Arc<dyn Store<VersionKey, u32>>,
    // Rules bumped by a deactivate-all, with the bumped version.  Forgotten once their
    // flows have been swept.
    retired: Arc<DashMap<VersionKey, u32>>,
}

impl RuleVersionTracker {
    pub fn new(store: Arc<dyn Store<VersionKey, u32>>) -> Self {
        RuleVersionTracker {
            store,
            retired: Arc::new(DashMap::new()),
        }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryStore::new()))
    }

    /// Record `version` for the rule.  Versions never go backwards, so the version in
    /// force afterwards is returned.
    pub fn save_version(&self, subscriber_id: &str, teid: u32, rule_id: &str, version: u32) -> u32 {
        let key = VersionKey::new(subscriber_id, teid, rule_id);
        self.retired.remove(&key);
        self.store
            .upsert(key, &mut |current| current.map_or(version, |c| (*c).max(version)))
    }

    /// 0 if the rule is not tracked.
    pub fn get_version(&self, subscriber_id: &str, teid: u32, rule_id: &str) -> u32 {
        self.store
            .get(&VersionKey::new(subscriber_id, teid, rule_id))
            .unwrap_or(0)
    }

    /// Forget the rule, unless it has moved on to a different version in the meantime.
    pub fn remove(&self, subscriber_id: &str, teid: u32, rule_id: &str, version: u32) -> bool {
        self.store
            .remove_if(
                &VersionKey::new(subscriber_id, teid, rule_id),
                &|current| *current == version,
            )
            .is_some()
    }

    /// Bump every rule of the subscriber so that all of its installed flows become stale.
    /// Returns the rules that were bumped.
    pub fn update_all_for_subscriber(&self, subscriber_id: &str, teid: u32) -> Vec<RuleId> {
        let mut bumped = vec![];
        for (key, _) in self.store.entries() {
            if key.subscriber_id == subscriber_id && key.teid == teid {
                let version = self
                    .store
                    .upsert(key.clone(), &mut |current| current.map_or(1, |c| c + 1));
                bumped.push(key.rule_id.clone());
                self.retired.insert(key, version);
            }
        }
        bumped
    }

    /// Drop the retired rules that have no flows in `remaining`, unless they were activated
    /// again since.  Returns how many were dropped.
    pub fn forget_retired(&self, remaining: &HashSet<VersionKey>) -> usize {
        let done: Vec<(VersionKey, u32)> = self
            .retired
            .iter()
            .filter(|e| !remaining.contains(e.key()))
            .map(|e| (e.key().clone(), *e.value()))
            .collect();
        let mut forgotten = 0;
        for (key, version) in done.into_iter() {
            if self.retired.remove_if(&key, |_, v| *v == version).is_some()
                && self.store.remove_if(&key, &|current| *current == version).is_some()
            {
                forgotten += 1;
            }
        }
        forgotten
    }

    pub fn rules_for_subscriber(&self, subscriber_id: &str, teid: u32) -> Vec<(RuleId, u32)> {
        self.store
            .entries()
            .into_iter()
            .filter(|(k, _)| k.subscriber_id == subscriber_id && k.teid == teid)
            .map(|(k, v)| (k.rule_id, v))
            .collect()
    }
}
