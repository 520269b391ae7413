use crate::data::{MemoryStore, RuleId, Store};
use async_std::sync::Mutex;
use dashmap::DashMap;
use index_pool::IndexPool;
use std::sync::Arc;

/// Maps rule ids to the dense numbers that are used as flow cookies and loaded into the
/// rule-number register.  Number 0 is never handed out: an unset register reads as 0.
#[derive(Clone)]
pub struct RuleIdRegistry {
    store: Arc<dyn Store<RuleId, u32>>,
    reverse: Arc<DashMap<u32, RuleId>>,
    index_pool: Arc<Mutex<IndexPool>>,
}

impl RuleIdRegistry {
    /// Rebuild the registry from whatever the store already holds.
    pub fn new(store: Arc<dyn Store<RuleId, u32>>) -> Self {
        let mut index_pool = IndexPool::new();
        let _ = index_pool.request_id(0);
        let reverse = DashMap::new();
        for (rule_id, num) in store.entries() {
            let _ = index_pool.request_id(num as usize);
            reverse.insert(num, rule_id);
        }
        RuleIdRegistry {
            store,
            reverse: Arc::new(reverse),
            index_pool: Arc::new(Mutex::new(index_pool)),
        }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryStore::new()))
    }

    pub async fn get_or_create(&self, rule_id: &str) -> u32 {
        if let Some(num) = self.store.get(&rule_id.to_string()) {
            return num;
        }
        let mut index_pool = self.index_pool.lock().await;
        // Another task may have won the race while we waited for the pool.
        if let Some(num) = self.store.get(&rule_id.to_string()) {
            return num;
        }
        let num = index_pool.new_id() as u32;
        self.store.upsert(rule_id.to_string(), &mut |_| num);
        self.reverse.insert(num, rule_id.to_string());
        num
    }

    pub fn get_num(&self, rule_id: &str) -> Option<u32> {
        self.store.get(&rule_id.to_string())
    }

    pub fn get_rule_id(&self, num: u32) -> Option<RuleId> {
        self.reverse.get(&num).map(|r| r.clone())
    }
}
