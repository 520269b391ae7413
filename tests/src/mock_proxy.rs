//! mock_proxy - an enrichment proxy that remembers which URLs it was given

use anyhow::{Result, bail};
use async_trait::async_trait;
use pipelined::EnrichmentProxy;
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

#[derive(Default)]
pub struct MockProxy {
    // URLs per UE address and rule.
    urls: Mutex<HashMap<Ipv4Addr, HashMap<String, Vec<String>>>>,
    refusing: AtomicBool,
}

impl MockProxy {
    pub fn new() -> Self {
        Self::default()
    }

    /// While refusing, URL activations fail.
    pub fn set_refusing(&self, refusing: bool) {
        self.refusing.store(refusing, Ordering::SeqCst);
    }

    pub fn urls(&self, ue_ip: Ipv4Addr, rule_id: &str) -> Option<Vec<String>> {
        self.urls
            .lock()
            .unwrap()
            .get(&ue_ip)
            .and_then(|rules| rules.get(rule_id).cloned())
    }

    pub fn is_enriching(&self, ue_ip: Ipv4Addr) -> bool {
        self.urls.lock().unwrap().contains_key(&ue_ip)
    }
}

#[async_trait]
impl EnrichmentProxy for MockProxy {
    async fn activate_urls(
        &self,
        ue_ip: Ipv4Addr,
        rule_id: &str,
        urls: &[String],
        _subscriber_id: &str,
        _msisdn: Option<&str>,
    ) -> Result<()> {
        if self.refusing.load(Ordering::SeqCst) {
            bail!("Proxy refusing");
        }
        self.urls
            .lock()
            .unwrap()
            .entry(ue_ip)
            .or_default()
            .insert(rule_id.to_string(), urls.to_vec());
        Ok(())
    }

    async fn deactivate_urls(&self, ue_ip: Ipv4Addr, rule_id: Option<&str>) -> Result<()> {
        let mut urls = self.urls.lock().unwrap();
        match rule_id {
            Some(rule_id) => {
                if let Some(rules) = urls.get_mut(&ue_ip) {
                    rules.remove(rule_id);
                    if rules.is_empty() {
                        urls.remove(&ue_ip);
                    }
                }
            }
            None => {
                urls.remove(&ue_ip);
            }
        }
        Ok(())
    }
}
