//! mock_collector - stands in for the upstream usage collector

use anyhow::{Result, bail};
use async_std::sync::Mutex;
use async_trait::async_trait;
use pipelined::{RuleRecord, RuleRecordTable, UsageReporter};
use std::sync::atomic::{AtomicBool, Ordering};

#[derive(Default)]
pub struct MockCollector {
    reports: Mutex<Vec<RuleRecordTable>>,
    failing: AtomicBool,
}

impl MockCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// While failing, every report is refused and not recorded.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub async fn report_count(&self) -> usize {
        self.reports.lock().await.len()
    }

    pub async fn last_report(&self) -> Option<RuleRecordTable> {
        self.reports.lock().await.last().cloned()
    }

    /// The record for a subscriber's rule in the most recent report.
    pub async fn last_record(&self, subscriber_id: &str, rule_id: &str) -> Option<RuleRecord> {
        self.last_report()
            .await
            .and_then(|t| t.find(subscriber_id, rule_id).cloned())
    }

    /// The record for a rule on one of the subscriber's tunnels in the most recent report.
    pub async fn last_tunnel_record(
        &self,
        subscriber_id: &str,
        rule_id: &str,
        teid: u32,
    ) -> Option<RuleRecord> {
        self.last_report().await.and_then(|t| {
            t.records
                .into_iter()
                .find(|r| r.subscriber_id == subscriber_id && r.rule_id == rule_id && r.teid == teid)
        })
    }
}

#[async_trait]
impl UsageReporter for MockCollector {
    async fn report_rule_stats(&self, table: RuleRecordTable) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            bail!("Collector unavailable");
        }
        self.reports.lock().await.push(table);
        Ok(())
    }
}
