use super::RuleId;
use anyhow::Result;
use async_trait::async_trait;
use slog::{Logger, info};

/// Usage is attributed per subscriber, rule and tunnel.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UsageKey {
    pub subscriber_id: String,
    pub rule_id: RuleId,
    pub teid: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleRecord {
    pub subscriber_id: String,
    pub rule_id: RuleId,
    pub teid: u32,
    pub rule_version: u32,
    pub bytes_rx: u64,
    pub bytes_tx: u64,
    pub dropped_rx: u64,
    pub dropped_tx: u64,
}

impl RuleRecord {
    pub fn key(&self) -> UsageKey {
        UsageKey {
            subscriber_id: self.subscriber_id.clone(),
            rule_id: self.rule_id.clone(),
            teid: self.teid,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuleRecordTable {
    pub records: Vec<RuleRecord>,
    pub epoch: u64,
}

impl RuleRecordTable {
    pub fn find(&self, subscriber_id: &str, rule_id: &str) -> Option<&RuleRecord> {
        self.records
            .iter()
            .find(|r| r.subscriber_id == subscriber_id && r.rule_id == rule_id)
    }
}

/// The upstream usage collector.  A failed report is retried by the stats engine.
#[async_trait]
pub trait UsageReporter: Send + Sync + 'static {
    async fn report_rule_stats(&self, table: RuleRecordTable) -> Result<()>;
}

/// Reporter for standalone operation: writes usage to the log.
pub struct LogReporter {
    logger: Logger,
}

impl LogReporter {
    pub fn new(logger: &Logger) -> Self {
        LogReporter {
            logger: logger.clone(),
        }
    }
}

#[async_trait]
impl UsageReporter for LogReporter {
    async fn report_rule_stats(&self, table: RuleRecordTable) -> Result<()> {
        for r in table.records.iter() {
            info!(
                self.logger,
                "Usage {} {} teid={:#x} v{} tx={} rx={} dropped tx={} rx={}",
                r.subscriber_id,
                r.rule_id,
                r.teid,
                r.rule_version,
                r.bytes_tx,
                r.bytes_rx,
                r.dropped_tx,
                r.dropped_rx
            );
        }
        Ok(())
    }
}
