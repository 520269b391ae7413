//! enforcement_stats - usage accounting for policy rules
//!
//! Every rule of a subscriber gets one counting flow per direction, matching the rule number
//! and version that the enforcement tables loaded into the registers.  A poll reads the
//! counters back, reports the change since the previous poll, and deletes the flows of rule
//! versions that are no longer current.

use crate::data::{
    ActivateFlowsRequest, ControllerContext, FlowAction, PolicyResult, RuleRecord,
    RuleRecordTable, UsageKey, UsageReporter, VersionedPolicy, decode_imsi, encode_imsi,
};
use crate::datapath::FlowProgrammer;
use crate::datapath::registers::*;
use crate::tables::{RuleIdRegistry, RuleVersionTracker, VersionKey};
use anyhow::{Result, bail};
use async_std::sync::Mutex;
use async_std::task;
use openflow::{Action, FieldKind, FlowMatch, FlowMod, FlowStats, FlowStatsRequest, TableId};
use slog::{Logger, debug, info, warn};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use stop_token::StopToken;
use stop_token::prelude::*;

pub const DEFAULT_DROP_COOKIE: u64 = 0xffff_ffff_ffff_fffe;
pub const DEFAULT_DROP_RULE_ID: &str = "internal_default_drop_flow_rule";

// Downlink byte counters include the Ethernet header that the GTP decapsulation adds.
const ETH_HEADER_LEN: u64 = 14;

const TABLE_MISS_PRIORITY: u16 = 0;
const DEFAULT_DROP_PRIORITY: u16 = 1;
const RULE_PRIORITY: u16 = 10;
const RULE_DROP_PRIORITY: u16 = 11;
const PASSTHROUGH_PRIORITY: u16 = 20;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct Counters {
    bytes_tx: u64,
    bytes_rx: u64,
    dropped_tx: u64,
    dropped_rx: u64,
}

impl Counters {
    fn add(&mut self, other: &Counters) {
        self.bytes_tx += other.bytes_tx;
        self.bytes_rx += other.bytes_rx;
        self.dropped_tx += other.dropped_tx;
        self.dropped_rx += other.dropped_rx;
    }

    fn saturating_sub(&self, other: &Counters) -> Counters {
        Counters {
            bytes_tx: self.bytes_tx.saturating_sub(other.bytes_tx),
            bytes_rx: self.bytes_rx.saturating_sub(other.bytes_rx),
            dropped_tx: self.dropped_tx.saturating_sub(other.dropped_tx),
            dropped_rx: self.dropped_rx.saturating_sub(other.dropped_rx),
        }
    }

    fn any_below(&self, other: &Counters) -> bool {
        self.bytes_tx < other.bytes_tx
            || self.bytes_rx < other.bytes_rx
            || self.dropped_tx < other.dropped_tx
            || self.dropped_rx < other.dropped_rx
    }

    fn record(&self, key: &UsageKey, rule_version: u32) -> RuleRecord {
        RuleRecord {
            subscriber_id: key.subscriber_id.clone(),
            rule_id: key.rule_id.clone(),
            teid: key.teid,
            rule_version,
            bytes_rx: self.bytes_rx,
            bytes_tx: self.bytes_tx,
            dropped_rx: self.dropped_rx,
            dropped_tx: self.dropped_tx,
        }
    }

    fn from_record(r: &RuleRecord) -> Self {
        Counters {
            bytes_tx: r.bytes_tx,
            bytes_rx: r.bytes_rx,
            dropped_tx: r.dropped_tx,
            dropped_rx: r.dropped_rx,
        }
    }
}

/// One counting flow, attributed.
struct FlowUsage {
    key: UsageKey,
    version: u32,
    counters: Counters,
    is_default_drop: bool,
    stat: FlowStats,
}

#[derive(Default)]
struct StatsState {
    // Raw counters per key at the previous poll.
    last_usage: HashMap<UsageKey, Counters>,
    // Usage of reports that did not get through.
    failed_usage: BTreeMap<UsageKey, RuleRecord>,
}

#[derive(Clone)]
pub struct EnforcementStats {
    flows: FlowProgrammer,
    table: TableId,
    next_table: TableId,
    versions: RuleVersionTracker,
    rule_ids: RuleIdRegistry,
    reporter: Arc<dyn UsageReporter>,
    context: Arc<ControllerContext>,
    reply_timeout: Duration,
    poll_interval: Duration,
    state: Arc<Mutex<StatsState>>,
    logger: Logger,
}

impl EnforcementStats {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        flows: FlowProgrammer,
        table: TableId,
        next_table: TableId,
        versions: RuleVersionTracker,
        rule_ids: RuleIdRegistry,
        reporter: Arc<dyn UsageReporter>,
        context: Arc<ControllerContext>,
        reply_timeout: Duration,
        poll_interval: Duration,
        logger: &Logger,
    ) -> Self {
        EnforcementStats {
            flows,
            table,
            next_table,
            versions,
            rule_ids,
            reporter,
            context,
            reply_timeout,
            poll_interval,
            state: Arc::new(Mutex::new(StatsState::default())),
            logger: logger.clone(),
        }
    }

    pub async fn install_default_flows(&self) -> Result<()> {
        let forward = vec![Action::GotoTable(self.next_table)];
        self.flows
            .add_flows(vec![
                FlowMod::add(
                    self.table,
                    TABLE_MISS_PRIORITY,
                    0,
                    FlowMatch::new(),
                    forward.clone(),
                ),
                // Pass-through traffic is forwarded but never billed.
                FlowMod::add(
                    self.table,
                    PASSTHROUGH_PRIORITY,
                    0,
                    FlowMatch::new().with_reg(PASSTHROUGH_REG, PASSTHROUGH_FLAG),
                    forward,
                ),
            ])
            .await
    }

    /// Install the counting flows of each policy, plus the subscriber's default drop.  Must
    /// run before the matching enforcement flows are installed.
    pub async fn activate_rules(&self, request: &ActivateFlowsRequest) -> Vec<PolicyResult> {
        let imsi = match encode_imsi(&request.subscriber_id) {
            Ok(imsi) => imsi,
            Err(e) => {
                warn!(self.logger, "Cannot install stats flows - {e}");
                return request.policies.iter().map(PolicyResult::failure).collect();
            }
        };
        let teid = request.uplink_tunnel;
        if let Err(e) = self
            .flows
            .add_flows(self.default_drop_flows(imsi, teid))
            .await
        {
            warn!(
                self.logger,
                "Failed to install default drop for {} - {e}", request.subscriber_id
            );
        }

        let mut results = vec![];
        for policy in request.policies.iter() {
            let rule_num = self.rule_ids.get_or_create(&policy.rule.id).await;
            let flow_mods = self.rule_flows(imsi, teid, rule_num, policy);
            let success = match self.flows.add_flows(flow_mods).await {
                Ok(()) => true,
                Err(e) => {
                    warn!(
                        self.logger,
                        "Failed to install stats flows of rule {} for {} - {e}",
                        policy.rule.id,
                        request.subscriber_id
                    );
                    false
                }
            };
            results.push(PolicyResult::new(&policy.rule.id, policy.version, success));
        }
        results
    }

    fn rule_flows(&self, imsi: u64, teid: u32, rule_num: u32, policy: &VersionedPolicy) -> Vec<FlowMod> {
        let rule = &policy.rule;
        let drops = rule.is_redirect() || rule.flow_list.iter().any(|f| f.action == FlowAction::Deny);
        let mut flow_mods = vec![];
        for direction in Direction::both() {
            let flow_match = tunnel_match(imsi, direction, teid)
                .with_reg(RULE_NUM_REG, rule_num)
                .with_reg(RULE_VERSION_REG, policy.version);
            if drops {
                flow_mods.push(FlowMod::add(
                    self.table,
                    RULE_DROP_PRIORITY,
                    rule_num as u64,
                    flow_match.clone().with_reg(DROP_REG, DROP_FLAG),
                    vec![],
                ));
            }
            flow_mods.push(FlowMod::add(
                self.table,
                RULE_PRIORITY,
                rule_num as u64,
                flow_match,
                vec![Action::GotoTable(self.next_table)],
            ));
        }
        flow_mods
    }

    fn default_drop_flows(&self, imsi: u64, teid: u32) -> Vec<FlowMod> {
        Direction::both()
            .into_iter()
            .map(|direction| {
                FlowMod::add(
                    self.table,
                    DEFAULT_DROP_PRIORITY,
                    DEFAULT_DROP_COOKIE,
                    tunnel_match(imsi, direction, teid),
                    vec![],
                )
            })
            .collect()
    }

    /// Counting flows of deactivated rules are left for the stale sweep of the next poll, so
    /// that their last usage still gets reported.  Only the tunnel's default drop goes now,
    /// if asked.
    pub async fn deactivate_rules(
        &self,
        subscriber_id: &str,
        teid: u32,
        remove_default_drop: bool,
    ) -> Result<()> {
        if !remove_default_drop {
            return Ok(());
        }
        let imsi = encode_imsi(subscriber_id)?;
        self.flows
            .delete_flows(self.table, tunnel_scope(imsi, teid), Some(DEFAULT_DROP_COOKIE))
            .await
    }

    /// Replace the table contents with the flows of the given rules.  Counters restart from
    /// zero so the baseline goes, but unreported usage is kept.  The results come back per
    /// request, in request order.
    pub async fn handle_restart(&self, requests: &[ActivateFlowsRequest]) -> Vec<Vec<PolicyResult>> {
        let mut state = self.state.lock().await;
        state.last_usage.clear();
        let cleared = match self.flows.delete_all_flows_in_table(self.table).await {
            Ok(()) => self.install_default_flows().await,
            Err(e) => Err(e),
        };
        drop(state);
        if let Err(e) = cleared {
            warn!(self.logger, "Failed to clear stats table - {e}");
            return requests
                .iter()
                .map(|r| r.policies.iter().map(PolicyResult::failure).collect())
                .collect();
        }
        let mut results = vec![];
        for request in requests.iter() {
            results.push(self.activate_rules(request).await);
        }
        results
    }

    pub fn spawn_poller(&self, stop_token: StopToken) {
        let stats = self.clone();
        task::spawn(async move {
            while task::sleep(stats.poll_interval)
                .timeout_at(stop_token.clone())
                .await
                .is_ok()
            {
                if !stats.flows.is_connected() {
                    continue;
                }
                if let Err(e) = stats.poll_once().await {
                    warn!(stats.logger, "Stats poll failed - {e}");
                }
            }
            info!(stats.logger, "Stats poller stopped");
        });
    }

    /// One poll cycle: query, attribute, compute deltas, report (with any backlog), sweep
    /// stale flows.
    pub async fn poll_once(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        let stats = self
            .flows
            .query_flows(FlowStatsRequest::table(self.table), self.reply_timeout)
            .await?;
        let usage = self.attribute(stats)?;

        let mut current: BTreeMap<UsageKey, (Counters, u32)> = BTreeMap::new();
        for u in usage.iter() {
            let entry = current.entry(u.key.clone()).or_default();
            entry.0.add(&u.counters);
            entry.1 = entry.1.max(u.version);
        }

        let mut delta: BTreeMap<UsageKey, RuleRecord> = BTreeMap::new();
        for (key, (counters, version)) in current.iter() {
            let previous = state.last_usage.get(key).copied().unwrap_or_default();
            // A counter that went backwards is rebaselined on its own: it contributes
            // nothing this time and counts up from its new value.
            if counters.any_below(&previous) {
                warn!(
                    self.logger,
                    "Counters of {} {} went backwards, rebaselining", key.subscriber_id, key.rule_id
                );
            }
            let change = counters.saturating_sub(&previous);
            delta.insert(key.clone(), change.record(key, *version));
        }
        state.last_usage = current.iter().map(|(k, (c, _))| (k.clone(), *c)).collect();

        for (key, failed) in std::mem::take(&mut state.failed_usage) {
            match delta.get_mut(&key) {
                Some(record) => {
                    let mut merged = Counters::from_record(record);
                    merged.add(&Counters::from_record(&failed));
                    let version = record.rule_version.max(failed.rule_version);
                    *record = merged.record(&key, version);
                }
                None => {
                    delta.insert(key, failed);
                }
            }
        }

        let table = RuleRecordTable {
            records: delta.values().cloned().collect(),
            epoch: self.context.epoch(),
        };
        debug!(self.logger, "Reporting usage of {} rules", table.records.len());
        if let Err(e) = self.reporter.report_rule_stats(table).await {
            warn!(
                self.logger,
                "Usage report failed, keeping {} records for the next poll - {e}",
                delta.len()
            );
            state.failed_usage = delta;
        }

        self.sweep_stale(&mut state, usage).await;
        Ok(())
    }

    /// Delete the flows of versions that are no longer current.  A failed delete is retried
    /// by the next poll.  Rules retired by a deactivate-all are forgotten once none of their
    /// flows are left.
    async fn sweep_stale(&self, state: &mut StatsState, usage: Vec<FlowUsage>) {
        let mut remaining = HashSet::new();
        for u in usage.into_iter() {
            if u.is_default_drop {
                continue;
            }
            let key = VersionKey::new(&u.key.subscriber_id, u.key.teid, &u.key.rule_id);
            let current =
                self.versions
                    .get_version(&u.key.subscriber_id, u.key.teid, &u.key.rule_id);
            if current == u.version {
                remaining.insert(key);
                continue;
            }
            debug!(
                self.logger,
                "Deleting stale flow of {} {} v{} (current v{current})",
                u.key.subscriber_id,
                u.key.rule_id,
                u.version
            );
            match self
                .flows
                .delete_flow_strict(self.table, u.stat.priority, u.stat.cookie, u.stat.flow_match)
                .await
            {
                Ok(()) => {
                    // The flow's usage has been reported.  Take it out of the baseline so
                    // that its disappearance does not look like a counter reset.
                    if let Some(baseline) = state.last_usage.get_mut(&u.key) {
                        *baseline = baseline.saturating_sub(&u.counters);
                    }
                }
                Err(e) => {
                    warn!(
                        self.logger,
                        "Failed to delete stale flow of {} {} - {e}", u.key.subscriber_id, u.key.rule_id
                    );
                    remaining.insert(key);
                }
            }
        }
        let forgotten = self.versions.forget_retired(&remaining);
        if forgotten > 0 {
            debug!(self.logger, "Forgot {forgotten} retired rule versions");
        }
    }

    /// Cumulative usage per rule, read from the switch now.
    pub async fn get_policy_usage(&self) -> Result<RuleRecordTable> {
        let stats = self
            .flows
            .query_flows(FlowStatsRequest::table(self.table), self.reply_timeout)
            .await?;
        let mut current: BTreeMap<UsageKey, (Counters, u32)> = BTreeMap::new();
        for u in self.attribute(stats)? {
            let entry = current.entry(u.key).or_default();
            entry.0.add(&u.counters);
            entry.1 = entry.1.max(u.version);
        }
        Ok(RuleRecordTable {
            records: current
                .iter()
                .map(|(key, (counters, version))| counters.record(key, *version))
                .collect(),
            epoch: self.context.epoch(),
        })
    }

    /// Work out which subscriber, rule and tunnel each flow counts for.  Table defaults and
    /// pass-through flows count for nobody.
    fn attribute(&self, stats: Vec<FlowStats>) -> Result<Vec<FlowUsage>> {
        let mut usage = vec![];
        for stat in stats.into_iter() {
            if stat.table != self.table {
                bail!("Flow stats reply for table {} in the query of table {}", stat.table, self.table);
            }
            if stat.cookie == 0 || stat.flow_match.reg(PASSTHROUGH_REG) == Some(PASSTHROUGH_FLAG) {
                continue;
            }
            let Some(imsi) = stat.flow_match.get_int(FieldKind::Metadata) else {
                bail!("Flow with cookie {:#x} has no subscriber", stat.cookie);
            };
            let Some(direction) = stat.flow_match.reg(DIRECTION_REG).and_then(Direction::from_reg)
            else {
                bail!("Flow with cookie {:#x} has no direction", stat.cookie);
            };
            let is_default_drop = stat.cookie == DEFAULT_DROP_COOKIE;
            let rule_id = if is_default_drop {
                DEFAULT_DROP_RULE_ID.to_string()
            } else {
                match self.rule_ids.get_rule_id(stat.cookie as u32) {
                    Some(rule_id) => rule_id,
                    None => {
                        warn!(self.logger, "Flow with unknown rule cookie {:#x}", stat.cookie);
                        continue;
                    }
                }
            };

            let bytes = match direction {
                Direction::Out => stat.byte_count,
                Direction::In => stat
                    .byte_count
                    .saturating_sub(ETH_HEADER_LEN * stat.packet_count),
            };
            let mut counters = Counters::default();
            match (stat.is_drop(), direction) {
                (false, Direction::Out) => counters.bytes_tx = bytes,
                (false, Direction::In) => counters.bytes_rx = bytes,
                (true, Direction::Out) => counters.dropped_tx = bytes,
                (true, Direction::In) => counters.dropped_rx = bytes,
            }

            usage.push(FlowUsage {
                key: UsageKey {
                    subscriber_id: decode_imsi(imsi),
                    rule_id,
                    teid: stat.flow_match.reg(TEID_REG).unwrap_or(0),
                },
                version: stat.flow_match.reg(RULE_VERSION_REG).unwrap_or(0),
                counters,
                is_default_drop,
                stat,
            });
        }
        Ok(usage)
    }
}
