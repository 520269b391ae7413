//! header_enrichment - send a subscriber's plain HTTP through the enrichment proxy
//!
//! Each uplink permit flow of a rule that carries enrichment URLs gets two flows here.  One
//! sends the subscriber's HTTP requests out of the proxy port.  The other picks the enriched
//! requests up again when the proxy hands them back, restores the subscriber tags and lets
//! them carry on to enforcement.  The proxy is told which URLs to enrich for each UE address.

use crate::data::{ActivateFlowsRequest, FlowAction, FlowDirection, PolicyRule, RuleId};
use crate::datapath::FlowProgrammer;
use crate::datapath::registers::*;
use anyhow::Result;
use async_trait::async_trait;
use dashmap::DashMap;
use ipnetwork::Ipv4Network;
use openflow::{Action, FieldKind, FieldValue, FlowMatch, FlowMod, TableId};
use slog::{Logger, info, warn};
use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::sync::Arc;

const HE_PRIORITY: u16 = 10;
const HTTP_PORT: u64 = 80;

/// The HTTP proxy that inserts the enrichment headers.
#[async_trait]
pub trait EnrichmentProxy: Send + Sync + 'static {
    async fn activate_urls(
        &self,
        ue_ip: Ipv4Addr,
        rule_id: &str,
        urls: &[String],
        subscriber_id: &str,
        msisdn: Option<&str>,
    ) -> Result<()>;

    /// Stop enriching for the UE, either for one rule or altogether.
    async fn deactivate_urls(&self, ue_ip: Ipv4Addr, rule_id: Option<&str>) -> Result<()>;
}

/// Proxy for standalone operation: writes the URL updates to the log.
pub struct LogProxy {
    logger: Logger,
}

impl LogProxy {
    pub fn new(logger: &Logger) -> Self {
        LogProxy {
            logger: logger.clone(),
        }
    }
}

#[async_trait]
impl EnrichmentProxy for LogProxy {
    async fn activate_urls(
        &self,
        ue_ip: Ipv4Addr,
        rule_id: &str,
        urls: &[String],
        subscriber_id: &str,
        _msisdn: Option<&str>,
    ) -> Result<()> {
        info!(
            self.logger,
            "Enrich {urls:?} for {subscriber_id} ue {ue_ip} rule {rule_id}"
        );
        Ok(())
    }

    async fn deactivate_urls(&self, ue_ip: Ipv4Addr, rule_id: Option<&str>) -> Result<()> {
        info!(self.logger, "Stop enriching for ue {ue_ip} rule {rule_id:?}");
        Ok(())
    }
}

#[derive(Clone)]
pub struct HeController {
    flows: FlowProgrammer,
    table: TableId,
    next_table: TableId,
    proxy_port: u32,
    proxy: Arc<dyn EnrichmentProxy>,
    // Rules with enrichment flows, per UE address.
    ue_rules: Arc<DashMap<Ipv4Addr, HashSet<RuleId>>>,
    logger: Logger,
}

impl HeController {
    pub fn new(
        flows: FlowProgrammer,
        table: TableId,
        next_table: TableId,
        proxy_port: u32,
        proxy: Arc<dyn EnrichmentProxy>,
        logger: &Logger,
    ) -> Self {
        HeController {
            flows,
            table,
            next_table,
            proxy_port,
            proxy,
            ue_rules: Arc::new(DashMap::new()),
            logger: logger.clone(),
        }
    }

    pub async fn install_default_flows(&self) -> Result<()> {
        self.flows
            .add_flows(vec![FlowMod::add(
                self.table,
                0,
                0,
                FlowMatch::new(),
                vec![Action::GotoTable(self.next_table)],
            )])
            .await
    }

    /// Number of rules the UE has enrichment flows for.
    pub fn rule_count(&self, ue_ip: Ipv4Addr) -> usize {
        self.ue_rules.get(&ue_ip).map_or(0, |rules| rules.len())
    }

    /// Divert the rule's HTTP traffic through the proxy.  Does nothing for a rule without
    /// URLs or without uplink permit flows.  If the proxy refuses the URLs, the rule's traffic
    /// goes unenriched.
    pub async fn add_rule(
        &self,
        request: &ActivateFlowsRequest,
        imsi: u64,
        rule: &PolicyRule,
        rule_num: u32,
    ) -> Result<()> {
        let Some(urls) = rule.he.as_ref().map(|he| &he.urls).filter(|urls| !urls.is_empty())
        else {
            return Ok(());
        };
        let Some(ue_ip) = request.ip_addr else {
            return Ok(());
        };
        let servers = uplink_servers(rule);
        if servers.is_empty() {
            return Ok(());
        }
        if let Err(e) = self
            .proxy
            .activate_urls(
                ue_ip,
                &rule.id,
                urls,
                &request.subscriber_id,
                request.msisdn.as_deref(),
            )
            .await
        {
            warn!(
                self.logger,
                "Proxy refused URLs of rule {} for {ue_ip} - {e}", rule.id
            );
            return Ok(());
        }

        info!(
            self.logger,
            "Enriching rule {} of {} ue {ue_ip}", rule.id, request.subscriber_id
        );
        let cookie = rule_num as u64;
        let mut flow_mods = vec![];
        for server in servers {
            let to_proxy = http_match(
                tunnel_match(imsi, Direction::Out, request.uplink_tunnel),
                ue_ip,
                server,
            );
            flow_mods.push(FlowMod::add(
                self.table,
                HE_PRIORITY,
                cookie,
                to_proxy,
                vec![Action::Output(self.proxy_port)],
            ));

            let from_proxy = http_match(
                FlowMatch::new().with_int(FieldKind::InPort, self.proxy_port as u64),
                ue_ip,
                server,
            );
            let mut actions = subscriber_tags(imsi, Direction::Out, request.uplink_tunnel);
            actions.push(Action::GotoTable(self.next_table));
            flow_mods.push(FlowMod::add(
                self.table,
                HE_PRIORITY,
                cookie,
                from_proxy,
                actions,
            ));
        }
        self.flows.add_flows(flow_mods).await?;
        self.ue_rules
            .entry(ue_ip)
            .or_default()
            .insert(rule.id.clone());
        Ok(())
    }

    /// Remove the enrichment flows of one rule of the UE.  Unknown rules are ignored.
    pub async fn remove_rule(&self, ue_ip: Ipv4Addr, rule_id: &str, rule_num: u32) -> Result<()> {
        let removed = self
            .ue_rules
            .get_mut(&ue_ip)
            .is_some_and(|mut rules| rules.remove(rule_id));
        if !removed {
            return Ok(());
        }
        self.ue_rules.remove_if(&ue_ip, |_, rules| rules.is_empty());
        info!(self.logger, "Stop enriching rule {rule_id} of ue {ue_ip}");
        self.flows
            .delete_flows(self.table, ue_scope(ue_ip), Some(rule_num as u64))
            .await?;
        if let Err(e) = self.proxy.deactivate_urls(ue_ip, Some(rule_id)).await {
            warn!(self.logger, "Proxy failed to drop rule {rule_id} of {ue_ip} - {e}");
        }
        Ok(())
    }

    /// Remove every enrichment flow of the UE.
    pub async fn remove_ue(&self, ue_ip: Ipv4Addr) -> Result<()> {
        if self.ue_rules.remove(&ue_ip).is_none() {
            return Ok(());
        }
        info!(self.logger, "Stop enriching for ue {ue_ip}");
        self.flows
            .delete_flows(self.table, ue_scope(ue_ip), None)
            .await?;
        if let Err(e) = self.proxy.deactivate_urls(ue_ip, None).await {
            warn!(self.logger, "Proxy failed to drop {ue_ip} - {e}");
        }
        Ok(())
    }

    pub async fn clear(&self) -> Result<()> {
        self.ue_rules.clear();
        self.flows.delete_all_flows_in_table(self.table).await?;
        self.install_default_flows().await
    }
}

/// Servers of the rule's uplink permit flows.  `None` stands for any server.  IPv6 servers
/// are left out.
fn uplink_servers(rule: &PolicyRule) -> Vec<Option<Ipv4Network>> {
    rule.flow_list
        .iter()
        .filter(|f| {
            f.action == FlowAction::Permit && f.flow_match.direction == FlowDirection::Uplink
        })
        .filter_map(|f| match f.flow_match.ip_dst.as_deref() {
            None => Some(None),
            Some(dst) => dst.parse::<Ipv4Network>().ok().map(Some),
        })
        .collect()
}

fn http_match(flow_match: FlowMatch, ue_ip: Ipv4Addr, server: Option<Ipv4Network>) -> FlowMatch {
    let mut flow_match = flow_match
        .with_int(FieldKind::EthType, ETH_TYPE_IPV4)
        .with(FieldKind::Ipv4Src, FieldValue::host_v4(ue_ip))
        .with_int(FieldKind::IpProto, IP_PROTO_TCP as u64)
        .with_int(FieldKind::TcpDst, HTTP_PORT);
    if let Some(server) = server {
        flow_match.set(FieldKind::Ipv4Dst, FieldValue::Ipv4(server));
    }
    flow_match
}

fn ue_scope(ue_ip: Ipv4Addr) -> FlowMatch {
    FlowMatch::new()
        .with_int(FieldKind::EthType, ETH_TYPE_IPV4)
        .with(FieldKind::Ipv4Src, FieldValue::host_v4(ue_ip))
}
