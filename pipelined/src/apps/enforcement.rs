//! enforcement - per-subscriber policy rule flows
//!
//! The same controller runs twice: once for Gx rules in the `enforcement` table, and once for
//! Gy (online charging) rules in the `gy` table.  A rule flow tags the packet with the rule
//! number and version, and the drop flag for a deny, then hands it to the stats table, which
//! does the counting and dropping.  The Gx instance also hands rules with enrichment URLs to
//! header enrichment.

use super::header_enrichment::HeController;
use super::qos::QosManager;
use super::redirect::{RedirectManager, RedirectRule};
use crate::data::{
    ActivateFlowsRequest, FlowAction, PolicyMatch, PolicyResult, PolicyRule,
    RedirectInformation, RuleId, VersionedPolicy, encode_imsi,
};
use crate::datapath::FlowProgrammer;
use crate::datapath::registers::*;
use crate::tables::RuleIdRegistry;
use anyhow::{Result, bail};
use ipnetwork::IpNetwork;
use openflow::{Action, FieldKind, FieldValue, FlowMatch, FlowMod, TableId};
use slog::{Logger, info, warn};
use std::net::{Ipv4Addr, Ipv6Addr};
use std::sync::Arc;

const TABLE_MISS_PRIORITY: u16 = 0;

/// How a rule, or one flow of it, treats matching traffic.
#[derive(Debug, Clone, Copy)]
enum RuleTreatment<'a> {
    Permit(&'a PolicyMatch),
    Deny(&'a PolicyMatch),
    Redirect(&'a RedirectInformation),
}

impl<'a> RuleTreatment<'a> {
    fn of(rule: &'a PolicyRule) -> Vec<RuleTreatment<'a>> {
        if let Some(redirect) = rule.redirect.as_ref().filter(|r| r.support) {
            return vec![RuleTreatment::Redirect(redirect)];
        }
        rule.flow_list
            .iter()
            .map(|flow| match flow.action {
                FlowAction::Permit => RuleTreatment::Permit(&flow.flow_match),
                FlowAction::Deny => RuleTreatment::Deny(&flow.flow_match),
            })
            .collect()
    }
}

#[derive(Clone)]
pub struct EnforcementController {
    app_name: &'static str,
    flows: FlowProgrammer,
    table: TableId,
    scratch_table: TableId,
    // Where traffic matched by a rule goes.
    rule_next_table: TableId,
    // Where traffic that matches no rule goes.
    miss_next_table: TableId,
    rule_ids: RuleIdRegistry,
    qos: Option<Arc<QosManager>>,
    redirect: RedirectManager,
    he: Option<HeController>,
    logger: Logger,
}

impl EnforcementController {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        app_name: &'static str,
        flows: FlowProgrammer,
        table: TableId,
        scratch_table: TableId,
        rule_next_table: TableId,
        miss_next_table: TableId,
        rule_ids: RuleIdRegistry,
        qos: Option<Arc<QosManager>>,
        redirect: RedirectManager,
        he: Option<HeController>,
        logger: &Logger,
    ) -> Self {
        EnforcementController {
            app_name,
            flows,
            table,
            scratch_table,
            rule_next_table,
            miss_next_table,
            rule_ids,
            qos,
            redirect,
            he,
            logger: logger.clone(),
        }
    }

    pub fn app_name(&self) -> &'static str {
        self.app_name
    }

    pub async fn install_default_flows(&self) -> Result<()> {
        self.flows
            .add_flows(vec![FlowMod::add(
                self.table,
                TABLE_MISS_PRIORITY,
                0,
                FlowMatch::new(),
                vec![Action::GotoTable(self.miss_next_table)],
            )])
            .await
    }

    /// Install the flows of each policy.  The versions in `request.policies` must already be
    /// the ones accepted by the version tracker.  Rules succeed or fail independently.
    pub async fn activate_rules(&self, request: &ActivateFlowsRequest) -> Vec<PolicyResult> {
        let imsi = match encode_imsi(&request.subscriber_id) {
            Ok(imsi) => imsi,
            Err(e) => {
                warn!(self.logger, "Cannot activate rules - {e}");
                return request.policies.iter().map(PolicyResult::failure).collect();
            }
        };
        let mut results = vec![];
        for policy in request.policies.iter() {
            let success = match self.install_rule(request, imsi, policy).await {
                Ok(()) => true,
                Err(e) => {
                    warn!(
                        self.logger,
                        "Failed to install {} rule {} v{} for {} - {e}",
                        self.app_name,
                        policy.rule.id,
                        policy.version,
                        request.subscriber_id
                    );
                    false
                }
            };
            results.push(PolicyResult::new(&policy.rule.id, policy.version, success));
        }
        results
    }

    async fn install_rule(
        &self,
        request: &ActivateFlowsRequest,
        imsi: u64,
        policy: &VersionedPolicy,
    ) -> Result<()> {
        let rule = &policy.rule;
        let rule_num = self.rule_ids.get_or_create(&rule.id).await;
        let mut flow_mods = vec![];
        for treatment in RuleTreatment::of(rule) {
            match treatment {
                RuleTreatment::Permit(m) | RuleTreatment::Deny(m) => {
                    let direction = Direction::from(m.direction);
                    let flow_match = policy_flow_match(
                        imsi,
                        request.uplink_tunnel,
                        request.ip_addr,
                        request.ipv6_addr,
                        m,
                    )?;
                    let mut actions = vec![
                        Action::load_reg(RULE_NUM_REG, rule_num),
                        Action::load_reg(RULE_VERSION_REG, policy.version),
                    ];
                    if let RuleTreatment::Deny(_) = treatment {
                        actions.push(Action::load_reg(DROP_REG, DROP_FLAG));
                    } else if let (Some(qos), Some(qos_manager)) = (rule.qos, &self.qos) {
                        actions.extend(
                            qos_manager
                                .add_subscriber_qos(
                                    &request.subscriber_id,
                                    rule_num,
                                    direction,
                                    &qos,
                                    request.apn_ambr.as_ref(),
                                )
                                .await?,
                        );
                    }
                    actions.push(Action::GotoTable(self.rule_next_table));
                    flow_mods.push(
                        FlowMod::add(self.table, rule.priority, rule_num as u64, flow_match, actions)
                            .with_hard_timeout(rule.hard_timeout),
                    );
                }
                RuleTreatment::Redirect(info) => {
                    self.redirect
                        .setup_redirect(&RedirectRule {
                            imsi,
                            subscriber_id: request.subscriber_id.clone(),
                            teid: request.uplink_tunnel,
                            ue_ip: request.ip_addr,
                            rule_id: rule.id.clone(),
                            rule_num,
                            version: policy.version,
                            priority: rule.priority,
                            hard_timeout: rule.hard_timeout,
                            info: info.clone(),
                        })
                        .await?;
                }
            }
        }
        self.flows.add_flows(flow_mods).await?;
        if let Some(he) = &self.he {
            he.add_rule(request, imsi, rule, rule_num).await?;
        }
        Ok(())
    }

    /// Remove the flows of the given rules.  Rules without flows are ignored.
    pub async fn deactivate_rules(
        &self,
        subscriber_id: &str,
        ip_addr: Option<Ipv4Addr>,
        teid: u32,
        rule_ids: &[RuleId],
    ) -> Result<()> {
        let imsi = encode_imsi(subscriber_id)?;
        for rule_id in rule_ids.iter() {
            let Some(rule_num) = self.rule_ids.get_num(rule_id) else {
                continue;
            };
            info!(
                self.logger,
                "Removing {} rule {rule_id} of {subscriber_id} teid {teid:#x}", self.app_name
            );
            self.flows
                .delete_flows(self.table, tunnel_scope(imsi, teid), Some(rule_num as u64))
                .await?;
            self.redirect
                .deactivate(ip_addr, Some((rule_num, rule_id.as_str())))
                .await?;
            if let (Some(he), Some(ip)) = (&self.he, ip_addr) {
                he.remove_rule(ip, rule_id, rule_num).await?;
            }
            self.remove_qos(subscriber_id, rule_num).await;
        }
        Ok(())
    }

    /// Remove every flow of the subscriber.  `rule_ids` are the rules the subscriber was
    /// known to have, whose queues are released.
    pub async fn deactivate_subscriber(
        &self,
        subscriber_id: &str,
        ip_addr: Option<Ipv4Addr>,
        teid: u32,
        rule_ids: &[RuleId],
    ) -> Result<()> {
        let imsi = encode_imsi(subscriber_id)?;
        info!(
            self.logger,
            "Removing all {} rules of {subscriber_id} teid {teid:#x}", self.app_name
        );
        self.flows
            .delete_flows(self.table, tunnel_scope(imsi, teid), None)
            .await?;
        self.redirect.deactivate(ip_addr, None).await?;
        if let (Some(he), Some(ip)) = (&self.he, ip_addr) {
            he.remove_ue(ip).await?;
        }
        for rule_id in rule_ids.iter() {
            if let Some(rule_num) = self.rule_ids.get_num(rule_id) {
                self.remove_qos(subscriber_id, rule_num).await;
            }
        }
        Ok(())
    }

    async fn remove_qos(&self, subscriber_id: &str, rule_num: u32) {
        let Some(qos) = &self.qos else {
            return;
        };
        let has_queue = Direction::both()
            .into_iter()
            .any(|d| qos.get_queue(subscriber_id, rule_num, d).is_some());
        if has_queue {
            qos.remove_subscriber_qos(Some(subscriber_id), Some(rule_num))
                .await;
        }
    }

    /// Replace whatever is in the tables with exactly the given rules.
    pub async fn handle_restart(&self, requests: &[ActivateFlowsRequest]) -> Vec<PolicyResult> {
        if let Err(e) = self.clear().await {
            warn!(self.logger, "Failed to clear {} tables - {e}", self.app_name);
            return requests
                .iter()
                .flat_map(|r| r.policies.iter().map(PolicyResult::failure))
                .collect();
        }
        let mut results = vec![];
        for request in requests.iter() {
            results.extend(self.activate_rules(request).await);
        }
        results
    }

    /// Delete every flow of the controller and put back the table default.
    pub async fn clear(&self) -> Result<()> {
        self.flows.delete_all_flows_in_table(self.table).await?;
        self.flows
            .delete_all_flows_in_table(self.scratch_table)
            .await?;
        if let Some(he) = &self.he {
            he.clear().await?;
        }
        self.install_default_flows().await
    }
}

/// Build the OpenFlow match for one flow description of a subscriber tunnel's rule.  The IP family
/// follows the addresses in the description, or failing that the subscriber's address.
/// The subscriber's own address is matched on its side of the flow unless the description
/// already constrains that side.
pub fn policy_flow_match(
    imsi: u64,
    teid: u32,
    ue_ipv4: Option<Ipv4Addr>,
    ue_ipv6: Option<Ipv6Addr>,
    m: &PolicyMatch,
) -> Result<FlowMatch> {
    let direction = Direction::from(m.direction);
    let mut flow_match = tunnel_match(imsi, direction, teid);

    let src = m.ip_src.as_deref().map(parse_network).transpose()?;
    let dst = m.ip_dst.as_deref().map(parse_network).transpose()?;
    let ipv6 = match (src, dst) {
        (Some(IpNetwork::V4(_)), Some(IpNetwork::V6(_)))
        | (Some(IpNetwork::V6(_)), Some(IpNetwork::V4(_))) => {
            bail!("Mixed IPv4 and IPv6 addresses in one flow")
        }
        (Some(net), _) | (None, Some(net)) => net.is_ipv6(),
        (None, None) => ue_ipv4.is_none() && ue_ipv6.is_some(),
    };

    let (src_kind, dst_kind) = if ipv6 {
        flow_match.set(FieldKind::EthType, FieldValue::Int(ETH_TYPE_IPV6));
        (FieldKind::Ipv6Src, FieldKind::Ipv6Dst)
    } else {
        flow_match.set(FieldKind::EthType, FieldValue::Int(ETH_TYPE_IPV4));
        (FieldKind::Ipv4Src, FieldKind::Ipv4Dst)
    };
    if let Some(net) = src {
        flow_match.set(src_kind, network_value(net));
    }
    if let Some(net) = dst {
        flow_match.set(dst_kind, network_value(net));
    }

    let ue_side = match direction {
        Direction::Out => src_kind,
        Direction::In => dst_kind,
    };
    if flow_match.get(ue_side).is_none() {
        let ue_addr = if ipv6 {
            ue_ipv6.map(FieldValue::host_v6)
        } else {
            ue_ipv4.map(FieldValue::host_v4)
        };
        if let Some(addr) = ue_addr {
            flow_match.set(ue_side, addr);
        }
    }

    let tcp = m.tcp_src.is_some() || m.tcp_dst.is_some();
    let udp = m.udp_src.is_some() || m.udp_dst.is_some();
    let ip_proto = match (m.ip_proto, tcp, udp) {
        (_, true, true) => bail!("Flow has both TCP and UDP ports"),
        (Some(p), true, _) if p != IP_PROTO_TCP => bail!("TCP ports with IP protocol {p}"),
        (Some(p), _, true) if p != IP_PROTO_UDP => bail!("UDP ports with IP protocol {p}"),
        (Some(p), _, _) => Some(p),
        (None, true, _) => Some(IP_PROTO_TCP),
        (None, _, true) => Some(IP_PROTO_UDP),
        (None, false, false) => None,
    };
    if let Some(p) = ip_proto {
        flow_match.set(FieldKind::IpProto, FieldValue::Int(p as u64));
    }
    for (kind, port) in [
        (FieldKind::TcpSrc, m.tcp_src),
        (FieldKind::TcpDst, m.tcp_dst),
        (FieldKind::UdpSrc, m.udp_src),
        (FieldKind::UdpDst, m.udp_dst),
    ] {
        if let Some(port) = port {
            flow_match.set(kind, FieldValue::Int(port as u64));
        }
    }
    Ok(flow_match)
}

fn parse_network(s: &str) -> Result<IpNetwork> {
    match s.parse::<IpNetwork>() {
        Ok(net) => Ok(net),
        Err(e) => bail!("Bad address {s} - {e}"),
    }
}

fn network_value(net: IpNetwork) -> FieldValue {
    match net {
        IpNetwork::V4(n) => FieldValue::Ipv4(n),
        IpNetwork::V6(n) => FieldValue::Ipv6(n),
    }
}
