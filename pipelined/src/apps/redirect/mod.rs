//! redirect - captive portal redirection of a subscriber's HTTP traffic

mod dns;

pub use dns::{DnsCache, Resolver, SystemResolver, url_host};

use crate::data::{RedirectAddressType, RedirectInformation, RuleId, Store};
use crate::datapath::FlowProgrammer;
use crate::datapath::registers::*;
use crate::tables::{EGRESS_TABLE, RuleVersionTracker};
use anyhow::{Result, bail};
use async_std::future::timeout;
use openflow::{
    Action, FieldKind, FieldValue, FlowMatch, FlowMod, LOCAL_PORT, LearnAction, LearnSpec,
    LearnSrc, TableId,
};
use slog::{Logger, info, warn};
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

const DNS_PORT: u64 = 53;
const HTTP_PORT: u64 = 80;

// Offsets above the rule priority.
const DNS_BYPASS_OFFSET: u16 = 3;
const ALLOW_OFFSET: u16 = 2;
const INTERCEPT_OFFSET: u16 = 1;
const DROP_OFFSET: u16 = 0;

/// Saved per UE address so that the portal can tell which subscriber and rule a redirected
/// connection belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedirectEntry {
    pub subscriber_id: String,
    pub rule_id: RuleId,
    pub server_address: String,
}

#[derive(Debug, Clone)]
pub struct RedirectRule {
    pub imsi: u64,
    pub subscriber_id: String,
    pub teid: u32,
    pub ue_ip: Option<Ipv4Addr>,
    pub rule_id: RuleId,
    pub rule_num: u32,
    pub version: u32,
    pub priority: u16,
    pub hard_timeout: u16,
    pub info: RedirectInformation,
}

enum Target {
    Resolved(Vec<Ipv4Addr>),
    Unresolved(String),
}

/// Shared by the redirect managers of all enforcement tables.
pub struct RedirectShared {
    pub resolver: Arc<dyn Resolver>,
    pub cache: DnsCache,
    pub store: Arc<dyn Store<Ipv4Addr, RedirectEntry>>,
    pub dns_timeout: Duration,
    pub bridge_ip: Ipv4Addr,
    pub http_port: u16,
}

#[derive(Clone)]
pub struct RedirectManager {
    flows: FlowProgrammer,
    main_table: TableId,
    next_table: TableId,
    scratch_table: TableId,
    versions: RuleVersionTracker,
    shared: Arc<RedirectShared>,
    logger: Logger,
}

impl RedirectManager {
    pub fn new(
        flows: FlowProgrammer,
        main_table: TableId,
        next_table: TableId,
        scratch_table: TableId,
        versions: RuleVersionTracker,
        shared: Arc<RedirectShared>,
        logger: &Logger,
    ) -> Self {
        RedirectManager {
            flows,
            main_table,
            next_table,
            scratch_table,
            versions,
            shared,
            logger: logger.clone(),
        }
    }

    /// Install the redirect flows of a rule.  If the portal address is not yet resolved,
    /// only the DNS bypass and default drop go in now, and the rest follows once a
    /// background lookup succeeds.
    pub async fn setup_redirect(&self, rule: &RedirectRule) -> Result<()> {
        let Some(ue_ip) = rule.ue_ip else {
            bail!("Redirect needs a subscriber IPv4 address");
        };
        let target = match rule.info.address_type {
            RedirectAddressType::SipUri => bail!("SIP URI redirect is not supported"),
            RedirectAddressType::Ipv6 => bail!("IPv6 redirect server is not supported"),
            RedirectAddressType::Ipv4 => {
                let Ok(ip) = rule.info.server_address.parse::<Ipv4Addr>() else {
                    bail!("Bad redirect server address {}", rule.info.server_address);
                };
                Target::Resolved(vec![ip])
            }
            RedirectAddressType::Url => {
                let host = url_host(&rule.info.server_address);
                if let Ok(ip) = host.parse::<Ipv4Addr>() {
                    Target::Resolved(vec![ip])
                } else if let Some(ips) = self.shared.cache.get(host) {
                    Target::Resolved(ips)
                } else {
                    Target::Unresolved(host.to_string())
                }
            }
        };

        self.shared.store.upsert(ue_ip, &mut |_| RedirectEntry {
            subscriber_id: rule.subscriber_id.clone(),
            rule_id: rule.rule_id.clone(),
            server_address: rule.info.server_address.clone(),
        });

        match target {
            Target::Resolved(ips) => {
                let mut flows = self.dns_bypass_flows(rule);
                flows.extend(self.allow_flows(rule, &ips));
                flows.extend(self.intercept_flows(rule, ue_ip));
                flows.extend(self.drop_flows(rule));
                self.flows.add_flows(flows).await
            }
            Target::Unresolved(host) => {
                let mut flows = self.dns_bypass_flows(rule);
                flows.extend(self.drop_flows(rule));
                self.flows.add_flows(flows).await?;
                info!(
                    self.logger,
                    "Resolving {host} for redirect of {} rule {}", rule.subscriber_id, rule.rule_id
                );
                let this = self.clone();
                let rule = rule.clone();
                async_std::task::spawn(async move {
                    this.complete_redirect(rule, ue_ip, host).await;
                });
                Ok(())
            }
        }
    }

    async fn complete_redirect(&self, rule: RedirectRule, ue_ip: Ipv4Addr, host: String) {
        let ips = match timeout(self.shared.dns_timeout, self.shared.resolver.resolve(&host)).await {
            Ok(Ok(ips)) if !ips.is_empty() => ips,
            Ok(Ok(_)) => {
                warn!(self.logger, "No IPv4 address for redirect server {host}");
                return;
            }
            Ok(Err(e)) => {
                warn!(self.logger, "Failed to resolve redirect server {host} - {e}");
                return;
            }
            Err(_) => {
                warn!(self.logger, "Timed out resolving redirect server {host}");
                return;
            }
        };
        self.shared.cache.insert(&host, ips.clone());

        // The rule may have been replaced or removed while we were resolving.
        let current = self
            .versions
            .get_version(&rule.subscriber_id, rule.teid, &rule.rule_id);
        if current != rule.version {
            info!(
                self.logger,
                "Rule {} of {} moved to version {current}, not completing redirect",
                rule.rule_id,
                rule.subscriber_id
            );
            return;
        }

        let mut flows = self.allow_flows(&rule, &ips);
        flows.extend(self.intercept_flows(&rule, ue_ip));
        if let Err(e) = self.flows.add_flows(flows).await {
            warn!(
                self.logger,
                "Failed to install redirect flows for {} rule {} - {e}", rule.subscriber_id, rule.rule_id
            );
        }
    }

    /// Remove the portal response flows, the learned flows and the saved redirect entry of
    /// one rule, or with `rule` of None, of every redirect rule of the UE.  The tunnel's
    /// other redirect flows carry its metadata and TEID and go with the rest of its rule flows.
    pub async fn deactivate(&self, ue_ip: Option<Ipv4Addr>, rule: Option<(u32, &str)>) -> Result<()> {
        let Some(ue_ip) = ue_ip else {
            return Ok(());
        };
        let cookie = rule.map(|(rule_num, _)| rule_num as u64);
        match rule {
            Some((_, rule_id)) => {
                self.shared
                    .store
                    .remove_if(&ue_ip, &|entry| entry.rule_id == rule_id);
            }
            None => {
                self.shared.store.remove(&ue_ip);
            }
        }
        let to_ue = FlowMatch::new().with(FieldKind::Ipv4Dst, FieldValue::host_v4(ue_ip));
        self.flows
            .delete_flows(
                self.main_table,
                to_ue.clone().with_int(FieldKind::InPort, LOCAL_PORT as u64),
                cookie,
            )
            .await?;
        self.flows
            .delete_flows(self.scratch_table, to_ue, cookie)
            .await
    }

    fn rule_flow(&self, rule: &RedirectRule, offset: u16, flow_match: FlowMatch, actions: Vec<Action>) -> FlowMod {
        FlowMod::add(
            self.main_table,
            rule.priority.saturating_add(offset),
            rule.rule_num as u64,
            flow_match,
            actions,
        )
        .with_hard_timeout(rule.hard_timeout)
    }

    fn forward_actions(&self, rule: &RedirectRule) -> Vec<Action> {
        vec![
            Action::load_reg(RULE_NUM_REG, rule.rule_num),
            Action::load_reg(RULE_VERSION_REG, rule.version),
            Action::GotoTable(self.next_table),
        ]
    }

    fn ipv4_match(rule: &RedirectRule, direction: Direction) -> FlowMatch {
        tunnel_match(rule.imsi, direction, rule.teid).with_int(FieldKind::EthType, ETH_TYPE_IPV4)
    }

    fn dns_bypass_flows(&self, rule: &RedirectRule) -> Vec<FlowMod> {
        let mut flows = vec![];
        for (proto, src, dst) in [
            (IP_PROTO_UDP, FieldKind::UdpSrc, FieldKind::UdpDst),
            (IP_PROTO_TCP, FieldKind::TcpSrc, FieldKind::TcpDst),
        ] {
            let uplink = Self::ipv4_match(rule, Direction::Out)
                .with_int(FieldKind::IpProto, proto as u64)
                .with_int(dst, DNS_PORT);
            let downlink = Self::ipv4_match(rule, Direction::In)
                .with_int(FieldKind::IpProto, proto as u64)
                .with_int(src, DNS_PORT);
            for m in [uplink, downlink] {
                flows.push(self.rule_flow(rule, DNS_BYPASS_OFFSET, m, self.forward_actions(rule)));
            }
        }
        flows
    }

    fn allow_flows(&self, rule: &RedirectRule, ips: &[Ipv4Addr]) -> Vec<FlowMod> {
        let mut flows = vec![];
        for ip in ips.iter() {
            let uplink = Self::ipv4_match(rule, Direction::Out)
                .with(FieldKind::Ipv4Dst, FieldValue::host_v4(*ip));
            let downlink = Self::ipv4_match(rule, Direction::In)
                .with(FieldKind::Ipv4Src, FieldValue::host_v4(*ip));
            for m in [uplink, downlink] {
                flows.push(self.rule_flow(rule, ALLOW_OFFSET, m, self.forward_actions(rule)));
            }
        }
        flows
    }

    /// HTTP from the subscriber is rewritten to the portal.  On the way, a learn action
    /// records the connection in the scratch table so that the portal's responses are
    /// rewritten back to appear to come from the original server.
    fn intercept_flows(&self, rule: &RedirectRule, ue_ip: Ipv4Addr) -> Vec<FlowMod> {
        let bridge_ip = FieldValue::host_v4(self.shared.bridge_ip);
        let http_port = self.shared.http_port as u64;
        let learn = LearnSpec {
            table: self.scratch_table,
            priority: rule.priority,
            cookie: rule.rule_num as u64,
            idle_timeout: 0,
            hard_timeout: rule.hard_timeout,
            matches: vec![
                (FieldKind::IpProto, LearnSrc::Value(FieldValue::Int(IP_PROTO_TCP as u64))),
                (
                    FieldKind::Reg(DIRECTION_REG),
                    LearnSrc::Value(FieldValue::Int(Direction::In.reg_value() as u64)),
                ),
                (FieldKind::Ipv4Src, LearnSrc::Value(bridge_ip)),
                (FieldKind::Ipv4Dst, LearnSrc::Field(FieldKind::Ipv4Src)),
                (FieldKind::TcpSrc, LearnSrc::Value(FieldValue::Int(http_port))),
                (FieldKind::TcpDst, LearnSrc::Field(FieldKind::TcpSrc)),
            ],
            actions: vec![
                LearnAction::SetField(FieldKind::Ipv4Src, LearnSrc::Field(FieldKind::Ipv4Dst)),
                LearnAction::SetField(FieldKind::TcpSrc, LearnSrc::Value(FieldValue::Int(HTTP_PORT))),
                LearnAction::SetField(FieldKind::Reg(TEID_REG), LearnSrc::Field(FieldKind::Reg(TEID_REG))),
                LearnAction::GotoTable(EGRESS_TABLE),
            ],
        };
        let intercept = self.rule_flow(
            rule,
            INTERCEPT_OFFSET,
            Self::ipv4_match(rule, Direction::Out)
                .with_int(FieldKind::IpProto, IP_PROTO_TCP as u64)
                .with_int(FieldKind::TcpDst, HTTP_PORT),
            vec![
                Action::Learn(learn),
                Action::SetField(FieldKind::Ipv4Dst, bridge_ip),
                Action::set_int(FieldKind::TcpDst, http_port),
                Action::Output(LOCAL_PORT),
            ],
        );
        let portal_response = self.rule_flow(
            rule,
            INTERCEPT_OFFSET,
            FlowMatch::new()
                .with_int(FieldKind::InPort, LOCAL_PORT as u64)
                .with_int(FieldKind::EthType, ETH_TYPE_IPV4)
                .with_int(FieldKind::IpProto, IP_PROTO_TCP as u64)
                .with(FieldKind::Ipv4Src, bridge_ip)
                .with_int(FieldKind::TcpSrc, http_port)
                .with(FieldKind::Ipv4Dst, FieldValue::host_v4(ue_ip)),
            vec![
                Action::set_int(FieldKind::Metadata, rule.imsi),
                Action::load_reg(DIRECTION_REG, Direction::In.reg_value()),
                Action::load_reg(TEID_REG, rule.teid),
                Action::GotoTable(self.scratch_table),
            ],
        );
        vec![intercept, portal_response]
    }

    fn drop_flows(&self, rule: &RedirectRule) -> Vec<FlowMod> {
        Direction::both()
            .into_iter()
            .map(|direction| {
                self.rule_flow(
                    rule,
                    DROP_OFFSET,
                    tunnel_match(rule.imsi, direction, rule.teid),
                    vec![
                        Action::load_reg(RULE_NUM_REG, rule.rule_num),
                        Action::load_reg(RULE_VERSION_REG, rule.version),
                        Action::load_reg(DROP_REG, DROP_FLAG),
                        Action::GotoTable(self.next_table),
                    ],
                )
            })
            .collect()
    }
}
