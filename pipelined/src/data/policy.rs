//! policy - request and response types of the control RPCs

use std::net::{Ipv4Addr, Ipv6Addr};

pub type RuleId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FlowDirection {
    Uplink,
    Downlink,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowAction {
    Permit,
    Deny,
}

/// Match criteria of one flow description.  Addresses are strings as received from the
/// policy source ("45.10.0.0/25", "8.8.8.8", "2001:db8::/32").  `None` means wildcard.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyMatch {
    pub direction: FlowDirection,
    pub ip_proto: Option<u8>,
    pub ip_src: Option<String>,
    pub ip_dst: Option<String>,
    pub tcp_src: Option<u16>,
    pub tcp_dst: Option<u16>,
    pub udp_src: Option<u16>,
    pub udp_dst: Option<u16>,
}

impl PolicyMatch {
    pub fn new(direction: FlowDirection) -> Self {
        PolicyMatch {
            direction,
            ip_proto: None,
            ip_src: None,
            ip_dst: None,
            tcp_src: None,
            tcp_dst: None,
            udp_src: None,
            udp_dst: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlowDescription {
    pub flow_match: PolicyMatch,
    pub action: FlowAction,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RedirectAddressType {
    Ipv4,
    Ipv6,
    Url,
    SipUri,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedirectInformation {
    pub support: bool,
    pub address_type: RedirectAddressType,
    pub server_address: String,
}

/// Maximum and guaranteed bit rates in bits per second.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QosInformation {
    pub qci: u8,
    pub max_req_bw_ul: u64,
    pub max_req_bw_dl: u64,
    pub gbr_ul: u64,
    pub gbr_dl: u64,
}

/// URLs whose HTTP requests get subscriber headers added by the proxy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderEnrichment {
    pub urls: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyRule {
    pub id: RuleId,
    pub priority: u16,
    pub flow_list: Vec<FlowDescription>,
    pub redirect: Option<RedirectInformation>,
    pub hard_timeout: u16,
    pub app_name: Option<String>,
    pub qos: Option<QosInformation>,
    pub he: Option<HeaderEnrichment>,
}

impl PolicyRule {
    pub fn new(id: &str, priority: u16, flow_list: Vec<FlowDescription>) -> Self {
        PolicyRule {
            id: id.to_string(),
            priority,
            flow_list,
            redirect: None,
            hard_timeout: 0,
            app_name: None,
            qos: None,
            he: None,
        }
    }

    pub fn is_redirect(&self) -> bool {
        self.redirect.as_ref().is_some_and(|r| r.support)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionedPolicy {
    pub rule: PolicyRule,
    pub version: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionedPolicyId {
    pub rule_id: RuleId,
    pub version: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AggregatedMaximumBitrate {
    pub max_bandwidth_ul: u64,
    pub max_bandwidth_dl: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestOrigin {
    Gx,
    Gy,
    Wildcard,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActivateFlowsRequest {
    pub subscriber_id: String,
    pub msisdn: Option<String>,
    pub uplink_tunnel: u32,
    pub downlink_tunnel: Option<u32>,
    pub ip_addr: Option<Ipv4Addr>,
    pub ipv6_addr: Option<Ipv6Addr>,
    pub apn_ambr: Option<AggregatedMaximumBitrate>,
    pub policies: Vec<VersionedPolicy>,
    pub origin: RequestOrigin,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultCode {
    Success,
    Failure,
    OutdatedEpoch,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyResult {
    pub rule_id: RuleId,
    pub version: u32,
    pub result: ResultCode,
}

impl PolicyResult {
    pub fn new(rule_id: &str, version: u32, success: bool) -> Self {
        PolicyResult {
            rule_id: rule_id.to_string(),
            version,
            result: if success {
                ResultCode::Success
            } else {
                ResultCode::Failure
            },
        }
    }

    pub fn failure(policy: &VersionedPolicy) -> Self {
        Self::new(&policy.rule.id, policy.version, false)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActivateFlowsResult {
    pub policy_results: Vec<PolicyResult>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeactivateFlowsRequest {
    pub subscriber_id: String,
    pub uplink_tunnel: u32,
    pub ip_addr: Option<Ipv4Addr>,
    pub ipv6_addr: Option<Ipv6Addr>,
    /// Empty means every rule of the subscriber.
    pub policies: Vec<VersionedPolicyId>,
    pub origin: RequestOrigin,
    pub remove_default_drop_flows: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetupPolicyRequest {
    pub requests: Vec<ActivateFlowsRequest>,
    pub epoch: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UeMacFlowRequest {
    pub sid: String,
    pub mac_addr: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetupUeMacRequest {
    pub requests: Vec<UeMacFlowRequest>,
    pub epoch: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuotaUpdateType {
    ValidQuota,
    NoQuota,
    Terminate,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriberQuotaUpdate {
    pub sid: String,
    pub mac_addr: String,
    pub update_type: QuotaUpdateType,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetupQuotaRequest {
    pub requests: Vec<SubscriberQuotaUpdate>,
    pub epoch: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateSubscriberQuotaStateRequest {
    pub updates: Vec<SubscriberQuotaUpdate>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UeSessionState {
    Install,
    Remove,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UeSessionSet {
    pub subscriber_id: String,
    pub ue_ipv4: Ipv4Addr,
    pub enb_ip: Ipv4Addr,
    pub in_teid: u32,
    pub out_teid: u32,
    pub state: UeSessionState,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableAssignment {
    pub app_name: String,
    pub main_table: u8,
    pub scratch_tables: Vec<u8>,
}
