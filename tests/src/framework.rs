use super::{GatedResolver, MockCollector, MockProxy};
use anyhow::{Result, anyhow, bail};
use openflow::{FlowStats, SoftSwitch, TableId};
use pipelined::{
    ActivateFlowsRequest, Config, DeactivateFlowsRequest, FlowAction, FlowDescription,
    FlowDirection, Pipelined, PipelinedService, PolicyMatch, PolicyRule, RequestOrigin,
    ResultCode, RpcHandler, UeSessionSet, UeSessionState, VersionedPolicy, VersionedPolicyId,
    app_names,
};
use slog::{Drain, Logger, o};
use std::future::Future;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

pub const ENB_IP: Ipv4Addr = Ipv4Addr::new(192, 168, 60, 141);

pub struct TestPipelined {
    pub pipelined: Pipelined,
    pub rpc: RpcHandler<Pipelined>,
    pub switch: SoftSwitch,
    pub collector: Arc<MockCollector>,
    pub resolver: Arc<GatedResolver>,
    pub proxy: Arc<MockProxy>,
    pub logger: Logger,
}

pub async fn init() -> Result<TestPipelined> {
    init_with_config(test_config()).await
}

/// Defaults, except that stats are only polled when a test asks.
pub fn test_config() -> Config {
    let mut config = Config::default();
    config.enforcement.poll_interval_secs = 3600;
    config.rpc_timeout_ms = 2000;
    config.redirect.dns_timeout_ms = 5000;
    config
}

pub async fn init_with_config(config: Config) -> Result<TestPipelined> {
    exit_on_panic();
    let logger = init_logging();
    let (switch, switch_events) = SoftSwitch::new(1);
    let collector = Arc::new(MockCollector::new());
    let resolver = Arc::new(GatedResolver::new());
    let proxy = Arc::new(MockProxy::new());
    let pipelined = Pipelined::start(
        config,
        switch.clone(),
        switch_events,
        collector.clone(),
        resolver.clone(),
        proxy.clone(),
        logger.new(o!("pipelined" => 1)),
    )
    .await?;
    let rpc = pipelined.rpc_handler();
    switch.connect().await?;

    let t = TestPipelined {
        pipelined,
        rpc,
        switch,
        collector,
        resolver,
        proxy,
        logger,
    };
    let stats_table = t.table(app_names::ENFORCEMENT_STATS).await?;
    let switch = t.switch.clone();
    wait_until("default flows", || {
        let switch = switch.clone();
        async move { !switch.flows(stats_table).await.is_empty() }
    })
    .await?;
    Ok(t)
}

fn exit_on_panic() {
    let orig_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        orig_hook(panic_info);
        std::process::exit(1);
    }));
}

fn init_logging() -> Logger {
    let decorator = slog_term::TermDecorator::new().build();
    let drain = slog_term::CompactFormat::new(decorator).build();
    let drain = std::sync::Mutex::new(drain).fuse();
    let drain = slog_envlogger::new(drain);
    slog::Logger::root(drain, o!())
}

pub async fn wait_until<F, Fut>(what: &str, mut condition: F) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..300 {
        if condition().await {
            return Ok(());
        }
        async_std::task::sleep(Duration::from_millis(10)).await;
    }
    bail!("Timed out waiting for {what}")
}

impl TestPipelined {
    pub async fn table(&self, app_name: &str) -> Result<TableId> {
        self.rpc
            .get_all_table_assignments()
            .await?
            .into_iter()
            .find(|a| a.app_name == app_name)
            .map(|a| a.main_table)
            .ok_or_else(|| anyhow!("{app_name} has no table"))
    }

    pub async fn flows(&self, app_name: &str) -> Result<Vec<FlowStats>> {
        Ok(self.switch.flows(self.table(app_name).await?).await)
    }

    /// Flows of the app's table with the given priority.
    pub async fn flows_at(&self, app_name: &str, priority: u16) -> Result<Vec<FlowStats>> {
        Ok(self
            .flows(app_name)
            .await?
            .into_iter()
            .filter(|f| f.priority == priority)
            .collect())
    }

    /// Counting flows of actual rules, leaving out table defaults and default drops.
    pub async fn rule_stats_flows(&self) -> Result<Vec<FlowStats>> {
        Ok(self
            .flows(app_names::ENFORCEMENT_STATS)
            .await?
            .into_iter()
            .filter(|f| f.cookie != 0 && f.cookie != pipelined::DEFAULT_DROP_COOKIE)
            .collect())
    }

    /// Bring up the GTP tunnel of a UE.
    pub async fn attach(&self, imsi: &str, teid: u32, ue_ip: Ipv4Addr) -> Result<()> {
        let result = self
            .rpc
            .update_ue_state(UeSessionSet {
                subscriber_id: imsi.to_string(),
                ue_ipv4: ue_ip,
                enb_ip: ENB_IP,
                in_teid: teid,
                out_teid: teid + 0x1000,
                state: UeSessionState::Install,
            })
            .await?;
        if result != ResultCode::Success {
            bail!("Tunnel install for {imsi} gave {result:?}");
        }
        Ok(())
    }

    /// Activate rules and insist that every one of them went in.
    pub async fn activate(&self, request: ActivateFlowsRequest) -> Result<()> {
        let result = self.rpc.activate_flows(request).await?;
        for r in result.policy_results.iter() {
            if r.result != ResultCode::Success {
                bail!("Rule {} v{} gave {:?}", r.rule_id, r.version, r.result);
            }
        }
        Ok(())
    }

    pub async fn poll(&self) -> Result<()> {
        self.pipelined.poll_usage().await
    }
}

pub fn permit_rule(id: &str, priority: u16, direction: FlowDirection, ip_dst: &str) -> PolicyRule {
    let mut flow_match = PolicyMatch::new(direction);
    match direction {
        FlowDirection::Uplink => flow_match.ip_dst = Some(ip_dst.to_string()),
        FlowDirection::Downlink => flow_match.ip_src = Some(ip_dst.to_string()),
    }
    PolicyRule::new(
        id,
        priority,
        vec![FlowDescription {
            flow_match,
            action: FlowAction::Permit,
        }],
    )
}

pub fn versioned(rule: PolicyRule, version: u32) -> VersionedPolicy {
    VersionedPolicy { rule, version }
}

pub fn activate_request(
    imsi: &str,
    teid: u32,
    ue_ip: Ipv4Addr,
    policies: Vec<VersionedPolicy>,
    origin: RequestOrigin,
) -> ActivateFlowsRequest {
    ActivateFlowsRequest {
        subscriber_id: imsi.to_string(),
        msisdn: None,
        uplink_tunnel: teid,
        downlink_tunnel: None,
        ip_addr: Some(ue_ip),
        ipv6_addr: None,
        apn_ambr: None,
        policies,
        origin,
    }
}

pub fn deactivate_request(
    imsi: &str,
    teid: u32,
    ue_ip: Ipv4Addr,
    policies: &[(&str, u32)],
    origin: RequestOrigin,
) -> DeactivateFlowsRequest {
    DeactivateFlowsRequest {
        subscriber_id: imsi.to_string(),
        uplink_tunnel: teid,
        ip_addr: Some(ue_ip),
        ipv6_addr: None,
        policies: policies
            .iter()
            .map(|(rule_id, version)| VersionedPolicyId {
                rule_id: rule_id.to_string(),
                version: *version,
            })
            .collect(),
        origin,
        remove_default_drop_flows: false,
    }
}
