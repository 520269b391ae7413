use anyhow::Result;
use openflow::Verdict;
use pipelined::{
    Config, FlowDirection, PipelinedService, RequestOrigin, ResultCode, RpcError,
    SetupPolicyRequest, app_names,
};
use pipelined_tests::{framework::*, uplink_packet};
use std::net::Ipv4Addr;

const IMSI: &str = "IMSI001010000000004";
const TEID: u32 = 0x4001;
const UE_IP: Ipv4Addr = Ipv4Addr::new(192, 168, 128, 40);
const SERVER: Ipv4Addr = Ipv4Addr::new(45, 10, 0, 1);

#[async_std::test]
async fn outdated_epoch() -> Result<()> {
    let t = init().await?;
    let epoch = t.pipelined.epoch();

    let result = t.rpc.setup_default_controllers(epoch + 1).await?;
    assert_eq!(result, ResultCode::OutdatedEpoch);
    let result = t
        .rpc
        .setup_policy_flows(SetupPolicyRequest {
            requests: vec![],
            epoch: epoch - 1,
        })
        .await?;
    assert_eq!(result, ResultCode::OutdatedEpoch);

    let result = t.rpc.setup_default_controllers(epoch).await?;
    assert_eq!(result, ResultCode::Success);
    Ok(())
}

#[async_std::test]
async fn policy_replay_replaces_rules() -> Result<()> {
    let t = init().await?;
    t.attach(IMSI, TEID, UE_IP).await?;
    t.activate(activate_request(
        IMSI,
        TEID,
        UE_IP,
        vec![
            versioned(permit_rule("rule_a", 10, FlowDirection::Uplink, "45.10.0.0/25"), 1),
            versioned(permit_rule("rule_b", 20, FlowDirection::Uplink, "45.20.0.0/16"), 1),
        ],
        RequestOrigin::Gx,
    ))
    .await?;
    assert_eq!(t.rule_stats_flows().await?.len(), 4);

    // The session manager only knows about rule_b
    let result = t
        .rpc
        .setup_policy_flows(SetupPolicyRequest {
            requests: vec![activate_request(
                IMSI,
                TEID,
                UE_IP,
                vec![versioned(
                    permit_rule("rule_b", 20, FlowDirection::Uplink, "45.20.0.0/16"),
                    1,
                )],
                RequestOrigin::Gx,
            )],
            epoch: t.pipelined.epoch(),
        })
        .await?;
    assert_eq!(result, ResultCode::Success);
    assert!(t.flows_at(app_names::ENFORCEMENT, 10).await?.is_empty());
    assert_eq!(t.flows_at(app_names::ENFORCEMENT, 20).await?.len(), 1);
    assert_eq!(t.rule_stats_flows().await?.len(), 2);

    let stats_table = t.table(app_names::ENFORCEMENT_STATS).await?;
    let verdict = t
        .switch
        .inject(uplink_packet(TEID, UE_IP, SERVER, 60), 1)
        .await;
    assert_eq!(verdict, Verdict::Dropped { table: stats_table });
    Ok(())
}

#[async_std::test]
async fn table_assignments() -> Result<()> {
    let t = init().await?;
    let assignments = t.rpc.get_all_table_assignments().await?;
    let table_of = |app: &str| {
        assignments
            .iter()
            .find(|a| a.app_name == app)
            .map(|a| (a.main_table, a.scratch_tables.clone()))
    };
    assert_eq!(table_of(app_names::CLASSIFIER), Some((0, vec![])));
    assert_eq!(table_of(app_names::UE_MAC), Some((2, vec![])));
    assert_eq!(table_of(app_names::CHECK_QUOTA), Some((3, vec![])));
    assert_eq!(table_of(app_names::HE), Some((4, vec![])));
    assert_eq!(table_of(app_names::GY), Some((10, vec![200])));
    assert_eq!(table_of(app_names::ENFORCEMENT), Some((11, vec![201])));
    assert_eq!(table_of(app_names::ENFORCEMENT_STATS), Some((12, vec![])));
    Ok(())
}

#[async_std::test]
async fn reconnect_restores_tunnels() -> Result<()> {
    let t = init().await?;
    t.attach(IMSI, TEID, UE_IP).await?;
    t.activate(activate_request(
        IMSI,
        TEID,
        UE_IP,
        vec![versioned(
            permit_rule("rule_a", 10, FlowDirection::Uplink, "45.10.0.0/25"),
            1,
        )],
        RequestOrigin::Gx,
    ))
    .await?;
    let classifier_flows = t.flows(app_names::CLASSIFIER).await?.len();

    // Calls are refused while the switch is away
    t.switch.disconnect().await?;
    let t = &t;
    wait_until("disconnect", || async move {
        matches!(
            t.rpc.get_policy_usage().await,
            Err(RpcError::Unavailable(_))
        )
    })
    .await?;

    // Clean restart: rules are gone until the session manager replays them, but the
    // tunnels come straight back
    t.switch.connect().await?;
    wait_until("reinstall", || async move {
        let rules_gone = t
            .flows_at(app_names::ENFORCEMENT, 10)
            .await
            .is_ok_and(|f| f.is_empty());
        let tunnels_back = t
            .flows(app_names::CLASSIFIER)
            .await
            .is_ok_and(|f| f.len() == classifier_flows);
        rules_gone && tunnels_back
    })
    .await?;
    assert!(t.rule_stats_flows().await?.is_empty());

    let verdict = t
        .switch
        .inject(uplink_packet(TEID, UE_IP, SERVER, 60), 1)
        .await;
    assert_eq!(verdict, Verdict::Output(Config::default().uplink_port));
    Ok(())
}

#[async_std::test]
async fn activation_overrunning_deadline_fails() -> Result<()> {
    let mut config = test_config();
    config.rpc_timeout_ms = 300;
    let t = init_with_config(config).await?;
    t.attach(IMSI, TEID, UE_IP).await?;

    // The switch stops confirming flow mods
    t.switch.set_answer_barriers(false).await;
    let result = t
        .rpc
        .activate_flows(activate_request(
            IMSI,
            TEID,
            UE_IP,
            vec![versioned(
                permit_rule("rule_a", 10, FlowDirection::Uplink, "45.10.0.0/25"),
                1,
            )],
            RequestOrigin::Gx,
        ))
        .await?;
    assert_eq!(result.policy_results.len(), 1);
    assert_eq!(result.policy_results[0].result, ResultCode::Failure);
    Ok(())
}
