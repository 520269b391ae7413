use anyhow::Result;
use openflow::Verdict;
use pipelined::{
    PipelinedService, QuotaUpdateType, ResultCode, RpcError, SetupUeMacRequest,
    SubscriberQuotaUpdate, UeMacFlowRequest, UeSessionSet, UeSessionState,
    UpdateSubscriberQuotaStateRequest, app_names,
};
use pipelined_tests::{framework::*, uplink_packet};
use std::net::Ipv4Addr;

const IMSI: &str = "IMSI001010000000005";
const MAC: &str = "5e:cc:cc:b1:49:4b";
const TEID: u32 = 0x5001;
const UE_IP: Ipv4Addr = Ipv4Addr::new(192, 168, 128, 50);

fn mac_request(mac: &str) -> UeMacFlowRequest {
    UeMacFlowRequest {
        sid: IMSI.to_string(),
        mac_addr: mac.to_string(),
    }
}

fn quota_update(update_type: QuotaUpdateType) -> UpdateSubscriberQuotaStateRequest {
    UpdateSubscriberQuotaStateRequest {
        updates: vec![SubscriberQuotaUpdate {
            sid: IMSI.to_string(),
            mac_addr: MAC.to_string(),
            update_type,
        }],
    }
}

#[async_std::test]
async fn ue_mac_flows() -> Result<()> {
    let t = init().await?;
    let defaults = t.flows(app_names::UE_MAC).await?.len();

    let result = t.rpc.add_ue_mac_flow(mac_request("5e:cc:cc")).await;
    assert!(matches!(result, Err(RpcError::InvalidArgument(_))));

    let result = t.rpc.add_ue_mac_flow(mac_request(MAC)).await?;
    assert_eq!(result, ResultCode::Success);
    assert_eq!(t.flows(app_names::UE_MAC).await?.len(), defaults + 4);

    let result = t.rpc.delete_ue_mac_flow(mac_request(MAC)).await?;
    assert_eq!(result, ResultCode::Success);
    assert_eq!(t.flows(app_names::UE_MAC).await?.len(), defaults);
    Ok(())
}

#[async_std::test]
async fn ue_mac_setup() -> Result<()> {
    let t = init().await?;
    let defaults = t.flows(app_names::UE_MAC).await?.len();
    t.rpc.add_ue_mac_flow(mac_request("5e:cc:cc:b1:49:4c")).await?;

    let result = t
        .rpc
        .setup_ue_mac_flows(SetupUeMacRequest {
            requests: vec![mac_request(MAC)],
            epoch: t.pipelined.epoch() + 1,
        })
        .await?;
    assert_eq!(result, ResultCode::OutdatedEpoch);

    // Only the replayed MAC is left
    let result = t
        .rpc
        .setup_ue_mac_flows(SetupUeMacRequest {
            requests: vec![mac_request(MAC)],
            epoch: t.pipelined.epoch(),
        })
        .await?;
    assert_eq!(result, ResultCode::Success);
    assert_eq!(t.flows(app_names::UE_MAC).await?.len(), defaults + 4);
    Ok(())
}

#[async_std::test]
async fn subscriber_quota_state() -> Result<()> {
    let t = init().await?;
    let defaults = t.flows(app_names::CHECK_QUOTA).await?.len();

    let result = t
        .rpc
        .update_subscriber_quota_state(UpdateSubscriberQuotaStateRequest { updates: vec![] })
        .await;
    assert!(matches!(result, Err(RpcError::InvalidArgument(_))));

    // Out of quota: traffic of the subscriber is dropped
    let result = t
        .rpc
        .update_subscriber_quota_state(quota_update(QuotaUpdateType::NoQuota))
        .await?;
    assert_eq!(result, ResultCode::Success);
    let flows = t.flows(app_names::CHECK_QUOTA).await?;
    assert_eq!(flows.len(), defaults + 2);
    assert_eq!(flows.iter().filter(|f| f.actions.is_empty()).count(), 2);

    // Quota granted: the same flows now forward
    t.rpc
        .update_subscriber_quota_state(quota_update(QuotaUpdateType::ValidQuota))
        .await?;
    let flows = t.flows(app_names::CHECK_QUOTA).await?;
    assert_eq!(flows.len(), defaults + 2);
    assert!(flows.iter().all(|f| !f.actions.is_empty()));

    t.rpc
        .update_subscriber_quota_state(quota_update(QuotaUpdateType::Terminate))
        .await?;
    assert_eq!(t.flows(app_names::CHECK_QUOTA).await?.len(), defaults);
    Ok(())
}

#[async_std::test]
async fn tunnel_removal() -> Result<()> {
    let t = init().await?;
    let defaults = t.flows(app_names::CLASSIFIER).await?.len();
    t.attach(IMSI, TEID, UE_IP).await?;
    assert_eq!(t.flows(app_names::CLASSIFIER).await?.len(), defaults + 2);

    let result = t
        .rpc
        .update_ue_state(UeSessionSet {
            subscriber_id: IMSI.to_string(),
            ue_ipv4: UE_IP,
            enb_ip: ENB_IP,
            in_teid: TEID,
            out_teid: TEID + 0x1000,
            state: UeSessionState::Remove,
        })
        .await?;
    assert_eq!(result, ResultCode::Success);
    assert_eq!(t.flows(app_names::CLASSIFIER).await?.len(), defaults);

    // Without its tunnel, the UE's traffic goes nowhere
    let verdict = t
        .switch
        .inject(uplink_packet(TEID, UE_IP, Ipv4Addr::new(45, 10, 0, 1), 60), 1)
        .await;
    assert_eq!(verdict, Verdict::Dropped { table: 0 });
    Ok(())
}
