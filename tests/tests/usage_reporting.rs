use anyhow::{Result, anyhow};
use openflow::Verdict;
use pipelined::{
    Config, DEFAULT_DROP_RULE_ID, FlowDirection, PipelinedService, RequestOrigin, ResultCode,
    app_names,
};
use pipelined_tests::{downlink_packet, framework::*, uplink_packet};
use std::net::Ipv4Addr;

const IMSI: &str = "IMSI001010000000001";
const TEID: u32 = 0x1234;
const UE_IP: Ipv4Addr = Ipv4Addr::new(192, 168, 128, 12);
const SERVER: Ipv4Addr = Ipv4Addr::new(45, 10, 0, 1);

async fn with_uplink_rule() -> Result<TestPipelined> {
    let t = init().await?;
    t.attach(IMSI, TEID, UE_IP).await?;
    t.activate(activate_request(
        IMSI,
        TEID,
        UE_IP,
        vec![versioned(
            permit_rule("tx_match", 10, FlowDirection::Uplink, "45.10.0.0/25"),
            1,
        )],
        RequestOrigin::Gx,
    ))
    .await?;
    Ok(t)
}

#[async_std::test]
async fn uplink_usage() -> Result<()> {
    let t = with_uplink_rule().await?;

    // 128 packets of 34 bytes from the UE
    let verdict = t
        .switch
        .inject(uplink_packet(TEID, UE_IP, SERVER, 34), 128)
        .await;
    assert_eq!(verdict, Verdict::Output(Config::default().uplink_port));

    t.poll().await?;
    let record = t
        .collector
        .last_record(IMSI, "tx_match")
        .await
        .ok_or(anyhow!("No usage for tx_match"))?;
    assert_eq!(record.bytes_tx, 4352);
    assert_eq!(record.bytes_rx, 0);
    assert_eq!(record.rule_version, 1);
    assert_eq!(record.teid, TEID);

    // Nothing new since the last poll
    t.poll().await?;
    let record = t
        .collector
        .last_record(IMSI, "tx_match")
        .await
        .ok_or(anyhow!("No usage for tx_match"))?;
    assert_eq!(record.bytes_tx, 0);
    Ok(())
}

#[async_std::test]
async fn downlink_usage_excludes_ethernet_header() -> Result<()> {
    let t = init().await?;
    t.attach(IMSI, TEID, UE_IP).await?;
    t.activate(activate_request(
        IMSI,
        TEID,
        UE_IP,
        vec![versioned(
            permit_rule("rx_match", 10, FlowDirection::Downlink, "45.10.0.0/25"),
            1,
        )],
        RequestOrigin::Gx,
    ))
    .await?;

    let verdict = t.switch.inject(downlink_packet(SERVER, UE_IP, 100), 10).await;
    assert_eq!(verdict, Verdict::Output(Config::default().gtp_port));

    t.poll().await?;
    let record = t
        .collector
        .last_record(IMSI, "rx_match")
        .await
        .ok_or(anyhow!("No usage for rx_match"))?;
    assert_eq!(record.bytes_rx, 1000 - 14 * 10);
    assert_eq!(record.bytes_tx, 0);
    Ok(())
}

#[async_std::test]
async fn unmatched_traffic_counts_as_default_drop() -> Result<()> {
    let t = with_uplink_rule().await?;

    let elsewhere = Ipv4Addr::new(8, 8, 8, 8);
    let verdict = t
        .switch
        .inject(uplink_packet(TEID, UE_IP, elsewhere, 50), 4)
        .await;
    let stats_table = t.table(pipelined::app_names::ENFORCEMENT_STATS).await?;
    assert_eq!(verdict, Verdict::Dropped { table: stats_table });

    t.poll().await?;
    let record = t
        .collector
        .last_record(IMSI, DEFAULT_DROP_RULE_ID)
        .await
        .ok_or(anyhow!("No default drop usage"))?;
    assert_eq!(record.dropped_tx, 200);
    assert_eq!(record.bytes_tx, 0);
    Ok(())
}

#[async_std::test]
async fn failed_report_is_carried_to_next_poll() -> Result<()> {
    let t = with_uplink_rule().await?;

    t.switch
        .inject(uplink_packet(TEID, UE_IP, SERVER, 100), 10)
        .await;
    t.collector.set_failing(true);
    t.poll().await?;
    assert_eq!(t.collector.report_count().await, 0);

    t.switch
        .inject(uplink_packet(TEID, UE_IP, SERVER, 100), 5)
        .await;
    t.collector.set_failing(false);
    t.poll().await?;
    let record = t
        .collector
        .last_record(IMSI, "tx_match")
        .await
        .ok_or(anyhow!("No usage for tx_match"))?;
    assert_eq!(record.bytes_tx, 1500);
    Ok(())
}

#[async_std::test]
async fn policy_usage_is_cumulative() -> Result<()> {
    let t = with_uplink_rule().await?;

    t.switch
        .inject(uplink_packet(TEID, UE_IP, SERVER, 100), 10)
        .await;
    t.poll().await?;
    t.switch
        .inject(uplink_packet(TEID, UE_IP, SERVER, 100), 10)
        .await;
    t.poll().await?;

    let usage = t.rpc.get_policy_usage().await?;
    let record = usage
        .find(IMSI, "tx_match")
        .ok_or(anyhow!("No usage for tx_match"))?;
    assert_eq!(record.bytes_tx, 2000);
    assert_eq!(usage.epoch, t.pipelined.epoch());
    Ok(())
}

#[async_std::test]
async fn counter_reset_rebaselines_each_counter() -> Result<()> {
    let t = init().await?;
    t.attach(IMSI, TEID, UE_IP).await?;
    let mut rule = permit_rule("both_ways", 10, FlowDirection::Uplink, "45.10.0.0/25");
    rule.flow_list.extend(
        permit_rule("both_ways", 10, FlowDirection::Downlink, "45.10.0.0/25").flow_list,
    );
    t.activate(activate_request(
        IMSI,
        TEID,
        UE_IP,
        vec![versioned(rule, 1)],
        RequestOrigin::Gx,
    ))
    .await?;

    t.switch
        .inject(uplink_packet(TEID, UE_IP, SERVER, 100), 10)
        .await;
    t.switch.inject(downlink_packet(SERVER, UE_IP, 100), 5).await;
    t.poll().await?;
    let record = t
        .collector
        .last_record(IMSI, "both_ways")
        .await
        .ok_or(anyhow!("No usage for both_ways"))?;
    assert_eq!((record.bytes_tx, record.bytes_rx), (1000, 430));

    // The datapath loses its counters, then more downlink traffic than before arrives
    t.switch.reset_counters().await;
    t.switch.inject(downlink_packet(SERVER, UE_IP, 100), 10).await;
    t.poll().await?;
    let record = t
        .collector
        .last_record(IMSI, "both_ways")
        .await
        .ok_or(anyhow!("No usage for both_ways"))?;
    assert_eq!((record.bytes_tx, record.bytes_rx), (0, 430));

    // Uplink now counts up from its new baseline
    t.switch
        .inject(uplink_packet(TEID, UE_IP, SERVER, 100), 2)
        .await;
    t.poll().await?;
    let record = t
        .collector
        .last_record(IMSI, "both_ways")
        .await
        .ok_or(anyhow!("No usage for both_ways"))?;
    assert_eq!((record.bytes_tx, record.bytes_rx), (200, 0));
    Ok(())
}

#[async_std::test]
async fn rule_without_counting_flows_is_not_enforced() -> Result<()> {
    let t = init().await?;
    t.attach(IMSI, TEID, UE_IP).await?;
    let request = || {
        activate_request(
            IMSI,
            TEID,
            UE_IP,
            vec![versioned(
                permit_rule("tx_match", 10, FlowDirection::Uplink, "45.10.0.0/25"),
                1,
            )],
            RequestOrigin::Gx,
        )
    };

    let stats_table = t.table(app_names::ENFORCEMENT_STATS).await?;
    t.switch.fail_flow_mods_in_table(stats_table, true).await;
    let result = t.rpc.activate_flows(request()).await?;
    assert_eq!(result.policy_results.len(), 1);
    assert_eq!(result.policy_results[0].result, ResultCode::Failure);
    assert!(t.flows_at(app_names::ENFORCEMENT, 10).await?.is_empty());

    t.switch.fail_flow_mods_in_table(stats_table, false).await;
    t.activate(request()).await?;
    assert_eq!(t.flows_at(app_names::ENFORCEMENT, 10).await?.len(), 1);
    Ok(())
}

#[async_std::test]
async fn usage_read_over_many_replies() -> Result<()> {
    let t = with_uplink_rule().await?;
    t.activate(activate_request(
        IMSI,
        TEID,
        UE_IP,
        vec![versioned(
            permit_rule("rx_match", 20, FlowDirection::Downlink, "45.10.0.0/25"),
            1,
        )],
        RequestOrigin::Gx,
    ))
    .await?;

    // One flow per reply part
    t.switch.set_max_flows_per_reply(1).await;
    t.switch
        .inject(uplink_packet(TEID, UE_IP, SERVER, 100), 10)
        .await;
    t.switch.inject(downlink_packet(SERVER, UE_IP, 100), 10).await;
    t.poll().await?;

    let report = t
        .collector
        .last_report()
        .await
        .ok_or(anyhow!("No usage report"))?;
    let tx = report
        .find(IMSI, "tx_match")
        .ok_or(anyhow!("No usage for tx_match"))?;
    assert_eq!(tx.bytes_tx, 1000);
    let rx = report
        .find(IMSI, "rx_match")
        .ok_or(anyhow!("No usage for rx_match"))?;
    assert_eq!(rx.bytes_rx, 1000 - 14 * 10);
    Ok(())
}
