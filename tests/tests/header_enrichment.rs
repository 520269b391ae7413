use anyhow::Result;
use openflow::Verdict;
use pipelined::{
    Config, FlowDirection, HeaderEnrichment, PipelinedService, PolicyRule, RequestOrigin,
    ResultCode, SetupPolicyRequest, app_names,
};
use pipelined_tests::{framework::*, http_request, proxied_request, uplink_packet};
use std::net::Ipv4Addr;

const IMSI: &str = "IMSI001010000000006";
const TEID: u32 = 0x6001;
const UE_IP: Ipv4Addr = Ipv4Addr::new(192, 168, 128, 60);
const SERVER: Ipv4Addr = Ipv4Addr::new(45, 10, 0, 1);
const HE_PRIORITY: u16 = 10;

fn enriched(mut rule: PolicyRule, urls: &[&str]) -> PolicyRule {
    rule.he = Some(HeaderEnrichment {
        urls: urls.iter().map(|u| u.to_string()).collect(),
    });
    rule
}

#[async_std::test]
async fn http_detours_through_proxy() -> Result<()> {
    let t = init().await?;
    t.attach(IMSI, TEID, UE_IP).await?;
    t.activate(activate_request(
        IMSI,
        TEID,
        UE_IP,
        vec![versioned(
            enriched(
                permit_rule("he_rule", 10, FlowDirection::Uplink, "45.10.0.0/25"),
                &["abc.com"],
            ),
            1,
        )],
        RequestOrigin::Gx,
    ))
    .await?;

    assert_eq!(t.flows_at(app_names::HE, HE_PRIORITY).await?.len(), 2);
    assert_eq!(
        t.proxy.urls(UE_IP, "he_rule"),
        Some(vec!["abc.com".to_string()])
    );

    let config = Config::default();
    let verdict = t.switch.inject(http_request(TEID, UE_IP, SERVER, 120), 1).await;
    assert_eq!(verdict, Verdict::Output(config.proxy_port));

    // Back from the proxy, the request is enforced and counted like any other
    let verdict = t.switch.inject(proxied_request(UE_IP, SERVER, 150), 1).await;
    assert_eq!(verdict, Verdict::Output(config.uplink_port));
    t.poll().await?;
    let record = t.collector.last_record(IMSI, "he_rule").await.unwrap();
    assert_eq!(record.bytes_tx, 150);

    // Other traffic of the rule goes straight out
    let verdict = t.switch.inject(uplink_packet(TEID, UE_IP, SERVER, 60), 1).await;
    assert_eq!(verdict, Verdict::Output(config.uplink_port));
    Ok(())
}

#[async_std::test]
async fn only_uplink_rules_with_urls_are_enriched() -> Result<()> {
    let t = init().await?;
    t.attach(IMSI, TEID, UE_IP).await?;
    t.activate(activate_request(
        IMSI,
        TEID,
        UE_IP,
        vec![
            versioned(
                enriched(
                    permit_rule("downlink", 10, FlowDirection::Downlink, "45.10.0.0/25"),
                    &["abc.com"],
                ),
                1,
            ),
            versioned(
                enriched(
                    permit_rule("no_urls", 20, FlowDirection::Uplink, "45.20.0.0/16"),
                    &[],
                ),
                1,
            ),
            versioned(
                permit_rule("plain", 30, FlowDirection::Uplink, "45.30.0.0/16"),
                1,
            ),
        ],
        RequestOrigin::Gx,
    ))
    .await?;

    assert!(t.flows_at(app_names::HE, HE_PRIORITY).await?.is_empty());
    assert!(!t.proxy.is_enriching(UE_IP));
    Ok(())
}

#[async_std::test]
async fn enrichment_removed_with_rules() -> Result<()> {
    let t = init().await?;
    t.attach(IMSI, TEID, UE_IP).await?;
    t.activate(activate_request(
        IMSI,
        TEID,
        UE_IP,
        vec![
            versioned(
                enriched(
                    permit_rule("rule1", 10, FlowDirection::Uplink, "45.10.0.0/25"),
                    &["abc.com"],
                ),
                1,
            ),
            versioned(
                enriched(
                    permit_rule("rule2", 20, FlowDirection::Uplink, "45.20.0.0/16"),
                    &["xyz.com", "abc.com"],
                ),
                1,
            ),
        ],
        RequestOrigin::Gx,
    ))
    .await?;
    assert_eq!(t.flows_at(app_names::HE, HE_PRIORITY).await?.len(), 4);

    let result = t
        .rpc
        .deactivate_flows(deactivate_request(
            IMSI,
            TEID,
            UE_IP,
            &[("rule1", 1)],
            RequestOrigin::Gx,
        ))
        .await?;
    assert_eq!(result, ResultCode::Success);
    assert_eq!(t.flows_at(app_names::HE, HE_PRIORITY).await?.len(), 2);
    assert_eq!(t.proxy.urls(UE_IP, "rule1"), None);
    assert!(t.proxy.urls(UE_IP, "rule2").is_some());
    let verdict = t.switch.inject(http_request(TEID, UE_IP, SERVER, 120), 1).await;
    assert_ne!(verdict, Verdict::Output(Config::default().proxy_port));

    // Removing the same rule again changes nothing
    let result = t
        .rpc
        .deactivate_flows(deactivate_request(
            IMSI,
            TEID,
            UE_IP,
            &[("rule1", 1)],
            RequestOrigin::Gx,
        ))
        .await?;
    assert_eq!(result, ResultCode::Success);
    assert_eq!(t.flows_at(app_names::HE, HE_PRIORITY).await?.len(), 2);

    let result = t
        .rpc
        .deactivate_flows(deactivate_request(IMSI, TEID, UE_IP, &[], RequestOrigin::Gx))
        .await?;
    assert_eq!(result, ResultCode::Success);
    assert!(t.flows_at(app_names::HE, HE_PRIORITY).await?.is_empty());
    assert!(!t.proxy.is_enriching(UE_IP));
    Ok(())
}

#[async_std::test]
async fn replay_reinstalls_enrichment() -> Result<()> {
    let t = init().await?;
    t.attach(IMSI, TEID, UE_IP).await?;
    let rule = enriched(
        permit_rule("he_rule", 10, FlowDirection::Uplink, "45.10.0.0/25"),
        &["abc.com"],
    );
    t.activate(activate_request(
        IMSI,
        TEID,
        UE_IP,
        vec![versioned(rule.clone(), 1)],
        RequestOrigin::Gx,
    ))
    .await?;

    let result = t
        .rpc
        .setup_policy_flows(SetupPolicyRequest {
            requests: vec![activate_request(
                IMSI,
                TEID,
                UE_IP,
                vec![versioned(rule, 1)],
                RequestOrigin::Gx,
            )],
            epoch: t.pipelined.epoch(),
        })
        .await?;
    assert_eq!(result, ResultCode::Success);
    assert_eq!(t.flows_at(app_names::HE, HE_PRIORITY).await?.len(), 2);
    let verdict = t.switch.inject(http_request(TEID, UE_IP, SERVER, 120), 1).await;
    assert_eq!(verdict, Verdict::Output(Config::default().proxy_port));
    Ok(())
}

#[async_std::test]
async fn refused_urls_leave_rule_unenriched() -> Result<()> {
    let t = init().await?;
    t.attach(IMSI, TEID, UE_IP).await?;
    t.proxy.set_refusing(true);
    t.activate(activate_request(
        IMSI,
        TEID,
        UE_IP,
        vec![versioned(
            enriched(
                permit_rule("he_rule", 10, FlowDirection::Uplink, "45.10.0.0/25"),
                &["abc.com"],
            ),
            1,
        )],
        RequestOrigin::Gx,
    ))
    .await?;

    assert!(t.flows_at(app_names::HE, HE_PRIORITY).await?.is_empty());
    assert_eq!(t.flows_at(app_names::ENFORCEMENT, 10).await?.len(), 1);
    let verdict = t.switch.inject(http_request(TEID, UE_IP, SERVER, 120), 1).await;
    assert_eq!(verdict, Verdict::Output(Config::default().uplink_port));
    Ok(())
}
