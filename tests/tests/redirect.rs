use anyhow::Result;
use openflow::Verdict;
use pipelined::{
    Config, PolicyRule, RedirectAddressType, RedirectInformation, RequestOrigin, app_names,
};
use pipelined_tests::{framework::*, uplink_packet};
use std::net::Ipv4Addr;

const IMSI: &str = "IMSI001010000000003";
const TEID: u32 = 0x3001;
const UE_IP: Ipv4Addr = Ipv4Addr::new(192, 168, 128, 30);
const PORTAL_HOST: &str = "portal.example.com";
const PORTAL_IP: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 50);
const PRIORITY: u16 = 100;

fn redirect_rule() -> PolicyRule {
    let mut rule = PolicyRule::new("redirect", PRIORITY, vec![]);
    rule.redirect = Some(RedirectInformation {
        support: true,
        address_type: RedirectAddressType::Url,
        server_address: format!("http://{PORTAL_HOST}/landing"),
    });
    rule
}

#[async_std::test]
async fn redirect_waits_for_portal_address() -> Result<()> {
    let t = init().await?;
    t.resolver.add_answer(PORTAL_HOST, vec![PORTAL_IP]);
    t.attach(IMSI, TEID, UE_IP).await?;
    t.activate(activate_request(
        IMSI,
        TEID,
        UE_IP,
        vec![versioned(redirect_rule(), 1)],
        RequestOrigin::Gx,
    ))
    .await?;

    // Until the portal resolves, only DNS gets through
    let dns_bypass = t.flows_at(app_names::ENFORCEMENT, PRIORITY + 3).await?;
    assert_eq!(dns_bypass.len(), 4);
    assert_eq!(t.flows_at(app_names::ENFORCEMENT, PRIORITY).await?.len(), 2);
    assert!(t.flows_at(app_names::ENFORCEMENT, PRIORITY + 2).await?.is_empty());
    assert!(t.flows_at(app_names::ENFORCEMENT, PRIORITY + 1).await?.is_empty());

    let stats_table = t.table(app_names::ENFORCEMENT_STATS).await?;
    let verdict = t
        .switch
        .inject(uplink_packet(TEID, UE_IP, PORTAL_IP, 60), 1)
        .await;
    assert_eq!(verdict, Verdict::Dropped { table: stats_table });

    // Answer the lookup
    t.resolver.open();
    let t = &t;
    wait_until("portal allow flows", || async move {
        t.flows_at(app_names::ENFORCEMENT, PRIORITY + 2)
            .await
            .is_ok_and(|flows| flows.len() == 2)
    })
    .await?;
    assert_eq!(t.flows_at(app_names::ENFORCEMENT, PRIORITY + 1).await?.len(), 2);

    // DNS bypass untouched
    let after = t.flows_at(app_names::ENFORCEMENT, PRIORITY + 3).await?;
    assert_eq!(after.len(), 4);
    for flow in dns_bypass.iter() {
        assert!(after.iter().any(|f| f.flow_match == flow.flow_match));
    }

    // The portal is now reachable, everything else still dropped
    let verdict = t
        .switch
        .inject(uplink_packet(TEID, UE_IP, PORTAL_IP, 60), 1)
        .await;
    assert_eq!(verdict, Verdict::Output(Config::default().uplink_port));
    let verdict = t
        .switch
        .inject(uplink_packet(TEID, UE_IP, Ipv4Addr::new(1, 1, 1, 1), 60), 1)
        .await;
    assert_eq!(verdict, Verdict::Dropped { table: stats_table });
    Ok(())
}

#[async_std::test]
async fn redirect_to_literal_address_installs_everything() -> Result<()> {
    let t = init().await?;
    t.attach(IMSI, TEID, UE_IP).await?;
    let mut rule = redirect_rule();
    rule.redirect = Some(RedirectInformation {
        support: true,
        address_type: RedirectAddressType::Ipv4,
        server_address: PORTAL_IP.to_string(),
    });
    t.activate(activate_request(
        IMSI,
        TEID,
        UE_IP,
        vec![versioned(rule, 1)],
        RequestOrigin::Gx,
    ))
    .await?;

    assert_eq!(t.flows_at(app_names::ENFORCEMENT, PRIORITY + 3).await?.len(), 4);
    assert_eq!(t.flows_at(app_names::ENFORCEMENT, PRIORITY + 2).await?.len(), 2);
    assert_eq!(t.flows_at(app_names::ENFORCEMENT, PRIORITY + 1).await?.len(), 2);
    assert_eq!(t.flows_at(app_names::ENFORCEMENT, PRIORITY).await?.len(), 2);
    Ok(())
}
