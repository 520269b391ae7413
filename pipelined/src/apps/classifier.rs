//! classifier - GTP tunnel termination at the head of the pipeline, and the egress table

use crate::data::{UeSessionSet, UeSessionState, encode_imsi};
use crate::datapath::FlowProgrammer;
use crate::datapath::registers::*;
use crate::tables::EGRESS_TABLE;
use anyhow::Result;
use dashmap::DashMap;
use openflow::{Action, FieldKind, FieldValue, FlowMatch, FlowMod, TableId};
use slog::{Logger, info};
use std::net::Ipv4Addr;
use std::sync::Arc;

const TUNNEL_PRIORITY: u16 = 10;
const PROXY_PRIORITY: u16 = 5;

#[derive(Clone)]
pub struct Classifier {
    flows: FlowProgrammer,
    table: TableId,
    next_table: TableId,
    uplink_port: u32,
    gtp_port: u32,
    // Set when header enrichment runs.  Traffic coming back from the proxy enters here.
    proxy_port: Option<u32>,
    // Installed sessions by UE address, replayed when the switch reconnects.
    sessions: Arc<DashMap<Ipv4Addr, UeSessionSet>>,
    logger: Logger,
}

impl Classifier {
    pub fn new(
        flows: FlowProgrammer,
        table: TableId,
        next_table: TableId,
        uplink_port: u32,
        gtp_port: u32,
        proxy_port: Option<u32>,
        logger: &Logger,
    ) -> Self {
        Classifier {
            flows,
            table,
            next_table,
            uplink_port,
            gtp_port,
            proxy_port,
            sessions: Arc::new(DashMap::new()),
            logger: logger.clone(),
        }
    }

    /// Unknown tunnels are dropped.  Traffic back from the enrichment proxy carries on down
    /// the pipeline.  The egress table sends uplink traffic out of the SGi port and downlink
    /// traffic into the tunnel port.
    pub async fn install_default_flows(&self) -> Result<()> {
        let mut flow_mods = vec![FlowMod::add(self.table, 0, 0, FlowMatch::new(), vec![])];
        if let Some(proxy_port) = self.proxy_port {
            flow_mods.push(FlowMod::add(
                self.table,
                PROXY_PRIORITY,
                0,
                FlowMatch::new().with_int(FieldKind::InPort, proxy_port as u64),
                vec![Action::GotoTable(self.next_table)],
            ));
        }
        flow_mods.extend([
            FlowMod::add(
                EGRESS_TABLE,
                0,
                0,
                FlowMatch::new().with_reg(DIRECTION_REG, Direction::Out.reg_value()),
                vec![Action::Output(self.uplink_port)],
            ),
            FlowMod::add(
                EGRESS_TABLE,
                0,
                0,
                FlowMatch::new().with_reg(DIRECTION_REG, Direction::In.reg_value()),
                vec![Action::Output(self.gtp_port)],
            ),
        ]);
        self.flows.add_flows(flow_mods).await
    }

    pub async fn update_ue_state(&self, session: &UeSessionSet) -> Result<()> {
        let imsi = encode_imsi(&session.subscriber_id)?;
        let (uplink, downlink) = self.tunnel_flows(imsi, session);
        match session.state {
            UeSessionState::Install => {
                info!(
                    self.logger,
                    "Tunnel for {} ue {} in {:#x} out {:#x} enb {}",
                    session.subscriber_id,
                    session.ue_ipv4,
                    session.in_teid,
                    session.out_teid,
                    session.enb_ip
                );
                self.flows.add_flows(vec![uplink, downlink]).await?;
                self.sessions.insert(session.ue_ipv4, session.clone());
            }
            UeSessionState::Remove => {
                info!(
                    self.logger,
                    "Removing tunnel for {} ue {}", session.subscriber_id, session.ue_ipv4
                );
                self.flows
                    .add_flows(vec![
                        FlowMod::delete(self.table, uplink.flow_match, None),
                        FlowMod::delete(self.table, downlink.flow_match, None),
                    ])
                    .await?;
                self.sessions.remove(&session.ue_ipv4);
            }
        }
        Ok(())
    }

    /// Put back the tunnel flows of every known session.
    pub async fn restore_sessions(&self) -> Result<()> {
        let sessions: Vec<UeSessionSet> = self.sessions.iter().map(|s| s.value().clone()).collect();
        let mut flow_mods = vec![];
        for session in sessions.iter() {
            let imsi = encode_imsi(&session.subscriber_id)?;
            let (uplink, downlink) = self.tunnel_flows(imsi, session);
            flow_mods.push(uplink);
            flow_mods.push(downlink);
        }
        self.flows.add_flows(flow_mods).await
    }

    fn tunnel_flows(&self, imsi: u64, session: &UeSessionSet) -> (FlowMod, FlowMod) {
        let mut uplink_actions = subscriber_tags(imsi, Direction::Out, session.in_teid);
        uplink_actions.push(Action::GotoTable(self.next_table));
        let uplink = FlowMod::add(
            self.table,
            TUNNEL_PRIORITY,
            0,
            FlowMatch::new()
                .with_int(FieldKind::InPort, self.gtp_port as u64)
                .with_int(FieldKind::TunnelId, session.in_teid as u64),
            uplink_actions,
        );

        let mut downlink_actions = vec![
            Action::set_int(FieldKind::TunnelId, session.out_teid as u64),
            Action::SetField(FieldKind::TunnelIpv4Dst, FieldValue::host_v4(session.enb_ip)),
        ];
        downlink_actions.extend(subscriber_tags(imsi, Direction::In, session.in_teid));
        downlink_actions.push(Action::GotoTable(self.next_table));
        let downlink = FlowMod::add(
            self.table,
            TUNNEL_PRIORITY,
            0,
            FlowMatch::new()
                .with_int(FieldKind::InPort, self.uplink_port as u64)
                .with_int(FieldKind::EthType, ETH_TYPE_IPV4)
                .with(FieldKind::Ipv4Dst, FieldValue::host_v4(session.ue_ipv4)),
            downlink_actions,
        );
        (uplink, downlink)
    }
}
