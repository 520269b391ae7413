//! ue_mac - subscriber identification by MAC address

use crate::data::{RpcError, UeMacFlowRequest, encode_imsi};
use crate::datapath::FlowProgrammer;
use crate::datapath::registers::*;
use anyhow::Result;
use openflow::{Action, FieldKind, FieldValue, FlowMatch, FlowMod, TableId};
use slog::{Logger, info};

const MAC_PRIORITY: u16 = 10;
const DHCP_PRIORITY: u16 = 20;
const DHCP_SERVER_PORT: u64 = 67;
const DHCP_CLIENT_PORT: u64 = 68;

/// Parse "aa:bb:cc:dd:ee:ff".
pub fn parse_mac(mac: &str) -> Result<[u8; 6], RpcError> {
    let bytes = hex::decode(mac.replace([':', '-'], ""))
        .map_err(|e| RpcError::InvalidArgument(format!("bad MAC address {mac} - {e}")))?;
    bytes.try_into().map_err(|b: Vec<u8>| {
        RpcError::InvalidArgument(format!("MAC address {mac} has {} bytes, not 6", b.len()))
    })
}

#[derive(Clone)]
pub struct UeMacController {
    flows: FlowProgrammer,
    table: TableId,
    next_table: TableId,
    logger: Logger,
}

impl UeMacController {
    pub fn new(flows: FlowProgrammer, table: TableId, next_table: TableId, logger: &Logger) -> Self {
        UeMacController {
            flows,
            table,
            next_table,
            logger: logger.clone(),
        }
    }

    pub async fn install_default_flows(&self) -> Result<()> {
        self.flows
            .add_flows(vec![FlowMod::add(
                self.table,
                0,
                0,
                FlowMatch::new(),
                vec![Action::GotoTable(self.next_table)],
            )])
            .await
    }

    pub async fn add_ue_mac_flow(&self, request: &UeMacFlowRequest) -> Result<()> {
        let imsi = encode_imsi(&request.sid)?;
        let mac = parse_mac(&request.mac_addr)?;
        info!(self.logger, "Adding MAC {} for {}", request.mac_addr, request.sid);
        self.flows.add_flows(self.mac_flows(imsi, mac)).await
    }

    pub async fn delete_ue_mac_flow(&self, request: &UeMacFlowRequest) -> Result<()> {
        let mac = parse_mac(&request.mac_addr)?;
        info!(self.logger, "Deleting MAC {} of {}", request.mac_addr, request.sid);
        self.flows
            .add_flows(vec![
                FlowMod::delete(
                    self.table,
                    FlowMatch::new().with(FieldKind::EthSrc, FieldValue::Mac(mac)),
                    None,
                ),
                FlowMod::delete(
                    self.table,
                    FlowMatch::new().with(FieldKind::EthDst, FieldValue::Mac(mac)),
                    None,
                ),
            ])
            .await
    }

    /// Replace the table contents with flows for exactly the given MACs.
    pub async fn handle_restart(&self, requests: &[UeMacFlowRequest]) -> Result<()> {
        self.flows.delete_all_flows_in_table(self.table).await?;
        self.install_default_flows().await?;
        let mut flow_mods = vec![];
        for request in requests.iter() {
            let imsi = encode_imsi(&request.sid)?;
            let mac = parse_mac(&request.mac_addr)?;
            flow_mods.extend(self.mac_flows(imsi, mac));
        }
        self.flows.add_flows(flow_mods).await
    }

    fn mac_flows(&self, imsi: u64, mac: [u8; 6]) -> Vec<FlowMod> {
        let tag = |direction: Direction, passthrough: bool| {
            let mut actions = vec![
                Action::set_int(FieldKind::Metadata, imsi),
                Action::load_reg(DIRECTION_REG, direction.reg_value()),
            ];
            if passthrough {
                actions.push(Action::load_reg(PASSTHROUGH_REG, PASSTHROUGH_FLAG));
            }
            actions.push(Action::GotoTable(self.next_table));
            actions
        };
        let from_ue = FlowMatch::new().with(FieldKind::EthSrc, FieldValue::Mac(mac));
        let to_ue = FlowMatch::new().with(FieldKind::EthDst, FieldValue::Mac(mac));
        let dhcp = |m: FlowMatch, src: u64, dst: u64| {
            m.with_int(FieldKind::EthType, ETH_TYPE_IPV4)
                .with_int(FieldKind::IpProto, IP_PROTO_UDP as u64)
                .with_int(FieldKind::UdpSrc, src)
                .with_int(FieldKind::UdpDst, dst)
        };
        vec![
            FlowMod::add(self.table, MAC_PRIORITY, 0, from_ue.clone(), tag(Direction::Out, false)),
            FlowMod::add(self.table, MAC_PRIORITY, 0, to_ue.clone(), tag(Direction::In, false)),
            // DHCP is not billed.
            FlowMod::add(
                self.table,
                DHCP_PRIORITY,
                0,
                dhcp(from_ue, DHCP_CLIENT_PORT, DHCP_SERVER_PORT),
                tag(Direction::Out, true),
            ),
            FlowMod::add(
                self.table,
                DHCP_PRIORITY,
                0,
                dhcp(to_ue, DHCP_SERVER_PORT, DHCP_CLIENT_PORT),
                tag(Direction::In, true),
            ),
        ]
    }
}
