//! check_quota - admit or block a subscriber according to its quota state

use super::ue_mac::parse_mac;
use crate::data::{QuotaUpdateType, SubscriberQuotaUpdate, encode_imsi};
use crate::datapath::FlowProgrammer;
use crate::datapath::registers::*;
use anyhow::Result;
use openflow::{Action, FieldKind, FieldValue, FlowMatch, FlowMod, TableId};
use slog::{Logger, info};

const QUOTA_PRIORITY: u16 = 10;

#[derive(Clone)]
pub struct CheckQuotaController {
    flows: FlowProgrammer,
    table: TableId,
    next_table: TableId,
    logger: Logger,
}

impl CheckQuotaController {
    pub fn new(flows: FlowProgrammer, table: TableId, next_table: TableId, logger: &Logger) -> Self {
        CheckQuotaController {
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

    pub async fn update_subscriber_quota_state(&self, updates: &[SubscriberQuotaUpdate]) -> Result<()> {
        let mut flow_mods = vec![];
        for update in updates.iter() {
            let imsi = encode_imsi(&update.sid)?;
            let mac = parse_mac(&update.mac_addr)?;
            info!(
                self.logger,
                "Quota state of {} ({}) is {:?}", update.sid, update.mac_addr, update.update_type
            );
            // Forward and drop flows share a match, so each replaces the other.
            let actions = match update.update_type {
                QuotaUpdateType::ValidQuota => Some(vec![Action::GotoTable(self.next_table)]),
                QuotaUpdateType::NoQuota => Some(vec![]),
                QuotaUpdateType::Terminate => None,
            };
            for flow_match in Self::subscriber_matches(imsi, mac) {
                flow_mods.push(match &actions {
                    Some(actions) => {
                        FlowMod::add(self.table, QUOTA_PRIORITY, 0, flow_match, actions.clone())
                    }
                    None => FlowMod::delete(self.table, flow_match, None),
                });
            }
        }
        self.flows.add_flows(flow_mods).await
    }

    pub async fn handle_restart(&self, updates: &[SubscriberQuotaUpdate]) -> Result<()> {
        self.flows.delete_all_flows_in_table(self.table).await?;
        self.install_default_flows().await?;
        self.update_subscriber_quota_state(updates).await
    }

    fn subscriber_matches(imsi: u64, mac: [u8; 6]) -> [FlowMatch; 2] {
        [
            subscriber_match(imsi, Direction::Out).with(FieldKind::EthSrc, FieldValue::Mac(mac)),
            subscriber_match(imsi, Direction::In).with(FieldKind::EthDst, FieldValue::Mac(mac)),
        ]
    }
}
