//! meter - QoS queues as OpenFlow meters

use super::QosBackend;
use crate::datapath::FlowProgrammer;
use crate::datapath::registers::Direction;
use anyhow::Result;
use async_trait::async_trait;
use openflow::{Action, MeterCommand, MeterMod};
use std::time::Duration;

pub struct MeterBackend {
    flows: FlowProgrammer,
    reply_timeout: Duration,
}

impl MeterBackend {
    pub fn new(flows: FlowProgrammer, reply_timeout: Duration) -> Self {
        MeterBackend {
            flows,
            reply_timeout,
        }
    }
}

#[async_trait]
impl QosBackend for MeterBackend {
    async fn setup(&self) -> Result<()> {
        Ok(())
    }

    /// Meters are not hierarchical and have no guaranteed rate, so only the ceiling is used.
    async fn create(
        &self,
        qid: u32,
        _direction: Direction,
        ceiling: u64,
        _rate: u64,
        _parent: Option<u32>,
    ) -> Result<()> {
        self.flows
            .send_meter_mods(vec![MeterMod {
                command: MeterCommand::Add,
                meter_id: qid,
                rate_kbps: ceiling / 1000,
                burst_size: 0,
            }])
            .await
    }

    async fn delete(&self, qid: u32, _direction: Direction) -> Result<()> {
        self.flows
            .send_meter_mods(vec![MeterMod {
                command: MeterCommand::Delete,
                meter_id: qid,
                rate_kbps: 0,
                burst_size: 0,
            }])
            .await
    }

    async fn read_all(&self) -> Result<Vec<(u32, Option<u32>, Direction)>> {
        // Meters do not record a direction.  Both directions delete the same meter.
        Ok(self
            .flows
            .query_meters(self.reply_timeout)
            .await?
            .into_iter()
            .map(|m| (m.meter_id, None, Direction::Out))
            .collect())
    }

    fn actions(&self, qid: u32) -> Vec<Action> {
        vec![Action::Meter(qid)]
    }
}
