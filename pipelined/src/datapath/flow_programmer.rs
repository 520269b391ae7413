use super::Datapath;
use anyhow::{Context, Result, bail};
use async_std::future::timeout;
use async_std::sync::Mutex;
use openflow::{
    FlowMatch, FlowMod, FlowStats, FlowStatsRequest, MeterConfig, MeterMod, MultipartBody,
    OfpMessage, TableId,
};
use slog::{Logger, warn};
use std::sync::Arc;
use std::time::Duration;

/// Sends flow and meter modifications to the datapath.  One batch is in flight at a time,
/// and a call returns only once the switch has acknowledged the batch with a barrier.
#[derive(Clone)]
pub struct FlowProgrammer {
    datapath: Datapath,
    batch_lock: Arc<Mutex<()>>,
    barrier_timeout: Duration,
    barrier_retries: u32,
    logger: Logger,
}

impl FlowProgrammer {
    pub fn new(
        datapath: Datapath,
        barrier_timeout: Duration,
        barrier_retries: u32,
        logger: &Logger,
    ) -> Self {
        FlowProgrammer {
            datapath,
            batch_lock: Arc::new(Mutex::new(())),
            barrier_timeout,
            barrier_retries,
            logger: logger.clone(),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.datapath.is_connected()
    }

    pub async fn send_batch(&self, messages: Vec<OfpMessage>) -> Result<()> {
        if messages.is_empty() {
            return Ok(());
        }
        let _guard = self.batch_lock.lock().await;
        let reply = self.datapath.batch(messages).await?;
        if let Ok(result) = timeout(self.barrier_timeout, reply.recv()).await {
            return result?;
        }

        for attempt in 1..=self.barrier_retries {
            warn!(
                self.logger,
                "No barrier reply within {:?}, retry {attempt}", self.barrier_timeout
            );
            let barrier = self.datapath.barrier().await?;
            if let Ok(result) = timeout(self.barrier_timeout, barrier.recv()).await {
                result??;
                // The later barrier completing means the batch was processed.  Pick up any
                // error the switch raised against it.
                return match reply.try_recv() {
                    Ok(result) => result,
                    Err(_) => Ok(()),
                };
            }
        }
        bail!("No barrier reply after {} retries", self.barrier_retries)
    }

    pub async fn add_flows(&self, flows: Vec<FlowMod>) -> Result<()> {
        self.send_batch(flows.into_iter().map(OfpMessage::FlowMod).collect())
            .await
    }

    /// Non-strict delete of every flow in `table` at least as specific as `flow_match`.
    pub async fn delete_flows(
        &self,
        table: TableId,
        flow_match: FlowMatch,
        cookie: Option<u64>,
    ) -> Result<()> {
        self.add_flows(vec![FlowMod::delete(table, flow_match, cookie)])
            .await
    }

    pub async fn delete_flow_strict(
        &self,
        table: TableId,
        priority: u16,
        cookie: u64,
        flow_match: FlowMatch,
    ) -> Result<()> {
        self.add_flows(vec![FlowMod::delete_strict(
            table, priority, cookie, flow_match,
        )])
        .await
    }

    pub async fn delete_all_flows_in_table(&self, table: TableId) -> Result<()> {
        self.delete_flows(table, FlowMatch::new(), None).await
    }

    pub async fn send_meter_mods(&self, meter_mods: Vec<MeterMod>) -> Result<()> {
        self.send_batch(meter_mods.into_iter().map(OfpMessage::MeterMod).collect())
            .await
    }

    /// Query flow statistics, buffering reply parts until the last one arrives.
    pub async fn query_flows(
        &self,
        request: FlowStatsRequest,
        part_timeout: Duration,
    ) -> Result<Vec<FlowStats>> {
        let parts = self
            .datapath
            .multipart(OfpMessage::FlowStatsRequest(request))
            .await?;
        let mut flows = vec![];
        loop {
            let part = timeout(part_timeout, parts.recv())
                .await
                .context("Timed out waiting for flow stats reply")??;
            let (body, more) = part?;
            let MultipartBody::Flow(mut stats) = body else {
                bail!("Unexpected multipart body in flow stats reply");
            };
            flows.append(&mut stats);
            if !more {
                return Ok(flows);
            }
        }
    }

    pub async fn query_meters(&self, part_timeout: Duration) -> Result<Vec<MeterConfig>> {
        let parts = self
            .datapath
            .multipart(OfpMessage::MeterConfigRequest)
            .await?;
        let mut meters = vec![];
        loop {
            let part = timeout(part_timeout, parts.recv())
                .await
                .context("Timed out waiting for meter config reply")??;
            let (body, more) = part?;
            let MultipartBody::MeterConfig(mut configs) = body else {
                bail!("Unexpected multipart body in meter config reply");
            };
            meters.append(&mut configs);
            if !more {
                return Ok(meters);
            }
        }
    }
}
