mod id_manager;
mod meter;
mod qos_manager;
mod tc;

pub use id_manager::IdManager;
pub use meter::MeterBackend;
pub use qos_manager::{QosKey, QosManager, QueueEntry};
pub use tc::{SystemTc, TcBackend, TcRunner, parse_tc_classes};

use crate::datapath::registers::Direction;
use anyhow::Result;
use async_trait::async_trait;
use openflow::Action;

/// Where QoS queues are realised.
#[async_trait]
pub trait QosBackend: Send + Sync {
    async fn setup(&self) -> Result<()>;

    /// Create queue `qid` with the given ceiling and guaranteed rate in bits per second.
    async fn create(
        &self,
        qid: u32,
        direction: Direction,
        ceiling: u64,
        rate: u64,
        parent: Option<u32>,
    ) -> Result<()>;

    async fn delete(&self, qid: u32, direction: Direction) -> Result<()>;

    /// Every queue currently programmed, as (qid, parent, direction).
    async fn read_all(&self) -> Result<Vec<(u32, Option<u32>, Direction)>>;

    /// Flow actions that steer a packet into queue `qid`.
    fn actions(&self, qid: u32) -> Vec<Action>;
}
