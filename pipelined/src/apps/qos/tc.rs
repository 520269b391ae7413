//! tc - QoS queues as Linux traffic-control HTB classes

use super::QosBackend;
use crate::datapath::registers::Direction;
use anyhow::{Result, bail};
use async_trait::async_trait;
use openflow::{Action, FieldKind};
use slog::{Logger, debug};
use std::process::Command;
use std::sync::Arc;

const ROOT_QID: u32 = 0xfffe;
const MIN_RATE: u64 = 12000;

/// Runs one `tc` invocation and returns its stdout.
#[async_trait]
pub trait TcRunner: Send + Sync {
    async fn run(&self, args: Vec<String>) -> Result<String>;
}

pub struct SystemTc;

#[async_trait]
impl TcRunner for SystemTc {
    async fn run(&self, args: Vec<String>) -> Result<String> {
        let output = async_std::task::spawn_blocking(move || {
            Command::new("tc").args(args.iter()).output()
        })
        .await?;
        if !output.status.success() {
            bail!(
                "tc failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }
}

pub struct TcBackend {
    uplink_iface: String,
    downlink_iface: String,
    max_rate: u64,
    runner: Arc<dyn TcRunner>,
    logger: Logger,
}

impl TcBackend {
    pub fn new(
        uplink_iface: &str,
        downlink_iface: &str,
        max_rate: u64,
        runner: Arc<dyn TcRunner>,
        logger: &Logger,
    ) -> Self {
        TcBackend {
            uplink_iface: uplink_iface.to_string(),
            downlink_iface: downlink_iface.to_string(),
            max_rate,
            runner,
            logger: logger.clone(),
        }
    }

    fn iface(&self, direction: Direction) -> &str {
        match direction {
            Direction::Out => &self.uplink_iface,
            Direction::In => &self.downlink_iface,
        }
    }

    async fn tc(&self, command: String) -> Result<String> {
        debug!(self.logger, "{command}");
        let args = command
            .split_whitespace()
            .skip(1)
            .map(|s| s.to_string())
            .collect();
        self.runner.run(args).await
    }
}

#[async_trait]
impl QosBackend for TcBackend {
    async fn setup(&self) -> Result<()> {
        for iface in [&self.uplink_iface, &self.downlink_iface] {
            // The root qdisc survives restarts, so failure to re-add it is expected.
            let _ = self
                .tc(format!("tc qdisc add dev {iface} root handle 1: htb"))
                .await;
            let _ = self
                .tc(format!(
                    "tc class add dev {iface} parent 1: classid 1:{ROOT_QID:x} htb rate {} ceil {}",
                    self.max_rate, self.max_rate
                ))
                .await;
        }
        Ok(())
    }

    async fn create(
        &self,
        qid: u32,
        direction: Direction,
        ceiling: u64,
        rate: u64,
        parent: Option<u32>,
    ) -> Result<()> {
        let iface = self.iface(direction);
        let parent = parent.unwrap_or(ROOT_QID);
        let rate = rate.max(MIN_RATE);
        self.tc(format!(
            "tc class add dev {iface} parent 1:{parent:x} classid 1:{qid:x} htb rate {rate} ceil {ceiling}"
        ))
        .await?;
        self.tc(format!("tc qdisc add dev {iface} parent 1:{qid:x} fq_codel"))
            .await?;
        // tc reads the fw handle as decimal, and it must equal the packet mark.
        self.tc(format!(
            "tc filter add dev {iface} protocol ip parent 1: prio 1 handle {qid} fw flowid 1:{qid:x}"
        ))
        .await?;
        Ok(())
    }

    async fn delete(&self, qid: u32, direction: Direction) -> Result<()> {
        let iface = self.iface(direction);
        self.tc(format!(
            "tc filter del dev {iface} protocol ip parent 1: prio 1 handle {qid} fw flowid 1:{qid:x}"
        ))
        .await?;
        self.tc(format!("tc class del dev {iface} classid 1:{qid:x}"))
            .await?;
        Ok(())
    }

    async fn read_all(&self) -> Result<Vec<(u32, Option<u32>, Direction)>> {
        let mut all = vec![];
        for direction in Direction::both() {
            let output = self
                .tc(format!("tc class show dev {}", self.iface(direction)))
                .await?;
            for (qid, parent) in parse_tc_classes(&output) {
                all.push((qid, parent, direction));
            }
        }
        Ok(all)
    }

    fn actions(&self, qid: u32) -> Vec<Action> {
        vec![Action::set_int(FieldKind::PktMark, qid as u64)]
    }
}

/// Parse `tc class show` output into (class id, parent id).  The root class is omitted and
/// a class directly under the root has no parent.
pub fn parse_tc_classes(output: &str) -> Vec<(u32, Option<u32>)> {
    let minor = |handle: &str| {
        handle
            .split_once(':')
            .and_then(|(_, m)| u32::from_str_radix(m, 16).ok())
    };
    let mut classes = vec![];
    for line in output.lines() {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        if tokens.len() < 3 || tokens[0] != "class" || tokens[1] != "htb" {
            continue;
        }
        let Some(qid) = minor(tokens[2]) else {
            continue;
        };
        if qid == ROOT_QID {
            continue;
        }
        let parent = tokens
            .iter()
            .position(|t| *t == "parent")
            .and_then(|i| tokens.get(i + 1))
            .and_then(|p| minor(*p))
            .filter(|p| *p != ROOT_QID);
        classes.push((qid, parent));
    }
    classes
}
