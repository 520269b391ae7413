//! registers - how pipeline state is carried between tables

use crate::data::FlowDirection;
use openflow::{Action, FieldKind, FlowMatch};

pub const DIRECTION_REG: u8 = 1;
pub const RULE_NUM_REG: u8 = 2;
pub const DROP_REG: u8 = 3;
pub const RULE_VERSION_REG: u8 = 4;
pub const PASSTHROUGH_REG: u8 = 6;
pub const TEID_REG: u8 = 8;

pub const DROP_FLAG: u32 = 0x1;
/// Traffic tagged with this is forwarded but not billed.
pub const PASSTHROUGH_FLAG: u32 = 0x1;

pub const ETH_TYPE_IPV4: u64 = 0x0800;
pub const ETH_TYPE_IPV6: u64 = 0x86dd;
pub const IP_PROTO_TCP: u8 = 6;
pub const IP_PROTO_UDP: u8 = 17;

/// Direction relative to the subscriber.  Uplink traffic leaves the UE (OUT).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Direction {
    Out,
    In,
}

impl Direction {
    pub fn reg_value(&self) -> u32 {
        match self {
            Direction::Out => 0x01,
            Direction::In => 0x10,
        }
    }

    pub fn from_reg(value: u32) -> Option<Self> {
        match value {
            0x01 => Some(Direction::Out),
            0x10 => Some(Direction::In),
            _ => None,
        }
    }

    pub fn both() -> [Direction; 2] {
        [Direction::Out, Direction::In]
    }
}

impl From<FlowDirection> for Direction {
    fn from(d: FlowDirection) -> Self {
        match d {
            FlowDirection::Uplink => Direction::Out,
            FlowDirection::Downlink => Direction::In,
        }
    }
}

/// Match all traffic of one subscriber in one direction.
pub fn subscriber_match(imsi: u64, direction: Direction) -> FlowMatch {
    FlowMatch::new()
        .with_int(FieldKind::Metadata, imsi)
        .with_reg(DIRECTION_REG, direction.reg_value())
}

/// Match the traffic of one subscriber tunnel in one direction.
pub fn tunnel_match(imsi: u64, direction: Direction, teid: u32) -> FlowMatch {
    subscriber_match(imsi, direction).with_reg(TEID_REG, teid)
}

/// Match every flow of one subscriber tunnel, in both directions.  Only useful for deletes.
pub fn tunnel_scope(imsi: u64, teid: u32) -> FlowMatch {
    FlowMatch::new()
        .with_int(FieldKind::Metadata, imsi)
        .with_reg(TEID_REG, teid)
}

/// Tag a packet with the subscriber, direction and tunnel.
pub fn subscriber_tags(imsi: u64, direction: Direction, teid: u32) -> Vec<Action> {
    vec![
        Action::set_int(FieldKind::Metadata, imsi),
        Action::load_reg(DIRECTION_REG, direction.reg_value()),
        Action::load_reg(TEID_REG, teid),
    ]
}
