use ipnetwork::{Ipv4Network, Ipv6Network};
use std::collections::BTreeMap;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// The match fields and registers that the pipeline uses.  Ordering is significant: it
/// gives `FlowMatch` a canonical field order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum FieldKind {
    InPort,
    Metadata,
    TunnelId,
    TunnelIpv4Dst,
    EthSrc,
    EthDst,
    EthType,
    IpProto,
    Ipv4Src,
    Ipv4Dst,
    Ipv6Src,
    Ipv6Dst,
    TcpSrc,
    TcpDst,
    UdpSrc,
    UdpDst,
    PktMark,
    Reg(u8),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FieldValue {
    Int(u64),
    Mac([u8; 6]),
    Ipv4(Ipv4Network),
    Ipv6(Ipv6Network),
}

impl FieldValue {
    pub fn host_v4(addr: Ipv4Addr) -> Self {
        // A /32 is always a valid prefix.
        FieldValue::Ipv4(Ipv4Network::from(addr))
    }

    pub fn host_v6(addr: Ipv6Addr) -> Self {
        FieldValue::Ipv6(Ipv6Network::from(addr))
    }

    pub fn host(addr: IpAddr) -> Self {
        match addr {
            IpAddr::V4(a) => Self::host_v4(a),
            IpAddr::V6(a) => Self::host_v6(a),
        }
    }

    pub fn as_int(&self) -> Option<u64> {
        match self {
            FieldValue::Int(x) => Some(*x),
            _ => None,
        }
    }

    pub fn as_ip(&self) -> Option<IpAddr> {
        match self {
            FieldValue::Ipv4(n) => Some(IpAddr::V4(n.ip())),
            FieldValue::Ipv6(n) => Some(IpAddr::V6(n.ip())),
            _ => None,
        }
    }

    /// Whether a concrete packet value satisfies this (possibly prefix) match value.
    pub fn matches(&self, packet_value: &FieldValue) -> bool {
        match (self, packet_value) {
            (FieldValue::Ipv4(net), FieldValue::Ipv4(p)) => net.contains(p.ip()),
            (FieldValue::Ipv6(net), FieldValue::Ipv6(p)) => net.contains(p.ip()),
            (a, b) => a == b,
        }
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Int(x) => write!(f, "{x:#x}"),
            FieldValue::Mac(m) => write!(
                f,
                "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
                m[0], m[1], m[2], m[3], m[4], m[5]
            ),
            FieldValue::Ipv4(n) => write!(f, "{n}"),
            FieldValue::Ipv6(n) => write!(f, "{n}"),
        }
    }
}

/// A flow match as an ordered set of field assignments.  Two matches built from the same
/// assignments compare and hash equal regardless of the order they were added in.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct FlowMatch(BTreeMap<FieldKind, FieldValue>);

impl FlowMatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, kind: FieldKind, value: FieldValue) -> Self {
        self.0.insert(kind, value);
        self
    }

    pub fn with_int(self, kind: FieldKind, value: u64) -> Self {
        self.with(kind, FieldValue::Int(value))
    }

    pub fn with_reg(self, reg: u8, value: u32) -> Self {
        self.with_int(FieldKind::Reg(reg), value as u64)
    }

    pub fn set(&mut self, kind: FieldKind, value: FieldValue) {
        self.0.insert(kind, value);
    }

    pub fn get(&self, kind: FieldKind) -> Option<&FieldValue> {
        self.0.get(&kind)
    }

    pub fn get_int(&self, kind: FieldKind) -> Option<u64> {
        self.0.get(&kind).and_then(FieldValue::as_int)
    }

    pub fn reg(&self, reg: u8) -> Option<u32> {
        self.get_int(FieldKind::Reg(reg)).map(|x| x as u32)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&FieldKind, &FieldValue)> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Every field of `self` is present in `other` with the same value.  This is the
    /// OpenFlow non-strict delete rule: a delete with match M removes flows at least as
    /// specific as M.
    pub fn is_subset_of(&self, other: &FlowMatch) -> bool {
        self.0.iter().all(|(k, v)| other.0.get(k) == Some(v))
    }

    /// Whether a packet carrying these field values would hit a flow with this match.
    pub fn matches_packet(&self, packet: &Packet) -> bool {
        self.0.iter().all(|(k, v)| {
            packet
                .fields
                .get(k)
                .map(|pv| v.matches(pv))
                .unwrap_or(false)
        })
    }
}

impl fmt::Display for FlowMatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (k, v) in self.0.iter() {
            if !first {
                write!(f, ",")?;
            }
            first = false;
            write!(f, "{k:?}={v}")?;
        }
        Ok(())
    }
}

/// A packet presented to the software datapath, reduced to its header fields.
#[derive(Clone, Debug, Default)]
pub struct Packet {
    pub fields: BTreeMap<FieldKind, FieldValue>,
    pub len: u64,
}

impl Packet {
    pub fn new(len: u64) -> Self {
        Packet {
            fields: BTreeMap::new(),
            len,
        }
    }

    pub fn with(mut self, kind: FieldKind, value: FieldValue) -> Self {
        self.fields.insert(kind, value);
        self
    }

    pub fn with_int(self, kind: FieldKind, value: u64) -> Self {
        self.with(kind, FieldValue::Int(value))
    }

    pub fn get(&self, kind: FieldKind) -> Option<&FieldValue> {
        self.fields.get(&kind)
    }
}
