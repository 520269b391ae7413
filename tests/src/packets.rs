//! packets - header-only packets to inject into the soft switch

use openflow::{FieldKind, FieldValue, Packet};
use pipelined::Config;
use std::net::Ipv4Addr;

const ETH_TYPE_IPV4: u64 = 0x0800;
const IP_PROTO_TCP: u64 = 6;
const IP_PROTO_UDP: u64 = 17;
const HTTP_PORT: u64 = 80;
const TEST_TCP_PORT: u64 = 40312;
const TEST_UDP_PORT: u64 = 23215;

/// A UDP packet from the UE arriving through its GTP tunnel.
pub fn uplink_packet(teid: u32, ue_ip: Ipv4Addr, dst: Ipv4Addr, len: u64) -> Packet {
    Packet::new(len)
        .with_int(FieldKind::InPort, Config::default().gtp_port as u64)
        .with_int(FieldKind::TunnelId, teid as u64)
        .with_int(FieldKind::EthType, ETH_TYPE_IPV4)
        .with(FieldKind::Ipv4Src, FieldValue::host_v4(ue_ip))
        .with(FieldKind::Ipv4Dst, FieldValue::host_v4(dst))
        .with_int(FieldKind::IpProto, IP_PROTO_UDP)
        .with_int(FieldKind::UdpSrc, TEST_UDP_PORT)
        .with_int(FieldKind::UdpDst, TEST_UDP_PORT)
}

/// A UDP packet from the data network to the UE.
pub fn downlink_packet(src: Ipv4Addr, ue_ip: Ipv4Addr, len: u64) -> Packet {
    Packet::new(len)
        .with_int(FieldKind::InPort, Config::default().uplink_port as u64)
        .with_int(FieldKind::EthType, ETH_TYPE_IPV4)
        .with(FieldKind::Ipv4Src, FieldValue::host_v4(src))
        .with(FieldKind::Ipv4Dst, FieldValue::host_v4(ue_ip))
        .with_int(FieldKind::IpProto, IP_PROTO_UDP)
        .with_int(FieldKind::UdpSrc, TEST_UDP_PORT)
        .with_int(FieldKind::UdpDst, TEST_UDP_PORT)
}

/// An HTTP request from the UE arriving through its GTP tunnel.
pub fn http_request(teid: u32, ue_ip: Ipv4Addr, server: Ipv4Addr, len: u64) -> Packet {
    tcp_to_server(ue_ip, server, len)
        .with_int(FieldKind::InPort, Config::default().gtp_port as u64)
        .with_int(FieldKind::TunnelId, teid as u64)
}

/// The same request once the enrichment proxy has passed it back.
pub fn proxied_request(ue_ip: Ipv4Addr, server: Ipv4Addr, len: u64) -> Packet {
    tcp_to_server(ue_ip, server, len)
        .with_int(FieldKind::InPort, Config::default().proxy_port as u64)
}

fn tcp_to_server(ue_ip: Ipv4Addr, server: Ipv4Addr, len: u64) -> Packet {
    Packet::new(len)
        .with_int(FieldKind::EthType, ETH_TYPE_IPV4)
        .with(FieldKind::Ipv4Src, FieldValue::host_v4(ue_ip))
        .with(FieldKind::Ipv4Dst, FieldValue::host_v4(server))
        .with_int(FieldKind::IpProto, IP_PROTO_TCP)
        .with_int(FieldKind::TcpSrc, TEST_TCP_PORT)
        .with_int(FieldKind::TcpDst, HTTP_PORT)
}
