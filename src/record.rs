// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The immutable record handed from the listener to the processor, and its
//! lazy Ethernet/IP/TCP/UDP dissection.

use crate::vxlan::VxlanHeader;
use std::sync::OnceLock;
use std::time::SystemTime;

/// Parsed network-layer endpoints and protocol, extracted from an IPv4 or
/// IPv6 header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkLayer {
    pub src_addr: String,
    pub dst_addr: String,
    pub protocol: String,
}

/// Parsed transport-layer endpoints, extracted from a TCP or UDP header.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TransportLayer {
    pub src_port: Option<u16>,
    pub dst_port: Option<u16>,
    pub tcp_flags: Option<String>,
    pub tcp_seq: Option<u32>,
}

/// The lazily-computed dissection of a record's inner frame. Evaluated once,
/// on first access, from the Ethernet layer down.
#[derive(Debug, Default)]
struct Dissected {
    network: Option<NetworkLayer>,
    transport: Option<TransportLayer>,
    application: Option<Vec<u8>>,
}

/// Renders an IP protocol number as its bare keyword (`"TCP"`, `"UDP"`, …),
/// falling back to the decimal number for anything `etherparse` doesn't name.
fn ip_number_keyword(n: etherparse::IpNumber) -> String {
    match n.keyword_str() {
        Some(keyword) => keyword.to_string(),
        None => n.0.to_string(),
    }
}

fn dissect(raw: &[u8]) -> Dissected {
    let parsed = match etherparse::SlicedPacket::from_ethernet(raw) {
        Ok(p) => p,
        Err(_) => return Dissected::default(),
    };

    let network = parsed.net.as_ref().and_then(|net| match net {
        etherparse::NetSlice::Ipv4(ipv4) => Some(NetworkLayer {
            src_addr: ipv4.header().source_addr().to_string(),
            dst_addr: ipv4.header().destination_addr().to_string(),
            protocol: ip_number_keyword(ipv4.header().protocol()),
        }),
        etherparse::NetSlice::Ipv6(ipv6) => Some(NetworkLayer {
            src_addr: ipv6.header().source_addr().to_string(),
            dst_addr: ipv6.header().destination_addr().to_string(),
            protocol: ip_number_keyword(ipv6.header().next_header()),
        }),
    });

    let transport = parsed.transport.as_ref().map(|t| match t {
        etherparse::TransportSlice::Tcp(tcp) => TransportLayer {
            src_port: Some(tcp.source_port()),
            dst_port: Some(tcp.destination_port()),
            tcp_flags: Some(tcp_flags_string(tcp)),
            tcp_seq: Some(tcp.sequence_number()),
        },
        etherparse::TransportSlice::Udp(udp) => TransportLayer {
            src_port: Some(udp.source_port()),
            dst_port: Some(udp.destination_port()),
            tcp_flags: None,
            tcp_seq: None,
        },
        _ => TransportLayer::default(),
    });

    let application = if !parsed.payload.payload.is_empty() {
        Some(parsed.payload.payload.to_vec())
    } else {
        None
    };

    Dissected {
        network,
        transport,
        application,
    }
}

fn tcp_flags_string(tcp: &etherparse::TcpSlice) -> String {
    let mut flags = Vec::new();
    if tcp.syn() {
        flags.push("SYN");
    }
    if tcp.ack() {
        flags.push("ACK");
    }
    if tcp.fin() {
        flags.push("FIN");
    }
    if tcp.rst() {
        flags.push("RST");
    }
    if tcp.psh() {
        flags.push("PSH");
    }
    if tcp.urg() {
        flags.push("URG");
    }
    flags.join(",")
}

/// An immutable value holding the raw inner bytes, the parsed VXLAN header,
/// the capture timestamp, and a lazily-dissected packet view. Created by the
/// listener; handed to the processor through the queue; destroyed after the
/// emitter either copies its bytes into an outbound buffer or writes them
/// directly.
#[derive(Debug)]
pub struct PacketRecord {
    raw_bytes: Vec<u8>,
    header: VxlanHeader,
    timestamp: SystemTime,
    dissected: OnceLock<Dissected>,
}

impl PacketRecord {
    pub fn new(inner_frame: &[u8], header: VxlanHeader) -> Self {
        PacketRecord {
            raw_bytes: inner_frame.to_vec(),
            header,
            timestamp: SystemTime::now(),
            dissected: OnceLock::new(),
        }
    }

    pub fn raw_bytes(&self) -> &[u8] {
        &self.raw_bytes
    }

    pub fn header(&self) -> VxlanHeader {
        self.header
    }

    pub fn timestamp(&self) -> SystemTime {
        self.timestamp
    }

    fn dissected(&self) -> &Dissected {
        self.dissected.get_or_init(|| dissect(&self.raw_bytes))
    }

    pub fn network_layer(&self) -> Option<&NetworkLayer> {
        self.dissected().network.as_ref()
    }

    pub fn transport_layer(&self) -> Option<&TransportLayer> {
        self.dissected().transport.as_ref()
    }

    pub fn application_layer(&self) -> Option<&[u8]> {
        self.dissected().application.as_deref()
    }
}
