// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! VXLAN header parsing and the UDP receive loop.

use crate::error::{ParseError, SocketError};
use crate::record::PacketRecord;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::warn;

pub const VXLAN_HEADER_LEN: usize = 8;
pub const DEFAULT_VXLAN_PORT: u16 = 4789;
pub const DEFAULT_RECEIVER_QUEUE_SIZE: usize = 1024;

/// 8-octet, big-endian VXLAN header: a 16-bit flags field, a 16-bit
/// group-policy identifier, a 24-bit virtual-network identifier, and an
/// 8-bit reserved field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VxlanHeader {
    pub flags: u16,
    pub group_policy_id: u16,
    pub vni: u32,
    pub reserved: u8,
}

impl VxlanHeader {
    /// Parses the header from the first 8 octets of `raw`. Callers must have
    /// already verified `raw.len() >= VXLAN_HEADER_LEN`.
    fn parse(raw: &[u8]) -> Self {
        debug_assert!(raw.len() >= VXLAN_HEADER_LEN);
        let flags = u16::from_be_bytes([raw[0], raw[1]]);
        let group_policy_id = u16::from_be_bytes([raw[2], raw[3]]);
        let vni = u32::from_be_bytes([0, raw[4], raw[5], raw[6]]);
        let reserved = raw[7];
        VxlanHeader {
            flags,
            group_policy_id,
            vni,
            reserved,
        }
    }
}

/// Parses a received datagram into a `PacketRecord`. The header is extracted
/// before its own bytes are consumed for the inner frame. A datagram of
/// exactly 8 octets (empty payload) is valid.
pub fn parse_vxlan(raw: &[u8]) -> Result<PacketRecord, ParseError> {
    if raw.len() < VXLAN_HEADER_LEN {
        return Err(ParseError::ShortDatagram(raw.len()));
    }

    let header = VxlanHeader::parse(raw);
    let inner = &raw[VXLAN_HEADER_LEN..];
    Ok(PacketRecord::new(inner, header))
}

/// One item published onto the receive queue: either a successfully parsed
/// record, or a terminal socket error.
pub enum QueueItem {
    Record(PacketRecord),
    Error(SocketError),
}

/// Binds a UDP socket on `port` (all interfaces) and publishes inner-frame
/// records onto a bounded queue of `queue_size`. Parse failures are logged
/// and skipped; socket failures publish a single terminal error and the
/// task returns.
pub fn listen(port: u16, queue_size: usize) -> mpsc::Receiver<QueueItem> {
    let (tx, rx) = mpsc::channel(queue_size);

    tokio::spawn(async move {
        let socket = match UdpSocket::bind(("0.0.0.0", port)).await {
            Ok(s) => s,
            Err(source) => {
                let _ = tx.send(QueueItem::Error(SocketError::OpenFailed { port, source })).await;
                return;
            }
        };

        let mut buf = vec![0u8; 32 * 1024];

        loop {
            let n = match socket.recv_from(&mut buf).await {
                Ok((n, _peer)) => n,
                Err(source) => {
                    let _ = tx.send(QueueItem::Error(SocketError::ReadFailed(source))).await;
                    return;
                }
            };

            match parse_vxlan(&buf[..n]) {
                Ok(record) => {
                    if tx.send(QueueItem::Record(record)).await.is_err() {
                        return;
                    }
                }
                Err(err) => warn!(error = %err, "failed to parse VXLAN datagram"),
            }
        }
    });

    rx
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_happy_path() {
        let mut raw = vec![0x08, 0x00, 0x00, 0x01, 0xa8, 0xee, 0xd6, 0x00];
        raw.extend_from_slice(&[0u8; 14]);

        let record = parse_vxlan(&raw).expect("parse should succeed");
        assert_eq!(record.raw_bytes().len(), 14);
        assert_eq!(record.header().group_policy_id, 1);
        assert_eq!(record.header().vni, 0xa8eed6);
    }

    #[test]
    fn parse_short_datagram() {
        let raw = [0x08, 0x00, 0x00, 0x01, 0xa8, 0xee, 0xd6];
        let err = parse_vxlan(&raw).unwrap_err();
        assert_eq!(err, ParseError::ShortDatagram(7));
    }

    #[test]
    fn parse_empty_payload_is_valid() {
        let raw = [0x08, 0x00, 0x00, 0x01, 0xa8, 0xee, 0xd6, 0x00];
        let record = parse_vxlan(&raw).expect("8-byte datagram is valid");
        assert!(record.raw_bytes().is_empty());
    }
}
