use std::net::IpAddr;

use etherparse::{NetSlice, SlicedPacket, TransportSlice};
use pcap_parser::Linktype;
use serde::{Deserialize, Serialize};

use super::error::TransportError;
use super::reader::SegmentReader;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportProto {
    Tcp,
    Udp,
}

impl TransportProto {
    pub fn name(self) -> &'static str {
        match self {
            TransportProto::Tcp => "tcp",
            TransportProto::Udp => "udp",
        }
    }
}

/// Parsed UDP or TCP segment with source/destination endpoints.
pub struct TransportPacket<'a> {
    pub proto: TransportProto,
    pub src_ip: IpAddr,
    pub src_port: u16,
    pub dst_ip: IpAddr,
    pub dst_port: u16,
    pub payload: &'a [u8],
}

/// Parse a UDP or TCP segment from a link-layer frame.
///
/// Returns `Ok(None)` for other link types and transports.
pub fn parse_transport_packet(
    linktype: Linktype,
    data: &[u8],
) -> Result<Option<TransportPacket<'_>>, TransportError> {
    let sliced = match linktype {
        Linktype::ETHERNET => SlicedPacket::from_ethernet(data)
            .map_err(|e| TransportError::Slice(e.to_string()))?,
        Linktype::RAW => {
            SlicedPacket::from_ip(data).map_err(|e| TransportError::Slice(e.to_string()))?
        }
        _ => return Ok(None),
    };

    let net = sliced.net.ok_or(TransportError::MissingNetworkLayer)?;
    let (proto, src_port, dst_port) = match sliced.transport {
        Some(TransportSlice::Udp(udp)) => {
            (TransportProto::Udp, udp.source_port(), udp.destination_port())
        }
        Some(TransportSlice::Tcp(tcp)) => {
            (TransportProto::Tcp, tcp.source_port(), tcp.destination_port())
        }
        _ => return Ok(None),
    };

    #[allow(unreachable_patterns)]
    let (src_ip, dst_ip) = match net {
        NetSlice::Ipv4(ref ipv4) => (
            IpAddr::V4(ipv4.header().source_addr()),
            IpAddr::V4(ipv4.header().destination_addr()),
        ),
        NetSlice::Ipv6(ref ipv6) => (
            IpAddr::V6(ipv6.header().source_addr()),
            IpAddr::V6(ipv6.header().destination_addr()),
        ),
        _ => return Ok(None),
    };

    let ip_payload = net.ip_payload_ref().ok_or(TransportError::MissingIpPayload)?;
    let reader = SegmentReader::new(ip_payload.payload);
    let payload = match proto {
        TransportProto::Udp => reader.udp_payload()?,
        TransportProto::Tcp => reader.tcp_payload()?,
    };

    Ok(Some(TransportPacket {
        proto,
        src_ip,
        src_port,
        dst_ip,
        dst_port,
        payload,
    }))
}
