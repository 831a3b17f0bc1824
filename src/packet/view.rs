//! Owned, parsed representation of one captured packet
//!
//! A [`PacketView`] owns the raw bytes handed over by the queue transport
//! and keeps parsed copies of the IP and L4 headers. Mutations (payload
//! replacement, flag rewrites, seq/ack shifts) are applied to the parsed
//! headers; [`PacketView::serialize`] rebuilds a wire-valid packet with
//! recomputed length and checksum fields. Until then the header fields in
//! the owned buffer are stale and must not be transmitted.

use std::net::IpAddr;
use std::ops::Range;

use etherparse::{
    IpNumber, IpSlice, Ipv4Header, Ipv6Header, TcpHeader, TcpHeaderSlice, UdpHeader,
    UdpHeaderSlice,
};

use super::stream_id::{Endpoint, StreamIdentity, TransportProto};
use crate::error::PacketError;

/// Direction a packet travels in, derived from the nfqueue mark set by the
/// firewall rule that queued it (odd mark = client to server).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    ClientToServer,
    ServerToClient,
}

impl Direction {
    /// Derive the direction from the packet mark.
    #[must_use]
    pub const fn from_mark(mark: u32) -> Self {
        if mark & 0x1 == 0x1 {
            Self::ClientToServer
        } else {
            Self::ServerToClient
        }
    }

    #[must_use]
    pub const fn opposite(self) -> Self {
        match self {
            Self::ClientToServer => Self::ServerToClient,
            Self::ServerToClient => Self::ClientToServer,
        }
    }

    /// True for traffic flowing towards the protected service.
    #[must_use]
    pub const fn is_client_to_server(self) -> bool {
        matches!(self, Self::ClientToServer)
    }
}

/// Parsed IP header, owned.
#[derive(Debug, Clone)]
enum IpMeta {
    V4(Ipv4Header),
    V6 {
        header: Ipv6Header,
        /// Extension header bytes, kept verbatim on re-serialization.
        ext: Range<usize>,
    },
}

/// One captured packet: raw bytes plus parsed header state.
#[derive(Debug)]
pub struct PacketView {
    buf: Vec<u8>,
    ip: IpMeta,
    tcp: Option<TcpHeader>,
    udp: Option<UdpHeader>,
    payload_off: usize,
    replacement: Option<Vec<u8>>,
    header_dirty: bool,
    direction: Direction,
    sid: StreamIdentity,
    proto: TransportProto,
}

impl PacketView {
    /// Parse a raw IP packet as delivered by the queue transport.
    ///
    /// Fragmented datagrams and unknown transports are classified as
    /// [`TransportProto::Raw`]: their L4 payload is everything past the IP
    /// header and they take no part in stream tracking.
    ///
    /// # Errors
    ///
    /// Returns [`PacketError::Parse`] for truncated or malformed headers.
    pub fn parse(buf: Vec<u8>, mark: u32) -> Result<Self, PacketError> {
        let (ip, src_addr, dst_addr, l4_off, ip_number, fragmented) = {
            let slice =
                IpSlice::from_slice(&buf).map_err(|e| PacketError::Parse(e.to_string()))?;
            let ip_payload = slice.payload();
            let l4_off = buf.len() - ip_payload.payload.len();
            let fragmented = ip_payload.fragmented;
            let ip_number = ip_payload.ip_number;
            match &slice {
                IpSlice::Ipv4(v4) => {
                    let header = v4.header().to_header();
                    let src = IpAddr::V4(v4.header().source_addr());
                    let dst = IpAddr::V4(v4.header().destination_addr());
                    (IpMeta::V4(header), src, dst, l4_off, ip_number, fragmented)
                }
                IpSlice::Ipv6(v6) => {
                    let header = v6.header().to_header();
                    let src = IpAddr::V6(v6.header().source_addr());
                    let dst = IpAddr::V6(v6.header().destination_addr());
                    let ip = IpMeta::V6 {
                        header,
                        ext: Ipv6Header::LEN..l4_off,
                    };
                    (ip, src, dst, l4_off, ip_number, fragmented)
                }
            }
        };

        let mut tcp = None;
        let mut udp = None;
        let (proto, payload_off, src_port, dst_port) = if fragmented {
            (TransportProto::Raw, l4_off, 0, 0)
        } else if ip_number == IpNumber::TCP {
            let th = TcpHeaderSlice::from_slice(&buf[l4_off..])
                .map_err(|e| PacketError::Parse(e.to_string()))?;
            let header_len = th.slice().len();
            let (sp, dp) = (th.source_port(), th.destination_port());
            tcp = Some(th.to_header());
            (TransportProto::Tcp, l4_off + header_len, sp, dp)
        } else if ip_number == IpNumber::UDP {
            let uh = UdpHeaderSlice::from_slice(&buf[l4_off..])
                .map_err(|e| PacketError::Parse(e.to_string()))?;
            let (sp, dp) = (uh.source_port(), uh.destination_port());
            udp = Some(uh.to_header());
            (TransportProto::Udp, l4_off + UdpHeader::LEN, sp, dp)
        } else {
            (TransportProto::Raw, l4_off, 0, 0)
        };

        let sid = StreamIdentity::new(
            Endpoint {
                addr: src_addr,
                port: src_port,
            },
            Endpoint {
                addr: dst_addr,
                port: dst_port,
            },
            proto,
        );

        Ok(Self {
            buf,
            ip,
            tcp,
            udp,
            payload_off,
            replacement: None,
            header_dirty: false,
            direction: Direction::from_mark(mark),
            sid,
            proto,
        })
    }

    #[must_use]
    pub const fn proto(&self) -> TransportProto {
        self.proto
    }

    #[must_use]
    pub const fn direction(&self) -> Direction {
        self.direction
    }

    #[must_use]
    pub const fn stream_id(&self) -> StreamIdentity {
        self.sid
    }

    /// Current L4 payload: the replacement if one was set, otherwise the
    /// payload of the captured packet.
    #[must_use]
    pub fn payload(&self) -> &[u8] {
        self.replacement
            .as_deref()
            .unwrap_or(&self.buf[self.payload_off..])
    }

    /// Payload length of the packet as captured (ignores any replacement).
    #[must_use]
    pub fn original_payload_len(&self) -> usize {
        self.buf.len() - self.payload_off
    }

    #[must_use]
    pub const fn tcp(&self) -> Option<&TcpHeader> {
        self.tcp.as_ref()
    }

    #[must_use]
    pub const fn udp(&self) -> Option<&UdpHeader> {
        self.udp.as_ref()
    }

    /// Whether any header or payload mutation happened since parse.
    /// A dirty packet must be re-serialized before it reaches the wire.
    #[must_use]
    pub const fn is_dirty(&self) -> bool {
        self.header_dirty || self.replacement.is_some()
    }

    /// Shift the TCP sequence number by a signed delta (wrapping).
    /// No-op for non-TCP packets or a zero delta.
    pub fn shift_seq(&mut self, delta: i64) {
        if delta == 0 {
            return;
        }
        if let Some(tcp) = &mut self.tcp {
            tcp.sequence_number = tcp.sequence_number.wrapping_add(delta as u32);
            self.header_dirty = true;
        }
    }

    /// Shift the TCP acknowledgment number by a signed delta (wrapping).
    pub fn shift_ack(&mut self, delta: i64) {
        if delta == 0 {
            return;
        }
        if let Some(tcp) = &mut self.tcp {
            tcp.acknowledgment_number = tcp.acknowledgment_number.wrapping_add(delta as u32);
            self.header_dirty = true;
        }
    }

    /// Rewrite the segment into a half-close: FIN+ACK set, SYN cleared.
    /// No-op for non-TCP packets.
    pub fn set_fin_ack(&mut self) {
        if let Some(tcp) = &mut self.tcp {
            tcp.fin = true;
            tcp.ack = true;
            tcp.syn = false;
            self.header_dirty = true;
        }
    }

    /// Remove the L4 payload.
    pub fn strip_payload(&mut self) {
        if !self.payload().is_empty() {
            self.replacement = Some(Vec::new());
        }
    }

    /// Replace the L4 payload.
    pub fn set_payload(&mut self, bytes: Vec<u8>) {
        self.replacement = Some(bytes);
    }

    /// Rebuild a wire-valid packet: length fields and checksums are
    /// recomputed from the (possibly mutated) parsed headers and payload.
    ///
    /// # Errors
    ///
    /// Returns [`PacketError::Serialize`] when the mutated packet cannot be
    /// represented (e.g. replacement payload overflows the IP length
    /// fields). Callers must treat that as fail-closed.
    pub fn serialize(&self) -> Result<Vec<u8>, PacketError> {
        let payload = self.payload();
        let mut out = Vec::with_capacity(self.buf.len().max(payload.len() + 128));

        match self.proto {
            TransportProto::Tcp => {
                let mut tcp = self
                    .tcp
                    .clone()
                    .ok_or_else(|| PacketError::Serialize("missing TCP header".into()))?;
                let l4_len = tcp.header_len() as usize + payload.len();
                match &self.ip {
                    IpMeta::V4(header) => {
                        let mut ip = header.clone();
                        ip.set_payload_len(l4_len)
                            .map_err(|e| PacketError::Serialize(e.to_string()))?;
                        tcp.checksum = tcp
                            .calc_checksum_ipv4(&ip, payload)
                            .map_err(|e| PacketError::Serialize(e.to_string()))?;
                        ip.write(&mut out)
                            .map_err(|e| PacketError::Serialize(e.to_string()))?;
                    }
                    IpMeta::V6 { header, ext } => {
                        let mut ip = header.clone();
                        let total = ext.len() + l4_len;
                        ip.payload_length = u16::try_from(total)
                            .map_err(|_| PacketError::Serialize("payload too large".into()))?;
                        tcp.checksum = tcp
                            .calc_checksum_ipv6(&ip, payload)
                            .map_err(|e| PacketError::Serialize(e.to_string()))?;
                        ip.write(&mut out)
                            .map_err(|e| PacketError::Serialize(e.to_string()))?;
                        out.extend_from_slice(&self.buf[ext.clone()]);
                    }
                }
                tcp.write(&mut out)
                    .map_err(|e| PacketError::Serialize(e.to_string()))?;
            }
            TransportProto::Udp => {
                let mut udp = self
                    .udp
                    .clone()
                    .ok_or_else(|| PacketError::Serialize("missing UDP header".into()))?;
                let l4_len = UdpHeader::LEN + payload.len();
                udp.length = u16::try_from(l4_len)
                    .map_err(|_| PacketError::Serialize("payload too large".into()))?;
                match &self.ip {
                    IpMeta::V4(header) => {
                        let mut ip = header.clone();
                        ip.set_payload_len(l4_len)
                            .map_err(|e| PacketError::Serialize(e.to_string()))?;
                        udp.checksum = udp
                            .calc_checksum_ipv4(&ip, payload)
                            .map_err(|e| PacketError::Serialize(e.to_string()))?;
                        ip.write(&mut out)
                            .map_err(|e| PacketError::Serialize(e.to_string()))?;
                    }
                    IpMeta::V6 { header, ext } => {
                        let mut ip = header.clone();
                        let total = ext.len() + l4_len;
                        ip.payload_length = u16::try_from(total)
                            .map_err(|_| PacketError::Serialize("payload too large".into()))?;
                        udp.checksum = udp
                            .calc_checksum_ipv6(&ip, payload)
                            .map_err(|e| PacketError::Serialize(e.to_string()))?;
                        ip.write(&mut out)
                            .map_err(|e| PacketError::Serialize(e.to_string()))?;
                        out.extend_from_slice(&self.buf[ext.clone()]);
                    }
                }
                udp.write(&mut out)
                    .map_err(|e| PacketError::Serialize(e.to_string()))?;
            }
            TransportProto::Raw => match &self.ip {
                IpMeta::V4(header) => {
                    let mut ip = header.clone();
                    ip.set_payload_len(payload.len())
                        .map_err(|e| PacketError::Serialize(e.to_string()))?;
                    ip.write(&mut out)
                        .map_err(|e| PacketError::Serialize(e.to_string()))?;
                }
                IpMeta::V6 { header, ext } => {
                    let mut ip = header.clone();
                    let total = ext.len() + payload.len();
                    ip.payload_length = u16::try_from(total)
                        .map_err(|_| PacketError::Serialize("payload too large".into()))?;
                    ip.write(&mut out)
                        .map_err(|e| PacketError::Serialize(e.to_string()))?;
                    out.extend_from_slice(&self.buf[ext.clone()]);
                }
            },
        }

        out.extend_from_slice(payload);
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use etherparse::PacketBuilder;

    fn tcp_packet(payload: &[u8], seq: u32, ack: u32) -> Vec<u8> {
        let builder = PacketBuilder::ipv4([10, 0, 0, 1], [10, 0, 0, 2], 64)
            .tcp(40000, 80, seq, 1024)
            .ack(ack);
        let mut raw = Vec::with_capacity(payload.len() + 64);
        builder.write(&mut raw, payload).unwrap();
        raw
    }

    #[test]
    fn test_parse_tcp() {
        let raw = tcp_packet(b"hello", 1000, 2000);
        let view = PacketView::parse(raw, 0x1).unwrap();
        assert_eq!(view.proto(), TransportProto::Tcp);
        assert_eq!(view.direction(), Direction::ClientToServer);
        assert_eq!(view.payload(), b"hello");
        assert!(!view.is_dirty());
        let tcp = view.tcp().unwrap();
        assert_eq!(tcp.sequence_number, 1000);
        assert_eq!(tcp.acknowledgment_number, 2000);
    }

    #[test]
    fn test_direction_from_mark() {
        let raw = tcp_packet(b"", 1, 1);
        let inbound = PacketView::parse(raw.clone(), 0x1337).unwrap();
        assert!(inbound.direction().is_client_to_server());
        let outbound = PacketView::parse(raw, 0x1338).unwrap();
        assert!(!outbound.direction().is_client_to_server());
    }

    #[test]
    fn test_both_directions_same_stream_id() {
        let fwd = tcp_packet(b"x", 1, 1);
        let builder = PacketBuilder::ipv4([10, 0, 0, 2], [10, 0, 0, 1], 64)
            .tcp(80, 40000, 7, 7)
            .ack(9);
        let mut rev = Vec::new();
        builder.write(&mut rev, b"y").unwrap();

        let fwd_view = PacketView::parse(fwd, 1).unwrap();
        let rev_view = PacketView::parse(rev, 0).unwrap();
        assert_eq!(fwd_view.stream_id(), rev_view.stream_id());
    }

    #[test]
    fn test_truncated_packet_rejected() {
        let mut raw = tcp_packet(b"hello", 1000, 2000);
        raw.truncate(12); // mid IP header
        assert!(PacketView::parse(raw, 0).is_err());

        let mut raw = tcp_packet(b"hello", 1000, 2000);
        raw.truncate(24); // mid TCP header
        assert!(PacketView::parse(raw, 0).is_err());
    }

    #[test]
    fn test_strip_payload_reserialize() {
        let raw = tcp_packet(b"secret data", 1000, 2000);
        let mut view = PacketView::parse(raw, 1).unwrap();
        view.strip_payload();
        view.set_fin_ack();
        assert!(view.is_dirty());

        let rebuilt = view.serialize().unwrap();
        let reparsed = PacketView::parse(rebuilt, 1).unwrap();
        assert!(reparsed.payload().is_empty());
        let tcp = reparsed.tcp().unwrap();
        assert!(tcp.fin);
        assert!(tcp.ack);
        assert!(!tcp.syn);
        // seq space untouched
        assert_eq!(tcp.sequence_number, 1000);
    }

    #[test]
    fn test_seq_shift_wrapping() {
        let raw = tcp_packet(b"", 5, 5);
        let mut view = PacketView::parse(raw, 1).unwrap();
        view.shift_seq(-10);
        assert_eq!(view.tcp().unwrap().sequence_number, u32::MAX - 4);
        view.shift_ack(10);
        assert_eq!(view.tcp().unwrap().acknowledgment_number, 15);
    }

    #[test]
    fn test_replacement_payload_roundtrip() {
        let raw = tcp_packet(b"original", 42, 0);
        let mut view = PacketView::parse(raw, 1).unwrap();
        assert_eq!(view.original_payload_len(), 8);
        view.set_payload(b"swapped out".to_vec());

        let rebuilt = view.serialize().unwrap();
        let reparsed = PacketView::parse(rebuilt, 1).unwrap();
        assert_eq!(reparsed.payload(), b"swapped out");
        assert_eq!(reparsed.tcp().unwrap().sequence_number, 42);
    }

    #[test]
    fn test_udp_parse_and_rewrite() {
        let builder =
            PacketBuilder::ipv4([192, 168, 0, 1], [192, 168, 0, 2], 64).udp(5353, 53);
        let mut raw = Vec::new();
        builder.write(&mut raw, b"query").unwrap();

        let mut view = PacketView::parse(raw, 1).unwrap();
        assert_eq!(view.proto(), TransportProto::Udp);
        assert_eq!(view.payload(), b"query");

        view.set_payload(b"q2".to_vec());
        let rebuilt = view.serialize().unwrap();
        let reparsed = PacketView::parse(rebuilt, 1).unwrap();
        assert_eq!(reparsed.payload(), b"q2");
        assert_eq!(reparsed.udp().unwrap().length as usize, UdpHeader::LEN + 2);
    }

    #[test]
    fn test_ipv6_tcp_roundtrip() {
        let builder = PacketBuilder::ipv6(
            [0x20, 0x01, 0x0d, 0xb8, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 1],
            [0x20, 0x01, 0x0d, 0xb8, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 2],
            64,
        )
        .tcp(4444, 443, 100, 512);
        let mut raw = Vec::new();
        builder.write(&mut raw, b"tls bytes").unwrap();

        let mut view = PacketView::parse(raw, 1).unwrap();
        assert_eq!(view.proto(), TransportProto::Tcp);
        view.strip_payload();
        let rebuilt = view.serialize().unwrap();
        let reparsed = PacketView::parse(rebuilt, 1).unwrap();
        assert!(reparsed.payload().is_empty());
    }
}
