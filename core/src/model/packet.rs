//! The transient per-packet record (spec.md §3 "Packet").
//!
//! A `Packet` is consumed once by `ConnectionExtractor` and then discarded;
//! nothing holds a long-lived collection of these.

use std::net::IpAddr;

use serde::Serialize;

/// TCP flag bits, as a raw byte (matches the `tcp.flags` dissector field).
pub mod tcp_flags {
    pub const FIN: u8 = 0x01;
    pub const SYN: u8 = 0x02;
    pub const RST: u8 = 0x04;
    pub const PSH: u8 = 0x08;
    pub const ACK: u8 = 0x10;
    pub const URG: u8 = 0x20;
    pub const ECE: u8 = 0x40;
    pub const CWR: u8 = 0x80;
}

/// A TLS ClientHello's identifying material, when present on a packet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClientHelloInfo {
    pub random: [u8; 32],
    pub session_id: Vec<u8>,
}

/// F5 BIG-IP trailer data identifying the original client-side peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct F5PeerInfo {
    pub peer_addr: IpAddr,
    pub peer_port: u16,
}

/// A single dissected packet belonging to a TCP stream.
#[derive(Debug, Clone)]
pub struct Packet {
    pub stream_id: u32,
    pub frame_number: u64,
    /// Capture timestamp in nanoseconds since the UNIX epoch.
    pub timestamp_ns: i64,
    pub src_ip: IpAddr,
    pub dst_ip: IpAddr,
    pub src_port: u16,
    pub dst_port: u16,
    pub tcp_flags: u8,
    /// Absolute 32-bit TCP sequence number. Relative sequence numbers must
    /// never reach this field (spec.md §4.B, §9): the dissector invocation
    /// that produces these packets always disables
    /// `tcp.relative_sequence_numbers`.
    pub tcp_seq: u32,
    pub tcp_ack: u32,
    pub payload_len: u32,
    /// Raw TCP payload bytes, as hex (the `tcp.payload` dissector field).
    /// `None` when the segment carries no data.
    pub payload_hex: Option<String>,
    /// 16-bit IP identification field. `None` for IPv6 (spec.md §4.B edge
    /// case: IP-ID is not extracted for IPv6 traffic).
    pub ip_id: Option<u16>,
    pub ip_ttl: u8,
    /// Raw TCP options string from the SYN packet (MSS/WS/SACK/TS), if any.
    pub tcp_options: Option<String>,
    pub tcp_tsval: Option<u32>,
    pub tcp_tsecr: Option<u32>,
    pub tls_client_hello: Option<ClientHelloInfo>,
    pub f5_peer: Option<F5PeerInfo>,
}

impl Packet {
    #[inline]
    pub fn is_syn(&self) -> bool {
        self.tcp_flags & tcp_flags::SYN != 0 && self.tcp_flags & tcp_flags::ACK == 0
    }

    #[inline]
    pub fn is_synack(&self) -> bool {
        self.tcp_flags & tcp_flags::SYN != 0 && self.tcp_flags & tcp_flags::ACK != 0
    }
}
