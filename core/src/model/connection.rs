//! The `Connection` record (spec.md §3) and its identifiers.

use std::collections::HashSet;
use std::fmt;
use std::net::IpAddr;

use serde::Serialize;
use strum_macros::{Display, EnumString};

use super::packet::{ClientHelloInfo, F5PeerInfo};

/// Identifies a capture file within a run. Assigned by the caller in the
/// order files were submitted; stable only within one run.
pub type FileId = u32;

/// A stream id as assigned by the dissector, scoped to its owning file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ConnectionId {
    pub file_id: FileId,
    pub stream_id: u32,
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.file_id, self.stream_id)
    }
}

/// Canonical 5-tuple: always expressed as client-to-server, never as raw
/// packet source/destination (spec.md §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct FiveTuple {
    pub client_ip: IpAddr,
    pub client_port: u16,
    pub server_ip: IpAddr,
    pub server_port: u16,
}

impl fmt::Display for FiveTuple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{} -> {}:{}",
            self.client_ip, self.client_port, self.server_ip, self.server_port
        )
    }
}

/// ServerDetector's confidence grade for a role assignment (spec.md §3, §4.C).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Display, EnumString, Serialize)]
pub enum Confidence {
    #[strum(serialize = "HIGH")]
    High,
    #[strum(serialize = "MEDIUM")]
    Medium,
    #[strum(serialize = "LOW")]
    Low,
    #[strum(serialize = "VERY_LOW")]
    VeryLow,
}

/// A reconstructed TCP connection, with all fingerprint material needed for
/// matching precomputed (spec.md §3, §4.B).
///
/// Built incrementally by `ConnectionExtractor` via [`ConnectionBuilder`],
/// then optionally role-swapped once by `ServerDetector`. Once
/// `ServerDetector` finalizes a connection's role assignment, nothing in
/// this crate mutates it again: invariant (i) in spec.md §3.
#[derive(Debug, Clone, Serialize)]
pub struct Connection {
    pub id: ConnectionId,
    pub five_tuple: FiveTuple,

    pub first_packet_ts: i64,
    pub last_packet_ts: i64,
    pub packet_count: u32,

    pub syn_options: String,
    pub client_isn: Option<u32>,
    pub server_isn: Option<u32>,
    pub tsval: Option<u32>,
    pub tsecr: Option<u32>,

    pub client_payload_md5: String,
    pub server_payload_md5: String,
    pub length_signature: Vec<String>,

    pub ipid_set: HashSet<u16>,
    pub client_ipid_set: HashSet<u16>,
    pub server_ipid_set: HashSet<u16>,

    pub client_ttls: Vec<u8>,
    pub server_ttls: Vec<u8>,

    pub has_syn: bool,
    pub confidence: Confidence,

    pub f5_peer: Option<F5PeerInfo>,
    pub tls_client_hello: Option<ClientHelloInfo>,

    finalized: bool,
}

impl Connection {
    /// Swaps client/server roles in place and rebuilds the directional
    /// IP-ID sets from the combined set's membership tags, preserving
    /// invariant (ii): `ipid_set == client_ipid_set ∪ server_ipid_set`.
    ///
    /// Only `ServerDetector` calls this, and only before `finalize`.
    pub(crate) fn swap_roles(&mut self) {
        debug_assert!(!self.finalized, "role swap after finalize");
        let FiveTuple {
            client_ip,
            client_port,
            server_ip,
            server_port,
        } = self.five_tuple;
        self.five_tuple = FiveTuple {
            client_ip: server_ip,
            client_port: server_port,
            server_ip: client_ip,
            server_port: client_port,
        };
        std::mem::swap(&mut self.client_isn, &mut self.server_isn);
        std::mem::swap(&mut self.client_payload_md5, &mut self.server_payload_md5);
        std::mem::swap(&mut self.client_ipid_set, &mut self.server_ipid_set);
        std::mem::swap(&mut self.client_ttls, &mut self.server_ttls);
    }

    pub(crate) fn set_confidence(&mut self, confidence: Confidence) {
        debug_assert!(!self.finalized, "confidence set after finalize");
        self.confidence = confidence;
    }

    /// Locks the connection against further role mutation. Called once by
    /// `ServerDetector` after classifying this connection.
    pub(crate) fn finalize(&mut self) {
        self.finalized = true;
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    /// Hop count estimate derived from the client-side TTL distribution.
    /// See [`crate::primitives::estimate_hops`].
    pub fn client_hops(&self) -> Option<u8> {
        crate::primitives::most_likely_hops(&self.client_ttls)
    }

    pub fn server_hops(&self) -> Option<u8> {
        crate::primitives::most_likely_hops(&self.server_ttls)
    }

    /// True if this connection has too little evidence for the standard
    /// pre-filters and should use the relaxed microflow thresholds
    /// (spec.md §4.D.4, glossary "Microflow").
    pub fn is_microflow(&self) -> bool {
        const MICROFLOW_MAX_PACKETS: u32 = 3;
        const MICROFLOW_MAX_DURATION_NS: i64 = 2_000_000_000;
        self.packet_count <= MICROFLOW_MAX_PACKETS
            || (self.last_packet_ts - self.first_packet_ts) <= MICROFLOW_MAX_DURATION_NS
    }
}

/// Accumulates a single stream's material during extraction. Consumed into
/// a [`Connection`] by [`ConnectionBuilder::build`].
pub struct ConnectionBuilder {
    id: ConnectionId,
    five_tuple: FiveTuple,
    first_packet_ts: i64,
    last_packet_ts: i64,
    packet_count: u32,
    syn_options: String,
    client_isn: Option<u32>,
    server_isn: Option<u32>,
    tsval: Option<u32>,
    tsecr: Option<u32>,
    client_payload_md5: String,
    server_payload_md5: String,
    length_signature: Vec<String>,
    client_ipid_set: HashSet<u16>,
    server_ipid_set: HashSet<u16>,
    client_ttls: Vec<u8>,
    server_ttls: Vec<u8>,
    has_syn: bool,
    f5_peer: Option<F5PeerInfo>,
    tls_client_hello: Option<ClientHelloInfo>,
}

impl ConnectionBuilder {
    pub fn new(id: ConnectionId, five_tuple: FiveTuple, first_packet_ts: i64) -> Self {
        ConnectionBuilder {
            id,
            five_tuple,
            first_packet_ts,
            last_packet_ts: first_packet_ts,
            packet_count: 0,
            syn_options: String::new(),
            client_isn: None,
            server_isn: None,
            tsval: None,
            tsecr: None,
            client_payload_md5: String::new(),
            server_payload_md5: String::new(),
            length_signature: Vec::new(),
            client_ipid_set: HashSet::new(),
            server_ipid_set: HashSet::new(),
            client_ttls: Vec::new(),
            server_ttls: Vec::new(),
            has_syn: false,
            f5_peer: None,
            tls_client_hello: None,
        }
    }

    pub fn observe_packet_ts(&mut self, ts: i64) {
        self.last_packet_ts = self.last_packet_ts.max(ts);
        self.first_packet_ts = self.first_packet_ts.min(ts);
        self.packet_count += 1;
    }

    pub fn set_syn_options(&mut self, options: String) {
        self.syn_options = options;
    }

    pub fn set_client_isn(&mut self, isn: u32) {
        self.client_isn.get_or_insert(isn);
    }

    pub fn set_server_isn(&mut self, isn: u32) {
        self.server_isn.get_or_insert(isn);
    }

    pub fn set_timestamps(&mut self, tsval: Option<u32>, tsecr: Option<u32>) {
        if self.tsval.is_none() {
            self.tsval = tsval;
        }
        if self.tsecr.is_none() {
            self.tsecr = tsecr;
        }
    }

    pub fn set_client_payload_md5(&mut self, digest: String) {
        if self.client_payload_md5.is_empty() {
            self.client_payload_md5 = digest;
        }
    }

    pub fn set_server_payload_md5(&mut self, digest: String) {
        if self.server_payload_md5.is_empty() {
            self.server_payload_md5 = digest;
        }
    }

    pub fn push_length_token(&mut self, token: String) {
        self.length_signature.push(token);
    }

    pub fn add_client_ipid(&mut self, ip_id: u16) {
        self.client_ipid_set.insert(ip_id);
    }

    pub fn add_server_ipid(&mut self, ip_id: u16) {
        self.server_ipid_set.insert(ip_id);
    }

    pub fn add_client_ttl(&mut self, ttl: u8) {
        self.client_ttls.push(ttl);
    }

    pub fn add_server_ttl(&mut self, ttl: u8) {
        self.server_ttls.push(ttl);
    }

    pub fn mark_has_syn(&mut self) {
        self.has_syn = true;
    }

    pub fn set_f5_peer(&mut self, peer: F5PeerInfo) {
        self.f5_peer.get_or_insert(peer);
    }

    pub fn set_tls_client_hello(&mut self, hello: ClientHelloInfo) {
        self.tls_client_hello.get_or_insert(hello);
    }

    pub fn ipid_observation_count(&self) -> usize {
        self.client_ipid_set.len() + self.server_ipid_set.len()
    }

    /// Emits the finished `Connection`. `confidence` starts at
    /// [`Confidence::VeryLow`]: every connection is tentative until
    /// `ServerDetector` classifies it.
    pub fn build(self) -> Connection {
        let ipid_set: HashSet<u16> = self
            .client_ipid_set
            .iter()
            .chain(self.server_ipid_set.iter())
            .copied()
            .collect();
        Connection {
            id: self.id,
            five_tuple: self.five_tuple,
            first_packet_ts: self.first_packet_ts,
            last_packet_ts: self.last_packet_ts,
            packet_count: self.packet_count,
            syn_options: self.syn_options,
            client_isn: self.client_isn,
            server_isn: self.server_isn,
            tsval: self.tsval,
            tsecr: self.tsecr,
            client_payload_md5: self.client_payload_md5,
            server_payload_md5: self.server_payload_md5,
            length_signature: self.length_signature,
            ipid_set,
            client_ipid_set: self.client_ipid_set,
            server_ipid_set: self.server_ipid_set,
            client_ttls: self.client_ttls,
            server_ttls: self.server_ttls,
            has_syn: self.has_syn,
            confidence: Confidence::VeryLow,
            f5_peer: self.f5_peer,
            tls_client_hello: self.tls_client_hello,
            finalized: false,
        }
    }
}
