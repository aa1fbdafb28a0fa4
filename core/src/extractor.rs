//! ConnectionExtractor (spec.md §2 component B, §4.B): turns dissector rows
//! into one `Packet` per line and folds each file's packets into
//! `Connection`s, one pass per stream.
//!
//! Grounded on `thegwan-retina::subscription::connection_features`, which
//! performs the same fold (accumulate per-stream state packet-by-packet,
//! emit a finished record) for ML feature vectors rather than match
//! fingerprints.

use std::collections::HashMap;
use std::net::IpAddr;
use std::str::FromStr;

use log::warn;

use crate::dissector::column;
use crate::error::ExtractionError;
use crate::model::connection::{ConnectionBuilder, ConnectionId, FileId, FiveTuple};
use crate::model::packet::{tcp_flags, ClientHelloInfo, F5PeerInfo, Packet};
use crate::model::Connection;

/// Parses one CSV row (as produced by [`crate::dissector::field_args`]) into
/// a `Packet`. Returns `None` for rows missing mandatory fields (no TCP
/// stream, e.g. non-TCP traffic that slipped past the capture filter) or
/// that fail to parse, logging the reason at `warn` (spec.md §7: per-row
/// parse failures are recoverable, never fatal).
pub fn parse_row(row: &str) -> Option<Packet> {
    let fields: Vec<&str> = row.split(',').collect();
    if fields.len() < column::COUNT {
        warn!(
            "dropping row with {} fields, expected at least {}",
            fields.len(),
            column::COUNT
        );
        return None;
    }

    let frame_number = parse_u64(fields[column::FRAME_NUMBER])?;
    let timestamp_ns = parse_epoch_ns(fields[column::TIME_EPOCH])?;
    let src_ip = parse_ip(fields[column::IP_SRC])?;
    let dst_ip = parse_ip(fields[column::IP_DST])?;
    let ip_id = parse_hex_or_dec_u16(fields[column::IP_ID]);
    let ip_ttl = parse_hex_or_dec_u16(fields[column::IP_TTL]).map(|v| v as u8).unwrap_or(0);
    let stream_id = parse_u32(fields[column::TCP_STREAM])?;
    let src_port = parse_u32(fields[column::TCP_SRCPORT])? as u16;
    let dst_port = parse_u32(fields[column::TCP_DSTPORT])? as u16;
    let tcp_seq = parse_u32(fields[column::TCP_SEQ_RAW])?;
    let tcp_ack = parse_u32(fields[column::TCP_ACK_RAW]).unwrap_or(0);
    let tcp_flags = parse_hex_or_dec_u16(fields[column::TCP_FLAGS]).unwrap_or(0) as u8;
    let tcp_options = non_empty(fields[column::TCP_OPTIONS]);
    let tcp_tsval = parse_u32(fields[column::TCP_TSVAL]).ok();
    let tcp_tsecr = parse_u32(fields[column::TCP_TSECR]).ok();
    let payload_len = parse_u32(fields[column::TCP_LEN]).unwrap_or(0);
    let payload_hex = non_empty(fields[column::TCP_PAYLOAD]);

    let tls_client_hello = parse_client_hello(
        fields[column::TLS_RANDOM],
        fields[column::TLS_SESSION_ID],
    );
    let f5_peer = parse_f5_peer(fields[column::F5_PEER_ADDR], fields[column::F5_PEER_PORT]);

    Some(Packet {
        stream_id,
        frame_number,
        timestamp_ns,
        src_ip,
        dst_ip,
        src_port,
        dst_port,
        tcp_flags,
        tcp_seq,
        tcp_ack,
        payload_len,
        payload_hex,
        ip_id,
        ip_ttl,
        tcp_options,
        tcp_tsval,
        tcp_tsecr,
        tls_client_hello,
        f5_peer,
    })
}

fn non_empty(s: &str) -> Option<String> {
    let s = s.trim();
    if s.is_empty() {
        None
    } else {
        Some(s.to_string())
    }
}

fn parse_u64(s: &str) -> Option<u64> {
    s.trim().parse().ok()
}

fn parse_u32(s: &str) -> Result<u32, ()> {
    s.trim().parse().map_err(|_| ())
}

fn parse_ip(s: &str) -> Option<IpAddr> {
    IpAddr::from_str(s.trim()).ok()
}

/// `frame.time_epoch` is a decimal-seconds float; converts to integer
/// nanoseconds since the epoch.
fn parse_epoch_ns(s: &str) -> Option<i64> {
    let secs: f64 = s.trim().parse().ok()?;
    Some((secs * 1_000_000_000.0).round() as i64)
}

/// tshark's fields export renders some numeric fields in hex (`0x1a2b`) and
/// others in decimal depending on the field's display preference; this
/// accepts either.
fn parse_hex_or_dec_u16(s: &str) -> Option<u16> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }
    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u16::from_str_radix(hex, 16).ok()
    } else {
        s.parse().ok()
    }
}

fn parse_client_hello(random: &str, session_id: &str) -> Option<ClientHelloInfo> {
    let random_bytes = hex::decode(random.trim()).ok()?;
    if random_bytes.len() != 32 {
        return None;
    }
    let mut fixed = [0u8; 32];
    fixed.copy_from_slice(&random_bytes);
    let session_id = hex::decode(session_id.trim()).unwrap_or_default();
    Some(ClientHelloInfo {
        random: fixed,
        session_id,
    })
}

fn parse_f5_peer(addr: &str, port: &str) -> Option<F5PeerInfo> {
    let peer_addr = parse_ip(addr)?;
    let peer_port = parse_u32(port.trim()).ok()? as u16;
    Some(F5PeerInfo {
        peer_addr,
        peer_port,
    })
}

/// Which endpoint of a stream's initial packet a later packet matches,
/// relative to the arbitrary "first packet's source is the client" choice
/// `ConnectionExtractor` makes (spec.md §4.B: role is tentative until
/// `ServerDetector` runs).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    Client,
    Server,
}

struct StreamState {
    builder: ConnectionBuilder,
    client_ip: IpAddr,
    client_port: u16,
}

impl StreamState {
    fn side_of(&self, packet: &Packet) -> Side {
        if packet.src_ip == self.client_ip && packet.src_port == self.client_port {
            Side::Client
        } else {
            Side::Server
        }
    }
}

/// Folds one file's packets into `Connection`s, one per TCP stream.
///
/// Number of leading payload bytes hashed is `payload_hash_bytes`
/// (spec.md §9 Open Question, resolved in DESIGN.md).
pub struct ConnectionExtractor {
    file_id: FileId,
    payload_hash_bytes: usize,
    streams: HashMap<u32, StreamState>,
}

impl ConnectionExtractor {
    pub fn new(file_id: FileId, payload_hash_bytes: usize) -> Self {
        ConnectionExtractor {
            file_id,
            payload_hash_bytes,
            streams: HashMap::new(),
        }
    }

    /// Feeds one packet into its stream's accumulator, creating the
    /// accumulator on first sight (spec.md §4.B: single pass over packets).
    pub fn observe(&mut self, packet: Packet) {
        let file_id = self.file_id;
        let state = self.streams.entry(packet.stream_id).or_insert_with(|| {
            // Tentative client/server (spec.md §4.B step 4): a SYN's sender
            // is the client, a SYN-ACK's sender is the server (so its
            // destination is the client). Only a packet carrying neither
            // flag falls back to "first packet's source is the client".
            let (client_ip, client_port, server_ip, server_port) = if packet.is_synack() {
                (packet.dst_ip, packet.dst_port, packet.src_ip, packet.src_port)
            } else {
                (packet.src_ip, packet.src_port, packet.dst_ip, packet.dst_port)
            };
            let five_tuple = FiveTuple {
                client_ip,
                client_port,
                server_ip,
                server_port,
            };
            let id = ConnectionId {
                file_id,
                stream_id: packet.stream_id,
            };
            StreamState {
                builder: ConnectionBuilder::new(id, five_tuple, packet.timestamp_ns),
                client_ip,
                client_port,
            }
        });

        let side = state.side_of(&packet);
        let builder = &mut state.builder;

        builder.observe_packet_ts(packet.timestamp_ns);

        if packet.is_syn() {
            builder.mark_has_syn();
            if let Some(options) = &packet.tcp_options {
                builder.set_syn_options(options.clone());
            }
            match side {
                Side::Client => builder.set_client_isn(packet.tcp_seq),
                Side::Server => builder.set_server_isn(packet.tcp_seq),
            }
        } else if packet.is_synack() {
            builder.mark_has_syn();
            if let Some(options) = &packet.tcp_options {
                if builder.ipid_observation_count() == 0 {
                    builder.set_syn_options(options.clone());
                }
            }
            match side {
                Side::Client => builder.set_client_isn(packet.tcp_seq),
                Side::Server => builder.set_server_isn(packet.tcp_seq),
            }
        }

        if packet.tcp_tsval.is_some() || packet.tcp_tsecr.is_some() {
            builder.set_timestamps(packet.tcp_tsval, packet.tcp_tsecr);
        }

        if let Some(ip_id) = packet.ip_id {
            match side {
                Side::Client => builder.add_client_ipid(ip_id),
                Side::Server => builder.add_server_ipid(ip_id),
            }
        }

        match side {
            Side::Client => builder.add_client_ttl(packet.ip_ttl),
            Side::Server => builder.add_server_ttl(packet.ip_ttl),
        }

        if packet.payload_len > 0 {
            if let Some(hex_str) = &packet.payload_hex {
                if let Ok(bytes) = hex::decode(hex_str) {
                    let truncated = &bytes[..bytes.len().min(self.payload_hash_bytes)];
                    let digest = format!("{:x}", md5::compute(truncated));
                    match side {
                        Side::Client => builder.set_client_payload_md5(digest),
                        Side::Server => builder.set_server_payload_md5(digest),
                    }
                }
            }
            let tag = match side {
                Side::Client => 'C',
                Side::Server => 'S',
            };
            builder.push_length_token(format!("{tag}:{}", packet.payload_len));
        }

        if let Some(hello) = packet.tls_client_hello {
            if side == Side::Client {
                builder.set_tls_client_hello(hello);
            }
        }

        if let Some(peer) = packet.f5_peer {
            builder.set_f5_peer(peer);
        }
    }

    /// Consumes the extractor, yielding one `Connection` per stream that has
    /// at least one IP-ID observation. Streams with zero IP-ID observations
    /// carry no matchable fingerprint and are dropped (spec.md §4.B edge
    /// case), logged at `warn` via [`ExtractionError::NoIpIds`].
    pub fn finish(self) -> Vec<Connection> {
        let mut out = Vec::with_capacity(self.streams.len());
        for (stream_id, state) in self.streams {
            if state.builder.ipid_observation_count() == 0 {
                warn!("{}", ExtractionError::NoIpIds(stream_id));
                continue;
            }
            out.push(state.builder.build());
        }
        out.sort_by_key(|c| c.id.stream_id);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_row(
        frame: u64,
        ts: f64,
        src: &str,
        dst: &str,
        ip_id: &str,
        ttl: u8,
        stream: u32,
        sport: u16,
        dport: u16,
        seq: u32,
        ack: u32,
        flags: &str,
        len: u32,
        payload: &str,
    ) -> String {
        format!(
            "{frame},{ts},{src},{dst},{ip_id},{ttl},{stream},{sport},{dport},{seq},{ack},{flags},,,,{len},{payload},,,,"
        )
    }

    #[test]
    fn parses_minimal_row() {
        let row = sample_row(
            1, 1690000000.0, "10.0.0.1", "10.0.0.2", "0x0001", 64, 5, 40000, 443, 100, 0, "0x002",
            0, "",
        );
        let packet = parse_row(&row).expect("row should parse");
        assert_eq!(packet.frame_number, 1);
        assert_eq!(packet.stream_id, 5);
        assert!(packet.is_syn());
        assert_eq!(packet.ip_id, Some(1));
    }

    #[test]
    fn extractor_builds_one_connection_per_stream() {
        let mut extractor = ConnectionExtractor::new(0, 256);
        let syn = sample_row(
            1, 1.0, "10.0.0.1", "10.0.0.2", "0x0001", 64, 7, 40000, 443, 1000, 0, "0x002", 0, "",
        );
        let synack = sample_row(
            2, 1.001, "10.0.0.2", "10.0.0.1", "0x0050", 64, 7, 443, 40000, 5000, 1001, "0x012", 0,
            "",
        );
        let data = sample_row(
            3, 1.002, "10.0.0.1", "10.0.0.2", "0x0002", 64, 7, 40000, 443, 1001, 5001, "0x018",
            4, "deadbeef",
        );
        extractor.observe(parse_row(&syn).unwrap());
        extractor.observe(parse_row(&synack).unwrap());
        extractor.observe(parse_row(&data).unwrap());

        let conns = extractor.finish();
        assert_eq!(conns.len(), 1);
        let conn = &conns[0];
        assert_eq!(conn.client_isn, Some(1000));
        assert_eq!(conn.server_isn, Some(5000));
        assert_eq!(conn.ipid_set.len(), 3);
        assert!(!conn.client_payload_md5.is_empty());
        assert_eq!(conn.length_signature, vec!["C:4".to_string()]);
    }

    #[test]
    fn stream_with_no_ipids_is_dropped() {
        let mut extractor = ConnectionExtractor::new(0, 256);
        let row = sample_row(
            1, 1.0, "10.0.0.1", "10.0.0.2", "", 64, 9, 40000, 443, 1000, 0, "0x002", 0, "",
        );
        extractor.observe(parse_row(&row).unwrap());
        assert!(extractor.finish().is_empty());
    }
}
