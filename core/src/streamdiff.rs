//! Streamdiff (spec.md §2 component E, §4.E): per-packet comparison of one
//! matched connection pair.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use crate::dissector::{self, Dissector};
use crate::error::Result;
use crate::extractor::parse_row;
use crate::model::connection::FiveTuple;
use crate::model::diff::{Diff, DiffKind, DiffPacketAttrs, Direction, StreamDiffReport};
use crate::model::packet::Packet;

/// Builds the bidirectional display filter restricted to one 5-tuple
/// (spec.md §4.E step 1).
fn five_tuple_filter(ft: &FiveTuple) -> String {
    format!(
        "tcp && ((ip.addr=={} && tcp.port=={}) && (ip.addr=={} && tcp.port=={}))",
        ft.client_ip, ft.client_port, ft.server_ip, ft.server_port
    )
}

fn direction_of(packet: &Packet, ft: &FiveTuple) -> Direction {
    if packet.src_ip == ft.client_ip && packet.src_port == ft.client_port {
        Direction::ClientToServer
    } else {
        Direction::ServerToClient
    }
}

fn attrs_of(packet: &Packet) -> DiffPacketAttrs {
    DiffPacketAttrs {
        frame_number: packet.frame_number,
        timestamp_ns: packet.timestamp_ns,
        tcp_flags: packet.tcp_flags,
        tcp_seq: packet.tcp_seq,
        tcp_ack: packet.tcp_ack,
    }
}

fn attrs_differ(a: &DiffPacketAttrs, b: &DiffPacketAttrs) -> Vec<DiffKind> {
    let mut kinds = Vec::new();
    if a.tcp_flags != b.tcp_flags {
        kinds.push(DiffKind::Flags);
    }
    if a.tcp_seq != b.tcp_seq {
        kinds.push(DiffKind::Seq);
    }
    if a.tcp_ack != b.tcp_ack {
        kinds.push(DiffKind::Ack);
    }
    kinds
}

/// Re-invokes the dissector on `input` with a display filter restricted to
/// `ft`, returning the direction-and-ip-id-keyed packet lists Streamdiff
/// needs (spec.md §4.E steps 1-3). Duplicate IP-IDs within one direction
/// (retransmits) are kept in arrival order.
fn extract_side(
    dissector: &Dissector,
    input: &Path,
    ft: &FiveTuple,
    timeout: Option<Duration>,
) -> Result<HashMap<(Direction, u16), Vec<DiffPacketAttrs>>> {
    let mut args = dissector::field_args();
    args.insert(0, five_tuple_filter(ft));
    args.insert(0, "-Y".to_string());

    let rows = dissector.run_fields(&args, input, timeout)?;
    let mut out: HashMap<(Direction, u16), Vec<DiffPacketAttrs>> = HashMap::new();
    for row in rows {
        let row = row?;
        let Some(packet) = parse_row(&row) else {
            continue;
        };
        let Some(ip_id) = packet.ip_id else { continue };
        let direction = direction_of(&packet, ft);
        out.entry((direction, ip_id)).or_default().push(attrs_of(&packet));
    }
    Ok(out)
}

/// Compares the two sides of a matched connection pair and produces a
/// [`StreamDiffReport`] (spec.md §4.E).
pub struct Differ<'a> {
    dissector: &'a Dissector,
    timeout: Option<Duration>,
}

impl<'a> Differ<'a> {
    pub fn new(dissector: &'a Dissector, timeout: Option<Duration>) -> Self {
        Differ { dissector, timeout }
    }

    pub fn diff(&self, file_a: &Path, file_b: &Path, five_tuple: &FiveTuple) -> Result<StreamDiffReport> {
        let side_a = extract_side(self.dissector, file_a, five_tuple, self.timeout)?;
        let side_b = extract_side(self.dissector, file_b, five_tuple, self.timeout)?;
        Ok(compare(side_a, side_b))
    }
}

fn compare(
    mut side_a: HashMap<(Direction, u16), Vec<DiffPacketAttrs>>,
    mut side_b: HashMap<(Direction, u16), Vec<DiffPacketAttrs>>,
) -> StreamDiffReport {
    let mut report = StreamDiffReport::default();
    let mut keys: Vec<(Direction, u16)> = side_a.keys().chain(side_b.keys()).copied().collect();
    keys.sort_by_key(|&(dir, ip_id)| (dir == Direction::ServerToClient, ip_id));
    keys.dedup();

    for key in keys {
        let (direction, ip_id) = key;
        let a_list = side_a.remove(&key).unwrap_or_default();
        let b_list = side_b.remove(&key).unwrap_or_default();
        let max_len = a_list.len().max(b_list.len());
        for i in 0..max_len {
            let a = a_list.get(i).cloned();
            let b = b_list.get(i).cloned();
            match (a, b) {
                (Some(a), Some(b)) => {
                    let kinds = attrs_differ(&a, &b);
                    if !kinds.is_empty() {
                        report.push(Diff {
                            direction,
                            ip_id,
                            side_a: Some(a),
                            side_b: Some(b),
                            kinds,
                        });
                    }
                }
                (Some(a), None) => report.push(Diff {
                    direction,
                    ip_id,
                    side_a: Some(a),
                    side_b: None,
                    kinds: vec![DiffKind::MissingSideB],
                }),
                (None, Some(b)) => report.push(Diff {
                    direction,
                    ip_id,
                    side_a: None,
                    side_b: Some(b),
                    kinds: vec![DiffKind::MissingSideA],
                }),
                (None, None) => unreachable!("i < max_len implies at least one side has an entry"),
            }
        }
    }
    report
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attrs(frame: u64, flags: u8, seq: u32, ack: u32) -> DiffPacketAttrs {
        DiffPacketAttrs {
            frame_number: frame,
            timestamp_ns: frame as i64,
            tcp_flags: flags,
            tcp_seq: seq,
            tcp_ack: ack,
        }
    }

    #[test]
    fn identical_sides_produce_no_diffs() {
        let mut a = HashMap::new();
        a.insert((Direction::ClientToServer, 5), vec![attrs(1, 0x18, 100, 200)]);
        let mut b = HashMap::new();
        b.insert((Direction::ClientToServer, 5), vec![attrs(1, 0x18, 100, 200)]);
        let report = compare(a, b);
        assert!(report.diffs.is_empty());
    }

    #[test]
    fn differing_seq_is_reported() {
        let mut a = HashMap::new();
        a.insert((Direction::ClientToServer, 5), vec![attrs(1, 0x18, 100, 200)]);
        let mut b = HashMap::new();
        b.insert((Direction::ClientToServer, 5), vec![attrs(1, 0x18, 999, 200)]);
        let report = compare(a, b);
        assert_eq!(report.diffs.len(), 1);
        assert_eq!(report.diffs[0].kinds, vec![DiffKind::Seq]);
        assert_eq!(report.client_to_server.seq_only, 1);
    }

    #[test]
    fn key_only_on_one_side_is_missing() {
        let mut a = HashMap::new();
        a.insert((Direction::ServerToClient, 7), vec![attrs(1, 0x10, 1, 1)]);
        let b = HashMap::new();
        let report = compare(a, b);
        assert_eq!(report.diffs.len(), 1);
        assert_eq!(report.diffs[0].kinds, vec![DiffKind::MissingSideB]);
        assert_eq!(report.server_to_client.missing_side_b, 1);
    }

    #[test]
    fn direction_is_part_of_the_key() {
        let mut a = HashMap::new();
        a.insert((Direction::ClientToServer, 5), vec![attrs(1, 0x18, 100, 200)]);
        a.insert((Direction::ServerToClient, 5), vec![attrs(2, 0x18, 300, 400)]);
        let b = a.clone();
        let report = compare(a, b);
        assert!(report.diffs.is_empty());
    }
}
